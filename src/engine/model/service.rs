//! A `Service`: `{id, name, permissions[], encryption_required,
//! perm_flags}` (spec.md §3), cached by the engine keyed by name.

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Folded once from `Service::permissions` when the service is first
    /// cached (`original_source/library/connect.c`'s
    /// `connect_get_service_cb`), not re-derived on every dial — see
    /// `SPEC_FULL.md` §3.
    #[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
    pub struct PermFlags: u8 {
        const CAN_DIAL = 0b01;
        const CAN_BIND = 0b10;
    }
}

impl PermFlags {
    pub fn from_permissions<'a, I: IntoIterator<Item = &'a str>>(permissions: I) -> PermFlags {
        let mut flags = PermFlags::empty();
        for perm in permissions {
            match perm {
                "Dial" => flags |= PermFlags::CAN_DIAL,
                "Bind" => flags |= PermFlags::CAN_BIND,
                _ => {}
            }
        }
        flags
    }
}

#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub permissions: Vec<String>,
    pub encryption_required: bool,
    #[cfg_attr(feature = "serialize_serde", serde(skip))]
    pub perm_flags: PermFlags,
}

impl Default for PermFlags {
    fn default() -> Self {
        PermFlags::empty()
    }
}

impl Service {
    /// Builds a `Service`, folding `permissions` into `perm_flags` once
    /// up front, the way the cache-insertion path does.
    pub fn new(id: String, name: String, permissions: Vec<String>, encryption_required: bool) -> Self {
        let perm_flags = PermFlags::from_permissions(permissions.iter().map(String::as_str));
        Service { id, name, permissions, encryption_required, perm_flags }
    }

    pub fn can_dial(&self) -> bool {
        self.perm_flags.contains(PermFlags::CAN_DIAL)
    }

    pub fn can_bind(&self) -> bool {
        self.perm_flags.contains(PermFlags::CAN_BIND)
    }
}
