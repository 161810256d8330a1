//! Sequence numbers shared by the `Seq` wire header and a connection's
//! `edge_msg_seq` counter.
//!
//! Both are plain, strictly monotonic `u32` counters on the wire; this
//! module gives them a small typed wrapper so call sites can't
//! accidentally mix a sequence number with an unrelated `u32`.

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

/// A message sequence number, carried on the wire as a little-endian
/// 32-bit integer in the `Seq` header.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Default)]
pub struct SeqNo(u32);

impl SeqNo {
    /// The initial value of a connection's `edge_msg_seq` counter. The
    /// handshake message (`Connect`/`Bind`/`DialSuccess`) carries a
    /// literal `Seq=0` of its own and never draws from this counter;
    /// the first value `take()` returns from here is used by the first
    /// real `Data` message that follows (spec.md §5).
    pub const ZERO: SeqNo = SeqNo(0);

    /// Returns the following sequence number.
    ///
    /// Wraps on overflow; in practice a single connection never lives
    /// long enough to exhaust `u32`.
    #[inline]
    pub fn next(self) -> SeqNo {
        SeqNo(self.0.wrapping_add(1))
    }

    /// Returns the sequence number that follows this one, advancing
    /// `self` in place and returning the *old* value — the usual
    /// "take a ticket, then advance the counter" idiom used for
    /// `edge_msg_seq`.
    #[inline]
    pub fn take(&mut self) -> SeqNo {
        let cur = *self;
        *self = cur.next();
        cur
    }
}

impl From<u32> for SeqNo {
    #[inline]
    fn from(n: u32) -> SeqNo {
        SeqNo(n)
    }
}

impl From<SeqNo> for u32 {
    #[inline]
    fn from(n: SeqNo) -> u32 {
        n.0
    }
}
