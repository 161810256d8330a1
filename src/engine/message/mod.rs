//! Wire message framing: typed headers and content types carried between
//! a connection and its edge router, bit-exact per spec.md §6.
//!
//! The actual bytes-on-the-wire framing (length-prefixing, TLS multiplex)
//! belongs to the `Channel` transport and is out of scope here (spec.md
//! §1); this module only defines the logical `Message` shape a `Channel`
//! implementation sends and dispatches.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::engine::error::{Error, ErrorKind, Result};

bitflags::bitflags! {
    /// Bits carried in the `Flags` header.
    pub struct Flags: u32 {
        /// Half-close: the sender will emit no more `Data` on this
        /// connection.
        const EDGE_FIN = 0b0000_0001;
    }
}

/// Content types relevant to the connect pipeline and data plane.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ContentType {
    Connect,
    Bind,
    Data,
    DialSuccess,
    StateConnected,
    StateClosed,
    /// Inbound-only: an edge router notifying a `Bound` connection of a
    /// new dialer (spec.md §4.7's "once per inbound dial against a bound
    /// connection"). Not in spec.md's content-type list, which covers
    /// client-originated messages only; added so the bind/accept path is
    /// actually reachable (see `DESIGN.md`).
    Dial,
}

/// A single typed wire header.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Header {
    ConnId(u32),
    Seq(u32),
    Flags(u32),
    PublicKey(Vec<u8>),
    ReplyFor(u32),
}

impl Header {
    fn header_id(&self) -> u8 {
        match self {
            Header::ConnId(_) => 0,
            Header::Seq(_) => 1,
            Header::Flags(_) => 2,
            Header::PublicKey(_) => 3,
            Header::ReplyFor(_) => 4,
        }
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Header::ConnId(v) | Header::Seq(v) | Header::Flags(v) | Header::ReplyFor(v) => {
                out.write_u32::<LittleEndian>(*v).expect("write to Vec cannot fail");
            }
            Header::PublicKey(bytes) => out.extend_from_slice(bytes),
        }
    }

    fn decode(id: u8, payload: &[u8]) -> Result<Header> {
        let u32_payload = || -> Result<u32> {
            (&payload[..])
                .read_u32::<LittleEndian>()
                .map_err(|_| Error::simple(ErrorKind::Communication))
        };
        Ok(match id {
            0 => Header::ConnId(u32_payload()?),
            1 => Header::Seq(u32_payload()?),
            2 => Header::Flags(u32_payload()?),
            3 => Header::PublicKey(payload.to_vec()),
            4 => Header::ReplyFor(u32_payload()?),
            _ => return Err(Error::simple(ErrorKind::Communication)),
        })
    }
}

/// A message traded between a connection and its edge router.
#[derive(Debug, Clone)]
pub struct Message {
    pub content_type: ContentType,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(content_type: ContentType, headers: Vec<Header>, body: Vec<u8>) -> Self {
        Message { content_type, headers, body }
    }

    pub fn conn_id(&self) -> Option<u32> {
        self.headers.iter().find_map(|h| match h {
            Header::ConnId(v) => Some(*v),
            _ => None,
        })
    }

    pub fn seq(&self) -> Option<u32> {
        self.headers.iter().find_map(|h| match h {
            Header::Seq(v) => Some(*v),
            _ => None,
        })
    }

    pub fn flags(&self) -> Flags {
        self.headers
            .iter()
            .find_map(|h| match h {
                Header::Flags(v) => Some(Flags::from_bits_truncate(*v)),
                _ => None,
            })
            .unwrap_or(Flags::empty())
    }

    pub fn public_key(&self) -> Option<&[u8]> {
        self.headers.iter().find_map(|h| match h {
            Header::PublicKey(v) => Some(v.as_slice()),
            _ => None,
        })
    }

    pub fn reply_for(&self) -> Option<u32> {
        self.headers.iter().find_map(|h| match h {
            Header::ReplyFor(v) => Some(*v),
            _ => None,
        })
    }

    /// Serializes the header section only (id, length, payload per
    /// header), the wire shape described in spec.md §6. Transport
    /// framing around this (and around `body`) is the `Channel`'s
    /// concern.
    pub fn serialize_headers(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for h in &self.headers {
            let mut payload = Vec::new();
            h.encode_payload(&mut payload);
            out.push(h.header_id());
            out.write_u32::<LittleEndian>(payload.len() as u32)
                .expect("write to Vec cannot fail");
            out.extend_from_slice(&payload);
        }
        out
    }

    /// Parses a header section produced by `serialize_headers`.
    pub fn deserialize_headers(mut buf: &[u8]) -> Result<Vec<Header>> {
        let mut headers = Vec::new();
        while !buf.is_empty() {
            if buf.len() < 5 {
                return Err(Error::simple(ErrorKind::Communication));
            }
            let id = buf[0];
            let len = (&buf[1..5])
                .read_u32::<LittleEndian>()
                .map_err(|_| Error::simple(ErrorKind::Communication))? as usize;
            buf = &buf[5..];
            if buf.len() < len {
                return Err(Error::simple(ErrorKind::Communication));
            }
            headers.push(Header::decode(id, &buf[..len])?);
            buf = &buf[len..];
        }
        Ok(headers)
    }
}
