//! The fixed wire header every Catbus datagram carries. Little-endian,
//! packed, hand-encoded rather than derived through `postcard` because the
//! layout is an external wire contract, not an internal serialization
//! format (same reasoning as the teacher's `net/message.rs` header framing).

use crate::wire::message::MsgType;

pub const MAGIC: u32 = u32::from_le_bytes(*b"MEOW");
pub const VERSION: u8 = 2;
pub const HEADER_LEN: usize = 4 + 1 + 1 + 1 + 1 + 4 + 2 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderFlags(pub u8);

impl HeaderFlags {
    pub const NONE: HeaderFlags = HeaderFlags(0);
    /// Set on a `Discover` request to mean "match every node, ignore the
    /// query field" rather than requiring an empty query.
    pub const QUERY_ALL: HeaderFlags = HeaderFlags(1 << 0);

    pub fn contains(self, other: HeaderFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub flags: HeaderFlags,
    pub msg_type: MsgType,
    pub transaction_id: u32,
    pub universe: u16,
    pub origin_id: u64,
}

impl Header {
    pub fn new(msg_type: MsgType, origin_id: u64) -> Self {
        Header { flags: HeaderFlags::NONE, msg_type, transaction_id: 0, universe: 0, origin_id }
    }

    pub fn with_transaction(mut self, transaction_id: u32) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    pub fn with_flags(mut self, flags: HeaderFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.push(VERSION);
        out.push(self.flags.0);
        out.push(0); // reserved
        out.push(self.msg_type.code());
        out.extend_from_slice(&self.transaction_id.to_le_bytes());
        out.extend_from_slice(&self.universe.to_le_bytes());
        out.extend_from_slice(&self.origin_id.to_le_bytes());
    }

    /// Decode a header prefix. Returns `None` on a bad magic/version (the
    /// dispatcher drops these silently, per spec) or on a short buffer.
    pub fn decode(buf: &[u8]) -> Option<(Header, &[u8])> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let version = buf[4];
        if magic != MAGIC || version != VERSION {
            return None;
        }
        let flags = HeaderFlags(buf[5]);
        let msg_type = MsgType::from_code(buf[8]);
        let transaction_id = u32::from_le_bytes(buf[9..13].try_into().unwrap());
        let universe = u16::from_le_bytes(buf[13..15].try_into().unwrap());
        let origin_id = u64::from_le_bytes(buf[15..23].try_into().unwrap());
        Some((Header { flags, msg_type, transaction_id, universe, origin_id }, &buf[HEADER_LEN..]))
    }
}
