//! Per-message payload types. Every payload is `postcard`-encoded after the
//! fixed header (the header's own layout is pinned to the wire contract in
//! `header.rs`; the payload encoding is an internal concern, same split the
//! teacher's `net/message.rs` makes between its framing and its `serde`-
//! derived command bodies).

use serde::{Deserialize, Serialize};

use crate::codec::Type;
use crate::error::ErrorCode;
use crate::link::QUERY_LEN;
use crate::wire::limits::STRING_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Announce,
    Discover,
    LookupHash,
    ResolvedHash,
    GetKeyMeta,
    KeyMeta,
    GetKeys,
    KeyData,
    SetKeys,
    Link,
    LinkData,
    LinkGet,
    LinkMeta,
    LinkAdd,
    LinkDelete,
    FileOpen,
    FileConfirm,
    FileGet,
    FileData,
    FileClose,
    FileAck,
    FileDelete,
    FileCheck,
    FileCheckResponse,
    FileList,
    FileListData,
    Error,
    /// A code this node doesn't recognize — kept instead of decode failure
    /// so the dispatcher can reply `Error{UnknownMsg}` rather than drop.
    Unknown(u8),
}

impl MsgType {
    pub fn code(self) -> u8 {
        match self {
            MsgType::Announce => 0,
            MsgType::Discover => 1,
            MsgType::LookupHash => 2,
            MsgType::ResolvedHash => 3,
            MsgType::GetKeyMeta => 4,
            MsgType::KeyMeta => 5,
            MsgType::GetKeys => 6,
            MsgType::KeyData => 7,
            MsgType::SetKeys => 8,
            MsgType::Link => 9,
            MsgType::LinkData => 10,
            MsgType::LinkGet => 11,
            MsgType::LinkMeta => 12,
            MsgType::LinkAdd => 13,
            MsgType::LinkDelete => 14,
            MsgType::FileOpen => 15,
            MsgType::FileConfirm => 16,
            MsgType::FileGet => 17,
            MsgType::FileData => 18,
            MsgType::FileClose => 19,
            MsgType::FileAck => 20,
            MsgType::FileDelete => 21,
            MsgType::FileCheck => 22,
            MsgType::FileCheckResponse => 23,
            MsgType::FileList => 24,
            MsgType::FileListData => 25,
            MsgType::Error => 26,
            MsgType::Unknown(c) => c,
        }
    }

    pub fn from_code(c: u8) -> MsgType {
        match c {
            0 => MsgType::Announce,
            1 => MsgType::Discover,
            2 => MsgType::LookupHash,
            3 => MsgType::ResolvedHash,
            4 => MsgType::GetKeyMeta,
            5 => MsgType::KeyMeta,
            6 => MsgType::GetKeys,
            7 => MsgType::KeyData,
            8 => MsgType::SetKeys,
            9 => MsgType::Link,
            10 => MsgType::LinkData,
            11 => MsgType::LinkGet,
            12 => MsgType::LinkMeta,
            13 => MsgType::LinkAdd,
            14 => MsgType::LinkDelete,
            15 => MsgType::FileOpen,
            16 => MsgType::FileConfirm,
            17 => MsgType::FileGet,
            18 => MsgType::FileData,
            19 => MsgType::FileClose,
            20 => MsgType::FileAck,
            21 => MsgType::FileDelete,
            22 => MsgType::FileCheck,
            23 => MsgType::FileCheckResponse,
            24 => MsgType::FileList,
            25 => MsgType::FileListData,
            26 => MsgType::Error,
            other => MsgType::Unknown(other),
        }
    }
}

/// `{hash, type, array_len}` triple carried alongside a value on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireKeyMeta {
    pub hash: u32,
    pub ty: Type,
    pub array_len: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnouncePayload {
    pub query: [u32; QUERY_LEN],
    pub data_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverPayload {
    pub query: [u32; QUERY_LEN],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupHashPayload {
    pub hashes: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedHashPayload {
    pub names: Vec<[u8; STRING_LEN]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetKeyMetaPayload {
    pub start_index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyMetaPayload {
    pub page: u16,
    pub page_count: u16,
    pub item_count: u16,
    pub items: Vec<WireKeyMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetKeysPayload {
    pub hashes: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyDataPayload {
    pub items: Vec<(WireKeyMeta, Vec<u8>)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetKeysPayload {
    pub items: Vec<(WireKeyMeta, Vec<u8>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LinkMsgFlags(pub u8);

impl LinkMsgFlags {
    pub const SOURCE: LinkMsgFlags = LinkMsgFlags(1 << 0);
    pub const DEST: LinkMsgFlags = LinkMsgFlags(1 << 1);

    pub fn contains(self, other: LinkMsgFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkPayload {
    pub flags: LinkMsgFlags,
    pub source_hash: u32,
    pub dest_hash: u32,
    pub query: [u32; QUERY_LEN],
    pub data_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkDataPayload {
    pub source_hash: u32,
    pub dest_hash: u32,
    pub sequence: u32,
    pub meta: WireKeyMeta,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkGetPayload {
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkMetaPayload {
    pub tag: u32,
    pub flags: u8,
    pub source_hash: u32,
    pub dest_hash: u32,
    pub query: [u32; QUERY_LEN],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkAddPayload {
    pub is_source: bool,
    pub source_hash: u32,
    pub dest_hash: u32,
    pub query: [u32; QUERY_LEN],
    pub tag: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkDeletePayload {
    pub tag: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileMode {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileOpenPayload {
    pub filename: String,
    pub mode: FileMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfirmPayload {
    pub session_id: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileGetPayload {
    pub session_id: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDataPayload {
    pub session_id: u32,
    pub offset: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileClosePayload {
    pub session_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAckPayload {
    pub session_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDeletePayload {
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCheckPayload {
    pub filename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCheckResponsePayload {
    pub hash: u64,
    pub file_len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListPayload {
    pub start_index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileListEntry {
    pub size: u32,
    pub flags: u8,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileListDataPayload {
    pub next_index: u32,
    pub items: Vec<FileListEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
}

/// Encode a payload with `postcard`, for use after a `Header` has already
/// been written into the same buffer.
pub fn encode_payload<T: Serialize>(payload: &T, out: &mut Vec<u8>) -> Result<(), postcard::Error> {
    let bytes = postcard::to_stdvec(payload)?;
    out.extend_from_slice(&bytes);
    Ok(())
}

pub fn decode_payload<'a, T: Deserialize<'a>>(buf: &'a [u8]) -> Result<T, postcard::Error> {
    postcard::from_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_type_code_round_trips() {
        for code in 0u8..=26 {
            assert_eq!(MsgType::from_code(code).code(), code);
        }
        assert_eq!(MsgType::from_code(200), MsgType::Unknown(200));
    }

    #[test]
    fn payload_round_trips_through_postcard() {
        let payload = DiscoverPayload { query: [1, 2, 0, 0, 0, 0, 0, 0] };
        let mut buf = Vec::new();
        encode_payload(&payload, &mut buf).unwrap();
        let decoded: DiscoverPayload = decode_payload(&buf).unwrap();
        assert_eq!(decoded, payload);
    }
}
