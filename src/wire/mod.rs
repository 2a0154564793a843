//! The wire protocol: fixed header, per-message payloads, and the shared
//! size/pacing/timeout constants that govern the dispatcher, discovery, and
//! file-transfer modules.

pub mod header;
pub mod limits;
pub mod message;

pub use header::{Header, HeaderFlags, HEADER_LEN, MAGIC, VERSION};
pub use message::{decode_payload, encode_payload, MsgType};
