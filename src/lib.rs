pub mod codec;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod filetransfer;
pub mod kv;
pub mod link;
pub mod protocol;
pub mod wire;

pub use codec::Type;
pub use config::{Args, CatbusConfig};
pub use engine::Engine;
pub use error::{ErrorCode, KvError, LinkError, PersistError, ProtocolError};
pub use kv::{KeyMeta, KvStore, StaticTable};
pub use link::{LinkRuntime, LinkStore};
