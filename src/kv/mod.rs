//! The two-tier key-value store: a static compile-time registry fronting a
//! dynamic runtime database, a shared persistence format, and a unified
//! facade the protocol layer talks to.

pub mod dynamic;
pub mod facade;
pub mod persist;
pub mod static_table;

pub use dynamic::{DynamicDb, DynamicEntry, NameFile, Notifier};
pub use facade::{KeyMeta, KvStore, PublishHook};
pub use persist::{PersistStore, Restored, MAX_PERSIST_DATA_LEN};
pub use static_table::{hash_name, Flags, Handler, Op, StaticParam, StaticTable};
