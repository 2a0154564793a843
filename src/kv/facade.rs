//! The unified KV facade: presents the static and dynamic tiers as one
//! indexable, hash-addressable store, and is the only KV entry point the
//! protocol dispatcher talks to. Also owns the wiring between "a value
//! changed" and "publish it to the link subsystem," via an injected
//! callback — mirroring `kv_i8_publish`'s delegation through a function
//! pointer in the original rather than the KV layer knowing about links.

use std::sync::{Arc, Mutex};

use crate::codec::Type;
use crate::error::KvError;
use crate::kv::dynamic::{DynamicDb, MetaView, NameFile};
use crate::kv::persist::{PersistStore, Restored};
use crate::kv::static_table::StaticTable;

/// `array_len` here is always the *actual* element count (never the
/// off-by-one "count" field the static/dynamic tiers store internally) —
/// the one place that normalization happens, so every caller above the
/// facade (the protocol dispatcher, in particular) can treat it uniformly.
pub struct KeyMeta {
    pub hash: u32,
    pub ty: Type,
    pub array_len: u16,
    pub flags: u8,
    pub name: Option<String>,
}

pub type PublishHook = Arc<dyn Fn(u32) + Send + Sync>;

pub struct KvStore {
    pub statics: StaticTable,
    pub dynamic: DynamicDb,
    persist: Mutex<Option<PersistStore>>,
    publish: Mutex<Option<PublishHook>>,
    persist_wake: Arc<tokio::sync::Notify>,
}

impl KvStore {
    pub fn new(statics: StaticTable) -> Self {
        Self::new_with_names(statics, NameFile::in_memory())
    }

    /// Build with a pre-opened name file, e.g. a disk-backed
    /// `NameFile::open_truncated` at startup.
    pub fn new_with_names(statics: StaticTable, names: NameFile) -> Self {
        KvStore {
            statics,
            dynamic: DynamicDb::with_names(names),
            persist: Mutex::new(None),
            publish: Mutex::new(None),
            persist_wake: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// Attach a persistence store, restoring any matching static RAM
    /// slots from disk. Must be called before the persist worker task is
    /// spawned.
    pub fn attach_persistence(&self, store: PersistStore, restored: Vec<Restored>) {
        for r in restored {
            if let Some(index) = self.statics.search_hash(r.hash) {
                let param = self.statics.lookup_by_index(index).unwrap();
                if param.ty == r.ty {
                    let take = self.statics.size_of(index).min(r.payload.len());
                    self.statics.restore(index, &r.payload[..take]);
                }
            }
        }
        *self.persist.lock().unwrap() = Some(store);
    }

    pub fn set_publish_hook(&self, hook: PublishHook) {
        *self.publish.lock().unwrap() = Some(hook);
    }

    pub fn persist_wake_signal(&self) -> Arc<tokio::sync::Notify> {
        self.persist_wake.clone()
    }

    /// Run the persist worker's full-registry sweep now. Called from the
    /// persist worker task after waiting on `persist_wake_signal`.
    pub fn sweep_persist(&self) {
        if let Some(store) = &*self.persist.lock().unwrap() {
            let entries = self.statics.persistable();
            let _ = store.sweep_with(&entries);
        }
    }

    pub fn count(&self) -> usize {
        self.statics.count() + self.dynamic.count()
    }

    fn static_count(&self) -> usize {
        self.statics.count()
    }

    pub fn lookup_index(&self, index: usize) -> Option<KeyMeta> {
        let static_count = self.static_count();
        if index < static_count {
            let p = self.statics.lookup_by_index(index)?;
            Some(KeyMeta { hash: p.hash, ty: p.ty, array_len: p.array_len + 1, flags: 0, name: Some(p.name.to_string()) })
        } else {
            let dyn_index = index - static_count;
            let hash = self.dynamic.hash_of(dyn_index)?;
            let meta = self.dynamic.get_meta(hash);
            Some(KeyMeta { hash: meta.hash, ty: meta.ty, array_len: meta.array_len, flags: 0, name: None })
        }
    }

    pub fn lookup_hash(&self, hash: u32) -> Option<KeyMeta> {
        if let Some(index) = self.statics.search_hash(hash) {
            let p = self.statics.lookup_by_index(index)?;
            return Some(KeyMeta { hash: p.hash, ty: p.ty, array_len: p.array_len + 1, flags: 0, name: Some(p.name.to_string()) });
        }
        let meta: MetaView = self.dynamic.get_meta(hash);
        if meta.hash == 0 {
            return None;
        }
        Some(KeyMeta { hash: meta.hash, ty: meta.ty, array_len: meta.array_len, flags: 0, name: None })
    }

    pub fn get(&self, hash: u32, ty: Type, out: &mut [u8]) -> Result<(), KvError> {
        if let Some(index) = self.statics.search_hash(hash) {
            return self.statics.get(index, out);
        }
        self.dynamic.get(hash, ty, out)
    }

    pub fn set(&self, hash: u32, ty: Type, data: &[u8]) -> Result<(), KvError> {
        if let Some(index) = self.statics.search_hash(hash) {
            let needs_wake = self.statics.set(index, data)?;
            if needs_wake {
                self.persist_wake.notify_one();
            }
            if let Some(hook) = &*self.publish.lock().unwrap() {
                hook(hash);
            }
            return Ok(());
        }
        self.dynamic.set(hash, ty, data)?;
        if let Some(hook) = &*self.publish.lock().unwrap() {
            hook(hash);
        }
        Ok(())
    }

    /// High-level array write, used by the facade's own callers (not the
    /// wire `SetKeys` path, which bypasses coercion entirely). On change,
    /// triggers `publish(hash)`.
    pub fn array_set(&self, hash: u32, ty: Type, index: usize, data: &[u8]) -> Result<(), KvError> {
        if let Some(static_index) = self.statics.search_hash(hash) {
            let needs_wake = self.statics.array_set(static_index, ty, index, data)?;
            if needs_wake {
                self.persist_wake.notify_one();
            }
            if let Some(hook) = &*self.publish.lock().unwrap() {
                hook(hash);
            }
            return Ok(());
        }
        self.dynamic.array_set(hash, ty, index, data)?;
        if let Some(hook) = &*self.publish.lock().unwrap() {
            hook(hash);
        }
        Ok(())
    }

    pub fn array_get(&self, hash: u32, ty: Type, index: usize, out: &mut [u8]) -> Result<(), KvError> {
        if let Some(static_index) = self.statics.search_hash(hash) {
            return self.statics.array_get(static_index, ty, index, out);
        }
        self.dynamic.array_get(hash, ty, index, out)
    }

    /// Insert a dynamic entry and append `{hash, name}` to the name file.
    /// Static hashes have no insertion path — they're declared at startup,
    /// not created at runtime — so this always targets the dynamic tier.
    pub fn add(&self, hash: u32, ty: Type, array_len: u16, data: &[u8], name: &str) -> Result<usize, KvError> {
        self.dynamic.add(hash, ty, array_len, data, name)
    }

    pub fn lookup_name(&self, hash: u32) -> Option<String> {
        self.dynamic.lookup_name(hash)
    }

    pub fn publish(&self, hash: u32) {
        if let Some(hook) = &*self.publish.lock().unwrap() {
            hook(hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::static_table::{Flags, StaticParam, hash_name};

    fn store() -> KvStore {
        let statics = StaticTable::new(vec![StaticParam {
            name: "fixed_a",
            hash: hash_name("fixed_a"),
            ty: Type::U16,
            array_len: 0,
            flags: Flags::NONE,
            handler: None,
        }]);
        KvStore::new(statics)
    }

    #[test]
    fn count_is_static_plus_dynamic() {
        let kv = store();
        assert_eq!(kv.count(), 1);
        kv.add(0x99, Type::U8, 1, &[0], "dyn_a").unwrap();
        assert_eq!(kv.count(), 2);
    }

    #[test]
    fn lookup_index_routes_static_then_dynamic() {
        let kv = store();
        kv.add(0x99, Type::U8, 1, &[0], "dyn_a").unwrap();
        assert_eq!(kv.lookup_index(0).unwrap().hash, hash_name("fixed_a"));
        assert_eq!(kv.lookup_index(1).unwrap().hash, 0x99);
    }

    #[test]
    fn add_records_name_lookup() {
        let kv = store();
        kv.add(0x99, Type::U8, 1, &[0], "dyn_a").unwrap();
        assert_eq!(kv.lookup_name(0x99).as_deref(), Some("dyn_a"));
    }

    #[test]
    fn array_set_triggers_publish_hook() {
        let kv = store();
        kv.add(0x55, Type::U8, 4, &[0, 0, 0, 0], "dyn_b").unwrap();

        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        kv.set_publish_hook(Arc::new(move |_hash| fired2.store(true, std::sync::atomic::Ordering::SeqCst)));

        kv.array_set(0x55, Type::None, 0, &[7]).unwrap();
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn array_set_and_get_route_to_static_tier() {
        let kv = store();
        let hash = hash_name("fixed_a");
        kv.array_set(hash, Type::U16, 0, &11u16.to_le_bytes()).unwrap();
        let mut out = [0u8; 2];
        kv.array_get(hash, Type::U16, 0, &mut out).unwrap();
        assert_eq!(u16::from_le_bytes(out), 11);
    }

    #[test]
    fn static_set_triggers_publish_hook() {
        let kv = store();
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        kv.set_publish_hook(Arc::new(move |_hash| fired2.store(true, std::sync::atomic::Ordering::SeqCst)));

        kv.set(hash_name("fixed_a"), Type::None, &9u16.to_le_bytes()).unwrap();
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }
}
