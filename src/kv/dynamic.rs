//! The dynamic KV database: a runtime-growable, insertion-ordered store
//! keyed by hash. Ported from `kvdb.c`'s singly-linked list of
//! `db_entry_t` — insertion order here is kept explicit (an `IndexMap`)
//! because `index_of`/`hash_of` are specified in terms of it, not an
//! incidental `HashMap` iteration order.

use std::sync::Mutex;

use indexmap::IndexMap;

use crate::codec::{self, Type};
use crate::error::KvError;

pub type Notifier = std::sync::Arc<dyn Fn(u32, Type, &[u8]) + Send + Sync>;

pub struct DynamicEntry {
    pub hash: u32,
    pub ty: Type,
    /// Stored as `array_len - 1`, matching the original's space-saving
    /// convention; `array_len()` below undoes it.
    count: u16,
    pub tag: u32,
    pub notifier: Option<Notifier>,
    pub data: Vec<u8>,
}

impl DynamicEntry {
    pub fn array_len(&self) -> u16 {
        self.count + 1
    }
}

/// The dynamic database plus an optional global "anything changed"
/// notifier, matching `kvdb_v_notify_set`, and the name-lookup side file
/// `add` writes through to.
pub struct DynamicDb {
    entries: Mutex<IndexMap<u32, DynamicEntry>>,
    global_notify: Mutex<Option<Notifier>>,
    names: NameFile,
}

impl Default for DynamicDb {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicDb {
    pub fn new() -> Self {
        DynamicDb::with_names(NameFile::in_memory())
    }

    /// Build with a pre-opened name file, e.g. a disk-backed
    /// `NameFile::open_truncated` at startup.
    pub fn with_names(names: NameFile) -> Self {
        DynamicDb { entries: Mutex::new(IndexMap::new()), global_notify: Mutex::new(None), names }
    }

    pub fn set_global_notifier(&self, f: Notifier) {
        *self.global_notify.lock().unwrap() = Some(f);
    }

    pub fn count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// `add`: on a hash that already exists, behave like `set` (update in
    /// place) and report the existing index. Otherwise allocate a new
    /// entry with `array_len` clamped to `1..=256` and append `{hash, name}`
    /// to the name file.
    pub fn add(&self, hash: u32, ty: Type, array_len: u16, data: &[u8], name: &str) -> Result<usize, KvError> {
        if hash == 0 {
            return Err(KvError::InvalidType);
        }

        if self.entries.lock().unwrap().contains_key(&hash) {
            self.set(hash, Type::None, data)?;
            return self.index_of(hash).ok_or(KvError::NotFound);
        }

        let array_len = array_len.clamp(1, 256);
        let data_len = ty.size() * array_len as usize;
        let mut buf = vec![0u8; data_len];
        let n = buf.len().min(data.len());
        buf[..n].copy_from_slice(&data[..n]);

        let mut entries = self.entries.lock().unwrap();
        let index = entries.len();
        entries.insert(
            hash,
            DynamicEntry { hash, ty, count: array_len - 1, tag: 0, notifier: None, data: buf },
        );
        drop(entries);
        self.names.append(hash, name);
        Ok(index)
    }

    pub fn set_tag(&self, hash: u32, tag: u32) {
        if let Some(e) = self.entries.lock().unwrap().get_mut(&hash) {
            e.tag = tag;
        }
    }

    pub fn set_notifier(&self, hash: u32, notifier: Notifier) {
        if let Some(e) = self.entries.lock().unwrap().get_mut(&hash) {
            e.notifier = Some(notifier);
        }
    }

    /// Whole-array set: converts every element, firing both notifiers
    /// exactly once (not per-element) if anything changed.
    pub fn set(&self, hash: u32, ty: Type, data: &[u8]) -> Result<(), KvError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&hash).ok_or(KvError::NotFound)?;
        let ty = ty.or_native(entry.ty);
        let elem_size = entry.ty.size();
        let needed = elem_size * entry.array_len() as usize;
        if data.len() < needed.min(ty.size() * entry.array_len() as usize) {
            return Err(KvError::NotEnoughSpace);
        }

        let mut changed = false;
        let mut src_off = 0usize;
        for i in 0..entry.array_len() as usize {
            let dst_off = i * elem_size;
            let src_elem = &data[src_off..src_off + ty.size().min(data.len() - src_off)];
            if codec::convert(entry.ty, &mut entry.data[dst_off..dst_off + elem_size], ty, src_elem, entry.ty) {
                changed = true;
            }
            src_off += ty.size();
        }

        if changed {
            let snapshot = (entry.hash, entry.ty, entry.data.clone());
            let notifier = entry.notifier.clone();
            drop(entries);

            if let Some(f) = &*self.global_notify.lock().unwrap() {
                f(snapshot.0, snapshot.1, &snapshot.2);
            }
            if let Some(f) = notifier {
                f(snapshot.0, snapshot.1, &snapshot.2);
            }
        }
        Ok(())
    }

    pub fn get(&self, hash: u32, ty: Type, out: &mut [u8]) -> Result<(), KvError> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(&hash).ok_or(KvError::NotFound)?;
        let ty = ty.or_native(entry.ty);
        let elem_size = entry.ty.size();

        let mut dst_off = 0usize;
        for i in 0..entry.array_len() as usize {
            let src_off = i * elem_size;
            if dst_off + ty.size() > out.len() {
                break;
            }
            codec::convert(ty, &mut out[dst_off..dst_off + ty.size()], entry.ty, &entry.data[src_off..src_off + elem_size], entry.ty);
            dst_off += ty.size();
        }
        Ok(())
    }

    /// Single-element set at `index`, wrapping modulo `array_len`. Fires
    /// notifiers on change, same as a whole-array `set`.
    pub fn array_set(&self, hash: u32, ty: Type, index: usize, data: &[u8]) -> Result<(), KvError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&hash).ok_or(KvError::NotFound)?;
        let ty = ty.or_native(entry.ty);
        let elem_size = entry.ty.size();
        let wrapped = index % entry.array_len() as usize;
        let byte_off = wrapped * elem_size;

        let changed = codec::convert(entry.ty, &mut entry.data[byte_off..byte_off + elem_size], ty, data, entry.ty);

        if changed {
            let snapshot = (entry.hash, entry.ty, entry.data.clone());
            let notifier = entry.notifier.clone();
            drop(entries);
            if let Some(f) = &*self.global_notify.lock().unwrap() {
                f(snapshot.0, snapshot.1, &snapshot.2);
            }
            if let Some(f) = notifier {
                f(snapshot.0, snapshot.1, &snapshot.2);
            }
        }
        Ok(())
    }

    pub fn array_get(&self, hash: u32, ty: Type, index: usize, out: &mut [u8]) -> Result<(), KvError> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(&hash).ok_or(KvError::NotFound)?;
        let ty = ty.or_native(entry.ty);
        let elem_size = entry.ty.size();
        let wrapped = index % entry.array_len() as usize;
        let byte_off = wrapped * elem_size;
        codec::convert(ty, out, entry.ty, &entry.data[byte_off..byte_off + elem_size], entry.ty);
        Ok(())
    }

    pub fn delete(&self, hash: u32) -> bool {
        self.entries.lock().unwrap().shift_remove(&hash).is_some()
    }

    /// Remove every entry carrying `tag` in a single pass.
    pub fn delete_by_tag(&self, tag: u32) {
        self.entries.lock().unwrap().retain(|_, e| e.tag != tag);
    }
}

pub struct MetaView {
    pub hash: u32,
    pub ty: Type,
    pub array_len: u16,
    pub tag: u32,
}

impl DynamicDb {
    pub fn get_meta(&self, hash: u32) -> MetaView {
        let entries = self.entries.lock().unwrap();
        match entries.get(&hash) {
            Some(e) => MetaView { hash: e.hash, ty: e.ty, array_len: e.array_len(), tag: e.tag },
            None => MetaView { hash: 0, ty: Type::Invalid, array_len: 0, tag: 0 },
        }
    }

    /// Insertion-order position of `hash`, or `None` if absent. Defines
    /// the same order `hash_of` inverts.
    pub fn index_of(&self, hash: u32) -> Option<usize> {
        self.entries.lock().unwrap().get_index_of(&hash)
    }

    pub fn hash_of(&self, index: usize) -> Option<u32> {
        self.entries.lock().unwrap().get_index(index).map(|(h, _)| *h)
    }

    pub fn lookup_name(&self, hash: u32) -> Option<String> {
        self.names.lookup(hash)
    }
}

/// The append-only `{hash, name}` side file backing name lookup. A lookup
/// convenience only — loss or corruption degrades to "name unknown," never
/// a hard error, so this does not return `Result` on read.
pub struct NameFile {
    entries: Mutex<Vec<(u32, String)>>,
    path: Option<std::path::PathBuf>,
}

impl NameFile {
    /// Truncates any existing file at `path` (matching the original's
    /// startup truncation of `kv_names`) and starts empty.
    pub fn open_truncated(path: impl Into<std::path::PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        std::fs::write(&path, [])?;
        Ok(NameFile { entries: Mutex::new(Vec::new()), path: Some(path) })
    }

    pub fn in_memory() -> Self {
        NameFile { entries: Mutex::new(Vec::new()), path: None }
    }

    pub fn append(&self, hash: u32, name: &str) {
        self.entries.lock().unwrap().push((hash, name.to_string()));
        if let Some(path) = &self.path {
            use std::io::Write;
            if let Ok(mut f) = std::fs::OpenOptions::new().append(true).create(true).open(path) {
                let mut name_buf = [0u8; crate::codec::STRING_LEN];
                let bytes = name.as_bytes();
                let n = bytes.len().min(name_buf.len());
                name_buf[..n].copy_from_slice(&bytes[..n]);
                let _ = f.write_all(&hash.to_le_bytes());
                let _ = f.write_all(&name_buf);
            }
        }
    }

    pub fn lookup(&self, hash: u32) -> Option<String> {
        self.entries.lock().unwrap().iter().find(|(h, _)| *h == hash).map(|(_, n)| n.clone())
    }
}
