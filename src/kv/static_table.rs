//! The static KV registry: a compile-time table of parameters, a sorted
//! hash index for binary search, and the get/set routing (RAM slot /
//! persistence / handler) that the original firmware implements in
//! `keyvalue.c`.

use std::sync::Mutex;

use crate::codec::{self, Type};
use crate::error::KvError;

/// Per-parameter flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const READ_ONLY: Flags = Flags(1 << 0);
    pub const PERSIST: Flags = Flags(1 << 1);

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
    pub const fn union(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }
}

/// Which operation triggered a handler callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    Set,
}

pub type Handler = fn(hash: u32, op: Op, data: &mut [u8]) -> Result<(), KvError>;

/// A compile-time declared parameter. `ram_slot` is a fixed-size inline
/// buffer (the moral equivalent of a `void *ram_ptr` in the original — a
/// hosted Rust port has no use for raw pointers into statics, so each
/// static entry owns its backing bytes directly and `ram_slot` being
/// `Some` just means "this parameter is backed by live memory, not purely
/// by the handler/persistence path").
pub struct StaticParam {
    pub name: &'static str,
    pub hash: u32,
    pub ty: Type,
    pub array_len: u16,
    pub flags: Flags,
    pub handler: Option<Handler>,
}

/// Name-hash function. FNV-1a: simple, stable, and matches the "hash the
/// name at compile time, store only the hash" design used throughout the
/// original (the exact hash algorithm is explicitly out of scope per the
/// distilled spec's Non-goals — "CRC/hash impls" — so any stable function
/// satisfies the contract; FNV-1a is the standard low-dependency choice).
pub fn hash_name(name: &str) -> u32 {
    let mut h: u32 = 0x811c9dc5;
    for b in name.as_bytes() {
        h ^= *b as u32;
        h = h.wrapping_mul(0x01000193);
    }
    h
}

/// Byte size of a parameter's storage: `type.size() * (array_len + 1)`.
/// An unrecognized type yields 0 (the invalid-size sentinel).
pub fn size_of_meta(ty: Type, array_len: u16) -> usize {
    if ty == Type::Invalid {
        return 0;
    }
    ty.size() * (array_len as usize + 1)
}

/// One sorted `{hash, index}` entry for binary search.
#[derive(Clone, Copy)]
struct HashIndexEntry {
    hash: u32,
    index: usize,
}

/// The static registry: the table itself, RAM-backed storage for entries
/// that have it, and the sorted index + single-entry lookup cache.
pub struct StaticTable {
    params: Vec<StaticParam>,
    ram: Vec<Mutex<Vec<u8>>>,
    index: Vec<HashIndexEntry>,
    cache: Mutex<Option<(u32, usize)>>,
}

impl StaticTable {
    /// Build the table from a declared parameter list. Parameters with no
    /// handler and no special initial value get a zeroed RAM slot
    /// allocated automatically; everything is RAM-backed in this port for
    /// simplicity (a deployer could trim handler-only entries later, but
    /// nothing in the spec requires a RAM-less static parameter by
    /// default).
    pub fn new(params: Vec<StaticParam>) -> Self {
        let mut index: Vec<HashIndexEntry> = params
            .iter()
            .enumerate()
            .map(|(i, p)| HashIndexEntry { hash: p.hash, index: i })
            .collect();
        index.sort_by_key(|e| e.hash);

        let ram = params
            .iter()
            .map(|p| Mutex::new(vec![0u8; size_of_meta(p.ty, p.array_len).max(1)]))
            .collect();

        StaticTable { params, ram, index, cache: Mutex::new(None) }
    }

    pub fn count(&self) -> usize {
        self.params.len()
    }

    pub fn lookup_by_index(&self, index: usize) -> Option<&StaticParam> {
        self.params.get(index)
    }

    /// Binary search the sorted hash index, consulting and then refreshing
    /// the single-entry lookup cache exactly like `kv_i16_search_hash`.
    pub fn search_hash(&self, hash: u32) -> Option<usize> {
        if let Some((last_hash, last_index)) = *self.cache.lock().unwrap() {
            if last_hash == hash {
                return Some(last_index);
            }
        }

        let found = self
            .index
            .binary_search_by_key(&hash, |e| e.hash)
            .ok()
            .map(|pos| self.index[pos].index);

        if let Some(index) = found {
            *self.cache.lock().unwrap() = Some((hash, index));
        }

        found
    }

    pub fn lookup_by_hash(&self, hash: u32) -> Option<&StaticParam> {
        self.search_hash(hash).and_then(|i| self.params.get(i))
    }

    pub fn get_name(&self, hash: u32) -> Option<&'static str> {
        self.lookup_by_hash(hash).map(|p| p.name)
    }

    /// Read the current value into `data`, consulting the RAM slot and
    /// then invoking the handler with `Op::Get` if present.
    pub fn get(&self, index: usize, data: &mut [u8]) -> Result<(), KvError> {
        let param = self.params.get(index).ok_or(KvError::NotFound)?;
        if param.ty == Type::Invalid {
            return Err(KvError::InvalidType);
        }

        {
            let ram = self.ram[index].lock().unwrap();
            let n = ram.len().min(data.len());
            data[..n].copy_from_slice(&ram[..n]);
        }

        if let Some(handler) = param.handler {
            handler(param.hash, Op::Get, data)?;
        }
        Ok(())
    }

    /// Write `data` into the parameter, honoring `READ_ONLY`, and
    /// returning whether persistence needs to be triggered (the caller —
    /// the facade — owns the persistence store and the persist worker
    /// wake signal, so this just reports "yes, this was a RAM-backed
    /// PERSIST write, go wake the worker").
    pub fn set(&self, index: usize, data: &[u8]) -> Result<bool, KvError> {
        let param = self.params.get(index).ok_or(KvError::NotFound)?;
        if param.flags.contains(Flags::READ_ONLY) {
            return Err(KvError::ReadOnly);
        }
        if param.ty == Type::Invalid {
            return Err(KvError::InvalidType);
        }

        let needs_persist_wake;
        {
            let mut ram = self.ram[index].lock().unwrap();
            let n = ram.len().min(data.len());
            ram[..n].copy_from_slice(&data[..n]);
            needs_persist_wake = param.flags.contains(Flags::PERSIST);
        }

        if let Some(handler) = param.handler {
            let mut buf = data.to_vec();
            handler(param.hash, Op::Set, &mut buf)?;
        }

        Ok(needs_persist_wake)
    }

    /// Single-element write within the parameter's RAM slot, wrapping
    /// modulo the declared array length. Honors `READ_ONLY` and runs the
    /// handler over the whole slot afterward, same as `set`.
    pub fn array_set(&self, index: usize, ty: Type, elem_index: usize, data: &[u8]) -> Result<bool, KvError> {
        let param = self.params.get(index).ok_or(KvError::NotFound)?;
        if param.flags.contains(Flags::READ_ONLY) {
            return Err(KvError::ReadOnly);
        }
        if param.ty == Type::Invalid {
            return Err(KvError::InvalidType);
        }

        let elem_size = param.ty.size();
        let array_len = param.array_len as usize + 1;
        let byte_off = (elem_index % array_len) * elem_size;

        let needs_persist_wake;
        {
            let mut ram = self.ram[index].lock().unwrap();
            codec::convert(param.ty, &mut ram[byte_off..byte_off + elem_size], ty, data, param.ty);
            needs_persist_wake = param.flags.contains(Flags::PERSIST);
        }

        if let Some(handler) = param.handler {
            let mut buf = self.ram[index].lock().unwrap().clone();
            handler(param.hash, Op::Set, &mut buf)?;
        }

        Ok(needs_persist_wake)
    }

    pub fn array_get(&self, index: usize, ty: Type, elem_index: usize, out: &mut [u8]) -> Result<(), KvError> {
        let param = self.params.get(index).ok_or(KvError::NotFound)?;
        if param.ty == Type::Invalid {
            return Err(KvError::InvalidType);
        }

        let elem_size = param.ty.size();
        let array_len = param.array_len as usize + 1;
        let byte_off = (elem_index % array_len) * elem_size;

        let ram = self.ram[index].lock().unwrap();
        codec::convert(ty, out, param.ty, &ram[byte_off..byte_off + elem_size], param.ty);
        Ok(())
    }

    pub fn size_of(&self, index: usize) -> usize {
        self.params.get(index).map(|p| size_of_meta(p.ty, p.array_len)).unwrap_or(0)
    }

    /// Snapshot of every persist-flagged, RAM-backed entry's current bytes
    /// — used by the persist worker's full-registry sweep.
    pub fn persistable(&self) -> Vec<(u32, Type, u16, Vec<u8>)> {
        self.params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.flags.contains(Flags::PERSIST))
            .map(|(i, p)| (p.hash, p.ty, p.array_len, self.ram[i].lock().unwrap().clone()))
            .collect()
    }

    /// Copy restored bytes into a RAM slot at init time (persistence
    /// recovery path) without going through `set`'s read-only/persist
    /// bookkeeping — a restore is not a write from the protocol's
    /// perspective.
    pub fn restore(&self, index: usize, data: &[u8]) {
        if let Some(mut ram) = self.ram.get(index).map(|m| m.lock().unwrap()) {
            let n = ram.len().min(data.len());
            ram[..n].copy_from_slice(&data[..n]);
        }
    }

    pub fn convert_into(&self, index: usize, dst_type: Type, dst: &mut [u8]) -> bool {
        let param = match self.params.get(index) {
            Some(p) => p,
            None => return false,
        };
        let ram = self.ram[index].lock().unwrap();
        codec::convert(dst_type, dst, param.ty, &ram, param.ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StaticTable {
        StaticTable::new(vec![
            StaticParam {
                name: "led_brightness",
                hash: hash_name("led_brightness"),
                ty: Type::U8,
                array_len: 0,
                flags: Flags::NONE,
                handler: None,
            },
            StaticParam {
                name: "device_name",
                hash: hash_name("device_name"),
                ty: Type::String,
                array_len: 0,
                flags: Flags::READ_ONLY,
                handler: None,
            },
            StaticParam {
                name: "uptime",
                hash: hash_name("uptime"),
                ty: Type::U32,
                array_len: 0,
                flags: Flags::PERSIST,
                handler: None,
            },
        ])
    }

    #[test]
    fn lookup_hash_of_name_roundtrips() {
        let t = sample();
        let h = hash_name("led_brightness");
        let idx = t.search_hash(h).unwrap();
        assert_eq!(t.lookup_by_index(idx).unwrap().name, "led_brightness");
    }

    #[test]
    fn lookup_cache_serves_repeat_queries() {
        let t = sample();
        let h = hash_name("uptime");
        assert!(t.search_hash(h).is_some());
        // second call must hit the single-entry cache path, not just the
        // binary search again — functionally indistinguishable from the
        // outside, but exercised here to ensure it doesn't panic or drift.
        assert!(t.search_hash(h).is_some());
    }

    #[test]
    fn read_only_rejects_writes() {
        let t = sample();
        let idx = t.search_hash(hash_name("device_name")).unwrap();
        let err = t.set(idx, b"nope").unwrap_err();
        assert_eq!(err, KvError::ReadOnly);
    }

    #[test]
    fn persist_flag_reports_wake_needed() {
        let t = sample();
        let idx = t.search_hash(hash_name("uptime")).unwrap();
        let needs_wake = t.set(idx, &42u32.to_le_bytes()).unwrap();
        assert!(needs_wake);

        let mut out = [0u8; 4];
        t.get(idx, &mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 42);
    }

    #[test]
    fn unknown_hash_is_not_found() {
        let t = sample();
        assert!(t.search_hash(0xdead_beef).is_none());
    }
}
