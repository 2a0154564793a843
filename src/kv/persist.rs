//! The persistence store: a fixed-record file (`kv_data`) mirroring
//! `keyvalue.c`'s `_kv_i8_init_persist` / `_kv_i8_persist_set_internal` /
//! `_kv_i8_persist_get` byte-for-byte. Raw `std::fs` is used deliberately
//! instead of an embedded database — the record layout below is a wire
//! contract, not an implementation detail a storage engine could hide.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::codec::Type;
use crate::error::PersistError;

const MAGIC: u32 = u32::from_le_bytes(*b"FSKV");
const VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 11;

/// Every persisted payload is padded/truncated to this many bytes,
/// regardless of the parameter's actual size, so a rewrite of the same
/// logical value always produces a byte-identical record.
pub const MAX_PERSIST_DATA_LEN: usize = 64;

const RECORD_HEADER_LEN: usize = 4 + 1 + 1 + 4; // hash, type, array_len, reserved
const RECORD_LEN: usize = RECORD_HEADER_LEN + MAX_PERSIST_DATA_LEN;

struct RecordHeader {
    hash: u32,
    ty: u8,
    array_len: u8,
}

impl RecordHeader {
    fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut buf = [0u8; RECORD_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.hash.to_le_bytes());
        buf[4] = self.ty;
        buf[5] = self.array_len;
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        RecordHeader {
            hash: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            ty: buf[4],
            array_len: buf[5],
        }
    }
}

/// A restored value, handed back during `init()` for the caller (the
/// facade) to copy into matching static RAM slots.
pub struct Restored {
    pub hash: u32,
    pub ty: Type,
    pub array_len: u8,
    pub payload: Vec<u8>,
}

pub struct PersistStore {
    path: PathBuf,
    /// Latched once any persistence operation fails unrecoverably; after
    /// that, writes silently succeed as no-ops so the rest of the system
    /// keeps working without the persisted path.
    failed: AtomicBool,
    /// Serializes access to the file; every operation opens, seeks, and
    /// closes around itself rather than holding a handle open, except the
    /// persist worker's full sweep, which reuses one handle for the whole
    /// pass (see `sweep_with`).
    lock: Mutex<()>,
}

impl PersistStore {
    /// Open (or create) the store at `path`, validating the header. A
    /// magic/version mismatch triggers exactly one delete-and-recreate
    /// retry, matching `_kv_i8_init_persist`'s `file_retry` flag. Returns
    /// every record found so the caller can restore matching RAM slots.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<Restored>), PersistError> {
        let path = path.as_ref().to_path_buf();
        let store = PersistStore { path: path.clone(), failed: AtomicBool::new(false), lock: Mutex::new(()) };

        let records = match Self::init_file(&path) {
            Ok(records) => records,
            Err(PersistError::HeaderMismatch) => {
                std::fs::remove_file(&path).ok();
                Self::init_file(&path)?
            }
            Err(e) => return Err(e),
        };

        Ok((store, records))
    }

    fn init_file(path: &Path) -> Result<Vec<Restored>, PersistError> {
        let existed = path.exists() && std::fs::metadata(path)?.len() > 0;

        let mut f = OpenOptions::new().read(true).write(true).create(true).open(path)?;

        if !existed {
            let mut header = [0u8; HEADER_LEN];
            header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
            header[4] = VERSION;
            f.write_all(&header)?;
            return Ok(Vec::new());
        }

        let mut header = [0u8; HEADER_LEN];
        f.read_exact(&mut header)?;
        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let version = header[4];
        if magic != MAGIC || version != VERSION {
            return Err(PersistError::HeaderMismatch);
        }

        let mut out = Vec::new();
        let mut record = vec![0u8; RECORD_LEN];
        loop {
            match f.read_exact(&mut record) {
                Ok(()) => {
                    let rh = RecordHeader::decode(&record);
                    out.push(Restored {
                        hash: rh.hash,
                        ty: Type::from_u8(rh.ty),
                        array_len: rh.array_len,
                        payload: record[RECORD_HEADER_LEN..].to_vec(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    fn latch_failure(&self) {
        self.failed.store(true, Ordering::Relaxed);
    }

    /// Write (or update in place) a single parameter's value. A no-op,
    /// successful "write" if the latched failure flag is set, or if the
    /// stored payload already matches byte-for-byte.
    pub fn persist_set(&self, hash: u32, ty: Type, array_len: u8, data: &[u8]) -> Result<(), PersistError> {
        if self.is_failed() {
            return Ok(());
        }
        let _guard = self.lock.lock().unwrap();

        let result = (|| -> Result<(), PersistError> {
            let mut f = OpenOptions::new().read(true).write(true).open(&self.path)?;
            Self::write_record(&mut f, hash, ty, array_len, data)
        })();

        if result.is_err() {
            self.latch_failure();
            return Ok(());
        }
        result
    }

    fn write_record(f: &mut File, hash: u32, ty: Type, array_len: u8, data: &[u8]) -> Result<(), PersistError> {
        f.seek(SeekFrom::Start(HEADER_LEN as u64))?;

        let mut padded = [0u8; MAX_PERSIST_DATA_LEN];
        let n = data.len().min(MAX_PERSIST_DATA_LEN);
        padded[..n].copy_from_slice(&data[..n]);

        let mut record = vec![0u8; RECORD_LEN];
        loop {
            let pos = f.stream_position()?;
            let mut buf = vec![0u8; RECORD_LEN];
            match f.read_exact(&mut buf) {
                Ok(()) => {
                    let rh = RecordHeader::decode(&buf);
                    if rh.hash == hash {
                        if buf[RECORD_HEADER_LEN..] == padded[..] {
                            return Ok(()); // idempotent: identical value already stored
                        }
                        f.seek(SeekFrom::Start(pos))?;
                        record[..RECORD_HEADER_LEN]
                            .copy_from_slice(&RecordHeader { hash, ty: encode_type(ty), array_len }.encode());
                        record[RECORD_HEADER_LEN..].copy_from_slice(&padded);
                        f.write_all(&record)?;
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }

        // not found: append
        record[..RECORD_HEADER_LEN].copy_from_slice(&RecordHeader { hash, ty: encode_type(ty), array_len }.encode());
        record[RECORD_HEADER_LEN..].copy_from_slice(&padded);
        f.seek(SeekFrom::End(0))?;
        f.write_all(&record)?;
        Ok(())
    }

    /// Read exactly `len` bytes of a parameter's stored payload. A miss or
    /// short read both report `None`; the caller zero-fills on failure,
    /// matching the "corrupted/missing persistence yields zero values"
    /// behavior.
    pub fn persist_get(&self, hash: u32, len: usize) -> Option<Vec<u8>> {
        if self.is_failed() {
            return None;
        }
        let _guard = self.lock.lock().unwrap();
        let mut f = OpenOptions::new().read(true).open(&self.path).ok()?;
        f.seek(SeekFrom::Start(HEADER_LEN as u64)).ok()?;

        let mut buf = vec![0u8; RECORD_LEN];
        loop {
            match f.read_exact(&mut buf) {
                Ok(()) => {
                    let rh = RecordHeader::decode(&buf);
                    if rh.hash == hash {
                        let take = len.min(MAX_PERSIST_DATA_LEN);
                        return Some(buf[RECORD_HEADER_LEN..RECORD_HEADER_LEN + take].to_vec());
                    }
                }
                Err(_) => return None,
            }
        }
    }

    /// Flush every `(hash, type, array_len, data)` tuple to disk using a
    /// single open file handle for the whole sweep — the persist worker's
    /// full-registry pass, distinct from `persist_set`'s per-call open.
    pub fn sweep_with(&self, entries: &[(u32, Type, u16, Vec<u8>)]) -> Result<(), PersistError> {
        if self.is_failed() {
            return Ok(());
        }
        let _guard = self.lock.lock().unwrap();
        let mut f = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(f) => f,
            Err(_) => {
                self.latch_failure();
                return Ok(());
            }
        };
        for (hash, ty, array_len, data) in entries {
            if Self::write_record(&mut f, *hash, *ty, (*array_len).min(255) as u8, data).is_err() {
                self.latch_failure();
                return Ok(());
            }
        }
        Ok(())
    }
}

fn encode_type(ty: Type) -> u8 {
    // Round-trips through the same numbering `Type::from_u8` understands.
    ty as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("catbus_persist_test_{name}_{}", std::process::id()));
        p
    }

    #[test]
    fn fresh_file_gets_header_and_no_records() {
        let path = tmp_path("fresh");
        let _ = std::fs::remove_file(&path);
        let (_store, records) = PersistStore::open(&path).unwrap();
        assert!(records.is_empty());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn round_trip_and_idempotent_rewrite() {
        let path = tmp_path("roundtrip");
        let _ = std::fs::remove_file(&path);
        let (store, _) = PersistStore::open(&path).unwrap();

        store.persist_set(0x1234, Type::U32, 0, &99u32.to_le_bytes()).unwrap();
        let bytes_after_first = std::fs::read(&path).unwrap();

        // writing the identical value again must not change the file
        store.persist_set(0x1234, Type::U32, 0, &99u32.to_le_bytes()).unwrap();
        let bytes_after_second = std::fs::read(&path).unwrap();
        assert_eq!(bytes_after_first, bytes_after_second);

        let got = store.persist_get(0x1234, 4).unwrap();
        assert_eq!(u32::from_le_bytes(got.try_into().unwrap()), 99);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn overwrite_in_place_changes_value_but_not_record_count() {
        let path = tmp_path("overwrite");
        let _ = std::fs::remove_file(&path);
        let (store, _) = PersistStore::open(&path).unwrap();

        store.persist_set(1, Type::U8, 0, &[1]).unwrap();
        store.persist_set(2, Type::U8, 0, &[2]).unwrap();
        store.persist_set(1, Type::U8, 0, &[9]).unwrap();

        let len_before = std::fs::metadata(&path).unwrap().len();
        store.persist_set(1, Type::U8, 0, &[9]).unwrap();
        let len_after = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len_before, len_after, "rewriting the same value must not append a new record");

        assert_eq!(store.persist_get(1, 1).unwrap(), vec![9]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn corrupted_magic_recreates_empty_store() {
        let path = tmp_path("corrupt");
        let _ = std::fs::remove_file(&path);
        std::fs::write(&path, b"not a catbus kv file at all, much longer than the header").unwrap();

        let (store, records) = PersistStore::open(&path).unwrap();
        assert!(records.is_empty());
        assert!(store.persist_get(1, 4).is_none());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_key_returns_none_so_caller_zero_fills() {
        let path = tmp_path("missing");
        let _ = std::fs::remove_file(&path);
        let (store, _) = PersistStore::open(&path).unwrap();
        assert!(store.persist_get(0xffff, 4).is_none());
        std::fs::remove_file(&path).ok();
    }
}
