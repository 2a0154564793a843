//! The link store: a persistent append/tombstone file of link
//! declarations (`kvlinks`). Grounded on the same "small fixed-record
//! file, validated header, loaded/saved as a unit" shape used by the
//! teacher's ban list, adapted to Catbus's exact record layout and
//! tombstone-reuse semantics from the distilled spec's §4.6.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::LinkError;

const MAGIC: u32 = u32::from_le_bytes(*b"LINK");
const VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 11;

pub const QUERY_LEN: usize = 8;
const RECORD_LEN: usize = 4 + 1 + 4 + 4 + (QUERY_LEN * 4) + 4; // tag,flags,src,dst,query,reserved

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkFlags(pub u8);

impl LinkFlags {
    pub const VALID: LinkFlags = LinkFlags(1 << 0);
    pub const SOURCE: LinkFlags = LinkFlags(1 << 1);
    pub const DEST: LinkFlags = LinkFlags(1 << 2);

    pub fn contains(self, other: LinkFlags) -> bool {
        self.0 & other.0 == other.0
    }
    pub fn union(self, other: LinkFlags) -> LinkFlags {
        LinkFlags(self.0 | other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkRecord {
    pub tag: u32,
    pub flags: LinkFlags,
    pub source_hash: u32,
    pub dest_hash: u32,
    pub query: [u32; QUERY_LEN],
}

impl LinkRecord {
    fn is_valid(&self) -> bool {
        self.flags.contains(LinkFlags::VALID)
    }

    /// Set equality over the non-zero query entries, and identical role
    /// flags/hashes/tag — the "logically equal" check `create` uses to
    /// avoid duplicate records.
    fn logically_equal(&self, other: &LinkRecord) -> bool {
        self.tag == other.tag
            && self.flags == other.flags
            && self.source_hash == other.source_hash
            && self.dest_hash == other.dest_hash
            && query_set_eq(&self.query, &other.query)
    }

    fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        let mut off = 0;
        buf[off..off + 4].copy_from_slice(&self.tag.to_le_bytes());
        off += 4;
        buf[off] = self.flags.0;
        off += 1;
        buf[off..off + 4].copy_from_slice(&self.source_hash.to_le_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&self.dest_hash.to_le_bytes());
        off += 4;
        for q in self.query {
            buf[off..off + 4].copy_from_slice(&q.to_le_bytes());
            off += 4;
        }
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        let mut off = 0;
        let tag = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let flags = LinkFlags(buf[off]);
        off += 1;
        let source_hash = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let dest_hash = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let mut query = [0u32; QUERY_LEN];
        for q in &mut query {
            *q = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
            off += 4;
        }
        LinkRecord { tag, flags, source_hash, dest_hash, query }
    }
}

fn query_set_eq(a: &[u32; QUERY_LEN], b: &[u32; QUERY_LEN]) -> bool {
    let mut av: Vec<u32> = a.iter().copied().filter(|&t| t != 0).collect();
    let mut bv: Vec<u32> = b.iter().copied().filter(|&t| t != 0).collect();
    av.sort_unstable();
    bv.sort_unstable();
    av == bv
}

/// True if every non-zero entry in `query` is present in `tags`.
pub fn query_matches(query: &[u32; QUERY_LEN], tags: &[u32]) -> bool {
    query.iter().filter(|&&t| t != 0).all(|t| tags.contains(t))
}

pub struct LinkStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LinkStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists() && std::fs::metadata(&path)?.len() > 0;
        let mut f = OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        if !existed {
            let mut header = [0u8; HEADER_LEN];
            header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
            header[4] = VERSION;
            f.write_all(&header)?;
        } else {
            let mut header = [0u8; HEADER_LEN];
            f.read_exact(&mut header)?;
            let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
            if magic != MAGIC || header[4] != VERSION {
                drop(f);
                std::fs::remove_file(&path)?;
                let mut f = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
                let mut header = [0u8; HEADER_LEN];
                header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
                header[4] = VERSION;
                f.write_all(&header)?;
            }
        }

        Ok(LinkStore { path, lock: Mutex::new(()) })
    }

    fn all_records(&self) -> std::io::Result<Vec<LinkRecord>> {
        let mut f = OpenOptions::new().read(true).open(&self.path)?;
        f.seek(SeekFrom::Start(HEADER_LEN as u64))?;
        let mut out = Vec::new();
        let mut buf = vec![0u8; RECORD_LEN];
        loop {
            match f.read_exact(&mut buf) {
                Ok(()) => out.push(LinkRecord::decode(&buf)),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Create a link record, unless a logically-equal valid one already
    /// exists (in which case this is a no-op success). Reuses the first
    /// tombstoned slot, or appends.
    pub fn create(
        &self,
        is_source: bool,
        source_hash: u32,
        dest_hash: u32,
        query: [u32; QUERY_LEN],
        tag: u32,
    ) -> Result<(), LinkError> {
        let _guard = self.lock.lock().unwrap();
        let flags = LinkFlags::VALID.union(if is_source { LinkFlags::SOURCE } else { LinkFlags::DEST });
        let candidate = LinkRecord { tag, flags, source_hash, dest_hash, query };

        let records = self.all_records()?;
        if records.iter().any(|r| r.is_valid() && r.logically_equal(&candidate)) {
            return Ok(());
        }

        let mut f = OpenOptions::new().read(true).write(true).open(&self.path)?;
        if let Some(slot) = records.iter().position(|r| !r.is_valid()) {
            f.seek(SeekFrom::Start((HEADER_LEN + slot * RECORD_LEN) as u64))?;
        } else {
            f.seek(SeekFrom::End(0))?;
        }
        f.write_all(&candidate.encode())?;
        Ok(())
    }

    /// Zero out every record carrying `tag` — tombstones them for later
    /// slot reuse without truncating the file.
    pub fn purge(&self, tag: u32) -> Result<(), LinkError> {
        let _guard = self.lock.lock().unwrap();
        let records = self.all_records()?;
        let mut f = OpenOptions::new().read(true).write(true).open(&self.path)?;
        for (i, r) in records.iter().enumerate() {
            if r.tag == tag && r.is_valid() {
                f.seek(SeekFrom::Start((HEADER_LEN + i * RECORD_LEN) as u64))?;
                f.write_all(&[0u8; RECORD_LEN])?;
            }
        }
        Ok(())
    }

    pub fn get(&self, index: usize) -> Result<LinkRecord, LinkError> {
        let _guard = self.lock.lock().unwrap();
        let mut f = OpenOptions::new().read(true).open(&self.path)?;
        f.seek(SeekFrom::Start((HEADER_LEN + index * RECORD_LEN) as u64))?;
        let mut buf = vec![0u8; RECORD_LEN];
        f.read_exact(&mut buf).map_err(|_| LinkError::NotFound)?;
        Ok(LinkRecord::decode(&buf))
    }

    pub fn valid_records(&self) -> Vec<LinkRecord> {
        self.all_records().unwrap_or_default().into_iter().filter(|r| r.is_valid()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("catbus_link_test_{name}_{}", std::process::id()));
        p
    }

    fn q(tags: &[u32]) -> [u32; QUERY_LEN] {
        let mut out = [0u32; QUERY_LEN];
        for (i, t) in tags.iter().enumerate() {
            out[i] = *t;
        }
        out
    }

    #[test]
    fn create_then_get_round_trips() {
        let path = tmp_path("create");
        let _ = std::fs::remove_file(&path);
        let store = LinkStore::open(&path).unwrap();
        store.create(true, 0x1, 0x2, q(&[5, 6]), 7).unwrap();
        let record = store.get(0).unwrap();
        assert_eq!(record.source_hash, 0x1);
        assert_eq!(record.dest_hash, 0x2);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn duplicate_create_is_a_noop() {
        let path = tmp_path("dup");
        let _ = std::fs::remove_file(&path);
        let store = LinkStore::open(&path).unwrap();
        store.create(true, 0x1, 0x2, q(&[1]), 1).unwrap();
        store.create(true, 0x1, 0x2, q(&[1]), 1).unwrap();
        assert_eq!(store.valid_records().len(), 1);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn purge_tombstones_and_create_reuses_slot() {
        let path = tmp_path("purge");
        let _ = std::fs::remove_file(&path);
        let store = LinkStore::open(&path).unwrap();
        store.create(true, 1, 2, q(&[]), 9).unwrap();
        store.purge(9).unwrap();
        assert_eq!(store.valid_records().len(), 0);

        store.create(false, 3, 4, q(&[]), 10).unwrap();
        assert_eq!(store.valid_records().len(), 1);
        // reused the tombstoned slot rather than appending a second record
        let all = store.all_records().unwrap();
        assert_eq!(all.len(), 1);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn query_match_is_and_over_nonzero_tags() {
        assert!(query_matches(&q(&[1, 2]), &[1, 2, 3]));
        assert!(!query_matches(&q(&[1, 9]), &[1, 2, 3]));
        assert!(query_matches(&q(&[]), &[1, 2, 3])); // empty query always matches
    }
}
