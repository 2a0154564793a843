//! The file-transfer session state machine: `Idle -> Open -> (Getting |
//! Putting) -> Closed`, plus the independent `FileCheck` streaming-hash
//! task that never touches the single-session slot. Grounded on
//! `catbus.c`'s file session handling and, for the "one shared mutable slot
//! guarded by a lock, touched by multiple async call sites" shape, the
//! teacher's `net/connection.rs` `ConnectionManager`.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rand::Rng;

use crate::error::ProtocolError;
use crate::wire::limits::FILE_SESSION_TICKS;
use crate::wire::message::FileMode;

struct FileSession {
    session_id: u32,
    mode: FileMode,
    file: std::fs::File,
    position: u64,
    ticks_left: u32,
}

/// The node's single file-transfer session slot.
pub struct FileSessions {
    root: PathBuf,
    active: Mutex<Option<FileSession>>,
}

impl FileSessions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileSessions { root: root.into(), active: Mutex::new(None) }
    }

    fn resolve(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    /// `FileOpen`: refuses with `FilesystemBusy` if a session is already
    /// active; otherwise opens (creating on write) and starts a session.
    pub fn open(&self, filename: &str, mode: FileMode) -> Result<u32, ProtocolError> {
        let mut slot = self.active.lock().unwrap();
        if slot.is_some() {
            return Err(ProtocolError::FilesystemBusy);
        }

        let path = self.resolve(filename);
        let file = match mode {
            FileMode::Read => std::fs::File::open(&path).map_err(|_| ProtocolError::FileNotFound)?,
            FileMode::Write => std::fs::OpenOptions::new().create(true).write(true).truncate(true).open(&path)?,
        };

        let session_id: u32 = rand::thread_rng().r#gen();
        *slot = Some(FileSession { session_id, mode, file, position: 0, ticks_left: FILE_SESSION_TICKS });
        Ok(session_id)
    }

    fn with_active<T>(
        &self,
        session_id: u32,
        f: impl FnOnce(&mut FileSession) -> Result<T, ProtocolError>,
    ) -> Result<T, ProtocolError> {
        let mut slot = self.active.lock().unwrap();
        match slot.as_mut() {
            Some(s) if s.session_id == session_id => {
                s.ticks_left = FILE_SESSION_TICKS;
                f(s)
            }
            _ => Err(ProtocolError::InvalidFileSession),
        }
    }

    /// `FileGet`: seek and read up to `max_len` bytes.
    pub fn get(&self, session_id: u32, offset: u32, max_len: usize) -> Result<Vec<u8>, ProtocolError> {
        self.with_active(session_id, |s| {
            s.file.seek(SeekFrom::Start(offset as u64))?;
            let mut buf = vec![0u8; max_len];
            let n = s.file.read(&mut buf)?;
            buf.truncate(n);
            s.position = offset as u64 + n as u64;
            Ok(buf)
        })
    }

    /// `FileData`: write the payload iff `offset` matches the session's
    /// current position; a stale/duplicate chunk is silently ignored.
    pub fn data(&self, session_id: u32, offset: u32, payload: &[u8]) -> Result<bool, ProtocolError> {
        self.with_active(session_id, |s| {
            if offset as u64 != s.position {
                return Ok(false);
            }
            s.file.write_all(payload)?;
            s.position += payload.len() as u64;
            Ok(true)
        })
    }

    pub fn close(&self, session_id: u32) -> Result<(), ProtocolError> {
        let mut slot = self.active.lock().unwrap();
        match slot.as_ref() {
            Some(s) if s.session_id == session_id => {
                *slot = None;
                Ok(())
            }
            _ => Err(ProtocolError::InvalidFileSession),
        }
    }

    /// `FileDelete`: open (write-truncate), delete, close in one step; a
    /// missing file is the suppressed `FileNotFound`.
    pub fn delete(&self, filename: &str) -> Result<(), ProtocolError> {
        let path = self.resolve(filename);
        std::fs::remove_file(&path).map_err(|_| ProtocolError::FileNotFound)?;
        Ok(())
    }

    pub fn list(&self, start_index: u32, max_items: usize) -> (u32, Vec<(String, u32)>) {
        let mut names: Vec<_> = std::fs::read_dir(&self.root)
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .collect();
        names.sort_by_key(|e| e.file_name());

        let mut items = Vec::new();
        let mut next = start_index;
        for entry in names.iter().skip(start_index as usize).take(max_items) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let size = entry.metadata().map(|m| m.len() as u32).unwrap_or(0);
            items.push((name, size));
            next += 1;
        }
        (next, items)
    }

    /// Announce-tick timer: decrements the active session's remaining
    /// ticks, closing it on expiry. Returns `true` if a session was closed.
    pub fn tick(&self) -> bool {
        let mut slot = self.active.lock().unwrap();
        if let Some(s) = slot.as_mut() {
            if s.ticks_left == 0 {
                *slot = None;
                return true;
            }
            s.ticks_left -= 1;
        }
        false
    }

    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.resolve(filename)
    }
}

/// A simple streaming FNV-1a-64 over a file's contents, chunked and
/// yielding between chunks so a large file doesn't block the executor.
/// Runs independently of the session slot above (`FileCheck` is read-only
/// and short-lived, so it doesn't need the single-session invariant).
pub async fn stream_file_hash(path: &Path) -> std::io::Result<(u64, u64)> {
    const CHUNK: usize = 4096;
    let mut file = std::fs::File::open(path)?;
    let mut hash: u64 = 0xcbf29ce484222325;
    let mut total: u64 = 0;
    let mut buf = vec![0u8; CHUNK];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        for &b in &buf[..n] {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        total += n as u64;
        tokio::task::yield_now().await;
    }

    Ok((hash, total))
}
