//! Append-only rotating record files (`blk00000.dat`, `rev00000.dat`, ...).
//!
//! Each record is stored as a 4-byte little-endian length followed by the
//! payload. A [`FileLocation`] points at the length prefix.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const BLOCK_FILE_PREFIX: &str = "blk";
pub const UNDO_FILE_PREFIX: &str = "rev";

const RECORD_HEADER_LEN: u64 = 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FileLocation {
    pub file_id: u32,
    pub offset: u64,
    pub len: u32,
}

impl FileLocation {
    pub const ENCODED_LEN: usize = 16;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        let file_id = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let offset = u64::from_le_bytes(bytes[4..12].try_into().ok()?);
        let len = u32::from_le_bytes(bytes[12..16].try_into().ok()?);
        Some(Self {
            file_id,
            offset,
            len,
        })
    }

    /// Bytes the record occupies on disk, length prefix included.
    pub fn record_len(&self) -> u64 {
        RECORD_HEADER_LEN + u64::from(self.len)
    }
}

#[derive(Debug)]
pub enum FlatFileError {
    Io(std::io::Error),
    InvalidLocation,
    LengthMismatch,
    RecordTooLarge(usize),
    Poisoned,
}

impl std::fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatFileError::Io(err) => write!(f, "{err}"),
            FlatFileError::InvalidLocation => write!(f, "invalid flatfile location"),
            FlatFileError::LengthMismatch => write!(f, "flatfile length mismatch"),
            FlatFileError::RecordTooLarge(len) => write!(f, "flatfile record too large ({len} bytes)"),
            FlatFileError::Poisoned => write!(f, "flatfile state lock poisoned"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<std::io::Error> for FlatFileError {
    fn from(err: std::io::Error) -> Self {
        FlatFileError::Io(err)
    }
}

pub struct FlatFileStore {
    dir: PathBuf,
    prefix: String,
    max_file_size: u64,
    state: Mutex<FlatFileState>,
}

#[derive(Debug)]
struct FlatFileState {
    current_file: u32,
    current_len: u64,
    unsynced: BTreeSet<u32>,
}

impl FlatFileStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        max_file_size: u64,
    ) -> Result<Self, FlatFileError> {
        let dir = dir.into();
        let prefix = prefix.into();
        std::fs::create_dir_all(&dir)?;
        let (current_file, current_len) = Self::locate_active_file(&dir, &prefix, max_file_size)?;
        Ok(Self {
            dir,
            prefix,
            max_file_size,
            state: Mutex::new(FlatFileState {
                current_file,
                current_len,
                unsynced: BTreeSet::new(),
            }),
        })
    }

    pub fn blocks(dir: impl Into<PathBuf>, max_file_size: u64) -> Result<Self, FlatFileError> {
        Self::new(dir, BLOCK_FILE_PREFIX, max_file_size)
    }

    pub fn undo(dir: impl Into<PathBuf>, max_file_size: u64) -> Result<Self, FlatFileError> {
        Self::new(dir, UNDO_FILE_PREFIX, max_file_size)
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Claims space for a record of `len` bytes, moving to a fresh file when
    /// the current one would exceed the size limit.
    pub fn reserve(&self, len: usize) -> Result<FileLocation, FlatFileError> {
        let len32 = u32::try_from(len).map_err(|_| FlatFileError::RecordTooLarge(len))?;
        let mut state = self.lock()?;
        let needed = RECORD_HEADER_LEN + u64::from(len32);
        if state.current_len > 0 && state.current_len + needed > self.max_file_size {
            state.current_file += 1;
            state.current_len = 0;
        }
        let location = FileLocation {
            file_id: state.current_file,
            offset: state.current_len,
            len: len32,
        };
        state.current_len += needed;
        Ok(location)
    }

    pub fn write_at(&self, location: FileLocation, bytes: &[u8]) -> Result<(), FlatFileError> {
        if bytes.len() != location.len as usize {
            return Err(FlatFileError::LengthMismatch);
        }
        let path = self.file_path(location.file_id);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.seek(SeekFrom::Start(location.offset))?;
        file.write_all(&location.len.to_le_bytes())?;
        file.write_all(bytes)?;
        file.flush()?;
        self.lock()?.unsynced.insert(location.file_id);
        Ok(())
    }

    pub fn append(&self, bytes: &[u8]) -> Result<FileLocation, FlatFileError> {
        let location = self.reserve(bytes.len())?;
        self.write_at(location, bytes)?;
        Ok(location)
    }

    pub fn read(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        if location.len == 0 {
            return Err(FlatFileError::InvalidLocation);
        }
        let path = self.file_path(location.file_id);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let stored_len = u32::from_le_bytes(len_bytes);
        if stored_len != location.len {
            return Err(FlatFileError::LengthMismatch);
        }
        let mut buffer = vec![0u8; stored_len as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Forces every file written since the last sync to stable storage.
    pub fn sync(&self) -> Result<(), FlatFileError> {
        let pending = std::mem::take(&mut self.lock()?.unsynced);
        for file_id in pending {
            let path = self.file_path(file_id);
            match OpenOptions::new().write(true).open(&path) {
                Ok(file) => file.sync_all()?,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    pub fn current_file(&self) -> Result<u32, FlatFileError> {
        Ok(self.lock()?.current_file)
    }

    pub fn file_path(&self, file_id: u32) -> PathBuf {
        self.dir.join(format!("{}{file_id:05}.dat", self.prefix))
    }

    fn lock(&self) -> Result<MutexGuard<'_, FlatFileState>, FlatFileError> {
        self.state.lock().map_err(|_| FlatFileError::Poisoned)
    }

    fn locate_active_file(
        dir: &Path,
        prefix: &str,
        max_file_size: u64,
    ) -> Result<(u32, u64), FlatFileError> {
        let mut file_id = 0u32;
        let mut last_existing: Option<(u32, u64)> = None;
        loop {
            let path = dir.join(format!("{prefix}{file_id:05}.dat"));
            if !path.exists() {
                break;
            }
            let metadata = std::fs::metadata(&path)?;
            last_existing = Some((file_id, metadata.len()));
            file_id += 1;
        }

        match last_existing {
            Some((last_id, len)) if len >= max_file_size => Ok((last_id + 1, 0)),
            Some((last_id, len)) => Ok((last_id, len)),
            None => Ok((0, 0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_returns_payload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FlatFileStore::blocks(dir.path(), 1024).expect("store");
        let first = store.append(b"first record").expect("append");
        let second = store.append(b"second").expect("append");
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, first.record_len());
        assert_eq!(store.read(first).expect("read"), b"first record");
        assert_eq!(store.read(second).expect("read"), b"second");
        assert!(dir.path().join("blk00000.dat").exists());
    }

    #[test]
    fn rotates_when_file_is_full() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FlatFileStore::undo(dir.path(), 32).expect("store");
        let a = store.append(&[1u8; 20]).expect("append");
        let b = store.append(&[2u8; 20]).expect("append");
        assert_eq!(a.file_id, 0);
        assert_eq!(b.file_id, 1);
        assert_eq!(b.offset, 0);
        assert!(dir.path().join("rev00001.dat").exists());
    }

    #[test]
    fn oversized_record_still_gets_its_own_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FlatFileStore::blocks(dir.path(), 16).expect("store");
        let big = store.append(&[7u8; 64]).expect("append");
        assert_eq!(big.file_id, 0);
        assert_eq!(store.read(big).expect("read").len(), 64);
        let next = store.append(&[8u8; 4]).expect("append");
        assert_eq!(next.file_id, 1);
    }

    #[test]
    fn reopen_continues_after_existing_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = {
            let store = FlatFileStore::blocks(dir.path(), 1024).expect("store");
            let location = store.append(b"persisted").expect("append");
            store.sync().expect("sync");
            location
        };
        let store = FlatFileStore::blocks(dir.path(), 1024).expect("reopen");
        let second = store.append(b"more").expect("append");
        assert_eq!(second.offset, first.record_len());
        assert_eq!(store.read(first).expect("read"), b"persisted");
    }

    #[test]
    fn length_mismatch_is_detected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FlatFileStore::blocks(dir.path(), 1024).expect("store");
        let mut location = store.append(b"abc").expect("append");
        location.len = 4;
        assert!(matches!(
            store.read(location),
            Err(FlatFileError::LengthMismatch)
        ));
    }

    #[test]
    fn location_encoding_is_sixteen_bytes() {
        let location = FileLocation {
            file_id: 3,
            offset: 0x1_0000_0002,
            len: 77,
        };
        let bytes = location.encode();
        assert_eq!(FileLocation::decode(&bytes), Some(location));
        assert_eq!(FileLocation::decode(&bytes[..15]), None);
    }
}
