//! Checksummed flat files
//!
//! Layout: `[4-byte network magic][bincode body][32-byte double SHA256]`,
//! the hash covering magic and body. Writes go to a randomly suffixed
//! sibling file which is then renamed over the target, so a crash never
//! leaves a half-written table behind.

use crate::storage::hashing::double_sha256;
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const MAGIC_SIZE: usize = 4;
pub const HASH_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0} is too short to hold magic and checksum")]
    Truncated(PathBuf),
    #[error("checksum mismatch in {0}")]
    ChecksumMismatch(PathBuf),
    #[error("network magic mismatch: expected {expected}, found {found}")]
    MagicMismatch { expected: String, found: String },
    #[error("serialization: {0}")]
    Serialization(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, PersistError>;

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> PersistError + '_ {
    move |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One persisted table on disk
#[derive(Debug, Clone)]
pub struct FlatFile {
    path: PathBuf,
    magic: [u8; 4],
}

impl FlatFile {
    pub fn new(path: impl Into<PathBuf>, magic: [u8; 4]) -> Self {
        Self {
            path: path.into(),
            magic,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize `value` and atomically replace the file with it
    pub fn write<T: Serialize>(&self, value: &T) -> Result<()> {
        let mut data = Vec::new();
        data.extend_from_slice(&self.magic);
        bincode::serialize_into(&mut data, value)?;
        let hash = double_sha256(&data);
        data.extend_from_slice(&hash);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_error(parent))?;
            }
        }

        let tmp = self.temp_path();
        let written = File::create(&tmp)
            .and_then(|mut file| {
                file.write_all(&data)?;
                file.sync_all()
            })
            .and_then(|_| fs::rename(&tmp, &self.path));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(io_error(&self.path)(e));
        }
        debug!("Wrote {} bytes to {}", data.len(), self.path.display());
        Ok(())
    }

    /// Read and verify the file, refusing it on any mismatch
    pub fn read<T: DeserializeOwned>(&self) -> Result<T> {
        let data = fs::read(&self.path).map_err(io_error(&self.path))?;
        if data.len() < MAGIC_SIZE + HASH_SIZE {
            return Err(PersistError::Truncated(self.path.clone()));
        }

        let (content, stored_hash) = data.split_at(data.len() - HASH_SIZE);
        if double_sha256(content) != stored_hash {
            return Err(PersistError::ChecksumMismatch(self.path.clone()));
        }

        let (magic, body) = content.split_at(MAGIC_SIZE);
        if magic != self.magic {
            return Err(PersistError::MagicMismatch {
                expected: hex::encode(self.magic),
                found: hex::encode(magic),
            });
        }

        Ok(bincode::deserialize(body)?)
    }

    fn temp_path(&self) -> PathBuf {
        let suffix: u16 = rand::random();
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.path.with_file_name(format!("{}.{:04x}", name, suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let file = FlatFile::new(dir.path().join("t.dat"), MAGIC);
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1u64);
        file.write(&map).unwrap();
        let back: BTreeMap<String, u64> = file.read().unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let file = FlatFile::new(dir.path().join("t.dat"), MAGIC);
        file.write(&vec![1u8, 2, 3]).unwrap();
        let names: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.dat");
        FlatFile::new(&path, MAGIC).write(&5u32).unwrap();
        let other = FlatFile::new(&path, [0xf9, 0xbe, 0xb4, 0xd9]);
        assert!(matches!(
            other.read::<u32>(),
            Err(PersistError::MagicMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.dat");
        fs::write(&path, [0u8; 10]).unwrap();
        assert!(matches!(
            FlatFile::new(&path, MAGIC).read::<u32>(),
            Err(PersistError::Truncated(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = FlatFile::new(dir.path().join("absent.dat"), MAGIC);
        assert!(matches!(file.read::<u32>(), Err(PersistError::Io { .. })));
    }
}
