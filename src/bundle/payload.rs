// Bundle payloads
//
// Payloads arrive in memory and are spilled to a file under the payload
// root when the bundle is durably stored. The file path is the durable
// payload handle recorded in the bundle's metadata. Conversion happens
// in place so every holder of the bundle sees the same backing.

use crate::error::{DtnError, Result};
use parking_lot::Mutex;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
enum Backing {
    Memory(Vec<u8>),
    File { path: PathBuf, len: u64 },
}

#[derive(Debug)]
pub struct Payload {
    inner: Mutex<Backing>,
}

impl Payload {
    pub fn empty() -> Self {
        Self::in_memory(Vec::new())
    }

    pub fn in_memory(data: Vec<u8>) -> Self {
        Self {
            inner: Mutex::new(Backing::Memory(data)),
        }
    }

    /// Adopt an existing payload file (datastore reload path).
    pub fn from_file(path: PathBuf) -> Result<Self> {
        let len = fs::metadata(&path)?.len();
        Ok(Self {
            inner: Mutex::new(Backing::File { path, len }),
        })
    }

    pub fn len(&self) -> u64 {
        match &*self.inner.lock() {
            Backing::Memory(data) => data.len() as u64,
            Backing::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Durable payload path, if already spilled.
    pub fn file_path(&self) -> Option<PathBuf> {
        match &*self.inner.lock() {
            Backing::Memory(_) => None,
            Backing::File { path, .. } => Some(path.clone()),
        }
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        let guard = self.inner.lock();
        match &*guard {
            Backing::Memory(data) => Ok(data.clone()),
            Backing::File { path, .. } => Ok(fs::read(path)?),
        }
    }

    pub fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let guard = self.inner.lock();
        match &*guard {
            Backing::Memory(data) => {
                let start = offset as usize;
                let end = start
                    .checked_add(len as usize)
                    .filter(|&e| e <= data.len())
                    .ok_or_else(|| {
                        DtnError::InvalidInput(format!(
                            "payload range {}+{} out of bounds ({})",
                            offset,
                            len,
                            data.len()
                        ))
                    })?;
                Ok(data[start..end].to_vec())
            }
            Backing::File { path, len: flen } => {
                if offset + len > *flen {
                    return Err(DtnError::InvalidInput(format!(
                        "payload range {}+{} out of bounds ({})",
                        offset, len, flen
                    )));
                }
                let mut file = fs::File::open(path)?;
                file.seek(SeekFrom::Start(offset))?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf)?;
                Ok(buf)
            }
        }
    }

    pub fn crc32(&self) -> Result<u32> {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.read_all()?);
        Ok(hasher.finalize())
    }

    /// Spill an in-memory payload to `<dir>/<bundle_id>.pay`. A no-op
    /// when already file-backed.
    pub fn persist(&self, dir: &Path, bundle_id: u64) -> Result<PathBuf> {
        let mut guard = self.inner.lock();
        if let Backing::File { path, .. } = &*guard {
            return Ok(path.clone());
        }
        let data = match &*guard {
            Backing::Memory(data) => data.clone(),
            Backing::File { .. } => unreachable!(),
        };
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.pay", bundle_id));
        let tmp = dir.join(format!("{}.pay.tmp", bundle_id));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_data()?;
        fs::rename(&tmp, &path)?;
        *guard = Backing::File {
            path: path.clone(),
            len: data.len() as u64,
        };
        Ok(path)
    }

    /// Delete the backing file, used when the bundle leaves the store.
    pub fn release(&self) -> Result<()> {
        let guard = self.inner.lock();
        if let Backing::File { path, .. } = &*guard {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persist_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let payload = Payload::in_memory(b"red green refuse".to_vec());
        assert!(payload.file_path().is_none());

        let path = payload.persist(dir.path(), 12).unwrap();
        assert_eq!(payload.file_path(), Some(path.clone()));
        assert_eq!(payload.len(), 16);
        assert_eq!(payload.read_all().unwrap(), b"red green refuse");
        assert_eq!(payload.read_range(4, 5).unwrap(), b"green");

        // second persist is a no-op
        assert_eq!(payload.persist(dir.path(), 12).unwrap(), path);

        payload.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_range_bounds_checked() {
        let payload = Payload::in_memory(vec![0u8; 8]);
        assert!(payload.read_range(4, 8).is_err());
        assert!(payload.read_range(u64::MAX, 1).is_err());
    }
}
