// Record-file table
//
// One file per key under the table directory. Record layout:
// magic (4) | payload length (4, LE) | crc32 of payload (4, LE) |
// bincode payload. The payload length is computed before the write
// and verified against what lands on disk.

use crate::error::{DtnError, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const RECORD_MAGIC: u32 = 0x44_54_4e_52; // "DTNR"
const HEADER_LEN: usize = 12;
const RECORD_EXT: &str = "rec";

pub struct Table {
    dir: PathBuf,
}

impl Table {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, RECORD_EXT))
    }

    pub fn put<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        let payload = bincode::serde::encode_to_vec(value, bincode::config::standard())?;
        let expected_len = payload.len();

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut record = BytesMut::with_capacity(HEADER_LEN + expected_len);
        record.put_u32_le(RECORD_MAGIC);
        record.put_u32_le(expected_len as u32);
        record.put_u32_le(crc);
        record.put_slice(&payload);
        if record.len() != HEADER_LEN + expected_len {
            return Err(DtnError::Storage(format!(
                "record for '{}' encoded {} bytes, expected {}",
                key,
                record.len() - HEADER_LEN,
                expected_len
            )));
        }

        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&record)?;
        file.sync_data()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn get<V: DeserializeOwned>(&self, key: &str) -> Result<V> {
        let path = self.path_for(key);
        if !path.exists() {
            return Err(DtnError::NotFound(format!("record '{}'", key)));
        }
        Self::read_record(&path)
    }

    fn read_record<V: DeserializeOwned>(path: &Path) -> Result<V> {
        let raw = fs::read(path)?;
        if raw.len() < HEADER_LEN {
            return Err(DtnError::Storage(format!(
                "record {} truncated at {} bytes",
                path.display(),
                raw.len()
            )));
        }
        let mut header = &raw[..HEADER_LEN];
        if header.get_u32_le() != RECORD_MAGIC {
            return Err(DtnError::Storage(format!(
                "record {} has bad magic",
                path.display()
            )));
        }
        let len = header.get_u32_le() as usize;
        let crc = header.get_u32_le();
        let payload = &raw[HEADER_LEN..];
        if payload.len() != len {
            return Err(DtnError::Storage(format!(
                "record {} length mismatch: header {} actual {}",
                path.display(),
                len,
                payload.len()
            )));
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != crc {
            return Err(DtnError::Storage(format!(
                "record {} failed checksum",
                path.display()
            )));
        }
        let (value, _) = bincode::serde::decode_from_slice(payload, bincode::config::standard())?;
        Ok(value)
    }

    pub fn del(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if !path.exists() {
            return Err(DtnError::NotFound(format!("record '{}'", key)));
        }
        fs::remove_file(path)?;
        Ok(())
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    keys.push(stem.to_string());
                }
            }
        }
        Ok(keys)
    }

    pub fn load_all<V: DeserializeOwned>(&self) -> Result<Vec<V>> {
        let mut values = Vec::new();
        for key in self.keys()? {
            values.push(Self::read_record(&self.path_for(&key))?);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_del() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::open(dir.path()).unwrap();
        table.put("a", &("x".to_string(), 5u32)).unwrap();
        let value: (String, u32) = table.get("a").unwrap();
        assert_eq!(value, ("x".to_string(), 5));
        assert_eq!(table.keys().unwrap(), vec!["a".to_string()]);
        table.del("a").unwrap();
        assert!(table.get::<(String, u32)>("a").is_err());
    }

    #[test]
    fn test_corrupt_record_detected() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::open(dir.path()).unwrap();
        table.put("a", &42u64).unwrap();
        let path = dir.path().join("a.rec");
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        fs::write(&path, raw).unwrap();
        match table.get::<u64>("a") {
            Err(DtnError::Storage(msg)) => assert!(msg.contains("checksum")),
            other => panic!("expected checksum failure, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_overwrite_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::open(dir.path()).unwrap();
        table.put("k", &1u64).unwrap();
        table.put("k", &2u64).unwrap();
        assert_eq!(table.get::<u64>("k").unwrap(), 2);
        assert_eq!(table.keys().unwrap().len(), 1);
    }
}
