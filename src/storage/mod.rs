// Durable store
//
// Four logical tables persisted as one record file per key: bundles
// (by local id), registrations (by regid), links (by name) and
// pending aggregate custody signals (by destination+disposition).
// Records carry a checksummed header; writes go through a temp file
// and rename. The encoded size is computed before the write and the
// write is rejected if it would differ, which is why variable-length
// bundle fields may only change under the bundle lock.

mod table;

pub use table::Table;

use crate::bundle::{Bundle, BundleMeta, BundleRef, Payload};
use crate::contacts::LinkRecord;
use crate::error::{DtnError, Result};
use crate::reg::RegRecord;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct DurableStore {
    root: PathBuf,
    payload_dir: PathBuf,
    bundles: Table,
    registrations: Table,
    links: Table,
    pending_acs: Table,
}

impl DurableStore {
    pub fn open(root: &Path, payload_dir: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        fs::create_dir_all(payload_dir)?;
        Ok(Self {
            root: root.to_path_buf(),
            payload_dir: payload_dir.to_path_buf(),
            bundles: Table::open(&root.join("bundles"))?,
            registrations: Table::open(&root.join("registrations"))?,
            links: Table::open(&root.join("links"))?,
            pending_acs: Table::open(&root.join("pending_acs"))?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn payload_dir(&self) -> &Path {
        &self.payload_dir
    }

    /// Persist a bundle: spill the payload, then write the metadata
    /// record captured under the bundle lock.
    pub fn put_bundle(&self, bundle: &BundleRef) -> Result<()> {
        bundle.payload.persist(&self.payload_dir, bundle.id)?;
        let meta = bundle.meta();
        self.bundles.put(&key_u64(meta.id), &meta)?;
        bundle.with_state(|s| {
            s.in_datastore = true;
            s.queued_for_datastore = false;
        });
        Ok(())
    }

    pub fn del_bundle(&self, bundle_id: u64) -> Result<()> {
        self.bundles.del(&key_u64(bundle_id))?;
        let payload = self.payload_dir.join(format!("{}.pay", bundle_id));
        if payload.exists() {
            fs::remove_file(payload)?;
        }
        Ok(())
    }

    /// Reload every stored bundle, re-binding payload files. Records
    /// whose payload file is missing are dropped with a warning; a
    /// decode failure is a store inconsistency and fatal to the caller.
    pub fn load_bundles(&self) -> Result<Vec<BundleRef>> {
        let mut bundles = Vec::new();
        for meta in self.bundles.load_all::<BundleMeta>()? {
            let payload = match &meta.payload_path {
                Some(path) if path.exists() => Payload::from_file(path.clone())?,
                _ => {
                    warn!(bundle = meta.id, "stored bundle has no payload file");
                    self.bundles.del(&key_u64(meta.id))?;
                    continue;
                }
            };
            bundles.push(Bundle::from_meta(meta, payload));
        }
        info!(count = bundles.len(), "bundles reloaded from store");
        Ok(bundles)
    }

    pub fn put_registration(&self, record: &RegRecord) -> Result<()> {
        self.registrations.put(&key_u64(record.regid as u64), record)
    }

    pub fn del_registration(&self, regid: u32) -> Result<()> {
        self.registrations.del(&key_u64(regid as u64))
    }

    pub fn load_registrations(&self) -> Result<Vec<RegRecord>> {
        self.registrations.load_all()
    }

    pub fn put_link(&self, record: &LinkRecord) -> Result<()> {
        self.links.put(&record.name, record)
    }

    pub fn del_link(&self, name: &str) -> Result<()> {
        self.links.del(name)
    }

    pub fn load_links(&self) -> Result<Vec<LinkRecord>> {
        self.links.load_all()
    }

    pub fn put_pending_acs<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        self.pending_acs.put(&sanitize_key(key), value)
    }

    pub fn del_pending_acs(&self, key: &str) -> Result<()> {
        match self.pending_acs.del(&sanitize_key(key)) {
            Ok(()) => Ok(()),
            Err(DtnError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn load_pending_acs<V: DeserializeOwned>(&self) -> Result<Vec<V>> {
        self.pending_acs.load_all()
    }

    /// Highest stored bundle id, for seeding the id generator.
    pub fn max_bundle_id(&self) -> Result<u64> {
        Ok(self
            .bundles
            .keys()?
            .iter()
            .filter_map(|k| k.parse::<u64>().ok())
            .max()
            .unwrap_or(0))
    }
}

fn key_u64(id: u64) -> String {
    format!("{}", id)
}

/// Table keys become filenames; replace everything outside the safe set.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' {
                c
            } else {
                '+'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::ForwardingState;
    use crate::naming::EndpointId;

    fn store() -> (tempfile::TempDir, DurableStore) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            DurableStore::open(&dir.path().join("store"), &dir.path().join("payloads")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_bundle_roundtrip_preserves_state() {
        let (_dir, store) = store();
        let bundle = Bundle::builder(EndpointId::ipn(1, 1), EndpointId::ipn(2, 1))
            .creation_ts(777, 3)
            .payload(Payload::in_memory(b"custody pending".to_vec()))
            .custody_requested()
            .build(42);
        bundle.with_state(|s| {
            s.custodian = EndpointId::ipn(1, 0);
            s.local_custody = true;
            s.local_custody_id = Some(9);
        });
        bundle.fwd_log_add(
            "link-x",
            crate::bundle::ForwardingAction::ForwardAction,
            ForwardingState::Transmitted,
        );
        store.put_bundle(&bundle).unwrap();
        assert!(bundle.with_state(|s| s.in_datastore));

        let reloaded = store.load_bundles().unwrap();
        assert_eq!(reloaded.len(), 1);
        let b = &reloaded[0];
        assert_eq!(b.id, 42);
        assert!(b.local_custody());
        assert_eq!(b.with_state(|s| s.local_custody_id), Some(9));
        assert_eq!(b.payload.read_all().unwrap(), b"custody pending");
        assert_eq!(
            b.fwd_log_state("link-x"),
            Some(ForwardingState::Transmitted)
        );
        assert_eq!(store.max_bundle_id().unwrap(), 42);
    }

    #[test]
    fn test_delete_removes_payload_file() {
        let (_dir, store) = store();
        let bundle = Bundle::builder(EndpointId::ipn(1, 1), EndpointId::ipn(2, 1))
            .payload(Payload::in_memory(vec![0; 128]))
            .build(7);
        store.put_bundle(&bundle).unwrap();
        let payload_path = bundle.payload.file_path().unwrap();
        assert!(payload_path.exists());
        store.del_bundle(7).unwrap();
        assert!(!payload_path.exists());
        assert!(store.load_bundles().unwrap().is_empty());
    }

    #[test]
    fn test_missing_payload_dropped_on_reload() {
        let (_dir, store) = store();
        let bundle = Bundle::builder(EndpointId::ipn(1, 1), EndpointId::ipn(2, 1))
            .payload(Payload::in_memory(vec![1; 16]))
            .build(8);
        store.put_bundle(&bundle).unwrap();
        fs::remove_file(bundle.payload.file_path().unwrap()).unwrap();
        assert!(store.load_bundles().unwrap().is_empty());
    }

    #[test]
    fn test_pending_acs_key_sanitized() {
        let (_dir, store) = store();
        store
            .put_pending_acs("ipn:9.0/true/0", &vec![1u64, 2, 3])
            .unwrap();
        let loaded: Vec<Vec<u64>> = store.load_pending_acs().unwrap();
        assert_eq!(loaded, vec![vec![1, 2, 3]]);
        store.del_pending_acs("ipn:9.0/true/0").unwrap();
        // idempotent delete
        store.del_pending_acs("ipn:9.0/true/0").unwrap();
    }
}
