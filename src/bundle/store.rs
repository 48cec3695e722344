// Bundle store and identity indexes
//
// Four indexes share one bundle identity: all_bundles (every live
// bundle), pending_bundles (not yet delivered/transmitted/expired),
// custody_bundles (locally custodied), and dupefinder_bundles (keyed
// by GBOF). Adding to pending always also adds to dupefinder. The
// custody index additionally maintains a custody-id lookup for ACS.

use crate::bundle::model::{BundleRef, Gbof};
use crate::error::{DtnError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Monotonic local bundle-id source. Ids wrap past u64::MAX back to 1
/// (never 0) and the generation counter records each wrap so a stream
/// of ids stays unique for any realistic store lifetime.
pub struct BundleIdGenerator {
    next: AtomicU64,
    generation: AtomicU32,
}

impl BundleIdGenerator {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start.max(1)),
            generation: AtomicU32::new(0),
        }
    }

    pub fn next_id(&self) -> u64 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
            // wrapped: 0 is reserved, bump the generation and retry
            self.generation.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn last_issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed).wrapping_sub(1)
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Indexes {
    all: HashMap<u64, BundleRef>,
    pending: HashMap<u64, BundleRef>,
    custody: HashMap<u64, BundleRef>,
    dupefinder: HashMap<Gbof, BundleRef>,
    custody_ids: HashMap<u64, u64>,
}

pub struct BundleStore {
    indexes: RwLock<Indexes>,
}

impl Default for BundleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BundleStore {
    pub fn new() -> Self {
        Self {
            indexes: RwLock::new(Indexes::default()),
        }
    }

    /// Insert a freshly created bundle into all_bundles.
    pub fn insert(&self, bundle: BundleRef) -> Result<()> {
        let mut idx = self.indexes.write();
        if idx.all.contains_key(&bundle.id) {
            return Err(DtnError::AlreadyExists(format!(
                "bundle id {} already live",
                bundle.id
            )));
        }
        idx.all.insert(bundle.id, bundle);
        Ok(())
    }

    pub fn get(&self, id: u64) -> Option<BundleRef> {
        self.indexes.read().all.get(&id).cloned()
    }

    pub fn find_by_gbof(&self, gbof: &Gbof) -> Option<BundleRef> {
        self.indexes.read().dupefinder.get(gbof).cloned()
    }

    pub fn find_by_custody_id(&self, custody_id: u64) -> Option<BundleRef> {
        let idx = self.indexes.read();
        let id = idx.custody_ids.get(&custody_id)?;
        idx.custody.get(id).cloned()
    }

    /// Pending membership implies dupefinder membership.
    pub fn add_to_pending(&self, bundle: &BundleRef) {
        let mut idx = self.indexes.write();
        debug_assert!(idx.all.contains_key(&bundle.id));
        idx.pending.insert(bundle.id, bundle.clone());
        idx.dupefinder.insert(bundle.gbof(), bundle.clone());
    }

    pub fn remove_from_pending(&self, id: u64) -> bool {
        self.indexes.write().pending.remove(&id).is_some()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.indexes.read().pending.contains_key(&id)
    }

    pub fn add_to_custody(&self, bundle: &BundleRef, custody_id: u64) {
        let mut idx = self.indexes.write();
        idx.custody.insert(bundle.id, bundle.clone());
        idx.custody_ids.insert(custody_id, bundle.id);
    }

    pub fn remove_from_custody(&self, bundle: &BundleRef) -> bool {
        let mut idx = self.indexes.write();
        if let Some(custody_id) = bundle.with_state(|s| s.local_custody_id) {
            idx.custody_ids.remove(&custody_id);
        }
        idx.custody.remove(&bundle.id).is_some()
    }

    /// Final removal from every index. Callers must have cleared
    /// pending membership first; custody membership is an error here
    /// because custody release is a separate, signalled transition.
    pub fn erase(&self, id: u64) -> Result<BundleRef> {
        let mut idx = self.indexes.write();
        if idx.pending.contains_key(&id) {
            return Err(DtnError::InvalidState(format!(
                "bundle {} still pending",
                id
            )));
        }
        if idx.custody.contains_key(&id) {
            return Err(DtnError::InvalidState(format!(
                "bundle {} still in custody",
                id
            )));
        }
        let bundle = idx
            .all
            .remove(&id)
            .ok_or_else(|| DtnError::NotFound(format!("bundle {}", id)))?;
        let gbof = bundle.gbof();
        // Only drop the dupefinder entry if it still points at us; a
        // suppressed duplicate shares the GBOF with the survivor.
        if idx.dupefinder.get(&gbof).map(|b| b.id) == Some(id) {
            idx.dupefinder.remove(&gbof);
        }
        Ok(bundle)
    }

    /// Deletion gates: pending removed, router agreed, policy allows.
    pub fn deletable(&self, id: u64, router_can_delete: bool, early_deletion: bool) -> bool {
        if !router_can_delete || !early_deletion {
            return false;
        }
        let idx = self.indexes.read();
        !idx.pending.contains_key(&id) && !idx.custody.contains_key(&id)
    }

    pub fn all_count(&self) -> usize {
        self.indexes.read().all.len()
    }

    pub fn pending_count(&self) -> usize {
        self.indexes.read().pending.len()
    }

    pub fn custody_count(&self) -> usize {
        self.indexes.read().custody.len()
    }

    pub fn pending_snapshot(&self) -> Vec<BundleRef> {
        self.indexes.read().pending.values().cloned().collect()
    }

    pub fn custody_snapshot(&self) -> Vec<BundleRef> {
        self.indexes.read().custody.values().cloned().collect()
    }

    /// Index-consistency check run by tests after event dispatch.
    pub fn check_invariants(&self) -> Result<()> {
        let idx = self.indexes.read();
        for (id, bundle) in &idx.pending {
            if !idx.all.contains_key(id) {
                return Err(DtnError::InvalidState(format!(
                    "pending bundle {} not in all_bundles",
                    id
                )));
            }
            if !idx.dupefinder.contains_key(&bundle.gbof()) {
                return Err(DtnError::InvalidState(format!(
                    "pending bundle {} not in dupefinder",
                    id
                )));
            }
        }
        for (id, bundle) in &idx.custody {
            if !bundle.local_custody() {
                return Err(DtnError::InvalidState(format!(
                    "bundle {} in custody index without local_custody",
                    id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{Bundle, Payload};
    use crate::naming::EndpointId;

    fn make(id: u64, seq: u64) -> BundleRef {
        Bundle::builder(EndpointId::ipn(1, 1), EndpointId::ipn(2, 1))
            .creation_ts(1000, seq)
            .payload(Payload::in_memory(vec![0u8; 16]))
            .build(id)
    }

    #[test]
    fn test_id_generator_skips_zero() {
        let generator = BundleIdGenerator::new(u64::MAX);
        assert_eq!(generator.next_id(), u64::MAX);
        let id = generator.next_id();
        assert_ne!(id, 0);
        assert_eq!(generator.generation(), 1);
    }

    #[test]
    fn test_pending_implies_dupefinder() {
        let store = BundleStore::new();
        let bundle = make(1, 0);
        store.insert(bundle.clone()).unwrap();
        store.add_to_pending(&bundle);
        assert!(store.find_by_gbof(&bundle.gbof()).is_some());
        store.check_invariants().unwrap();
    }

    #[test]
    fn test_erase_refuses_pending() {
        let store = BundleStore::new();
        let bundle = make(1, 0);
        store.insert(bundle.clone()).unwrap();
        store.add_to_pending(&bundle);
        assert!(store.erase(1).is_err());
        store.remove_from_pending(1);
        assert!(store.erase(1).is_ok());
        assert_eq!(store.all_count(), 0);
    }

    #[test]
    fn test_duplicate_gbof_does_not_clobber_survivor() {
        let store = BundleStore::new();
        let survivor = make(1, 0);
        let dupe = make(2, 0);
        store.insert(survivor.clone()).unwrap();
        store.insert(dupe.clone()).unwrap();
        store.add_to_pending(&survivor);
        // dupe never enters pending; erase must leave the survivor's
        // dupefinder entry in place
        store.erase(2).unwrap();
        assert_eq!(store.find_by_gbof(&survivor.gbof()).unwrap().id, 1);
    }

    #[test]
    fn test_custody_id_lookup() {
        let store = BundleStore::new();
        let bundle = make(1, 0);
        store.insert(bundle.clone()).unwrap();
        bundle.with_state(|s| {
            s.local_custody = true;
            s.local_custody_id = Some(77);
        });
        store.add_to_custody(&bundle, 77);
        assert_eq!(store.find_by_custody_id(77).unwrap().id, 1);
        store.check_invariants().unwrap();
        bundle.with_state(|s| s.local_custody = false);
        store.remove_from_custody(&bundle);
        assert!(store.find_by_custody_id(77).is_none());
    }
}
