// Aggregate custody signalling
//
// Instead of one custody-signal bundle per accepted bundle, custody
// ids are folded into a pending signal keyed by (previous custodian,
// succeeded, reason) and flushed when the encoded payload would exceed
// the per-route maximum or the per-route delay expires. Pending state
// is durable so a restart flushes outstanding signals.

use crate::bundle::{AcsEntry, AcsPayload, CustodySignalReason};
use crate::naming::{EidPattern, EndpointId};
use crate::sdnv;
use crate::timer::TimerToken;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AcsKey {
    pub custodian: EndpointId,
    pub succeeded: bool,
    pub reason: CustodySignalReason,
}

impl AcsKey {
    pub fn succeeded(custodian: EndpointId) -> Self {
        Self {
            custodian,
            succeeded: true,
            reason: CustodySignalReason::NoAdditionalInfo,
        }
    }

    /// Key string for the pending-ACS durable table.
    pub fn store_key(&self) -> String {
        format!(
            "{}_{}_{}",
            self.custodian,
            self.succeeded,
            self.reason as u8
        )
    }
}

impl fmt::Display for AcsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded={} reason={:?}",
            self.custodian, self.succeeded, self.reason
        )
    }
}

/// What a custody-id insertion did to the run-length encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOp {
    InsertFirst,
    Insert,
    InsertAtEnd,
    ExtendEntry,
    PrependEntry,
    Noop,
}

/// Durable image of one pending signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAcsRecord {
    pub custodian: EndpointId,
    pub succeeded: bool,
    pub reason: CustodySignalReason,
    /// (left edge, fill) runs in ascending order.
    pub runs: Vec<(u64, u64)>,
}

struct PendingAcs {
    /// left edge -> fill length, ascending and non-adjacent.
    runs: BTreeMap<u64, u64>,
    payload_size: usize,
    timer: Option<TimerToken>,
}

impl PendingAcs {
    fn new() -> Self {
        Self {
            runs: BTreeMap::new(),
            payload_size: 2,
            timer: None,
        }
    }

    fn contains(&self, id: u64) -> bool {
        self.runs
            .range(..=id)
            .next_back()
            .map(|(left, fill)| id < left + fill)
            .unwrap_or(false)
    }

    /// Admin-record size for the current runs: one typecode byte, one
    /// status byte, then an SDNV (gap, fill) pair per run.
    fn compute_size(&self) -> usize {
        let mut size = 2;
        let mut right_edge = 0u64;
        for (&left, &fill) in &self.runs {
            let gap = left - right_edge - 1;
            size += sdnv::encoded_len(gap) + sdnv::encoded_len(fill);
            right_edge = left + fill - 1;
        }
        size
    }

    fn to_entries(&self) -> Vec<AcsEntry> {
        let mut entries = Vec::with_capacity(self.runs.len());
        let mut right_edge = 0u64;
        for (&left, &fill) in &self.runs {
            entries.push(AcsEntry {
                gap: left - right_edge - 1,
                fill,
            });
            right_edge = left + fill - 1;
        }
        entries
    }
}

/// Per-route overrides of the ACS parameters, longest match wins.
struct RouteParams {
    pattern: EidPattern,
    enabled: bool,
    delay: u32,
    size: u32,
    match_len: usize,
}

pub struct AcsParams {
    pub enabled: bool,
    pub default_delay: u32,
    pub default_size: u32,
    routes: Vec<RouteParams>,
    revision: u32,
}

impl AcsParams {
    pub fn new(enabled: bool, default_delay: u32, default_size: u32) -> Self {
        Self {
            enabled,
            default_delay,
            default_size,
            routes: Vec::new(),
            revision: 0,
        }
    }

    pub fn set_route(&mut self, pattern: EidPattern, enabled: bool, delay: u32, size: u32) {
        let match_len = pattern.match_len();
        self.routes.retain(|r| r.pattern != pattern);
        self.routes.push(RouteParams {
            pattern,
            enabled,
            delay,
            size,
            match_len,
        });
        self.routes.sort_by_key(|r| std::cmp::Reverse(r.match_len));
        self.revision += 1;
    }

    pub fn delete_route(&mut self, pattern: &EidPattern) -> bool {
        let before = self.routes.len();
        self.routes.retain(|r| &r.pattern != pattern);
        let removed = self.routes.len() != before;
        if removed {
            self.revision += 1;
        }
        removed
    }

    /// (enabled, delay, size) for an endpoint, longest match first.
    pub fn lookup(&self, eid: &EndpointId) -> (bool, u32, u32) {
        for route in &self.routes {
            if route.pattern.matches(eid) {
                return (route.enabled, route.delay, route.size);
            }
        }
        (self.enabled, self.default_delay, self.default_size)
    }

    /// Revision counter lets cached lookups detect parameter changes.
    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn dump(&self) -> String {
        let mut out = format!(
            "acs enabled={} delay={} size={}\n",
            self.enabled, self.default_delay, self.default_size
        );
        for route in &self.routes {
            out.push_str(&format!(
                "route {} enabled={} delay={} size={}\n",
                route.pattern, route.enabled, route.delay, route.size
            ));
        }
        out
    }
}

#[derive(Debug, Default, Clone)]
pub struct AcsStats {
    pub accepted: u64,
    pub released: u64,
    pub redundant: u64,
    pub not_found: u64,
    pub generated: u64,
    pub reloaded: u64,
    pub invalid: u64,
    pub events_processed: u64,
}

/// The ACS worker's state: pending signals, parameters, statistics.
pub struct AcsSubsystem {
    pending: HashMap<AcsKey, PendingAcs>,
    pub params: AcsParams,
    pub stats: AcsStats,
}

pub struct InsertOutcome {
    pub op: InsertOp,
    pub payload_size: usize,
    /// Encoded size reached the per-route max; flush now.
    pub should_flush: bool,
    /// First id for this key since the last flush; arm the delay timer.
    pub first_of_signal: bool,
}

impl AcsSubsystem {
    pub fn new(params: AcsParams) -> Self {
        Self {
            pending: HashMap::new(),
            params,
            stats: AcsStats::default(),
        }
    }

    /// Fold one custody id into the pending signal for `key`.
    pub fn insert(&mut self, key: &AcsKey, custody_id: u64) -> InsertOutcome {
        let (_, _, max_size) = self.params.lookup(&key.custodian);
        let pacs = self
            .pending
            .entry(key.clone())
            .or_insert_with(PendingAcs::new);
        let first_of_signal = pacs.runs.is_empty();

        let op = if pacs.contains(custody_id) {
            self.stats.redundant += 1;
            InsertOp::Noop
        } else {
            let op = Self::apply(pacs, custody_id);
            pacs.payload_size = pacs.compute_size();
            self.stats.accepted += 1;
            op
        };

        let should_flush = max_size > 0 && pacs.payload_size >= max_size as usize;
        debug!(%key, custody_id, ?op, size = pacs.payload_size, "acs insert");
        InsertOutcome {
            op,
            payload_size: pacs.payload_size,
            should_flush,
            first_of_signal: first_of_signal && op != InsertOp::Noop,
        }
    }

    fn apply(pacs: &mut PendingAcs, id: u64) -> InsertOp {
        if pacs.runs.is_empty() {
            pacs.runs.insert(id, 1);
            return InsertOp::InsertFirst;
        }
        // run ending exactly at id-1 extends forward
        if let Some((&left, &fill)) = pacs.runs.range(..=id).next_back() {
            if left + fill == id {
                *pacs.runs.get_mut(&left).expect("run exists") = fill + 1;
                // extending may have closed the gap to the next run
                if let Some(&next_fill) = pacs.runs.get(&(id + 1)) {
                    pacs.runs.remove(&(id + 1));
                    *pacs.runs.get_mut(&left).expect("run exists") += next_fill;
                }
                return InsertOp::ExtendEntry;
            }
        }
        // run starting exactly at id+1 grows backward
        if let Some(&fill) = pacs.runs.get(&(id + 1)) {
            pacs.runs.remove(&(id + 1));
            pacs.runs.insert(id, fill + 1);
            return InsertOp::PrependEntry;
        }
        let at_end = pacs
            .runs
            .keys()
            .next_back()
            .map(|&left| id > left)
            .unwrap_or(false);
        pacs.runs.insert(id, 1);
        if at_end {
            InsertOp::InsertAtEnd
        } else {
            InsertOp::Insert
        }
    }

    /// Emit and clear the pending signal for `key`. The payload holds
    /// exactly the ids inserted since the last flush, ascending.
    pub fn flush(&mut self, key: &AcsKey) -> Option<AcsPayload> {
        let pacs = self.pending.get_mut(key)?;
        if pacs.runs.is_empty() {
            return None;
        }
        let payload = AcsPayload {
            succeeded: key.succeeded,
            reason: key.reason,
            entries: pacs.to_entries(),
        };
        if let Some(timer) = pacs.timer.take() {
            timer.cancel();
        }
        self.pending.remove(key);
        self.stats.generated += 1;
        Some(payload)
    }

    /// Remember the delay-timer token so a size-triggered flush can
    /// cancel it.
    pub fn set_timer(&mut self, key: &AcsKey, token: TimerToken) {
        if let Some(pacs) = self.pending.get_mut(key) {
            if let Some(old) = pacs.timer.replace(token) {
                old.cancel();
            }
        } else {
            token.cancel();
        }
    }

    pub fn pending_size(&self, key: &AcsKey) -> Option<usize> {
        self.pending.get(key).map(|p| p.payload_size)
    }

    pub fn pending_keys(&self) -> Vec<AcsKey> {
        self.pending.keys().cloned().collect()
    }

    /// Durable image for `key`, captured after every delta.
    pub fn record(&self, key: &AcsKey) -> Option<PendingAcsRecord> {
        let pacs = self.pending.get(key)?;
        Some(PendingAcsRecord {
            custodian: key.custodian.clone(),
            succeeded: key.succeeded,
            reason: key.reason,
            runs: pacs.runs.iter().map(|(&l, &f)| (l, f)).collect(),
        })
    }

    /// Reload pending signals at boot. The caller flushes them
    /// immediately afterwards.
    pub fn load(&mut self, records: Vec<PendingAcsRecord>) {
        for record in records {
            let key = AcsKey {
                custodian: record.custodian.clone(),
                succeeded: record.succeeded,
                reason: record.reason,
            };
            let mut pacs = PendingAcs::new();
            pacs.runs = record.runs.into_iter().collect();
            pacs.payload_size = pacs.compute_size();
            self.pending.insert(key, pacs);
            self.stats.reloaded += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AcsKey {
        AcsKey::succeeded(EndpointId::ipn(9, 0))
    }

    fn subsystem() -> AcsSubsystem {
        AcsSubsystem::new(AcsParams::new(true, 10, 500))
    }

    #[test]
    fn test_merge_scenario() {
        // ids 1, 2, 4: two runs (fill=2, gap=0) and (fill=1, gap=1)
        let mut acs = subsystem();
        let k = key();
        assert_eq!(acs.insert(&k, 1).op, InsertOp::InsertFirst);
        assert_eq!(acs.insert(&k, 2).op, InsertOp::ExtendEntry);
        assert_eq!(acs.insert(&k, 4).op, InsertOp::InsertAtEnd);

        let payload = acs.flush(&k).unwrap();
        assert_eq!(payload.entries.len(), 2);
        assert_eq!(payload.entries[0], AcsEntry { gap: 0, fill: 2 });
        assert_eq!(payload.entries[1], AcsEntry { gap: 1, fill: 1 });
        assert_eq!(payload.custody_ids(), vec![1, 2, 4]);
        assert_eq!(acs.stats.generated, 1);
    }

    #[test]
    fn test_gap_close_merges_runs() {
        let mut acs = subsystem();
        let k = key();
        acs.insert(&k, 1);
        acs.insert(&k, 3);
        // 2 closes the gap; a single run remains
        assert_eq!(acs.insert(&k, 2).op, InsertOp::ExtendEntry);
        let payload = acs.flush(&k).unwrap();
        assert_eq!(payload.entries, vec![AcsEntry { gap: 0, fill: 3 }]);
    }

    #[test]
    fn test_prepend_and_redundant() {
        let mut acs = subsystem();
        let k = key();
        acs.insert(&k, 5);
        assert_eq!(acs.insert(&k, 4).op, InsertOp::PrependEntry);
        assert_eq!(acs.insert(&k, 4).op, InsertOp::Noop);
        assert_eq!(acs.stats.redundant, 1);
        assert_eq!(acs.flush(&k).unwrap().custody_ids(), vec![4, 5]);
    }

    #[test]
    fn test_flush_resets_signal() {
        let mut acs = subsystem();
        let k = key();
        acs.insert(&k, 1);
        acs.flush(&k).unwrap();
        assert!(acs.flush(&k).is_none());
        // ids after a flush start a fresh signal
        let outcome = acs.insert(&k, 7);
        assert_eq!(outcome.op, InsertOp::InsertFirst);
        assert!(outcome.first_of_signal);
        assert_eq!(acs.flush(&k).unwrap().custody_ids(), vec![7]);
    }

    #[test]
    fn test_size_threshold_triggers_flush() {
        let mut acs = AcsSubsystem::new(AcsParams::new(true, 10, 6));
        let k = key();
        assert!(!acs.insert(&k, 1).should_flush);
        // disjoint ids grow the encoding until it crosses 6 bytes
        assert!(acs.insert(&k, 10).should_flush || acs.insert(&k, 20).should_flush);
    }

    #[test]
    fn test_route_override_longest_match() {
        let mut params = AcsParams::new(true, 10, 500);
        params.set_route(EidPattern::parse("ipn:9.*").unwrap(), true, 5, 100);
        params.set_route(EidPattern::parse("ipn:9.0").unwrap(), false, 1, 50);
        let (enabled, delay, size) = params.lookup(&EndpointId::ipn(9, 0));
        assert!(!enabled);
        assert_eq!((delay, size), (1, 50));
        let (enabled, delay, _) = params.lookup(&EndpointId::ipn(9, 7));
        assert!(enabled);
        assert_eq!(delay, 5);
        let (enabled, ..) = params.lookup(&EndpointId::ipn(3, 0));
        assert!(enabled);
        let rev = params.revision();
        assert!(params.delete_route(&EidPattern::parse("ipn:9.0").unwrap()));
        assert!(params.revision() > rev);
    }

    #[test]
    fn test_reload_roundtrip() {
        let mut acs = subsystem();
        let k = key();
        acs.insert(&k, 1);
        acs.insert(&k, 2);
        acs.insert(&k, 4);
        let record = acs.record(&k).unwrap();

        let mut restarted = subsystem();
        restarted.load(vec![record]);
        assert_eq!(restarted.stats.reloaded, 1);
        assert_eq!(restarted.flush(&k).unwrap().custody_ids(), vec![1, 2, 4]);
    }
}
