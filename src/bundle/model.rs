// Canonical bundle record
//
// Immutable identity fields live directly on `Bundle`; everything a
// worker may mutate after insertion (custodian, forwarding log, timer
// handles, datastore flags) sits behind the per-bundle lock. The
// durable serializer computes record sizes before encoding, so
// variable-length fields must only change under that lock.

use crate::naming::EndpointId;
use crate::timer::TimerToken;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Unix timestamp of the DTN epoch, 2000-01-01T00:00:00Z.
pub const DTN_TIME_EPOCH_UNIX: u64 = 946_684_800;

/// Seconds since the DTN epoch, now.
pub fn dtn_time_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().saturating_sub(DTN_TIME_EPOCH_UNIX))
        .unwrap_or(0)
}

/// Creation timestamp: seconds (BP6) or milliseconds (BP7) since the
/// DTN epoch, plus a sequence number unique within that tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BundleTimestamp {
    pub dtn_time: u64,
    pub seq: u64,
}

impl BundleTimestamp {
    pub fn new(dtn_time: u64, seq: u64) -> Self {
        Self { dtn_time, seq }
    }

    /// Creation time in seconds since the DTN epoch, normalizing the
    /// BP7 millisecond representation.
    pub fn secs(&self, bp_version: u8) -> u64 {
        if bp_version >= 7 {
            self.dtn_time / 1000
        } else {
            self.dtn_time
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Bulk = 0,
    Normal = 1,
    Expedited = 2,
}

/// Global bundle-or-fragment identifier. Two arrivals with an equal
/// GBOF are the same bundle (or the same fragment of it).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gbof {
    pub source: EndpointId,
    pub creation_ts: BundleTimestamp,
    pub is_fragment: bool,
    pub frag_offset: u64,
    pub frag_length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardingAction {
    ForwardAction,
    CopyAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardingState {
    None,
    QueuedForLink,
    InFlight,
    Transmitted,
    TransmitFailed,
    CustodyTimeout,
    PendingDelivery,
    Delivered,
    Cancelled,
    SuppressedDelivery,
}

/// One append-only forwarding-log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingInfo {
    /// Link name or registration endpoint the entry refers to.
    pub target: String,
    pub action: ForwardingAction,
    pub state: ForwardingState,
    /// Seconds since the DTN epoch when the state was last set.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionBlock {
    pub block_type: u8,
    pub flags: u64,
    pub data: Vec<u8>,
}

/// Custody Transfer Enhancement Block contents (BP6). A valid CTEB
/// names the current custodian, which is what makes ACS usable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cteb {
    pub custody_id: u64,
    pub custodian: EndpointId,
}

/// Mutable bundle state guarded by the per-bundle lock.
#[derive(Debug, Default)]
pub struct BundleState {
    pub custodian: EndpointId,
    pub local_custody: bool,
    /// Custody ID allocated when this node took custody (ACS).
    pub local_custody_id: Option<u64>,
    pub cteb: Option<Cteb>,
    pub fwd_log: Vec<ForwardingInfo>,
    pub custody_timers: Vec<TimerToken>,
    pub expiration_timer: Option<TimerToken>,
    pub queued_for_datastore: bool,
    pub in_datastore: bool,
    /// Delivery already suppressed or performed for these regids.
    pub delivered_regids: Vec<u32>,
}

pub struct Bundle {
    /// Process-local id from the wrapping generator.
    pub id: u64,
    pub bp_version: u8,
    pub source: EndpointId,
    pub dest: EndpointId,
    pub replyto: EndpointId,
    /// Custodian as received on the wire; the live value is in state.
    pub orig_custodian: EndpointId,
    pub creation_ts: BundleTimestamp,
    /// Lifetime in seconds.
    pub lifetime: u64,
    pub payload: crate::bundle::Payload,
    pub blocks: Vec<ExtensionBlock>,
    pub priority: Priority,
    pub is_fragment: bool,
    pub is_admin: bool,
    pub custody_requested: bool,
    pub receive_rcpt: bool,
    pub custody_rcpt: bool,
    pub forward_rcpt: bool,
    pub delivery_rcpt: bool,
    pub deletion_rcpt: bool,
    pub ecos_critical: bool,
    pub ecos_streaming: bool,
    pub ecos_ordinal: u8,
    pub singleton_dest: bool,
    pub frag_offset: u64,
    pub frag_length: u64,
    pub orig_length: u64,
    state: Mutex<BundleState>,
}

pub type BundleRef = Arc<Bundle>;

impl Bundle {
    pub fn builder(source: EndpointId, dest: EndpointId) -> BundleBuilder {
        BundleBuilder::new(source, dest)
    }

    pub fn gbof(&self) -> Gbof {
        Gbof {
            source: self.source.clone(),
            creation_ts: self.creation_ts,
            is_fragment: self.is_fragment,
            frag_offset: if self.is_fragment { self.frag_offset } else { 0 },
            frag_length: if self.is_fragment { self.frag_length } else { 0 },
        }
    }

    /// Absolute expiration: creation time + lifetime, in seconds since
    /// the DTN epoch.
    pub fn expiration_dtn_time(&self) -> u64 {
        self.creation_ts.secs(self.bp_version) + self.lifetime
    }

    pub fn expiration_system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(DTN_TIME_EPOCH_UNIX + self.expiration_dtn_time())
    }

    pub fn time_to_expiration(&self) -> Option<Duration> {
        self.expiration_system_time()
            .duration_since(SystemTime::now())
            .ok()
    }

    pub fn expired(&self) -> bool {
        self.time_to_expiration().is_none()
    }

    /// Access the mutable state under the per-bundle lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut BundleState) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state)
    }

    pub fn custodian(&self) -> EndpointId {
        self.state.lock().custodian.clone()
    }

    pub fn local_custody(&self) -> bool {
        self.state.lock().local_custody
    }

    pub fn cteb(&self) -> Option<Cteb> {
        self.state.lock().cteb.clone()
    }

    /// CTEB is only usable for ACS while it still names the custodian
    /// that forwarded us the bundle.
    pub fn cteb_valid(&self) -> bool {
        let state = self.state.lock();
        match &state.cteb {
            Some(cteb) => cteb.custodian == state.custodian,
            None => false,
        }
    }

    /// Append a forwarding-log entry, returning its index.
    pub fn fwd_log_add(
        &self,
        target: &str,
        action: ForwardingAction,
        state: ForwardingState,
    ) -> usize {
        let mut guard = self.state.lock();
        guard.fwd_log.push(ForwardingInfo {
            target: target.to_string(),
            action,
            state,
            timestamp: dtn_time_now(),
        });
        guard.fwd_log.len() - 1
    }

    /// Rewrite the newest entry for `target` to `state`. Returns false
    /// when no entry for the target exists.
    pub fn fwd_log_update(&self, target: &str, state: ForwardingState) -> bool {
        let mut guard = self.state.lock();
        for entry in guard.fwd_log.iter_mut().rev() {
            if entry.target == target {
                entry.state = state;
                entry.timestamp = dtn_time_now();
                return true;
            }
        }
        false
    }

    pub fn fwd_log_state(&self, target: &str) -> Option<ForwardingState> {
        let guard = self.state.lock();
        guard
            .fwd_log
            .iter()
            .rev()
            .find(|e| e.target == target)
            .map(|e| e.state)
    }

    pub fn fwd_log_snapshot(&self) -> Vec<ForwardingInfo> {
        self.state.lock().fwd_log.clone()
    }
}

/// Flat serializable image of a bundle, captured under the bundle lock
/// so variable-length fields (custodian, forwarding log) cannot move
/// between size computation and encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMeta {
    pub id: u64,
    pub bp_version: u8,
    pub source: EndpointId,
    pub dest: EndpointId,
    pub replyto: EndpointId,
    pub custodian: EndpointId,
    pub local_custody: bool,
    pub local_custody_id: Option<u64>,
    pub cteb: Option<Cteb>,
    pub creation_ts: BundleTimestamp,
    pub lifetime: u64,
    pub payload_path: Option<std::path::PathBuf>,
    pub payload_len: u64,
    pub blocks: Vec<ExtensionBlock>,
    pub priority: Priority,
    pub is_fragment: bool,
    pub is_admin: bool,
    pub custody_requested: bool,
    pub receive_rcpt: bool,
    pub custody_rcpt: bool,
    pub forward_rcpt: bool,
    pub delivery_rcpt: bool,
    pub deletion_rcpt: bool,
    pub ecos_critical: bool,
    pub ecos_streaming: bool,
    pub ecos_ordinal: u8,
    pub singleton_dest: bool,
    pub frag_offset: u64,
    pub frag_length: u64,
    pub orig_length: u64,
    pub fwd_log: Vec<ForwardingInfo>,
}

impl Bundle {
    /// Snapshot for the durable store. Taken under the bundle lock.
    pub fn meta(&self) -> BundleMeta {
        let state = self.state.lock();
        BundleMeta {
            id: self.id,
            bp_version: self.bp_version,
            source: self.source.clone(),
            dest: self.dest.clone(),
            replyto: self.replyto.clone(),
            custodian: state.custodian.clone(),
            local_custody: state.local_custody,
            local_custody_id: state.local_custody_id,
            cteb: state.cteb.clone(),
            creation_ts: self.creation_ts,
            lifetime: self.lifetime,
            payload_path: self.payload.file_path(),
            payload_len: self.payload.len(),
            blocks: self.blocks.clone(),
            priority: self.priority,
            is_fragment: self.is_fragment,
            is_admin: self.is_admin,
            custody_requested: self.custody_requested,
            receive_rcpt: self.receive_rcpt,
            custody_rcpt: self.custody_rcpt,
            forward_rcpt: self.forward_rcpt,
            delivery_rcpt: self.delivery_rcpt,
            deletion_rcpt: self.deletion_rcpt,
            ecos_critical: self.ecos_critical,
            ecos_streaming: self.ecos_streaming,
            ecos_ordinal: self.ecos_ordinal,
            singleton_dest: self.singleton_dest,
            frag_offset: self.frag_offset,
            frag_length: self.frag_length,
            orig_length: self.orig_length,
            fwd_log: state.fwd_log.clone(),
        }
    }

    /// Rebuild a bundle from its stored image (datastore reload).
    pub fn from_meta(meta: BundleMeta, payload: crate::bundle::Payload) -> BundleRef {
        let bundle = Bundle {
            id: meta.id,
            bp_version: meta.bp_version,
            source: meta.source,
            dest: meta.dest,
            replyto: meta.replyto,
            orig_custodian: meta.custodian.clone(),
            creation_ts: meta.creation_ts,
            lifetime: meta.lifetime,
            payload,
            blocks: meta.blocks,
            priority: meta.priority,
            is_fragment: meta.is_fragment,
            is_admin: meta.is_admin,
            custody_requested: meta.custody_requested,
            receive_rcpt: meta.receive_rcpt,
            custody_rcpt: meta.custody_rcpt,
            forward_rcpt: meta.forward_rcpt,
            delivery_rcpt: meta.delivery_rcpt,
            deletion_rcpt: meta.deletion_rcpt,
            ecos_critical: meta.ecos_critical,
            ecos_streaming: meta.ecos_streaming,
            ecos_ordinal: meta.ecos_ordinal,
            singleton_dest: meta.singleton_dest,
            frag_offset: meta.frag_offset,
            frag_length: meta.frag_length,
            orig_length: meta.orig_length,
            state: Mutex::new(BundleState {
                custodian: meta.custodian,
                local_custody: meta.local_custody,
                local_custody_id: meta.local_custody_id,
                cteb: meta.cteb,
                fwd_log: meta.fwd_log,
                in_datastore: true,
                ..Default::default()
            }),
        };
        Arc::new(bundle)
    }
}

impl std::fmt::Display for Bundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "bundle id={} {} -> {} ts={}.{}",
            self.id, self.source, self.dest, self.creation_ts.dtn_time, self.creation_ts.seq
        )
    }
}

impl std::fmt::Debug for Bundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// Builder used by the input worker and by tests.
pub struct BundleBuilder {
    bundle: Bundle,
}

impl BundleBuilder {
    fn new(source: EndpointId, dest: EndpointId) -> Self {
        Self {
            bundle: Bundle {
                id: 0,
                bp_version: 6,
                source,
                dest,
                replyto: EndpointId::Null,
                orig_custodian: EndpointId::Null,
                creation_ts: BundleTimestamp::new(dtn_time_now(), 0),
                lifetime: 3600,
                payload: crate::bundle::Payload::empty(),
                blocks: Vec::new(),
                priority: Priority::Normal,
                is_fragment: false,
                is_admin: false,
                custody_requested: false,
                receive_rcpt: false,
                custody_rcpt: false,
                forward_rcpt: false,
                delivery_rcpt: false,
                deletion_rcpt: false,
                ecos_critical: false,
                ecos_streaming: false,
                ecos_ordinal: 0,
                singleton_dest: true,
                frag_offset: 0,
                frag_length: 0,
                orig_length: 0,
                state: Mutex::new(BundleState::default()),
            },
        }
    }

    pub fn bp_version(mut self, version: u8) -> Self {
        self.bundle.bp_version = version;
        self
    }

    pub fn creation_ts(mut self, dtn_time: u64, seq: u64) -> Self {
        self.bundle.creation_ts = BundleTimestamp::new(dtn_time, seq);
        self
    }

    pub fn lifetime(mut self, secs: u64) -> Self {
        self.bundle.lifetime = secs;
        self
    }

    pub fn payload(mut self, payload: crate::bundle::Payload) -> Self {
        self.bundle.payload = payload;
        self
    }

    pub fn replyto(mut self, eid: EndpointId) -> Self {
        self.bundle.replyto = eid;
        self
    }

    pub fn custodian(mut self, eid: EndpointId) -> Self {
        self.bundle.orig_custodian = eid;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.bundle.priority = priority;
        self
    }

    pub fn admin(mut self) -> Self {
        self.bundle.is_admin = true;
        self
    }

    pub fn custody_requested(mut self) -> Self {
        self.bundle.custody_requested = true;
        self
    }

    pub fn delivery_rcpt(mut self) -> Self {
        self.bundle.delivery_rcpt = true;
        self
    }

    pub fn custody_rcpt(mut self) -> Self {
        self.bundle.custody_rcpt = true;
        self
    }

    pub fn ecos_streaming(mut self) -> Self {
        self.bundle.ecos_streaming = true;
        self
    }

    pub fn fragment(mut self, offset: u64, length: u64, orig_length: u64) -> Self {
        debug_assert!(length <= orig_length);
        debug_assert!(offset + length <= orig_length);
        self.bundle.is_fragment = true;
        self.bundle.frag_offset = offset;
        self.bundle.frag_length = length;
        self.bundle.orig_length = orig_length;
        self
    }

    pub fn block(mut self, block: ExtensionBlock) -> Self {
        self.bundle.blocks.push(block);
        self
    }

    pub fn cteb(self, custody_id: u64, custodian: EndpointId) -> Self {
        self.bundle.with_state(|s| {
            s.cteb = Some(Cteb {
                custody_id,
                custodian,
            })
        });
        self
    }

    pub fn build(mut self, id: u64) -> BundleRef {
        self.bundle.id = id;
        let custodian = self.bundle.orig_custodian.clone();
        self.bundle.with_state(|s| s.custodian = custodian);
        Arc::new(self.bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Payload;

    fn test_bundle() -> BundleRef {
        Bundle::builder(EndpointId::ipn(1, 1), EndpointId::ipn(2, 1))
            .payload(Payload::in_memory(vec![0u8; 64]))
            .build(7)
    }

    #[test]
    fn test_gbof_ignores_frag_fields_for_whole_bundles() {
        let bundle = test_bundle();
        let gbof = bundle.gbof();
        assert!(!gbof.is_fragment);
        assert_eq!(gbof.frag_offset, 0);
        assert_eq!(gbof.frag_length, 0);
    }

    #[test]
    fn test_fwd_log_update_targets_newest_entry() {
        let bundle = test_bundle();
        bundle.fwd_log_add(
            "link-a",
            ForwardingAction::ForwardAction,
            ForwardingState::InFlight,
        );
        bundle.fwd_log_add(
            "link-b",
            ForwardingAction::ForwardAction,
            ForwardingState::InFlight,
        );
        assert!(bundle.fwd_log_update("link-a", ForwardingState::Transmitted));
        assert_eq!(
            bundle.fwd_log_state("link-a"),
            Some(ForwardingState::Transmitted)
        );
        assert_eq!(
            bundle.fwd_log_state("link-b"),
            Some(ForwardingState::InFlight)
        );
        assert!(!bundle.fwd_log_update("link-c", ForwardingState::Transmitted));
    }

    #[test]
    fn test_cteb_validity_tracks_custodian() {
        let previous = EndpointId::ipn(9, 0);
        let bundle = Bundle::builder(EndpointId::ipn(1, 1), EndpointId::ipn(2, 1))
            .custodian(previous.clone())
            .cteb(42, previous)
            .build(1);
        assert!(bundle.cteb_valid());
        bundle.with_state(|s| s.custodian = EndpointId::ipn(3, 0));
        assert!(!bundle.cteb_valid());
    }

    #[test]
    fn test_expiration() {
        let bundle = Bundle::builder(EndpointId::ipn(1, 1), EndpointId::ipn(2, 1))
            .creation_ts(dtn_time_now() - 100, 0)
            .lifetime(60)
            .build(1);
        assert!(bundle.expired());

        let live = Bundle::builder(EndpointId::ipn(1, 1), EndpointId::ipn(2, 1))
            .lifetime(3600)
            .build(2);
        assert!(!live.expired());
        assert!(live.time_to_expiration().unwrap().as_secs() > 3500);
    }
}
