// Registrations
//
// A registration binds an endpoint pattern to a local delivery target.
// Variants are a closed set; the admin variants own all locally
// destined administrative traffic. Delivery to a registration is
// at-most-once, enforced by a per-registration recent-delivery set.

pub mod admin;

pub use admin::{handle_admin_bundle, AdminContext, AdminDisposition};

use crate::bundle::{BundleRef, Gbof};
use crate::error::{DtnError, Result};
use crate::naming::{EidPattern, EndpointId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Regid 0 is the admin registration; 1 the IPN echo responder.
pub const ADMIN_REGID: u32 = 0;
pub const IPN_ECHO_REGID: u32 = 1;
const FIRST_DYNAMIC_REGID: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureAction {
    Drop,
    Defer,
    Exec,
    File,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFlags {
    pub publish: bool,
    pub subscribe: bool,
    pub custody: bool,
}

impl SessionFlags {
    /// Publish-only session registrations never receive bundles.
    pub fn receives_bundles(&self) -> bool {
        !(self.publish && !self.subscribe)
    }
}

/// Closed set of registration kinds; no downcasting anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegVariant {
    Admin,
    AdminIpn,
    Api,
    Ping,
    IpnEcho,
    Session,
}

#[derive(Debug, Default)]
struct RegState {
    recent: HashSet<Gbof>,
    /// API variant: undelivered queue plus unacknowledged window.
    queue: VecDeque<BundleRef>,
    unacked: HashSet<u64>,
    delivered: u64,
    suppressed: u64,
}

pub struct Registration {
    pub regid: u32,
    pub endpoint: EidPattern,
    pub variant: RegVariant,
    pub failure_action: FailureAction,
    /// Seconds the registration survives without a bound client.
    pub expiration: u32,
    pub session_flags: SessionFlags,
    /// Max unacknowledged deliveries an API client may hold.
    pub ack_window: usize,
    active: Mutex<bool>,
    state: Mutex<RegState>,
}

pub type RegRef = Arc<Registration>;

pub enum DeliveryOutcome {
    Delivered,
    Duplicate,
    Refused,
}

impl Registration {
    pub fn new(regid: u32, endpoint: EidPattern, variant: RegVariant) -> RegRef {
        Arc::new(Self {
            regid,
            endpoint,
            variant,
            failure_action: FailureAction::Defer,
            expiration: 0,
            session_flags: SessionFlags::default(),
            ack_window: 64,
            active: Mutex::new(true),
            state: Mutex::new(RegState::default()),
        })
    }

    pub fn session(regid: u32, endpoint: EidPattern, flags: SessionFlags) -> RegRef {
        Arc::new(Self {
            regid,
            endpoint,
            variant: RegVariant::Session,
            failure_action: FailureAction::Defer,
            expiration: 0,
            session_flags: flags,
            ack_window: 64,
            active: Mutex::new(true),
            state: Mutex::new(RegState::default()),
        })
    }

    pub fn is_active(&self) -> bool {
        *self.active.lock()
    }

    pub fn set_active(&self, active: bool) {
        *self.active.lock() = active;
    }

    /// Deliver with at-most-once semantics. Duplicates (by GBOF) are
    /// reported, not queued. API deliveries respect the ack window.
    pub fn deliver(&self, bundle: &BundleRef) -> DeliveryOutcome {
        if !self.session_flags.receives_bundles() {
            return DeliveryOutcome::Refused;
        }
        let mut state = self.state.lock();
        if !state.recent.insert(bundle.gbof()) {
            state.suppressed += 1;
            return DeliveryOutcome::Duplicate;
        }
        state.delivered += 1;
        if self.variant == RegVariant::Api {
            state.queue.push_back(bundle.clone());
        }
        DeliveryOutcome::Delivered
    }

    /// API client poll: next bundle, entering the unacked window.
    pub fn poll(&self) -> Option<BundleRef> {
        let mut state = self.state.lock();
        if state.unacked.len() >= self.ack_window {
            return None;
        }
        let bundle = state.queue.pop_front()?;
        state.unacked.insert(bundle.id);
        Some(bundle)
    }

    pub fn ack(&self, bundle_id: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.unacked.remove(&bundle_id) {
            Ok(())
        } else {
            Err(DtnError::Registration(format!(
                "regid {}: ack for unknown bundle {}",
                self.regid, bundle_id
            )))
        }
    }

    pub fn delivered_count(&self) -> u64 {
        self.state.lock().delivered
    }

    pub fn suppressed_count(&self) -> u64 {
        self.state.lock().suppressed
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn record(&self) -> RegRecord {
        RegRecord {
            regid: self.regid,
            endpoint: self.endpoint.clone(),
            variant: self.variant,
            failure_action: self.failure_action,
            expiration: self.expiration,
            session_flags: self.session_flags,
        }
    }
}

/// Durable representation in the registrations table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegRecord {
    pub regid: u32,
    pub endpoint: EidPattern,
    pub variant: RegVariant,
    pub failure_action: FailureAction,
    pub expiration: u32,
    pub session_flags: SessionFlags,
}

pub struct RegistrationTable {
    regs: RwLock<HashMap<u32, RegRef>>,
    next_regid: AtomicU32,
}

impl Default for RegistrationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrationTable {
    pub fn new() -> Self {
        Self {
            regs: RwLock::new(HashMap::new()),
            next_regid: AtomicU32::new(FIRST_DYNAMIC_REGID),
        }
    }

    /// Install the admin registration (service 0 for ipn schemes) and
    /// the IPN echo responder on its configured service number.
    pub fn install_admin(&self, local_eid: &EndpointId, ipn_echo_service: u64) {
        match local_eid {
            EndpointId::Ipn { node, .. } => {
                let _ = self.add(Registration::new(
                    ADMIN_REGID,
                    EidPattern::Exact(EndpointId::ipn(*node, 0)),
                    RegVariant::AdminIpn,
                ));
                let _ = self.add(Registration::new(
                    IPN_ECHO_REGID,
                    EidPattern::Exact(EndpointId::ipn(*node, ipn_echo_service)),
                    RegVariant::IpnEcho,
                ));
            }
            other => {
                let _ = self.add(Registration::new(
                    ADMIN_REGID,
                    EidPattern::Exact(other.clone()),
                    RegVariant::Admin,
                ));
            }
        }
    }

    pub fn next_regid(&self) -> u32 {
        self.next_regid.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add(&self, reg: RegRef) -> Result<()> {
        let mut regs = self.regs.write();
        if regs.contains_key(&reg.regid) {
            return Err(DtnError::AlreadyExists(format!("regid {}", reg.regid)));
        }
        regs.insert(reg.regid, reg);
        Ok(())
    }

    pub fn remove(&self, regid: u32) -> Result<RegRef> {
        self.regs
            .write()
            .remove(&regid)
            .ok_or_else(|| DtnError::NotFound(format!("regid {}", regid)))
    }

    pub fn get(&self, regid: u32) -> Option<RegRef> {
        self.regs.read().get(&regid).cloned()
    }

    /// Every registration whose pattern matches the destination and
    /// which can receive bundles. The most specific match sorts first.
    pub fn matching(&self, dest: &EndpointId) -> Vec<RegRef> {
        let mut matches: Vec<RegRef> = self
            .regs
            .read()
            .values()
            .filter(|r| r.endpoint.matches(dest) && r.session_flags.receives_bundles())
            .cloned()
            .collect();
        matches.sort_by_key(|r| std::cmp::Reverse(r.endpoint.match_len()));
        matches
    }

    pub fn records(&self) -> Vec<RegRecord> {
        self.regs.read().values().map(|r| r.record()).collect()
    }

    pub fn len(&self) -> usize {
        self.regs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{Bundle, Payload};

    fn test_bundle(id: u64, seq: u64) -> BundleRef {
        Bundle::builder(EndpointId::ipn(1, 1), EndpointId::ipn(2, 1))
            .creation_ts(500, seq)
            .payload(Payload::in_memory(vec![0; 4]))
            .build(id)
    }

    #[test]
    fn test_duplicate_delivery_suppressed() {
        let reg = Registration::new(10, EidPattern::parse("ipn:2.1").unwrap(), RegVariant::Api);
        let bundle = test_bundle(1, 0);
        let dupe = test_bundle(2, 0);
        assert!(matches!(reg.deliver(&bundle), DeliveryOutcome::Delivered));
        assert!(matches!(reg.deliver(&dupe), DeliveryOutcome::Duplicate));
        assert_eq!(reg.delivered_count(), 1);
        assert_eq!(reg.suppressed_count(), 1);
    }

    #[test]
    fn test_publish_only_session_refuses() {
        let reg = Registration::session(
            11,
            EidPattern::parse("imc:9.*").unwrap(),
            SessionFlags {
                publish: true,
                subscribe: false,
                custody: false,
            },
        );
        let bundle = test_bundle(1, 0);
        assert!(matches!(reg.deliver(&bundle), DeliveryOutcome::Refused));
    }

    #[test]
    fn test_api_ack_window() {
        let reg = Registration::new(12, EidPattern::parse("ipn:2.1").unwrap(), RegVariant::Api);
        for i in 0..3 {
            reg.deliver(&test_bundle(i + 1, i));
        }
        let first = reg.poll().unwrap();
        assert!(reg.ack(first.id).is_ok());
        assert!(reg.ack(first.id).is_err());
    }

    #[test]
    fn test_matching_prefers_specific() {
        let table = RegistrationTable::new();
        table
            .add(Registration::new(
                10,
                EidPattern::parse("ipn:2.*").unwrap(),
                RegVariant::Api,
            ))
            .unwrap();
        table
            .add(Registration::new(
                11,
                EidPattern::parse("ipn:2.1").unwrap(),
                RegVariant::Api,
            ))
            .unwrap();
        let matches = table.matching(&EndpointId::ipn(2, 1));
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].regid, 11);
    }

    #[test]
    fn test_admin_install() {
        let table = RegistrationTable::new();
        table.install_admin(&EndpointId::ipn(7, 0), 2047);
        assert!(table.get(ADMIN_REGID).is_some());
        assert!(table.get(IPN_ECHO_REGID).is_some());
        // admin traffic lands on service 0, pings on the echo service,
        // and other services stay free for applications
        assert_eq!(table.matching(&EndpointId::ipn(7, 0)).len(), 1);
        assert_eq!(table.matching(&EndpointId::ipn(7, 2047)).len(), 1);
        assert!(table.matching(&EndpointId::ipn(7, 42)).is_empty());
    }
}
