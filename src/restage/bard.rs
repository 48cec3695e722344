// Bundle Architectural Restaging Daemon
//
// BARD owns the quota ledger: per quota subject (a source or
// destination node) it tracks how much internal memory/disk a node is
// allowed to hold before overflowing to a restage link, and answers
// reload queries per file, optionally rewriting the destination and
// guaranteeing a minimum remaining TTL.

use crate::bundle::dtn_time_now;
use crate::naming::EndpointId;
use crate::restage::filename::BundleFileDesc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What a quota tracks: bundles from a source node or to a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaKind {
    Src,
    Dst,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuotaSubject {
    pub kind: QuotaKind,
    pub scheme: &'static str,
    pub node: u64,
}

impl QuotaSubject {
    pub fn for_bundle_dst(dst: &EndpointId) -> Option<Self> {
        dst.node_number().map(|node| Self {
            kind: QuotaKind::Dst,
            scheme: if matches!(dst, EndpointId::Imc { .. }) { "imc" } else { "ipn" },
            node,
        })
    }

    pub fn for_bundle_src(src: &EndpointId) -> Option<Self> {
        src.node_number().map(|node| Self {
            kind: QuotaKind::Src,
            scheme: if matches!(src, EndpointId::Imc { .. }) { "imc" } else { "ipn" },
            node,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Quota {
    /// Bytes the node may hold internally before restaging.
    pub internal_bytes: u64,
    /// Bytes allowed on the restage link (0 = unlimited).
    pub external_bytes: u64,
    /// Restage link carrying this subject's overflow.
    pub restage_link: String,
    /// Refuse (rather than restage) overflow when true.
    pub refuse_bundle: bool,
    /// Rewrite reloaded bundles to this destination.
    pub redirect_dest: Option<EndpointId>,
}

#[derive(Debug, Default, Clone)]
struct Usage {
    internal_bytes: u64,
    external_bytes: u64,
}

/// Per-file reload decision.
#[derive(Debug, Clone)]
pub struct ReloadDecision {
    pub accept: bool,
    pub new_dest: Option<EndpointId>,
    /// Reloaded bundles get at least this many seconds of TTL.
    pub ttl_override: u64,
}

pub struct Bard {
    quotas: RwLock<HashMap<QuotaSubject, Quota>>,
    usage: RwLock<HashMap<QuotaSubject, Usage>>,
    ttl_override: u64,
}

impl Bard {
    pub fn new(ttl_override: u64) -> Self {
        Self {
            quotas: RwLock::new(HashMap::new()),
            usage: RwLock::new(HashMap::new()),
            ttl_override,
        }
    }

    pub fn set_quota(&self, subject: QuotaSubject, quota: Quota) {
        self.quotas.write().insert(subject, quota);
    }

    pub fn delete_quota(&self, subject: &QuotaSubject) -> bool {
        self.quotas.write().remove(subject).is_some()
    }

    pub fn quota(&self, subject: &QuotaSubject) -> Option<Quota> {
        self.quotas.read().get(subject).cloned()
    }

    /// Account internal usage as bundles arrive and leave.
    pub fn add_internal(&self, subject: &QuotaSubject, bytes: u64) {
        self.usage
            .write()
            .entry(subject.clone())
            .or_default()
            .internal_bytes += bytes;
    }

    pub fn sub_internal(&self, subject: &QuotaSubject, bytes: u64) {
        if let Some(usage) = self.usage.write().get_mut(subject) {
            usage.internal_bytes = usage.internal_bytes.saturating_sub(bytes);
        }
    }

    pub fn add_external(&self, subject: &QuotaSubject, bytes: u64) {
        self.usage
            .write()
            .entry(subject.clone())
            .or_default()
            .external_bytes += bytes;
    }

    pub fn sub_external(&self, subject: &QuotaSubject, bytes: u64) {
        if let Some(usage) = self.usage.write().get_mut(subject) {
            usage.external_bytes = usage.external_bytes.saturating_sub(bytes);
        }
    }

    /// Decide whether a bundle overflows its quota onto a restage
    /// link. None when the bundle fits internally or carries no quota.
    pub fn should_restage(
        &self,
        src: &EndpointId,
        dst: &EndpointId,
        bytes: u64,
    ) -> Option<(QuotaSubject, String)> {
        let quotas = self.quotas.read();
        let usage = self.usage.read();
        for subject in [
            QuotaSubject::for_bundle_dst(dst),
            QuotaSubject::for_bundle_src(src),
        ]
        .into_iter()
        .flatten()
        {
            if let Some(quota) = quotas.get(&subject) {
                let used = usage.get(&subject).cloned().unwrap_or_default();
                if used.internal_bytes + bytes > quota.internal_bytes && !quota.refuse_bundle {
                    return Some((subject, quota.restage_link.clone()));
                }
            }
        }
        None
    }

    /// Per-file reload query: check external headroom moving back in,
    /// apply the destination rewrite, and stamp the TTL floor.
    pub fn should_reload(&self, desc: &BundleFileDesc) -> ReloadDecision {
        let now = dtn_time_now();
        if desc.remaining_ttl(now) == 0 && self.ttl_override == 0 {
            return ReloadDecision {
                accept: false,
                new_dest: None,
                ttl_override: 0,
            };
        }
        let quotas = self.quotas.read();
        let usage = self.usage.read();
        let subject = QuotaSubject::for_bundle_dst(&desc.dst)
            .filter(|s| quotas.contains_key(s))
            .or_else(|| QuotaSubject::for_bundle_src(&desc.src).filter(|s| quotas.contains_key(s)));
        let new_dest = subject
            .as_ref()
            .and_then(|s| quotas.get(s))
            .and_then(|q| q.redirect_dest.clone());
        // a node still over its internal quota keeps the file parked
        let accept = match subject.as_ref().and_then(|s| quotas.get(s).zip(usage.get(s))) {
            Some((quota, used)) => used.internal_bytes + desc.payload_len <= quota.internal_bytes,
            None => true,
        };
        ReloadDecision {
            accept,
            new_dest,
            ttl_override: self.ttl_override,
        }
    }

    pub fn dump(&self) -> String {
        let quotas = self.quotas.read();
        let usage = self.usage.read();
        let mut out = String::new();
        for (subject, quota) in quotas.iter() {
            let used = usage.get(subject).cloned().unwrap_or_default();
            out.push_str(&format!(
                "{:?} {}:{} internal {}/{} external {}/{} link {}\n",
                subject.kind,
                subject.scheme,
                subject.node,
                used.internal_bytes,
                quota.internal_bytes,
                used.external_bytes,
                quota.external_bytes,
                quota.restage_link
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleTimestamp;

    fn quota(internal: u64) -> Quota {
        Quota {
            internal_bytes: internal,
            external_bytes: 0,
            restage_link: "restage0".to_string(),
            refuse_bundle: false,
            redirect_dest: None,
        }
    }

    fn desc(dst: EndpointId, ttl: u64) -> BundleFileDesc {
        BundleFileDesc {
            src: EndpointId::ipn(5, 1),
            dst,
            creation_ts: BundleTimestamp::new(1000, 0),
            frag_offset: 0,
            frag_length: 0,
            payload_len: 100,
            exp_dtn_time: dtn_time_now() + ttl,
        }
    }

    #[test]
    fn test_overflow_triggers_restage() {
        let bard = Bard::new(86_400);
        let subject = QuotaSubject::for_bundle_dst(&EndpointId::ipn(9, 2)).unwrap();
        bard.set_quota(subject.clone(), quota(1000));
        bard.add_internal(&subject, 950);
        let hit = bard.should_restage(&EndpointId::ipn(5, 1), &EndpointId::ipn(9, 2), 100);
        assert_eq!(hit.unwrap().1, "restage0");
        // under quota: stays internal
        bard.sub_internal(&subject, 900);
        assert!(bard
            .should_restage(&EndpointId::ipn(5, 1), &EndpointId::ipn(9, 2), 100)
            .is_none());
    }

    #[test]
    fn test_reload_respects_quota_headroom() {
        let bard = Bard::new(86_400);
        let subject = QuotaSubject::for_bundle_dst(&EndpointId::ipn(9, 2)).unwrap();
        bard.set_quota(subject.clone(), quota(1000));
        bard.add_internal(&subject, 990);
        let decision = bard.should_reload(&desc(EndpointId::ipn(9, 2), 3600));
        assert!(!decision.accept);
        bard.sub_internal(&subject, 500);
        let decision = bard.should_reload(&desc(EndpointId::ipn(9, 2), 3600));
        assert!(decision.accept);
        assert_eq!(decision.ttl_override, 86_400);
    }

    #[test]
    fn test_reload_rewrites_destination() {
        let bard = Bard::new(0);
        let subject = QuotaSubject::for_bundle_dst(&EndpointId::ipn(9, 2)).unwrap();
        let mut q = quota(u64::MAX);
        q.redirect_dest = Some(EndpointId::ipn(12, 2));
        bard.set_quota(subject, q);
        let decision = bard.should_reload(&desc(EndpointId::ipn(9, 2), 3600));
        assert_eq!(decision.new_dest, Some(EndpointId::ipn(12, 2)));
    }

    #[test]
    fn test_unquoted_subject_reloads_freely() {
        let bard = Bard::new(0);
        let decision = bard.should_reload(&desc(EndpointId::ipn(3, 1), 3600));
        assert!(decision.accept);
    }
}
