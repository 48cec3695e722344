// Links and contacts
//
// A link names a neighbor reachable through one convergence layer. At
// most one contact is bound to a link at a time and its lifetime is
// contained in the link's. The main worker serializes state
// transitions; everyone else reads through the manager's lock.

use crate::bundle::BundleRef;
use crate::error::{DtnError, Result};
use crate::naming::EndpointId;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    AlwaysOn,
    OnDemand,
    Scheduled,
    Opportunistic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Unavailable,
    Available,
    Opening,
    Open,
    Closed,
}

/// An active contact window on a link.
#[derive(Debug, Clone)]
pub struct Contact {
    pub started: Instant,
}

#[derive(Debug, Default, Clone)]
pub struct LinkStats {
    pub bundles_queued: u64,
    pub bundles_transmitted: u64,
    pub bundles_cancelled: u64,
    pub bytes_transmitted: u64,
}

#[derive(Debug)]
struct LinkInner {
    state: LinkState,
    contact: Option<Contact>,
    queue: VecDeque<BundleRef>,
    queued_ids: HashSet<u64>,
    inflight: HashSet<u64>,
    stats: LinkStats,
}

pub struct Link {
    pub name: String,
    pub link_type: LinkType,
    pub cl_name: String,
    pub nexthop: String,
    pub remote_eid: EndpointId,
    /// Saved to the link table when persistent_links is on.
    pub persistent: bool,
    /// True when recreated from the link table at boot.
    pub reincarnated: bool,
    inner: Mutex<LinkInner>,
}

pub type LinkRef = Arc<Link>;

impl Link {
    pub fn new(
        name: &str,
        link_type: LinkType,
        cl_name: &str,
        nexthop: &str,
        remote_eid: EndpointId,
    ) -> LinkRef {
        Arc::new(Self {
            name: name.to_string(),
            link_type,
            cl_name: cl_name.to_string(),
            nexthop: nexthop.to_string(),
            remote_eid,
            persistent: link_type != LinkType::Opportunistic,
            reincarnated: false,
            inner: Mutex::new(LinkInner {
                state: LinkState::Unavailable,
                contact: None,
                queue: VecDeque::new(),
                queued_ids: HashSet::new(),
                inflight: HashSet::new(),
                stats: LinkStats::default(),
            }),
        })
    }

    pub fn state(&self) -> LinkState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    /// Apply a state transition, validating it against the machine.
    pub fn set_state(&self, next: LinkState) -> Result<()> {
        use LinkState::*;
        let mut inner = self.inner.lock();
        let current = inner.state;
        let allowed = matches!(
            (current, next),
            (Unavailable, Available)
                | (Available, Opening)
                | (Available, Unavailable)
                | (Opening, Open)
                | (Opening, Unavailable)
                | (Open, Closed)
                | (Open, Unavailable)
                | (Closed, Available)
                | (Closed, Unavailable)
                | (Unavailable, Opening)
        );
        if !allowed && current != next {
            return Err(DtnError::Link(format!(
                "link {}: bad transition {:?} -> {:?}",
                self.name, current, next
            )));
        }
        if current != next {
            info!(link = %self.name, from = ?current, to = ?next, "link state change");
        }
        inner.state = next;
        Ok(())
    }

    /// Bind a contact; only one may exist at a time.
    pub fn open_contact(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.contact.is_some() {
            return Err(DtnError::Link(format!(
                "link {} already has a contact",
                self.name
            )));
        }
        inner.contact = Some(Contact {
            started: Instant::now(),
        });
        Ok(())
    }

    pub fn close_contact(&self) -> Option<Contact> {
        self.inner.lock().contact.take()
    }

    pub fn has_contact(&self) -> bool {
        self.inner.lock().contact.is_some()
    }

    /// Queue a bundle for transmission. False if already queued.
    pub fn enqueue(&self, bundle: BundleRef) -> bool {
        let mut inner = self.inner.lock();
        if inner.queued_ids.contains(&bundle.id) || inner.inflight.contains(&bundle.id) {
            return false;
        }
        inner.queued_ids.insert(bundle.id);
        inner.queue.push_back(bundle);
        inner.stats.bundles_queued += 1;
        true
    }

    /// Front of the queue without popping; used to re-kick a CL.
    pub fn peek_queued(&self) -> Option<BundleRef> {
        self.inner.lock().queue.front().cloned()
    }

    /// Pop the next queued bundle and move it to the in-flight set.
    pub fn pop_queued(&self) -> Option<BundleRef> {
        let mut inner = self.inner.lock();
        let bundle = inner.queue.pop_front()?;
        inner.queued_ids.remove(&bundle.id);
        inner.inflight.insert(bundle.id);
        Some(bundle)
    }

    pub fn finish_inflight(&self, bundle_id: u64, bytes: u64, success: bool) {
        let mut inner = self.inner.lock();
        inner.inflight.remove(&bundle_id);
        if success {
            inner.stats.bundles_transmitted += 1;
            inner.stats.bytes_transmitted += bytes;
        } else {
            inner.stats.bundles_cancelled += 1;
        }
    }

    pub fn remove_queued(&self, bundle_id: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.queued_ids.remove(&bundle_id) {
            inner.queue.retain(|b| b.id != bundle_id);
            true
        } else {
            false
        }
    }

    /// Drop every queued bundle, returning them for re-routing.
    pub fn clear_queue(&self) -> Vec<BundleRef> {
        let mut inner = self.inner.lock();
        inner.queued_ids.clear();
        inner.queue.drain(..).collect()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn inflight_len(&self) -> usize {
        self.inner.lock().inflight.len()
    }

    pub fn stats(&self) -> LinkStats {
        self.inner.lock().stats.clone()
    }

    pub fn record(&self) -> LinkRecord {
        LinkRecord {
            name: self.name.clone(),
            link_type: self.link_type,
            cl_name: self.cl_name.clone(),
            nexthop: self.nexthop.clone(),
            remote_eid: self.remote_eid.clone(),
        }
    }
}

/// Durable representation in the links table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRecord {
    pub name: String,
    pub link_type: LinkType,
    pub cl_name: String,
    pub nexthop: String,
    pub remote_eid: EndpointId,
}

impl LinkRecord {
    /// Rebuild the link at boot.
    pub fn reincarnate(&self) -> LinkRef {
        let link = Link::new(
            &self.name,
            self.link_type,
            &self.cl_name,
            &self.nexthop,
            self.remote_eid.clone(),
        );
        // Arc::new just happened; get_mut cannot fail
        let mut link = link;
        Arc::get_mut(&mut link).expect("fresh link").reincarnated = true;
        link
    }
}

/// Process-wide link set. Reader-writer locked; the main worker is the
/// only state-transition driver.
#[derive(Default)]
pub struct ContactManager {
    links: RwLock<HashMap<String, LinkRef>>,
}

impl ContactManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_link(&self, link: LinkRef) -> Result<()> {
        let mut links = self.links.write();
        if links.contains_key(&link.name) {
            return Err(DtnError::AlreadyExists(format!("link {}", link.name)));
        }
        links.insert(link.name.clone(), link);
        Ok(())
    }

    pub fn del_link(&self, name: &str) -> Result<LinkRef> {
        self.links
            .write()
            .remove(name)
            .ok_or_else(|| DtnError::NotFound(format!("link {}", name)))
    }

    pub fn find_link(&self, name: &str) -> Option<LinkRef> {
        self.links.read().get(name).cloned()
    }

    pub fn links(&self) -> Vec<LinkRef> {
        self.links.read().values().cloned().collect()
    }

    /// Links whose remote endpoint matches the destination's node.
    pub fn links_for_destination(&self, dest: &EndpointId) -> Vec<LinkRef> {
        self.links
            .read()
            .values()
            .filter(|l| l.remote_eid.same_node(dest))
            .cloned()
            .collect()
    }

    pub fn records(&self) -> Vec<LinkRecord> {
        self.links
            .read()
            .values()
            .filter(|l| l.persistent)
            .map(|l| l.record())
            .collect()
    }

    /// Recreate persisted links, skipping opportunistic ones.
    pub fn reincarnate_all(&self, records: Vec<LinkRecord>) -> usize {
        let mut count = 0;
        for record in records {
            if record.link_type == LinkType::Opportunistic {
                continue;
            }
            let link = record.reincarnate();
            match self.add_link(link) {
                Ok(()) => count += 1,
                Err(e) => warn!("skipping link reincarnation: {}", e),
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{Bundle, Payload};

    fn test_link() -> LinkRef {
        Link::new(
            "ltp-peer",
            LinkType::AlwaysOn,
            "ltp",
            "10.0.0.2:1113",
            EndpointId::ipn(2, 0),
        )
    }

    fn test_bundle(id: u64) -> BundleRef {
        Bundle::builder(EndpointId::ipn(1, 1), EndpointId::ipn(2, 1))
            .payload(Payload::in_memory(vec![0; 8]))
            .build(id)
    }

    #[test]
    fn test_state_machine_rejects_bad_transitions() {
        let link = test_link();
        assert_eq!(link.state(), LinkState::Unavailable);
        assert!(link.set_state(LinkState::Open).is_err());
        link.set_state(LinkState::Available).unwrap();
        link.set_state(LinkState::Opening).unwrap();
        link.set_state(LinkState::Open).unwrap();
        link.set_state(LinkState::Closed).unwrap();
        link.set_state(LinkState::Available).unwrap();
    }

    #[test]
    fn test_single_contact_per_link() {
        let link = test_link();
        link.open_contact().unwrap();
        assert!(link.open_contact().is_err());
        assert!(link.close_contact().is_some());
        assert!(link.open_contact().is_ok());
    }

    #[test]
    fn test_queue_dedups_and_tracks_inflight() {
        let link = test_link();
        let bundle = test_bundle(1);
        assert!(link.enqueue(bundle.clone()));
        assert!(!link.enqueue(bundle.clone()));
        let popped = link.pop_queued().unwrap();
        assert_eq!(popped.id, 1);
        // still in-flight, so re-enqueue is refused
        assert!(!link.enqueue(bundle));
        link.finish_inflight(1, 8, true);
        assert_eq!(link.stats().bundles_transmitted, 1);
    }

    #[test]
    fn test_reincarnation_skips_opportunistic() {
        let manager = ContactManager::new();
        let records = vec![
            LinkRecord {
                name: "keep".into(),
                link_type: LinkType::OnDemand,
                cl_name: "ltp".into(),
                nexthop: "a:1".into(),
                remote_eid: EndpointId::ipn(2, 0),
            },
            LinkRecord {
                name: "skip".into(),
                link_type: LinkType::Opportunistic,
                cl_name: "ltp".into(),
                nexthop: "b:1".into(),
                remote_eid: EndpointId::ipn(3, 0),
            },
        ];
        assert_eq!(manager.reincarnate_all(records), 1);
        assert!(manager.find_link("keep").unwrap().reincarnated);
        assert!(manager.find_link("skip").is_none());
    }
}
