// Convergence layers
//
// A convergence layer moves whole bundles across one kind of underlying
// transport. The daemon drives CLs through the `ConvergenceLayer`
// capability trait and CLs call back through `ClEventSink`; there are
// no downcasts. Link options arrive as textual key/value pairs from
// the command surface and each CL parses them into its own record.

pub mod null;

pub use null::NullConvergenceLayer;

use crate::bundle::BundleRef;
use crate::contacts::{LinkRef, LinkState};
use crate::error::Result;
use crate::naming::EndpointId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Textual CL options as given on link/interface creation.
pub type ClOptions = Vec<(String, String)>;

/// Callbacks from a convergence layer into the daemon.
pub trait ClEventSink: Send + Sync {
    /// A complete bundle arrived from a peer.
    fn bundle_received(&self, bundle: BundleRef, link: &str, prev_hop: EndpointId);

    /// Transmission finished for a bundle previously queued on a link.
    fn bundle_transmitted(
        &self,
        bundle: BundleRef,
        link: &str,
        bytes_sent: u64,
        reliably_sent: bool,
        success: bool,
    );

    fn contact_up(&self, link: &str);

    fn contact_down(&self, link: &str, reason: &str);

    fn link_state_change(&self, link: &str, state: LinkState, reason: &str);

    /// The link can accept more bundles; wakes the output worker.
    fn ready_for_bundles(&self, link: &str);
}

pub trait ConvergenceLayer: Send + Sync {
    fn name(&self) -> &'static str;

    fn interface_up(&self, interface: &str, options: &ClOptions) -> Result<()>;

    fn interface_down(&self, interface: &str) -> Result<()>;

    fn init_link(&self, link: &LinkRef, options: &ClOptions) -> Result<()>;

    fn delete_link(&self, link: &LinkRef) -> Result<()>;

    fn reconfigure_link(&self, link: &LinkRef, options: &ClOptions) -> Result<()> {
        let _ = (link, options);
        Err(crate::error::DtnError::InvalidInput(format!(
            "{} links cannot be reconfigured",
            self.name()
        )))
    }

    /// Human-readable link dump for the command surface.
    fn dump_link(&self, link: &LinkRef) -> String;

    fn open_contact(&self, link: &LinkRef) -> Result<()>;

    fn close_contact(&self, link: &LinkRef) -> Result<()>;

    /// A bundle was queued on the link; the CL picks it up with
    /// `Link::pop_queued` when it is ready to transmit.
    fn bundle_queued(&self, link: &LinkRef, bundle: &BundleRef) -> Result<()>;

    /// Backpressure probe driven by the output worker.
    fn ready_for_bundles(&self, link: &LinkRef) -> bool {
        let _ = link;
        true
    }

    /// Option names recognized by `init_link`.
    fn list_link_opts(&self) -> Vec<&'static str>;

    /// Option names recognized by `interface_up`.
    fn list_interface_opts(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn shutdown(&self);
}

/// Registry of convergence layers keyed by name.
#[derive(Default)]
pub struct ClRegistry {
    layers: RwLock<HashMap<&'static str, Arc<dyn ConvergenceLayer>>>,
}

impl ClRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cl: Arc<dyn ConvergenceLayer>) {
        self.layers.write().insert(cl.name(), cl);
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn ConvergenceLayer>> {
        self.layers.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.layers.read().keys().copied().collect()
    }

    pub fn shutdown_all(&self) {
        for cl in self.layers.read().values() {
            cl.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let registry = ClRegistry::new();
        registry.register(Arc::new(NullConvergenceLayer::new()));
        assert!(registry.find("null").is_some());
        assert!(registry.find("ltp").is_none());
        assert_eq!(registry.names(), vec!["null"]);
    }
}
