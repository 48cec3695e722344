// Null convergence layer
//
// Completes every transmission immediately and records what it was
// asked to send. Used by loopback links and by the test suite.

use crate::bundle::BundleRef;
use crate::cl::{ClEventSink, ClOptions, ConvergenceLayer};
use crate::contacts::LinkRef;
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;

pub struct NullConvergenceLayer {
    sink: Mutex<Option<Arc<dyn ClEventSink>>>,
    /// When false, report every transmission as failed.
    succeed: Mutex<bool>,
    sent: Mutex<Vec<(String, u64)>>,
}

impl Default for NullConvergenceLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl NullConvergenceLayer {
    pub fn new() -> Self {
        Self {
            sink: Mutex::new(None),
            succeed: Mutex::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn attach(&self, sink: Arc<dyn ClEventSink>) {
        *self.sink.lock() = Some(sink);
    }

    pub fn set_succeed(&self, succeed: bool) {
        *self.succeed.lock() = succeed;
    }

    /// (link name, bundle id) pairs in transmission order.
    pub fn sent(&self) -> Vec<(String, u64)> {
        self.sent.lock().clone()
    }
}

impl ConvergenceLayer for NullConvergenceLayer {
    fn name(&self) -> &'static str {
        "null"
    }

    fn interface_up(&self, _interface: &str, _options: &ClOptions) -> Result<()> {
        Ok(())
    }

    fn interface_down(&self, _interface: &str) -> Result<()> {
        Ok(())
    }

    fn init_link(&self, _link: &LinkRef, _options: &ClOptions) -> Result<()> {
        Ok(())
    }

    fn delete_link(&self, _link: &LinkRef) -> Result<()> {
        Ok(())
    }

    fn dump_link(&self, link: &LinkRef) -> String {
        format!("null link {} nexthop {}", link.name, link.nexthop)
    }

    fn open_contact(&self, link: &LinkRef) -> Result<()> {
        link.open_contact()?;
        if let Some(sink) = self.sink.lock().clone() {
            sink.contact_up(&link.name);
        }
        Ok(())
    }

    fn close_contact(&self, link: &LinkRef) -> Result<()> {
        link.close_contact();
        Ok(())
    }

    fn bundle_queued(&self, link: &LinkRef, _bundle: &BundleRef) -> Result<()> {
        let succeed = *self.succeed.lock();
        while let Some(bundle) = link.pop_queued() {
            let bytes = bundle.payload.len();
            self.sent.lock().push((link.name.clone(), bundle.id));
            link.finish_inflight(bundle.id, bytes, succeed);
            if let Some(sink) = self.sink.lock().clone() {
                sink.bundle_transmitted(bundle, &link.name, bytes, true, succeed);
            }
        }
        Ok(())
    }

    fn list_link_opts(&self) -> Vec<&'static str> {
        vec!["succeed"]
    }

    fn shutdown(&self) {}
}
