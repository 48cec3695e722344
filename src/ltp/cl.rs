// LTP convergence layer
//
// Thin adapter between the daemon's link machinery and the LTP engine:
// link options name the remote engine id and peer address, queued
// bundles drain into the node's sender, and contact transitions flow
// back through the event sink.

use crate::bundle::BundleRef;
use crate::cl::{ClEventSink, ClOptions, ConvergenceLayer};
use crate::contacts::LinkRef;
use crate::error::{DtnError, Result};
use crate::ltp::{LtpEngine, UdpSegmentSender};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

pub struct LtpConvergenceLayer {
    engine: Arc<LtpEngine>,
    udp_sender: Arc<UdpSegmentSender>,
    sink: Mutex<Option<Arc<dyn ClEventSink>>>,
}

impl LtpConvergenceLayer {
    pub fn new(engine: Arc<LtpEngine>, udp_sender: Arc<UdpSegmentSender>) -> Self {
        Self {
            engine,
            udp_sender,
            sink: Mutex::new(None),
        }
    }

    pub fn attach(&self, sink: Arc<dyn ClEventSink>) {
        *self.sink.lock() = Some(sink);
    }

    fn option<'a>(options: &'a ClOptions, key: &str) -> Option<&'a str> {
        options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl ConvergenceLayer for LtpConvergenceLayer {
    fn name(&self) -> &'static str {
        "ltp"
    }

    fn interface_up(&self, interface: &str, options: &ClOptions) -> Result<()> {
        let port = Self::option(options, "local_port")
            .ok_or_else(|| DtnError::Configuration("ltp interface needs local_port".into()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| DtnError::Configuration(format!("bad local_port '{}'", port)))?;
        if port == 0 {
            return Err(DtnError::Configuration(
                "ltp interface local_port must be nonzero".into(),
            ));
        }
        let bind: SocketAddr = format!("0.0.0.0:{}", port)
            .parse()
            .expect("static address parses");
        info!(interface, %bind, "ltp interface up");
        self.engine.start_udp(bind)
    }

    fn interface_down(&self, _interface: &str) -> Result<()> {
        Ok(())
    }

    fn init_link(&self, link: &LinkRef, options: &ClOptions) -> Result<()> {
        let remote_engine = Self::option(options, "remote_engine_id")
            .ok_or_else(|| DtnError::Configuration("ltp link needs remote_engine_id".into()))?;
        let remote_engine: u64 = remote_engine.parse().map_err(|_| {
            DtnError::Configuration(format!("bad remote_engine_id '{}'", remote_engine))
        })?;
        let peer: SocketAddr = link
            .nexthop
            .parse()
            .map_err(|_| DtnError::Configuration(format!("bad nexthop '{}'", link.nexthop)))?;
        self.udp_sender.set_peer(&link.name, peer);
        self.engine.register_engine(remote_engine, &link.name)
    }

    fn delete_link(&self, _link: &LinkRef) -> Result<()> {
        Ok(())
    }

    fn dump_link(&self, link: &LinkRef) -> String {
        let rate = self.engine.context().config.rate;
        format!(
            "ltp link {} nexthop {} state {:?} rate {}",
            link.name,
            link.nexthop,
            link.state(),
            crate::daemon::format_num_as_rate(rate)
        )
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
        while let Some(bundle) = link.pop_queued() {
            self.engine.queue_bundle(&link.name, bundle)?;
        }
        Ok(())
    }

    fn list_link_opts(&self) -> Vec<&'static str> {
        vec!["remote_engine_id", "cipher_suite", "cipher_key_id"]
    }

    fn list_interface_opts(&self) -> Vec<&'static str> {
        vec!["local_port"]
    }

    fn shutdown(&self) {
        self.engine.shutdown();
    }
}
