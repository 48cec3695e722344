// # dtnd server
//
// Main entry point for the bundle forwarding daemon. Initializes
// logging, loads the configuration, wires the convergence layers and
// runs a small command loop on stdin until `shutdown` (or EOF) stops
// the daemon cleanly.

use dtnd::bundle::store::BundleIdGenerator;
use dtnd::ltp::{LtpConvergenceLayer, LtpEngine, UdpSegmentSender};
use dtnd::restage::{Bard, RestageConvergenceLayer};
use dtnd::{Daemon, DaemonConfig, Result, VERSION};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    info!("dtnd {} starting", VERSION);

    let install_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config_file = install_dir.join("dtnd.json");
    let config = if config_file.exists() {
        info!(config = %config_file.display(), "loading configuration");
        DaemonConfig::from_file(&config_file)?
    } else {
        warn!(
            config = %config_file.display(),
            "no configuration file, using defaults"
        );
        DaemonConfig::default()
    };

    let daemon = Daemon::new(config)?;
    let state = daemon.state();

    // convergence layers: loopback, ltp over udp, and the restage
    // overflow store
    let null_cl = Arc::new(dtnd::cl::NullConvergenceLayer::new());
    null_cl.attach(state.clone());
    state.cls.register(null_cl);

    let udp_sender = Arc::new(UdpSegmentSender::new()?);
    let ltp_engine = LtpEngine::new(state.config.ltp.clone(), state.clone(), udp_sender.clone());
    let ltp_cl = Arc::new(LtpConvergenceLayer::new(ltp_engine, udp_sender));
    ltp_cl.attach(state.clone());
    state.cls.register(ltp_cl);

    let bard = Arc::new(Bard::new(state.config.restage.ttl_override));
    let id_source = Arc::new(BundleIdGenerator::new(state.id_source.last_issued() + 1));
    match RestageConvergenceLayer::new(
        state.config.data_dir.join("restage"),
        state.config.restage.clone(),
        "restage0",
        bard,
        id_source,
        state.clone(),
    ) {
        Ok(restage_cl) => state.cls.register(Arc::new(restage_cl)),
        Err(e) => warn!("restage disabled: {}", e),
    }

    daemon.start()?;

    // command loop; the console proper is an external collaborator
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("stdin error: {}", e);
                break;
            }
        };
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => {}
            ["shutdown"] => break,
            ["bundle", "stats"] => {
                println!("{}", state.counters.dump(state.store.pending_count()));
            }
            ["storage", "usage"] => {
                println!(
                    "bundles: {} pending: {} custody: {}",
                    state.store.all_count(),
                    state.store.pending_count(),
                    state.store.custody_count()
                );
            }
            ["link", "dump"] => {
                for link in state.contacts.links() {
                    if let Some(cl) = state.cls.find(&link.cl_name) {
                        println!("{}", cl.dump_link(&link));
                    }
                }
            }
            ["registration", "list"] => {
                for record in state.registrations.records() {
                    println!(
                        "regid {} endpoint {} variant {:?}",
                        record.regid, record.endpoint, record.variant
                    );
                }
            }
            other => {
                println!("unknown command: {}", other.join(" "));
            }
        }
    }

    daemon.shutdown();
    Ok(())
}
