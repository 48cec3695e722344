// LTP engine end-to-end: red transfer with packet loss and report
// driven retransmission, and inactivity cancellation at the receiver.

use dtnd::bundle::{Bundle, BundleRef, Payload};
use dtnd::cl::ClEventSink;
use dtnd::config::LtpConfig;
use dtnd::contacts::LinkState;
use dtnd::ltp::{LtpClSender, LtpEngine, SegBody, SegType, Segment};
use dtnd::naming::EndpointId;
use dtnd::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Loopback wire: hands encoded segments to the peer engine, with an
/// optional one-shot drop of the data segment at a given offset.
struct Pipe {
    target: Mutex<Option<Arc<LtpEngine>>>,
    drop_ds_at: Mutex<Option<u64>>,
}

impl Pipe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            target: Mutex::new(None),
            drop_ds_at: Mutex::new(None),
        })
    }

    fn connect(&self, engine: Arc<LtpEngine>) {
        *self.target.lock() = Some(engine);
    }

    fn drop_next_ds_at(&self, offset: u64) {
        *self.drop_ds_at.lock() = Some(offset);
    }
}

impl LtpClSender for Pipe {
    fn send_segment(&self, _link: &str, data: &[u8]) -> Result<()> {
        if let Ok(segment) = Segment::decode(data) {
            if let SegBody::Data { offset, .. } = &segment.body {
                let mut drop = self.drop_ds_at.lock();
                if *drop == Some(*offset) {
                    *drop = None;
                    return Ok(());
                }
            }
        }
        if let Some(target) = self.target.lock().clone() {
            target.process_datagram(data);
        }
        Ok(())
    }
}

#[derive(Default)]
struct CaptureSink {
    received: Mutex<Vec<BundleRef>>,
    transmitted_ok: AtomicU64,
    transmitted_failed: AtomicU64,
}

impl ClEventSink for CaptureSink {
    fn bundle_received(&self, bundle: BundleRef, _link: &str, _prev_hop: EndpointId) {
        self.received.lock().push(bundle);
    }

    fn bundle_transmitted(
        &self,
        _bundle: BundleRef,
        _link: &str,
        _bytes: u64,
        _reliable: bool,
        success: bool,
    ) {
        if success {
            self.transmitted_ok.fetch_add(1, Ordering::SeqCst);
        } else {
            self.transmitted_failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn contact_up(&self, _link: &str) {}
    fn contact_down(&self, _link: &str, _reason: &str) {}
    fn link_state_change(&self, _link: &str, _state: LinkState, _reason: &str) {}
    fn ready_for_bundles(&self, _link: &str) {}
}

fn ltp_config(engine_id: u64) -> LtpConfig {
    let mut config = LtpConfig::default();
    config.engine_id = engine_id;
    config.agg_time_millis = 50;
    config.agg_size = 1_000_000;
    config.seg_size = 1400;
    config.retran_intvl = 1;
    config.retran_retries = 3;
    config.inactivity_intvl = 30;
    config
}

fn wait_until(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {}", what);
}

fn test_bundle(payload_len: usize) -> BundleRef {
    Bundle::builder(EndpointId::ipn(1, 1), EndpointId::ipn(2, 1))
        .creation_ts(500, 0)
        .lifetime(3600)
        .payload(Payload::in_memory(vec![0x5a; payload_len]))
        .build(1)
}

#[test]
fn test_red_session_with_packet_loss() {
    let a_to_b = Pipe::new();
    let b_to_a = Pipe::new();
    let sender_sink = Arc::new(CaptureSink::default());
    let receiver_sink = Arc::new(CaptureSink::default());

    let engine_a = LtpEngine::new(ltp_config(1), sender_sink.clone(), a_to_b.clone());
    let engine_b = LtpEngine::new(ltp_config(7), receiver_sink.clone(), b_to_a.clone());
    a_to_b.connect(engine_b.clone());
    b_to_a.connect(engine_a.clone());
    engine_a.register_engine(7, "ltp0").unwrap();
    engine_b.register_engine(1, "ltp0").unwrap();

    // lose the middle data segment on first transmission
    a_to_b.drop_next_ds_at(1400);
    engine_a.queue_bundle("ltp0", test_bundle(3500)).unwrap();

    wait_until("bundle extracted at receiver", Duration::from_secs(10), || {
        !receiver_sink.received.lock().is_empty()
    });
    wait_until("sender completion", Duration::from_secs(10), || {
        sender_sink.transmitted_ok.load(Ordering::SeqCst) == 1
    });

    let received = receiver_sink.received.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload.read_all().unwrap(), vec![0x5a; 3500]);

    // exactly one data segment was resent, and the receiver generated
    // the gap report plus the full report
    let a_stats = &engine_a.context().stats;
    let b_stats = &engine_b.context().stats;
    assert_eq!(a_stats.ds_segment_resends.load(Ordering::SeqCst), 1);
    assert_eq!(b_stats.total_rs_segs_generated.load(Ordering::SeqCst), 2);
    assert_eq!(b_stats.cancel_by_rcvr_sessions.load(Ordering::SeqCst), 0);

    engine_a.shutdown();
    engine_b.shutdown();
}

#[test]
fn test_clean_red_session_single_report() {
    let a_to_b = Pipe::new();
    let b_to_a = Pipe::new();
    let sender_sink = Arc::new(CaptureSink::default());
    let receiver_sink = Arc::new(CaptureSink::default());

    let engine_a = LtpEngine::new(ltp_config(1), sender_sink.clone(), a_to_b.clone());
    let engine_b = LtpEngine::new(ltp_config(7), receiver_sink.clone(), b_to_a.clone());
    a_to_b.connect(engine_b.clone());
    b_to_a.connect(engine_a.clone());
    engine_a.register_engine(7, "ltp0").unwrap();
    engine_b.register_engine(1, "ltp0").unwrap();

    engine_a.queue_bundle("ltp0", test_bundle(2000)).unwrap();

    wait_until("sender completion", Duration::from_secs(10), || {
        sender_sink.transmitted_ok.load(Ordering::SeqCst) == 1
    });
    assert_eq!(receiver_sink.received.lock().len(), 1);
    let b_stats = &engine_b.context().stats;
    assert_eq!(b_stats.total_rs_segs_generated.load(Ordering::SeqCst), 1);
    assert_eq!(
        engine_a
            .context()
            .stats
            .ds_segment_resends
            .load(Ordering::SeqCst),
        0
    );

    engine_a.shutdown();
    engine_b.shutdown();
}

#[test]
fn test_inactivity_cancels_by_receiver() {
    let blackhole = Pipe::new();
    let receiver_sink = Arc::new(CaptureSink::default());
    let mut config = ltp_config(7);
    config.inactivity_intvl = 1;
    config.retran_retries = 1;
    let engine_b = LtpEngine::new(config, receiver_sink.clone(), blackhole.clone());
    engine_b.register_engine(1, "ltp0").unwrap();

    // one red, non-checkpoint segment, then silence
    let segment = Segment::data(
        1,
        42,
        1,
        0,
        vec![0; 512],
        SegType::RedData {
            checkpoint: false,
            eorp: false,
            eob: false,
        },
        None,
    );
    engine_b.process_datagram(&segment.encode());

    wait_until("inactivity cancel", Duration::from_secs(10), || {
        engine_b
            .context()
            .stats
            .cancel_by_rcvr_sessions
            .load(Ordering::SeqCst)
            == 1
    });
    assert!(receiver_sink.received.lock().is_empty());
    assert_eq!(
        engine_b
            .context()
            .stats
            .bundles_extracted
            .load(Ordering::SeqCst),
        0
    );

    engine_b.shutdown();
}

#[test]
fn test_green_session_delivers_at_eob() {
    let a_to_b = Pipe::new();
    let b_to_a = Pipe::new();
    let sender_sink = Arc::new(CaptureSink::default());
    let receiver_sink = Arc::new(CaptureSink::default());

    let engine_a = LtpEngine::new(ltp_config(1), sender_sink.clone(), a_to_b.clone());
    let engine_b = LtpEngine::new(ltp_config(7), receiver_sink.clone(), b_to_a.clone());
    a_to_b.connect(engine_b.clone());
    b_to_a.connect(engine_a.clone());
    engine_a.register_engine(7, "ltp0").unwrap();
    engine_b.register_engine(1, "ltp0").unwrap();

    let bundle = Bundle::builder(EndpointId::ipn(1, 1), EndpointId::ipn(2, 1))
        .creation_ts(500, 1)
        .ecos_streaming()
        .payload(Payload::in_memory(vec![0x11; 3000]))
        .build(2);
    engine_a.queue_bundle("ltp0", bundle).unwrap();

    wait_until("green delivery", Duration::from_secs(10), || {
        !receiver_sink.received.lock().is_empty()
    });
    // best-effort traffic completes at wire time, no reports at all
    assert_eq!(sender_sink.transmitted_ok.load(Ordering::SeqCst), 1);
    assert_eq!(
        engine_b
            .context()
            .stats
            .total_rs_segs_generated
            .load(Ordering::SeqCst),
        0
    );

    engine_a.shutdown();
    engine_b.shutdown();
}
