// LTP engine
//
// One logical node per remote engine id, each running a sender and a
// receiver thread. A single datagram dispatcher parses only the
// segment header and routes by (engine id, session id, type): traffic
// addressed at sessions we originated resolves through the session-id
// map, everything else goes to the node registered for the header's
// engine id. Closed sessions are remembered for a closeout interval
// so late reports and cancels stay idempotent.

pub mod cipher;
pub mod cl;
pub mod receiver;
pub mod segment;
pub mod sender;
pub mod session;

pub use cipher::{CipherConfig, CipherSuite, LtpCipher, NullCipher};
pub use cl::LtpConvergenceLayer;
pub use segment::{CancelReason, Claim, PeekedHeader, SegBody, SegType, Segment};

use crate::cl::ClEventSink;
use crate::config::LtpConfig;
use crate::error::{DtnError, Result};
use crate::timer::TimerService;
use crossbeam::channel::{unbounded, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use receiver::ReceiverEvent;
use sender::SenderEvent;
use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Engine-wide statistics, updated lock-free from the node threads.
#[derive(Default)]
pub struct LtpStats {
    pub total_rs_segs_generated: AtomicU64,
    pub ds_segment_resends: AtomicU64,
    pub dup_ds_segments: AtomicU64,
    pub cancel_by_rcvr_sessions: AtomicU64,
    pub cancel_by_sndr_sessions: AtomicU64,
    pub ras_not_received_but_got_bundles: AtomicU64,
    pub cancelled_but_got_bundles: AtomicU64,
    pub quota_drops: AtomicU64,
    pub bundles_extracted: AtomicU64,
    pub sender_sessions_completed: AtomicU64,
    pub receiver_sessions_completed: AtomicU64,
    pub unknown_engine_drops: AtomicU64,
    red_backlog_bytes: AtomicU64,
}

impl LtpStats {
    pub fn bump_rs_generated(&self) {
        self.total_rs_segs_generated.fetch_add(1, Ordering::Relaxed);
    }
    pub fn bump_ds_resends(&self) {
        self.ds_segment_resends.fetch_add(1, Ordering::Relaxed);
    }
    pub fn bump_dup_ds(&self) {
        self.dup_ds_segments.fetch_add(1, Ordering::Relaxed);
    }
    pub fn bump_cancel_by_receiver(&self) {
        self.cancel_by_rcvr_sessions.fetch_add(1, Ordering::Relaxed);
    }
    pub fn bump_cancel_by_sender(&self) {
        self.cancel_by_sndr_sessions.fetch_add(1, Ordering::Relaxed);
    }
    pub fn bump_ras_not_received(&self) {
        self.ras_not_received_but_got_bundles
            .fetch_add(1, Ordering::Relaxed);
    }
    pub fn bump_cancelled_but_got_bundles(&self) {
        self.cancelled_but_got_bundles.fetch_add(1, Ordering::Relaxed);
    }
    pub fn bump_quota_drops(&self) {
        self.quota_drops.fetch_add(1, Ordering::Relaxed);
    }
    pub fn bump_bundles_extracted(&self) {
        self.bundles_extracted.fetch_add(1, Ordering::Relaxed);
    }
    pub fn bump_sender_completed(&self) {
        self.sender_sessions_completed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn bump_receiver_completed(&self) {
        self.receiver_sessions_completed
            .fetch_add(1, Ordering::Relaxed);
    }
    pub fn bump_unknown_engine(&self) {
        self.unknown_engine_drops.fetch_add(1, Ordering::Relaxed);
    }
    pub fn red_backlog(&self) -> u64 {
        self.red_backlog_bytes.load(Ordering::Relaxed)
    }
    pub fn add_red_backlog(&self, bytes: u64) {
        self.red_backlog_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
    pub fn sub_red_backlog(&self, bytes: u64) {
        let mut current = self.red_backlog_bytes.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.red_backlog_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Interface the LTP engine uses to put datagrams on the wire; the
/// convergence layer supplies the socket side.
pub trait LtpClSender: Send + Sync {
    fn send_segment(&self, link: &str, data: &[u8]) -> Result<()>;
}

/// Token bucket pacing outbound segments. Consuming more than the
/// available tokens sleeps the sender thread, which is its designated
/// suspension point.
pub struct TokenBucket {
    rate_bits: u64,
    depth_bits: u64,
    tokens: f64,
    last_refill: std::time::Instant,
}

impl TokenBucket {
    pub fn new(rate_bits: u64, depth_bits: u64) -> Self {
        Self {
            rate_bits,
            depth_bits: depth_bits.max(1),
            tokens: depth_bits.max(1) as f64,
            last_refill: std::time::Instant::now(),
        }
    }

    pub fn consume(&mut self, bits: u64) {
        if self.rate_bits == 0 {
            return;
        }
        self.refill();
        let bits = bits as f64;
        if self.tokens < bits {
            let deficit = bits - self.tokens;
            let wait = deficit / self.rate_bits as f64;
            std::thread::sleep(Duration::from_secs_f64(wait));
            self.refill();
        }
        self.tokens = (self.tokens - bits).max(0.0);
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.last_refill = std::time::Instant::now();
        self.tokens =
            (self.tokens + elapsed * self.rate_bits as f64).min(self.depth_bits as f64);
    }
}

/// Shared engine context handed to every node thread.
pub struct LtpContext {
    pub config: LtpConfig,
    pub local_engine_id: u64,
    pub timers: TimerService,
    pub segment_sender: Arc<dyn LtpClSender>,
    pub sink: Arc<dyn ClEventSink>,
    pub stats: LtpStats,
    /// Outbound session id -> remote engine id, for routing inbound
    /// reports and cancels directed at the local engine.
    session_to_engine: DashMap<u64, u64>,
    /// (engine, session) -> close time, retained for the closeout
    /// interval and pruned lazily.
    closed_sessions: Mutex<HashMap<(u64, u64), std::time::Instant>>,
    next_session_id: AtomicU64,
}

impl LtpContext {
    fn new(
        config: LtpConfig,
        sink: Arc<dyn ClEventSink>,
        segment_sender: Arc<dyn LtpClSender>,
    ) -> Self {
        // a random seed keeps session ids from colliding across
        // restarts while staying monotonic within a run
        let seed: u32 = rand::rng().random_range(1..=u32::MAX);
        Self {
            local_engine_id: config.engine_id,
            timers: TimerService::start("ltp"),
            segment_sender,
            sink,
            stats: LtpStats::default(),
            session_to_engine: DashMap::new(),
            closed_sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(u64::from(seed)),
            config,
        }
    }

    pub fn take_session_id(&self, remote_engine: u64) -> u64 {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.session_to_engine.insert(session_id, remote_engine);
        session_id
    }

    pub fn engine_for_session(&self, session_id: u64) -> Option<u64> {
        self.session_to_engine.get(&session_id).map(|e| *e)
    }

    /// Retire a session, remembering it for the closeout interval so
    /// late segments are answered idempotently instead of creating
    /// ghost sessions. Stale entries are pruned on the way in.
    pub fn close_session(&self, session_id: u64, engine_id: u64) {
        self.session_to_engine.remove(&session_id);
        let closeout = Duration::from_secs(u64::from(self.config.inactivity_intvl));
        let now = std::time::Instant::now();
        let mut closed = self.closed_sessions.lock();
        closed.retain(|_, at| now.duration_since(*at) < closeout);
        closed.insert((engine_id, session_id), now);
    }

    pub fn is_closed(&self, engine_id: u64, session_id: u64) -> bool {
        let closeout = Duration::from_secs(u64::from(self.config.inactivity_intvl));
        self.closed_sessions
            .lock()
            .get(&(engine_id, session_id))
            .map(|at| at.elapsed() < closeout)
            .unwrap_or(false)
    }
}

struct LtpNode {
    remote_engine: u64,
    link_name: String,
    sender_tx: Sender<SenderEvent>,
    receiver_tx: Sender<ReceiverEvent>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

pub struct LtpEngine {
    ctx: Arc<LtpContext>,
    nodes: DashMap<u64, Arc<LtpNode>>,
    nodes_by_link: DashMap<String, u64>,
    unknown_engines_logged: Mutex<HashSet<u64>>,
    udp_thread: Mutex<Option<JoinHandle<()>>>,
    udp_stop: Arc<AtomicBool>,
}

impl LtpEngine {
    pub fn new(
        config: LtpConfig,
        sink: Arc<dyn ClEventSink>,
        segment_sender: Arc<dyn LtpClSender>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx: Arc::new(LtpContext::new(config, sink, segment_sender)),
            nodes: DashMap::new(),
            nodes_by_link: DashMap::new(),
            unknown_engines_logged: Mutex::new(HashSet::new()),
            udp_thread: Mutex::new(None),
            udp_stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn context(&self) -> &Arc<LtpContext> {
        &self.ctx
    }

    /// Register the node for a remote engine and spawn its thread pair.
    pub fn register_engine(&self, remote_engine: u64, link_name: &str) -> Result<()> {
        if self.nodes.contains_key(&remote_engine) {
            return Err(DtnError::AlreadyExists(format!(
                "ltp engine {}",
                remote_engine
            )));
        }
        let (sender_tx, sender_rx) = unbounded();
        let (receiver_tx, receiver_rx) = unbounded();
        let mut threads = Vec::new();

        let ctx = self.ctx.clone();
        let link = link_name.to_string();
        let tx = sender_tx.clone();
        threads.push(
            std::thread::Builder::new()
                .name(format!("ltp-snd-{}", remote_engine))
                .spawn(move || sender::run(ctx, remote_engine, link, sender_rx, tx))
                .expect("spawn ltp sender"),
        );
        let ctx = self.ctx.clone();
        let link = link_name.to_string();
        let tx = receiver_tx.clone();
        threads.push(
            std::thread::Builder::new()
                .name(format!("ltp-rcv-{}", remote_engine))
                .spawn(move || receiver::run(ctx, remote_engine, link, receiver_rx, tx))
                .expect("spawn ltp receiver"),
        );

        let node = Arc::new(LtpNode {
            remote_engine,
            link_name: link_name.to_string(),
            sender_tx,
            receiver_tx,
            threads: Mutex::new(threads),
        });
        self.nodes.insert(remote_engine, node);
        self.nodes_by_link.insert(link_name.to_string(), remote_engine);
        info!(engine = remote_engine, link = link_name, "ltp node registered");
        Ok(())
    }

    /// Queue a bundle for the node serving `link`.
    pub fn queue_bundle(&self, link: &str, bundle: crate::bundle::BundleRef) -> Result<()> {
        let engine = self
            .nodes_by_link
            .get(link)
            .map(|e| *e)
            .ok_or_else(|| DtnError::NotFound(format!("ltp node for link {}", link)))?;
        let node = self
            .nodes
            .get(&engine)
            .ok_or_else(|| DtnError::NotFound(format!("ltp engine {}", engine)))?;
        node.sender_tx
            .send(SenderEvent::BundleQueued(bundle))
            .map_err(|_| DtnError::Unavailable("ltp sender stopped".to_string()))
    }

    /// Raw datagram entry point: parse the header without trusting the
    /// body and forward to the owning node.
    pub fn process_datagram(&self, data: &[u8]) {
        let header = match segment::peek_header(data) {
            Ok(header) => header,
            Err(e) => {
                debug!("undecodable LTP header: {}", e);
                return;
            }
        };
        let segment = match Segment::decode(data) {
            Ok(segment) => segment,
            Err(e) => {
                warn!(
                    engine = header.engine_id,
                    session = header.session_id,
                    "malformed LTP segment: {}",
                    e
                );
                return;
            }
        };

        if header.seg_type.toward_sender() {
            // addressed at a session we originated
            let Some(engine) = self.ctx.engine_for_session(header.session_id) else {
                self.answer_late_segment(&segment);
                return;
            };
            if let Some(node) = self.nodes.get(&engine) {
                let _ = node.sender_tx.send(SenderEvent::Segment(segment));
            }
            return;
        }

        match self.nodes.get(&header.engine_id) {
            Some(node) => {
                let _ = node.receiver_tx.send(ReceiverEvent::Segment(segment));
            }
            None => {
                // log unknown engines once, then drop silently
                let mut logged = self.unknown_engines_logged.lock();
                if logged.insert(header.engine_id) {
                    warn!(
                        engine = header.engine_id,
                        "datagram from unknown LTP engine, dropping"
                    );
                }
                self.ctx.stats.bump_unknown_engine();
            }
        }
    }

    /// Keep closed sessions idempotent: late reports get an ack, late
    /// receiver cancels get the sender-side ack.
    fn answer_late_segment(&self, segment: &Segment) {
        let link = self
            .nodes
            .iter()
            .next()
            .map(|n| n.link_name.clone());
        let Some(link) = link else {
            return;
        };
        let reply = match &segment.body {
            SegBody::Report { report_serial, .. } => Some(Segment::report_ack(
                self.ctx.local_engine_id,
                segment.session_id,
                *report_serial,
            )),
            SegBody::Cancel { .. } => Some(Segment::cancel_ack(
                self.ctx.local_engine_id,
                segment.session_id,
                false,
            )),
            _ => None,
        };
        if let Some(reply) = reply {
            let _ = self.ctx.segment_sender.send_segment(&link, &reply.encode());
        }
    }

    /// Bind the UDP socket and run the datagram dispatch thread.
    pub fn start_udp(self: &Arc<Self>, bind: SocketAddr) -> Result<()> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(bind),
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_recv_buffer_size(4 * 1024 * 1024)?;
        socket.bind(&bind.into())?;
        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(Duration::from_millis(250)))?;

        let engine = self.clone();
        let stop = self.udp_stop.clone();
        let handle = std::thread::Builder::new()
            .name("ltp-recv".to_string())
            .spawn(move || {
                let mut buf = vec![0u8; 65536];
                info!(%bind, "ltp udp dispatcher running");
                while !stop.load(Ordering::Acquire) {
                    match socket.recv_from(&mut buf) {
                        Ok((len, _peer)) => engine.process_datagram(&buf[..len]),
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => {
                            warn!("ltp socket error: {}", e);
                        }
                    }
                }
            })
            .expect("spawn ltp dispatcher");
        *self.udp_thread.lock() = Some(handle);
        Ok(())
    }

    pub fn shutdown(&self) {
        self.udp_stop.store(true, Ordering::Release);
        if let Some(handle) = self.udp_thread.lock().take() {
            let _ = handle.join();
        }
        for node in self.nodes.iter() {
            let _ = node.sender_tx.send(SenderEvent::Shutdown);
            let _ = node.receiver_tx.send(ReceiverEvent::Shutdown);
        }
        for node in self.nodes.iter() {
            let mut threads = node.threads.lock();
            for handle in threads.drain(..) {
                let _ = handle.join();
            }
        }
        self.ctx.timers.shutdown();
    }
}

/// UDP sender keyed by link name.
pub struct UdpSegmentSender {
    socket: UdpSocket,
    peers: DashMap<String, SocketAddr>,
}

impl UdpSegmentSender {
    pub fn new() -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self {
            socket,
            peers: DashMap::new(),
        })
    }

    pub fn set_peer(&self, link: &str, addr: SocketAddr) {
        self.peers.insert(link.to_string(), addr);
    }
}

impl LtpClSender for UdpSegmentSender {
    fn send_segment(&self, link: &str, data: &[u8]) -> Result<()> {
        let addr = self
            .peers
            .get(link)
            .map(|a| *a)
            .ok_or_else(|| DtnError::NotFound(format!("peer address for link {}", link)))?;
        self.socket.send_to(data, addr)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bucket_unthrottled() {
        let mut bucket = TokenBucket::new(0, 0);
        let start = std::time::Instant::now();
        bucket.consume(u64::MAX);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_token_bucket_paces() {
        // 80 kbit/s with a 8 kbit bucket: sending 16 kbit total must
        // wait roughly 100ms for the second half
        let mut bucket = TokenBucket::new(80_000, 8_000);
        let start = std::time::Instant::now();
        bucket.consume(8_000);
        bucket.consume(8_000);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(80), "elapsed {:?}", elapsed);
    }
}
