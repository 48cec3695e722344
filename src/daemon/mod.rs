// Bundle daemon
//
// One `Daemon` value owns every subsystem and is passed explicitly to
// the workers; there are no process-wide singletons. Workers are OS
// threads, one role each: input validates and persists arrivals, main
// owns the bundle lifecycle, output drives convergence-layer sends,
// storage serializes durable updates, and the ACS worker folds custody
// acknowledgements into aggregate signals.

pub mod acs_worker;
pub mod counters;
pub mod input;
pub mod main_worker;
pub mod output;
pub mod storage_worker;

pub use counters::{format_num_as_rate, format_num_with_magnitude, DaemonCounters};

use crate::bundle::store::{BundleIdGenerator, BundleStore};
use crate::bundle::{Bundle, BundleRef, ForwardingAction};
use crate::cl::{ClEventSink, ClRegistry};
use crate::config::DaemonConfig;
use crate::contacts::{ContactManager, LinkState};
use crate::custody::{CustodyIdAllocator, CustodyTimers};
use crate::error::Result;
use crate::event::{BundleSource, DaemonEvent, EventQueue, Processor};
use crate::naming::EndpointId;
use crate::reg::RegistrationTable;
use crate::storage::DurableStore;
use crate::timer::TimerService;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{info, warn};

/// Routing adapter. Policies implement this; the daemon core stays
/// algorithm-agnostic.
pub trait Router: Send + Sync {
    /// Observe an event after the main worker has handled it.
    fn handle_event(&self, event: &DaemonEvent, state: &DaemonState) {
        let _ = (event, state);
    }

    /// Decide where a bundle goes next.
    fn route_bundle(
        &self,
        bundle: &BundleRef,
        state: &DaemonState,
    ) -> Vec<(String, ForwardingAction)>;

    /// Deletion gate consulted before a bundle is erased.
    fn can_delete(&self, bundle: &BundleRef, state: &DaemonState) -> bool {
        let _ = (bundle, state);
        true
    }
}

/// Default policy: forward on the first usable link whose remote
/// endpoint is the destination's node.
pub struct StaticRouter;

impl Router for StaticRouter {
    fn route_bundle(
        &self,
        bundle: &BundleRef,
        state: &DaemonState,
    ) -> Vec<(String, ForwardingAction)> {
        state
            .contacts
            .links_for_destination(&bundle.dest)
            .into_iter()
            .filter(|link| link.state() != LinkState::Unavailable)
            .take(1)
            .map(|link| (link.name.clone(), ForwardingAction::ForwardAction))
            .collect()
    }
}

/// Per-worker event queues. Workers never share queues.
pub struct Queues {
    pub input: Arc<EventQueue>,
    pub main: Arc<EventQueue>,
    pub output: Arc<EventQueue>,
    pub storage: Arc<EventQueue>,
    pub acs: Arc<EventQueue>,
}

impl Queues {
    fn new() -> Self {
        Self {
            input: Arc::new(EventQueue::new()),
            main: Arc::new(EventQueue::new()),
            output: Arc::new(EventQueue::new()),
            storage: Arc::new(EventQueue::new()),
            acs: Arc::new(EventQueue::new()),
        }
    }

    pub fn for_processor(&self, processor: Processor) -> &Arc<EventQueue> {
        match processor {
            Processor::Input => &self.input,
            Processor::Main => &self.main,
            Processor::Output => &self.output,
            Processor::Storage => &self.storage,
            Processor::Acs => &self.acs,
        }
    }
}

pub struct DaemonState {
    pub config: DaemonConfig,
    pub local_eid: EndpointId,
    pub store: BundleStore,
    pub id_source: BundleIdGenerator,
    pub custody_ids: CustodyIdAllocator,
    pub custody_timers: CustodyTimers,
    pub registrations: RegistrationTable,
    pub contacts: ContactManager,
    pub cls: ClRegistry,
    pub durable: DurableStore,
    pub timers: TimerService,
    pub counters: DaemonCounters,
    pub queues: Queues,
    router: RwLock<Arc<dyn Router>>,
    should_stop: AtomicBool,
}

impl DaemonState {
    /// Post to the event's default worker.
    pub fn post(&self, event: DaemonEvent) {
        let processor = event.default_processor();
        self.queues.for_processor(processor).post(event);
    }

    pub fn post_to(&self, processor: Processor, event: DaemonEvent) {
        self.queues.for_processor(processor).post(event);
    }

    pub fn post_at_head(&self, processor: Processor, event: DaemonEvent) {
        self.queues.for_processor(processor).post_at_head(event);
    }

    pub fn router(&self) -> Arc<dyn Router> {
        self.router.read().clone()
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::Acquire)
    }

    pub fn signal_stop(&self) {
        self.should_stop.store(true, Ordering::Release);
    }

    /// Arm the expiration timer for a pending bundle. The timer holds
    /// a weak handle; a reaped bundle makes the fire a no-op.
    pub fn schedule_expiration(self: &Arc<Self>, bundle: &BundleRef) {
        let Some(remaining) = bundle.time_to_expiration() else {
            self.post_to(
                Processor::Main,
                DaemonEvent::BundleExpired {
                    bundle_id: bundle.id,
                },
            );
            return;
        };
        let weak_state: Weak<DaemonState> = Arc::downgrade(self);
        let weak_bundle: Weak<Bundle> = Arc::downgrade(bundle);
        let token = self.timers.schedule_after(remaining, move || {
            if let (Some(state), Some(bundle)) = (weak_state.upgrade(), weak_bundle.upgrade()) {
                state.post_to(
                    Processor::Main,
                    DaemonEvent::BundleExpired { bundle_id: bundle.id },
                );
            }
        });
        bundle.with_state(|s| {
            if let Some(old) = s.expiration_timer.replace(token) {
                old.cancel();
            }
        });
    }

    /// Inject a locally generated bundle into the input pipeline.
    pub fn inject_bundle(&self, bundle: BundleRef, source: BundleSource) {
        self.counters.bump(&self.counters.injected);
        self.post_to(
            Processor::Input,
            DaemonEvent::BundleReceived {
                bundle,
                source,
                prev_hop: EndpointId::Null,
            },
        );
    }
}

impl ClEventSink for DaemonState {
    fn bundle_received(&self, bundle: BundleRef, link: &str, prev_hop: EndpointId) {
        self.post_to(
            Processor::Input,
            DaemonEvent::BundleReceived {
                bundle,
                source: BundleSource::Peer {
                    link: link.to_string(),
                },
                prev_hop,
            },
        );
    }

    fn bundle_transmitted(
        &self,
        bundle: BundleRef,
        link: &str,
        bytes_sent: u64,
        reliably_sent: bool,
        success: bool,
    ) {
        self.post_to(
            Processor::Main,
            DaemonEvent::BundleTransmitted {
                bundle,
                link: link.to_string(),
                bytes_sent,
                reliably_sent,
                success,
            },
        );
    }

    fn contact_up(&self, link: &str) {
        self.post_to(
            Processor::Main,
            DaemonEvent::ContactUp {
                link: link.to_string(),
            },
        );
    }

    fn contact_down(&self, link: &str, reason: &str) {
        self.post_to(
            Processor::Main,
            DaemonEvent::ContactDown {
                link: link.to_string(),
                reason: reason.to_string(),
            },
        );
    }

    fn link_state_change(&self, link: &str, state: LinkState, reason: &str) {
        self.post_to(
            Processor::Main,
            DaemonEvent::LinkStateChange {
                link: link.to_string(),
                state,
                reason: reason.to_string(),
            },
        );
    }

    fn ready_for_bundles(&self, link: &str) {
        self.post_to(
            Processor::Output,
            DaemonEvent::LinkReady {
                link: link.to_string(),
            },
        );
    }
}

pub struct Daemon {
    state: Arc<DaemonState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Result<Self> {
        let durable = DurableStore::open(&config.store_dir(), &config.payload_dir())?;
        let next_id = durable.max_bundle_id()?.saturating_add(1);
        let local_eid = config.local_eid.clone();

        let state = Arc::new(DaemonState {
            local_eid: local_eid.clone(),
            store: BundleStore::new(),
            id_source: BundleIdGenerator::new(next_id),
            custody_ids: CustodyIdAllocator::new(1),
            custody_timers: CustodyTimers::new(),
            registrations: RegistrationTable::new(),
            contacts: ContactManager::new(),
            cls: ClRegistry::new(),
            durable,
            timers: TimerService::start("daemon"),
            counters: DaemonCounters::new(),
            queues: Queues::new(),
            router: RwLock::new(Arc::new(StaticRouter)),
            should_stop: AtomicBool::new(false),
            config,
        });
        state
            .registrations
            .install_admin(&local_eid, state.config.ipn_echo_service_number);
        Ok(Self {
            state,
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> Arc<DaemonState> {
        self.state.clone()
    }

    pub fn set_router(&self, router: Arc<dyn Router>) {
        *self.state.router.write() = router;
    }

    /// Reload durable state and spawn the worker threads.
    pub fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            panic!("daemon started twice");
        }
        self.reload()?;

        let spawn = |name: &str, f: Box<dyn FnOnce() + Send>| {
            std::thread::Builder::new()
                .name(name.to_string())
                .spawn(f)
                .expect("spawn worker")
        };
        let s = self.state.clone();
        workers.push(spawn("dtn-input", Box::new(move || input::run(s))));
        let s = self.state.clone();
        workers.push(spawn("dtn-main", Box::new(move || main_worker::run(s))));
        let s = self.state.clone();
        workers.push(spawn("dtn-output", Box::new(move || output::run(s))));
        let s = self.state.clone();
        workers.push(spawn("dtn-storage", Box::new(move || storage_worker::run(s))));
        let s = self.state.clone();
        workers.push(spawn("dtn-acs", Box::new(move || acs_worker::run(s))));

        if self.state.config.announce_ipn {
            self.announce();
        }
        info!(local = %self.state.local_eid, "daemon started");
        Ok(())
    }

    fn reload(&self) -> Result<()> {
        let state = &self.state;

        for record in state.durable.load_registrations()? {
            if state.registrations.get(record.regid).is_some() {
                continue;
            }
            let reg = crate::reg::Registration::new(record.regid, record.endpoint, record.variant);
            if let Err(e) = state.registrations.add(reg) {
                warn!("registration reload: {}", e);
            }
        }

        if state.config.recreate_links_on_restart {
            let records = state.durable.load_links()?;
            let count = state.contacts.reincarnate_all(records);
            if count > 0 {
                info!(count, "links reincarnated");
            }
        }

        for bundle in state.durable.load_bundles()? {
            if bundle.with_state(|s| s.local_custody_id).is_some() && bundle.local_custody() {
                let custody_id = bundle.with_state(|s| s.local_custody_id).expect("checked");
                state.store.add_to_custody(&bundle, custody_id);
            }
            state.store.insert(bundle.clone())?;
            if bundle.expired() {
                state.post_to(
                    Processor::Main,
                    DaemonEvent::BundleExpired { bundle_id: bundle.id },
                );
            } else {
                state.store.add_to_pending(&bundle);
                state.schedule_expiration(&bundle);
            }
        }
        Ok(())
    }

    /// Emit the startup announce bundle through the input pipeline.
    fn announce(&self) {
        let state = &self.state;
        let body = format!("{}", state.local_eid).into_bytes();
        let mut payload = vec![crate::bundle::admin::ADMIN_ANNOUNCE << 4];
        payload.extend_from_slice(&body);
        let bundle = Bundle::builder(state.local_eid.clone(), state.local_eid.clone())
            .admin()
            .payload(crate::bundle::Payload::in_memory(payload))
            .build(state.id_source.next_id());
        state.inject_bundle(bundle, BundleSource::Admin);
    }

    /// Cooperative two-phase shutdown; returns once every worker has
    /// exited and the storage worker has flushed.
    pub fn shutdown(&self) {
        self.state.post_to(Processor::Main, DaemonEvent::Shutdown);
        let mut workers = self.workers.lock();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
        self.state.timers.shutdown();
        info!("daemon stopped");
    }
}
