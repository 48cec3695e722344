// Event pipeline
//
// Workers communicate only by posting immutable event records into each
// other's queues. A queue is a FIFO with head insertion; `post_and_wait`
// attaches a notifier that the owning worker signals once the handler
// has completed. Within one worker events are handled strictly in
// order; cross-worker ordering exists only through explicit re-posting.

use crate::bundle::{AcsPayload, BundleRef, CustodySignal, CustodySignalReason, ForwardingAction};
use crate::contacts::LinkState;
use crate::naming::EndpointId;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Destination worker for a posted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processor {
    Input,
    Main,
    Output,
    Storage,
    Acs,
}

/// Where a received bundle came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleSource {
    Peer { link: String },
    Api,
    Admin,
    Restage { link: String },
    Datastore,
}

#[derive(Debug, Clone)]
pub enum DaemonEvent {
    /// A convergence layer or the API produced a bundle; the input
    /// worker validates, dedups and persists it.
    BundleReceived {
        bundle: BundleRef,
        source: BundleSource,
        prev_hop: EndpointId,
    },
    /// Input accepted the bundle; the main worker owns it from here.
    BundleAccepted {
        bundle: BundleRef,
        source: BundleSource,
        duplicate: bool,
    },
    /// Ask the output worker to drive a convergence-layer send.
    SendBundle {
        bundle: BundleRef,
        link: String,
        action: ForwardingAction,
    },
    /// Transmission outcome reported by a convergence layer.
    BundleTransmitted {
        bundle: BundleRef,
        link: String,
        bytes_sent: u64,
        reliably_sent: bool,
        success: bool,
    },
    /// Queue a local delivery to one matching registration.
    DeliverBundleToReg { bundle: BundleRef, regid: u32 },
    /// A registration finished (or suppressed) a delivery.
    BundleDelivered { bundle: BundleRef, regid: u32 },
    BundleExpired { bundle_id: u64 },
    /// Evaluate the deletion gates for a bundle.
    TryDeleteBundle { bundle_id: u64 },
    CustodyTimeout { bundle_id: u64, link: String },
    CustodySignalReceived { signal: CustodySignal },
    /// Router observation hook; emitted after custody acceptance.
    BundleCustodyAccepted { bundle: BundleRef },
    /// Release local custody, typically resolved from an aggregate
    /// signal by custody id.
    ReleaseCustody { bundle_id: u64, redundant: bool },
    /// A convergence layer can accept more bundles on the link.
    LinkReady { link: String },
    /// Inbound aggregate custody signal routed to the ACS worker.
    AggregateCustodySignal { acs: AcsPayload },
    /// Custody accepted locally; fold the id into the pending signal.
    AddBundleToAcs {
        bundle_id: u64,
        custody_id: u64,
        prev_custodian: EndpointId,
        succeeded: bool,
        reason: CustodySignalReason,
    },
    /// Per-route accumulation deadline hit; flush the pending signal.
    AcsExpired {
        custodian: EndpointId,
        succeeded: bool,
        reason: CustodySignalReason,
    },
    LinkStateChange {
        link: String,
        state: LinkState,
        reason: String,
    },
    ContactUp { link: String },
    ContactDown { link: String, reason: String },
    RegistrationAdded { regid: u32 },
    RegistrationRemoved { regid: u32 },
    /// Durable-store work for the storage worker.
    StoreBundleUpdate { bundle: BundleRef },
    StoreBundleDelete { bundle_id: u64 },
    StoreRegUpdate { regid: u32 },
    StoreRegDelete { regid: u32 },
    StoreLinkUpdate { link: String },
    StoreLinkDelete { link: String },
    StorePendingAcsUpdate { record: crate::custody::PendingAcsRecord },
    StorePendingAcsDelete { key: String },
    Shutdown,
}

impl DaemonEvent {
    /// Default destination worker for this event class.
    pub fn default_processor(&self) -> Processor {
        use DaemonEvent::*;
        match self {
            BundleReceived { .. } => Processor::Input,
            SendBundle { .. } | LinkReady { .. } => Processor::Output,
            AggregateCustodySignal { .. }
            | AddBundleToAcs { .. }
            | AcsExpired { .. } => Processor::Acs,
            StoreBundleUpdate { .. }
            | StoreBundleDelete { .. }
            | StoreRegUpdate { .. }
            | StoreRegDelete { .. }
            | StoreLinkUpdate { .. }
            | StoreLinkDelete { .. }
            | StorePendingAcsUpdate { .. }
            | StorePendingAcsDelete { .. } => Processor::Storage,
            _ => Processor::Main,
        }
    }

    pub fn label(&self) -> &'static str {
        use DaemonEvent::*;
        match self {
            BundleReceived { .. } => "bundle_received",
            BundleAccepted { .. } => "bundle_accepted",
            SendBundle { .. } => "send_bundle",
            BundleTransmitted { .. } => "bundle_transmitted",
            DeliverBundleToReg { .. } => "deliver_bundle_to_reg",
            BundleDelivered { .. } => "bundle_delivered",
            BundleExpired { .. } => "bundle_expired",
            TryDeleteBundle { .. } => "try_delete_bundle",
            CustodyTimeout { .. } => "custody_timeout",
            CustodySignalReceived { .. } => "custody_signal",
            BundleCustodyAccepted { .. } => "bundle_custody_accepted",
            ReleaseCustody { .. } => "release_custody",
            LinkReady { .. } => "link_ready",
            AggregateCustodySignal { .. } => "aggregate_custody_signal",
            AddBundleToAcs { .. } => "add_bundle_to_acs",
            AcsExpired { .. } => "acs_expired",
            LinkStateChange { .. } => "link_state_change",
            ContactUp { .. } => "contact_up",
            ContactDown { .. } => "contact_down",
            RegistrationAdded { .. } => "registration_added",
            RegistrationRemoved { .. } => "registration_removed",
            StoreBundleUpdate { .. } => "store_bundle_update",
            StoreBundleDelete { .. } => "store_bundle_delete",
            StoreRegUpdate { .. } => "store_reg_update",
            StoreRegDelete { .. } => "store_reg_delete",
            StoreLinkUpdate { .. } => "store_link_update",
            StoreLinkDelete { .. } => "store_link_delete",
            StorePendingAcsUpdate { .. } => "store_pending_acs_update",
            StorePendingAcsDelete { .. } => "store_pending_acs_delete",
            Shutdown => "shutdown",
        }
    }
}

/// Completion signal shared between a waiting poster and the worker.
#[derive(Debug)]
pub struct Notifier {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Notifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    pub fn signal(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }

    /// True when signalled before the timeout.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.cond.wait_for(&mut done, deadline - now);
        }
        true
    }
}

pub struct QueuedEvent {
    pub event: DaemonEvent,
    pub notifier: Option<Arc<Notifier>>,
}

impl QueuedEvent {
    /// Signal a waiting `post_and_wait` caller; call after handling.
    pub fn complete(self) {
        if let Some(notifier) = self.notifier {
            notifier.signal();
        }
    }
}

/// One worker's input FIFO with head insertion.
pub struct EventQueue {
    deque: Mutex<VecDeque<QueuedEvent>>,
    available: Condvar,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            deque: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    pub fn post(&self, event: DaemonEvent) {
        self.push(QueuedEvent {
            event,
            notifier: None,
        }, false);
    }

    pub fn post_at_head(&self, event: DaemonEvent) {
        self.push(QueuedEvent {
            event,
            notifier: None,
        }, true);
    }

    /// Post and block until the worker completes the event or the
    /// timeout elapses. On timeout the event stays queued and will
    /// still be processed; false is returned.
    pub fn post_and_wait(&self, event: DaemonEvent, timeout: Duration, at_head: bool) -> bool {
        let notifier = Notifier::new();
        self.push(
            QueuedEvent {
                event,
                notifier: Some(notifier.clone()),
            },
            at_head,
        );
        notifier.wait_for(timeout)
    }

    fn push(&self, event: QueuedEvent, at_head: bool) {
        let mut deque = self.deque.lock();
        if at_head {
            deque.push_front(event);
        } else {
            deque.push_back(event);
        }
        drop(deque);
        self.available.notify_one();
    }

    /// Blocking pop with timeout; None on timeout.
    pub fn pop(&self, timeout: Duration) -> Option<QueuedEvent> {
        let deadline = Instant::now() + timeout;
        let mut deque = self.deque.lock();
        loop {
            if let Some(event) = deque.pop_front() {
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.available.wait_for(&mut deque, deadline - now);
        }
    }

    pub fn len(&self) -> usize {
        self.deque.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_with_head_insertion() {
        let queue = EventQueue::new();
        queue.post(DaemonEvent::BundleExpired { bundle_id: 1 });
        queue.post(DaemonEvent::BundleExpired { bundle_id: 2 });
        queue.post_at_head(DaemonEvent::Shutdown);

        let first = queue.pop(Duration::from_millis(10)).unwrap();
        assert!(matches!(first.event, DaemonEvent::Shutdown));
        let second = queue.pop(Duration::from_millis(10)).unwrap();
        assert!(matches!(
            second.event,
            DaemonEvent::BundleExpired { bundle_id: 1 }
        ));
    }

    #[test]
    fn test_pop_times_out() {
        let queue = EventQueue::new();
        assert!(queue.pop(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn test_post_and_wait_completion() {
        let queue = Arc::new(EventQueue::new());
        let worker_queue = queue.clone();
        let worker = std::thread::spawn(move || {
            let event = worker_queue.pop(Duration::from_secs(1)).unwrap();
            event.complete();
        });
        let ok = queue.post_and_wait(
            DaemonEvent::TryDeleteBundle { bundle_id: 3 },
            Duration::from_secs(1),
            false,
        );
        assert!(ok);
        worker.join().unwrap();
    }

    #[test]
    fn test_post_and_wait_timeout_leaves_event_queued() {
        let queue = EventQueue::new();
        let ok = queue.post_and_wait(
            DaemonEvent::TryDeleteBundle { bundle_id: 3 },
            Duration::from_millis(20),
            false,
        );
        assert!(!ok);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_default_processor_routing() {
        let event = DaemonEvent::StoreBundleDelete { bundle_id: 1 };
        assert_eq!(event.default_processor(), Processor::Storage);
        assert_eq!(DaemonEvent::Shutdown.default_processor(), Processor::Main);
    }
}
