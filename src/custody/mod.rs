// Custody transfer
//
// Custody ids are allocated daemon-wide; custody timers are per
// (bundle, link) with bounded retries, carry a weak bundle handle and
// resolve it on fire so a reaped bundle can never be touched by a late
// timer. The aggregate-signalling layer lives in `acs`.

pub mod acs;

pub use acs::{AcsKey, AcsParams, AcsStats, AcsSubsystem, InsertOp, InsertOutcome, PendingAcsRecord};

use crate::bundle::{Bundle, BundleRef, ForwardingState};
use crate::event::{DaemonEvent, EventQueue};
use crate::timer::TimerService;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Monotonic custody-id source shared by custody and ACS.
pub struct CustodyIdAllocator {
    next: AtomicU64,
}

impl CustodyIdAllocator {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start.max(1)),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Per-(bundle, link) retransmission bookkeeping.
pub struct CustodyTimers {
    attempts: Mutex<HashMap<(u64, String), u32>>,
}

impl Default for CustodyTimers {
    fn default() -> Self {
        Self::new()
    }
}

impl CustodyTimers {
    pub fn new() -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Arm a custody timer after transmission on `link`. Returns the
    /// attempt number, or None once retries are exhausted.
    pub fn start(
        &self,
        timers: &TimerService,
        main_queue: Arc<EventQueue>,
        bundle: &BundleRef,
        link: &str,
        interval: Duration,
        max_retries: u32,
    ) -> Option<u32> {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let counter = attempts.entry((bundle.id, link.to_string())).or_insert(0);
            *counter += 1;
            *counter
        };
        if attempt > max_retries {
            return None;
        }

        let weak: Weak<Bundle> = Arc::downgrade(bundle);
        let link_name = link.to_string();
        let token = timers.schedule_after(interval, move || {
            // the bundle may be long gone; a dead weak is a no-op
            if let Some(bundle) = weak.upgrade() {
                main_queue.post(DaemonEvent::CustodyTimeout {
                    bundle_id: bundle.id,
                    link: link_name.clone(),
                });
            }
        });
        bundle.with_state(|s| s.custody_timers.push(token));
        debug!(bundle = bundle.id, link, attempt, "custody timer armed");
        Some(attempt)
    }

    /// On fire, the forwarding log flips TRANSMITTED to CUSTODY_TIMEOUT
    /// so the router re-decides the bundle.
    pub fn handle_timeout(&self, bundle: &BundleRef, link: &str) {
        if bundle.fwd_log_state(link) == Some(ForwardingState::Transmitted) {
            bundle.fwd_log_update(link, ForwardingState::CustodyTimeout);
        }
    }

    pub fn attempts(&self, bundle_id: u64, link: &str) -> u32 {
        self.attempts
            .lock()
            .get(&(bundle_id, link.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Cancel every outstanding timer for the bundle; their bundle
    /// references (weak handles) die with the tokens.
    pub fn cancel_all(&self, bundle: &BundleRef) {
        bundle.with_state(|s| {
            for token in s.custody_timers.drain(..) {
                token.cancel();
            }
        });
        self.attempts.lock().retain(|(id, _), _| *id != bundle.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{ForwardingAction, Payload};
    use crate::naming::EndpointId;

    fn test_bundle(id: u64) -> BundleRef {
        Bundle::builder(EndpointId::ipn(1, 1), EndpointId::ipn(2, 1))
            .payload(Payload::in_memory(vec![0; 8]))
            .custody_requested()
            .build(id)
    }

    #[test]
    fn test_timer_fires_and_posts_timeout() {
        let timers = TimerService::start("test");
        let queue = Arc::new(EventQueue::new());
        let custody = CustodyTimers::new();
        let bundle = test_bundle(1);
        bundle.fwd_log_add(
            "lnk",
            ForwardingAction::ForwardAction,
            ForwardingState::Transmitted,
        );

        custody
            .start(
                &timers,
                queue.clone(),
                &bundle,
                "lnk",
                Duration::from_millis(20),
                3,
            )
            .unwrap();
        let event = queue.pop(Duration::from_secs(1)).expect("timeout event");
        match &event.event {
            DaemonEvent::CustodyTimeout { bundle_id, link } => {
                assert_eq!(*bundle_id, 1);
                assert_eq!(link, "lnk");
            }
            other => panic!("unexpected event {:?}", other),
        }
        custody.handle_timeout(&bundle, "lnk");
        assert_eq!(
            bundle.fwd_log_state("lnk"),
            Some(ForwardingState::CustodyTimeout)
        );
        timers.shutdown();
    }

    #[test]
    fn test_retries_bounded() {
        let timers = TimerService::start("test");
        let queue = Arc::new(EventQueue::new());
        let custody = CustodyTimers::new();
        let bundle = test_bundle(2);
        for _ in 0..2 {
            assert!(custody
                .start(
                    &timers,
                    queue.clone(),
                    &bundle,
                    "lnk",
                    Duration::from_secs(60),
                    2,
                )
                .is_some());
        }
        assert!(custody
            .start(
                &timers,
                queue.clone(),
                &bundle,
                "lnk",
                Duration::from_secs(60),
                2,
            )
            .is_none());
        timers.shutdown();
    }

    #[test]
    fn test_cancelled_timer_never_posts() {
        let timers = TimerService::start("test");
        let queue = Arc::new(EventQueue::new());
        let custody = CustodyTimers::new();
        let bundle = test_bundle(3);
        custody
            .start(
                &timers,
                queue.clone(),
                &bundle,
                "lnk",
                Duration::from_millis(20),
                3,
            )
            .unwrap();
        custody.cancel_all(&bundle);
        assert_eq!(custody.attempts(3, "lnk"), 0);
        assert!(queue.pop(Duration::from_millis(100)).is_none());
        assert!(bundle.with_state(|s| s.custody_timers.is_empty()));
        timers.shutdown();
    }
}
