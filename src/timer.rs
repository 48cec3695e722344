// Timer service
//
// A monotonic priority queue of scheduled callbacks serviced by one
// thread. Expiration, custody retransmit, LTP checkpoint/report/cancel
// retransmit, inactivity and closeout timers all run here. Cancelled
// entries are left in the heap and reaped when their deadline arrives;
// a cancelled token is never fired.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Cancellation handle for a scheduled timer.
#[derive(Debug, Clone)]
pub struct TimerToken {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl TimerToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// A cancel on a timer that is firing concurrently is a no-op; the
    /// callback observes the flag before touching any owner state.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    callback: Option<Box<dyn FnOnce() + Send>>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // min-heap on (deadline, seq)
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct SharedState {
    heap: Mutex<BinaryHeap<TimerEntry>>,
    wakeup: Condvar,
    paused: AtomicBool,
    should_stop: AtomicBool,
    next_seq: AtomicU64,
}

pub struct TimerService {
    shared: Arc<SharedState>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub fn start(name: &str) -> Self {
        let shared = Arc::new(SharedState {
            heap: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
            paused: AtomicBool::new(false),
            should_stop: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        });
        let worker = shared.clone();
        let thread = std::thread::Builder::new()
            .name(format!("{}-timer", name))
            .spawn(move || run(worker))
            .expect("spawn timer thread");
        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    pub fn schedule_after(
        &self,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerToken {
        self.schedule_at(Instant::now() + delay, callback)
    }

    pub fn schedule_at(
        &self,
        deadline: Instant,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerToken {
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let token = TimerToken {
            id: seq,
            cancelled: cancelled.clone(),
        };
        let mut heap = self.shared.heap.lock();
        heap.push(TimerEntry {
            deadline,
            seq,
            cancelled,
            callback: Some(Box::new(callback)),
        });
        drop(heap);
        self.shared.wakeup.notify_one();
        token
    }

    /// Stop dispatching without discarding entries (shutdown phase a).
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
        self.shared.wakeup.notify_one();
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
        self.shared.wakeup.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.shared.heap.lock().len()
    }

    pub fn shutdown(&self) {
        self.shared.should_stop.store(true, Ordering::Release);
        self.shared.wakeup.notify_one();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<SharedState>) {
    loop {
        if shared.should_stop.load(Ordering::Acquire) {
            return;
        }
        let mut fired: Option<Box<dyn FnOnce() + Send>> = None;
        {
            let mut heap = shared.heap.lock();
            if shared.paused.load(Ordering::Acquire) {
                shared.wakeup.wait_for(&mut heap, Duration::from_millis(100));
            } else {
                match heap.peek() {
                    None => {
                        shared.wakeup.wait_for(&mut heap, Duration::from_secs(1));
                    }
                    Some(entry) => {
                        let now = Instant::now();
                        if entry.deadline <= now {
                            let mut entry = heap.pop().expect("peeked entry");
                            if !entry.cancelled.load(Ordering::Acquire) {
                                fired = entry.callback.take();
                            }
                        } else {
                            let wait = entry.deadline - now;
                            shared.wakeup.wait_for(&mut heap, wait);
                        }
                    }
                }
            }
        }
        // fire outside the heap lock so callbacks may reschedule
        if let Some(callback) = fired {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_fires_in_deadline_order() {
        let service = TimerService::start("test");
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());
        service.schedule_after(Duration::from_millis(60), move || o2.lock().push(2));
        service.schedule_after(Duration::from_millis(20), move || o1.lock().push(1));
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(*order.lock(), vec![1, 2]);
        service.shutdown();
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let service = TimerService::start("test");
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let token = service.schedule_after(Duration::from_millis(30), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        // cancelled entry was reaped on fire
        assert_eq!(service.pending(), 0);
        service.shutdown();
    }

    #[test]
    fn test_pause_defers_firing() {
        let service = TimerService::start("test");
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        service.pause();
        service.schedule_after(Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        service.resume();
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        service.shutdown();
    }
}
