// Global bundle counters
//
// One terminal disposition per bundle: delivered, expired, deleted or
// rejected; everything else is still pending. Over any interval with
// no reset, received = delivered + expired + deleted + rejected +
// still-pending.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct DaemonCounters {
    pub received: AtomicU64,
    pub delivered: AtomicU64,
    pub transmitted: AtomicU64,
    pub expired: AtomicU64,
    pub duplicate: AtomicU64,
    pub deleted: AtomicU64,
    pub injected: AtomicU64,
    pub rejected: AtomicU64,
    pub suppressed_delivery: AtomicU64,
    pub events_processed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub received: u64,
    pub delivered: u64,
    pub transmitted: u64,
    pub expired: u64,
    pub duplicate: u64,
    pub deleted: u64,
    pub injected: u64,
    pub rejected: u64,
    pub suppressed_delivery: u64,
    pub events_processed: u64,
}

impl DaemonCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            transmitted: self.transmitted.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            duplicate: self.duplicate.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            injected: self.injected.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            suppressed_delivery: self.suppressed_delivery.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.received,
            &self.delivered,
            &self.transmitted,
            &self.expired,
            &self.duplicate,
            &self.deleted,
            &self.injected,
            &self.rejected,
            &self.suppressed_delivery,
            &self.events_processed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Text dump for the command surface.
    pub fn dump(&self, still_pending: usize) -> String {
        let s = self.snapshot();
        format!(
            "received: {} delivered: {} transmitted: {} expired: {} \
             duplicate: {} deleted: {} injected: {} rejected: {} \
             suppressed_delivery: {} pending: {}",
            format_num_with_magnitude(s.received),
            format_num_with_magnitude(s.delivered),
            format_num_with_magnitude(s.transmitted),
            format_num_with_magnitude(s.expired),
            format_num_with_magnitude(s.duplicate),
            format_num_with_magnitude(s.deleted),
            format_num_with_magnitude(s.injected),
            format_num_with_magnitude(s.rejected),
            format_num_with_magnitude(s.suppressed_delivery),
            format_num_with_magnitude(still_pending as u64),
        )
    }
}

/// Humanize a counter: 999 and below verbatim, then K/M/G/T/P with a
/// trailing + when truncation lost precision.
pub fn format_num_with_magnitude(val: u64) -> String {
    const STEPS: [(u64, &str); 5] = [
        (1_000_000_000_000_000, "P"),
        (1_000_000_000_000, "T"),
        (1_000_000_000, "G"),
        (1_000_000, "M"),
        (1_000, "K"),
    ];
    if val >= 1_000_000_000_000_000_000 {
        return "999P+".to_string();
    }
    for (divisor, magnitude) in STEPS {
        if val >= divisor {
            let plus = if val % divisor > 0 { "+" } else { "" };
            return format!("{}{}{}", val / divisor, magnitude, plus);
        }
    }
    format!("{}", val)
}

/// Humanize a bit rate.
pub fn format_num_as_rate(val: u64) -> String {
    const STEPS: [(u64, &str); 3] = [
        (1_000_000_000, "Gbps"),
        (1_000_000, "Mbps"),
        (1_000, "Kbps"),
    ];
    if val >= 1_000_000_000_000 {
        return "999Gbps+".to_string();
    }
    for (divisor, magnitude) in STEPS {
        if val >= divisor {
            let plus = if val % divisor > 0 { "+" } else { "" };
            return format!("{}{}{}", val / divisor, magnitude, plus);
        }
    }
    format!("{}bps", val)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magnitude_formatting() {
        assert_eq!(format_num_with_magnitude(0), "0");
        assert_eq!(format_num_with_magnitude(999), "999");
        assert_eq!(format_num_with_magnitude(1000), "1K");
        assert_eq!(format_num_with_magnitude(1500), "1K+");
        assert_eq!(format_num_with_magnitude(2_000_000), "2M");
        assert_eq!(format_num_with_magnitude(u64::MAX), "999P+");
    }

    #[test]
    fn test_rate_formatting() {
        assert_eq!(format_num_as_rate(512), "512bps");
        assert_eq!(format_num_as_rate(1_000_000), "1Mbps");
        assert_eq!(format_num_as_rate(1_500_000), "1Mbps+");
    }

    #[test]
    fn test_reset() {
        let counters = DaemonCounters::new();
        counters.bump(&counters.received);
        counters.bump(&counters.received);
        assert_eq!(counters.snapshot().received, 2);
        counters.reset();
        assert_eq!(counters.snapshot().received, 0);
    }
}
