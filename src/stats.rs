use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Gauge of currently open client connections
pub(crate) static ACTIVE_CONNECTIONS: ConnectionGauge = ConnectionGauge::new();

/// Counter of open connections with RAII decrement on guard drop
#[derive(Debug)]
pub(crate) struct ConnectionGauge {
    count: AtomicUsize,
}

impl ConnectionGauge {
    pub(crate) const fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
        }
    }

    /// Increment the gauge and return a guard that decrements on drop
    pub(crate) fn guard(&self) -> GaugeGuard<'_> {
        self.count.fetch_add(1, Ordering::Relaxed);
        GaugeGuard {
            gauge: self,
            decremented: false,
        }
    }

    /// Current number of open connections
    pub(crate) fn active(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

/// RAII guard to ensure the connection gauge is properly decremented
pub(crate) struct GaugeGuard<'a> {
    gauge: &'a ConnectionGauge,
    decremented: bool,
}

impl GaugeGuard<'_> {
    /// Manually decrement the gauge; further calls and the drop are no-ops
    pub(crate) fn decrement(&mut self) {
        if !self.decremented {
            self.gauge.count.fetch_sub(1, Ordering::Relaxed);
            self.decremented = true;
        }
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.decrement();
    }
}

/// Per-connection transfer counters (bytes)
#[derive(Debug, Default)]
pub struct TrafficCounters {
    from_client: AtomicU64,
    to_client: AtomicU64,
}

impl TrafficCounters {
    pub fn add_from_client(&self, n: u64) {
        self.from_client.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_to_client(&self, n: u64) {
        self.to_client.fetch_add(n, Ordering::Relaxed);
    }

    pub fn from_client(&self) -> u64 {
        self.from_client.load(Ordering::Relaxed)
    }

    pub fn to_client(&self) -> u64 {
        self.to_client.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (self.from_client(), self.to_client())
    }
}

/// Final transfer totals for one client connection, published when the
/// connection reaches its terminal state.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Bytes the client sent toward the target or upstream
    pub bytes_from_client: u64,
    /// Bytes relayed back to the client
    pub bytes_to_client: u64,
    /// Wall time the connection was open
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_guard_decrements_on_drop() {
        let gauge = ConnectionGauge::new();

        {
            let _guard = gauge.guard();
            assert_eq!(gauge.active(), 1);
        }

        assert_eq!(gauge.active(), 0);
    }

    #[test]
    fn gauge_guard_manual_decrement_is_idempotent() {
        let gauge = ConnectionGauge::new();

        {
            let mut guard = gauge.guard();
            assert_eq!(gauge.active(), 1);

            guard.decrement();
            assert_eq!(gauge.active(), 0);

            // Second decrement should be a no-op
            guard.decrement();
            assert_eq!(gauge.active(), 0);
        }

        // Drop should not decrement again
        assert_eq!(gauge.active(), 0);
    }

    #[test]
    fn traffic_counters_accumulate_per_direction() {
        let counters = TrafficCounters::default();

        counters.add_from_client(10);
        counters.add_from_client(5);
        counters.add_to_client(7);

        assert_eq!(counters.from_client(), 15);
        assert_eq!(counters.to_client(), 7);
        assert_eq!(counters.snapshot(), (15, 7));
    }
}
