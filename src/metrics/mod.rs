// Process-wide counters. Constructed once by the relay and passed down
// explicitly; exporters are external and read these through the relay.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    requests: AtomicU64,
    stream_connections: AtomicI64,
    events_received: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn stream_opened(&self) {
        self.stream_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_closed(&self) {
        self.stream_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn stream_connections(&self) -> i64 {
        self.stream_connections.load(Ordering::Relaxed)
    }

    pub fn record_events(&self, count: u64) {
        self.events_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_request();
        metrics.record_request();
        metrics.stream_opened();
        metrics.stream_closed();
        metrics.record_events(3);

        assert_eq!(metrics.requests(), 2);
        assert_eq!(metrics.stream_connections(), 0);
        assert_eq!(metrics.events_received(), 3);
    }
}
