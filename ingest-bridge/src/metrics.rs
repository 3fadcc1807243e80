use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

/// Pipeline counters and connection flags, shared between the consumer loop and the
/// health endpoint. Every access goes through one lock.
#[derive(Debug)]
pub struct Metrics {
    inner: Mutex<MetricsState>,
}

#[derive(Debug)]
struct MetricsState {
    events_consumed: u64,
    events_inserted: u64,
    batches_flushed: u64,
    errors: u64,
    bus_connected: bool,
    sink_connected: bool,
    last_flush_at: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub status: String,
    pub bus_connected: bool,
    pub sink_connected: bool,
    pub events_consumed: u64,
    pub events_inserted: u64,
    pub batches_flushed: u64,
    pub errors: u64,
    pub last_flush_at: Option<String>,
    pub started_at: String,
}

impl MetricsSnapshot {
    pub fn is_healthy(&self) -> bool { self.bus_connected && self.sink_connected }
}

impl Default for Metrics {
    fn default() -> Self { Self::new() }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsState {
                events_consumed: 0,
                events_inserted: 0,
                batches_flushed: 0,
                errors: 0,
                bus_connected: false,
                sink_connected: false,
                last_flush_at: None,
                started_at: Utc::now(),
            }),
        }
    }

    pub fn record_consume(&self, n: u64) { self.lock().events_consumed += n; }

    /// Counts a successfully flushed batch of `n` rows.
    pub fn record_insert(&self, n: u64) {
        let mut state = self.lock();
        state.events_inserted += n;
        state.batches_flushed += 1;
        state.last_flush_at = Some(Utc::now());
    }

    pub fn record_error(&self, n: u64) { self.lock().errors += n; }

    pub fn set_bus_connected(&self, connected: bool) { self.lock().bus_connected = connected; }

    pub fn set_sink_connected(&self, connected: bool) { self.lock().sink_connected = connected; }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.lock();
        let healthy = state.bus_connected && state.sink_connected;
        MetricsSnapshot {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            bus_connected: state.bus_connected,
            sink_connected: state.sink_connected,
            events_consumed: state.events_consumed,
            events_inserted: state.events_inserted,
            batches_flushed: state.batches_flushed,
            errors: state.errors,
            last_flush_at: state.last_flush_at.map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            started_at: state.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        // Counters stay meaningful even if a holder panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn concurrent_updates_are_not_lost() {
        let metrics = Arc::new(Metrics::new());
        let threads = 8;
        let per_thread = 1_000;
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let metrics = metrics.clone();
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        metrics.record_consume(1);
                        metrics.record_insert(1);
                        metrics.record_error(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker thread");
        }
        let snap = metrics.snapshot();
        let expected = (threads * per_thread) as u64;
        assert_eq!(snap.events_consumed, expected);
        assert_eq!(snap.events_inserted, expected);
        assert_eq!(snap.batches_flushed, expected);
        assert_eq!(snap.errors, expected);
    }

    #[test]
    fn status_requires_both_connections() {
        let metrics = Metrics::new();
        for (bus, sink, expected) in [
            (false, false, "unhealthy"),
            (true, false, "unhealthy"),
            (false, true, "unhealthy"),
            (true, true, "healthy"),
        ] {
            metrics.set_bus_connected(bus);
            metrics.set_sink_connected(sink);
            let snap = metrics.snapshot();
            assert_eq!(snap.status, expected, "bus={bus} sink={sink}");
            assert_eq!(snap.is_healthy(), expected == "healthy");
        }
    }

    #[test]
    fn insert_stamps_last_flush() {
        let metrics = Metrics::new();
        assert!(metrics.snapshot().last_flush_at.is_none());
        metrics.record_insert(3);
        let snap = metrics.snapshot();
        assert_eq!(snap.events_inserted, 3);
        assert_eq!(snap.batches_flushed, 1);
        assert!(snap.last_flush_at.is_some());
    }
}
