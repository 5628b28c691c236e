// src/metrics.rs
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters owned by one worker; the reporter thread only loads them.
#[derive(Default)]
pub struct WorkerMetrics {
    active_connections: AtomicU64,
    requests_served: AtomicU64,
    bytes_written: AtomicU64,
}

impl WorkerMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_conn(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_request(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsSnapshot {
    pub active_connections: u64,
    pub requests_served: u64,
    pub bytes_written: u64,
}

impl std::ops::Add for MetricsSnapshot {
    type Output = MetricsSnapshot;

    fn add(self, rhs: Self) -> Self::Output {
        MetricsSnapshot {
            active_connections: self.active_connections + rhs.active_connections,
            requests_served: self.requests_served + rhs.requests_served,
            bytes_written: self.bytes_written + rhs.bytes_written,
        }
    }
}

/// Spawns the background reporter thread that logs the aggregate across all
/// workers every `interval` seconds until shutdown is observed.
pub fn spawn_reporter(
    workers: Vec<Arc<WorkerMetrics>>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    interval: std::time::Duration,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("ringhttpd-metrics".to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::Acquire) {
                std::thread::sleep(interval);
                let total = workers
                    .iter()
                    .map(|m| m.snapshot())
                    .fold(MetricsSnapshot::default(), |a, b| a + b);
                tracing::info!(
                    active_connections = total.active_connections,
                    requests_served = total.requests_served,
                    bytes_written = total.bytes_written,
                    "metrics"
                );
            }
        })
        .expect("failed to spawn metrics reporter thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_snapshot() {
        let metrics = WorkerMetrics::new();
        metrics.inc_conn();
        metrics.inc_conn();
        metrics.dec_conn();
        metrics.inc_request();
        metrics.add_bytes(128);

        let snap = metrics.snapshot();
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.requests_served, 1);
        assert_eq!(snap.bytes_written, 128);
    }

    #[test]
    fn snapshots_sum_across_workers() {
        let a = MetricsSnapshot {
            active_connections: 1,
            requests_served: 2,
            bytes_written: 3,
        };
        let b = MetricsSnapshot {
            active_connections: 4,
            requests_served: 5,
            bytes_written: 6,
        };
        let total = a + b;
        assert_eq!(total.active_connections, 5);
        assert_eq!(total.requests_served, 7);
        assert_eq!(total.bytes_written, 9);
    }
}
