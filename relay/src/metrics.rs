//! Metrics Collection for the relay tunnel
//!
//! Atomic call/connect counters and ring-buffer latency histograms for relayed
//! calls and heartbeat round trips, with a Prometheus text rendering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;

const HISTOGRAM_CAPACITY: usize = 10_000;

/// Tunnel-wide metrics
#[derive(Clone)]
pub struct RelayMetrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    started: Instant,
    /// Relayed calls issued (passthrough) or served (handler)
    rpc_count: AtomicU64,
    /// Tunnel connections established
    connect_count: AtomicU64,
    rpc_latencies: Mutex<LatencyHistogram>,
    ping_latencies: Mutex<LatencyHistogram>,
}

/// Latency histogram for percentile calculation
struct LatencyHistogram {
    /// Recent latencies (ring buffer, microseconds)
    values: Vec<u64>,
    /// Write position
    pos: usize,
    /// Total count
    count: u64,
    /// Sum for average
    sum: u64,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            values: vec![0; capacity],
            pos: 0,
            count: 0,
            sum: 0,
        }
    }

    fn record(&mut self, latency_us: u64) {
        self.values[self.pos] = latency_us;
        self.pos = (self.pos + 1) % self.values.len();
        self.count += 1;
        self.sum = self.sum.saturating_add(latency_us);
    }

    fn percentile(&self, p: f64) -> u64 {
        let count = self.count.min(self.values.len() as u64) as usize;
        if count == 0 {
            return 0;
        }

        let mut sorted: Vec<u64> = if self.count < self.values.len() as u64 {
            self.values[..count].to_vec()
        } else {
            self.values.clone()
        };
        sorted.sort_unstable();

        let idx = ((count as f64 * p / 100.0) as usize).min(count - 1);
        sorted[idx]
    }

    fn average(&self) -> u64 {
        if self.count == 0 { 0 } else { self.sum / self.count }
    }

    fn summary(&self) -> LatencySummary {
        LatencySummary {
            count: self.count,
            avg_us: self.average(),
            p50_us: self.percentile(50.0),
            p95_us: self.percentile(95.0),
            p99_us: self.percentile(99.0),
        }
    }
}

/// Snapshot of one latency histogram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub count: u64,
    pub avg_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                started: Instant::now(),
                rpc_count: AtomicU64::new(0),
                connect_count: AtomicU64::new(0),
                rpc_latencies: Mutex::new(LatencyHistogram::new(HISTOGRAM_CAPACITY)),
                ping_latencies: Mutex::new(LatencyHistogram::new(HISTOGRAM_CAPACITY)),
            }),
        }
    }

    pub fn count_rpc(&self) {
        self.inner.rpc_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_connect(&self) {
        self.inner.connect_count.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn record_rpc_latency(&self, latency: Duration) {
        self.inner
            .rpc_latencies
            .lock()
            .await
            .record(latency.as_micros() as u64);
    }

    pub async fn record_ping_latency(&self, latency: Duration) {
        self.inner
            .ping_latencies
            .lock()
            .await
            .record(latency.as_micros() as u64);
    }

    pub fn rpc_count(&self) -> u64 {
        self.inner.rpc_count.load(Ordering::Relaxed)
    }

    pub fn connect_count(&self) -> u64 {
        self.inner.connect_count.load(Ordering::Relaxed)
    }

    /// Average relayed calls per minute since the metrics were created.
    pub fn rpc_rate_per_min(&self) -> f64 {
        let minutes = self.inner.started.elapsed().as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        self.rpc_count() as f64 / minutes
    }

    pub async fn rpc_latency(&self) -> LatencySummary {
        self.inner.rpc_latencies.lock().await.summary()
    }

    pub async fn ping_latency(&self) -> LatencySummary {
        self.inner.ping_latencies.lock().await.summary()
    }

    /// Generate Prometheus-format metrics text
    pub async fn to_prometheus(&self, mode: &str, connected: bool) -> String {
        let rpc = self.rpc_latency().await;
        let ping = self.ping_latency().await;

        format!(
r#"# HELP chatops_relay_connected Whether the relay tunnel is connected
# TYPE chatops_relay_connected gauge
chatops_relay_connected{{mode="{mode}"}} {}

# HELP chatops_relay_connects_total Tunnel connections established
# TYPE chatops_relay_connects_total counter
chatops_relay_connects_total{{mode="{mode}"}} {}

# HELP chatops_relay_rpcs_total Relayed calls
# TYPE chatops_relay_rpcs_total counter
chatops_relay_rpcs_total{{mode="{mode}"}} {}

# HELP chatops_relay_rpc_latency_us Relayed call latency in microseconds
# TYPE chatops_relay_rpc_latency_us summary
chatops_relay_rpc_latency_us{{quantile="0.5"}} {}
chatops_relay_rpc_latency_us{{quantile="0.95"}} {}
chatops_relay_rpc_latency_us{{quantile="0.99"}} {}
chatops_relay_rpc_latency_us_avg {}

# HELP chatops_relay_ping_latency_us Heartbeat round trip in microseconds
# TYPE chatops_relay_ping_latency_us summary
chatops_relay_ping_latency_us{{quantile="0.5"}} {}
chatops_relay_ping_latency_us{{quantile="0.95"}} {}
chatops_relay_ping_latency_us{{quantile="0.99"}} {}
chatops_relay_ping_latency_us_avg {}
"#,
            connected as u8,
            self.connect_count(),
            self.rpc_count(),
            rpc.p50_us, rpc.p95_us, rpc.p99_us, rpc.avg_us,
            ping.p50_us, ping.p95_us, ping.p99_us, ping.avg_us,
        )
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
