//! In-process metrics for the sequencer
//!
//! Counters, gauges and latency histograms keyed by name, exported as JSON or
//! Prometheus text. Per-directory series append the directory id to the name
//! (`sequencer.revisions.created.<dir>`).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

/// Latency buckets in seconds
const DEFAULT_BUCKETS: [f64; 12] = [
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Named metric series
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
    gauges: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
    histograms: RwLock<BTreeMap<String, Arc<Histogram>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
            histograms: RwLock::new(BTreeMap::new()),
            start_time: Instant::now(),
        }
    }

    async fn series<T, F>(map: &RwLock<BTreeMap<String, Arc<T>>>, name: &str, init: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        if let Some(existing) = map.read().await.get(name) {
            return existing.clone();
        }
        map.write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(init()))
            .clone()
    }

    pub async fn inc_counter(&self, name: &str) {
        self.add_counter(name, 1).await;
    }

    pub async fn add_counter(&self, name: &str, value: u64) {
        Self::series(&self.counters, name, || AtomicU64::new(0))
            .await
            .fetch_add(value, Ordering::Relaxed);
    }

    pub async fn set_gauge(&self, name: &str, value: u64) {
        Self::series(&self.gauges, name, || AtomicU64::new(0))
            .await
            .store(value, Ordering::Relaxed);
    }

    pub async fn get_counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .await
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub async fn get_gauge(&self, name: &str) -> u64 {
        self.gauges
            .read()
            .await
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record one latency observation in seconds
    pub async fn observe_histogram(&self, name: &str, seconds: f64) {
        Self::series(&self.histograms, name, Histogram::default)
            .await
            .observe(seconds);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// All series as JSON
    pub async fn to_json(&self) -> serde_json::Value {
        let counters: BTreeMap<String, u64> = self
            .counters
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        let gauges: BTreeMap<String, u64> = self
            .gauges
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        let histograms: BTreeMap<String, serde_json::Value> = self
            .histograms
            .read()
            .await
            .iter()
            .map(|(k, h)| (k.clone(), h.to_json()))
            .collect();

        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }

    /// All series in Prometheus text exposition format
    pub async fn to_prometheus(&self) -> String {
        let mut out = String::new();
        out.push_str("# TYPE sequencer_uptime_seconds gauge\n");
        out.push_str(&format!("sequencer_uptime_seconds {}\n", self.uptime_seconds()));

        for (name, counter) in self.counters.read().await.iter() {
            let name = prometheus_name(name);
            out.push_str(&format!("# TYPE {name} counter\n"));
            out.push_str(&format!("{name} {}\n", counter.load(Ordering::Relaxed)));
        }
        for (name, gauge) in self.gauges.read().await.iter() {
            let name = prometheus_name(name);
            out.push_str(&format!("# TYPE {name} gauge\n"));
            out.push_str(&format!("{name} {}\n", gauge.load(Ordering::Relaxed)));
        }
        for (name, histogram) in self.histograms.read().await.iter() {
            out.push_str(&histogram.to_prometheus(&prometheus_name(name)));
        }
        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn prometheus_name(name: &str) -> String {
    name.replace(['.', '-'], "_")
}

/// Fixed-bucket histogram. The sum is kept in microseconds.
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, seconds: f64) {
        self.sum_micros
            .fetch_add((seconds.max(0.0) * 1e6) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        if let Some(i) = self.buckets.iter().position(|b| seconds <= *b) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn sum_seconds(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1e6
    }

    fn to_json(&self) -> serde_json::Value {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        serde_json::json!({
            "buckets": self.buckets,
            "counts": counts,
            "sum": self.sum_seconds(),
            "count": self.count(),
        })
    }

    fn to_prometheus(&self, name: &str) -> String {
        let mut out = format!("# TYPE {name} histogram\n");
        let mut cumulative = 0u64;
        for (bucket, count) in self.buckets.iter().zip(&self.counts) {
            cumulative += count.load(Ordering::Relaxed);
            out.push_str(&format!("{name}_bucket{{le=\"{bucket}\"}} {cumulative}\n"));
        }
        out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {}\n", self.count()));
        out.push_str(&format!("{name}_sum {}\n", self.sum_seconds()));
        out.push_str(&format!("{name}_count {}\n", self.count()));
        out
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKETS.to_vec())
    }
}

/// Metric names
pub mod metric_names {
    pub const BATCHES_DEFINED: &str = "sequencer.batches.defined";
    pub const BATCHES_BELOW_MIN: &str = "sequencer.batches.below_min";
    pub const REVISIONS_CREATED: &str = "sequencer.revisions.created";
    pub const ROOTS_PUBLISHED: &str = "sequencer.roots.published";

    pub const MUTATIONS_APPLIED: &str = "sequencer.mutations.applied";
    pub const MUTATIONS_DROPPED: &str = "sequencer.mutations.dropped";
    pub const LEAVES_WRITTEN: &str = "sequencer.leaves.written";

    pub const INTEGRITY_ERRORS: &str = "sequencer.errors.integrity";
    pub const VERIFICATION_ERRORS: &str = "sequencer.errors.verification";
    pub const TRANSIENT_ERRORS: &str = "sequencer.errors.transient";

    pub const RUN_BATCH_LATENCY: &str = "sequencer.run_batch.latency_seconds";
    pub const CREATE_REVISION_LATENCY: &str = "sequencer.create_revision.latency_seconds";
    pub const PUBLISH_LATENCY: &str = "sequencer.publish.latency_seconds";

    pub const LATEST_REVISION: &str = "sequencer.map.revision";
    pub const LOG_SIZE: &str = "sequencer.log.size";

    /// Per-directory series name
    pub fn for_directory(name: &str, directory_id: &str) -> String {
        format!("{name}.{directory_id}")
    }
}

/// Time an async operation into a histogram
pub async fn timed<F, T>(metrics: &MetricsRegistry, name: &str, f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = Instant::now();
    let result = f.await;
    metrics
        .observe_histogram(name, start.elapsed().as_secs_f64())
        .await;
    result
}
