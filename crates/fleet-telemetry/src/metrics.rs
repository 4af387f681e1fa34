use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Metric names emitted by the worker.
pub mod names {
    pub const RUNS_CLAIMED: &str = "fleet_runs_claimed_total";
    pub const RUNS_FINISHED: &str = "fleet_runs_finished_total";
    pub const RUN_RETRIES: &str = "fleet_run_retries_total";
    pub const RUNS_REQUEUED: &str = "fleet_runs_requeued_total";
    pub const RUNS_REAPED: &str = "fleet_runs_reaped_total";
    pub const SCHEDULE_FIRES: &str = "fleet_schedule_fires_total";
    pub const ROTATIONS: &str = "fleet_secret_rotations_total";
    pub const LEASES_REVOKED: &str = "fleet_leases_revoked_total";
    pub const LOOP_ERRORS: &str = "fleet_loop_errors_total";
    pub const QUEUE_DEPTH: &str = "fleet_queue_depth";
    pub const RUN_DURATION: &str = "fleet_run_duration_seconds";
}

// Lock poisoning only means another thread panicked mid-update; the atomics
// inside are still usable.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Bucketed distribution of observed values.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum_bits: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_bits: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .sum_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        for (i, boundary) in self.buckets.iter().enumerate() {
            if value <= *boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Run durations range from seconds to the half-hour timeout.
fn run_duration_buckets() -> Vec<f64> {
    vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted key=value pairs distinguishing series of one counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Thread-safe registry of counters, gauges and histograms.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    gauges: RwLock<AHashMap<String, AtomicI64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = read(&self.counters);
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        write(&self.counters)
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.counters)
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn set_gauge(&self, name: &str, value: i64) {
        {
            let map = read(&self.gauges);
            if let Some(g) = map.get(name) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        write(&self.gauges)
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        read(&self.gauges)
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a value; unknown histograms are created with run-duration buckets.
    pub fn record_histogram(&self, name: &str, value: f64) {
        {
            let map = read(&self.histograms);
            if let Some(h) = map.get(name) {
                h.observe(value);
                return;
            }
        }
        write(&self.histograms)
            .entry(name.to_string())
            .or_insert_with(|| Histogram::new(run_duration_buckets()))
            .observe(value);
    }

    pub fn observe_duration(&self, name: &str, elapsed: Duration) {
        self.record_histogram(name, elapsed.as_secs_f64());
    }

    /// (count, sum) of a histogram, zero when never observed.
    pub fn histogram_totals(&self, name: &str) -> (u64, f64) {
        read(&self.histograms)
            .get(name)
            .map(|h| (h.count(), h.sum()))
            .unwrap_or((0, 0.0))
    }

    /// Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = read(&self.counters);
            let mut grouped: AHashMap<&str, Vec<(&Labels, u64)>> = AHashMap::new();
            for ((name, labels), val) in map.iter() {
                grouped
                    .entry(name.as_str())
                    .or_default()
                    .push((labels, val.load(Ordering::Relaxed)));
            }
            let mut names: Vec<&str> = grouped.keys().copied().collect();
            names.sort_unstable();
            for name in names {
                out.push_str(&format!("# TYPE {} counter\n", name));
                let mut series = grouped[name].clone();
                series.sort_by_key(|(labels, _)| labels.prometheus_str());
                for (labels, value) in series {
                    out.push_str(&format!("{}{} {}\n", name, labels.prometheus_str(), value));
                }
            }
        }

        {
            let map = read(&self.gauges);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                out.push_str(&format!("# TYPE {} gauge\n", name));
                out.push_str(&format!("{} {}\n", name, map[name].load(Ordering::Relaxed)));
            }
        }

        {
            let map = read(&self.histograms);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let h = &map[name];
                out.push_str(&format!("# TYPE {} histogram\n", name));
                for (i, boundary) in h.buckets.iter().enumerate() {
                    out.push_str(&format!(
                        "{}_bucket{{le=\"{}\"}} {}\n",
                        name,
                        boundary,
                        h.counts[i].load(Ordering::Relaxed)
                    ));
                }
                out.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, h.count()));
                out.push_str(&format!("{}_sum {}\n", name, h.sum()));
                out.push_str(&format!("{}_count {}\n", name, h.count()));
            }
        }

        out
    }

    /// Counters and gauges as JSON, for the shutdown summary log line.
    pub fn snapshot_json(&self) -> serde_json::Value {
        let mut counters = serde_json::Map::new();
        for ((name, labels), val) in read(&self.counters).iter() {
            counters.insert(
                format!("{}{}", name, labels.prometheus_str()),
                serde_json::json!(val.load(Ordering::Relaxed)),
            );
        }
        let mut gauges = serde_json::Map::new();
        for (name, val) in read(&self.gauges).iter() {
            gauges.insert(name.clone(), serde_json::json!(val.load(Ordering::Relaxed)));
        }
        serde_json::json!({ "counters": counters, "gauges": gauges })
    }
}

/// Process-wide collector shared by every worker loop.
pub fn global_metrics() -> &'static MetricsCollector {
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::new)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
