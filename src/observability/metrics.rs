// Lifecycle metrics
//
// Counters and gauges for admission, reaping, garbage collection and launches, plus a
// sweep latency histogram. Exported in Prometheus text format by `monitor --metrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::observability::audit::EventKind;

/// Counter metric (monotonically increasing)
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Histogram bucket for latency tracking
#[derive(Debug)]
pub struct HistogramBucket {
    pub le: f64, // upper bound in seconds
    pub count: AtomicU64,
}

/// Histogram metric for latency/duration tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum: AtomicU64, // microseconds
    count: AtomicU64,
}

impl Histogram {
    /// Buckets sized for sweeps that shell out once per session
    pub fn new_sweep() -> Self {
        let buckets = [0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
            .into_iter()
            .map(|le| HistogramBucket {
                le,
                count: AtomicU64::new(0),
            })
            .collect();

        Self {
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum_micros(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn get_bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 0.0001)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct MetricsRegistry {
    pub admissions_granted: Counter,
    pub admissions_refused: Counter,
    pub idle_stops: Counter,
    pub memory_warnings: Counter,
    pub memory_kills: Counter,
    pub gc_instances_removed: Counter,
    pub gc_volumes_removed: Counter,
    pub sessions_launched: Counter,
    pub launch_failures: Counter,
    pub verification_warnings: Counter,
    pub inspect_failures: Counter,
    pub inspect_timeouts: Counter,
    pub sweeps_total: Counter,

    pub sessions_live: Gauge,

    pub sweep_latency: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            admissions_granted: Counter::new(),
            admissions_refused: Counter::new(),
            idle_stops: Counter::new(),
            memory_warnings: Counter::new(),
            memory_kills: Counter::new(),
            gc_instances_removed: Counter::new(),
            gc_volumes_removed: Counter::new(),
            sessions_launched: Counter::new(),
            launch_failures: Counter::new(),
            verification_warnings: Counter::new(),
            inspect_failures: Counter::new(),
            inspect_timeouts: Counter::new(),
            sweeps_total: Counter::new(),
            sessions_live: Gauge::new(),
            sweep_latency: Histogram::new_sweep(),
        }
    }

    /// Count one lifecycle event
    pub fn record_event(&self, kind: EventKind) {
        match kind {
            EventKind::AdmissionGranted => self.admissions_granted.inc(),
            EventKind::AdmissionRefused => self.admissions_refused.inc(),
            EventKind::IdleStop => self.idle_stops.inc(),
            EventKind::MemoryWarn => self.memory_warnings.inc(),
            EventKind::MemoryKill => self.memory_kills.inc(),
            EventKind::GcRemove => self.gc_instances_removed.inc(),
            EventKind::GcVolumeRemove => self.gc_volumes_removed.inc(),
            EventKind::SessionLaunched => self.sessions_launched.inc(),
            EventKind::LaunchFailed => self.launch_failures.inc(),
            EventKind::VerificationWarning => self.verification_warnings.inc(),
            EventKind::InspectFailed => self.inspect_failures.inc(),
            EventKind::InspectTimeout => self.inspect_timeouts.inc(),
            EventKind::SessionStopped | EventKind::SessionDestroyed => {}
        }
    }

    pub fn record_sweep(&self, elapsed: Duration, live: usize) {
        self.sweeps_total.inc();
        self.sweep_latency.observe(elapsed);
        self.sessions_live.set(live as u64);
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP sessionbox_admissions_total Admission decisions\n");
        output.push_str("# TYPE sessionbox_admissions_total counter\n");
        output.push_str(&format!(
            "sessionbox_admissions_total{{outcome=\"granted\"}} {}\n",
            self.admissions_granted.get()
        ));
        output.push_str(&format!(
            "sessionbox_admissions_total{{outcome=\"refused\"}} {}\n",
            self.admissions_refused.get()
        ));

        output.push_str("# HELP sessionbox_reaps_total Reap decisions acted on or logged\n");
        output.push_str("# TYPE sessionbox_reaps_total counter\n");
        output.push_str(&format!(
            "sessionbox_reaps_total{{decision=\"idle-stop\"}} {}\n",
            self.idle_stops.get()
        ));
        output.push_str(&format!(
            "sessionbox_reaps_total{{decision=\"memory-warn\"}} {}\n",
            self.memory_warnings.get()
        ));
        output.push_str(&format!(
            "sessionbox_reaps_total{{decision=\"memory-kill\"}} {}\n",
            self.memory_kills.get()
        ));

        output.push_str("# HELP sessionbox_gc_removed_total Objects removed by garbage collection\n");
        output.push_str("# TYPE sessionbox_gc_removed_total counter\n");
        output.push_str(&format!(
            "sessionbox_gc_removed_total{{object=\"instance\"}} {}\n",
            self.gc_instances_removed.get()
        ));
        output.push_str(&format!(
            "sessionbox_gc_removed_total{{object=\"volume\"}} {}\n",
            self.gc_volumes_removed.get()
        ));

        output.push_str("# HELP sessionbox_launches_total Session launches\n");
        output.push_str("# TYPE sessionbox_launches_total counter\n");
        output.push_str(&format!(
            "sessionbox_launches_total{{outcome=\"started\"}} {}\n",
            self.sessions_launched.get()
        ));
        output.push_str(&format!(
            "sessionbox_launches_total{{outcome=\"failed\"}} {}\n",
            self.launch_failures.get()
        ));
        output.push_str(&format!(
            "sessionbox_verification_warnings_total {}\n",
            self.verification_warnings.get()
        ));

        output.push_str("# HELP sessionbox_inspect_errors_total Skipped per-session inspections\n");
        output.push_str("# TYPE sessionbox_inspect_errors_total counter\n");
        output.push_str(&format!(
            "sessionbox_inspect_errors_total{{reason=\"failed\"}} {}\n",
            self.inspect_failures.get()
        ));
        output.push_str(&format!(
            "sessionbox_inspect_errors_total{{reason=\"timeout\"}} {}\n",
            self.inspect_timeouts.get()
        ));

        output.push_str("# HELP sessionbox_sessions_live Live sessions at the last sweep\n");
        output.push_str("# TYPE sessionbox_sessions_live gauge\n");
        output.push_str(&format!(
            "sessionbox_sessions_live {}\n",
            self.sessions_live.get()
        ));

        output.push_str("# HELP sessionbox_sweep_seconds Monitor sweep latency\n");
        output.push_str("# TYPE sessionbox_sweep_seconds histogram\n");
        for bucket in &self.sweep_latency.buckets {
            output.push_str(&format!(
                "sessionbox_sweep_seconds_bucket{{le=\"{}\"}} {}\n",
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "sessionbox_sweep_seconds_sum {}\n",
            self.sweep_latency.get_sum_micros() as f64 / 1_000_000.0
        ));
        output.push_str(&format!(
            "sessionbox_sweep_seconds_count {}\n",
            self.sweep_latency.get_count()
        ));

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
