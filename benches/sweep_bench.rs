// Monitor sweep benchmark
// Measures one full lifecycle cycle (memory, idle, gc) against the in-memory runtime
// Target: a sweep stays well inside the inspection timeout as the session count grows

use sessionbox::lifecycle::LifecycleMonitor;
use sessionbox::observability::audit::LogSink;
use sessionbox::observability::metrics::MetricsRegistry;
use sessionbox::session::SessionRegistry;
use sessionbox::testing::{running_instance, scratch_config, FakeRuntime};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ITERATIONS: usize = 50;
const WARMUP_ITERATIONS: usize = 5;

struct LatencyStats {
    p50: Duration,
    p95: Duration,
    min: Duration,
    max: Duration,
    mean: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();
        let sum: Duration = samples.iter().sum();

        Self {
            p50: samples[len / 2],
            p95: samples[((len as f64 * 0.95) as usize).min(len - 1)],
            min: samples[0],
            max: samples[len - 1],
            mean: sum / len as u32,
        }
    }

    fn print(&self) {
        println!("  p50: {:?}", self.p50);
        println!("  p95: {:?}", self.p95);
        println!("  min: {:?}", self.min);
        println!("  max: {:?}", self.max);
        println!("  mean: {:?}", self.mean);
    }
}

struct Scenario {
    label: &'static str,
    sessions: usize,
    stats_delay: Option<Duration>,
    budget: Duration,
}

fn run_scenario(scenario: &Scenario) -> bool {
    let config = Arc::new(scratch_config());
    let runtime = Arc::new(FakeRuntime::new());
    for i in 0..scenario.sessions {
        let name = format!("bench-{:04}", i);
        // Young and busy: nothing is reaped, so every cycle does the same work
        runtime.insert_instance(running_instance(&config, &name, Duration::from_secs(120)));
        runtime.set_stats(&name, 35.0, 40.0);
        if let Some(delay) = scenario.stats_delay {
            runtime.delay_stats(&name, delay);
        }
    }

    let registry = Arc::new(SessionRegistry::new(&config, runtime.clone()));
    let monitor = LifecycleMonitor::new(
        Arc::clone(&config),
        runtime,
        registry,
        Arc::new(LogSink),
        Arc::new(MetricsRegistry::new()),
    );

    for _ in 0..WARMUP_ITERATIONS {
        if let Err(e) = monitor.run_cycle() {
            println!("warmup cycle failed: {}", e);
            return false;
        }
    }

    let mut samples = Vec::with_capacity(ITERATIONS);
    for _ in 0..ITERATIONS {
        let started = Instant::now();
        if let Err(e) = monitor.run_cycle() {
            println!("cycle failed: {}", e);
            return false;
        }
        samples.push(started.elapsed());
    }

    let stats = LatencyStats::from_samples(samples);
    println!("\n=== {} ({} sessions) ===", scenario.label, scenario.sessions);
    stats.print();

    let passed = stats.p95 <= scenario.budget;
    if passed {
        println!("PASS (p95 within {:?})", scenario.budget);
    } else {
        println!("FAIL: p95 {:?} exceeds {:?}", stats.p95, scenario.budget);
    }
    passed
}

fn main() {
    println!("=== sessionbox Monitor Sweep Benchmark ===");
    println!("Iterations: {} (after {} warmup)", ITERATIONS, WARMUP_ITERATIONS);

    let scenarios = [
        Scenario {
            label: "small host",
            sessions: 10,
            stats_delay: None,
            budget: Duration::from_millis(100),
        },
        Scenario {
            label: "busy host",
            sessions: 100,
            stats_delay: None,
            budget: Duration::from_millis(500),
        },
        Scenario {
            label: "slow runtime",
            sessions: 20,
            stats_delay: Some(Duration::from_millis(50)),
            budget: Duration::from_millis(500),
        },
    ];

    let passed = scenarios.iter().filter(|s| run_scenario(s)).count();

    println!("\n=== Summary ===");
    println!("{}/{} scenarios passed", passed, scenarios.len());
    if passed != scenarios.len() {
        std::process::exit(1);
    }
}
