//! In-process metrics for agent runs and tasks.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram over millisecond values.
pub struct Histogram {
    bounds: Vec<f64>,
    buckets: Vec<AtomicU64>,
    // Microseconds, so sub-millisecond observations still add up.
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: Vec<f64>) -> Self {
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn latency() -> Self {
        Self::new(vec![
            5.0, 25.0, 100.0, 250.0, 1000.0, 2500.0, 10_000.0, 30_000.0, 120_000.0,
        ])
    }

    pub fn observe(&self, value_ms: f64) {
        let index = self
            .bounds
            .iter()
            .position(|&bound| value_ms <= bound)
            .unwrap_or(self.bounds.len());
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value_ms * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn bucket_counts(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }

    pub fn mean_ms(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0 / n as f64,
        }
    }
}

/// Counters shared by the runtime and the task scheduler.
pub struct RuntimeMetrics {
    pub runs_started: Counter,
    pub runs_completed: Counter,
    pub runs_suspended: Counter,
    pub runs_failed: Counter,
    pub runs_cancelled: Counter,
    pub runs_resumed: Counter,
    pub steps: Counter,
    pub active_runs: Gauge,
    pub step_latency_ms: Histogram,
    pub tasks_scheduled: Counter,
    pub task_attempts: Counter,
    pub task_failures: Counter,
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self {
            runs_started: Counter::new(),
            runs_completed: Counter::new(),
            runs_suspended: Counter::new(),
            runs_failed: Counter::new(),
            runs_cancelled: Counter::new(),
            runs_resumed: Counter::new(),
            steps: Counter::new(),
            active_runs: Gauge::new(),
            step_latency_ms: Histogram::latency(),
            tasks_scheduled: Counter::new(),
            task_attempts: Counter::new(),
            task_failures: Counter::new(),
        }
    }

    pub fn record_step(&self, latency_ms: f64) {
        self.steps.inc();
        self.step_latency_ms.observe(latency_ms);
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            runs_started: self.runs_started.get(),
            runs_completed: self.runs_completed.get(),
            runs_suspended: self.runs_suspended.get(),
            runs_failed: self.runs_failed.get(),
            runs_cancelled: self.runs_cancelled.get(),
            runs_resumed: self.runs_resumed.get(),
            steps: self.steps.get(),
            active_runs: self.active_runs.get(),
            avg_step_latency_ms: self.step_latency_ms.mean_ms(),
            tasks_scheduled: self.tasks_scheduled.get(),
            task_attempts: self.task_attempts.get(),
            task_failures: self.task_failures.get(),
        }
    }
}

/// Point-in-time copy of [`RuntimeMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_suspended: u64,
    pub runs_failed: u64,
    pub runs_cancelled: u64,
    pub runs_resumed: u64,
    pub steps: u64,
    pub active_runs: i64,
    pub avg_step_latency_ms: f64,
    pub tasks_scheduled: u64,
    pub task_attempts: u64,
    pub task_failures: u64,
}
