//! Metrics for agent runs and scheduled tasks.
//!
//! Logging goes through `tracing` at the call sites; this module only holds
//! the counters. A [`RuntimeMetrics`] is owned by whoever builds the runtime
//! and shared by `Arc` with the task scheduler.

mod metrics;

pub use metrics::{Counter, Gauge, Histogram, MetricsSummary, RuntimeMetrics};
