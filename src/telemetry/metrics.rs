//! Metric instruments for batchrun.
//!
//! Instruments come from the `"batchrun"` meter on the globally registered
//! `MeterProvider`; with no provider installed they are no-ops.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

use crate::event::StatusKind;

fn meter() -> Meter {
    opentelemetry::global::meter("batchrun")
}

/// Counter: item status transitions.
/// Labels: `status` ("queued" | "processing" | "done" | "error").
pub fn item_transitions() -> Counter<u64> {
    meter()
        .u64_counter("batchrun.items.transitions")
        .with_description("Number of item status transitions")
        .build()
}

/// Counter: finished runs.
/// Labels: `outcome` ("completed" | "cancelled" | "refused" | "failed").
pub fn runs() -> Counter<u64> {
    meter()
        .u64_counter("batchrun.runs")
        .with_description("Number of finished runs")
        .build()
}

/// Histogram: time spent in `process` per item, in milliseconds.
/// Labels: `status` ("done" | "error").
pub fn item_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("batchrun.item.duration_ms")
        .with_description("Item processing duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Record one status transition.
pub fn record_transition(kind: StatusKind) {
    item_transitions().add(1, &[KeyValue::new("status", kind.as_str())]);
}

/// Record a finished run.
pub fn record_run(outcome: &'static str) {
    runs().add(1, &[KeyValue::new("outcome", outcome)]);
}
