//! Metric instrument factories for labelq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op, so recording is
//! always safe.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for labelq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("labelq")
}

/// Counter: items registered by catalog sync.
pub fn items_registered() -> Counter<u64> {
    meter()
        .u64_counter("labelq.items.registered")
        .with_description("Number of images registered as new pending items")
        .build()
}

/// Counter: leases granted.
/// Labels: `reclaimed` ("true" | "false").
pub fn leases_granted() -> Counter<u64> {
    meter()
        .u64_counter("labelq.leases.granted")
        .with_description("Number of leases granted")
        .build()
}

/// Counter: completions rejected because the token was not the current lease.
/// Labels: `outcome` ("labeled" | "skipped").
pub fn lease_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("labelq.leases.conflicts")
        .with_description("Number of completions rejected with a reservation mismatch")
        .build()
}

/// Counter: items closed out.
/// Labels: `outcome` ("labeled" | "skipped").
pub fn items_finalized() -> Counter<u64> {
    meter()
        .u64_counter("labelq.items.finalized")
        .with_description("Number of items finalized")
        .build()
}

/// Counter: leases discarded by a lifecycle release.
pub fn leases_released() -> Counter<u64> {
    meter()
        .u64_counter("labelq.leases.released")
        .with_description("Number of in-progress items demoted to pending by a release")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("labelq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
