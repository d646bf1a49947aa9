//! Syncer-internal Prometheus metrics.
//!
//! A dedicated registry keeps these separate from whatever the embedded API
//! server exposes; the metrics-injection filter appends this registry's text
//! exposition to proxied `/metrics` responses.

use once_cell::sync::Lazy;
use prometheus::{
    Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Registry holding every burrow metric
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Reconcile outcomes per kind
///
/// Labels: `kind`, `result` (success, error)
pub static RECONCILES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("reconciles_total", "Total reconcile attempts by outcome")
            .namespace("burrow")
            .subsystem("sync"),
        &["kind", "result"],
    )
    .expect("failed to create reconciles_total metric");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("failed to register reconciles_total");
    counter
});

/// Reconcile latency
pub static RECONCILE_DURATION: Lazy<Histogram> = Lazy::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "reconcile_duration_seconds",
            "Duration of a single reconcile",
        )
        .namespace("burrow")
        .subsystem("sync"),
    )
    .expect("failed to create reconcile_duration metric");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("failed to register reconcile_duration");
    histogram
});

/// Managed physical objects currently projected, per kind
pub static MANAGED_OBJECTS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("managed_objects", "Managed physical objects by kind")
            .namespace("burrow")
            .subsystem("sync"),
        &["kind"],
    )
    .expect("failed to create managed_objects metric");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("failed to register managed_objects");
    gauge
});

/// Requests handled by each proxy filter
///
/// Labels: `filter` (inject, rewrite, redirect, service_create, impersonate)
pub static PROXY_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("requests_total", "Requests handled per proxy filter")
            .namespace("burrow")
            .subsystem("proxy"),
        &["filter"],
    )
    .expect("failed to create proxy requests_total metric");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("failed to register proxy requests_total");
    counter
});

/// Text exposition of the burrow registry, for merging into `/metrics`
pub fn encode_text() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_encodes_registered_metrics() {
        RECONCILES_TOTAL
            .with_label_values(&["secrets", "success"])
            .inc();
        PROXY_REQUESTS_TOTAL.with_label_values(&["inject"]).inc();

        let text = encode_text();
        assert!(text.contains("burrow_sync_reconciles_total"));
        assert!(text.contains("burrow_proxy_requests_total"));
    }
}
