//! Prometheus metrics for the pinfold server.
//!
//! Exposes vault lifecycle, replication, stats and background job metrics.
//!
//! # Security Note
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping.
//! Metrics carry no vault keys or user ids, only aggregate counts. The
//! endpoint should still be network-restricted to the scraper.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Vault registry metrics
pub static VAULTS_LOADED: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("pinfold_vaults_loaded", "Number of vaults currently loaded")
        .expect("metric creation failed")
});

pub static VAULT_LOADS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("pinfold_vault_loads_total", "Vault loads by result"),
        &["result"],
    )
    .expect("metric creation failed")
});

// Replication metrics
pub static REPLICATION_STREAMS_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "pinfold_replication_streams_active",
        "Replication streams currently attached to a vault",
    )
    .expect("metric creation failed")
});

pub static PEER_CONNECTIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "pinfold_peer_connections_total",
            "Peer connection lifecycle events",
        ),
        &["event"],
    )
    .expect("metric creation failed")
});

pub static FLOCK_FALLBACK: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pinfold_flock_fallback_total",
        "Replication requests for a loaded vault with no recorded flock intent",
    )
    .expect("metric creation failed")
});

// Stats metrics
pub static STATS_RECOMPUTES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pinfold_stats_recomputes_total",
        "Completed vault stats recomputations",
    )
    .expect("metric creation failed")
});

// Job metrics
pub static JOB_RUNS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("pinfold_job_runs_total", "Background job runs by result"),
        &["job", "result"],
    )
    .expect("metric creation failed")
});

pub static JOB_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "pinfold_job_duration_seconds",
            "Time taken by a background job run",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["job"],
    )
    .expect("metric creation failed")
});

pub static DEAD_VAULTS_RECLAIMED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pinfold_dead_vaults_reclaimed_total",
        "Vaults whose data and record were deleted by dead-vault reclamation",
    )
    .expect("metric creation failed")
});

pub static BACKGROUND_TASK_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pinfold_background_task_failures_total",
        "Detached background tasks that returned an error or panicked",
    )
    .expect("metric creation failed")
});

static REGISTER: Once = Once::new();

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        REGISTRY
            .register(Box::new(VAULTS_LOADED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(VAULT_LOADS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(REPLICATION_STREAMS_ACTIVE.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PEER_CONNECTIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FLOCK_FALLBACK.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(STATS_RECOMPUTES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOB_RUNS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOB_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(DEAD_VAULTS_RECLAIMED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BACKGROUND_TASK_FAILURES.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Record a peer connection lifecycle event (`opened`, `errored`, `closed`).
pub fn record_connection_event(event: &str) {
    PEER_CONNECTIONS.with_label_values(&[event]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        register_metrics();
        register_metrics();
    }

    #[test]
    fn registered_metrics_are_gathered() {
        register_metrics();
        FLOCK_FALLBACK.inc();
        record_connection_event("opened");

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&REGISTRY.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("pinfold_flock_fallback_total"));
        assert!(text.contains("pinfold_peer_connections_total{event=\"opened\"}"));
    }
}
