//! # Prometheus Metrics
//!
//! Operational metrics for the central ledger, scraped at `/metrics` on
//! the configured metrics port.
//!
//! All metrics live in a dedicated [`prometheus::Registry`] so they do not
//! collide with any default global registry consumers.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Holds all Prometheus metric handles for the server.
///
/// Clone-friendly (prometheus handles wrap `Arc` internally) so it can be
/// shared across request handlers.
#[derive(Clone)]
pub struct ServerMetrics {
    /// Registry that owns all metrics below.
    registry: Registry,
    /// Heartbeats received across the fleet.
    pub heartbeats_total: IntCounter,
    /// Sync batches reconciled.
    pub sync_batches_total: IntCounter,
    /// Transactions confirmed into the authoritative ledger.
    pub transactions_confirmed_total: IntCounter,
    /// Transactions rejected during reconciliation (all reasons).
    pub transactions_rejected_total: IntCounter,
    /// Server-originated top-ups applied.
    pub topups_total: IntCounter,
    /// Cards currently registered in the central ledger.
    pub registered_cards: IntGauge,
    /// Terminals that have ever heartbeated.
    pub registered_terminals: IntGauge,
}

impl ServerMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("farebox".into()), None)
            .expect("failed to create prometheus registry");

        let heartbeats_total =
            IntCounter::new("heartbeats_total", "Terminal heartbeats received")
                .expect("metric creation");
        registry
            .register(Box::new(heartbeats_total.clone()))
            .expect("metric registration");

        let sync_batches_total =
            IntCounter::new("sync_batches_total", "Sync batches reconciled")
                .expect("metric creation");
        registry
            .register(Box::new(sync_batches_total.clone()))
            .expect("metric registration");

        let transactions_confirmed_total = IntCounter::new(
            "transactions_confirmed_total",
            "Transactions confirmed into the authoritative ledger",
        )
        .expect("metric creation");
        registry
            .register(Box::new(transactions_confirmed_total.clone()))
            .expect("metric registration");

        let transactions_rejected_total = IntCounter::new(
            "transactions_rejected_total",
            "Transactions rejected during reconciliation",
        )
        .expect("metric creation");
        registry
            .register(Box::new(transactions_rejected_total.clone()))
            .expect("metric registration");

        let topups_total =
            IntCounter::new("topups_total", "Server-originated top-ups applied")
                .expect("metric creation");
        registry
            .register(Box::new(topups_total.clone()))
            .expect("metric registration");

        let registered_cards =
            IntGauge::new("registered_cards", "Cards registered in the central ledger")
                .expect("metric creation");
        registry
            .register(Box::new(registered_cards.clone()))
            .expect("metric registration");

        let registered_terminals =
            IntGauge::new("registered_terminals", "Terminals known to the registry")
                .expect("metric creation");
        registry
            .register(Box::new(registered_terminals.clone()))
            .expect("metric registration");

        Self {
            registry,
            heartbeats_total,
            sync_batches_total,
            transactions_confirmed_total,
            transactions_rejected_total,
            topups_total,
            registered_cards,
            registered_terminals,
        }
    }

    /// Encodes all registered metrics into the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("prometheus output is valid utf-8"))
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<ServerMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
///
/// Returns HTTP 500 if encoding fails (should never happen in practice).
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_appear_in_exposition() {
        let metrics = ServerMetrics::new();
        metrics.transactions_confirmed_total.inc_by(3);
        metrics.heartbeats_total.inc();
        metrics.registered_cards.set(7);

        let body = metrics.encode().unwrap();
        assert!(body.contains("farebox_transactions_confirmed_total 3"));
        assert!(body.contains("farebox_heartbeats_total 1"));
        assert!(body.contains("farebox_registered_cards 7"));
    }
}
