//! Prometheus metrics for the gateway.

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Gateway metrics, one instance per daemon.
#[derive(Clone)]
pub struct GatewayMetrics {
    /// Chat requests accepted at the surface, any path.
    pub requests_total: IntCounter,
    /// Requests answered by the deterministic fast path (no subprocess).
    pub quick_answers_total: IntCounter,
    /// Admission denials by reason.
    pub denials_total: IntCounterVec,
    /// Subprocess invocations by phase and terminal status.
    pub invocations_total: IntCounterVec,
    /// Sessions by final disposition.
    pub sessions_total: IntCounterVec,
    /// Currently admitted sessions (equals the global active count).
    pub active_sessions: IntGauge,

    registry: Arc<Registry>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = register_int_counter_with_registry!(
            "parley_requests_total",
            "Total chat requests received",
            registry
        )
        .unwrap();

        let quick_answers_total = register_int_counter_with_registry!(
            "parley_quick_answers_total",
            "Requests answered deterministically without a subprocess",
            registry
        )
        .unwrap();

        let denials_total = register_int_counter_vec_with_registry!(
            "parley_denials_total",
            "Admission denials by reason",
            &["reason"],
            registry
        )
        .unwrap();

        let invocations_total = register_int_counter_vec_with_registry!(
            "parley_invocations_total",
            "Model subprocess invocations by phase and terminal status",
            &["phase", "status"],
            registry
        )
        .unwrap();

        let sessions_total = register_int_counter_vec_with_registry!(
            "parley_sessions_total",
            "Finished sessions by disposition",
            &["disposition"],
            registry
        )
        .unwrap();

        let active_sessions = register_int_gauge_with_registry!(
            "parley_active_sessions",
            "Currently admitted sessions",
            registry
        )
        .unwrap();

        Self {
            requests_total,
            quick_answers_total,
            denials_total,
            invocations_total,
            sessions_total,
            active_sessions,
            registry: Arc::new(registry),
        }
    }

    pub fn record_denial(&self, reason: &str) {
        self.denials_total.with_label_values(&[reason]).inc();
    }

    pub fn record_invocation(&self, phase: &str, status: &str) {
        self.invocations_total
            .with_label_values(&[phase, status])
            .inc();
    }

    pub fn record_session(&self, disposition: &str) {
        self.sessions_total
            .with_label_values(&[disposition])
            .inc();
    }

    /// Render the registry in the Prometheus text format.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_contains_registered_metrics() {
        let metrics = GatewayMetrics::new();
        metrics.requests_total.inc();
        metrics.record_denial("rate_limited");
        metrics.record_invocation("full", "completed");

        let text = metrics.export();
        assert!(text.contains("parley_requests_total"));
        assert!(text.contains("parley_denials_total"));
        assert!(text.contains("rate_limited"));
    }

    #[test]
    fn gauge_tracks_active_sessions() {
        let metrics = GatewayMetrics::new();
        metrics.active_sessions.inc();
        metrics.active_sessions.inc();
        metrics.active_sessions.dec();
        assert_eq!(metrics.active_sessions.get(), 1);
    }
}
