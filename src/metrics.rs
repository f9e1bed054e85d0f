//! Ambient `prometheus`-based metrics registry.
//!
//! The core's Non-goals exclude content inspection and response caching, but
//! not observability — a production binary of this shape still ships a
//! `/metrics` endpoint. Scope here is deliberately minimal: request counts by
//! egress mode, WebSocket session counts, and ACME issuance outcomes.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    requests_total: IntCounterVec,
    websocket_sessions_total: IntCounter,
    acme_issuances_total: IntCounter,
    acme_failures_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("sandproxy_requests_total", "Total proxied requests by egress mode"),
            &["egress_mode"],
        )
        .expect("static metric descriptor is well-formed");
        registry
            .register(Box::new(requests_total.clone()))
            .expect("metric name is unique within this registry");

        let websocket_sessions_total = IntCounter::new(
            "sandproxy_websocket_sessions_total",
            "Total WebSocket sessions bridged to an upstream",
        )
        .expect("static metric descriptor is well-formed");
        registry
            .register(Box::new(websocket_sessions_total.clone()))
            .expect("metric name is unique within this registry");

        let acme_issuances_total = IntCounter::new(
            "sandproxy_acme_issuances_total",
            "Total certificates successfully issued via ACME",
        )
        .expect("static metric descriptor is well-formed");
        registry
            .register(Box::new(acme_issuances_total.clone()))
            .expect("metric name is unique within this registry");

        let acme_failures_total = IntCounter::new(
            "sandproxy_acme_failures_total",
            "Total ACME certificate acquisitions that failed",
        )
        .expect("static metric descriptor is well-formed");
        registry
            .register(Box::new(acme_failures_total.clone()))
            .expect("metric name is unique within this registry");

        Self {
            registry,
            requests_total,
            websocket_sessions_total,
            acme_issuances_total,
            acme_failures_total,
        }
    }

    pub fn record_request(&self, egress_mode: &str) {
        self.requests_total.with_label_values(&[egress_mode]).inc();
    }

    pub fn record_websocket_session(&self) {
        self.websocket_sessions_total.inc();
    }

    pub fn record_acme_issuance(&self) {
        self.acme_issuances_total.inc();
    }

    pub fn record_acme_failure(&self) {
        self.acme_failures_total.inc();
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder
            .encode(&families, &mut buf)
            .expect("prometheus text encoding never fails for in-process counters");
        String::from_utf8(buf).expect("prometheus text exposition format is UTF-8")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
