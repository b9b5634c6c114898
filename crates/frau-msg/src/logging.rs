//! ---
//! frau_section: "02-messaging-protocol"
//! frau_subsection: "module"
//! frau_type: "source"
//! frau_scope: "code"
//! frau_description: "Message protocol core: envelopes, ports, requests and services."
//! frau_version: "v0.0.0-prealpha"
//! frau_owner: "tbd"
//! ---
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use tracing::debug;

use crate::envelope::MessageClass;

/// Which way an envelope moved through a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Posted to the endpoint.
    Outbound,
    /// Accepted by the validation gate and dispatched.
    Inbound,
    /// Rejected by the validation gate or undecodable.
    Dropped,
}

/// Single structured log point for wire traffic.
pub fn log_envelope(port: &str, direction: MessageDirection, key: &str) {
    debug!(port, key, direction = ?direction, "envelope");
}

/// Prometheus handles for envelope traffic, shared by any number of ports.
#[derive(Clone)]
pub struct PortMetricsExporter {
    sent: IntCounterVec,
    received: IntCounterVec,
    dropped: IntCounter,
    roundtrip: Histogram,
}

impl PortMetricsExporter {
    /// Register the envelope metrics with `registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let sent = IntCounterVec::new(
            Opts::new("frau_envelopes_sent_total", "Envelopes posted to an endpoint"),
            &["class"],
        )?;
        let received = IntCounterVec::new(
            Opts::new(
                "frau_envelopes_received_total",
                "Envelopes accepted and dispatched",
            ),
            &["class"],
        )?;
        let dropped = IntCounter::with_opts(Opts::new(
            "frau_envelopes_dropped_total",
            "Inbound messages rejected by validation or decoding",
        ))?;
        let roundtrip = Histogram::with_opts(HistogramOpts::new(
            "frau_request_roundtrip_seconds",
            "Time between issuing a request and receiving its response",
        ))?;

        registry.register(Box::new(sent.clone()))?;
        registry.register(Box::new(received.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(roundtrip.clone()))?;

        Ok(Self {
            sent,
            received,
            dropped,
            roundtrip,
        })
    }

    /// Count an outbound envelope.
    pub fn observe_sent(&self, class: MessageClass) {
        self.sent.with_label_values(&[class.code()]).inc();
    }

    /// Count an accepted inbound envelope.
    pub fn observe_received(&self, class: MessageClass) {
        self.received.with_label_values(&[class.code()]).inc();
    }

    /// Count a rejected inbound message.
    pub fn observe_dropped(&self) {
        self.dropped.inc();
    }

    /// Record the time a request spent waiting for its response.
    pub fn observe_roundtrip(&self, elapsed: Duration) {
        self.roundtrip.observe(elapsed.as_secs_f64());
    }
}
