use crate::classify::Direction;
use crate::{NcpError, Result};
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Point-in-time copy of the probe counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub ingress_packets: u64,
    pub egress_packets: u64,
    pub packets_filtered: u64,
    pub events_submitted: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub transmit_failures: u64,
    pub events_dropped: u64,
    pub protocol_violations: u64,
    pub sessions: u64,
    pub attached: bool,
}

/// Probe counters, registered in a private prometheus registry.
///
/// Cloning is cheap; clones share the same counters.
#[derive(Clone)]
pub struct ProbeMetrics {
    registry: Registry,
    ingress_packets: IntCounter,
    egress_packets: IntCounter,
    packets_filtered: IntCounter,
    events_submitted: IntCounter,
    messages_sent: IntCounter,
    bytes_sent: IntCounter,
    transmit_failures: IntCounter,
    events_dropped: IntCounter,
    protocol_violations: IntCounter,
    sessions: IntCounter,
    session_attached: IntGauge,
}

impl ProbeMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let packets = IntCounterVec::new(
            Opts::new("ncp_packets_total", "Packets seen by the hooks"),
            &["direction"],
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(packets.clone()))
            .map_err(metrics_error)?;

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::new(name, help).map_err(metrics_error)?;
            registry.register(Box::new(c.clone())).map_err(metrics_error)?;
            Ok(c)
        };

        let metrics = Self {
            ingress_packets: packets.with_label_values(&[Direction::Ingress.as_str()]),
            egress_packets: packets.with_label_values(&[Direction::Egress.as_str()]),
            packets_filtered: counter(
                "ncp_packets_filtered_total",
                "Classified packets rejected by the address filter",
            )?,
            events_submitted: counter(
                "ncp_events_submitted_total",
                "Events accepted into an attached session",
            )?,
            messages_sent: counter(
                "ncp_messages_sent_total",
                "Messages delivered to the consumer, handshakes included",
            )?,
            bytes_sent: counter("ncp_bytes_sent_total", "Payload bytes delivered")?,
            transmit_failures: counter(
                "ncp_transmit_failures_total",
                "Messages the transport failed to deliver",
            )?,
            events_dropped: counter(
                "ncp_events_dropped_total",
                "Events discarded by failed or abandoned flushes",
            )?,
            protocol_violations: counter(
                "ncp_protocol_violations_total",
                "Inbound messages ignored as illegal",
            )?,
            sessions: counter("ncp_sessions_total", "Consumer sessions started")?,
            session_attached: {
                let g = IntGauge::new("ncp_session_attached", "1 while a consumer is attached")
                    .map_err(metrics_error)?;
                registry.register(Box::new(g.clone())).map_err(metrics_error)?;
                g
            },
            registry,
        };

        Ok(metrics)
    }

    pub fn packet(&self, direction: Direction) {
        match direction {
            Direction::Ingress => self.ingress_packets.inc(),
            Direction::Egress => self.egress_packets.inc(),
        }
    }

    pub fn packet_filtered(&self) {
        self.packets_filtered.inc();
    }

    pub fn event_submitted(&self) {
        self.events_submitted.inc();
    }

    pub fn message_sent(&self, bytes: usize) {
        self.messages_sent.inc();
        self.bytes_sent.inc_by(bytes as u64);
    }

    pub fn transmit_failed(&self, events_lost: usize) {
        self.transmit_failures.inc();
        self.events_dropped.inc_by(events_lost as u64);
    }

    pub fn events_dropped(&self, count: usize) {
        self.events_dropped.inc_by(count as u64);
    }

    pub fn protocol_violation(&self) {
        self.protocol_violations.inc();
    }

    pub fn session_started(&self) {
        self.sessions.inc();
        self.session_attached.set(1);
    }

    pub fn session_ended(&self) {
        self.session_attached.set(0);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ingress_packets: self.ingress_packets.get(),
            egress_packets: self.egress_packets.get(),
            packets_filtered: self.packets_filtered.get(),
            events_submitted: self.events_submitted.get(),
            messages_sent: self.messages_sent.get(),
            bytes_sent: self.bytes_sent.get(),
            transmit_failures: self.transmit_failures.get(),
            events_dropped: self.events_dropped.get(),
            protocol_violations: self.protocol_violations.get(),
            sessions: self.sessions.get(),
            attached: self.session_attached.get() == 1,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn metrics_error(e: prometheus::Error) -> NcpError {
    NcpError::MetricsError(e.to_string())
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "packets in={} out={} filtered={} events={} messages={} bytes={} \
             failures={} dropped={} violations={} sessions={}",
            self.ingress_packets,
            self.egress_packets,
            self.packets_filtered,
            self.events_submitted,
            self.messages_sent,
            self.bytes_sent,
            self.transmit_failures,
            self.events_dropped,
            self.protocol_violations,
            self.sessions,
        )
    }
}
