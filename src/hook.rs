//! Ingress and egress entry points
//!
//! The packet source hands every captured IPv4 packet to one of the two hooks.
//! A hook classifies the packet, applies the address filter and submits the
//! resulting event to the session if a consumer is attached. Whatever happens
//! along the way, the verdict is [`Verdict::Accept`].

use crate::classify::{classify, Classification, Direction};
use crate::filter::AddressFilter;
use crate::metrics::ProbeMetrics;
use crate::session::Session;
use crate::transport::Transport;
use std::sync::Arc;
use tracing::{trace, warn};

/// What the packet path does with a packet after inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Let the packet continue unchanged
    Accept,
}

pub struct HookDispatcher<T: Transport> {
    filter: AddressFilter,
    session: Arc<Session<T>>,
    metrics: ProbeMetrics,
}

impl<T: Transport> Clone for HookDispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            filter: self.filter,
            session: Arc::clone(&self.session),
            metrics: self.metrics.clone(),
        }
    }
}

impl<T: Transport> HookDispatcher<T> {
    pub fn new(filter: AddressFilter, session: Arc<Session<T>>, metrics: ProbeMetrics) -> Self {
        Self {
            filter,
            session,
            metrics,
        }
    }

    pub fn on_ingress(&self, packet: &[u8]) -> Verdict {
        self.dispatch(packet, Direction::Ingress)
    }

    pub fn on_egress(&self, packet: &[u8]) -> Verdict {
        self.dispatch(packet, Direction::Egress)
    }

    pub fn dispatch(&self, packet: &[u8], direction: Direction) -> Verdict {
        self.metrics.packet(direction);

        let event = match classify(packet, direction) {
            Classification::Event(event) => event,
            Classification::NotApplicable(reason) => {
                if reason.is_anomaly() {
                    warn!("{} packet of {} bytes skipped: {:?}", direction, packet.len(), reason);
                } else {
                    trace!("{} packet skipped: {:?}", direction, reason);
                }
                return Verdict::Accept;
            }
        };

        if !self.filter.matches_event(&event) {
            self.metrics.packet_filtered();
            return Verdict::Accept;
        }

        if !self.session.is_attached() {
            return Verdict::Accept;
        }

        // Send failures are counted and logged by the session.
        let _ = self.session.submit(&event);
        Verdict::Accept
    }

    pub fn session(&self) -> &Arc<Session<T>> {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Inbound;
    use crate::{NcpError, Result};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Vec<u8>>>,
        fail: bool,
    }

    impl Transport for Recorder {
        type Peer = u32;

        fn unicast(&self, _peer: &u32, _seq: u32, payload: &[u8]) -> Result<()> {
            if self.fail {
                return Err(NcpError::TransmitFailure("closed".into()));
            }
            self.sent.lock().push(payload.to_vec());
            Ok(())
        }
    }

    fn packet(src: [u8; 4], dst: [u8; 4], proto: u8, sport: u16, dport: u16) -> Vec<u8> {
        let mut pkt = vec![0x45, 0, 0, 40, 0, 0, 0x40, 0, 64, proto, 0, 0];
        pkt.extend_from_slice(&src);
        pkt.extend_from_slice(&dst);
        pkt.extend_from_slice(&sport.to_be_bytes());
        pkt.extend_from_slice(&dport.to_be_bytes());
        pkt.resize(40, 0);
        pkt
    }

    fn dispatcher(filter: AddressFilter, capacity: u32, transport: Recorder) -> HookDispatcher<Recorder> {
        let metrics = ProbeMetrics::new().unwrap();
        let session = Session::new(transport, capacity, metrics.clone()).unwrap();
        HookDispatcher::new(filter, Arc::new(session), metrics)
    }

    fn attach(hooks: &HookDispatcher<Recorder>) {
        hooks
            .session()
            .receive(&Inbound::new(1, 1, &b"rainhurt"[..]));
    }

    #[test]
    fn test_always_accepts() {
        let hooks = dispatcher(AddressFilter::any(), 1, Recorder::default());
        attach(&hooks);
        let udp = packet([10, 0, 0, 1], [8, 8, 8, 8], 17, 1, 53);
        let icmp = packet([10, 0, 0, 1], [8, 8, 8, 8], 1, 0, 0);

        for pkt in [&udp[..], &icmp[..], &[][..], &udp[..21]] {
            assert_eq!(hooks.on_ingress(pkt), Verdict::Accept);
            assert_eq!(hooks.on_egress(pkt), Verdict::Accept);
        }
    }

    #[test]
    fn test_accepts_when_transport_fails() {
        let hooks = dispatcher(
            AddressFilter::any(),
            0,
            Recorder {
                fail: true,
                ..Default::default()
            },
        );
        attach(&hooks);
        let pkt = packet([10, 0, 0, 1], [8, 8, 8, 8], 6, 1, 80);
        assert_eq!(hooks.on_egress(&pkt), Verdict::Accept);
        assert_eq!(hooks.metrics.snapshot().transmit_failures, 2);
    }

    #[test]
    fn test_detached_skips_submission() {
        let hooks = dispatcher(AddressFilter::any(), 1, Recorder::default());
        let pkt = packet([10, 0, 0, 1], [8, 8, 8, 8], 6, 1, 80);
        for _ in 0..5 {
            hooks.on_egress(&pkt);
        }
        assert!(hooks.session().transport().sent.lock().is_empty());
        assert_eq!(hooks.metrics.snapshot().events_submitted, 0);
        assert_eq!(hooks.metrics.snapshot().egress_packets, 5);
    }

    #[test]
    fn test_ingress_loopback_counted_on_egress_only() {
        let hooks = dispatcher(AddressFilter::any(), 0, Recorder::default());
        attach(&hooks);
        let pkt = packet([127, 0, 0, 1], [127, 0, 0, 1], 17, 5000, 5001);

        hooks.on_ingress(&pkt);
        assert_eq!(hooks.session().transport().sent.lock().len(), 1);
        hooks.on_egress(&pkt);
        assert_eq!(hooks.session().transport().sent.lock().len(), 2);
    }

    #[test]
    fn test_filter_rejects_other_destinations() {
        let filter = AddressFilter::from_config(None, Some("1.1.1.1"));
        let hooks = dispatcher(filter, 0, Recorder::default());
        attach(&hooks);

        hooks.on_egress(&packet([10, 0, 0, 1], [8, 8, 8, 8], 17, 1, 53));
        hooks.on_egress(&packet([10, 0, 0, 1], [1, 1, 1, 1], 17, 1, 53));

        let sent = hooks.session().transport().sent.lock();
        assert_eq!(sent.len(), 2);
        let event = ncp_common::ConnEvent::decode(&sent[1]).unwrap();
        assert_eq!(event.dst_addr, 0x0101_0101);
        assert_eq!(hooks.metrics.snapshot().packets_filtered, 1);
    }
}
