//! Consumer session and event batching
//!
//! The session owns the single consumer slot, the sequence counter and the
//! batch buffer. All three live behind one `parking_lot::Mutex`, held only for
//! an append, a flush, or a handshake transition. The transport is required
//! to be non-blocking, so a flush sends while still holding the lock and
//! messages leave in the order the lock was taken.
//!
//! Handshake:
//! - `rainhurt` from a consumer attaches it and is answered with `phpisbst`
//! - `seeunext` from the attached consumer flushes, is echoed, and detaches
//! - anything else is an illegal connection and is ignored

use crate::metrics::ProbeMetrics;
use crate::transport::{Inbound, Transport};
use crate::{NcpError, Result};
use ncp_common::{token, ConnEvent, RECORD_LEN};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Result of handling one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// A consumer attached to an idle probe
    Attached,
    /// The attached consumer sent the attach token again
    Reattached,
    /// A different consumer replaced the attached one
    TakenOver,
    /// The attached consumer detached
    Detached,
    /// Illegal message, state unchanged
    Ignored,
}

struct Consumer<P> {
    peer: P,
    /// Sequence number of the last message sent
    seq: u32,
}

struct State<P> {
    consumer: Option<Consumer<P>>,
    /// Encoded records, always a whole number of them and at most `capacity`
    buffer: Vec<u8>,
}

pub struct Session<T: Transport> {
    transport: T,
    /// Records per message; 0 sends every event on its own
    capacity: usize,
    /// Mirrors `state.consumer.is_some()`; only written with `state` locked
    attached: AtomicBool,
    state: Mutex<State<T::Peer>>,
    metrics: ProbeMetrics,
}

impl<T: Transport> Session<T> {
    /// Creates a detached session batching `capacity` events per message.
    ///
    /// Fails with `ResourceInit` if a full batch cannot fit in one message or
    /// the buffer cannot be allocated.
    pub fn new(transport: T, capacity: u32, metrics: ProbeMetrics) -> Result<Self> {
        let capacity = capacity as usize;
        let buffer_len = capacity
            .checked_mul(RECORD_LEN)
            .filter(|len| *len <= transport.max_payload())
            .ok_or_else(|| {
                NcpError::resource_init(
                    "batch buffer",
                    format!(
                        "{} records do not fit in a {} byte message",
                        capacity,
                        transport.max_payload()
                    ),
                )
            })?;

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(buffer_len)
            .map_err(|e| NcpError::resource_init("batch buffer", e))?;

        Ok(Self {
            transport,
            capacity,
            attached: AtomicBool::new(false),
            state: Mutex::new(State {
                consumer: None,
                buffer,
            }),
            metrics,
        })
    }

    /// Lock-free check used by the hooks to skip submission when nobody listens.
    ///
    /// A stale answer is harmless: [`submit`](Self::submit) re-checks under the lock.
    #[inline]
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Queues one event for the attached consumer.
    ///
    /// Sends the whole batch once it reaches capacity, or the event alone when
    /// batching is disabled. A failed send still empties the buffer and leaves
    /// the session attached. Without a consumer this does nothing.
    pub fn submit(&self, event: &ConnEvent) -> Result<()> {
        let mut state = self.state.lock();
        let State { consumer, buffer } = &mut *state;
        let consumer = match consumer.as_mut() {
            Some(consumer) => consumer,
            None => return Ok(()),
        };

        self.metrics.event_submitted();
        let record = event.encode();

        if self.capacity == 0 {
            return self.transmit(consumer, &record, 1);
        }

        buffer.extend_from_slice(&record);
        if buffer.len() >= self.capacity * RECORD_LEN {
            self.flush(consumer, buffer)?;
        }
        Ok(())
    }

    /// Handles one message from the transport.
    pub fn receive(&self, msg: &Inbound<T::Peer>) -> Handshake {
        if token::matches(&msg.payload, token::DETACH) {
            return self.detach(&msg.sender);
        }
        if token::matches(&msg.payload, token::ATTACH) {
            return self.attach(&msg.sender, msg.seq);
        }

        self.violation(format!(
            "illegal connection from {:?}: {} byte message is not a handshake",
            msg.sender,
            msg.payload.len()
        ))
    }

    /// Ends the session for process teardown.
    ///
    /// Flushes what is buffered and always tells the consumer the session is
    /// over. Calling it again, or without a consumer, does nothing.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        let State { consumer, buffer } = &mut *state;
        if let Some(peer) = self.end_session(consumer, buffer) {
            info!("Connection closed by shutdown: [{:?}]", peer);
        }
    }

    /// Number of events waiting in the buffer.
    pub fn pending(&self) -> usize {
        self.state.lock().buffer.len() / RECORD_LEN
    }

    /// The attached consumer, if any.
    pub fn consumer(&self) -> Option<T::Peer> {
        self.state.lock().consumer.as_ref().map(|c| c.peer.clone())
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn attach(&self, sender: &T::Peer, seq: u32) -> Handshake {
        let mut state = self.state.lock();
        let State { consumer, buffer } = &mut *state;

        let outcome = match consumer.as_ref() {
            Some(current) if current.peer == *sender => Handshake::Reattached,
            Some(current) => {
                let dropped = buffer.len() / RECORD_LEN;
                warn!(
                    "Connection from {:?} replaces {:?}, dropping {} pending events",
                    sender, current.peer, dropped
                );
                self.metrics.events_dropped(dropped);
                Handshake::TakenOver
            }
            None => Handshake::Attached,
        };

        if outcome == Handshake::Reattached {
            debug!("Repeated connection from {:?}", sender);
        } else {
            info!("Connection from: [{:?}] seq={}", sender, seq);
            buffer.clear();
            *consumer = Some(Consumer {
                peer: sender.clone(),
                seq: seq.wrapping_sub(1),
            });
            self.attached.store(true, Ordering::Release);
            self.metrics.session_started();
        }

        if let Some(current) = consumer.as_mut() {
            // The consumer learns about a failed reply by timing out.
            let _ = self.transmit(current, token::ATTACH_ACK, 0);
        }
        outcome
    }

    fn detach(&self, sender: &T::Peer) -> Handshake {
        let mut state = self.state.lock();
        let State { consumer, buffer } = &mut *state;

        match consumer.as_ref() {
            Some(current) if current.peer == *sender => {}
            Some(current) => {
                return self.violation(format!(
                    "illegal disconnect from {:?}: attached consumer is {:?}",
                    sender, current.peer
                ));
            }
            None => {
                return self.violation(format!(
                    "illegal disconnect from {:?}: no consumer attached",
                    sender
                ));
            }
        }

        if let Some(peer) = self.end_session(consumer, buffer) {
            info!("Connection close: [{:?}]", peer);
        }
        Handshake::Detached
    }

    fn violation(&self, detail: String) -> Handshake {
        self.metrics.protocol_violation();
        warn!("{}", NcpError::ProtocolViolation(detail));
        Handshake::Ignored
    }

    /// Best-effort flush, detach token, then back to detached.
    fn end_session(
        &self,
        consumer: &mut Option<Consumer<T::Peer>>,
        buffer: &mut Vec<u8>,
    ) -> Option<T::Peer> {
        let mut current = consumer.take()?;
        // Failures are logged by transmit and never retried.
        let _ = self.flush(&mut current, buffer);
        let _ = self.transmit(&mut current, token::DETACH, 0);

        buffer.clear();
        self.attached.store(false, Ordering::Release);
        self.metrics.session_ended();
        Some(current.peer)
    }

    /// Sends and empties the buffer. Does nothing when it is empty.
    fn flush(&self, consumer: &mut Consumer<T::Peer>, buffer: &mut Vec<u8>) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let events = buffer.len() / RECORD_LEN;
        let result = self.transmit(consumer, buffer, events);
        buffer.clear();
        result
    }

    fn transmit(&self, consumer: &mut Consumer<T::Peer>, payload: &[u8], events: usize) -> Result<()> {
        consumer.seq = consumer.seq.wrapping_add(1);
        match self.transport.unicast(&consumer.peer, consumer.seq, payload) {
            Ok(()) => {
                self.metrics.message_sent(payload.len());
                Ok(())
            }
            Err(e) => {
                self.metrics.transmit_failed(events);
                warn!("Send to {:?} failed, {} events lost: {}", consumer.peer, events, e);
                Err(e)
            }
        }
    }
}
