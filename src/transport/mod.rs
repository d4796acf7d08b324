//! Point-to-point message channel between the probe and its consumer
//!
//! The session only ever sees the [`Transport`] trait. The daemon plugs in
//! [`unix::UnixTransport`]; tests plug in an in-memory recorder.

pub mod unix;

use crate::Result;
use bytes::Bytes;
use std::fmt;

/// Outbound half of the channel
pub trait Transport: Send + Sync {
    /// Opaque consumer identity, compared to recognise the attached consumer
    type Peer: Clone + PartialEq + fmt::Debug + Send + Sync;

    /// Sends one message carrying `seq` to `peer`.
    ///
    /// Must not block: the session calls this with its lock held.
    fn unicast(&self, peer: &Self::Peer, seq: u32, payload: &[u8]) -> Result<()>;

    /// Largest payload a single message can carry.
    fn max_payload(&self) -> usize {
        usize::MAX
    }
}

/// A message received from a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound<P> {
    pub sender: P,
    pub seq: u32,
    pub payload: Bytes,
}

impl<P> Inbound<P> {
    pub fn new(sender: P, seq: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            sender,
            seq,
            payload: payload.into(),
        }
    }
}
