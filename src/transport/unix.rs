//! Unix datagram transport
//!
//! One bound socket serves both directions. Outbound frames are written with
//! a non-blocking `send_to`, so a consumer that stops reading costs a
//! `TransmitFailure`, never a stalled packet path. Inbound frames are read by
//! an async [`UnixReceiver`] sharing the same socket.

use crate::transport::{Inbound, Transport};
use crate::{NcpError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use ncp_common::frame::{self, FrameHeader, MAX_FRAME_LEN, MAX_PAYLOAD_LEN};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Consumer identity: the port id it claims plus the socket it listens on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerAddr {
    pub port_id: u32,
    pub path: PathBuf,
}

impl std::fmt::Display for ConsumerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.port_id, self.path.display())
    }
}

pub struct UnixTransport {
    socket: UnixDatagram,
    path: PathBuf,
}

impl UnixTransport {
    /// Binds the probe socket at `path`, replacing a stale socket file.
    pub fn bind(path: &Path) -> Result<Self> {
        remove_stale_socket(path)?;

        let socket = UnixDatagram::bind(path).map_err(|e| {
            NcpError::resource_init("transport socket", format!("{}: {}", path.display(), e))
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|e| NcpError::resource_init("transport socket", e))?;

        info!("Listening for consumers on {}", path.display());
        Ok(Self {
            socket,
            path: path.to_path_buf(),
        })
    }

    /// Async reader over the same socket. Must be called inside a tokio runtime.
    pub fn receiver(&self) -> Result<UnixReceiver> {
        let clone = self
            .socket
            .try_clone()
            .map_err(|e| NcpError::resource_init("transport receiver", e))?;
        let socket = tokio::net::UnixDatagram::from_std(clone)
            .map_err(|e| NcpError::resource_init("transport receiver", e))?;
        Ok(UnixReceiver {
            socket,
            buf: vec![0u8; MAX_FRAME_LEN],
        })
    }
}

impl Transport for UnixTransport {
    type Peer = ConsumerAddr;

    fn unicast(&self, peer: &ConsumerAddr, seq: u32, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(NcpError::TransmitFailure(format!(
                "payload of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }

        let total = frame::frame_len(payload.len());
        let header = FrameHeader::for_payload(frame::kind::DONE, 0, seq, 0, payload.len());
        let mut out = BytesMut::with_capacity(total);
        out.put_slice(&header.encode());
        out.put_slice(payload);
        out.resize(total, 0);

        match self.socket.send_to(&out, &peer.path) {
            Ok(sent) if sent == total => Ok(()),
            Ok(sent) => Err(NcpError::TransmitFailure(format!(
                "short send to {}: {} of {} bytes",
                peer, sent, total
            ))),
            Err(e) => Err(NcpError::TransmitFailure(format!("{}: {}", peer, e))),
        }
    }

    fn max_payload(&self) -> usize {
        MAX_PAYLOAD_LEN
    }
}

impl Drop for UnixTransport {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}

/// Inbound half of [`UnixTransport`]
pub struct UnixReceiver {
    socket: tokio::net::UnixDatagram,
    buf: Vec<u8>,
}

impl UnixReceiver {
    /// Waits for the next consumer message.
    ///
    /// Datagrams that cannot be answered (unnamed sender) or parsed are logged
    /// and yield `Ok(None)`.
    pub async fn recv(&mut self) -> Result<Option<Inbound<ConsumerAddr>>> {
        let (len, addr) = self.socket.recv_from(&mut self.buf).await?;
        let datagram = &self.buf[..len];

        let path = match addr.as_pathname() {
            Some(path) => path.to_path_buf(),
            None => {
                warn!("Illegal connection: {} byte datagram from an unbound socket", len);
                return Ok(None);
            }
        };

        let (header, payload) = match frame::parse(datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Illegal connection from {}: {}", path.display(), e);
                return Ok(None);
            }
        };

        if header.flags & frame::flags::REQUEST == 0 {
            debug!(
                "Frame from {} without the request flag (kind {})",
                path.display(),
                header.kind
            );
        }

        Ok(Some(Inbound {
            sender: ConsumerAddr {
                port_id: header.port_id,
                path,
            },
            seq: header.seq,
            payload: Bytes::copy_from_slice(payload),
        }))
    }
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!("Removing stale socket {}", path.display());
            std::fs::remove_file(path).map_err(|e| {
                NcpError::resource_init("transport socket", format!("{}: {}", path.display(), e))
            })
        }
        Ok(_) => Err(NcpError::resource_init(
            "transport socket",
            format!("{} exists and is not a socket", path.display()),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(NcpError::resource_init(
            "transport socket",
            format!("{}: {}", path.display(), e),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer_frame(seq: u32, port_id: u32, payload: &[u8]) -> Vec<u8> {
        let header = FrameHeader::for_payload(
            frame::kind::NOOP,
            frame::flags::REQUEST,
            seq,
            port_id,
            payload.len(),
        );
        let mut buf = vec![0u8; frame::frame_len(payload.len())];
        frame::write(&mut buf, &header, payload).unwrap();
        buf
    }

    #[tokio::test]
    async fn test_unicast_and_receive() {
        let dir = tempfile::tempdir().unwrap();
        let probe_path = dir.path().join("ncp.sock");
        let consumer_path = dir.path().join("consumer.sock");

        let transport = UnixTransport::bind(&probe_path).unwrap();
        let mut receiver = transport.receiver().unwrap();
        let consumer = UnixDatagram::bind(&consumer_path).unwrap();

        consumer
            .send_to(&consumer_frame(5, 4242, b"rainhurt"), &probe_path)
            .unwrap();
        let inbound = receiver.recv().await.unwrap().unwrap();
        assert_eq!(inbound.seq, 5);
        assert_eq!(inbound.sender.port_id, 4242);
        assert_eq!(inbound.sender.path, consumer_path);
        assert_eq!(&inbound.payload[..], b"rainhurt");

        transport.unicast(&inbound.sender, 5, b"phpisbst").unwrap();
        let mut buf = [0u8; 64];
        let n = consumer.recv(&mut buf).unwrap();
        let (header, payload) = frame::parse(&buf[..n]).unwrap();
        assert_eq!(n, 24);
        assert_eq!(header.seq, 5);
        assert_eq!(header.kind, frame::kind::DONE);
        assert_eq!(header.port_id, 0);
        assert_eq!(payload, b"phpisbst");
    }

    #[tokio::test]
    async fn test_garbage_datagram_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let probe_path = dir.path().join("ncp.sock");
        let transport = UnixTransport::bind(&probe_path).unwrap();
        let mut receiver = transport.receiver().unwrap();
        let consumer = UnixDatagram::bind(dir.path().join("c.sock")).unwrap();

        consumer.send_to(b"short", &probe_path).unwrap();
        assert!(receiver.recv().await.unwrap().is_none());
    }

    #[test]
    fn test_unicast_to_missing_consumer_fails() {
        let dir = tempfile::tempdir().unwrap();
        let transport = UnixTransport::bind(&dir.path().join("ncp.sock")).unwrap();
        let peer = ConsumerAddr {
            port_id: 1,
            path: dir.path().join("gone.sock"),
        };
        assert!(matches!(
            transport.unicast(&peer, 1, b"seeunext"),
            Err(NcpError::TransmitFailure(_))
        ));
    }

    #[test]
    fn test_bind_replaces_stale_socket_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ncp.sock");
        let stale = UnixDatagram::bind(&path).unwrap();
        drop(stale);

        let transport = UnixTransport::bind(&path).unwrap();
        assert!(path.exists());
        drop(transport);
        assert!(!path.exists());
    }

    #[test]
    fn test_bind_refuses_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        std::fs::write(&path, b"data").unwrap();
        assert!(matches!(
            UnixTransport::bind(&path),
            Err(NcpError::ResourceInit { .. })
        ));
    }
}
