//! Consumer side of the ncp protocol
//!
//! A [`Client`] binds its own datagram socket, attaches to the probe, and
//! reads event batches until either side sends the detach token.
//! [`run_session`] drives that loop and hands every batch to an [`EventSink`].

use ncp_common::frame::{self, FrameError, FrameHeader, MAX_FRAME_LEN};
use ncp_common::{records, token, ConnEvent};
use std::future::Future;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixDatagram;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad frame from probe: {0}")]
    Frame(#[from] FrameError),

    #[error("Payload of {len} bytes is not a whole number of records")]
    Malformed { len: usize },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("No reply from probe within {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// How long to wait for the probe to acknowledge a detach
pub const DETACH_TIMEOUT: Duration = Duration::from_secs(1);

/// One message from the probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Events(Vec<ConnEvent>),
    /// The probe ended the session
    Detached,
}

pub struct Client {
    socket: UnixDatagram,
    local: PathBuf,
    probe: PathBuf,
    port_id: u32,
    seq: u32,
    buf: Vec<u8>,
}

impl Client {
    /// Binds a private socket at `local` for talking to the probe at `probe`.
    pub fn bind(probe: &Path, local: &Path) -> Result<Self> {
        if let Ok(meta) = std::fs::symlink_metadata(local) {
            if meta.file_type().is_socket() {
                std::fs::remove_file(local)?;
            }
        }
        let socket = UnixDatagram::bind(local)?;
        Ok(Self {
            socket,
            local: local.to_path_buf(),
            probe: probe.to_path_buf(),
            port_id: std::process::id(),
            seq: 0,
            buf: vec![0u8; MAX_FRAME_LEN],
        })
    }

    /// Sends the attach token and waits for the probe to accept it.
    pub async fn attach(&mut self, timeout: Duration) -> Result<()> {
        self.send(token::ATTACH).await?;
        let payload = tokio::time::timeout(timeout, self.recv_payload())
            .await
            .map_err(|_| ClientError::Timeout(timeout))??;

        if token::matches(&payload, token::ATTACH_ACK) {
            Ok(())
        } else {
            Err(ClientError::Handshake(format!(
                "unexpected {} byte reply",
                payload.len()
            )))
        }
    }

    /// Waits for the next message from the probe.
    pub async fn recv(&mut self) -> Result<Message> {
        let payload = self.recv_payload().await?;
        decode(&payload)
    }

    /// Asks the probe to end the session.
    ///
    /// Returns the events flushed before the acknowledgment. Gives up quietly
    /// after `timeout`, since the probe may already be gone.
    pub async fn detach(&mut self, timeout: Duration) -> Result<Vec<ConnEvent>> {
        self.send(token::DETACH).await?;

        let mut drained = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.recv()).await {
                Ok(Ok(Message::Events(events))) => drained.extend(events),
                Ok(Ok(Message::Detached)) | Err(_) => return Ok(drained),
                Ok(Err(ClientError::Malformed { .. })) => continue,
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.seq = self.seq.wrapping_add(1);
        let header = FrameHeader::for_payload(
            frame::kind::NOOP,
            frame::flags::REQUEST,
            self.seq,
            self.port_id,
            payload.len(),
        );
        let mut out = vec![0u8; frame::frame_len(payload.len())];
        frame::write(&mut out, &header, payload);
        self.socket.send_to(&out, &self.probe).await?;
        Ok(())
    }

    async fn recv_payload(&mut self) -> Result<Vec<u8>> {
        let len = self.socket.recv(&mut self.buf).await?;
        let (_, payload) = frame::parse(&self.buf[..len])?;
        Ok(payload.to_vec())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.local);
    }
}

/// Destination for received events
pub trait EventSink {
    fn write(&mut self, events: &[ConnEvent]) -> std::io::Result<()>;

    /// Called once a second while the session runs.
    fn tick(&mut self) {}
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// `shutdown` completed and the client detached
    Interrupted,
    /// The probe sent the detach token first
    Closed,
}

/// Receives events into `sink` until `shutdown` completes or the probe ends
/// the session.
///
/// Sink errors are reported and the loop keeps running. Unless the probe ended
/// the session itself, the client always detaches before returning, including
/// after a receive error, which is returned once the detach is done.
pub async fn run_session<S, F>(client: &mut Client, sink: &mut S, shutdown: F) -> Result<Outcome>
where
    S: EventSink,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut failure = None;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            msg = client.recv() => match msg {
                Ok(Message::Events(events)) => deliver(sink, &events),
                Ok(Message::Detached) => return Ok(Outcome::Closed),
                Err(e @ ClientError::Malformed { .. }) | Err(e @ ClientError::Frame(_)) => {
                    eprintln!("Skipping message: {}", e);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            },
            _ = ticker.tick() => sink.tick(),
        }
    }

    match client.detach(DETACH_TIMEOUT).await {
        Ok(drained) => deliver(sink, &drained),
        Err(e) => eprintln!("Failed to detach from probe: {}", e),
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(Outcome::Interrupted),
    }
}

fn deliver<S: EventSink>(sink: &mut S, events: &[ConnEvent]) {
    if events.is_empty() {
        return;
    }
    if let Err(e) = sink.write(events) {
        eprintln!("Error: {}", e);
    }
}

/// Interprets a payload: the detach token, or a batch of records.
pub fn decode(payload: &[u8]) -> Result<Message> {
    if token::matches(payload, token::DETACH) {
        return Ok(Message::Detached);
    }
    records(payload)
        .map(|batch| Message::Events(batch.collect()))
        .ok_or(ClientError::Malformed { len: payload.len() })
}

/// Per-second event counter for the live status line
#[derive(Debug, Default)]
pub struct RateMeter {
    current: u64,
    total: u64,
    top: u64,
}

impl RateMeter {
    pub fn record(&mut self, events: usize) {
        self.current += events as u64;
        self.total += events as u64;
    }

    /// Closes the current one-second window and renders the status line.
    pub fn tick(&mut self) -> String {
        self.top = self.top.max(self.current);
        let line = format!(
            "Speed: {}/s Total: {} Top: {}/s",
            self.current, self.total, self.top
        );
        self.current = 0;
        line
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ncp_common::protocol;

    fn event(port: u16) -> ConnEvent {
        ConnEvent {
            src_addr: 0x0A00_0001,
            src_port: port,
            dst_addr: 0x0808_0808,
            dst_port: 53,
            protocol: protocol::UDP,
        }
    }

    fn probe_frame(seq: u32, payload: &[u8]) -> Vec<u8> {
        let header = FrameHeader::for_payload(frame::kind::DONE, 0, seq, 0, payload.len());
        let mut out = vec![0u8; frame::frame_len(payload.len())];
        frame::write(&mut out, &header, payload).unwrap();
        out
    }

    #[test]
    fn test_decode() {
        assert_eq!(decode(b"seeunext").unwrap(), Message::Detached);

        let mut batch = event(1).encode().to_vec();
        batch.extend_from_slice(&event(2).encode());
        assert_eq!(
            decode(&batch).unwrap(),
            Message::Events(vec![event(1), event(2)])
        );

        assert!(matches!(
            decode(&batch[..20]),
            Err(ClientError::Malformed { len: 20 })
        ));
    }

    #[test]
    fn test_rate_meter() {
        let mut meter = RateMeter::default();
        meter.record(5);
        meter.record(2);
        assert_eq!(meter.tick(), "Speed: 7/s Total: 7 Top: 7/s");
        meter.record(3);
        assert_eq!(meter.tick(), "Speed: 3/s Total: 10 Top: 7/s");
        assert_eq!(meter.total(), 10);
    }

    #[tokio::test]
    async fn test_session_against_fake_probe() {
        let dir = tempfile::tempdir().unwrap();
        let probe_path = dir.path().join("probe.sock");
        let probe = UnixDatagram::bind(&probe_path).unwrap();

        let mut client = Client::bind(&probe_path, &dir.path().join("client.sock")).unwrap();

        let fake = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let (n, from) = probe.recv_from(&mut buf).await.unwrap();
            let (header, payload) = frame::parse(&buf[..n]).unwrap();
            assert_eq!(payload, b"rainhurt");
            assert_eq!(header.flags, frame::flags::REQUEST);
            assert_eq!(header.seq, 1);
            let from = from.as_pathname().unwrap().to_path_buf();

            probe.send_to(&probe_frame(1, b"phpisbst"), &from).await.unwrap();
            probe
                .send_to(&probe_frame(2, &event(7).encode()), &from)
                .await
                .unwrap();
            probe.send_to(&probe_frame(3, b"seeunext"), &from).await.unwrap();
        });

        client.attach(Duration::from_secs(5)).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), Message::Events(vec![event(7)]));
        assert_eq!(client.recv().await.unwrap(), Message::Detached);
        fake.await.unwrap();
    }

    struct FailingSink {
        attempts: usize,
        on_failure: Option<tokio::sync::oneshot::Sender<()>>,
    }

    impl EventSink for FailingSink {
        fn write(&mut self, _events: &[ConnEvent]) -> std::io::Result<()> {
            self.attempts += 1;
            if let Some(tx) = self.on_failure.take() {
                let _ = tx.send(());
            }
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        }
    }

    #[tokio::test]
    async fn test_failed_write_still_detaches() {
        let dir = tempfile::tempdir().unwrap();
        let probe_path = dir.path().join("probe.sock");
        let probe = UnixDatagram::bind(&probe_path).unwrap();

        let mut client = Client::bind(&probe_path, &dir.path().join("client.sock")).unwrap();

        let fake = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let (_, from) = probe.recv_from(&mut buf).await.unwrap();
            let from = from.as_pathname().unwrap().to_path_buf();
            probe.send_to(&probe_frame(1, b"phpisbst"), &from).await.unwrap();
            probe
                .send_to(&probe_frame(2, &event(7).encode()), &from)
                .await
                .unwrap();

            let n = probe.recv(&mut buf).await.unwrap();
            let (_, payload) = frame::parse(&buf[..n]).unwrap();
            assert_eq!(payload, b"seeunext");
            probe.send_to(&probe_frame(3, b"seeunext"), &from).await.unwrap();
        });

        client.attach(Duration::from_secs(5)).await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut sink = FailingSink {
            attempts: 0,
            on_failure: Some(tx),
        };
        let shutdown = async {
            let _ = rx.await;
        };

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            run_session(&mut client, &mut sink, shutdown),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(outcome, Outcome::Interrupted);
        assert_eq!(sink.attempts, 1);
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_closed_by_probe() {
        let dir = tempfile::tempdir().unwrap();
        let probe_path = dir.path().join("probe.sock");
        let probe = UnixDatagram::bind(&probe_path).unwrap();

        let mut client = Client::bind(&probe_path, &dir.path().join("client.sock")).unwrap();

        let fake = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let (_, from) = probe.recv_from(&mut buf).await.unwrap();
            let from = from.as_pathname().unwrap().to_path_buf();
            probe.send_to(&probe_frame(1, b"phpisbst"), &from).await.unwrap();
            probe.send_to(&probe_frame(2, b"seeunext"), &from).await.unwrap();
        });

        client.attach(Duration::from_secs(5)).await.unwrap();
        let mut sink = FailingSink {
            attempts: 0,
            on_failure: None,
        };
        let outcome = run_session(&mut client, &mut sink, std::future::pending())
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Closed);
        assert_eq!(sink.attempts, 0);
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_times_out_without_probe_reply() {
        let dir = tempfile::tempdir().unwrap();
        let probe_path = dir.path().join("probe.sock");
        let _probe = UnixDatagram::bind(&probe_path).unwrap();

        let mut client = Client::bind(&probe_path, &dir.path().join("client.sock")).unwrap();
        assert!(matches!(
            client.attach(Duration::from_millis(50)).await,
            Err(ClientError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_removes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("client.sock");
        let client = Client::bind(&dir.path().join("probe.sock"), &local).unwrap();
        assert!(local.exists());
        drop(client);
        assert!(!local.exists());
    }
}
