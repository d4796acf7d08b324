//! Message framing
//!
//! Every datagram exchanged between the probe and a consumer is one frame:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                              len                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |             kind              |             flags             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                              seq                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                            port_id                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    payload (zero padded to 4)                 |
//! /                              ...                              /
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The header mirrors `struct nlmsghdr`. All fields are little-endian and
//! `len` counts the header plus the unpadded payload.

/// The length of the frame header.
pub const HEADER_LEN: usize = 16;

/// Payload alignment.
pub const ALIGNTO: usize = 4;

/// Largest frame either side will send or accept.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Frame kinds
pub mod kind {
    pub const NOOP: u16 = 1;
    /// Used for every probe-to-consumer frame
    pub const DONE: u16 = 3;
}

/// Frame flags
pub mod flags {
    /// Set on every consumer-to-probe frame
    pub const REQUEST: u16 = 1;
}

/// Rounds `len` up to the payload alignment.
pub const fn align(len: usize) -> usize {
    (len + ALIGNTO - 1) & !(ALIGNTO - 1)
}

/// Total on-wire size of a frame carrying `payload_len` bytes.
pub const fn frame_len(payload_len: usize) -> usize {
    align(HEADER_LEN + payload_len)
}

/// Largest payload that fits in [`MAX_FRAME_LEN`].
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - HEADER_LEN;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub len: u32,
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    pub port_id: u32,
}

impl FrameHeader {
    /// Header for a frame carrying `payload_len` bytes.
    pub fn for_payload(kind: u16, flags: u16, seq: u32, port_id: u32, payload_len: usize) -> Self {
        Self {
            len: (HEADER_LEN + payload_len) as u32,
            kind,
            flags,
            seq,
            port_id,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.len.to_le_bytes());
        out[4..6].copy_from_slice(&self.kind.to_le_bytes());
        out[6..8].copy_from_slice(&self.flags.to_le_bytes());
        out[8..12].copy_from_slice(&self.seq.to_le_bytes());
        out[12..16].copy_from_slice(&self.port_id.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            len: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            kind: u16::from_le_bytes([bytes[4], bytes[5]]),
            flags: u16::from_le_bytes([bytes[6], bytes[7]]),
            seq: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            port_id: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        })
    }

    pub fn payload_len(&self) -> usize {
        (self.len as usize).saturating_sub(HEADER_LEN)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than a header
    Truncated { available: usize },
    /// `len` is smaller than a header or larger than the datagram
    BadLength { len: u32, available: usize },
}

impl core::fmt::Display for FrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FrameError::Truncated { available } => {
                write!(f, "frame truncated: {} bytes, header needs {}", available, HEADER_LEN)
            }
            FrameError::BadLength { len, available } => {
                write!(f, "frame length {} does not fit datagram of {} bytes", len, available)
            }
        }
    }
}

#[cfg(feature = "userspace")]
impl std::error::Error for FrameError {}

/// Splits a received datagram into its header and unpadded payload.
pub fn parse(datagram: &[u8]) -> Result<(FrameHeader, &[u8]), FrameError> {
    let header = FrameHeader::decode(datagram).ok_or(FrameError::Truncated {
        available: datagram.len(),
    })?;
    let len = header.len as usize;
    if len < HEADER_LEN || len > datagram.len() {
        return Err(FrameError::BadLength {
            len: header.len,
            available: datagram.len(),
        });
    }
    Ok((header, &datagram[HEADER_LEN..len]))
}

/// Writes a complete frame (header, payload, padding) into `out`.
///
/// Returns the number of bytes written, or `None` if `out` is too small.
pub fn write(out: &mut [u8], header: &FrameHeader, payload: &[u8]) -> Option<usize> {
    let total = frame_len(payload.len());
    if out.len() < total {
        return None;
    }
    out[..HEADER_LEN].copy_from_slice(&header.encode());
    out[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
    out[HEADER_LEN + payload.len()..total].fill(0);
    Some(total)
}
