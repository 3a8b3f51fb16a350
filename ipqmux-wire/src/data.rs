use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::control::CopyMode;

/// Packet datagram header: id (8) + mark (8) + payload length (4).
pub const PACKET_HEADER_LEN: usize = 20;

/// Verdict datagram header: id (8) + decision (4) + payload length (4).
pub const VERDICT_HEADER_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataError {
    #[error("Datagram too short: {0} bytes")]
    Short(usize),
    #[error("Payload length mismatch: {declared} bytes declared, {available} available")]
    LengthMismatch { declared: usize, available: usize },
    #[error("Unknown decision: {0}")]
    UnknownDecision(u32),
}

/// A packet queued by the upstream, identified by `id` and routed by `mark`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u64,
    pub mark: u64,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(id: u64, mark: u64, payload: Bytes) -> Self {
        Self { id, mark, payload }
    }

    /// Returns the encoded size of this packet in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        PACKET_HEADER_LEN + self.payload.len()
    }

    /// Returns this packet cut down to what a peer asked to see.
    ///
    /// [`CopyMode::None`] and [`CopyMode::Meta`] strip the payload entirely. [`CopyMode::Packet`]
    /// keeps at most `range` bytes, where a range of 0 keeps everything.
    pub fn copied(mut self, mode: CopyMode, range: u64) -> Self {
        match mode {
            CopyMode::None | CopyMode::Meta => self.payload = Bytes::new(),
            CopyMode::Packet => {
                if range != 0 && (self.payload.len() as u64) > range {
                    self.payload.truncate(range as usize);
                }
            }
        }

        self
    }

    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.size());
        dst.put_u64(self.id);
        dst.put_u64(self.mark);
        dst.put_u32(self.payload.len() as u32);
        dst.put_slice(&self.payload);
        dst.freeze()
    }

    pub fn decode(mut src: &[u8]) -> Result<Self, DataError> {
        if src.len() < PACKET_HEADER_LEN {
            return Err(DataError::Short(src.len()));
        }

        let id = src.get_u64();
        let mark = src.get_u64();
        let payload = take_payload(&mut src)?;

        Ok(Self { id, mark, payload })
    }
}

/// The decision a peer made about a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Decision {
    Drop = 0,
    Accept = 1,
}

impl TryFrom<u32> for Decision {
    type Error = DataError;

    fn try_from(value: u32) -> Result<Self, DataError> {
        match value {
            0 => Ok(Self::Drop),
            1 => Ok(Self::Accept),
            other => Err(DataError::UnknownDecision(other)),
        }
    }
}

/// A peer's answer to a delivered packet, optionally replacing its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub id: u64,
    pub decision: Decision,
    pub payload: Option<Bytes>,
}

impl Verdict {
    pub fn new(id: u64, decision: Decision) -> Self {
        Self { id, decision, payload: None }
    }

    pub fn accept(id: u64) -> Self {
        Self::new(id, Decision::Accept)
    }

    pub fn drop(id: u64) -> Self {
        Self::new(id, Decision::Drop)
    }

    /// Replaces the packet payload with `payload`. An empty payload means "no replacement".
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = (!payload.is_empty()).then_some(payload);
        self
    }

    /// Returns the encoded size of this verdict in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        VERDICT_HEADER_LEN + self.payload.as_ref().map_or(0, Bytes::len)
    }

    pub fn encode(&self) -> Bytes {
        let payload = self.payload.as_deref().unwrap_or_default();

        let mut dst = BytesMut::with_capacity(self.size());
        dst.put_u64(self.id);
        dst.put_u32(self.decision as u32);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(payload);
        dst.freeze()
    }

    pub fn decode(mut src: &[u8]) -> Result<Self, DataError> {
        if src.len() < VERDICT_HEADER_LEN {
            return Err(DataError::Short(src.len()));
        }

        let id = src.get_u64();
        let decision = Decision::try_from(src.get_u32())?;
        let payload = take_payload(&mut src)?;

        Ok(Self { id, decision, payload: (!payload.is_empty()).then_some(payload) })
    }
}

/// Reads a `u32` length prefix and exactly that many payload bytes. The datagram must end
/// right after the payload.
fn take_payload(src: &mut &[u8]) -> Result<Bytes, DataError> {
    let declared = src.get_u32() as usize;
    if declared != src.len() {
        return Err(DataError::LengthMismatch { declared, available: src.len() });
    }

    Ok(Bytes::copy_from_slice(src))
}
