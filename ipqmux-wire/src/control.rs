use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// The magic constant that starts every control message ("IPMQ").
pub const MAGIC: u32 = 0x4950_4D51;

/// Length of the preamble: magic (4) + type (2) + payload length (2).
pub const PREAMBLE_LEN: usize = 8;

/// Fixed size of the peer address field in a `Register` message.
pub const ADDR_LEN: usize = 32;

const REGISTER_LEN: usize = 4 + 8 + ADDR_LEN;
const SET_MODE_LEN: usize = 1 + 8;
const ERROR_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("Bad magic: {0:#010x}")]
    BadMagic(u32),
    #[error("Truncated message: {declared} bytes declared, {available} available")]
    Truncated { declared: usize, available: usize },
    #[error("Unknown message type: {0}")]
    UnknownType(u16),
    #[error("Invalid {ty:?} payload: {reason}")]
    InvalidPayload { ty: MessageType, reason: &'static str },
}

/// How much of each queued packet the upstream copies to userspace, ordered from least to
/// most permissive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum CopyMode {
    /// Nothing beyond the verdict handle.
    #[default]
    None = 0,
    /// Packet metadata only.
    Meta = 1,
    /// Metadata plus up to `range` bytes of payload.
    Packet = 2,
}

impl TryFrom<u8> for CopyMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Meta),
            2 => Ok(Self::Packet),
            other => Err(other),
        }
    }
}

/// Error codes carried by [`ControlMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Another peer already holds the requested mark.
    MarkInUse,
    /// The request is not allowed in the peer's current state.
    PermissionDenied,
    /// Verdicts kept referencing packets that were never delivered.
    PacketIdMismatch,
    /// The peer sent something that is not a valid control message.
    Protocol,
    /// The daemon could not open the peer's data channel.
    DataChannel,
    /// The peer address is empty or not a plain name.
    InvalidAddress,
    /// The peer is already registered.
    AlreadyRegistered,
    /// A code this version does not know about.
    Other(u32),
}

impl ErrorCode {
    /// The numeric value of this code on the wire.
    pub const fn code(&self) -> u32 {
        match self {
            Self::MarkInUse => 1,
            Self::PermissionDenied => 2,
            Self::PacketIdMismatch => 3,
            Self::Protocol => 4,
            Self::DataChannel => 5,
            Self::InvalidAddress => 6,
            Self::AlreadyRegistered => 7,
            Self::Other(code) => *code,
        }
    }
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        match code {
            1 => Self::MarkInUse,
            2 => Self::PermissionDenied,
            3 => Self::PacketIdMismatch,
            4 => Self::Protocol,
            5 => Self::DataChannel,
            6 => Self::InvalidAddress,
            7 => Self::AlreadyRegistered,
            other => Self::Other(other),
        }
    }
}

/// The type tag of a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Register = 1,
    RegisterAck = 2,
    Goodbye = 3,
    SetMode = 4,
    Error = 5,
}

impl TryFrom<u16> for MessageType {
    type Error = CodecError;

    fn try_from(value: u16) -> Result<Self, CodecError> {
        match value {
            1 => Ok(Self::Register),
            2 => Ok(Self::RegisterAck),
            3 => Ok(Self::Goodbye),
            4 => Ok(Self::SetMode),
            5 => Ok(MessageType::Error),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

impl MessageType {
    /// The exact payload length messages of this type carry.
    const fn payload_len(&self) -> usize {
        match self {
            Self::Register => REGISTER_LEN,
            Self::RegisterAck | Self::Goodbye => 0,
            Self::SetMode => SET_MODE_LEN,
            MessageType::Error => ERROR_LEN,
        }
    }
}

/// A validated control message preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub ty: MessageType,
    /// Declared payload length in bytes.
    pub len: u16,
}

impl Preamble {
    /// Parses and validates the preamble at the start of `src`, without consuming it.
    ///
    /// Fails with [`CodecError::BadMagic`] or [`CodecError::UnknownType`] before any payload
    /// is inspected.
    pub fn parse(src: &[u8]) -> Result<Self, CodecError> {
        if src.len() < PREAMBLE_LEN {
            return Err(CodecError::Truncated { declared: PREAMBLE_LEN, available: src.len() });
        }

        let mut buf = &src[..PREAMBLE_LEN];
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(CodecError::BadMagic(magic));
        }

        let ty = MessageType::try_from(buf.get_u16())?;
        let len = buf.get_u16();

        Ok(Self { ty, len })
    }

    /// Total frame length (preamble + payload).
    #[inline]
    pub fn frame_len(&self) -> usize {
        PREAMBLE_LEN + self.len as usize
    }
}

/// A message on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Peer → daemon: subscribe to `mark`. `addr` names the peer's data channel.
    Register { flags: u32, mark: u64, addr: String },
    /// Daemon → peer: registration succeeded, the data channel is bound.
    RegisterAck,
    /// Peer → daemon: the peer is leaving.
    Goodbye,
    /// Peer → daemon: request a copy mode and range.
    SetMode { mode: CopyMode, range: u64 },
    /// Daemon → peer: a request failed.
    Error { code: ErrorCode },
}

impl ControlMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Register { .. } => MessageType::Register,
            Self::RegisterAck => MessageType::RegisterAck,
            Self::Goodbye => MessageType::Goodbye,
            Self::SetMode { .. } => MessageType::SetMode,
            Self::Error { .. } => MessageType::Error,
        }
    }

    /// Returns the encoded size of this message in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        PREAMBLE_LEN + self.message_type().payload_len()
    }

    /// Encodes this message into `dst`.
    ///
    /// Register addresses longer than [`ADDR_LEN`] bytes are truncated.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        let ty = self.message_type();
        dst.reserve(self.size());

        dst.put_u32(MAGIC);
        dst.put_u16(ty as u16);
        dst.put_u16(ty.payload_len() as u16);

        match self {
            Self::Register { flags, mark, addr } => {
                dst.put_u32(*flags);
                dst.put_u64(*mark);

                let raw = addr.as_bytes();
                let n = raw.len().min(ADDR_LEN);
                dst.put_slice(&raw[..n]);
                dst.put_bytes(0, ADDR_LEN - n);
            }
            Self::RegisterAck | Self::Goodbye => {}
            Self::SetMode { mode, range } => {
                dst.put_u8(*mode as u8);
                dst.put_u64(*range);
            }
            Self::Error { code } => dst.put_u32(code.code()),
        }
    }

    /// Encodes this message into a new buffer.
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.size());
        self.encode_into(&mut dst);
        dst.freeze()
    }

    /// Decodes one complete message from the start of `src`. Trailing bytes are ignored.
    pub fn decode(src: &[u8]) -> Result<Self, CodecError> {
        let preamble = Preamble::parse(src)?;
        let available = src.len() - PREAMBLE_LEN;
        if preamble.len as usize > available {
            return Err(CodecError::Truncated { declared: preamble.len as usize, available });
        }

        Self::decode_payload(preamble.ty, &src[PREAMBLE_LEN..preamble.frame_len()])
    }

    /// Decodes the payload of a message of type `ty`. `payload` must be exactly the declared
    /// payload, nothing past it is ever read.
    fn decode_payload(ty: MessageType, mut payload: &[u8]) -> Result<Self, CodecError> {
        if payload.len() != ty.payload_len() {
            return Err(CodecError::InvalidPayload { ty, reason: "unexpected payload length" });
        }

        let msg = match ty {
            MessageType::Register => {
                let flags = payload.get_u32();
                let mark = payload.get_u64();

                let raw = &payload[..ADDR_LEN];
                let end = raw.iter().position(|b| *b == 0).unwrap_or(ADDR_LEN);
                let addr = std::str::from_utf8(&raw[..end])
                    .map_err(|_| CodecError::InvalidPayload { ty, reason: "address is not UTF-8" })?
                    .to_owned();

                Self::Register { flags, mark, addr }
            }
            MessageType::RegisterAck => Self::RegisterAck,
            MessageType::Goodbye => Self::Goodbye,
            MessageType::SetMode => {
                let mode = CopyMode::try_from(payload.get_u8())
                    .map_err(|_| CodecError::InvalidPayload { ty, reason: "unknown copy mode" })?;
                let range = payload.get_u64();

                Self::SetMode { mode, range }
            }
            MessageType::Error => Self::Error { code: ErrorCode::from(payload.get_u32()) },
        };

        Ok(msg)
    }
}

/// Streaming control codec, for use with [`Framed`](tokio_util::codec::Framed).
///
/// Unlike [`ControlMessage::decode`], an incomplete frame is not an error here: the decoder
/// waits for more bytes. The preamble is still validated as soon as it is available.
#[derive(Debug, Default)]
pub struct Codec {
    /// The validated preamble of the frame currently being received.
    preamble: Option<Preamble>,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for Codec {
    type Item = ControlMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let preamble = match self.preamble {
            Some(preamble) => preamble,
            None => {
                // Reject a bad magic as soon as we have it, without waiting for the rest
                if src.len() >= 4 {
                    let magic = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
                    if magic != MAGIC {
                        return Err(CodecError::BadMagic(magic));
                    }
                }

                if src.len() < PREAMBLE_LEN {
                    return Ok(None);
                }

                let preamble = Preamble::parse(src)?;
                tracing::trace!(?preamble, "control preamble");
                src.advance(PREAMBLE_LEN);
                self.preamble = Some(preamble);
                preamble
            }
        };

        let len = preamble.len as usize;
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.preamble = None;
        let payload = src.split_to(len);
        ControlMessage::decode_payload(preamble.ty, &payload).map(Some)
    }
}

impl Encoder<ControlMessage> for Codec {
    type Error = CodecError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst);
        Ok(())
    }
}
