//! Continuum wire protocol
//!
//! Length-prefixed frames over a long-lived byte stream:
//!
//! ```text
//! +----------------+--------+--------------------+-----------------+
//! | length: u32 BE | kind   | correlation: u64 BE| payload (JSON)  |
//! | payload only   | 1 byte |                    | `length` bytes  |
//! +----------------+--------+--------------------+-----------------+
//! ```
//!
//! Frames sharing a correlation id form one exchange, which the server ends
//! with an `End` frame. The declared length is checked against the
//! configured maximum before any payload is buffered.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::DEFAULT_MAX_FRAME_SIZE;
use crate::types::{CompletionChunk, CompletionRequest};
use crate::{GatewayError, Result};

/// Bytes before the payload: length, kind, correlation id
pub const HEADER_LEN: usize = 4 + 1 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Request = 1,
    Chunk = 2,
    End = 3,
    Error = 4,
    Cancel = 5,
}

impl FrameKind {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(FrameKind::Request),
            2 => Ok(FrameKind::Chunk),
            3 => Ok(FrameKind::End),
            4 => Ok(FrameKind::Error),
            5 => Ok(FrameKind::Cancel),
            other => Err(GatewayError::ProtocolViolation(format!(
                "unknown frame kind {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub correlation_id: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, correlation_id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            correlation_id,
            payload: payload.into(),
        }
    }

    fn json<T: Serialize>(kind: FrameKind, correlation_id: u64, value: &T) -> Result<Self> {
        Ok(Self::new(kind, correlation_id, serde_json::to_vec(value)?))
    }

    fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            GatewayError::ProtocolViolation(format!("undecodable {:?} payload: {}", self.kind, e))
        })
    }
}

/// Frame codec for [`tokio_util::codec::Framed`]
#[derive(Debug, Clone, Copy)]
pub struct ContinuumCodec {
    max_frame_size: u32,
}

impl ContinuumCodec {
    pub fn new(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }
}

impl Default for ContinuumCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for ContinuumCodec {
    type Item = Frame;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if length > self.max_frame_size {
            return Err(GatewayError::ProtocolViolation(format!(
                "frame of {} bytes exceeds limit of {}",
                length, self.max_frame_size
            )));
        }
        let kind = FrameKind::from_byte(src[4])?;

        let total = HEADER_LEN + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(5);
        let correlation_id = src.get_u64();
        let payload = src.split_to(length as usize).freeze();

        Ok(Some(Frame {
            kind,
            correlation_id,
            payload,
        }))
    }
}

impl Encoder<Frame> for ContinuumCodec {
    type Error = GatewayError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > self.max_frame_size as usize {
            return Err(GatewayError::ProtocolViolation(format!(
                "refusing to send {} byte frame, limit is {}",
                frame.payload.len(),
                self.max_frame_size
            )));
        }

        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u32(frame.payload.len() as u32);
        dst.put_u8(frame.kind as u8);
        dst.put_u64(frame.correlation_id);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

/// Payload of a `Request` frame. The token travels with every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub token: String,
    pub request: CompletionRequest,
}

/// Error detail carried by `End`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl From<&GatewayError> for WireError {
    fn from(err: &GatewayError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            retry_after_secs: err.retry_after_secs(),
        }
    }
}

impl WireError {
    /// Rebuild the error on the receiving side.
    pub fn into_error(self) -> GatewayError {
        match self.code.as_str() {
            "UNAUTHORIZED" => GatewayError::Unauthorized,
            "FORBIDDEN" => GatewayError::Forbidden(self.message),
            "RATE_LIMITED" => GatewayError::RateLimited {
                retry_after_secs: self.retry_after_secs.unwrap_or(1),
            },
            "MODEL_NOT_FOUND" => GatewayError::ModelNotFound(self.message),
            "PROVIDER_UNAVAILABLE" => GatewayError::ProviderUnavailable(self.message),
            "PROVIDER_STREAM_FAILED" => GatewayError::ProviderStreamFailed(self.message),
            "PROTOCOL_VIOLATION" => GatewayError::ProtocolViolation(self.message),
            "INVALID_REQUEST" => GatewayError::InvalidRequest(self.message),
            _ => GatewayError::Internal(self.message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndPayload {
    pub error: Option<WireError>,
}

/// Connection-wide protocol error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl From<&GatewayError> for ErrorPayload {
    fn from(err: &GatewayError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Typed view of a frame
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Request(RequestPayload),
    Chunk(CompletionChunk),
    End(EndPayload),
    Error(ErrorPayload),
    Cancel,
}

impl WireMessage {
    pub fn end(error: Option<&GatewayError>) -> Self {
        WireMessage::End(EndPayload {
            error: error.map(WireError::from),
        })
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            WireMessage::Request(_) => FrameKind::Request,
            WireMessage::Chunk(_) => FrameKind::Chunk,
            WireMessage::End(_) => FrameKind::End,
            WireMessage::Error(_) => FrameKind::Error,
            WireMessage::Cancel => FrameKind::Cancel,
        }
    }

    pub fn to_frame(&self, correlation_id: u64) -> Result<Frame> {
        let kind = self.kind();
        match self {
            WireMessage::Request(payload) => Frame::json(kind, correlation_id, payload),
            WireMessage::Chunk(chunk) => Frame::json(kind, correlation_id, chunk),
            WireMessage::End(payload) => Frame::json(kind, correlation_id, payload),
            WireMessage::Error(payload) => Frame::json(kind, correlation_id, payload),
            WireMessage::Cancel => Ok(Frame::new(kind, correlation_id, Bytes::new())),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        Ok(match frame.kind {
            FrameKind::Request => WireMessage::Request(frame.parse()?),
            FrameKind::Chunk => WireMessage::Chunk(frame.parse()?),
            FrameKind::End => WireMessage::End(frame.parse()?),
            FrameKind::Error => WireMessage::Error(frame.parse()?),
            FrameKind::Cancel => WireMessage::Cancel,
        })
    }
}
