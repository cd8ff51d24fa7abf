//! Length-prefixed frames multiplexing many calls over one byte stream.
//!
//! Layout: `u32 length | u32 stream id | u8 kind | body`, big-endian, where
//! `length` counts everything after itself.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Metadata, Status};

/// Maximum size of a single frame, header included.
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Maximum encoded size of a `HEADERS` body.
pub const MAX_HEADERS_SIZE: usize = 16 * 1024;

const PREFIX_LEN: usize = 4;
const HEADER_LEN: usize = 5;

/// Largest `MESSAGE` body that still fits in one frame.
pub const MAX_MESSAGE_SIZE: usize = MAX_FRAME_SIZE - PREFIX_LEN - HEADER_LEN;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("frame shorter than its header")]
    Truncated,
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),
    #[error("malformed {what}: {source}")]
    Json {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("call headers of {0} bytes exceed the limit")]
    HeadersTooLarge(usize),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Headers,
    Message,
    HalfClose,
    Trailers,
    Cancel,
    /// Grants the other side more messages on a stream.
    Window,
}

impl FrameKind {
    fn to_u8(self) -> u8 {
        match self {
            FrameKind::Headers => 0x01,
            FrameKind::Message => 0x02,
            FrameKind::HalfClose => 0x03,
            FrameKind::Trailers => 0x04,
            FrameKind::Cancel => 0x05,
            FrameKind::Window => 0x06,
        }
    }

    fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(FrameKind::Headers),
            0x02 => Ok(FrameKind::Message),
            0x03 => Ok(FrameKind::HalfClose),
            0x04 => Ok(FrameKind::Trailers),
            0x05 => Ok(FrameKind::Cancel),
            0x06 => Ok(FrameKind::Window),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    pub kind: FrameKind,
    pub body: Bytes,
}

impl Frame {
    pub fn new(stream_id: u32, kind: FrameKind, body: Bytes) -> Self {
        Self {
            stream_id,
            kind,
            body,
        }
    }

    pub fn message(stream_id: u32, body: Bytes) -> Self {
        Self::new(stream_id, FrameKind::Message, body)
    }

    pub fn half_close(stream_id: u32) -> Self {
        Self::new(stream_id, FrameKind::HalfClose, Bytes::new())
    }

    pub fn cancel(stream_id: u32) -> Self {
        Self::new(stream_id, FrameKind::Cancel, Bytes::new())
    }

    pub fn window(stream_id: u32, increment: u32) -> Self {
        Self::new(stream_id, FrameKind::Window, Bytes::copy_from_slice(&increment.to_be_bytes()))
    }

    pub fn headers(stream_id: u32, headers: &CallHeaders) -> Result<Self, ProtocolError> {
        let body = serde_json::to_vec(headers).map_err(|source| ProtocolError::Json {
            what: "call headers",
            source,
        })?;
        if body.len() > MAX_HEADERS_SIZE {
            return Err(ProtocolError::HeadersTooLarge(body.len()));
        }
        Ok(Self::new(stream_id, FrameKind::Headers, body.into()))
    }

    pub fn trailers(stream_id: u32, status: &Status) -> Self {
        // Status only holds a number and a string; encoding cannot fail.
        let body = serde_json::to_vec(status).unwrap_or_default();
        Self::new(stream_id, FrameKind::Trailers, body.into())
    }

    pub fn encoded_len(&self) -> usize {
        PREFIX_LEN + HEADER_LEN + self.body.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        if self.encoded_len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(self.encoded_len()));
        }
        buf.reserve(self.encoded_len());
        buf.put_u32((HEADER_LEN + self.body.len()) as u32);
        buf.put_u32(self.stream_id);
        buf.put_u8(self.kind.to_u8());
        buf.put_slice(&self.body);
        Ok(())
    }

    /// Decodes one frame from the front of `buf`, or returns `None` when more
    /// bytes are needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < PREFIX_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len + PREFIX_LEN > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(len + PREFIX_LEN));
        }
        if len < HEADER_LEN {
            return Err(ProtocolError::Truncated);
        }
        if buf.len() < PREFIX_LEN + len {
            buf.reserve(PREFIX_LEN + len - buf.len());
            return Ok(None);
        }

        buf.advance(PREFIX_LEN);
        let mut frame = buf.split_to(len);
        let stream_id = frame.get_u32();
        let kind = FrameKind::from_u8(frame.get_u8())?;

        Ok(Some(Self::new(stream_id, kind, frame.freeze())))
    }

    pub fn parse_headers(&self) -> Result<CallHeaders, ProtocolError> {
        if self.body.len() > MAX_HEADERS_SIZE {
            return Err(ProtocolError::HeadersTooLarge(self.body.len()));
        }
        serde_json::from_slice(&self.body).map_err(|source| ProtocolError::Json {
            what: "call headers",
            source,
        })
    }

    pub fn window_increment(&self) -> Result<u32, ProtocolError> {
        let bytes: [u8; 4] = self.body[..].try_into().map_err(|_| ProtocolError::Truncated)?;
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn parse_trailers(&self) -> Result<Status, ProtocolError> {
        serde_json::from_slice(&self.body).map_err(|source| ProtocolError::Json {
            what: "trailers",
            source,
        })
    }
}

/// Body of the `HEADERS` frame that opens a call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHeaders {
    pub method: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl CallHeaders {
    pub fn new(method: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            method: method.into(),
            metadata,
            timeout_ms: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_ms = timeout.map(|t| t.as_millis().min(u128::from(u64::MAX)) as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Reads the next frame, buffering partial reads in `buf`. Returns `None` on a
/// clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = Frame::decode(buf)? {
            return Ok(Some(frame));
        }
        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProtocolError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    buf.clear();
    frame.encode(buf)?;
    writer.write_all(buf).await?;
    Ok(())
}
