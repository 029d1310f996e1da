//! Length-prefixed frames used by the TCP adapter.
//!
//! Layout: `u32` big-endian body length, then the body. The first body byte is
//! the frame kind:
//!
//! | kind | frame  | rest of body                          |
//! |------|--------|---------------------------------------|
//! | 0x01 | Accept | empty                                 |
//! | 0x02 | Data   | opaque payload                        |
//! | 0x03 | Close  | `u32` reason code, UTF-8 debug string |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const KIND_ACCEPT: u8 = 0x01;
const KIND_DATA: u8 = 0x02;
const KIND_CLOSE: u8 = 0x03;

/// Bytes a frame body may carry on top of its payload (kind byte, close fields).
pub const CONTROL_OVERHEAD: usize = 1 + 4 + MAX_DEBUG_LEN;

/// Close debug strings longer than this are truncated on encode.
pub const MAX_DEBUG_LEN: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Sent by the listening side once the application accepts the link.
    Accept,
    Data(Bytes),
    /// Sent by the side that closes the link.
    Close { reason: u32, debug: String },
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("empty frame")]
    Empty,

    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),

    #[error("truncated close frame")]
    Truncated,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Frame {
    /// Encode with the length prefix.
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        match self {
            Self::Accept => body.put_u8(KIND_ACCEPT),
            Self::Data(payload) => {
                body.reserve(1 + payload.len());
                body.put_u8(KIND_DATA);
                body.put_slice(payload);
            }
            Self::Close { reason, debug } => {
                let debug = truncate_utf8(debug, MAX_DEBUG_LEN);
                body.put_u8(KIND_CLOSE);
                body.put_u32(*reason);
                body.put_slice(debug.as_bytes());
            }
        }

        let mut out = BytesMut::with_capacity(4 + body.len());
        out.put_u32(body.len() as u32);
        out.extend_from_slice(&body);
        out.freeze()
    }

    /// Decode a frame body (without the length prefix).
    pub fn decode(mut body: Bytes) -> Result<Self, FrameError> {
        if body.is_empty() {
            return Err(FrameError::Empty);
        }

        match body.get_u8() {
            KIND_ACCEPT => Ok(Self::Accept),
            KIND_DATA => Ok(Self::Data(body)),
            KIND_CLOSE => {
                if body.remaining() < 4 {
                    return Err(FrameError::Truncated);
                }
                let reason = body.get_u32();
                let debug = String::from_utf8_lossy(&body).into_owned();
                Ok(Self::Close { reason, debug })
            }
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// Read one frame. `Ok(None)` means the stream ended cleanly on a frame boundary.
pub async fn read_frame<R>(reader: &mut R, max_body: usize) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > max_body {
        return Err(FrameError::TooLarge {
            size: len,
            limit: max_body,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Frame::decode(Bytes::from(body)).map(Some)
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    Ok(())
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
