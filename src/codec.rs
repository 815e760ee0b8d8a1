//! Length-prefixed envelope framing
//!
//! Every message exchanged between the parent and the enclave is an
//! [`Envelope`] serialized as JSON and preceded by its length:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────────────────┐
//! │ u32 length (BE)      │ UTF-8 JSON {"endpoint": .., "data": ..}  │
//! └──────────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! The codec itself enforces no size limit; transports pass one to
//! [`read_frame`].

use crate::error::{FramingError, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// A request or response exchanged between parent and enclave
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Slash-prefixed logical path, e.g. `/status`
    pub endpoint: String,
    /// Arbitrary structured payload
    #[serde(default)]
    pub data: Value,
    /// HTTP-style status code, only present on responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl Envelope {
    pub fn request(endpoint: impl Into<String>, data: Value) -> Self {
        Self {
            endpoint: endpoint.into(),
            data,
            status: None,
        }
    }

    /// Builds the response envelope for a handled request
    pub fn response(endpoint: impl Into<String>, reply: Reply) -> Self {
        Self {
            endpoint: endpoint.into(),
            data: reply.body,
            status: Some(reply.status),
        }
    }

    /// Converts a response envelope back into a reply. A missing status means 200.
    pub fn into_reply(self) -> Reply {
        Reply {
            body: self.data,
            status: self.status.unwrap_or(200),
        }
    }
}

/// A handler's return value: payload plus HTTP-style status
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub body: Value,
    pub status: u16,
}

impl Reply {
    pub fn ok(body: Value) -> Self {
        Self { body, status: 200 }
    }

    pub fn with_status(body: Value, status: u16) -> Self {
        Self { body, status }
    }

    /// Structured error reply: `{"status": "error", "message": .., "error": ..}`
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            body: json!({
                "status": "error",
                "message": message,
                "error": message,
            }),
            status,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Encodes an envelope into a length-prefixed frame
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, FramingError> {
    let payload = serde_json::to_vec(envelope)
        .map_err(|e| FramingError::Malformed(format!("cannot serialize envelope: {}", e)))?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        FramingError::Malformed(format!("payload of {} bytes overflows u32", payload.len()))
    })?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes a complete length-prefixed frame
pub fn decode(frame: &[u8]) -> Result<Envelope, FramingError> {
    let declared = declared_len(frame)?;
    let body = &frame[LENGTH_PREFIX_BYTES..];

    if body.len() < declared {
        return Err(FramingError::Truncated {
            expected: declared,
            available: body.len(),
        });
    }
    if body.len() > declared {
        return Err(FramingError::Malformed(format!(
            "{} trailing bytes after frame",
            body.len() - declared
        )));
    }

    decode_payload(body)
}

/// Reads the length prefix of a frame
pub fn declared_len(frame: &[u8]) -> Result<usize, FramingError> {
    let prefix: [u8; LENGTH_PREFIX_BYTES] = frame
        .get(..LENGTH_PREFIX_BYTES)
        .and_then(|p| p.try_into().ok())
        .ok_or(FramingError::Truncated {
            expected: LENGTH_PREFIX_BYTES,
            available: frame.len(),
        })?;
    Ok(u32::from_be_bytes(prefix) as usize)
}

/// Decodes an envelope body whose length prefix has already been consumed
pub fn decode_payload(body: &[u8]) -> Result<Envelope, FramingError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| FramingError::Malformed(format!("payload is not UTF-8: {}", e)))?;
    serde_json::from_str(text)
        .map_err(|e| FramingError::Malformed(format!("payload is not an envelope: {}", e)))
}

/// Reads one frame from a stream.
///
/// Returns `Ok(None)` when the peer closed the stream before sending any
/// byte of a new frame. The timeout applies to every individual read call.
pub async fn read_frame<R>(
    reader: &mut R,
    read_timeout: Duration,
    max_frame_bytes: Option<usize>,
) -> Result<Option<Envelope>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
    let filled = read_full(reader, &mut prefix, read_timeout).await?;
    if filled == 0 {
        return Ok(None);
    }
    if filled < LENGTH_PREFIX_BYTES {
        return Err(FramingError::Truncated {
            expected: LENGTH_PREFIX_BYTES,
            available: filled,
        }
        .into());
    }

    let declared = u32::from_be_bytes(prefix) as usize;
    if let Some(limit) = max_frame_bytes {
        if declared > limit {
            return Err(TransportError::FrameTooLarge {
                size: declared,
                limit,
            });
        }
    }

    let mut body = vec![0u8; declared];
    let filled = read_full(reader, &mut body, read_timeout).await?;
    if filled < declared {
        return Err(FramingError::Truncated {
            expected: declared,
            available: filled,
        }
        .into());
    }

    Ok(Some(decode_payload(&body)?))
}

/// Writes one frame to a stream and flushes it
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Fills `buf` until it is full or the stream ends; returns the number of bytes read
async fn read_full<R>(
    reader: &mut R,
    buf: &mut [u8],
    read_timeout: Duration,
) -> Result<usize, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = tokio::time::timeout(read_timeout, reader.read(&mut buf[filled..]))
            .await
            .map_err(|_| TransportError::Timeout(read_timeout))??;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
