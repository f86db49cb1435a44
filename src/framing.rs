//! Content-Length message framing over stream sockets.
//!
//! Envelopes are JSON bodies delimited LSP-style, which gives reliable
//! message boundaries on a byte stream without escaping the body:
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <body>
//! ```
//!
//! Header parsing is case-insensitive and accepts both CRLF and LF endings.
//! Unknown headers are skipped.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RpcError;

/// Maximum frame body (16MB); a corrupt or hostile peer cannot force an
/// arbitrarily large allocation.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Read one framed message from the stream.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary, which is how the
/// read loops distinguish an orderly disconnect from a truncated message.
///
/// # Errors
///
/// Returns [`RpcError::Protocol`] if the header is missing or malformed, the
/// declared length exceeds the frame cap, or the body is not UTF-8, and
/// [`RpcError::Io`] if the stream fails mid-frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<String>, RpcError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            if saw_header {
                return Err(RpcError::Protocol(
                    "connection closed mid-frame".to_string(),
                ));
            }
            return Ok(None);
        }
        saw_header = true;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }

        if let Some(colon) = trimmed.find(':') {
            let key = trimmed[..colon].trim();
            let value = trimmed[colon + 1..].trim();
            if key.eq_ignore_ascii_case("Content-Length") {
                let parsed = value.parse().map_err(|_| {
                    RpcError::Protocol(format!("invalid Content-Length value: {value}"))
                })?;
                content_length = Some(parsed);
            }
        }
    }

    let size = content_length
        .ok_or_else(|| RpcError::Protocol("missing Content-Length header".to_string()))?;
    if size > MAX_FRAME_SIZE {
        return Err(RpcError::Protocol(format!(
            "frame size {size} exceeds maximum {MAX_FRAME_SIZE} bytes"
        )));
    }

    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;

    let body = String::from_utf8(body)
        .map_err(|_| RpcError::Protocol("frame body is not valid UTF-8".to_string()))?;
    Ok(Some(body))
}

/// Write one framed message to the stream and flush it.
pub async fn write_frame<W>(writer: &mut W, body: &str) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
