//! Line-delimited framing for JSON message streams.
//!
//! Every message on the wire is one UTF-8 JSON document terminated by a
//! single `\n`:
//!
//! ```text
//! {"$":"get_time"}\n
//! {"$":"info_time","time":1234}\n
//! ```
//!
//! `serde_json` escapes newlines inside strings, so the terminator is
//! unambiguous. A length ceiling guards both sides against runaway frames.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed frame length in bytes, terminator included.
    /// Default: 1 MB.
    pub max_frame_len: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_len: 1_048_576,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame exceeds the configured maximum length.
    #[error("frame length {len} exceeds maximum {max}")]
    FrameTooLarge {
        /// Observed length in bytes.
        len: usize,
        /// The configured maximum.
        max: usize,
    },

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// The frame is not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads one frame, without its terminator.
///
/// Returns [`FrameError::ConnectionClosed`] on a clean EOF before any
/// bytes, and on a truncated final line.
pub async fn read_frame<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<String, FrameError> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Err(FrameError::ConnectionClosed);
    }
    if buf.len() > config.max_frame_len {
        return Err(FrameError::FrameTooLarge {
            len: buf.len(),
            max: config.max_frame_len,
        });
    }
    if buf.last() != Some(&b'\n') {
        // EOF in the middle of a frame.
        return Err(FrameError::ConnectionClosed);
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(String::from_utf8(buf)?)
}

/// Writes one frame followed by its terminator and flushes.
///
/// The payload must not contain a raw newline; JSON encoding guarantees
/// that for every message this crate produces.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &str,
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = payload.len() + 1;
    if len > config.max_frame_len {
        return Err(FrameError::FrameTooLarge {
            len,
            max: config.max_frame_len,
        });
    }
    writer.write_all(payload.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt, BufReader};

    fn default_config() -> FrameConfig {
        FrameConfig::default()
    }

    #[tokio::test]
    async fn test_single_frame_roundtrip() {
        let (mut client, server) = duplex(8192);
        let mut server = BufReader::new(server);
        let config = default_config();

        write_frame(&mut client, r#"{"$":"get_time"}"#, &config)
            .await
            .unwrap();
        let received = read_frame(&mut server, &config).await.unwrap();
        assert_eq!(received, r#"{"$":"get_time"}"#);
    }

    #[tokio::test]
    async fn test_frames_do_not_merge() {
        let (mut client, server) = duplex(8192);
        let mut server = BufReader::new(server);
        let config = default_config();

        write_frame(&mut client, "first", &config).await.unwrap();
        write_frame(&mut client, "second", &config).await.unwrap();

        assert_eq!(read_frame(&mut server, &config).await.unwrap(), "first");
        assert_eq!(read_frame(&mut server, &config).await.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_escaped_newline_stays_inside_frame() {
        let (mut client, server) = duplex(8192);
        let mut server = BufReader::new(server);
        let config = default_config();

        // A JSON string containing "\n" arrives as the two bytes `\` `n`.
        let payload = serde_json::to_string(&serde_json::json!({ "text": "a\nb" })).unwrap();
        write_frame(&mut client, &payload, &config).await.unwrap();
        let received = read_frame(&mut server, &config).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_write() {
        let (mut client, _server) = duplex(8192);
        let config = FrameConfig { max_frame_len: 16 };
        let big = "x".repeat(64);
        let result = write_frame(&mut client, &big, &config).await;
        assert!(matches!(result, Err(FrameError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let (mut client, server) = duplex(8192);
        let mut server = BufReader::new(server);
        let config = FrameConfig { max_frame_len: 16 };

        client.write_all("y".repeat(64).as_bytes()).await.unwrap();
        client.write_all(b"\n").await.unwrap();
        client.flush().await.unwrap();

        let result = read_frame(&mut server, &config).await;
        assert!(matches!(result, Err(FrameError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_clean_eof_reports_closed() {
        let (client, server) = duplex(8192);
        drop(client);
        let mut server = BufReader::new(server);
        let result = read_frame(&mut server, &default_config()).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_truncated_frame_reports_closed() {
        let (mut client, server) = duplex(8192);
        client.write_all(b"{\"$\":\"get_").await.unwrap();
        client.flush().await.unwrap();
        drop(client);

        let mut server = BufReader::new(server);
        let result = read_frame(&mut server, &default_config()).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_crlf_terminator_tolerated() {
        let (mut client, server) = duplex(8192);
        client.write_all(b"{\"$\":\"get_time\"}\r\n").await.unwrap();
        client.flush().await.unwrap();

        let mut server = BufReader::new(server);
        let received = read_frame(&mut server, &default_config()).await.unwrap();
        assert_eq!(received, "{\"$\":\"get_time\"}");
    }
}
