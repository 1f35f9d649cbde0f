//! Content-Length framing for the Unix-socket transport.
//!
//! A Unix stream has no message boundaries, so each JSON frame is preceded
//! by an HTTP-style header block (the same layout LSP uses):
//!
//! ```text
//! Content-Length: 27\r\n
//! \r\n
//! {"id":"a1","method":"ping"}
//! ```
//!
//! Header names are matched case-insensitively, unknown headers are skipped,
//! and bare `\n` line endings are accepted.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest body accepted from a peer (100MB).
const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";

/// Read one framed message.
///
/// Returns `Ok(None)` if the peer closed the stream on a frame boundary.
///
/// # Errors
///
/// Fails on EOF inside a frame, a missing or unparsable `Content-Length`, a
/// body larger than [`MAX_MESSAGE_SIZE`], or a body that is not UTF-8.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(size) = read_headers(reader).await? else {
        return Ok(None);
    };
    if size > MAX_MESSAGE_SIZE {
        bail!(
            "Message size {} exceeds maximum {} bytes",
            size,
            MAX_MESSAGE_SIZE
        );
    }

    let mut body = vec![0u8; size];
    reader
        .read_exact(&mut body)
        .await
        .context("Stream ended inside a message body")?;
    let text = String::from_utf8(body).context("Message body is not valid UTF-8")?;
    Ok(Some(text))
}

/// Consume a header block, returning the declared body length.
async fn read_headers<R>(reader: &mut R) -> Result<Option<usize>>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length = None;
    let mut first_line = true;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await.context("Failed to read header")? == 0 {
            if first_line {
                return Ok(None);
            }
            bail!("Stream ended inside a header block");
        }
        first_line = false;

        let header = line.trim();
        if header.is_empty() {
            break;
        }
        if let Some(length) = parse_content_length(header)? {
            content_length = Some(length);
        }
    }

    content_length
        .map(Some)
        .with_context(|| format!("Missing {} header", CONTENT_LENGTH))
}

fn parse_content_length(header: &str) -> Result<Option<usize>> {
    let Some((name, value)) = header.split_once(':') else {
        return Ok(None);
    };
    if !name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
        return Ok(None);
    }
    let value = value.trim();
    value
        .parse()
        .map(Some)
        .with_context(|| format!("Invalid {} value: {}", CONTENT_LENGTH, value))
}

/// Write `body` as one framed message and flush.
pub async fn write_message<W>(writer: &mut W, body: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = format!("{}: {}\r\n\r\n", CONTENT_LENGTH, body.len()).into_bytes();
    frame.extend_from_slice(body.as_bytes());

    writer
        .write_all(&frame)
        .await
        .context("Failed to write message")?;
    writer.flush().await.context("Failed to flush message")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::io::{duplex, BufReader, DuplexStream};
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    async fn read_raw(raw: &[u8]) -> Result<Option<String>> {
        let (mut client, server) = duplex(1024);
        client.write_all(raw).await.unwrap();
        drop(client);
        read_from(server).await
    }

    async fn read_from(stream: DuplexStream) -> Result<Option<String>> {
        let mut reader = BufReader::new(stream);
        timeout(TEST_TIMEOUT, read_message(&mut reader))
            .await
            .expect("Test timed out")
    }

    #[tokio::test]
    async fn test_written_frames_are_read_back_in_order() {
        let (mut client, server) = duplex(4096);
        let live = r#"{"id":"a1","method":"live","params":["article",false]}"#;
        let push = r#"{"result":{"id":"tok-1","action":"CREATE"}}"#;
        write_message(&mut client, live).await.unwrap();
        write_message(&mut client, push).await.unwrap();
        drop(client);

        let mut reader = BufReader::new(server);
        assert_eq!(read_message(&mut reader).await.unwrap().as_deref(), Some(live));
        assert_eq!(read_message(&mut reader).await.unwrap().as_deref(), Some(push));
        assert_eq!(read_message(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_multibyte_body_length_is_in_bytes() {
        let (mut client, server) = duplex(1024);
        let body = r#"{"id":"b2","result":"ünïcødé"}"#;
        write_message(&mut client, body).await.unwrap();

        assert_eq!(read_from(server).await.unwrap().as_deref(), Some(body));
    }

    #[tokio::test]
    async fn test_lowercase_header_lf_endings_and_extra_headers() {
        let raw = b"content-type: application/json\ncontent-length: 9\n\n{\"id\":1}X";
        // Only the declared 9 bytes form the body.
        assert_eq!(read_raw(raw).await.unwrap().as_deref(), Some("{\"id\":1}X"));
    }

    #[tokio::test]
    async fn test_missing_content_length() {
        let err = read_raw(b"Content-Type: json\r\n\r\n").await.unwrap_err();
        assert!(err.to_string().contains("Missing Content-Length"), "{}", err);
    }

    #[tokio::test]
    async fn test_invalid_content_length() {
        let err = read_raw(b"Content-Length: lots\r\n\r\n").await.unwrap_err();
        assert!(err.to_string().contains("Invalid Content-Length"), "{}", err);
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let raw = format!("Content-Length: {}\r\n\r\n", MAX_MESSAGE_SIZE + 1);
        let err = read_raw(raw.as_bytes()).await.unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"), "{}", err);
    }

    #[tokio::test]
    async fn test_eof_between_frames_is_clean() {
        assert_eq!(read_raw(b"").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_an_error() {
        assert!(read_raw(b"Content-Length: 10\r\n").await.is_err());
        assert!(read_raw(b"Content-Length: 10\r\n\r\n{\"id\"").await.is_err());
    }

    #[tokio::test]
    async fn test_non_utf8_body_is_rejected() {
        let err = read_raw(b"Content-Length: 2\r\n\r\n\xff\xfe").await.unwrap_err();
        assert!(err.to_string().contains("UTF-8"), "{}", err);
    }
}
