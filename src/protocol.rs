//! Wire protocol codec.
//!
//! A NATS-style text protocol: CRLF-terminated control lines, with `PUB`
//! followed by a binary frame whose length is declared on the control line.
//!
//! ```text
//! S: INFO {"max_payload":1048576}\r\n
//! C: CONNECT {"verbose":false}\r\n
//! C: PING\r\n
//! S: PONG\r\n
//! C: PUB x.y 5\r\n
//! C: hello\r\n
//! ```
//!
//! Nothing in here knows about sockets: line and frame readers work over any
//! tokio reader so that the connection handler owns the buffering.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

/// Payload limit advertised in the greeting unless configured otherwise.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Longest control line accepted, excluding the line terminator.
pub const MAX_CONTROL_LINE: usize = 4096;

/// Upper bound on a single payload read.
const READ_CHUNK: usize = 8 * 1024;

/// Trailing bytes of every payload frame.
const FRAME_TERMINATOR: &[u8] = b"\r\n";

/// A decoded client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Connection options; accepted without a reply.
    Connect(String),
    /// Liveness probe.
    Ping,
    /// Publish. `payload` is empty until the frame has been read.
    Pub {
        subject: String,
        reply_to: Option<String>,
        size: usize,
        payload: Bytes,
    },
    /// Anything else. Ends the session.
    Unrecognized(String),
}

/// Protocol and transport errors. All of them are fatal to the session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("control line is not valid UTF-8")]
    InvalidUtf8,

    #[error("control line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("invalid payload size in {line:?}")]
    InvalidSize { line: String },

    #[error("payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("peer closed after {received} of {expected} frame bytes")]
    TruncatedPayload { expected: usize, received: usize },

    #[error("payload frame is not terminated by CRLF")]
    MissingTerminator,

    #[error("unrecognized command: {0:?}")]
    Unrecognized(String),
}

/// Decode a single control line (terminator already stripped).
pub fn decode_line(line: &str) -> Result<Command, ProtocolError> {
    if line.starts_with("PUB") {
        return decode_pub(line);
    }

    if let Some(params) = line.strip_prefix("CONNECT") {
        return Ok(Command::Connect(params.trim().to_string()));
    }

    if line.starts_with("PING") {
        return Ok(Command::Ping);
    }

    Ok(Command::Unrecognized(line.to_string()))
}

/// `PUB <subject> [reply-to] <size>`: the size is whatever follows the last space.
fn decode_pub(line: &str) -> Result<Command, ProtocolError> {
    let invalid = || ProtocolError::InvalidSize {
        line: line.to_string(),
    };

    let split = line.rfind(' ').ok_or_else(invalid)?;
    let size: usize = line[split + 1..].parse().map_err(|_| invalid())?;

    let mut fields = line[..split].split_whitespace().skip(1);
    let subject = fields.next().unwrap_or_default().to_string();
    let reply_to = fields.next().map(str::to_string);

    Ok(Command::Pub {
        subject,
        reply_to,
        size,
        payload: Bytes::new(),
    })
}

/// Reject declared sizes above the advertised limit before reading the frame.
pub fn check_payload_size(size: usize, max: usize) -> Result<(), ProtocolError> {
    if size > max {
        return Err(ProtocolError::PayloadTooLarge { size, max });
    }
    Ok(())
}

/// Read one control line into `buf`.
///
/// Accepts `\r\n` or a bare `\n`. Returns `Ok(None)` when the peer closed
/// the stream before sending anything; a final unterminated line is still
/// returned.
pub async fn read_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> Result<Option<String>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();

    let limit = MAX_CONTROL_LINE + 2;
    let mut limited = (&mut *reader).take(limit as u64);
    let n = limited.read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }

    // A bare `\n` leaves room for one byte past the limit inside `take`
    if buf.len() > MAX_CONTROL_LINE {
        return Err(ProtocolError::LineTooLong {
            limit: MAX_CONTROL_LINE,
        });
    }

    let line = std::str::from_utf8(buf).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok(Some(line.to_owned()))
}

/// Read a PUB frame: exactly `size` payload bytes plus the CRLF terminator.
///
/// The buffer grows one chunk at a time, so a frame is never read past its
/// end and a large declared size does not allocate up front.
pub async fn read_payload<R>(reader: &mut R, size: usize) -> Result<Bytes, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let expected = size
        .checked_add(FRAME_TERMINATOR.len())
        .ok_or(ProtocolError::PayloadTooLarge {
            size,
            max: usize::MAX - FRAME_TERMINATOR.len(),
        })?;

    let mut buffer = BytesMut::with_capacity(expected.min(READ_CHUNK));

    while buffer.len() < expected {
        let start = buffer.len();
        let chunk = (expected - start).min(READ_CHUNK);
        buffer.resize(start + chunk, 0);

        let n = reader.read(&mut buffer[start..]).await?;
        buffer.truncate(start + n);

        if n == 0 {
            return Err(ProtocolError::TruncatedPayload {
                expected,
                received: start,
            });
        }
    }

    if &buffer[size..] != FRAME_TERMINATOR {
        return Err(ProtocolError::MissingTerminator);
    }

    buffer.truncate(size);
    Ok(buffer.freeze())
}

/// Generate the INFO greeting
pub fn encode_info(max_payload: usize) -> Bytes {
    Bytes::from(format!("INFO {{\"max_payload\":{max_payload}}}\r\n"))
}

/// Generate PONG response
pub fn encode_pong() -> &'static [u8] {
    b"PONG\r\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_decode_connect() {
        let command = decode_line(r#"CONNECT {"verbose":false,"pedantic":false}"#).unwrap();
        assert_eq!(
            command,
            Command::Connect(r#"{"verbose":false,"pedantic":false}"#.to_string())
        );

        assert_eq!(
            decode_line("CONNECT").unwrap(),
            Command::Connect(String::new())
        );
    }

    #[test]
    fn test_decode_ping() {
        assert_eq!(decode_line("PING").unwrap(), Command::Ping);
        // prefix match
        assert_eq!(decode_line("PING extra").unwrap(), Command::Ping);
    }

    #[test]
    fn test_decode_pub() {
        match decode_line("PUB x.y 5").unwrap() {
            Command::Pub {
                subject,
                reply_to,
                size,
                payload,
            } => {
                assert_eq!(subject, "x.y");
                assert_eq!(reply_to, None);
                assert_eq!(size, 5);
                assert!(payload.is_empty());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_pub_with_reply() {
        match decode_line("PUB orders.new _INBOX.42 1024").unwrap() {
            Command::Pub {
                subject,
                reply_to,
                size,
                ..
            } => {
                assert_eq!(subject, "orders.new");
                assert_eq!(reply_to.as_deref(), Some("_INBOX.42"));
                assert_eq!(size, 1024);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_pub_invalid_size() {
        assert!(matches!(
            decode_line("PUB x.y five"),
            Err(ProtocolError::InvalidSize { .. })
        ));
        assert!(matches!(
            decode_line("PUB"),
            Err(ProtocolError::InvalidSize { .. })
        ));
        assert!(matches!(
            decode_line("PUB x.y -1"),
            Err(ProtocolError::InvalidSize { .. })
        ));
    }

    #[test]
    fn test_decode_unrecognized() {
        assert_eq!(
            decode_line("SUB x.y 1").unwrap(),
            Command::Unrecognized("SUB x.y 1".to_string())
        );
        assert_eq!(
            decode_line("").unwrap(),
            Command::Unrecognized(String::new())
        );
        // commands are case-sensitive
        assert_eq!(
            decode_line("ping").unwrap(),
            Command::Unrecognized("ping".to_string())
        );
    }

    #[test]
    fn test_check_payload_size() {
        assert!(check_payload_size(DEFAULT_MAX_PAYLOAD, DEFAULT_MAX_PAYLOAD).is_ok());
        assert!(matches!(
            check_payload_size(DEFAULT_MAX_PAYLOAD + 1, DEFAULT_MAX_PAYLOAD),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_encode_info() {
        assert_eq!(
            &encode_info(DEFAULT_MAX_PAYLOAD)[..],
            b"INFO {\"max_payload\":1048576}\r\n"
        );
    }

    #[test]
    fn test_encode_pong() {
        assert_eq!(encode_pong(), b"PONG\r\n");
    }

    #[tokio::test]
    async fn test_read_line_terminators() {
        let mut input: &[u8] = b"PING\r\nCONNECT {}\nlast";
        let mut buf = Vec::new();

        assert_eq!(
            read_line(&mut input, &mut buf).await.unwrap().as_deref(),
            Some("PING")
        );
        assert_eq!(
            read_line(&mut input, &mut buf).await.unwrap().as_deref(),
            Some("CONNECT {}")
        );
        assert_eq!(
            read_line(&mut input, &mut buf).await.unwrap().as_deref(),
            Some("last")
        );
        assert_eq!(read_line(&mut input, &mut buf).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_line_too_long() {
        let mut line = vec![b'A'; MAX_CONTROL_LINE + 10];
        line.extend_from_slice(b"\r\n");
        let mut input: &[u8] = &line;
        let mut buf = Vec::new();

        assert!(matches!(
            read_line(&mut input, &mut buf).await,
            Err(ProtocolError::LineTooLong { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_line_length_boundary() {
        let mut buf = Vec::new();

        for terminator in [&b"\r\n"[..], &b"\n"[..]] {
            let mut line = vec![b'A'; MAX_CONTROL_LINE];
            line.extend_from_slice(terminator);
            let mut input: &[u8] = &line;

            let read = read_line(&mut input, &mut buf).await.unwrap().unwrap();
            assert_eq!(read.len(), MAX_CONTROL_LINE);
        }

        let mut line = vec![b'A'; MAX_CONTROL_LINE + 1];
        line.push(b'\n');
        let mut input: &[u8] = &line;
        assert!(matches!(
            read_line(&mut input, &mut buf).await,
            Err(ProtocolError::LineTooLong { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_line_invalid_utf8() {
        let mut input: &[u8] = b"PUB \xff\xfe 1\r\n";
        let mut buf = Vec::new();

        assert!(matches!(
            read_line(&mut input, &mut buf).await,
            Err(ProtocolError::InvalidUtf8)
        ));
    }

    #[tokio::test]
    async fn test_payload_framing_is_exact() {
        let mut input: &[u8] = b"PUB x.y 5\r\nhello\r\nPING\r\n";
        let mut buf = Vec::new();

        let line = read_line(&mut input, &mut buf).await.unwrap().unwrap();
        let size = match decode_line(&line).unwrap() {
            Command::Pub { size, .. } => size,
            other => panic!("unexpected: {:?}", other),
        };

        let payload = read_payload(&mut input, size).await.unwrap();
        assert_eq!(&payload[..], b"hello");

        // nothing of the next line was consumed
        assert_eq!(input, b"PING\r\n");
    }

    #[tokio::test]
    async fn test_payload_across_partial_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(b"he")
            .read(b"l")
            .read(b"lo\r")
            .read(b"\nPING\r\n")
            .build();
        let mut reader = BufReader::new(mock);
        let mut buf = Vec::new();

        let payload = read_payload(&mut reader, 5).await.unwrap();
        assert_eq!(&payload[..], b"hello");
        assert_eq!(
            read_line(&mut reader, &mut buf).await.unwrap().as_deref(),
            Some("PING")
        );
    }

    #[tokio::test]
    async fn test_payload_larger_than_chunk() {
        let size = READ_CHUNK * 3 + 17;
        let mut frame = vec![b'z'; size];
        frame.extend_from_slice(b"\r\n");
        let mut input: &[u8] = &frame;

        let payload = read_payload(&mut input, size).await.unwrap();
        assert_eq!(payload.len(), size);
        assert!(input.is_empty());
    }

    #[tokio::test]
    async fn test_binary_payload_framed_by_length() {
        let mut input: &[u8] = b"a\r\n\xff\x00\r\nPING\r\n";
        let mut buf = Vec::new();

        let payload = read_payload(&mut input, 5).await.unwrap();
        assert_eq!(&payload[..], b"a\r\n\xff\x00");
        assert_eq!(
            read_line(&mut input, &mut buf).await.unwrap().as_deref(),
            Some("PING")
        );
    }

    #[tokio::test]
    async fn test_zero_length_payload() {
        let mut input: &[u8] = b"\r\n";
        let payload = read_payload(&mut input, 0).await.unwrap();
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let mut input: &[u8] = b"hel";
        match read_payload(&mut input, 5).await {
            Err(ProtocolError::TruncatedPayload { expected, received }) => {
                assert_eq!(expected, 7);
                assert_eq!(received, 3);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_terminator() {
        let mut input: &[u8] = b"helloXX";
        assert!(matches!(
            read_payload(&mut input, 5).await,
            Err(ProtocolError::MissingTerminator)
        ));
    }
}
