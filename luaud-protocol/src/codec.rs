//! `Content-Length` framing over blocking I/O.
//!
//! DAP frames are a MIME-style header block followed by a JSON payload:
//!
//! ```text
//! Content-Length: 119\r\n
//! \r\n
//! {"seq":1,"type":"request",...}
//! ```
//!
//! Unknown header fields are skipped; a frame without `Content-Length`
//! is a protocol error and closes the session.

use std::io::{BufRead, Write};

use crate::error::ProtocolError;
use crate::message::Message;

/// Upper bound on a single frame payload.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

const CONTENT_LENGTH: &str = "Content-Length:";

/// Read one message. `Ok(None)` means the peer closed the connection
/// cleanly at a frame boundary.
pub fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<Message>, ProtocolError> {
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return if saw_header {
                Err(ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed inside a frame header",
                )))
            } else {
                Ok(None)
            };
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if saw_header {
                break;
            }
            // Stray blank line between frames; keep scanning.
            continue;
        }
        saw_header = true;
        if let Some(value) = trimmed.strip_prefix(CONTENT_LENGTH) {
            let length: usize = value
                .trim()
                .parse()
                .map_err(|_| ProtocolError::InvalidContentLength(value.trim().to_string()))?;
            content_length = Some(length);
        }
    }

    let length = content_length.ok_or(ProtocolError::MissingContentLength)?;
    if length > MAX_FRAME_LENGTH {
        return Err(ProtocolError::FrameTooLarge {
            length,
            limit: MAX_FRAME_LENGTH,
        });
    }

    let mut payload = vec![0_u8; length];
    reader.read_exact(&mut payload)?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

/// Frame and flush one message.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), ProtocolError> {
    let payload = serde_json::to_vec(message)?;
    write!(writer, "{CONTENT_LENGTH} {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}
