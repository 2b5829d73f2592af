//! Line/literal framer
//!
//! Splits the inbound byte stream into logical frames, honoring
//! `{n}`/`{n+}` literal introducers per `spec.md` §4.1. Built over
//! `AsyncBufRead` with buffered line scanning (in the style of the
//! teacher's `BufReader`-based connection I/O) rather than
//! byte-at-a-time polling.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::{Error, Result};

/// One logical frame handed to the command assembler.
#[derive(Debug, Clone)]
pub struct Frame {
    pub bytes: Vec<u8>,
    /// False when the frame ends in a literal introducer and the
    /// literal payload itself is yet to be read.
    pub r#final: bool,
    /// Set when the trailing literal introducer used `{n+}`
    /// (non-synchronizing): the assembler must not request `+
    /// Ready for literal data`.
    pub non_synchronizing: bool,
    /// True when `bytes` is a literal's raw payload rather than a
    /// line: the header that introduced it was already handed to the
    /// assembler as its own frame, with the payload read only after
    /// the controller had a chance to send `+ Ready for literal data`
    /// for a synchronizing literal.
    pub is_literal_payload: bool,
}

/// Parsed literal header: `{<digits>}` or `{<digits>+}`.
#[derive(Debug, Clone, Copy)]
struct LiteralHeader {
    len: u64,
    non_synchronizing: bool,
}

fn parse_literal_header(line: &[u8]) -> Option<LiteralHeader> {
    let line = line.strip_suffix(b"\r\n").unwrap_or(line);
    let line = line.strip_suffix(b"}")?;
    let open = line.iter().rposition(|&b| b == b'{')?;
    let mut digits = &line[open + 1..];
    let non_synchronizing = digits.last() == Some(&b'+');
    if non_synchronizing {
        digits = &digits[..digits.len() - 1];
    }
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let len = std::str::from_utf8(digits).ok()?.parse().ok()?;
    Some(LiteralHeader {
        len,
        non_synchronizing,
    })
}

/// Reads frames out of a buffered transport, honoring literal
/// framing and the server's configured size limits.
///
/// Stateful across calls: a line ending in a `{n}`/`{n+}` introducer
/// is returned to the caller *before* the literal's payload is read,
/// so the controller gets a chance to send `+ Ready for literal data`
/// for a synchronizing literal. The next call to `next_frame` then
/// reads exactly that many payload bytes and returns them as their
/// own frame. This is the only way to avoid deadlocking against a
/// compliant client: a synchronizing literal's bytes are not sent
/// until the client sees the continuation reply.
pub struct Framer {
    max_line_size: usize,
    max_literal_size: usize,
    pending: Option<LiteralHeader>,
}

impl Framer {
    #[must_use]
    pub const fn new(max_line_size: usize, max_literal_size: usize) -> Self {
        Self {
            max_line_size,
            max_literal_size,
            pending: None,
        }
    }

    /// Read the next frame: either a complete line (no trailing
    /// literal introducer), a line ending in a literal introducer
    /// (with the payload still unread), or a pending literal's
    /// payload bytes.
    pub async fn next_frame<R: AsyncBufRead + Unpin>(&mut self, reader: &mut R) -> Result<Option<Frame>> {
        if let Some(header) = self.pending.take() {
            let mut payload = vec![0u8; header.len as usize];
            tokio::io::AsyncReadExt::read_exact(reader, &mut payload)
                .await
                .map_err(Error::from_io)?;
            return Ok(Some(Frame {
                bytes: payload,
                r#final: false,
                non_synchronizing: header.non_synchronizing,
                is_literal_payload: true,
            }));
        }

        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).await.map_err(Error::from_io)?;
        if n == 0 {
            return Ok(None); // clean EOF
        }
        if line.len() > self.max_line_size {
            return Err(Error::Protocol(format!(
                "line exceeds maximum of {} bytes",
                self.max_line_size
            )));
        }
        if !line.ends_with(b"\n") {
            return Err(Error::Protocol("line not terminated by CRLF".into()));
        }

        match parse_literal_header(&line) {
            Some(header) => {
                if header.len as usize > self.max_literal_size {
                    return Err(Error::Protocol(format!(
                        "literal of {} bytes exceeds maximum of {} bytes",
                        header.len, self.max_literal_size
                    )));
                }
                let non_synchronizing = header.non_synchronizing;
                self.pending = Some(header);
                Ok(Some(Frame {
                    bytes: line,
                    r#final: false,
                    non_synchronizing,
                    is_literal_payload: false,
                }))
            }
            None => Ok(Some(Frame {
                bytes: line,
                r#final: true,
                non_synchronizing: false,
                is_literal_payload: false,
            })),
        }
    }
}
