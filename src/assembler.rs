//! Command assembler
//!
//! Accumulates the frames emitted by the [`crate::framer::Framer`]
//! into a single [`CommandRecord`]. The synchronizing-literal hook is
//! the assembler's only egress-shaped dependency, and it is passed in
//! by the controller rather than owned, so the assembler stays
//! unit-testable against plain byte slices.

use crate::error::{Error, Result};
use crate::framer::Frame;

/// `{tag, verb, arguments[], literals[]}` per `spec.md` §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub tag: String,
    pub verb: String,
    pub arguments: Vec<String>,
    pub literals: Vec<Vec<u8>>,
}

/// Accumulates frames belonging to one in-flight command.
#[derive(Debug, Default)]
pub struct CommandAssembler {
    tag: Option<String>,
    verb: Option<String>,
    arguments: Vec<String>,
    literals: Vec<Vec<u8>>,
}

/// What the caller should do after feeding a frame to the assembler.
pub enum Progress {
    /// More frames are needed; if `sync` is true the caller must
    /// write `+ Ready for literal data` before the client will send
    /// the literal bytes.
    NeedMore { sync: bool },
    /// The command is complete.
    Done(CommandRecord),
}

impl CommandAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn is_fresh(&self) -> bool {
        self.tag.is_none()
    }

    /// The tag recovered so far, if any. Used by the controller to
    /// decide between an untagged `* BAD` (no tag parsed yet) and a
    /// tagged `<tag> BAD` when a frame fails to parse.
    #[must_use]
    pub fn current_tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Discard whatever partial command state has accumulated. Called
    /// after a parse error, per `spec.md` §4.2: "Parse errors ...
    /// discard the command."
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Feed the next frame from the framer. The first frame of a
    /// command creates a fresh context; a parse failure on the first
    /// line surfaces `Error::Protocol` with no tag recovered.
    pub fn feed(&mut self, frame: Frame) -> Result<Progress> {
        if frame.is_literal_payload {
            // The framer already withheld this until the controller
            // had a chance to send `+ Ready for literal data`, so
            // there is nothing left to do but collect it and wait for
            // the rest of the line that follows it.
            self.literals.push(frame.bytes);
            return Ok(Progress::NeedMore { sync: false });
        }

        if self.is_fresh() {
            self.begin(&frame.bytes)?;
        } else {
            // A continuation frame: the previous frame ended in a
            // literal introducer, so the text up to this frame's own
            // CRLF/literal-marker is whatever plain-text content the
            // client typed right after the previous literal's bytes
            // -- e.g. the ` password` in `{5}\r\nalice password\r\n`.
            // That text is as much a command argument as anything
            // `begin()` parses off the first line, so it must be
            // split into `arguments` here too, not dropped.
            self.continue_line(&frame.bytes)?;
        }

        if frame.r#final {
            let tag = self
                .tag
                .take()
                .ok_or_else(|| Error::Protocol("no command tag".into()))?;
            let verb = self
                .verb
                .take()
                .ok_or_else(|| Error::Protocol("no command verb".into()))?;
            Ok(Progress::Done(CommandRecord {
                tag,
                verb,
                arguments: std::mem::take(&mut self.arguments),
                literals: std::mem::take(&mut self.literals),
            }))
        } else {
            Ok(Progress::NeedMore {
                sync: !frame.non_synchronizing,
            })
        }
    }

    fn begin(&mut self, first_line: &[u8]) -> Result<()> {
        let line = strip_literal_header(first_line);
        let text = std::str::from_utf8(line)
            .map_err(|_| Error::Protocol("command line is not valid UTF-8".into()))?
            .trim_end_matches(['\r', '\n']);
        let text = strip_trailing_literal_marker(text);
        let mut parts = text.splitn(3, ' ');
        let tag = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Protocol("empty command line".into()))?;
        let verb = parts
            .next()
            .ok_or_else(|| Error::Protocol("missing command verb".into()))?;
        self.tag = Some(tag.to_string());
        self.verb = Some(verb.to_uppercase());
        if let Some(rest) = parts.next() {
            self.arguments
                .extend(rest.split_whitespace().map(ToString::to_string));
        }
        Ok(())
    }

    /// Parse the plain-text content a continuation frame carries
    /// ahead of its own CRLF/literal-marker (there is no tag/verb left
    /// to recover at this point, only further arguments) and append it
    /// to `self.arguments`.
    fn continue_line(&mut self, bytes: &[u8]) -> Result<()> {
        let header = strip_literal_header(bytes);
        let text = std::str::from_utf8(header)
            .map_err(|_| Error::Protocol("command continuation is not valid UTF-8".into()))?
            .trim_end_matches(['\r', '\n']);
        let text = strip_trailing_literal_marker(text);
        if !text.trim().is_empty() {
            self.arguments
                .extend(text.split_whitespace().map(ToString::to_string));
        }
        Ok(())
    }
}

/// Strip a trailing `{n}`/`{n+}` literal marker (and the whitespace
/// before it) from a command line: it introduces the next literal,
/// it is not itself a textual argument.
fn strip_trailing_literal_marker(text: &str) -> &str {
    let Some(rest) = text.strip_suffix('}') else {
        return text;
    };
    let Some(open) = rest.rfind('{') else {
        return text;
    };
    let digits = rest[open + 1..].strip_suffix('+').unwrap_or(&rest[open + 1..]);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return text;
    }
    text[..open].trim_end()
}

fn find_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|w| w == b"\r\n")
}

fn strip_literal_header(line: &[u8]) -> &[u8] {
    find_crlf(line).map_or(line, |pos| &line[..pos])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::Frame;

    fn final_frame(line: &str) -> Frame {
        Frame {
            bytes: line.as_bytes().to_vec(),
            r#final: true,
            non_synchronizing: false,
            is_literal_payload: false,
        }
    }

    fn header_frame(line: &str, non_synchronizing: bool) -> Frame {
        Frame {
            bytes: line.as_bytes().to_vec(),
            r#final: false,
            non_synchronizing,
            is_literal_payload: false,
        }
    }

    fn payload_frame(bytes: &[u8], non_synchronizing: bool) -> Frame {
        Frame {
            bytes: bytes.to_vec(),
            r#final: false,
            non_synchronizing,
            is_literal_payload: true,
        }
    }

    #[test]
    fn simple_command_assembles_in_one_frame() {
        let mut assembler = CommandAssembler::new();
        let progress = assembler.feed(final_frame("a1 NOOP\r\n")).unwrap();
        let Progress::Done(cmd) = progress else {
            panic!("expected Done")
        };
        assert_eq!(cmd.tag, "a1");
        assert_eq!(cmd.verb, "NOOP");
        assert!(cmd.arguments.is_empty());
    }

    #[test]
    fn arguments_are_split_on_whitespace() {
        let mut assembler = CommandAssembler::new();
        let progress = assembler.feed(final_frame("a1 SELECT INBOX\r\n")).unwrap();
        let Progress::Done(cmd) = progress else {
            panic!("expected Done")
        };
        assert_eq!(cmd.verb, "SELECT");
        assert_eq!(cmd.arguments, vec!["INBOX".to_string()]);
    }

    #[test]
    fn literal_header_requests_continuation_and_payload_is_collected() {
        let mut assembler = CommandAssembler::new();

        match assembler.feed(header_frame("a1 LOGIN {5}\r\n", false)).unwrap() {
            Progress::NeedMore { sync } => assert!(sync),
            Progress::Done(_) => panic!("expected NeedMore"),
        }

        // The payload itself never needs another `+ Ready`.
        match assembler.feed(payload_frame(b"alice", false)).unwrap() {
            Progress::NeedMore { sync } => assert!(!sync),
            Progress::Done(_) => panic!("expected NeedMore"),
        }

        let progress = assembler.feed(header_frame(" {6}\r\n", false)).unwrap();
        assert!(matches!(progress, Progress::NeedMore { sync: true }));

        let progress = assembler.feed(payload_frame(b"secret", false)).unwrap();
        assert!(matches!(progress, Progress::NeedMore { sync: false }));

        let progress = assembler.feed(final_frame("\r\n")).unwrap();
        let Progress::Done(cmd) = progress else {
            panic!("expected Done")
        };
        assert_eq!(cmd.tag, "a1");
        assert_eq!(cmd.verb, "LOGIN");
        assert_eq!(cmd.literals, vec![b"alice".to_vec(), b"secret".to_vec()]);
    }

    #[test]
    fn non_synchronizing_literal_does_not_require_continuation_reply() {
        let mut assembler = CommandAssembler::new();
        match assembler.feed(header_frame("a1 LOGIN {5+}\r\n", true)).unwrap() {
            Progress::NeedMore { sync } => assert!(!sync),
            Progress::Done(_) => panic!("expected NeedMore"),
        }
    }

    #[test]
    fn plain_text_after_a_literal_is_kept_as_an_argument() {
        let mut assembler = CommandAssembler::new();

        match assembler.feed(header_frame("a1 LOGIN {5}\r\n", false)).unwrap() {
            Progress::NeedMore { sync } => assert!(sync),
            Progress::Done(_) => panic!("expected NeedMore"),
        }
        match assembler.feed(payload_frame(b"alice", false)).unwrap() {
            Progress::NeedMore { sync } => assert!(!sync),
            Progress::Done(_) => panic!("expected NeedMore"),
        }

        let progress = assembler.feed(final_frame(" password\r\n")).unwrap();
        let Progress::Done(cmd) = progress else {
            panic!("expected Done")
        };
        assert_eq!(cmd.tag, "a1");
        assert_eq!(cmd.verb, "LOGIN");
        assert_eq!(cmd.literals, vec![b"alice".to_vec()]);
        assert_eq!(cmd.arguments, vec!["password".to_string()]);
    }

    #[test]
    fn empty_line_is_protocol_error() {
        let mut assembler = CommandAssembler::new();
        let err = assembler.feed(final_frame("\r\n")).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
