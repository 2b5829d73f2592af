//! Error types for the connection engine
//!
//! One variant per error kind named in the core's error handling
//! design: framing/parse failures reply `BAD`, state violations reply
//! `BAD`, handler-originated auth failures reply `NO`, transient store
//! failures reply `NO [SERVERBUG]`, transport loss closes silently or
//! loudly depending on cause, and a small set of internal
//! inconsistencies are logged and dropped rather than ever panicking
//! the connection.

use thiserror::Error;

use crate::response::{Attribute, ResponseRecord};

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed frame or literal header/size violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Command not allowed in the connection's current state.
    #[error("state error: {0}")]
    State(String),

    /// Handler-originated authentication failure.
    #[error("auth error: {0}")]
    Auth(String),

    /// Transient failure reported by the mailbox store.
    #[error("storage error: {0}")]
    Storage(String),

    /// Transport-level failure. `reset` marks the reset/broken-pipe
    /// class that closes silently per `spec.md` §7.
    #[error("transport error: {0}")]
    Transport {
        #[source]
        source: std::io::Error,
        reset: bool,
    },

    /// An internal inconsistency (e.g. EXPUNGE for an unknown
    /// sequence during a flush) that must never crash the
    /// connection; logged and the offending update dropped.
    #[error("fatal (contained) error: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap an I/O error, classifying CONNRESET/EPIPE as a silent
    /// transport close.
    #[must_use]
    pub fn from_io(source: std::io::Error) -> Self {
        let reset = matches!(
            source.kind(),
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
        );
        Self::Transport { source, reset }
    }

    /// Whether this error class warrants a tagged reply to the
    /// client at all (`Transport`/`Fatal` never do: the former
    /// because the transport may already be gone, the latter because
    /// it belongs to out-of-band notification processing, not to a
    /// client-issued command).
    #[must_use]
    pub fn as_tagged_reply(&self, tag: &str) -> Option<ResponseRecord> {
        let (status, text) = match self {
            Self::Protocol(msg) => ("BAD", msg.clone()),
            Self::State(msg) => ("BAD", msg.clone()),
            Self::Auth(msg) => ("NO", msg.clone()),
            Self::Storage(msg) => ("NO", format!("[SERVERBUG] {msg}")),
            Self::Transport { .. } | Self::Fatal(_) => return None,
        };
        Some(ResponseRecord::tagged(
            tag,
            status,
            vec![Attribute::Atom(text)],
        ))
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::from_io(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connreset_is_silent() {
        let err = Error::from_io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(matches!(err, Error::Transport { reset: true, .. }));
    }

    #[test]
    fn other_io_is_not_silent() {
        let err = Error::from_io(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert!(matches!(err, Error::Transport { reset: false, .. }));
    }

    #[test]
    fn transport_and_fatal_never_reply() {
        let reset = Error::from_io(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(reset.as_tagged_reply("a1").is_none());
        assert!(
            Error::Fatal("bad state".into())
                .as_tagged_reply("a1")
                .is_none()
        );
    }

    #[test]
    fn storage_error_carries_serverbug_code() {
        let err = Error::Storage("timeout".into());
        let reply = err.as_tagged_reply("a1").unwrap();
        assert_eq!(reply.status.as_deref(), Some("NO"));
    }
}
