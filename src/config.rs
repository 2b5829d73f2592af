//! Per-server options the connection engine is configured with
//!
//! Plain data handed in by the embedder at construction time. The
//! core never loads this from the environment or a file itself --
//! `spec.md` §6 is explicit that env vars and files are not part of
//! the core contract. The optional `cli` demo binary is the thing
//! that reads `.env`/argv and builds one of these.

/// Server-wide options shared by every connection the engine drives.
///
/// Mirrors `server.options.{secure, name, id, socketTimeout}` from the
/// core's external interface, plus the framing/timeout limits
/// `spec.md` calls out with defaults.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Advertised server name, used in the greeting and `BYE` lines.
    pub name: String,
    /// Opaque server identifier (e.g. for `ID` extension replies).
    pub id: String,
    /// Whether the listener terminates TLS itself (vs. relying on
    /// STARTTLS upgrade inside the core).
    pub secure: bool,
    /// Socket idle timeout before `* BYE Idle timeout, closing connection`.
    pub socket_timeout: std::time::Duration,
    /// Maximum accepted line length before a frame is rejected.
    pub max_line_size: usize,
    /// Maximum accepted literal payload size.
    pub max_literal_size: usize,
    /// Timeout for the best-effort reverse DNS lookup on accept.
    pub reverse_dns_timeout: std::time::Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            name: "imap-core".to_string(),
            id: "imap-core".to_string(),
            secure: false,
            socket_timeout: std::time::Duration::from_secs(30 * 60),
            max_line_size: 100 * 1024,
            max_literal_size: 25 * 1024 * 1024,
            reverse_dns_timeout: std::time::Duration::from_secs(2),
        }
    }
}

impl ServerOptions {
    /// Start from defaults with an explicit server name and id.
    #[must_use]
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    #[must_use]
    pub const fn with_socket_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_max_line_size(mut self, size: usize) -> Self {
        self.max_line_size = size;
        self
    }

    #[must_use]
    pub const fn with_max_literal_size(mut self, size: usize) -> Self {
        self.max_literal_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let opts = ServerOptions::default();
        assert_eq!(opts.max_line_size, 100 * 1024);
        assert_eq!(opts.socket_timeout, std::time::Duration::from_secs(1800));
    }

    #[test]
    fn builder_overrides_apply() {
        let opts = ServerOptions::new("srv", "srv-1")
            .with_secure(true)
            .with_max_line_size(4096);
        assert_eq!(opts.name, "srv");
        assert!(opts.secure);
        assert_eq!(opts.max_line_size, 4096);
    }
}
