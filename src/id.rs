//! Per-connection session identifiers
//!
//! 9 random bytes, base64-encoded, per `spec.md` §3. Short enough to
//! log comfortably, long enough that two concurrent connections never
//! collide in practice.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

/// A random, connection-scoped identifier used for logging, echo
/// suppression (`UpdateRecord::ignore`), and the weak back-reference
/// keying in the notification multiplexer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random session id.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 9];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_nonempty_distinct_ids() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }

    #[test]
    fn encodes_without_padding_or_slashes() {
        let id = SessionId::generate();
        assert!(!id.as_str().contains('='));
        assert!(!id.as_str().contains('/'));
    }
}
