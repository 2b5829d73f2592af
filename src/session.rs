//! Per-connection session state
//!
//! `SessionState`/`SelectedMailbox` are plain data, owned exclusively
//! by the `Connection` that holds them (the mailbox *store* owns the
//! authoritative mailbox; this is only the client-visible snapshot).

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;

use crate::id::SessionId;
use crate::notifier::UpdateRecord;

/// IMAP's canonical connection states plus the two terminal ones the
/// engine itself needs to track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    NotAuthenticated,
    Authenticated,
    Selected,
    Logout,
    Closed,
}

/// The set of extensions this connection has enabled. At minimum the
/// engine always advertises `CONDSTORE`, `UTF8=ACCEPT`, and
/// `COMPRESS=DEFLATE` per `spec.md` §3.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet(HashSet<String>);

impl CapabilitySet {
    #[must_use]
    pub fn baseline() -> Self {
        let mut set = HashSet::new();
        set.insert("CONDSTORE".to_string());
        set.insert("UTF8=ACCEPT".to_string());
        set.insert("COMPRESS=DEFLATE".to_string());
        Self(set)
    }

    pub fn enable(&mut self, capability: impl Into<String>) {
        self.0.insert(capability.into());
    }

    #[must_use]
    pub fn is_enabled(&self, capability: &str) -> bool {
        self.0.contains(capability)
    }

    #[must_use]
    pub fn is_utf8_enabled(&self) -> bool {
        self.is_enabled("UTF8=ACCEPT")
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Snapshot of the mailbox the client has SELECTed.
#[derive(Debug, Clone)]
pub struct SelectedMailbox<M = ()> {
    pub mailbox_id: M,
    /// `uid_list[i]` is the UID at IMAP sequence `i + 1`.
    pub uid_list: Vec<u32>,
    /// HIGHESTMODSEQ cursor; monotonically non-decreasing.
    pub modify_index: u64,
    pub condstore_enabled: bool,
    pub notifications: VecDeque<UpdateRecord<M>>,
}

impl<M> SelectedMailbox<M> {
    #[must_use]
    pub fn new(mailbox_id: M) -> Self {
        Self {
            mailbox_id,
            uid_list: Vec::new(),
            modify_index: 0,
            condstore_enabled: false,
            notifications: VecDeque::new(),
        }
    }

    /// Advance `modify_index` if `candidate` is newer, preserving the
    /// monotonic-non-decreasing invariant from `spec.md` §3.
    pub fn advance_modseq(&mut self, candidate: u64) {
        if candidate > self.modify_index {
            self.modify_index = candidate;
        }
    }
}

/// The per-connection state machine record from `spec.md` §3.
#[derive(Debug, Clone)]
pub struct SessionState<M = ()> {
    pub id: SessionId,
    pub state: ConnectionState,
    pub remote_address: SocketAddr,
    pub client_hostname: String,
    pub selected: Option<SelectedMailbox<M>>,
    pub capabilities: CapabilitySet,
    /// Suspends idle-timeout enforcement while the client is in IDLE.
    pub idling: bool,
    /// While true, no inbound command beyond the upgrade command
    /// itself is dispatched (STARTTLS/COMPRESS in progress).
    pub upgrading: bool,
}

impl<M> SessionState<M> {
    #[must_use]
    pub fn new(remote_address: SocketAddr, client_hostname: String) -> Self {
        Self {
            id: SessionId::generate(),
            state: ConnectionState::NotAuthenticated,
            remote_address,
            client_hostname,
            selected: None,
            capabilities: CapabilitySet::baseline(),
            idling: false,
            upgrading: false,
        }
    }

    #[must_use]
    pub fn is_utf8_enabled(&self) -> bool {
        self.capabilities.is_utf8_enabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:1234".parse().unwrap()
    }

    #[test]
    fn baseline_capabilities_include_condstore_and_compress() {
        let caps = CapabilitySet::baseline();
        assert!(caps.is_enabled("CONDSTORE"));
        assert!(caps.is_enabled("COMPRESS=DEFLATE"));
        assert!(caps.is_enabled("UTF8=ACCEPT"));
    }

    #[test]
    fn modseq_only_advances_forward() {
        let mut mailbox = SelectedMailbox::new(());
        mailbox.advance_modseq(5);
        mailbox.advance_modseq(3);
        assert_eq!(mailbox.modify_index, 5);
        mailbox.advance_modseq(9);
        assert_eq!(mailbox.modify_index, 9);
    }

    #[test]
    fn new_session_starts_not_authenticated() {
        let session: SessionState = SessionState::new(addr(), "[127.0.0.1]".to_string());
        assert_eq!(session.state, ConnectionState::NotAuthenticated);
        assert!(!session.idling);
        assert!(!session.upgrading);
        assert!(session.selected.is_none());
    }
}
