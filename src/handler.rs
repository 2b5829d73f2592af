//! The handler interface
//!
//! Command handlers (LOGIN, SELECT, FETCH, STORE, ...) are pluggable
//! procedures per `spec.md` §1/§6: the core looks one up by verb,
//! checks it against the connection's current state, and invokes it
//! with a parsed [`CommandRecord`] and a [`SessionHandle`]. Neither
//! this crate nor `spec.md` specifies a single concrete handler --
//! only the shape every handler must have.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::assembler::CommandRecord;
use crate::egress::EgressPipeline;
use crate::error::Result;
use crate::response::{Attribute, Composer, ResponseRecord};
use crate::session::{ConnectionState, SessionState};

/// Optional search-query collaborator a handler may consult through
/// the session handle. The mailbox/message store itself is never
/// named by this crate: it is an opaque pass-through the core doesn't
/// call, so each handler just closes over whatever store handle it
/// needs. `SearchSupport` is the one facet the core does construct a
/// slot for, because `get_query_response`/`match_search_query` are
/// consulted from `SessionHandle` itself while composing responses.
pub trait SearchSupport<M>: Send + Sync {
    /// The handler's currently active `SEARCH`/`FETCH` query response,
    /// if the embedder's store is tracking one for this session.
    fn get_query_response(&self, session: &SessionState<M>) -> Option<ResponseRecord>;

    /// Whether `uid` matches the session's active search query.
    fn match_search_query(&self, session: &SessionState<M>, uid: u32) -> bool;
}

/// The handle passed to a command handler: the one surface through
/// which it may observe and mutate session state, push untagged
/// responses ahead of its own tagged completion, and consult the
/// store's search support.
pub struct SessionHandle<'a, T, M> {
    pub session: &'a mut SessionState<M>,
    egress: &'a mut EgressPipeline<T>,
    search: Option<Arc<dyn SearchSupport<M>>>,
}

impl<'a, T, M> SessionHandle<'a, T, M>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        session: &'a mut SessionState<M>,
        egress: &'a mut EgressPipeline<T>,
        search: Option<Arc<dyn SearchSupport<M>>>,
    ) -> Self {
        Self {
            session,
            egress,
            search,
        }
    }

    /// Write an untagged (or tagged) response immediately, ahead of
    /// the handler's own completion.
    pub async fn send(&mut self, record: ResponseRecord) -> Result<()> {
        Composer::write(self.egress, record).await
    }

    /// Build an `EXISTS`/`EXPUNGE`/`FETCH` response for `uid`,
    /// performing the same sequence-number bookkeeping the
    /// notification multiplexer relies on (`spec.md` §4.3), so a
    /// handler-driven push (e.g. an immediate `FETCH` echo after
    /// `STORE`) stays consistent with `uid_list`.
    pub fn format_response(&mut self, kind: ResponseKind, uid: u32, data: Vec<Attribute>) -> Option<ResponseRecord> {
        let selected = self.session.selected.as_mut()?;
        match kind {
            ResponseKind::Exists => {
                let seq = Composer::record_exists(selected, uid);
                Some(ResponseRecord::untagged(
                    seq.to_string(),
                    vec![Attribute::Atom("EXISTS".into())],
                ))
            }
            ResponseKind::Expunge => {
                let seq = Composer::record_expunge(selected, uid)?;
                Some(ResponseRecord::untagged(
                    seq.to_string(),
                    vec![Attribute::Atom("EXPUNGE".into())],
                ))
            }
            ResponseKind::Fetch => {
                let seq = Composer::record_fetch(selected, uid)?;
                let mut attrs = vec![Attribute::Atom("FETCH".into())];
                attrs.push(Attribute::List(data));
                Some(ResponseRecord::untagged(seq.to_string(), attrs))
            }
        }
    }

    #[must_use]
    pub fn get_query_response(&self) -> Option<ResponseRecord> {
        self.search.as_ref()?.get_query_response(self.session)
    }

    #[must_use]
    pub fn match_search_query(&self, uid: u32) -> bool {
        self.search
            .as_ref()
            .is_some_and(|s| s.match_search_query(self.session, uid))
    }

    #[must_use]
    pub fn is_utf8_enabled(&self) -> bool {
        self.session.is_utf8_enabled()
    }
}

/// Which sequence-bookkeeping path `format_response` should take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Exists,
    Expunge,
    Fetch,
}

/// A pluggable command handler, keyed by uppercased IMAP verb.
#[async_trait]
pub trait Handler<T, M>: Send + Sync
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
    M: Send + Sync + 'static,
{
    /// Connection states in which this verb may be invoked; the
    /// controller replies `<tag> BAD Command not allowed in this
    /// state` when the current state isn't in this set (`spec.md`
    /// §4.5 step 3).
    fn allowed_states(&self) -> &'static [ConnectionState];

    /// Execute the command, returning its tagged completion. Untagged
    /// pushes made via `session.send(..)` during the call are already
    /// on the wire by the time this returns.
    async fn call(&self, command: CommandRecord, session: &mut SessionHandle<'_, T, M>) -> Result<ResponseRecord>;
}

/// Dispatch table built once per connection controller, keyed by
/// uppercased verb (`spec.md` §4.5 step 2).
pub struct HandlerTable<T, M>(HashMap<String, Arc<dyn Handler<T, M>>>);

impl<T, M> Default for HandlerTable<T, M> {
    fn default() -> Self {
        Self(HashMap::new())
    }
}

impl<T, M> HandlerTable<T, M>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
    M: Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `verb` (normalized to uppercase).
    pub fn register(&mut self, verb: impl Into<String>, handler: Arc<dyn Handler<T, M>>) -> &mut Self {
        self.0.insert(verb.into().to_uppercase(), handler);
        self
    }

    #[must_use]
    pub fn get(&self, verb: &str) -> Option<&Arc<dyn Handler<T, M>>> {
        self.0.get(verb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectionState;

    struct Noop;

    #[async_trait]
    impl<T, M> Handler<T, M> for Noop
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
        M: Send + Sync + 'static,
    {
        fn allowed_states(&self) -> &'static [ConnectionState] {
            &[
                ConnectionState::NotAuthenticated,
                ConnectionState::Authenticated,
                ConnectionState::Selected,
            ]
        }

        async fn call(&self, command: CommandRecord, _session: &mut SessionHandle<'_, T, M>) -> Result<ResponseRecord> {
            Ok(ResponseRecord::tagged(command.tag, "OK", vec![Attribute::Atom("NOOP completed".into())]))
        }
    }

    #[test]
    fn lookup_is_case_insensitive_at_registration() {
        let mut table: HandlerTable<tokio::io::DuplexStream, ()> = HandlerTable::new();
        table.register("noop", Arc::new(Noop));
        assert!(table.get("NOOP").is_some());
    }

    #[test]
    fn unknown_verb_is_absent() {
        let table: HandlerTable<tokio::io::DuplexStream, ()> = HandlerTable::new();
        assert!(table.get("BOGUS").is_none());
    }
}
