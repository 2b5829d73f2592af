//! The notifier interface
//!
//! Mailbox mutations arrive from outside the connection's own command
//! stream. The source mixes callbacks and event emitters for this; here
//! the explicit-task-and-channel design from the Design Notes replaces
//! the callback with an `mpsc` sender handed to the notifier at
//! subscribe time, so the multiplexer simply awaits a channel alongside
//! the framer in the controller's `tokio::select!`.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::id::SessionId;

/// One mailbox mutation, as delivered by the notifier.
///
/// `ignore` names the session whose own write produced the event; that
/// session suppresses the echo when it drains its own notification
/// queue.
#[derive(Debug, Clone)]
pub struct UpdateRecord<M> {
    pub mailbox_id: M,
    pub kind: UpdateKind,
    pub uid: u32,
    pub modseq: u64,
    pub flags: Option<Vec<String>>,
    pub ignore: Option<SessionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Exists,
    Expunge,
    Fetch,
    /// The selected mailbox itself was deleted; the session must BYE
    /// and close rather than process this as a sequence-space update.
    Delete,
}

/// External broadcast bus announcing mailbox mutations, consumed by
/// the notification multiplexer.
#[async_trait]
pub trait Notifier<M>: Send + Sync
where
    M: Send + Sync + 'static,
{
    /// Register `sender` to receive updates for `mailbox_id` on behalf
    /// of `session`. Idempotent: registering twice for the same
    /// `(session, mailbox_id)` replaces the previous sender.
    async fn add_listener(
        &self,
        session: SessionId,
        mailbox_id: M,
        sender: mpsc::UnboundedSender<UpdateRecord<M>>,
    ) -> Result<()>;

    /// Deregister `session`'s subscription to `mailbox_id`. A no-op if
    /// no such subscription exists.
    async fn remove_listener(&self, session: &SessionId, mailbox_id: &M) -> Result<()>;

    /// Fetch updates to `mailbox_id` with `modseq` strictly greater
    /// than `since_modseq`, in arrival order.
    async fn get_updates(&self, mailbox_id: &M, since_modseq: u64) -> Result<Vec<UpdateRecord<M>>>;
}
