//! Notification multiplexer
//!
//! Reconciles the client's command stream with the notifier's
//! out-of-band mailbox updates. Subscription lifecycle, the per-update
//! callback reaction, and the flush algorithm (`emit_notifications`)
//! are split into distinct methods so each can be unit-tested against
//! a plain `SelectedMailbox` without a live transport, in the style of
//! the teacher's small, independently testable `Folder`/`Flag` types.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::egress::EgressPipeline;
use crate::error::Result;
use crate::id::SessionId;
use crate::notifier::{Notifier, UpdateKind, UpdateRecord};
use crate::response::{Attribute, Composer, ResponseRecord};
use crate::session::SelectedMailbox;

/// Per-connection subscription record. The reentry guard is a plain
/// atomic rather than an async mutex: the connection task is
/// single-threaded, so only the notifier callback's own reentry (it
/// may run concurrently with command processing) needs inhibiting.
pub struct Subscription<M> {
    pub mailbox_id: M,
    lock: AtomicBool,
}

impl<M: Clone> Subscription<M> {
    #[must_use]
    pub fn new(mailbox_id: M) -> Self {
        Self {
            mailbox_id,
            lock: AtomicBool::new(false),
        }
    }

    /// Try to acquire the reentry guard; `false` if already held.
    fn try_acquire(&self) -> bool {
        self.lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.lock.store(false, Ordering::Release);
    }
}

/// What the controller should do after the multiplexer processes a
/// notifier callback or a flush.
#[derive(Debug, PartialEq, Eq)]
pub enum MultiplexerAction {
    /// Nothing to do.
    None,
    /// Selected mailbox deleted underneath the client: send
    /// `* BYE ...` and close.
    MailboxDeleted,
    /// Updates were accepted while `idling`; the controller must run
    /// `emit_notifications` before awaiting the next event.
    FlushNow,
}

/// Outcome of an `update_notification_listener` call.
#[derive(Debug, PartialEq, Eq)]
pub enum SubscriptionChange {
    Unchanged,
    Subscribed,
    Resubscribed,
    Unsubscribed,
}

pub struct NotificationMultiplexer<M> {
    session: SessionId,
    subscription: Option<Arc<Subscription<M>>>,
}

impl<M> NotificationMultiplexer<M>
where
    M: Clone + Eq + Send + Sync + 'static,
{
    #[must_use]
    pub const fn new(session: SessionId) -> Self {
        Self {
            session,
            subscription: None,
        }
    }

    /// Reconcile the subscription with the currently selected mailbox,
    /// per `spec.md` §4.6's Subscription lifecycle. `sender` is the
    /// channel end the notifier will push updates through; only used
    /// when a new subscription is actually created.
    pub async fn update_notification_listener(
        &mut self,
        notifier: &dyn Notifier<M>,
        selected: Option<&M>,
        sender: mpsc::UnboundedSender<UpdateRecord<M>>,
    ) -> Result<SubscriptionChange> {
        match (&self.subscription, selected) {
            (Some(sub), Some(mailbox_id)) if sub.mailbox_id == *mailbox_id => {
                Ok(SubscriptionChange::Unchanged)
            }
            (Some(sub), Some(mailbox_id)) => {
                notifier.remove_listener(&self.session, &sub.mailbox_id).await?;
                notifier
                    .add_listener(self.session.clone(), mailbox_id.clone(), sender)
                    .await?;
                self.subscription = Some(Arc::new(Subscription::new(mailbox_id.clone())));
                Ok(SubscriptionChange::Resubscribed)
            }
            (None, Some(mailbox_id)) => {
                notifier
                    .add_listener(self.session.clone(), mailbox_id.clone(), sender)
                    .await?;
                self.subscription = Some(Arc::new(Subscription::new(mailbox_id.clone())));
                Ok(SubscriptionChange::Subscribed)
            }
            (Some(sub), None) => {
                notifier.remove_listener(&self.session, &sub.mailbox_id).await?;
                self.subscription = None;
                Ok(SubscriptionChange::Unsubscribed)
            }
            (None, None) => Ok(SubscriptionChange::Unchanged),
        }
    }

    /// React to one notifier callback invocation, per `spec.md` §4.6's
    /// Callback behavior. Returns `MailboxDeleted` if the connection
    /// must BYE and close; otherwise the update (if accepted) is
    /// appended to `selected.notifications` and `Ok(None)` is
    /// returned, flushing immediately if `idling`.
    pub async fn on_notification(
        &self,
        update: UpdateRecord<M>,
        selected: Option<&mut SelectedMailbox<M>>,
        idling: bool,
        notifier: &dyn Notifier<M>,
    ) -> Result<MultiplexerAction> {
        if update.kind == UpdateKind::Delete {
            return Ok(MultiplexerAction::MailboxDeleted);
        }

        let Some(sub) = &self.subscription else {
            return Ok(MultiplexerAction::None);
        };
        let Some(selected) = selected else {
            notifier.remove_listener(&self.session, &sub.mailbox_id).await?;
            return Ok(MultiplexerAction::None);
        };
        if selected.mailbox_id != sub.mailbox_id {
            return Ok(MultiplexerAction::None);
        }

        if !sub.try_acquire() {
            return Ok(MultiplexerAction::None);
        }

        let fetched = notifier.get_updates(&sub.mailbox_id, selected.modify_index).await;
        let result = match fetched {
            Ok(mut updates) => {
                if let Some(last) = updates.last() {
                    selected.advance_modseq(last.modseq);
                }
                let had_updates = !updates.is_empty();
                selected.notifications.append(&mut updates.into());
                if had_updates && idling {
                    Ok(MultiplexerAction::FlushNow)
                } else {
                    Ok(MultiplexerAction::None)
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "notifier get_updates failed");
                Ok(MultiplexerAction::None)
            }
        };

        sub.release();
        result
    }
}

/// The flush algorithm from `spec.md` §4.6 step "Flush algorithm". Run
/// at end of command or while idling. Drains `selected.notifications`,
/// writing the surviving updates to `egress` in the order described,
/// and returns the final `changed`/deferred-EXISTS resolution.
pub async fn emit_notifications<T, M>(
    egress: &mut EgressPipeline<T>,
    selected: &mut SelectedMailbox<M>,
    session: &SessionId,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
    M: Clone,
{
    let queue: Vec<UpdateRecord<M>> = selected.notifications.drain(..).collect();

    let added: HashSet<u32> = queue
        .iter()
        .filter(|u| u.kind == UpdateKind::Exists)
        .map(|u| u.uid)
        .collect();
    let removed: HashSet<u32> = queue
        .iter()
        .filter(|u| u.kind == UpdateKind::Expunge)
        .map(|u| u.uid)
        .collect();
    let skip: HashSet<u32> = added.intersection(&removed).copied().collect();

    // Coalesce FETCHes: scan right-to-left, keep only the last FETCH
    // per UID, and drop FETCHes for UIDs dominated by EXISTS/EXPUNGE.
    let mut last_fetch_index: std::collections::HashMap<u32, usize> = std::collections::HashMap::new();
    for (i, update) in queue.iter().enumerate().rev() {
        if update.kind == UpdateKind::Fetch
            && !added.contains(&update.uid)
            && !removed.contains(&update.uid)
            && !last_fetch_index.contains_key(&update.uid)
        {
            last_fetch_index.insert(update.uid, i);
        }
    }

    let mut deferred_exists: Option<ResponseRecord> = None;
    let mut changed = false;

    for (i, update) in queue.iter().enumerate() {
        if skip.contains(&update.uid) {
            continue;
        }
        if update.kind == UpdateKind::Fetch && last_fetch_index.get(&update.uid) != Some(&i) {
            continue;
        }

        selected.advance_modseq(update.modseq);

        if update.ignore.as_ref() == Some(session) {
            continue;
        }

        match update.kind {
            UpdateKind::Exists => {
                let seq = Composer::record_exists(selected, update.uid);
                deferred_exists = Some(ResponseRecord::untagged(
                    seq.to_string(),
                    vec![Attribute::Atom("EXISTS".into())],
                ));
                changed = false;
            }
            UpdateKind::Expunge => {
                if let Some(seq) = Composer::record_expunge(selected, update.uid) {
                    let record = ResponseRecord::untagged(seq.to_string(), vec![Attribute::Atom("EXPUNGE".into())]);
                    Composer::write(egress, record).await?;
                    changed = true;
                }
            }
            UpdateKind::Fetch => {
                if let Some(seq) = Composer::record_fetch(selected, update.uid) {
                    let mut attrs = vec![Attribute::Atom("FETCH".into())];
                    let mut fields = Vec::new();
                    if let Some(flags) = &update.flags {
                        fields.push(Attribute::Atom("FLAGS".into()));
                        fields.push(Attribute::List(
                            flags.iter().cloned().map(Attribute::Atom).collect(),
                        ));
                    }
                    if selected.condstore_enabled {
                        fields.push(Attribute::Atom("MODSEQ".into()));
                        fields.push(Attribute::List(vec![Attribute::Atom(update.modseq.to_string())]));
                    }
                    attrs.push(Attribute::List(fields));
                    let record = ResponseRecord::untagged(seq.to_string(), attrs);
                    Composer::write(egress, record).await?;
                }
            }
            UpdateKind::Delete => unreachable!("Delete updates are handled by on_notification"),
        }
    }

    if let Some(record) = deferred_exists {
        if !changed {
            Composer::write(egress, record).await?;
        } else {
            Composer::write_raw_exists(egress, selected.uid_list.len()).await?;
        }
    } else if changed {
        Composer::write_raw_exists(egress, selected.uid_list.len()).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SelectedMailbox;

    fn update(kind: UpdateKind, uid: u32, modseq: u64) -> UpdateRecord<()> {
        UpdateRecord {
            mailbox_id: (),
            kind,
            uid,
            modseq,
            flags: None,
            ignore: None,
        }
    }

    async fn flush(selected: &mut SelectedMailbox<()>) -> String {
        let (client, server) = tokio::io::duplex(8192);
        let mut egress = EgressPipeline::plain(server);
        let session = SessionId::generate();
        emit_notifications(&mut egress, selected, &session).await.unwrap();
        drop(egress);
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        let mut client = client;
        let _ = client.read_to_end(&mut buf).await;
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn coalesced_exists_emits_once() {
        let mut selected = SelectedMailbox::new(());
        selected.uid_list = vec![10, 11];
        selected.notifications.extend([
            update(UpdateKind::Exists, 12, 1),
            update(UpdateKind::Exists, 13, 2),
            update(UpdateKind::Exists, 14, 3),
        ]);
        let out = flush(&mut selected).await;
        assert_eq!(out, "* 5 EXISTS\r\n");
        assert_eq!(selected.uid_list, vec![10, 11, 12, 13, 14]);
    }

    #[tokio::test]
    async fn exists_then_expunge_of_new_uid_is_silent() {
        let mut selected = SelectedMailbox::new(());
        selected.uid_list = vec![10];
        selected.notifications.extend([
            update(UpdateKind::Exists, 11, 1),
            update(UpdateKind::Expunge, 11, 2),
        ]);
        let out = flush(&mut selected).await;
        assert_eq!(out, "");
        assert_eq!(selected.uid_list, vec![10]);
    }

    #[tokio::test]
    async fn exists_then_expunge_of_preexisting_synthesizes_exists() {
        let mut selected = SelectedMailbox::new(());
        selected.uid_list = vec![10, 11];
        selected.notifications.extend([
            update(UpdateKind::Exists, 12, 1),
            update(UpdateKind::Expunge, 10, 2),
        ]);
        let out = flush(&mut selected).await;
        assert_eq!(out, "* 1 EXPUNGE\r\n* 2 EXISTS\r\n");
        assert_eq!(selected.uid_list, vec![11, 12]);
    }

    #[tokio::test]
    async fn exists_expunge_exists_emits_one_expunge_and_the_final_exists() {
        let mut selected = SelectedMailbox::new(());
        selected.uid_list = vec![10, 11];
        selected.notifications.extend([
            update(UpdateKind::Exists, 12, 1),
            update(UpdateKind::Expunge, 10, 2),
            update(UpdateKind::Exists, 13, 3),
        ]);
        let out = flush(&mut selected).await;
        assert_eq!(out, "* 1 EXPUNGE\r\n* 3 EXISTS\r\n");
        assert_eq!(selected.uid_list, vec![11, 12, 13]);
    }

    #[tokio::test]
    async fn fetch_coalescing_with_echo_suppression() {
        let mut selected = SelectedMailbox::new(());
        selected.uid_list = vec![10, 11];
        let session = SessionId::generate();
        selected.notifications.extend([
            UpdateRecord {
                mailbox_id: (),
                kind: UpdateKind::Fetch,
                uid: 10,
                modseq: 1,
                flags: Some(vec!["\\Seen".to_string()]),
                ignore: None,
            },
            UpdateRecord {
                mailbox_id: (),
                kind: UpdateKind::Fetch,
                uid: 10,
                modseq: 2,
                flags: Some(vec!["\\Seen".to_string(), "\\Flagged".to_string()]),
                ignore: Some(session.clone()),
            },
            UpdateRecord {
                mailbox_id: (),
                kind: UpdateKind::Fetch,
                uid: 11,
                modseq: 3,
                flags: Some(vec!["\\Answered".to_string()]),
                ignore: None,
            },
        ]);

        let (client, server) = tokio::io::duplex(8192);
        let mut egress = EgressPipeline::plain(server);
        emit_notifications(&mut egress, &mut selected, &session).await.unwrap();
        drop(egress);
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        let mut client = client;
        let _ = client.read_to_end(&mut buf).await;
        let out = String::from_utf8(buf).unwrap();
        assert_eq!(out, "* 2 FETCH (FLAGS (\\Answered))\r\n");
        assert_eq!(selected.modify_index, 3);
    }
}
