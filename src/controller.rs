//! The connection controller: the top-level per-connection loop
//!
//! Ties every other component together per `spec.md` §4.5: accepts a
//! transport, resolves the client's hostname, sends the greeting,
//! then drives a single cooperative loop (`tokio::select!`) that
//! reconciles three suspension points -- the next framed command, a
//! notifier callback, and the idle timer -- exactly as `spec.md` §5
//! describes. Mirrors the shape of the teacher's own top-level
//! `connect()`/`list_folders()` orchestration: small, named stages,
//! each a `Result`-returning `async fn`, composed in one place.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tokio_rustls::TlsAcceptor;

use crate::assembler::{CommandAssembler, CommandRecord, Progress};
use crate::config::ServerOptions;
use crate::dns;
use crate::egress::EgressPipeline;
use crate::error::{Error, Result};
use crate::framer::Framer;
use crate::handler::{HandlerTable, SearchSupport, SessionHandle};
use crate::id::SessionId;
use crate::multiplexer::{self, MultiplexerAction, NotificationMultiplexer};
use crate::notifier::{Notifier, UpdateRecord};
use crate::response::{Attribute, Composer, ResponseRecord};
use crate::session::{ConnectionState, SessionState};

/// Hook realizing `server.onNotifications(mailbox_id, modify_index,
/// session)` (`spec.md` §6), invoked after a flush with the updated
/// cursor.
pub type NotificationsHook<M> = Arc<dyn Fn(M, u64, SessionId) + Send + Sync>;

/// Hook realizing `server.connections` deregistration: called exactly
/// once, on the way out of [`Connection::run`], regardless of why the
/// connection closed.
pub type CloseHook = Arc<dyn Fn(&SessionId) + Send + Sync>;

/// The server-wide collaborators every connection shares: the
/// embedder's handler table, notifier, optional search support,
/// optional TLS acceptor for STARTTLS, and the two optional hooks
/// named in `spec.md` §6.
pub struct ConnectionController<T, M> {
    pub options: ServerOptions,
    pub notifier: Arc<dyn Notifier<M>>,
    pub handlers: Arc<HandlerTable<T, M>>,
    pub search: Option<Arc<dyn SearchSupport<M>>>,
    pub tls_acceptor: Option<TlsAcceptor>,
    pub on_notifications: Option<NotificationsHook<M>>,
    pub on_close: Option<CloseHook>,
}

impl<T, M> ConnectionController<T, M>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    M: Clone + Eq + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(options: ServerOptions, notifier: Arc<dyn Notifier<M>>, handlers: Arc<HandlerTable<T, M>>) -> Self {
        Self {
            options,
            notifier,
            handlers,
            search: None,
            tls_acceptor: None,
            on_notifications: None,
            on_close: None,
        }
    }

    /// Accept `transport`, perform the greeting handshake, then run
    /// the connection to completion. Close is invoked exactly once no
    /// matter how the loop exits.
    pub async fn serve(&self, transport: T, remote_addr: SocketAddr) -> Result<()> {
        let Some(mut connection) = Connection::accept(transport, remote_addr, self).await? else {
            return Ok(());
        };
        let result = connection.run(self).await;
        connection.close(self);
        result
    }
}

/// One live connection: owns its transport-adjacent state exclusively
/// (`spec.md` §3). Created by [`ConnectionController::serve`], never
/// directly.
pub struct Connection<T, M> {
    pub session: SessionState<M>,
    egress: EgressPipeline<T>,
    framer: Framer,
    assembler: CommandAssembler,
    multiplexer: NotificationMultiplexer<M>,
    notify_tx: mpsc::UnboundedSender<UpdateRecord<M>>,
    notify_rx: mpsc::UnboundedReceiver<UpdateRecord<M>>,
    closed: bool,
}

impl<T, M> Connection<T, M>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    M: Clone + Eq + Send + Sync + 'static,
{
    /// Perform the accept-time handshake: best-effort reverse DNS
    /// raced against the client talking too soon, then the greeting.
    /// Returns `Ok(None)` if the client talked before the greeting
    /// (the caller has nothing further to do; the connection is
    /// already closed).
    async fn accept(transport: T, remote_addr: SocketAddr, controller: &ConnectionController<T, M>) -> Result<Option<Self>> {
        let mut egress = EgressPipeline::plain(transport);
        let mut framer = Framer::new(controller.options.max_line_size, controller.options.max_literal_size);

        let dns_fut = dns::resolve_client_hostname(remote_addr, controller.options.reverse_dns_timeout);
        tokio::pin!(dns_fut);

        let hostname = tokio::select! {
            hostname = &mut dns_fut => hostname,
            frame = framer.next_frame(&mut egress) => {
                let _ = frame;
                let reply = ResponseRecord::untagged("BAD", vec![Attribute::Atom("You talk too soon".into())]);
                let _ = Composer::write(&mut egress, reply).await;
                return Ok(None);
            }
        };

        let session = SessionState::new(remote_addr, hostname);
        let greeting = ResponseRecord::untagged(
            "OK",
            vec![Attribute::Atom(format!("{} ready", controller.options.name))],
        );
        Composer::write(&mut egress, greeting).await?;

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let multiplexer = NotificationMultiplexer::new(session.id.clone());

        Ok(Some(Self {
            session,
            egress,
            framer,
            assembler: CommandAssembler::new(),
            multiplexer,
            notify_tx,
            notify_rx,
            closed: false,
        }))
    }

    /// The main cooperative loop: next frame, notifier callback, or
    /// idle timeout, exactly the three suspension points `spec.md` §5
    /// names.
    async fn run(&mut self, controller: &ConnectionController<T, M>) -> Result<()> {
        let mut idle_timeout = Box::pin(tokio::time::sleep(controller.options.socket_timeout));

        loop {
            if self.session.state == ConnectionState::Closed {
                return Ok(());
            }

            tokio::select! {
                frame = self.framer.next_frame(&mut self.egress) => {
                    idle_timeout.as_mut().reset(tokio::time::Instant::now() + controller.options.socket_timeout);
                    match frame {
                        Ok(Some(frame)) => self.handle_frame(frame, controller, idle_timeout.as_mut()).await?,
                        Ok(None) => return Ok(()),
                        Err(err) => self.handle_parse_error(err).await?,
                    }
                }
                update = self.notify_rx.recv() => {
                    if let Some(update) = update {
                        self.handle_notifier_update(update, controller).await?;
                    }
                }
                () = &mut idle_timeout, if !self.session.idling => {
                    let bye = ResponseRecord::untagged("BYE", vec![Attribute::Atom("Idle timeout, closing connection".into())]);
                    let _ = Composer::write(&mut self.egress, bye).await;
                    self.session.state = ConnectionState::Closed;
                    return Ok(());
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        frame: crate::framer::Frame,
        controller: &ConnectionController<T, M>,
        idle_timeout: Pin<&mut Sleep>,
    ) -> Result<()> {
        match self.assembler.feed(frame) {
            Ok(Progress::NeedMore { sync }) => {
                self.egress.set_literal_in_flight(true);
                if sync {
                    self.egress.write_all(b"+ Ready for literal data\r\n").await?;
                    self.egress.flush_if_deflate().await?;
                }
                Ok(())
            }
            Ok(Progress::Done(command)) => {
                self.egress.set_literal_in_flight(false);
                self.dispatch(command, controller, idle_timeout).await
            }
            Err(err) => {
                self.egress.set_literal_in_flight(false);
                self.handle_parse_error(err).await
            }
        }
    }

    async fn handle_parse_error(&mut self, err: Error) -> Result<()> {
        let tag = self.assembler.current_tag().map(str::to_string);
        self.assembler.reset();
        let reply = match tag {
            Some(tag) => ResponseRecord::tagged(tag, "BAD", vec![Attribute::Atom(err.to_string())]),
            None => ResponseRecord::untagged("BAD", vec![Attribute::Atom(err.to_string())]),
        };
        Composer::write(&mut self.egress, reply).await
    }

    async fn dispatch(
        &mut self,
        command: CommandRecord,
        controller: &ConnectionController<T, M>,
        idle_timeout: Pin<&mut Sleep>,
    ) -> Result<()> {
        if self.session.upgrading {
            let reply = ResponseRecord::tagged(command.tag, "BAD", vec![Attribute::Atom("upgrade in progress".into())]);
            return Composer::write(&mut self.egress, reply).await;
        }

        match command.verb.as_str() {
            "LOGOUT" => return self.handle_logout(command).await,
            "IDLE" => return self.handle_idle(command, controller, idle_timeout).await,
            "STARTTLS" => return self.handle_starttls(command, controller).await,
            "COMPRESS" => return self.handle_compress(command).await,
            _ => {}
        }

        let Some(handler) = controller.handlers.get(&command.verb).cloned() else {
            let reply = ResponseRecord::tagged(command.tag, "BAD", vec![Attribute::Atom("Unknown command".into())]);
            return Composer::write(&mut self.egress, reply).await;
        };

        if !handler.allowed_states().contains(&self.session.state) {
            let reply = ResponseRecord::tagged(
                command.tag,
                "BAD",
                vec![Attribute::Atom("Command not allowed in this state".into())],
            );
            return Composer::write(&mut self.egress, reply).await;
        }

        let tag = command.tag.clone();
        let outcome = {
            let mut handle = SessionHandle::new(&mut self.session, &mut self.egress, controller.search.clone());
            handler.call(command, &mut handle).await
        };

        let mailbox_id = self.session.selected.as_ref().map(|s| s.mailbox_id.clone());
        self.update_notification_listener(controller, mailbox_id.as_ref()).await?;
        self.flush_if_selected(controller).await?;

        match outcome {
            Ok(response) => Composer::write(&mut self.egress, response).await,
            Err(err) => match err.as_tagged_reply(&tag) {
                Some(reply) => Composer::write(&mut self.egress, reply).await,
                None => Err(err),
            },
        }
    }

    async fn handle_logout(&mut self, command: CommandRecord) -> Result<()> {
        self.session.state = ConnectionState::Logout;
        let bye = ResponseRecord::untagged("BYE", vec![Attribute::Atom("Logging out".into())]);
        Composer::write(&mut self.egress, bye).await?;
        let ok = ResponseRecord::tagged(command.tag, "OK", vec![Attribute::Atom("LOGOUT completed".into())]);
        Composer::write(&mut self.egress, ok).await?;
        self.session.state = ConnectionState::Closed;
        Ok(())
    }

    async fn handle_idle(
        &mut self,
        command: CommandRecord,
        controller: &ConnectionController<T, M>,
        mut idle_timeout: Pin<&mut Sleep>,
    ) -> Result<()> {
        if !matches!(self.session.state, ConnectionState::Authenticated | ConnectionState::Selected) {
            let reply = ResponseRecord::tagged(
                command.tag,
                "BAD",
                vec![Attribute::Atom("Command not allowed in this state".into())],
            );
            return Composer::write(&mut self.egress, reply).await;
        }

        self.egress.write_all(b"+ idling\r\n").await?;
        self.egress.flush_if_deflate().await?;
        self.session.idling = true;

        loop {
            tokio::select! {
                frame = self.framer.next_frame(&mut self.egress) => {
                    match frame {
                        Ok(Some(frame)) => {
                            let text = String::from_utf8_lossy(&frame.bytes);
                            if text.trim_end_matches(['\r', '\n']).eq_ignore_ascii_case("DONE") {
                                break;
                            }
                        }
                        Ok(None) => {
                            self.session.state = ConnectionState::Closed;
                            return Ok(());
                        }
                        Err(err) => return Err(err),
                    }
                }
                update = self.notify_rx.recv() => {
                    if let Some(update) = update {
                        self.handle_notifier_update(update, controller).await?;
                        if self.session.state == ConnectionState::Closed {
                            return Ok(());
                        }
                    }
                }
            }
        }

        self.session.idling = false;
        // `run()`'s idle timer kept counting down against the deadline
        // armed before this IDLE started (its own select arm is
        // disabled while `idling`, per spec.md §4.5, so it never fired
        // -- but the deadline itself went stale). Re-arm it now that
        // idling has ended, or a client that just finished an IDLE
        // longer than `socket_timeout` gets disconnected on the very
        // next command.
        idle_timeout
            .as_mut()
            .reset(tokio::time::Instant::now() + controller.options.socket_timeout);
        self.flush_if_selected(controller).await?;
        let reply = ResponseRecord::tagged(command.tag, "OK", vec![Attribute::Atom("IDLE terminated".into())]);
        Composer::write(&mut self.egress, reply).await
    }

    async fn handle_starttls(&mut self, command: CommandRecord, controller: &ConnectionController<T, M>) -> Result<()> {
        let Some(acceptor) = controller.tls_acceptor.clone() else {
            let reply = ResponseRecord::tagged(command.tag, "BAD", vec![Attribute::Atom("STARTTLS not available".into())]);
            return Composer::write(&mut self.egress, reply).await;
        };

        let ok = ResponseRecord::tagged(command.tag, "OK", vec![Attribute::Atom("Begin TLS negotiation now".into())]);
        Composer::write(&mut self.egress, ok).await?;

        let transport = self.egress.take_for_starttls()?;
        match acceptor.accept(transport).await {
            Ok(tls) => {
                self.egress.install_tls(tls);
                Ok(())
            }
            Err(err) => Err(Error::from_io(err)),
        }
    }

    async fn handle_compress(&mut self, command: CommandRecord) -> Result<()> {
        if !command.arguments.iter().any(|a| a.eq_ignore_ascii_case("DEFLATE")) {
            let reply = ResponseRecord::tagged(
                command.tag,
                "BAD",
                vec![Attribute::Atom("Unsupported compression mechanism".into())],
            );
            return Composer::write(&mut self.egress, reply).await;
        }
        if self.egress.deflate_active() {
            let reply = ResponseRecord::tagged(command.tag, "BAD", vec![Attribute::Atom("Compression already active".into())]);
            return Composer::write(&mut self.egress, reply).await;
        }

        let ok = ResponseRecord::tagged(command.tag, "OK", vec![Attribute::Atom("DEFLATE active".into())]);
        Composer::write(&mut self.egress, ok).await?;
        self.egress.enable_deflate()
    }

    /// Reconcile the notifier subscription with the currently
    /// selected mailbox. Call after SELECT/EXAMINE/CLOSE/UNSELECT
    /// complete, per `spec.md` §4.6's subscription lifecycle.
    pub async fn update_notification_listener(
        &mut self,
        controller: &ConnectionController<T, M>,
        selected_mailbox: Option<&M>,
    ) -> Result<()> {
        self.multiplexer
            .update_notification_listener(controller.notifier.as_ref(), selected_mailbox, self.notify_tx.clone())
            .await?;
        Ok(())
    }

    async fn handle_notifier_update(&mut self, update: UpdateRecord<M>, controller: &ConnectionController<T, M>) -> Result<()> {
        let action = self
            .multiplexer
            .on_notification(update, self.session.selected.as_mut(), self.session.idling, controller.notifier.as_ref())
            .await?;

        match action {
            MultiplexerAction::MailboxDeleted => {
                let bye = ResponseRecord::untagged(
                    "BYE",
                    vec![Attribute::Atom("Selected mailbox was deleted, have to disconnect".into())],
                );
                let _ = Composer::write(&mut self.egress, bye).await;
                self.session.state = ConnectionState::Closed;
            }
            MultiplexerAction::FlushNow => self.flush_if_selected(controller).await?,
            MultiplexerAction::None => {}
        }
        Ok(())
    }

    async fn flush_if_selected(&mut self, controller: &ConnectionController<T, M>) -> Result<()> {
        let Some(selected) = self.session.selected.as_mut() else {
            return Ok(());
        };
        multiplexer::emit_notifications(&mut self.egress, selected, &self.session.id).await?;

        if let Some(hook) = controller.on_notifications.clone() {
            let mailbox_id = selected.mailbox_id.clone();
            let modify_index = selected.modify_index;
            let session_id = self.session.id.clone();
            tokio::spawn(async move {
                hook(mailbox_id, modify_index, session_id);
            });
        }
        Ok(())
    }

    /// Idempotent teardown: releases the notifier subscription and
    /// invokes the registry deregistration hook. Safe to call more
    /// than once; only the first call does anything.
    fn close(&mut self, controller: &ConnectionController<T, M>) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.session.state = ConnectionState::Closed;
        if let Some(hook) = &controller.on_close {
            hook(&self.session.id);
        }
    }
}
