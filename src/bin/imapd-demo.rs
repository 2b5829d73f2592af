#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Demo IMAP server binary
//!
//! Wires a minimal in-memory [`Notifier`] and a bare-bones `CAPABILITY`/
//! `NOOP`/`LOGOUT` handler table to [`ConnectionController`] and serves
//! plain-TCP connections. Exists to show how an embedder assembles the
//! engine; it is not a usable mail server on its own (no store, no
//! `LOGIN`/`SELECT`/`FETCH` handlers).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use clap::Parser;
use imap_core::{
    Attribute, CommandRecord, ConnectionController, ConnectionState, Handler, HandlerTable,
    Notifier, ResponseRecord, ServerOptions, SessionHandle, SessionId, UpdateRecord,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "imapd-demo")]
#[command(about = "Minimal demo server built on the IMAP connection engine")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:1143")]
    bind: String,

    /// Advertised server name in the greeting
    #[arg(long, default_value = "imap-core-demo")]
    name: String,
}

/// A notifier with nothing to notify: every mailbox is permanently
/// empty, so `add_listener`/`remove_listener` just bookkeep and
/// `get_updates` always returns nothing.
#[derive(Default)]
struct InertNotifier {
    listeners: Mutex<HashMap<(SessionId, String), mpsc::UnboundedSender<UpdateRecord<String>>>>,
}

#[async_trait]
impl Notifier<String> for InertNotifier {
    async fn add_listener(
        &self,
        session: SessionId,
        mailbox_id: String,
        sender: mpsc::UnboundedSender<UpdateRecord<String>>,
    ) -> imap_core::Result<()> {
        self.listeners.lock().unwrap().insert((session, mailbox_id), sender);
        Ok(())
    }

    async fn remove_listener(&self, session: &SessionId, mailbox_id: &String) -> imap_core::Result<()> {
        self.listeners.lock().unwrap().remove(&(session.clone(), mailbox_id.clone()));
        Ok(())
    }

    async fn get_updates(&self, _mailbox_id: &String, _since_modseq: u64) -> imap_core::Result<Vec<UpdateRecord<String>>> {
        Ok(Vec::new())
    }
}

struct Capability;

#[async_trait]
impl<T> Handler<T, String> for Capability
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    fn allowed_states(&self) -> &'static [ConnectionState] {
        &[
            ConnectionState::NotAuthenticated,
            ConnectionState::Authenticated,
            ConnectionState::Selected,
        ]
    }

    async fn call(&self, command: CommandRecord, session: &mut SessionHandle<'_, T, String>) -> imap_core::Result<ResponseRecord> {
        session
            .send(ResponseRecord::untagged(
                "CAPABILITY",
                vec![Attribute::Atom("IMAP4rev1".into())],
            ))
            .await?;
        Ok(ResponseRecord::tagged(
            command.tag,
            "OK",
            vec![Attribute::Atom("CAPABILITY completed".into())],
        ))
    }
}

struct Noop;

#[async_trait]
impl<T> Handler<T, String> for Noop
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    fn allowed_states(&self) -> &'static [ConnectionState] {
        &[
            ConnectionState::NotAuthenticated,
            ConnectionState::Authenticated,
            ConnectionState::Selected,
        ]
    }

    async fn call(&self, command: CommandRecord, _session: &mut SessionHandle<'_, T, String>) -> imap_core::Result<ResponseRecord> {
        Ok(ResponseRecord::tagged(command.tag, "OK", vec![Attribute::Atom("NOOP completed".into())]))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut handlers: HandlerTable<tokio::net::TcpStream, String> = HandlerTable::new();
    handlers.register("CAPABILITY", Arc::new(Capability));
    handlers.register("NOOP", Arc::new(Noop));

    let controller = Arc::new(ConnectionController {
        options: ServerOptions::new(args.name.clone(), args.name),
        notifier: Arc::new(InertNotifier::default()),
        handlers: Arc::new(handlers),
        search: None,
        tls_acceptor: None,
        on_notifications: None,
        on_close: None,
    });

    let listener = TcpListener::bind(&args.bind).await?;
    tracing::info!(addr = %args.bind, "listening");

    loop {
        let (socket, remote_addr) = listener.accept().await?;
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if let Err(err) = controller.serve(socket, remote_addr).await {
                tracing::warn!(error = %err, %remote_addr, "connection ended with error");
            }
        });
    }
}
