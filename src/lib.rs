#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! IMAP4rev1 server connection engine
//!
//! This crate owns one connection's worth of IMAP protocol state: line
//! and literal framing, command assembly, the authentication/selection
//! state machine, response composition with sequence/UID bookkeeping,
//! an egress pipeline that survives STARTTLS and COMPRESS, and a
//! notification multiplexer that reconciles in-flight client commands
//! with out-of-band mailbox updates. Mailbox storage, search, and the
//! concrete set of IMAP verbs are supplied by the embedder through the
//! [`handler`] and [`notifier`] traits; this crate never looks inside
//! a mailbox. The store itself is not a type this crate names: each
//! handler brings whatever store handle it needs as its own field,
//! the same way [`handler::SearchSupport`] is threaded in.

pub mod assembler;
pub mod config;
pub mod controller;
pub mod dns;
pub mod egress;
pub mod error;
pub mod framer;
pub mod handler;
pub mod id;
pub mod multiplexer;
pub mod notifier;
pub mod response;
pub mod session;

pub use assembler::{CommandAssembler, CommandRecord, Progress};
pub use config::ServerOptions;
pub use controller::{CloseHook, Connection, ConnectionController, NotificationsHook};
pub use egress::EgressPipeline;
pub use error::{Error, Result};
pub use framer::{Frame, Framer};
pub use handler::{Handler, HandlerTable, SearchSupport, SessionHandle};
pub use id::SessionId;
pub use multiplexer::{MultiplexerAction, NotificationMultiplexer, SubscriptionChange};
pub use notifier::{Notifier, UpdateKind, UpdateRecord};
pub use response::{Attribute, Composer, ResponseRecord};
pub use session::{CapabilitySet, ConnectionState, SelectedMailbox, SessionState};
