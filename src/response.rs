//! Response records and the wire composer
//!
//! `ResponseRecord`/`Attribute` are the tagged-variant sum types the
//! Design Notes call for instead of untagged records. The `Composer`
//! serializes them to IMAP wire syntax and, separately, owns the
//! sequence-number bookkeeping (`record_exists`/`record_expunge`/
//! `record_fetch`) that the notification multiplexer relies on --
//! kept as distinct methods from the pure-serialization ones so the
//! multiplexer's synthesized EXISTS (Open Question 2) can write
//! without mutating `uid_list` a second time.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::egress::EgressPipeline;
use crate::error::Result;
use crate::session::SelectedMailbox;

/// One node in a response's attribute tree.
pub enum Attribute {
    Atom(String),
    String(String),
    Literal(Vec<u8>),
    Nil,
    List(Vec<Attribute>),
    /// A payload copied from a producer straight into egress, never
    /// materialized in memory. `expected_length` is the literal's
    /// advertised length; `start_from`/`max_length` support partial
    /// fetches (`FETCH BODY[]<start.len>`).
    Stream {
        expected_length: u64,
        start_from: u64,
        max_length: Option<u64>,
        producer: Box<dyn AsyncRead + Unpin + Send>,
    },
}

impl std::fmt::Debug for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Atom(a) => write!(f, "Atom({a:?})"),
            Self::String(s) => write!(f, "String({s:?})"),
            Self::Literal(bytes) => write!(f, "Literal({} bytes)", bytes.len()),
            Self::Nil => write!(f, "Nil"),
            Self::List(items) => write!(f, "List({items:?})"),
            Self::Stream {
                expected_length, ..
            } => write!(f, "Stream({expected_length} bytes)"),
        }
    }
}

/// A response from the server to the client: either tagged (a
/// command's final completion) or untagged (`*`, including server
/// greetings and notification pushes).
#[derive(Debug)]
pub struct ResponseRecord {
    /// `Some(tag)` for a tagged completion, `None` for untagged.
    pub tag: Option<String>,
    /// `OK`/`NO`/`BAD`/`BYE`/the response name (`EXISTS`, `FETCH`, ...).
    pub status: Option<String>,
    pub attributes: Vec<Attribute>,
}

impl ResponseRecord {
    #[must_use]
    pub fn tagged(tag: impl Into<String>, status: impl Into<String>, attrs: Vec<Attribute>) -> Self {
        Self {
            tag: Some(tag.into()),
            status: Some(status.into()),
            attributes: attrs,
        }
    }

    #[must_use]
    pub fn untagged(status: impl Into<String>, attrs: Vec<Attribute>) -> Self {
        Self {
            tag: None,
            status: Some(status.into()),
            attributes: attrs,
        }
    }
}

/// An atom is safe to write unquoted if it has no control characters
/// and none of the quoting/list specials, with two allowances: a
/// single leading backslash (system flag keywords like `\Seen` are
/// atoms by IMAP's flag grammar) and embedded spaces (this variant
/// doubles as free-form response text -- `"LOGIN completed"` -- which
/// RFC 3501 writes raw to end of line, never quoted).
fn is_atom_safe(s: &str) -> bool {
    let body = s.strip_prefix('\\').unwrap_or(s);
    !body.is_empty()
        && body
            .bytes()
            .all(|b| (b >= 0x20 && b != 0x7f) && b != b'"' && b != b'\\' && b != b'(' && b != b')' && b != b'{')
}

fn escape_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Serializes `ResponseRecord`s to wire bytes and writes them through
/// the connection's current egress pipeline, and separately performs
/// the UID-list bookkeeping notifications require.
pub struct Composer;

impl Composer {
    /// Write a fully formed response through `egress`. Takes the
    /// record by value (not `&`) because `Attribute::Stream` holds a
    /// producer that must be read from (and thus mutated) while
    /// writing.
    pub async fn write<T>(egress: &mut EgressPipeline<T>, mut record: ResponseRecord) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut head = Vec::new();
        match &record.tag {
            Some(tag) => head.extend_from_slice(tag.as_bytes()),
            None => head.push(b'*'),
        }
        if let Some(status) = &record.status {
            head.push(b' ');
            head.extend_from_slice(status.as_bytes());
        }
        egress.write_all(&head).await?;

        for attr in &mut record.attributes {
            egress.write_all(b" ").await?;
            Self::write_attribute(egress, attr).await?;
        }
        egress.write_all(b"\r\n").await?;
        egress.flush_if_deflate().await?;
        Ok(())
    }

    fn write_attribute<'a, T>(
        egress: &'a mut EgressPipeline<T>,
        attr: &'a mut Attribute,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        Box::pin(async move {
            match attr {
                Attribute::Atom(a) if is_atom_safe(a) => {
                    egress.write_all(a.as_bytes()).await?;
                }
                Attribute::Atom(a) => {
                    egress.write_all(escape_quoted(a).as_bytes()).await?;
                }
                Attribute::String(s) => {
                    egress.write_all(escape_quoted(s).as_bytes()).await?;
                }
                Attribute::Literal(bytes) => {
                    egress
                        .write_all(format!("{{{}}}\r\n", bytes.len()).as_bytes())
                        .await?;
                    egress.write_all(bytes).await?;
                }
                Attribute::Nil => {
                    egress.write_all(b"NIL").await?;
                }
                Attribute::List(items) => {
                    egress.write_all(b"(").await?;
                    for (i, item) in items.iter_mut().enumerate() {
                        if i > 0 {
                            egress.write_all(b" ").await?;
                        }
                        Self::write_attribute(egress, item).await?;
                    }
                    egress.write_all(b")").await?;
                }
                Attribute::Stream {
                    expected_length,
                    start_from,
                    max_length,
                    producer,
                } => {
                    use tokio::io::AsyncReadExt;
                    let available = expected_length.saturating_sub(*start_from);
                    let len = max_length.map_or(available, |m| m.min(available));
                    egress
                        .write_all(format!("{{{len}}}\r\n").as_bytes())
                        .await?;

                    let mut buf = [0u8; 8192];
                    let mut to_skip = *start_from;
                    while to_skip > 0 {
                        let take = (to_skip as usize).min(buf.len());
                        let n = producer.read(&mut buf[..take]).await?;
                        if n == 0 {
                            break;
                        }
                        to_skip -= n as u64;
                    }

                    let mut remaining = len;
                    while remaining > 0 {
                        let take = (remaining as usize).min(buf.len());
                        let n = producer.read(&mut buf[..take]).await?;
                        if n == 0 {
                            break;
                        }
                        egress.write_all(&buf[..n]).await?;
                        remaining -= n as u64;
                    }
                }
            }
            Ok(())
        })
    }

    /// Append `uid` to `mailbox.uid_list`; the sequence number of the
    /// emitted response is the new length.
    pub fn record_exists<M>(mailbox: &mut SelectedMailbox<M>, uid: u32) -> usize {
        mailbox.uid_list.push(uid);
        mailbox.uid_list.len()
    }

    /// Locate `uid`; if absent the update is a no-op (`None`).
    /// Otherwise emit at `index + 1` and remove the entry, shifting
    /// every later sequence number down by one.
    pub fn record_expunge<M>(mailbox: &mut SelectedMailbox<M>, uid: u32) -> Option<usize> {
        let index = mailbox.uid_list.iter().position(|&u| u == uid)?;
        mailbox.uid_list.remove(index);
        Some(index + 1)
    }

    /// Locate `uid`; if absent, drop (`None`). Otherwise emit at
    /// `index + 1` without mutating `uid_list`.
    pub fn record_fetch<M>(mailbox: &SelectedMailbox<M>, uid: u32) -> Option<usize> {
        mailbox.uid_list.iter().position(|&u| u == uid).map(|i| i + 1)
    }

    /// Write a raw `* N EXISTS` without touching `uid_list` -- the
    /// multiplexer's synthesized-EXISTS path (Open Question 2 in
    /// `spec.md` §9) uses this instead of `record_exists` so the
    /// count isn't double-incremented.
    pub async fn write_raw_exists<T>(egress: &mut EgressPipeline<T>, count: usize) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let record = ResponseRecord::untagged(count.to_string(), vec![Attribute::Atom("EXISTS".into())]);
        Self::write(egress, record).await
    }
}
