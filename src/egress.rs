//! The egress pipeline: composer -> (optional DEFLATE) -> transport
//!
//! STARTTLS and COMPRESS=DEFLATE each atomically replace a stage of
//! this chain at a quiescent boundary, mirroring how the teacher's
//! `connection.rs::connect` performs a client-side STARTTLS upgrade in
//! place of the plain socket -- here on the server side, and with a
//! second swappable stage for DEFLATE. COMPRESS=DEFLATE is symmetric:
//! `DeflateEncoder` frames outbound bytes, `Decompress` (the same
//! crate's low-level streaming inflater, driven a buffer at a time
//! rather than through a blocking `Read` wrapper) unframes inbound
//! ones, both raw deflate per RFC 4978 with no zlib/gzip header.

use flate2::write::DeflateEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use std::io::Write as _;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::server::TlsStream;

use crate::error::{Error, Result};

/// One stage of the egress chain. `Taken` is a momentary placeholder
/// while the transport has been handed out to an embedder-supplied
/// TLS acceptor for the STARTTLS handshake (`spec.md` §4.4); the
/// quiescent-boundary guard means no poll ever observes it in
/// practice.
enum Stage<T> {
    Plain(T),
    Tls(Box<TlsStream<T>>),
    Taken,
}

impl<T: AsyncRead + Unpin> AsyncRead for Stage<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(t) => Pin::new(t).poll_read(cx, buf),
            Self::Tls(t) => Pin::new(t.as_mut()).poll_read(cx, buf),
            Self::Taken => Poll::Ready(Err(std::io::Error::other("transport taken for upgrade"))),
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Stage<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(t) => Pin::new(t).poll_write(cx, buf),
            Self::Tls(t) => Pin::new(t.as_mut()).poll_write(cx, buf),
            Self::Taken => Poll::Ready(Err(std::io::Error::other("transport taken for upgrade"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(t) => Pin::new(t).poll_flush(cx),
            Self::Tls(t) => Pin::new(t.as_mut()).poll_flush(cx),
            Self::Taken => Poll::Ready(Err(std::io::Error::other("transport taken for upgrade"))),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(t) => Pin::new(t).poll_shutdown(cx),
            Self::Tls(t) => Pin::new(t.as_mut()).poll_shutdown(cx),
            Self::Taken => Poll::Ready(Err(std::io::Error::other("transport taken for upgrade"))),
        }
    }
}

/// Ordered chain of optional transforms terminating in the
/// transport, swappable atomically at a quiescent boundary.
pub struct EgressPipeline<T> {
    stage: Stage<T>,
    /// Raw-deflate encoder (RFC 4978) inserted by `enable_deflate`.
    /// `None` until COMPRESS=DEFLATE is negotiated.
    deflate: Option<DeflateEncoder<Vec<u8>>>,
    /// The read-side counterpart of `deflate`: a raw-deflate inflater
    /// driven a buffer at a time from `poll_fill_buf`, since nothing
    /// in this pipeline ever blocks on a synchronous `Read`. `None`
    /// until COMPRESS=DEFLATE is negotiated, alongside `deflate`.
    inflate: Option<Decompress>,
    /// True between accepting a synchronizing-literal header and
    /// receiving all of that literal's bytes; STARTTLS/COMPRESS must
    /// refuse to run while this holds, per `spec.md` §4.4.
    literal_in_flight: bool,
    upgrading: bool,
    /// Logical (already-decompressed, if DEFLATE is active) bytes
    /// available to `AsyncBufRead` consumers. Lives on the pipeline,
    /// not on whichever `Stage` happens to be active, so the framer's
    /// buffered line scanning survives a STARTTLS/COMPRESS stage swap
    /// without losing already-filled bytes.
    read_buf: Vec<u8>,
    read_pos: usize,
    /// Bytes read straight off `stage`, not yet translated into
    /// `read_buf`. Equal to `read_buf` byte-for-byte when DEFLATE is
    /// inactive; otherwise the still-compressed tail `inflate` hasn't
    /// consumed yet (its output buffer is refilled in bounded chunks,
    /// so a single transport read can outlive several translation
    /// passes).
    raw_buf: Vec<u8>,
    raw_pos: usize,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> EgressPipeline<T> {
    #[must_use]
    pub fn plain(transport: T) -> Self {
        Self {
            stage: Stage::Plain(transport),
            deflate: None,
            inflate: None,
            literal_in_flight: false,
            upgrading: false,
            read_buf: Vec::new(),
            read_pos: 0,
            raw_buf: Vec::new(),
            raw_pos: 0,
        }
    }

    pub fn set_literal_in_flight(&mut self, value: bool) {
        self.literal_in_flight = value;
    }

    fn ensure_quiescent(&self) -> Result<()> {
        if self.upgrading {
            return Err(Error::State("upgrade already in progress".into()));
        }
        if self.literal_in_flight {
            return Err(Error::State(
                "cannot upgrade while a literal transfer is in progress".into(),
            ));
        }
        Ok(())
    }

    /// Hand the raw transport out to an embedder-supplied TLS acceptor
    /// for the STARTTLS handshake, per `spec.md` §1's "TLS negotiation
    /// primitives ... out of scope": the core only owns the quiescent
    /// boundary, never the handshake itself. Leaves the stage as
    /// `Taken` until [`Self::install_tls`] (success) puts a
    /// `TlsStream` back.
    pub fn take_for_starttls(&mut self) -> Result<T> {
        self.ensure_quiescent()?;
        match std::mem::replace(&mut self.stage, Stage::Taken) {
            Stage::Plain(transport) => {
                self.upgrading = true;
                Ok(transport)
            }
            other => {
                self.stage = other;
                Err(Error::State("transport is not in the plain stage".into()))
            }
        }
    }

    /// Complete a STARTTLS handshake begun with
    /// [`Self::take_for_starttls`].
    pub fn install_tls(&mut self, tls: TlsStream<T>) {
        self.stage = Stage::Tls(Box::new(tls));
        self.upgrading = false;
    }

    /// Enable the DEFLATE transform (COMPRESS=DEFLATE), both
    /// directions at once: outbound bytes are framed by `deflate`,
    /// inbound bytes are unframed by `inflate`.
    pub fn enable_deflate(&mut self) -> Result<()> {
        self.ensure_quiescent()?;
        self.deflate = Some(DeflateEncoder::new(Vec::new(), Compression::default()));
        self.inflate = Some(Decompress::new(false));
        Ok(())
    }

    #[must_use]
    pub const fn deflate_active(&self) -> bool {
        self.deflate.is_some()
    }

    /// Write bytes through the optional DEFLATE transform into the
    /// current transport stage.
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        if let Some(encoder) = &mut self.deflate {
            encoder
                .write_all(bytes)
                .map_err(|e| Error::Fatal(format!("deflate encode failed: {e}")))?;
            let compressed = encoder.get_mut();
            let chunk = std::mem::take(compressed);
            self.stage.write_all(&chunk).await.map_err(Error::from_io)?;
        } else {
            self.stage.write_all(bytes).await.map_err(Error::from_io)?;
        }
        Ok(())
    }

    /// Per `spec.md` §4.3: after writing a payload, if DEFLATE is
    /// active the composer requests a flush so bytes reach the
    /// client immediately rather than waiting in the deflate window.
    pub async fn flush_if_deflate(&mut self) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        if let Some(encoder) = &mut self.deflate {
            encoder
                .flush()
                .map_err(|e| Error::Fatal(format!("deflate flush failed: {e}")))?;
            let compressed = encoder.get_mut();
            let chunk = std::mem::take(compressed);
            if !chunk.is_empty() {
                self.stage.write_all(&chunk).await.map_err(Error::from_io)?;
            }
        }
        self.stage.flush().await.map_err(Error::from_io)?;
        Ok(())
    }

    /// Move whatever raw bytes have accumulated in `raw_buf` since the
    /// last call into `read_buf`, running them through `inflate` first
    /// if DEFLATE is active. A no-op if `raw_buf` is already fully
    /// consumed.
    fn translate_raw_into_read_buf(&mut self) -> std::io::Result<()> {
        let Self {
            inflate,
            raw_buf,
            raw_pos,
            read_buf,
            ..
        } = self;

        if *raw_pos >= raw_buf.len() {
            return Ok(());
        }

        let Some(inflate) = inflate.as_mut() else {
            read_buf.extend_from_slice(&raw_buf[*raw_pos..]);
            *raw_pos = raw_buf.len();
            return Ok(());
        };

        loop {
            if *raw_pos >= raw_buf.len() {
                break;
            }
            let mut out = [0u8; 8192];
            let before_in = inflate.total_in();
            let before_out = inflate.total_out();
            let status = inflate
                .decompress(&raw_buf[*raw_pos..], &mut out, FlushDecompress::None)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
            let consumed = usize::try_from(inflate.total_in().saturating_sub(before_in)).unwrap_or(0);
            let produced = usize::try_from(inflate.total_out().saturating_sub(before_out)).unwrap_or(0);
            *raw_pos += consumed;
            if produced > 0 {
                read_buf.extend_from_slice(&out[..produced]);
            }
            if status == Status::StreamEnd || (consumed == 0 && produced == 0) {
                break;
            }
        }
        Ok(())
    }
}

impl<T: AsyncRead + Unpin> AsyncBufRead for EgressPipeline<T> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<&[u8]>> {
        let this = self.get_mut();
        while this.read_pos >= this.read_buf.len() {
            this.read_buf.clear();
            this.read_pos = 0;

            this.translate_raw_into_read_buf()?;
            if !this.read_buf.is_empty() {
                break;
            }

            if this.raw_pos > 0 {
                this.raw_buf.drain(..this.raw_pos);
                this.raw_pos = 0;
            }
            let start = this.raw_buf.len();
            this.raw_buf.resize(start + 8192, 0);
            let mut read_buf = ReadBuf::new(&mut this.raw_buf[start..]);
            match Pin::new(&mut this.stage).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let n = read_buf.filled().len();
                    this.raw_buf.truncate(start + n);
                    if n == 0 {
                        break; // clean EOF
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {
                    this.raw_buf.truncate(start);
                    return Poll::Pending;
                }
            }
        }
        Poll::Ready(Ok(&this.read_buf[this.read_pos..]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        self.get_mut().read_pos += amt;
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for EgressPipeline<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let n = {
            let available = match Pin::new(&mut *this).poll_fill_buf(cx) {
                Poll::Ready(Ok(bytes)) => bytes,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            let n = available.len().min(buf.remaining());
            buf.put_slice(&available[..n]);
            n
        };
        Pin::new(this).consume(n);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_write_passes_through() {
        let (client, server) = tokio::io::duplex(4096);
        let mut egress = EgressPipeline::plain(server);
        egress.write_all(b"* OK ready\r\n").await.unwrap();
        egress.flush_if_deflate().await.unwrap();
        drop(egress);

        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        let mut client = client;
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"* OK ready\r\n");
    }

    #[tokio::test]
    async fn deflate_roundtrips_through_decoder() {
        let (client, server) = tokio::io::duplex(65536);
        let mut egress = EgressPipeline::plain(server);
        egress.enable_deflate().unwrap();
        egress.write_all(b"* 1 EXISTS\r\n").await.unwrap();
        egress.flush_if_deflate().await.unwrap();
        drop(egress);

        use tokio::io::AsyncReadExt;
        let mut compressed = Vec::new();
        let mut client = client;
        client.read_to_end(&mut compressed).await.unwrap();

        use flate2::read::DeflateDecoder;
        use std::io::Read;
        let mut decoder = DeflateDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"* 1 EXISTS\r\n");
    }

    #[tokio::test]
    async fn inbound_deflate_stream_is_decompressed_on_read() {
        let (mut client, server) = tokio::io::duplex(65536);

        let mut compressed = Vec::new();
        {
            use flate2::write::DeflateEncoder as StdDeflateEncoder;
            use std::io::Write;
            let mut encoder = StdDeflateEncoder::new(&mut compressed, Compression::default());
            encoder.write_all(b"a1 LOGIN alice secret\r\n").unwrap();
            encoder.finish().unwrap();
        }

        use tokio::io::AsyncWriteExt as _;
        client.write_all(&compressed).await.unwrap();

        let mut egress = EgressPipeline::plain(server);
        egress.enable_deflate().unwrap();

        use tokio::io::AsyncBufReadExt as _;
        let mut line = Vec::new();
        egress.read_until(b'\n', &mut line).await.unwrap();
        assert_eq!(line, b"a1 LOGIN alice secret\r\n");
    }

    #[tokio::test]
    async fn upgrade_rejected_while_literal_in_flight() {
        let (_client, server) = tokio::io::duplex(4096);
        let mut egress = EgressPipeline::plain(server);
        egress.set_literal_in_flight(true);
        assert!(egress.enable_deflate().is_err());
    }

    #[tokio::test]
    async fn take_for_starttls_marks_upgrading_until_installed() {
        let (_client, server) = tokio::io::duplex(4096);
        let mut egress = EgressPipeline::plain(server);
        let transport = egress.take_for_starttls().unwrap();
        assert!(egress.enable_deflate().is_err(), "upgrading should block further upgrades");
        drop(transport);
    }

    #[tokio::test]
    async fn buffered_read_bytes_are_not_lost_across_small_reads() {
        let (mut client, server) = tokio::io::duplex(4096);
        use tokio::io::AsyncWriteExt as _;
        client.write_all(b"a1 NOOP\r\n").await.unwrap();
        drop(client);

        let mut egress = EgressPipeline::plain(server);
        use tokio::io::AsyncBufReadExt as _;
        let mut line = Vec::new();
        egress.read_until(b'\n', &mut line).await.unwrap();
        assert_eq!(line, b"a1 NOOP\r\n");
    }
}
