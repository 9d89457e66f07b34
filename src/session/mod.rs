//! Socket sessions.
//!
//! A [`Session`] owns the live stream for a connection. It provides the
//! line-oriented reads used for header framing, bulk reads for the body, and
//! writes, applying the read timeout from the [`OptionsSnapshot`] to every
//! read.
//!
//! Streams are produced by connectors, which are [`tower::Service`]s taking an
//! [`OptionsSnapshot`] and returning a [`PeerStream`]. The default connector is
//! [`tcp::TcpConnector`]; [`duplex`] provides an in-memory pair for tests.

use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::FutureExt as _;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncRead, AsyncReadExt as _};
use tokio::io::{AsyncWrite, AsyncWriteExt as _, BufReader};
use tracing::trace;

use crate::error::Error;
use crate::options::OptionsSnapshot;

pub mod duplex;
#[cfg(feature = "tcp")]
pub mod tcp;

/// Header lines are terminated by CRLF.
pub const CRLF: &[u8] = b"\r\n";

/// A connected byte stream which can report on its peer.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// True while the peer appears to be connected.
    ///
    /// This must not block. Implementations which can't tell should return
    /// `true`; the session separately tracks end of stream and timeouts.
    fn is_alive(&self) -> bool;

    /// A human readable name for the remote peer.
    fn remote_name(&self) -> String;
}

/// Counters for the reads and writes performed by a session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Calls to [`Session::read_line`] which returned a line.
    pub lines_read: usize,

    /// Calls to [`Session::read`].
    pub chunks_read: usize,

    /// Total bytes written.
    pub bytes_written: u64,
}

/// The live stream for one connection.
#[derive(Debug)]
pub struct Session<IO> {
    stream: BufReader<IO>,
    remote: String,
    timeout: Option<Duration>,
    eof: bool,
    timed_out: bool,
    closed: bool,
    stats: SessionStats,
}

impl<IO> Session<IO>
where
    IO: PeerStream,
{
    /// Wrap a connected stream, using the read timeout from `snapshot`.
    pub fn new(stream: IO, snapshot: &OptionsSnapshot) -> Self {
        let remote = stream.remote_name();
        Self {
            stream: BufReader::new(stream),
            remote,
            timeout: snapshot.read_timeout(),
            eof: false,
            timed_out: false,
            closed: false,
            stats: SessionStats::default(),
        }
    }

    /// Name of the remote peer.
    pub fn remote_name(&self) -> &str {
        &self.remote
    }

    /// Read and write counters.
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// True while the session can still be used for a new exchange.
    pub fn is_alive(&self) -> bool {
        if self.closed || self.eof || self.timed_out {
            return false;
        }

        !self.stream.buffer().is_empty() || self.stream.get_ref().is_alive()
    }

    /// True once a read has exceeded the timeout.
    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    /// True once the peer has closed its side of the stream.
    ///
    /// This never waits: it checks bytes already buffered and polls the stream
    /// once. While the peer is connected but quiet, this returns `false`.
    pub fn is_eof(&mut self) -> Result<bool, Error> {
        if self.eof {
            return Ok(true);
        }
        self.ensure_open()?;

        let polled = self.stream.fill_buf().now_or_never();
        match polled.map(|buf| buf.map(|buf| buf.len())) {
            Some(Ok(0)) => {
                trace!(remote = %self.remote, "end of stream");
                self.eof = true;
            }
            Some(Ok(_)) | None => {}
            Some(Err(error)) => return Err(error.into()),
        }
        Ok(self.eof)
    }

    /// Read a line terminated by `delimiter`.
    ///
    /// The delimiter is consumed but not returned. A final line cut off by the
    /// end of the stream is returned as-is. Returns `None` at end of stream.
    pub async fn read_line(&mut self, delimiter: &[u8]) -> Result<Option<Bytes>, Error> {
        self.ensure_open()?;
        let line = deadline(
            self.timeout,
            &mut self.timed_out,
            read_delimited(&mut self.stream, delimiter),
        )
        .await?;

        match line {
            Some(line) => {
                self.stats.lines_read += 1;
                Ok(Some(line))
            }
            None => {
                self.eof = true;
                Ok(None)
            }
        }
    }

    /// Read at most `max` bytes.
    ///
    /// Returns an empty chunk at end of stream.
    pub async fn read(&mut self, max: usize) -> Result<Bytes, Error> {
        self.ensure_open()?;
        self.stats.chunks_read += 1;

        let mut chunk = BytesMut::zeroed(max);
        let n = deadline(
            self.timeout,
            &mut self.timed_out,
            self.stream.read(&mut chunk),
        )
        .await?;

        if n == 0 && max > 0 {
            self.eof = true;
        }
        chunk.truncate(n);
        Ok(chunk.freeze())
    }

    /// Write all of `bytes` and flush.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.ensure_open()?;
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        self.stats.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Pipe the rest of `reader` to the stream and flush.
    pub async fn write_from<R>(&mut self, reader: &mut R) -> Result<u64, Error>
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        self.ensure_open()?;
        let n = tokio::io::copy_buf(reader, &mut self.stream).await?;
        self.stream.flush().await?;
        self.stats.bytes_written += n;
        Ok(n)
    }

    /// Shut down the stream.
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        trace!(remote = %self.remote, "closing session");

        match self.stream.get_mut().shutdown().await {
            Ok(()) => Ok(()),
            // The peer may already be gone.
            Err(error) if error.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed {
            Err(Error::NotConnected)
        } else {
            Ok(())
        }
    }
}

/// Run an I/O future under an optional timeout, recording when it elapses.
async fn deadline<F, T>(
    timeout: Option<Duration>,
    timed_out: &mut bool,
    future: F,
) -> Result<T, Error>
where
    F: Future<Output = io::Result<T>>,
{
    let Some(limit) = timeout else {
        return Ok(future.await?);
    };

    match tokio::time::timeout(limit, future).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            trace!(timeout = ?limit, "read timed out");
            *timed_out = true;
            Err(Error::ReadTimeout { timeout: limit })
        }
    }
}

/// Read up to and including `delimiter`, returning the line without it.
async fn read_delimited<R>(reader: &mut R, delimiter: &[u8]) -> io::Result<Option<Bytes>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let Some(&last) = delimiter.last() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "line delimiter must not be empty",
        ));
    };

    let mut line = Vec::new();
    loop {
        let n = reader.read_until(last, &mut line).await?;
        if n == 0 || line.ends_with(delimiter) {
            break;
        }
    }

    if line.is_empty() {
        return Ok(None);
    }

    if line.ends_with(delimiter) {
        line.truncate(line.len() - delimiter.len());
    }
    Ok(Some(Bytes::from(line)))
}

/// Sources of delimited lines, shared by the request and response framing.
pub(crate) trait LineRead {
    async fn next_line(&mut self) -> Result<Option<Bytes>, Error>;
}

impl<IO> LineRead for Session<IO>
where
    IO: PeerStream,
{
    async fn next_line(&mut self) -> Result<Option<Bytes>, Error> {
        self.read_line(CRLF).await
    }
}

impl<R> LineRead for BufReader<R>
where
    R: AsyncRead + Unpin,
{
    async fn next_line(&mut self) -> Result<Option<Bytes>, Error> {
        Ok(read_delimited(self, CRLF).await?)
    }
}

/// Read a header block: lines up to and including the first blank line.
///
/// Each line is re-terminated with CRLF. Returns an empty block if the
/// source ends before any line is read.
pub(crate) async fn read_head<R>(source: &mut R) -> Result<BytesMut, Error>
where
    R: LineRead,
{
    let mut head = BytesMut::new();
    while let Some(line) = source.next_line().await? {
        head.extend_from_slice(&line);
        head.extend_from_slice(CRLF);

        if line.iter().all(u8::is_ascii_whitespace) {
            break;
        }
    }
    Ok(head)
}
