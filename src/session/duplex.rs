//! In-memory duplex connector.
//!
//! [`pair`] creates a [`DuplexConnector`], which can be handed to a
//! [`Connection`](crate::Connection) in place of a TCP connector, and a
//! [`DuplexIncoming`], which accepts the server side of each connection.
//!
//! Both halves must make progress together: the connector waits until the
//! incoming side accepts the connection.
//!
//! ```
//! # use sockline::session::duplex;
//! # use sockline::{Connection, Options};
//! # use tokio::io::AsyncWriteExt as _;
//! # async fn demo() {
//! let (connector, mut incoming) = duplex::pair(1024);
//! let mut connection = Connection::with_connector(Options::new("tcp://example.com"), connector);
//!
//! tokio::spawn(async move {
//!     let mut stream = incoming.accept().await.unwrap();
//!     stream.write_all(b"HTTP/1.1 200 OK\r\n\r\nhello").await.unwrap();
//!     stream.shutdown().await.unwrap();
//! });
//!
//! let response = connection.send("GET / HTTP/1.1\r\n\r\n").await.unwrap();
//! assert_eq!(response.body().unwrap().as_ref(), b"hello");
//! # }
//! ```

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_util::future::BoxFuture;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use super::PeerStream;
use crate::error::ConnectError;
use crate::options::OptionsSnapshot;

/// One end of an in-memory stream.
#[derive(Debug)]
#[pin_project]
pub struct DuplexStream {
    #[pin]
    inner: tokio::io::DuplexStream,
    remote: String,
}

impl DuplexStream {
    /// Create a connected pair of streams.
    ///
    /// Each side buffers at most `max_buf_size` bytes before writes wait for
    /// the other side to read.
    pub fn new(max_buf_size: usize) -> (Self, Self) {
        Self::named(max_buf_size, "duplex-server", "duplex-client")
    }

    /// The first stream reports `server` as its peer, the second `client`.
    fn named(max_buf_size: usize, server: &str, client: &str) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(max_buf_size);
        (
            DuplexStream {
                inner: a,
                remote: server.to_owned(),
            },
            DuplexStream {
                inner: b,
                remote: client.to_owned(),
            },
        )
    }
}

impl PeerStream for DuplexStream {
    fn is_alive(&self) -> bool {
        true
    }

    fn remote_name(&self) -> String {
        self.remote.clone()
    }
}

impl AsyncRead for DuplexStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl AsyncWrite for DuplexStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Connector which creates in-memory streams.
#[derive(Debug, Clone)]
pub struct DuplexConnector {
    sender: tokio::sync::mpsc::Sender<ConnectionRequest>,
    max_buf_size: usize,
}

impl tower::Service<OptionsSnapshot> for DuplexConnector {
    type Response = DuplexStream;
    type Error = ConnectError;
    type Future = BoxFuture<'static, Result<DuplexStream, ConnectError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, snapshot: OptionsSnapshot) -> Self::Future {
        let sender = self.sender.clone();
        let max_buf_size = self.max_buf_size;

        Box::pin(async move {
            let authority = snapshot.authority();
            let (tx, rx) = tokio::sync::oneshot::channel();
            let request = ConnectionRequest {
                ack: tx,
                max_buf_size,
                remote: format!("duplex://{authority}"),
                snapshot: snapshot.clone(),
            };

            sender
                .send(request)
                .await
                .map_err(|_| ConnectError::new(format!("cannot connect to ({authority})")))?;

            let accepted = async {
                rx.await
                    .map_err(|_| ConnectError::new(format!("connection to ({authority}) reset")))
            };

            match snapshot.socket().connect_timeout {
                Some(limit) => tokio::time::timeout(limit, accepted).await.map_err(
                    ConnectError::msg(format!("cannot connect to ({authority})")),
                )?,
                None => accepted.await,
            }
        })
    }
}

/// Gets sent to the incoming side to create a connection.
struct ConnectionRequest {
    ack: tokio::sync::oneshot::Sender<DuplexStream>,
    max_buf_size: usize,
    remote: String,
    snapshot: OptionsSnapshot,
}

impl ConnectionRequest {
    /// Hand the client half to the waiting connector.
    fn ack(self) -> Result<Accepted, io::Error> {
        let (client_end, server_end) =
            DuplexStream::named(self.max_buf_size, &self.remote, "duplex-client");
        self.ack
            .send(client_end)
            .map_err(|_| io::ErrorKind::ConnectionReset)?;
        trace!(remote = %self.remote, "duplex connection accepted");
        Ok(Accepted {
            stream: server_end,
            snapshot: self.snapshot,
        })
    }
}

/// The server side of an accepted connection, with the client's options.
#[derive(Debug)]
pub struct Accepted {
    /// Stream connected to the client.
    pub stream: DuplexStream,

    /// The options the client connected with.
    pub snapshot: OptionsSnapshot,
}

/// Accepts connections made through the paired [`DuplexConnector`].
#[derive(Debug)]
pub struct DuplexIncoming {
    receiver: tokio::sync::mpsc::Receiver<ConnectionRequest>,
}

impl DuplexIncoming {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Result<DuplexStream, io::Error> {
        self.accept_with_options().await.map(|accepted| accepted.stream)
    }

    /// Wait for the next connection, keeping the client's options.
    pub async fn accept_with_options(&mut self) -> Result<Accepted, io::Error> {
        match self.receiver.recv().await {
            Some(request) => request.ack(),
            None => Err(io::ErrorKind::ConnectionReset.into()),
        }
    }
}

impl futures_util::Stream for DuplexIncoming {
    type Item = Result<Accepted, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(request) = ready!(self.receiver.poll_recv(cx)) {
            Poll::Ready(Some(request.ack()))
        } else {
            Poll::Ready(None)
        }
    }
}

/// Create a connector and incoming pair.
///
/// The connector can be cloned cheaply; each connection gets its own stream
/// with room for `max_buf_size` bytes in flight.
pub fn pair(max_buf_size: usize) -> (DuplexConnector, DuplexIncoming) {
    let (sender, receiver) = tokio::sync::mpsc::channel(32);
    (
        DuplexConnector {
            sender,
            max_buf_size,
        },
        DuplexIncoming { receiver },
    )
}
