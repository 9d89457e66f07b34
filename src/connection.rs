//! The exchange driver.
//!
//! A [`Connection`] owns at most one live socket session. Each call to
//! [`Connection::send`] writes one request and reads the matching response,
//! reconnecting first if the previous session is gone. Responses are framed
//! by the header block (terminated by a blank line) and then by end of stream:
//! the body is everything the peer sends until it closes its side.
//!
//! A peer which keeps the stream open after the body holds the body loop open
//! until the read timeout fires, so a non-zero timeout is recommended when the
//! peer can't be relied on to close.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tower::{Service, ServiceExt as _};
use tracing::{debug, trace, warn};

use crate::buffer::ScratchBuffer;
use crate::error::{ConnectError, Error, TransportCallError};
use crate::exchange::{Exchange, Response};
use crate::hooks::{
    BeforeSendFn, Continuation, HeaderReceivedFn, HookContext, Registry, ResponseCompleteFn,
};
use crate::options::{Options, OptionsSnapshot};
use crate::payload::Payload;
use crate::session::{read_head, PeerStream, Session, SessionStats};

#[cfg(feature = "tcp")]
use crate::session::tcp::TcpConnector;

/// Bytes requested per body read.
const CHUNK_SIZE: usize = 1024;

/// Lifecycle of the socket owned by a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket is open.
    Disconnected,

    /// A connection attempt is in progress, or was abandoned before it
    /// finished.
    Connecting,

    /// A socket is open and the options snapshot is frozen.
    Connected,
}

/// Receive progress for one exchange.
enum Progress {
    /// The header hooks left the exchange open, so the body follows.
    AwaitingBody,

    /// A header hook marked the exchange complete.
    HeadersOnly,
}

struct Live<IO> {
    session: Session<IO>,
    snapshot: OptionsSnapshot,
}

/// A single-connection transport which sends requests and reads responses.
///
/// Options can be changed at any time with [`options_mut`](Self::options_mut),
/// but a connected session keeps the snapshot it was opened with until it is
/// closed and reopened.
pub struct Connection<C>
where
    C: Service<OptionsSnapshot>,
{
    options: Options,
    connector: C,
    state: ConnectionState,
    live: Option<Live<C::Response>>,
    in_flight: bool,
    consumed: bool,
    scratch: ScratchBuffer,
    exchange: Exchange,
    last: Option<Arc<Response>>,
    before_send: Registry<BeforeSendFn>,
    header_received: Registry<HeaderReceivedFn>,
    response_complete: Registry<ResponseCompleteFn>,
}

impl<C> fmt::Debug for Connection<C>
where
    C: Service<OptionsSnapshot>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("options", &self.options)
            .field("state", &self.state)
            .field("snapshot", &self.live.as_ref().map(|live| &live.snapshot))
            .field("before_send", &self.before_send)
            .field("header_received", &self.header_received)
            .field("response_complete", &self.response_complete)
            .finish()
    }
}

#[cfg(feature = "tcp")]
impl Connection<TcpConnector> {
    /// Create a connection which connects over TCP.
    ///
    /// No socket is opened until the first [`send`](Self::send) or
    /// [`connect`](Self::connect).
    pub fn new(options: Options) -> Self {
        Self::with_connector(options, TcpConnector::new())
    }
}

impl<C> Connection<C>
where
    C: Service<OptionsSnapshot, Error = ConnectError>,
    C::Response: PeerStream,
{
    /// Create a connection which opens its sessions with `connector`.
    pub fn with_connector(options: Options, connector: C) -> Self {
        Self {
            options,
            connector,
            state: ConnectionState::Disconnected,
            live: None,
            in_flight: false,
            consumed: false,
            scratch: ScratchBuffer::new(),
            exchange: Exchange::default(),
            last: None,
            before_send: Registry::new(),
            header_received: Registry::new(),
            response_complete: Registry::new(),
        }
    }

    /// The options in effect.
    ///
    /// While connected these are the options captured at connect time, not
    /// any later edits.
    pub fn options(&self) -> &Options {
        match &self.live {
            Some(live) => live.snapshot.options(),
            None => &self.options,
        }
    }

    /// Edit the options used for the next connect.
    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    /// The snapshot of the open session, if connected.
    pub fn snapshot(&self) -> Option<&OptionsSnapshot> {
        self.live.as_ref().map(|live| &live.snapshot)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True if a session is open and the peer appears live.
    pub fn is_connected(&self) -> bool {
        self.live
            .as_ref()
            .is_some_and(|live| live.session.is_alive())
    }

    /// Name of the remote peer, if connected.
    pub fn remote_name(&self) -> Option<&str> {
        self.live.as_ref().map(|live| live.session.remote_name())
    }

    /// The buffer holding the most recent response body.
    pub fn scratch(&self) -> &ScratchBuffer {
        &self.scratch
    }

    /// Counters for the open session.
    pub fn session_stats(&self) -> Option<SessionStats> {
        self.live.as_ref().map(|live| live.session.stats())
    }

    /// Record of the most recent request.
    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    /// The result of the most recent exchange, if it completed.
    pub fn last_response(&self) -> Option<&Arc<Response>> {
        self.last.as_ref()
    }

    /// Hooks run before each request is written.
    pub fn before_send(&mut self) -> &mut Registry<BeforeSendFn> {
        &mut self.before_send
    }

    /// Hooks run once each response header block is read.
    pub fn on_header_received(&mut self) -> &mut Registry<HeaderReceivedFn> {
        &mut self.header_received
    }

    /// Hooks run once each response body is read.
    pub fn on_response_complete(&mut self) -> &mut Registry<ResponseCompleteFn> {
        &mut self.response_complete
    }

    /// Open a new session, closing any open one first.
    ///
    /// The current options are captured into a snapshot which stays fixed
    /// for the life of the session.
    pub async fn connect(&mut self) -> Result<(), Error> {
        self.close().await?;

        let snapshot = OptionsSnapshot::capture(&self.options)?;
        self.state = ConnectionState::Connecting;
        debug!(server = %snapshot.authority(), "connecting");

        let stream = match self.open(snapshot.clone()).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(server = %snapshot.authority(), %error, "connect failed");
                self.state = ConnectionState::Disconnected;
                return Err(error.into());
            }
        };

        let session = Session::new(stream, &snapshot);
        debug!(remote = %session.remote_name(), persist = snapshot.is_persist(), "connected");
        self.live = Some(Live { session, snapshot });
        self.state = ConnectionState::Connected;
        Ok(())
    }

    async fn open(&mut self, snapshot: OptionsSnapshot) -> Result<C::Response, ConnectError> {
        self.connector.ready().await?.call(snapshot).await
    }

    /// Close the session, if one is open.
    ///
    /// Closing releases the socket and drops the snapshot, so the next
    /// connect picks up the latest options.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.state = ConnectionState::Disconnected;
        self.in_flight = false;
        self.consumed = false;

        match self.live.take() {
            Some(mut live) => {
                trace!(remote = %live.session.remote_name(), "closing connection");
                live.session.close().await
            }
            None => Ok(()),
        }
    }

    /// Send a request and read the response.
    ///
    /// The request's header block is written first, then the rest of the
    /// payload is piped to the socket. The response is cached until the
    /// next `send`, and is also returned by [`receive`](Self::receive).
    pub async fn send(&mut self, payload: impl Into<Payload>) -> Result<Arc<Response>, Error> {
        self.last = None;
        self.scratch.reset();

        if self.in_flight {
            debug!("previous exchange did not finish, reconnecting");
            self.close().await?;
        }

        if !self.is_connected() {
            self.connect().await?;
        }

        let Some(live) = self.live.as_mut() else {
            return Err(Error::NotConnected);
        };
        self.in_flight = true;

        let remote = live.session.remote_name().to_owned();
        let cx = HookContext::new(&live.snapshot, &remote);
        let payload = self
            .before_send
            .run(payload.into(), &cx)
            .map_err(|error| TransportCallError::new(remote.as_str(), error))?;

        let mut reader = payload.into_reader();
        let written: Result<Exchange, Error> = async {
            let head = read_head(&mut reader).await?.freeze();
            live.session.write(&head).await?;
            let body = live.session.write_from(&mut reader).await?;
            trace!(head = head.len(), body, "request written");
            Ok(Exchange::new(head))
        }
        .await;

        self.exchange = written.map_err(|error| TransportCallError::new(remote.as_str(), error))?;
        self.consumed = false;

        let response = self.receive().await?;
        self.in_flight = false;
        Ok(response)
    }

    /// Read the response to the request just sent.
    ///
    /// Once a response has been read it is cached, and later calls return
    /// the same value without touching the socket. The head is read at most
    /// once per exchange: if reading or a hook fails after that point, later
    /// calls fail with [`Error::ResponseConsumed`] until the next
    /// [`send`](Self::send).
    pub async fn receive(&mut self) -> Result<Arc<Response>, Error> {
        if let Some(last) = &self.last {
            return Ok(last.clone());
        }

        // Body chunks land at the write cursor, so that is where this
        // exchange's body starts.
        let resume = self.scratch.write_cursor();

        let Some(live) = self.live.as_mut() else {
            return Err(Error::NotConnected);
        };

        if live.session.is_timed_out() {
            return Err(Error::ReadTimeout {
                timeout: live.snapshot.timeout(),
            });
        }

        if self.consumed {
            return Err(Error::ResponseConsumed);
        }
        self.consumed = true;

        let head = read_head(&mut live.session).await?.freeze();
        if head.is_empty() {
            debug!(remote = %live.session.remote_name(), "peer closed without responding");
            return Err(Error::EmptyResponse);
        }
        trace!(len = head.len(), "response head received");

        let mut continuation = Continuation::default();
        let response = self
            .header_received
            .run(Response::new(head), &self.exchange, &mut continuation)?;

        let progress = if continuation.is_done() {
            Progress::HeadersOnly
        } else {
            Progress::AwaitingBody
        };

        let body = match progress {
            Progress::AwaitingBody => {
                loop {
                    let chunk = live.session.read(CHUNK_SIZE).await?;
                    if chunk.is_empty() {
                        break;
                    }
                    self.scratch.append(&chunk);
                }
                let body = self.scratch.replay(resume);
                trace!(len = body.len(), "response body received");
                Some(body)
            }
            Progress::HeadersOnly => {
                trace!("response complete after headers");
                None
            }
        };

        let persist = live.snapshot.is_persist();
        let response = self.complete(response, body)?;

        let response = Arc::new(response);
        self.last = Some(response.clone());

        if !persist {
            if let Err(error) = self.close().await {
                debug!(%error, "error closing connection after exchange");
            }
        }

        Ok(response)
    }

    fn complete(&mut self, mut response: Response, body: Option<Bytes>) -> Result<Response, Error> {
        response.set_body(body.clone());
        self.response_complete
            .run(response, body.as_ref(), &self.exchange)
    }
}
