//! Errors reported by the transport.
//!
//! Every failure surfaces as an [`Error`]. Connection setup failures carry a
//! [`ConnectError`], and failures while preparing or writing a request are
//! wrapped in a [`TransportCallError`] which names the remote peer.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::hooks::Stage;
use crate::BoxError;

/// Transport error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The server URL was missing or invalid, or the connection attempt failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// A read did not complete within the configured timeout.
    #[error("read timed out after {} seconds", .timeout.as_secs())]
    ReadTimeout {
        /// The timeout that was exceeded.
        timeout: Duration,
    },

    /// The peer closed the stream before sending any header bytes.
    #[error("server did not respond")]
    EmptyResponse,

    /// Preparing or writing the request failed.
    #[error(transparent)]
    Call(#[from] TransportCallError),

    /// A header or completion hook returned an error.
    #[error("{stage} hook `{name}` failed: {source}")]
    Hook {
        /// The protocol point at which the hook ran.
        stage: Stage,

        /// The name the hook was registered with.
        name: String,

        /// The error returned by the hook.
        #[source]
        source: BoxError,
    },

    /// There is no open connection to read from or write to.
    #[error("not connected")]
    NotConnected,

    /// An earlier receive for this exchange started reading the response and
    /// failed, so the response can't be read again.
    #[error("response for this exchange was already consumed")]
    ResponseConsumed,

    /// An I/O error occured while receiving.
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True if this error was caused by a read timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ReadTimeout { .. })
    }

    /// True if this error was raised while connecting.
    pub fn is_connect(&self) -> bool {
        matches!(self, Error::Connect(_))
    }
}

/// Error raised when a connection can't be established.
#[derive(Debug, Error)]
pub struct ConnectError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ConnectError {
    pub(crate) fn new<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn url<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            source: Some(InvalidUrl { _priv: () }.into()),
        }
    }

    pub(crate) fn msg<S, E>(message: S) -> impl FnOnce(E) -> Self
    where
        S: Into<String>,
        E: Into<BoxError>,
    {
        move |error| Self {
            message: message.into(),
            source: Some(error.into()),
        }
    }

    /// True if the server URL was missing or could not be used.
    pub fn is_invalid_url(&self) -> bool {
        self.source
            .as_ref()
            .is_some_and(|source| source.is::<InvalidUrl>())
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref source) = self.source {
            write!(f, "{}: {}", self.message, source)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Marker source for URL problems.
#[derive(Debug, Error)]
#[error("invalid server url")]
pub struct InvalidUrl {
    _priv: (),
}

/// Error raised while running pre-send hooks or writing a request.
#[derive(Debug, Error)]
#[error("request call error when sending to server ({remote})")]
pub struct TransportCallError {
    remote: String,
    #[source]
    source: BoxError,
}

impl TransportCallError {
    pub(crate) fn new<E>(remote: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self {
            remote: remote.into(),
            source: source.into(),
        }
    }

    /// Name of the remote peer the request was sent to.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// The underlying cause.
    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.source
    }
}
