//! Connection options.
//!
//! [`Options`] is the mutable configuration held by a
//! [`Connection`](crate::Connection). When a connection is established, the
//! options are copied into an [`OptionsSnapshot`], which stays frozen for the
//! lifetime of that connection. Changing [`Options`] afterwards only takes
//! effect on the next connect.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use http::Uri;

use crate::error::ConnectError;

/// Port used when the server URL does not name one.
pub const DEFAULT_PORT: u16 = 80;

/// Read timeout used by [`Options::default`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a connection.
#[derive(Debug, Clone)]
pub struct Options {
    /// The server to connect to, e.g. `http://example.com:8080/`.
    pub server_url: Option<String>,

    /// How long a single read may block. Zero disables the timeout.
    pub timeout: Duration,

    /// Keep the connection open between exchanges.
    pub persist: bool,

    /// Socket level options.
    pub socket: SocketOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            server_url: None,
            timeout: DEFAULT_TIMEOUT,
            persist: false,
            socket: SocketOptions::default(),
        }
    }
}

impl Options {
    /// Options for the given server URL, with everything else defaulted.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::default().with_server_url(server_url)
    }

    /// Set the server URL.
    pub fn with_server_url(mut self, server_url: impl Into<String>) -> Self {
        self.server_url = Some(server_url.into());
        self
    }

    /// Set the read timeout. Zero disables the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the read timeout in whole seconds. Zero disables the timeout.
    pub fn with_timeout_secs(self, seconds: u64) -> Self {
        self.with_timeout(Duration::from_secs(seconds))
    }

    /// Keep the connection open between exchanges.
    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Replace the socket options.
    pub fn with_socket(mut self, socket: SocketOptions) -> Self {
        self.socket = socket;
        self
    }

    /// Add an opaque option which is passed through to the connector.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.socket.extra.insert(key.into(), value.into());
        self
    }
}

/// Socket options applied when connecting.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// The timeout for connecting to a remote address.
    pub connect_timeout: Option<Duration>,

    /// Keep-alive idle time, applied to persistent connections.
    pub keep_alive: Option<Duration>,

    /// The local IPv4 address to bind to.
    pub local_address_ipv4: Option<Ipv4Addr>,

    /// The local IPv6 address to bind to.
    pub local_address_ipv6: Option<Ipv6Addr>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,

    /// Whether to reuse the local address.
    pub reuse_address: bool,

    /// The size of the send buffer.
    pub send_buffer_size: Option<usize>,

    /// The size of the receive buffer.
    pub recv_buffer_size: Option<usize>,

    /// Connector specific options, passed through uninterpreted.
    pub extra: BTreeMap<String, String>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            keep_alive: Some(Duration::from_secs(90)),
            local_address_ipv4: None,
            local_address_ipv6: None,
            nodelay: true,
            reuse_address: true,
            send_buffer_size: None,
            recv_buffer_size: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Frozen copy of [`Options`], taken when a connection is established.
///
/// Snapshots are cheap to clone and can't be modified.
#[derive(Clone)]
pub struct OptionsSnapshot {
    inner: Arc<Snapshot>,
}

struct Snapshot {
    options: Options,
    uri: Uri,
    host: Box<str>,
    port: u16,
}

impl fmt::Debug for OptionsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionsSnapshot")
            .field("uri", &self.inner.uri)
            .field("timeout", &self.inner.options.timeout)
            .field("persist", &self.inner.options.persist)
            .finish()
    }
}

impl OptionsSnapshot {
    /// Capture the options, validating the server URL.
    pub fn capture(options: &Options) -> Result<Self, ConnectError> {
        let url = options
            .server_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ConnectError::url("server url is mandatory for connect"))?;

        let uri: Uri = url
            .trim()
            .parse()
            .map_err(|error| ConnectError::url(format!("cannot parse server url `{url}`: {error}")))?;

        let (host, port) = host_and_port(&uri)?;

        Ok(Self {
            inner: Arc::new(Snapshot {
                options: options.clone(),
                uri,
                host,
                port,
            }),
        })
    }

    /// The parsed server URL.
    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    /// Host name or address to connect to.
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Port to connect to.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// `host:port`, suitable for display.
    pub fn authority(&self) -> String {
        if self.inner.host.contains(':') {
            format!("[{}]:{}", self.inner.host, self.inner.port)
        } else {
            format!("{}:{}", self.inner.host, self.inner.port)
        }
    }

    /// The configured timeout; zero means no timeout.
    pub fn timeout(&self) -> Duration {
        self.inner.options.timeout
    }

    /// The read timeout, or `None` when reads may block forever.
    pub fn read_timeout(&self) -> Option<Duration> {
        Some(self.inner.options.timeout).filter(|timeout| !timeout.is_zero())
    }

    /// Whether the connection is kept open between exchanges.
    pub fn is_persist(&self) -> bool {
        self.inner.options.persist
    }

    /// The socket options.
    pub fn socket(&self) -> &SocketOptions {
        &self.inner.options.socket
    }

    /// The full options this snapshot was taken from.
    pub fn options(&self) -> &Options {
        &self.inner.options
    }
}

fn host_and_port(uri: &Uri) -> Result<(Box<str>, u16), ConnectError> {
    let host = uri
        .host()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| ConnectError::url(format!("server url `{uri}` has no host")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = uri.port_u16().unwrap_or(DEFAULT_PORT);
    Ok((host.into(), port))
}
