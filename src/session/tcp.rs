//! TCP connector.
//!
//! [`TcpConnector`] is a [`tower::Service`] which resolves the host from an
//! [`OptionsSnapshot`] and opens a TCP connection to it, applying the socket
//! options from the snapshot. It is the default connector for a
//! [`Connection`](crate::Connection).

use std::future::Future;
use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, trace, warn, Instrument};

use super::PeerStream;
use crate::error::ConnectError;
use crate::options::{OptionsSnapshot, SocketOptions};

/// Opens TCP connections to the server named in the options.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    _priv: (),
}

impl TcpConnector {
    /// Create a new TCP connector.
    pub fn new() -> Self {
        Self::default()
    }
}

impl tower::Service<OptionsSnapshot> for TcpConnector {
    type Response = TcpStream;
    type Error = ConnectError;
    type Future = BoxFuture<'static, Result<TcpStream, ConnectError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, snapshot: OptionsSnapshot) -> Self::Future {
        let span = tracing::trace_span!("tcp", host = %snapshot.host(), port = snapshot.port());

        Box::pin(
            async move {
                let stream = connect_any(&snapshot).await?;

                if let Ok(peer_addr) = stream.peer_addr() {
                    trace!(peer.addr = %peer_addr, "tcp connected");
                } else {
                    trace!("tcp connected");
                }

                Ok(stream)
            }
            .instrument(span),
        )
    }
}

impl PeerStream for TcpStream {
    fn is_alive(&self) -> bool {
        let mut probe = [MaybeUninit::<u8>::uninit(); 1];
        match socket2::SockRef::from(self).peek(&mut probe) {
            // Orderly shutdown from the peer.
            Ok(0) => false,
            Ok(_) => true,
            Err(error) => error.kind() == io::ErrorKind::WouldBlock,
        }
    }

    fn remote_name(&self) -> String {
        match self.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "unknown".to_owned(),
        }
    }
}

/// Resolve the server and try each address in turn.
async fn connect_any(snapshot: &OptionsSnapshot) -> Result<TcpStream, ConnectError> {
    let authority = snapshot.authority();
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((snapshot.host(), snapshot.port()))
        .await
        .map_err(ConnectError::msg(format!("cannot resolve ({authority})")))?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match connect(&addr, snapshot) {
            Ok(connecting) => match connecting.await {
                Ok(stream) => return Ok(stream),
                Err(error) => {
                    debug!(%addr, %error, "connection attempt failed");
                    last_error = Some(error);
                }
            },
            Err(error) => last_error = Some(error),
        }
    }

    Err(match last_error {
        Some(error) => ConnectError::msg(format!("cannot connect to ({authority})"))(error),
        None => ConnectError::new(format!(
            "cannot connect to ({authority}): no addresses resolved"
        )),
    })
}

fn bind_local_address(
    socket: &socket2::Socket,
    dst_addr: &SocketAddr,
    local_addr_ipv4: &Option<Ipv4Addr>,
    local_addr_ipv6: &Option<Ipv6Addr>,
) -> io::Result<()> {
    match (*dst_addr, local_addr_ipv4, local_addr_ipv6) {
        (SocketAddr::V4(_), Some(addr), _) => {
            socket.bind(&SocketAddr::new((*addr).into(), 0).into())?;
        }
        (SocketAddr::V6(_), _, Some(addr)) => {
            socket.bind(&SocketAddr::new((*addr).into(), 0).into())?;
        }
        _ => {}
    }

    Ok(())
}

fn apply_extra_options(socket: &socket2::Socket, config: &SocketOptions) {
    for (key, value) in &config.extra {
        match key.as_str() {
            "ttl" => match value.parse::<u32>() {
                Ok(ttl) => {
                    if let Err(e) = socket.set_ttl(ttl) {
                        warn!("tcp set_ttl error: {}", e);
                    }
                }
                Err(_) => warn!(%value, "ignoring invalid ttl socket option"),
            },
            "linger" => match value.parse::<u64>() {
                Ok(secs) => {
                    if let Err(e) = socket.set_linger(Some(Duration::from_secs(secs))) {
                        warn!("tcp set_linger error: {}", e);
                    }
                }
                Err(_) => warn!(%value, "ignoring invalid linger socket option"),
            },
            _ => debug!(%key, %value, "socket option not used by tcp connector"),
        }
    }
}

#[tracing::instrument(skip(snapshot), level = "debug")]
fn connect(
    addr: &SocketAddr,
    snapshot: &OptionsSnapshot,
) -> Result<impl Future<Output = Result<TcpStream, ConnectError>>, ConnectError> {
    use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

    let config = snapshot.socket();

    let domain = Domain::for_address(*addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(ConnectError::msg("tcp open error"))?;
    tracing::trace!("tcp socket opened");

    let guard = tracing::trace_span!("socket_options").entered();

    // Tokio requires the socket to be in non-blocking mode.
    socket
        .set_nonblocking(true)
        .map_err(ConnectError::msg("tcp set_nonblocking error"))?;

    if snapshot.is_persist() {
        if let Some(dur) = config.keep_alive {
            let conf = TcpKeepalive::new().with_time(dur);
            if let Err(e) = socket.set_tcp_keepalive(&conf) {
                warn!("tcp set_keepalive error: {}", e);
            }
        }
    }

    bind_local_address(
        &socket,
        addr,
        &config.local_address_ipv4,
        &config.local_address_ipv6,
    )
    .map_err(ConnectError::msg("tcp bind local address"))?;

    if config.reuse_address {
        if let Err(e) = socket.set_reuse_address(true) {
            warn!("tcp set_reuse_address error: {}", e);
        }
    }

    if let Some(size) = config.send_buffer_size {
        if let Err(e) = socket.set_send_buffer_size(size) {
            warn!("tcp set_send_buffer_size error: {}", e);
        }
    }

    if let Some(size) = config.recv_buffer_size {
        if let Err(e) = socket.set_recv_buffer_size(size) {
            warn!("tcp set_recv_buffer_size error: {}", e);
        }
    }

    apply_extra_options(&socket, config);

    drop(guard);

    let socket = TcpSocket::from_std_stream(socket.into());
    let connect_timeout = config.connect_timeout;
    let nodelay = config.nodelay;

    let span = tracing::trace_span!("tcp", remote.addr = %addr);
    let connect = socket.connect(*addr).instrument(span);
    Ok(async move {
        let stream = match connect_timeout {
            Some(dur) => match tokio::time::timeout(dur, connect).await {
                Ok(Ok(s)) => Ok(s),
                Ok(Err(e)) => Err(e),
                Err(e) => {
                    tracing::trace!(timeout=?dur, "connection timed out");
                    Err(io::Error::new(io::ErrorKind::TimedOut, e))
                }
            },
            None => connect.await,
        }
        .map_err(ConnectError::msg("tcp connect error"))?;

        if let Err(e) = stream.set_nodelay(nodelay) {
            warn!("tcp set_nodelay error: {}", e);
        }

        Ok(stream)
    })
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;
    use tower::ServiceExt as _;

    use super::*;
    use crate::options::Options;

    #[tokio::test]
    async fn tcp_connects_to_listener() {
        let _ = tracing_subscriber::fmt::try_init();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let options = Options::new(format!("http://127.0.0.1:{port}")).with_extra("ttl", "32");
        let snapshot = OptionsSnapshot::capture(&options).unwrap();

        let (stream, accepted) = tokio::join!(
            async { TcpConnector::new().oneshot(snapshot).await.unwrap() },
            async { listener.accept().await.unwrap().0 }
        );

        assert_eq!(
            stream.remote_name(),
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port).to_string()
        );
        assert!(stream.is_alive());
        assert!(stream.nodelay().unwrap());

        let mut accepted = accepted;
        accepted.shutdown().await.unwrap();
        drop(accepted);

        // Wait for the shutdown to reach the client.
        stream.readable().await.unwrap();
        assert!(!stream.is_alive());
    }

    #[tokio::test]
    async fn tcp_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let snapshot =
            OptionsSnapshot::capture(&Options::new(format!("http://127.0.0.1:{port}"))).unwrap();
        let err = TcpConnector::new().oneshot(snapshot).await.unwrap_err();
        assert!(err
            .to_string()
            .starts_with(&format!("cannot connect to (127.0.0.1:{port})")));
        assert!(!err.is_invalid_url());
    }
}
