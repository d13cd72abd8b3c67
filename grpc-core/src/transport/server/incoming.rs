use std::{io, net::SocketAddr, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

/// A bound TCP listener plus the per-socket options applied to every accepted connection.
#[derive(Debug)]
pub struct TcpIncoming {
    listener: TcpListener,
    nodelay: bool,
    keepalive: Option<Duration>,
}

impl TcpIncoming {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::from_listener(TcpListener::bind(addr).await?))
    }

    pub fn from_listener(listener: TcpListener) -> Self {
        Self {
            listener,
            nodelay: true,
            keepalive: None,
        }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Enables TCP-level (SO_KEEPALIVE) probing on accepted sockets; independent of the HTTP/2
    /// PING keepalive.
    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts the next connection, applying socket options. Transient option failures are
    /// logged and the connection is still served.
    pub(crate) async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;

        if self.nodelay {
            if let Err(error) = stream.set_nodelay(true) {
                warn!(%error, "failed to set TCP_NODELAY on accepted connection");
            }
        }
        if let Some(dur) = self.keepalive {
            let sock = socket2::SockRef::from(&stream);
            let keepalive = socket2::TcpKeepalive::new().with_time(dur);
            if let Err(error) = sock.set_tcp_keepalive(&keepalive) {
                warn!(%error, "failed to set TCP keepalive on accepted connection");
            }
        }

        Ok((stream, peer))
    }
}
