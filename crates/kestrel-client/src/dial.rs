//! Opening byte streams to cluster nodes.
//!
//! The session never touches sockets directly; it asks a [`Dialer`] for a
//! stream to an address. Production code uses [`TcpDialer`], tests plug in
//! in-memory pipes.

use std::future::Future;
use std::io;
use std::time::Duration;

use kestrel_core::config::ConnectionConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Error, Result};

/// Opens a byte stream to a node address.
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn dial(&self, addr: &str) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Dials plain TCP with a connect timeout.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
    nodelay: bool,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration, nodelay: bool) -> Self {
        Self {
            connect_timeout,
            nodelay,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Result<Self> {
        let timeout = config
            .connect_timeout()
            .map_err(|e| Error::Config(format!("{e:#}")))?;
        Ok(Self::new(timeout, config.nodelay))
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), true)
    }
}

impl Dialer for TcpDialer {
    type Stream = TcpStream;

    fn dial(&self, addr: &str) -> impl Future<Output = io::Result<TcpStream>> + Send {
        let addr = addr.to_string();
        let timeout = self.connect_timeout;
        let nodelay = self.nodelay;

        async move {
            let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {addr} timed out after {timeout:?}"),
                    )
                })??;
            stream.set_nodelay(nodelay)?;
            debug!(%addr, "tcp connection established");
            Ok(stream)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dials_a_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let dialer = TcpDialer::default();
        let (stream, accepted) = tokio::join!(dialer.dial(&addr), listener.accept());
        let stream = stream.unwrap();
        accepted.unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(TcpDialer::default().dial(&addr).await.is_err());
    }

    #[test]
    fn bad_timeout_in_config_is_rejected() {
        let config = ConnectionConfig {
            connect_timeout: "later".into(),
            ..Default::default()
        };
        assert!(matches!(TcpDialer::from_config(&config), Err(Error::Config(_))));
    }
}
