//! TCP listeners and connection handling
//!
//! Both TCP channels (push and query) share the same accept loop: every
//! inbound connection gets its own task and a child cancellation token.

use crate::core::BlockError;
use crate::network::framing::FramingError;
use std::future::Future;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Errors on the TCP channels
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("Block error: {0}")]
    Block(#[from] BlockError),
    #[error("Connection closed before a response arrived")]
    ConnectionClosed,
    #[error("Timed out")]
    Timeout,
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// TCP server for one channel
pub struct Server {
    name: &'static str,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind a listener. Port 0 picks an ephemeral port.
    pub async fn bind(name: &'static str, addr: SocketAddr) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("{} server listening on {}", name, local_addr);

        Ok(Self {
            name,
            listener,
            local_addr,
        })
    }

    /// Get the listening address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the listening port
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Accept incoming connections
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        self.listener.accept().await
    }

    /// Accept connections until `shutdown` fires, running `handler` for each
    /// on its own task. On shutdown every connection task is cancelled and
    /// awaited before returning.
    pub async fn serve<F, Fut>(self, shutdown: CancellationToken, handler: F)
    where
        F: Fn(TcpStream, SocketAddr, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("{} connection from {}", self.name, addr);
                        connections.spawn(handler(stream, addr, shutdown.child_token()));
                    }
                    Err(e) => log::error!("{} accept error: {}", self.name, e),
                },
                // Reap finished connection tasks as we go
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        while connections.join_next().await.is_some() {}
        log::info!("{} server on {} stopped", self.name, self.local_addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = Server::bind("test", SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        assert_ne!(server.port(), 0);
        assert_eq!(server.local_addr().port(), server.port());
    }

    #[tokio::test]
    async fn test_serve_runs_handler_and_stops() {
        let server = Server::bind("test", SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = server.local_addr();
        let handled = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let serving = {
            let handled = handled.clone();
            tokio::spawn(server.serve(shutdown.clone(), move |mut stream, _, conn_shutdown| {
                let handled = handled.clone();
                async move {
                    handled.fetch_add(1, Ordering::SeqCst);
                    let mut buf = [0u8; 1];
                    // Held open until the server shuts down
                    tokio::select! {
                        _ = conn_shutdown.cancelled() => {}
                        _ = stream.read(&mut buf) => {}
                    }
                }
            }))
        };

        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        while handled.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_error() {
        let first = Server::bind("test", SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        assert!(Server::bind("test", first.local_addr()).await.is_err());
    }
}
