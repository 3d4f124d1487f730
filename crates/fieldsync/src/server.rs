//! Replication server.
//!
//! Accepts TCP connections and runs one task per connection. Connection
//! tasks are independent: a failing session never stops the accept loop.

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::Result;

/// A running accept loop.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind to `addr` and hand every accepted connection to `on_connection`.
    pub async fn bind<F, Fut>(addr: SocketAddr, on_connection: F) -> Result<Self>
    where
        F: Fn(TcpStream, SocketAddr) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "replication server listening");

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, on_connection, shutdown_rx));

        Ok(Self {
            local_addr,
            shutdown: Some(shutdown),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, abort open connections and wait for them to end.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!("replication server panicked");
                }
            }
        }
        info!(addr = %self.local_addr, "replication server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn accept_loop<F, Fut>(
    listener: TcpListener,
    on_connection: F,
    mut shutdown: oneshot::Receiver<()>,
) where
    F: Fn(TcpStream, SocketAddr) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "accepted connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                    }
                    connections.spawn(on_connection(stream, peer));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!("connection task panicked");
                    }
                }
            }
        }
    }

    debug!(open = connections.len(), "closing connections");
    connections.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn localhost() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    #[tokio::test]
    async fn test_connections_are_handled_independently() {
        let served = Arc::new(AtomicUsize::new(0));
        let counter = served.clone();
        let server = Server::bind(localhost(), move |mut stream, _| {
            let counter = counter.clone();
            async move {
                let mut byte = [0u8; 1];
                if stream.read_exact(&mut byte).await.is_err() {
                    return;
                }
                if byte[0] == 0 {
                    panic!("bad client");
                }
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = stream.write_all(&byte).await;
            }
        })
        .await
        .unwrap();

        let mut bad = TcpStream::connect(server.local_addr()).await.unwrap();
        bad.write_all(&[0]).await.unwrap();

        let mut good = TcpStream::connect(server.local_addr()).await.unwrap();
        good.write_all(&[7]).await.unwrap();
        let mut echo = [0u8; 1];
        good.read_exact(&mut echo).await.unwrap();
        assert_eq!(echo, [7]);
        assert_eq!(served.load(Ordering::SeqCst), 1);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_ends_open_connections() {
        let server = Server::bind(localhost(), |mut stream, _| async move {
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf).await;
        })
        .await
        .unwrap();
        let addr = server.local_addr();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        server.shutdown().await;

        let mut buf = Vec::new();
        let read = client.read_to_end(&mut buf).await;
        assert!(matches!(read, Ok(0)) || read.is_err());
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
