//! Duplex message channels.
//!
//! Replication and the handshake talk to a [`Channel`]: a mux sub-stream
//! over a live connection, or an in-process pair when replicating against a
//! syncfile container.
//!
//! Both directions are windowed: at most [`limits::STREAM_WINDOW`] messages
//! are in flight per direction and `send` waits for room. A peer that only
//! ever sends while the other side only ever sends would therefore stall, so
//! replication loops wait on [`Channel::next_event`] and keep draining the
//! remote while they have something to send.
//!
//! [`limits::STREAM_WINDOW`]: crate::messages::limits::STREAM_WINDOW

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Result, SyncError};

/// What [`Channel::next_event`] woke up for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A message arrived, or `None` if the remote closed its sending half.
    Received(Option<Bytes>),
    /// The next `send` will not wait.
    Writable,
}

/// An ordered, reliable, duplex stream of messages.
#[async_trait]
pub trait Channel: Send {
    /// Send one message, waiting while the window is full.
    async fn send(&mut self, message: Bytes) -> Result<()>;

    /// Receive the next message. `Ok(None)` means the remote closed its
    /// sending half cleanly.
    async fn recv(&mut self) -> Result<Option<Bytes>>;

    /// Wait until a message arrives or, when `sending` is set, until there
    /// is room for one more outgoing message. Cancel-safe: room that was
    /// reserved stays reserved for the next `send`.
    async fn next_event(&mut self, sending: bool) -> Result<Event>;

    /// Close the sending half. Further sends fail; receiving still works.
    async fn close(&mut self) -> Result<()>;
}

/// In-process channel pairs.
pub mod memory {
    use super::*;
    use crate::messages::limits;
    use tokio::sync::mpsc;

    /// One end of an in-memory channel pair.
    #[derive(Debug)]
    pub struct MemoryChannel {
        tx: Option<mpsc::Sender<Bytes>>,
        reserved: Option<mpsc::OwnedPermit<Bytes>>,
        rx: mpsc::Receiver<Bytes>,
    }

    /// Create two connected ends with the default window.
    pub fn pair() -> (MemoryChannel, MemoryChannel) {
        pair_with_window(limits::STREAM_WINDOW)
    }

    /// Create two connected ends holding at most `window` messages per
    /// direction.
    pub fn pair_with_window(window: usize) -> (MemoryChannel, MemoryChannel) {
        let window = window.max(1);
        let (a_tx, b_rx) = mpsc::channel(window);
        let (b_tx, a_rx) = mpsc::channel(window);
        (MemoryChannel::new(a_tx, a_rx), MemoryChannel::new(b_tx, b_rx))
    }

    impl MemoryChannel {
        fn new(tx: mpsc::Sender<Bytes>, rx: mpsc::Receiver<Bytes>) -> Self {
            Self {
                tx: Some(tx),
                reserved: None,
                rx,
            }
        }

        fn sender(&self) -> Result<&mpsc::Sender<Bytes>> {
            self.tx
                .as_ref()
                .ok_or_else(|| SyncError::Sync("send on closed channel".into()))
        }
    }

    #[async_trait]
    impl Channel for MemoryChannel {
        async fn send(&mut self, message: Bytes) -> Result<()> {
            self.sender()?;
            if let Some(permit) = self.reserved.take() {
                permit.send(message);
                return Ok(());
            }
            self.sender()?
                .send(message)
                .await
                .map_err(|_| SyncError::ConnectionLost)
        }

        async fn recv(&mut self) -> Result<Option<Bytes>> {
            Ok(self.rx.recv().await)
        }

        async fn next_event(&mut self, sending: bool) -> Result<Event> {
            let tx = if sending {
                if self.reserved.is_some() {
                    return Ok(Event::Writable);
                }
                Some(self.sender()?.clone())
            } else {
                None
            };
            let reserve = async move {
                match tx {
                    Some(tx) => tx.reserve_owned().await.ok(),
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                message = self.rx.recv() => Ok(Event::Received(message)),
                permit = reserve => {
                    let permit = permit.ok_or(SyncError::ConnectionLost)?;
                    self.reserved = Some(permit);
                    Ok(Event::Writable)
                }
            }
        }

        async fn close(&mut self) -> Result<()> {
            self.reserved = None;
            self.tx = None;
            Ok(())
        }
    }
}
