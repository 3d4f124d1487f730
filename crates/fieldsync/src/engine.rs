//! The Engine: one device's view of sync.
//!
//! The Engine ties the stores of a device to the ways it replicates: live
//! sessions with discovered peers, and syncfile or directory containers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fieldsync_core::{DeviceId, Entry, EntryBuilder, Keypair, LogKey, ProjectKey};
use fieldsync_store::{InsertResult, LogStore, MediaStore};
use fieldsync_sync::{
    HandshakePayload, Mux, Session, SessionTracker, SyncConfig, SyncError, SyncHandle,
};

use crate::config::{EngineConfig, ListenOptions, SyncOptions};
use crate::discovery::{Announcement, Discovery, DiscoveryEvent};
use crate::error::{EngineError, Result};
use crate::server::Server;
use crate::targets::{Target, TargetStatus, Targets};

struct Listening {
    server: Server,
    announcement: Announcement,
    browser: JoinHandle<()>,
}

/// The main Engine struct.
///
/// Provides a unified API for:
/// - Writing to this device's logs
/// - Serving and discovering peers on the local network
/// - Syncing with a discovered peer
/// - Replicating through syncfiles and directories
pub struct Engine<L: LogStore + ?Sized, M: MediaStore + ?Sized> {
    keypair: Keypair,
    project: ProjectKey,
    logs: Arc<L>,
    media: Arc<M>,
    discovery: Arc<dyn Discovery>,
    config: EngineConfig,
    targets: Targets,
    listening: Mutex<Option<Listening>>,
}

impl<L, M> Engine<L, M>
where
    L: LogStore + ?Sized + 'static,
    M: MediaStore + ?Sized + 'static,
{
    pub fn new(
        keypair: Keypair,
        project: ProjectKey,
        logs: Arc<L>,
        media: Arc<M>,
        discovery: Arc<dyn Discovery>,
        config: EngineConfig,
    ) -> Self {
        Self {
            keypair,
            project,
            logs,
            media,
            discovery,
            config,
            targets: Targets::new(),
            listening: Mutex::new(None),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.keypair.device_id()
    }

    pub fn logs(&self) -> &Arc<L> {
        &self.logs
    }

    pub fn media(&self) -> &Arc<M> {
        &self.media
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Known targets, ordered by id.
    pub fn targets(&self) -> Vec<Target> {
        self.targets.list()
    }

    pub fn target(&self, id: &str) -> Option<Target> {
        self.targets.get(id)
    }

    /// What this device tells peers in the handshake.
    pub fn payload(&self) -> HandshakePayload {
        HandshakePayload::new(
            self.device_id(),
            self.config.device_type,
            self.config.device_name.clone(),
        )
        .with_project(self.project.discovery_key())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Append an entry to this device's log `log_name`.
    pub async fn append(&self, log_name: &str, payload: impl Into<Bytes>) -> Result<Entry> {
        let log = LogKey::derive(&self.device_id(), log_name);
        let length = self.logs.length(&log).await?;
        let seq = length + 1;

        let mut builder = EntryBuilder::new(self.device_id(), log, seq)
            .timestamp(now_millis())
            .payload(payload);
        if length > 0 {
            if let Some(head) = self.logs.get_entry(&log, length).await? {
                builder = builder.prev(head.compute_id());
            }
        }
        let entry = builder.sign(&self.keypair);

        match self.logs.insert_entry(&entry).await? {
            InsertResult::Inserted | InsertResult::AlreadyExists => Ok(entry),
            InsertResult::Conflict { .. } => Err(EngineError::Conflict { log, seq }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Live Sync
    // ─────────────────────────────────────────────────────────────────────────

    /// Start the replication server, browse for peers and, unless
    /// `opts.announce` is false, announce this device.
    ///
    /// Listening again replaces the previous server and forgets every
    /// known target.
    pub async fn listen(&self, opts: ListenOptions) -> Result<SocketAddr> {
        let mut listening = self.listening.lock().await;
        if let Some(previous) = listening.take() {
            debug!("re-listening, stopping previous server");
            self.stop(previous).await?;
            self.targets.clear();
        }

        let logs = self.logs.clone();
        let media = self.media.clone();
        let payload = self.payload();
        let config = self.config.sync.clone();
        let targets = self.targets.clone();
        let server = Server::bind(opts.addr, move |stream, peer| {
            serve_connection(
                logs.clone(),
                media.clone(),
                payload.clone(),
                config.clone(),
                targets.clone(),
                stream,
                peer,
            )
        })
        .await?;

        let addr = server.local_addr();
        let announcement = Announcement {
            name: self.device_id().to_hex(),
            host: opts
                .advertised_host
                .unwrap_or_else(|| addr.ip().to_string()),
            port: addr.port(),
            service_type: self.config.discovery.service_type.clone(),
            device_name: self.config.device_name.clone(),
            device_type: self.config.device_type,
        };

        let events = self.discovery.browse(&announcement.service_type).await?;
        let browser = tokio::spawn(track_targets(
            events,
            self.targets.clone(),
            announcement.name.clone(),
        ));

        if opts.announce {
            self.discovery.announce(announcement.clone()).await?;
        }

        info!(%addr, announced = opts.announce, "engine listening");
        *listening = Some(Listening {
            server,
            announcement,
            browser,
        });
        Ok(addr)
    }

    /// Make this device visible. Requires [`listen`](Self::listen).
    pub async fn announce(&self) -> Result<()> {
        let listening = self.listening.lock().await;
        let listening = listening.as_ref().ok_or(EngineError::NotListening)?;
        self.discovery
            .announce(listening.announcement.clone())
            .await
    }

    /// Hide this device. The server keeps running.
    pub async fn unannounce(&self) -> Result<()> {
        let listening = self.listening.lock().await;
        if listening.is_none() {
            return Err(EngineError::NotListening);
        }
        self.discovery.unannounce().await
    }

    /// Sync with a discovered target.
    ///
    /// The target's status follows the session. An unknown id fails the
    /// handle with `PeerNotFound` right away.
    pub fn sync_to_target(&self, id: &str, opts: SyncOptions) -> SyncHandle {
        let Some(target) = self.targets.get(id) else {
            warn!(target_id = %id, "sync requested for unknown target");
            return SyncHandle::failed(SyncError::PeerNotFound(id.to_string()));
        };

        let config = opts.sync.unwrap_or_else(|| self.config.sync.clone());
        let logs = self.logs.clone();
        let media = self.media.clone();
        let payload = self.payload();

        info!(target_id = %id, host = %target.host, port = target.port, "syncing with target");
        let handle = SyncHandle::spawn(&config.clone(), move |tracker| async move {
            let stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
            stream.set_nodelay(true)?;
            let mux = Mux::new(stream);
            let mut session = Session::new(logs, media, payload, config, tracker);
            let result = session.run(&mux).await;
            mux.close().await;
            result
        });

        let mut states = handle.state_updates();
        let targets = self.targets.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            loop {
                let state = *states.borrow_and_update();
                targets.set_status(&id, TargetStatus::from(state));
                if state.is_terminal() {
                    break;
                }
                if states.changed().await.is_err() {
                    targets.set_status(&id, TargetStatus::from(*states.borrow()));
                    break;
                }
            }
        });

        handle
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Containers
    // ─────────────────────────────────────────────────────────────────────────

    /// Replicate with the syncfile at `path`.
    pub fn replicate_from_file(&self, path: impl Into<PathBuf>) -> SyncHandle {
        fieldsync_syncfile::replicate_file(
            self.logs.clone(),
            self.media.clone(),
            self.config.device_type,
            path,
            self.config.syncfile.clone(),
        )
    }

    /// Replicate with the directory container at `dir`.
    pub fn replicate_directory(&self, dir: impl Into<PathBuf>) -> SyncHandle {
        fieldsync_syncfile::replicate_directory(
            self.logs.clone(),
            self.media.clone(),
            self.config.device_type,
            dir,
            self.config.syncfile.clone(),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────────────────────

    /// Unannounce, stop browsing and shut the server down.
    ///
    /// Returns once all three are done. A no-op when not listening.
    pub async fn close(&self) -> Result<()> {
        let previous = self.listening.lock().await.take();
        match previous {
            Some(listening) => {
                self.stop(listening).await?;
                info!("engine closed");
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn stop(&self, listening: Listening) -> Result<()> {
        let Listening {
            server, browser, ..
        } = listening;

        let (unannounced, stopped, ()) = tokio::join!(
            self.discovery.unannounce(),
            async {
                let stopped = self.discovery.stop_browsing().await;
                browser.abort();
                let _ = browser.await;
                stopped
            },
            server.shutdown(),
        );
        unannounced?;
        stopped
    }
}

/// Serve one inbound connection.
async fn serve_connection<L, M>(
    logs: Arc<L>,
    media: Arc<M>,
    local: HandshakePayload,
    config: SyncConfig,
    targets: Targets,
    stream: TcpStream,
    peer: SocketAddr,
) where
    L: LogStore + ?Sized + 'static,
    M: MediaStore + ?Sized + 'static,
{
    let mux = Mux::new(stream);
    let (tracker, _, _) = SessionTracker::new(&config);
    let mut session = Session::new(logs, media, local, config, tracker.clone());
    let result = session.run(&mux).await;
    mux.close().await;
    tracker.finish(&result);

    if let Some(remote) = session.remote() {
        targets.set_status(&remote.id.to_hex(), TargetStatus::from(tracker.state()));
    }
    match result {
        Ok(summary) => info!(
            %peer,
            received = summary.logs.entries_received,
            sent = summary.logs.entries_sent,
            blobs = summary.media.blobs_received,
            "inbound sync complete"
        ),
        Err(e) => warn!(%peer, error = %e, "inbound sync failed"),
    }
}

/// Keep `targets` in line with discovery, skipping this device's own name.
async fn track_targets(
    mut events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    targets: Targets,
    own_name: String,
) {
    while let Some(event) = events.recv().await {
        match event {
            DiscoveryEvent::Up(announcement) if announcement.name == own_name => {}
            DiscoveryEvent::Up(announcement) => {
                info!(
                    target_id = %announcement.name,
                    host = %announcement.host,
                    port = announcement.port,
                    "peer up"
                );
                targets.upsert(&announcement);
            }
            DiscoveryEvent::Down { name } => {
                if targets.remove(&name).is_some() {
                    info!(target_id = %name, "peer down");
                }
            }
        }
    }
    debug!("discovery browsing ended");
}

/// Get current time in milliseconds.
fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::memory::MemoryNetwork;
    use fieldsync_core::validate_link;
    use fieldsync_store::{MemoryLogStore, MemoryMediaStore};

    type TestEngine = Engine<MemoryLogStore, MemoryMediaStore>;

    fn engine(network: &Arc<MemoryNetwork>) -> TestEngine {
        Engine::new(
            Keypair::generate(),
            ProjectKey::from_bytes([9; 32]),
            Arc::new(MemoryLogStore::new()),
            Arc::new(MemoryMediaStore::new()),
            Arc::new(network.discovery()),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_append_links_entries() {
        let engine = engine(&MemoryNetwork::new());
        let first = engine.append("notes", "one").await.unwrap();
        let second = engine.append("notes", "two").await.unwrap();

        assert_eq!(first.seq(), 1);
        assert_eq!(second.seq(), 2);
        validate_link(&first, &second).unwrap();
        assert_eq!(engine.logs().length(first.log()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_announce_requires_listen() {
        let engine = engine(&MemoryNetwork::new());
        assert!(matches!(engine.announce().await, Err(EngineError::NotListening)));
        assert!(matches!(engine.unannounce().await, Err(EngineError::NotListening)));
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let engine = engine(&MemoryNetwork::new());
        let handle = engine.sync_to_target("nobody", SyncOptions::default());
        assert!(matches!(
            handle.wait().await,
            Err(SyncError::PeerNotFound(ref id)) if id == "nobody"
        ));
    }
}
