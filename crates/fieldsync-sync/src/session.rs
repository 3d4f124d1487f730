//! Sync session state machine.
//!
//! ```text
//! connecting → handshaking → syncing-db → syncing-media → complete
//!      └────────────┴─────────────┴─────────────┴──────→ error
//! ```
//!
//! A session runs over one [`Mux`]. After the handshake the device with the
//! smaller id is the initiator: it arms the responder over `rpc`, then opens
//! `db` and, once logs are done, `media`. The responder dispatches the
//! sub-streams it accepts by name.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use fieldsync_core::DeviceId;
use fieldsync_store::{LogStore, MediaStore};

use crate::channel::Channel;
use crate::error::{ErrorKind, ProtocolError, Result, Side, SyncError};
use crate::handshake::{handshake, HandshakePayload};
use crate::media::{replicate_media, MediaStats};
use crate::messages::{decode, encode, ControlMessage};
use crate::mux::Mux;
use crate::progress::{Progress, ProgressReporter};
use crate::replication::{replicate_logs, LogStats};

/// Sub-stream names.
pub mod streams {
    pub const HANDSHAKE: &str = "handshake";
    pub const RPC: &str = "rpc";
    pub const DB: &str = "db";
    pub const MEDIA: &str = "media";
}

/// Configuration for sync behavior.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Minimum spacing of progress updates.
    pub progress_interval: Duration,
    /// Maximum entries per message.
    pub max_batch_size: usize,
    /// Whether to validate entries before storing.
    pub validate_entries: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_millis(200),
            max_batch_size: 50,
            validate_entries: true,
        }
    }
}

/// Observable state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    SyncingDb,
    SyncingMedia,
    Complete,
    Error(ErrorKind),
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Error(_))
    }
}

/// Which side drives replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// The device with the lexicographically smaller id initiates.
    pub fn for_devices(local: &DeviceId, remote: &DeviceId) -> Self {
        if local < remote {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

/// What a finished session did.
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    /// The remote's handshake payload. `None` for syncfile replication.
    pub remote: Option<HandshakePayload>,
    pub logs: LogStats,
    pub media: MediaStats,
    /// Final progress.
    pub progress: Progress,
}

/// State and progress of one session, shared with its [`SyncHandle`].
pub struct SessionTracker {
    state: watch::Sender<SessionState>,
    progress: ProgressReporter,
}

impl SessionTracker {
    pub fn new(
        config: &SyncConfig,
    ) -> (
        Arc<Self>,
        watch::Receiver<SessionState>,
        watch::Receiver<Option<Progress>>,
    ) {
        let (state, state_rx) = watch::channel(SessionState::Connecting);
        let (progress, progress_rx) = ProgressReporter::new(config.progress_interval);
        (Arc::new(Self { state, progress }), state_rx, progress_rx)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move to `next`. Terminal states are final.
    pub fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            debug!(from = ?*state, to = ?next, "session state");
            *state = next;
            true
        });
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    /// Record the end of the session and flush progress.
    pub fn finish<T>(&self, result: &Result<T>) -> Progress {
        match result {
            Ok(_) => self.set_state(SessionState::Complete),
            Err(e) => self.set_state(SessionState::Error(e.kind())),
        }
        self.progress.finish()
    }
}

/// Caller's view of a running session.
pub struct SyncHandle {
    progress: watch::Receiver<Option<Progress>>,
    state: watch::Receiver<SessionState>,
    done: oneshot::Receiver<Result<SyncSummary>>,
}

impl SyncHandle {
    /// Run a session on its own task.
    ///
    /// `session` is handed the tracker to report state and progress through.
    /// The tracker is finished with the session's result when it ends.
    pub fn spawn<F, Fut>(config: &SyncConfig, session: F) -> Self
    where
        F: FnOnce(Arc<SessionTracker>) -> Fut,
        Fut: Future<Output = Result<SyncSummary>> + Send + 'static,
    {
        let (tracker, state, progress) = SessionTracker::new(config);
        let fut = session(tracker.clone());
        let (tx, done) = oneshot::channel();

        tokio::spawn(async move {
            let result = fut.await;
            let last = tracker.finish(&result);
            match &result {
                Ok(_) => info!("sync complete"),
                Err(e) => warn!(error = %e, "sync failed"),
            }
            let _ = tx.send(result.map(|summary| SyncSummary {
                progress: last,
                ..summary
            }));
        });

        Self {
            progress,
            state,
            done,
        }
    }

    /// A handle for a session that failed before it started.
    pub fn failed(error: SyncError) -> Self {
        let (_, progress) = watch::channel(None);
        let (_, state) = watch::channel(SessionState::Error(error.kind()));
        let (tx, done) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self {
            progress,
            state,
            done,
        }
    }

    /// Latest published progress.
    pub fn progress(&self) -> Option<Progress> {
        *self.progress.borrow()
    }

    pub fn progress_updates(&self) -> watch::Receiver<Option<Progress>> {
        self.progress.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn state_updates(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait for the session to end.
    pub async fn wait(self) -> Result<SyncSummary> {
        self.done
            .await
            .unwrap_or_else(|_| Err(SyncError::Sync("session task ended unexpectedly".into())))
    }
}

struct Negotiated {
    remote: HandshakePayload,
    role: Role,
}

/// One sync session between two devices.
pub struct Session<L: LogStore + ?Sized, M: MediaStore + ?Sized> {
    logs: Arc<L>,
    media: Arc<M>,
    local: HandshakePayload,
    config: SyncConfig,
    tracker: Arc<SessionTracker>,
    negotiated: Option<Negotiated>,
}

impl<L: LogStore + ?Sized, M: MediaStore + ?Sized> Session<L, M> {
    pub fn new(
        logs: Arc<L>,
        media: Arc<M>,
        local: HandshakePayload,
        config: SyncConfig,
        tracker: Arc<SessionTracker>,
    ) -> Self {
        Self {
            logs,
            media,
            local,
            config,
            tracker,
            negotiated: None,
        }
    }

    pub fn role(&self) -> Option<Role> {
        self.negotiated.as_ref().map(|n| n.role)
    }

    pub fn remote(&self) -> Option<&HandshakePayload> {
        self.negotiated.as_ref().map(|n| &n.remote)
    }

    /// Exchange payloads. Succeeds only if both sides accept.
    ///
    /// A remote is accepted when it is a different device of the same
    /// project.
    pub async fn handshake<C: Channel + ?Sized>(&mut self, channel: &mut C) -> Result<HandshakePayload> {
        self.tracker.set_state(SessionState::Handshaking);

        let local_id = self.local.id;
        let local_project = self.local.project;
        let outcome = handshake(channel, &self.local, move |remote| {
            Ok(remote.id != local_id && remote.project == local_project)
        })
        .await?;

        if !outcome.both_accepted() {
            let remote = &outcome.remote;
            let err = if remote.protocol_version != self.local.protocol_version {
                SyncError::VersionMismatch {
                    local: self.local.protocol_version,
                    remote: remote.protocol_version,
                }
            } else if remote.project != self.local.project {
                SyncError::IncompatibleProjects
            } else if let Some(error) = outcome.remote_error {
                SyncError::Sync(error)
            } else if !outcome.local_accept {
                SyncError::Rejected { by: Side::Local }
            } else {
                SyncError::Rejected { by: Side::Remote }
            };
            return Err(err);
        }

        let role = Role::for_devices(&self.local.id, &outcome.remote.id);
        info!(
            remote = %outcome.remote.id,
            name = %outcome.remote.device_name,
            device_type = %outcome.remote.device_type,
            ?role,
            "handshake accepted"
        );
        self.negotiated = Some(Negotiated {
            remote: outcome.remote.clone(),
            role,
        });
        Ok(outcome.remote)
    }

    /// Replicate logs. Requires a completed handshake.
    pub async fn sync_db<C: Channel + ?Sized>(&mut self, channel: &mut C) -> Result<LogStats> {
        if self.negotiated.is_none() {
            return Err(SyncError::PrematureSync);
        }
        self.tracker.set_state(SessionState::SyncingDb);
        replicate_logs(&*self.logs, channel, &self.config, self.tracker.progress()).await
    }

    /// Replicate media, filtered for the remote's device type.
    pub async fn sync_media<C: Channel + ?Sized>(&mut self, channel: &mut C) -> Result<MediaStats> {
        let remote = self
            .negotiated
            .as_ref()
            .map(|n| n.remote.device_type)
            .ok_or(SyncError::PrematureSync)?;
        self.tracker.set_state(SessionState::SyncingMedia);
        replicate_media(&*self.media, channel, remote, self.tracker.progress()).await
    }

    /// Run the whole session over `mux`.
    pub async fn run(&mut self, mux: &Mux) -> Result<SyncSummary> {
        let mut stream = mux.open(streams::HANDSHAKE)?;
        let remote = self.handshake(&mut stream).await?;
        stream.close().await?;

        let (logs, media) = match self.role() {
            Some(Role::Initiator) => self.run_initiator(mux).await?,
            Some(Role::Responder) | None => self.run_responder(mux).await?,
        };

        Ok(SyncSummary {
            remote: Some(remote),
            logs,
            media,
            progress: self.tracker.progress().snapshot(),
        })
    }

    async fn run_initiator(&mut self, mux: &Mux) -> Result<(LogStats, MediaStats)> {
        let mut rpc = mux.open(streams::RPC)?;
        rpc.send(encode(&ControlMessage::Arm)?).await?;
        let raw = rpc.recv().await?.ok_or(SyncError::ConnectionLost)?;
        match decode(&raw)? {
            ControlMessage::Armed => {}
            other => {
                return Err(ProtocolError::Unexpected(format!("{other:?} on rpc")).into());
            }
        }

        let mut db = mux.open(streams::DB)?;
        let logs = self.sync_db(&mut db).await?;

        let mut media = mux.open(streams::MEDIA)?;
        let media = self.sync_media(&mut media).await?;
        Ok((logs, media))
    }

    async fn run_responder(&mut self, mux: &Mux) -> Result<(LogStats, MediaStats)> {
        let mut armed = false;
        let mut logs = None;

        loop {
            let mut stream = mux.accept().await.ok_or(SyncError::ConnectionLost)?;
            debug!(stream = stream.name(), "accepted sub-stream");

            match stream.name() {
                streams::RPC => {
                    let raw = stream.recv().await?.ok_or(SyncError::ConnectionLost)?;
                    match decode(&raw)? {
                        ControlMessage::Arm => {
                            stream.send(encode(&ControlMessage::Armed)?).await?;
                            armed = true;
                        }
                        other => {
                            return Err(ProtocolError::Unexpected(format!("{other:?} on rpc")).into());
                        }
                    }
                }
                streams::DB => {
                    if !armed {
                        return Err(SyncError::PrematureSync);
                    }
                    logs = Some(self.sync_db(&mut stream).await?);
                }
                streams::MEDIA => {
                    let logs = logs.ok_or(SyncError::PrematureSync)?;
                    let media = self.sync_media(&mut stream).await?;
                    return Ok((logs, media));
                }
                other => warn!(stream = other, "ignoring unknown sub-stream"),
            }
        }
    }
}

/// Run a session over `mux` on its own task, closing the mux afterwards.
pub fn start<L, M>(
    logs: Arc<L>,
    media: Arc<M>,
    local: HandshakePayload,
    config: SyncConfig,
    mux: Mux,
) -> SyncHandle
where
    L: LogStore + ?Sized + 'static,
    M: MediaStore + ?Sized + 'static,
{
    let handle_config = config.clone();
    SyncHandle::spawn(&handle_config, move |tracker| async move {
        let mut session = Session::new(logs, media, local, config, tracker);
        let result = session.run(&mux).await;
        mux.close().await;
        result
    })
}
