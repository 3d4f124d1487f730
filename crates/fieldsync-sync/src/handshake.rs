//! Handshake: identify both devices and agree to sync.
//!
//! Each side sends its payload immediately, then answers the remote payload
//! with exactly one response:
//!
//! ```text
//! {"type":"payload","data":{"id":"…","protocolVersion":1,"deviceType":"mobile","deviceName":"…"}}
//! {"type":"response","accept":true}
//! {"type":"response","accept":{"error":"…"}}
//! ```
//!
//! Message handling ([`HandshakeState`]) is pure; all sending happens in the
//! [`handshake`] driver loop.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use fieldsync_core::{DeviceId, DeviceType, DiscoveryKey};

use crate::channel::Channel;
use crate::error::{ProtocolError, Result, SyncError};
use crate::messages::PROTOCOL_VERSION;

/// What a device says about itself. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePayload {
    pub id: DeviceId,
    pub protocol_version: u32,
    pub device_type: DeviceType,
    pub device_name: String,
    /// Discovery key of the sender's project, never the project key itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<DiscoveryKey>,
}

impl HandshakePayload {
    /// A payload at the current protocol version.
    pub fn new(id: DeviceId, device_type: DeviceType, device_name: impl Into<String>) -> Self {
        Self {
            id,
            protocol_version: PROTOCOL_VERSION,
            device_type,
            device_name: device_name.into(),
            project: None,
        }
    }

    pub fn with_project(mut self, project: DiscoveryKey) -> Self {
        self.project = Some(project);
        self
    }
}

/// The `accept` field of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Accept {
    Decision(bool),
    Error { error: String },
}

impl Accept {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Accept::Decision(true))
    }
}

/// Handshake wire messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HandshakeMessage {
    Payload { data: HandshakePayload },
    Response { accept: Accept },
}

impl HandshakeMessage {
    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| SyncError::Codec(e.to_string()))
    }

    /// Parse a message, telling unknown types apart from malformed ones.
    pub fn parse(raw: &[u8]) -> std::result::Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_slice(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        match value.get("type").and_then(|t| t.as_str()) {
            Some("payload") | Some("response") => {}
            Some(other) => return Err(ProtocolError::UnknownMessageType(other.to_string())),
            None => return Err(ProtocolError::UnknownMessageType(String::new())),
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Result of a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub local_accept: bool,
    pub remote_accept: bool,
    pub remote: HandshakePayload,
    /// Error text the remote sent instead of a decision.
    pub remote_error: Option<String>,
}

impl HandshakeOutcome {
    pub fn both_accepted(&self) -> bool {
        self.local_accept && self.remote_accept
    }
}

/// What a received message asks of the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// The remote payload arrived; a decision must be sent.
    Payload(HandshakePayload),
    /// The remote response arrived.
    Response,
}

/// Pure handshake bookkeeping.
#[derive(Debug, Default)]
pub struct HandshakeState {
    remote: Option<HandshakePayload>,
    remote_accept: Option<Accept>,
    local_accept: Option<bool>,
}

impl HandshakeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message(&mut self, raw: &[u8]) -> std::result::Result<HandshakeEvent, ProtocolError> {
        match HandshakeMessage::parse(raw)? {
            HandshakeMessage::Payload { data } => {
                if self.remote.is_some() {
                    return Err(ProtocolError::DuplicateMessage("payload"));
                }
                self.remote = Some(data.clone());
                Ok(HandshakeEvent::Payload(data))
            }
            HandshakeMessage::Response { accept } => {
                if self.remote.is_none() {
                    return Err(ProtocolError::ResponseBeforePayload);
                }
                if self.remote_accept.is_some() {
                    return Err(ProtocolError::DuplicateMessage("response"));
                }
                self.remote_accept = Some(accept);
                Ok(HandshakeEvent::Response)
            }
        }
    }

    /// Record that our decision has been sent.
    pub fn decided(&mut self, accept: bool) {
        self.local_accept = Some(accept);
    }

    /// The outcome, once our decision is sent and the remote's received.
    pub fn outcome(&self) -> Option<HandshakeOutcome> {
        let local_accept = self.local_accept?;
        let remote_accept = self.remote_accept.as_ref()?;
        let remote = self.remote.clone()?;
        Some(HandshakeOutcome {
            local_accept,
            remote_accept: remote_accept.is_accepted(),
            remote,
            remote_error: match remote_accept {
                Accept::Error { error } => Some(error.clone()),
                Accept::Decision(_) => None,
            },
        })
    }
}

/// Run the handshake over a channel.
///
/// `decide` is invoked at most once, with the remote payload. A protocol
/// version mismatch is rejected without invoking it. If `decide` fails, the
/// error text is sent to the remote and the handshake fails with that error.
pub async fn handshake<C, F>(
    channel: &mut C,
    local: &HandshakePayload,
    decide: F,
) -> Result<HandshakeOutcome>
where
    C: Channel + ?Sized,
    F: FnOnce(&HandshakePayload) -> Result<bool> + Send,
{
    channel
        .send(
            HandshakeMessage::Payload {
                data: local.clone(),
            }
            .to_bytes()?,
        )
        .await?;

    let mut state = HandshakeState::new();
    let mut decide = Some(decide);

    loop {
        if let Some(outcome) = state.outcome() {
            debug!(
                remote = %outcome.remote.id,
                local_accept = outcome.local_accept,
                remote_accept = outcome.remote_accept,
                "handshake complete"
            );
            return Ok(outcome);
        }

        let raw = channel.recv().await?.ok_or(SyncError::ConnectionLost)?;

        if let HandshakeEvent::Payload(remote) = state.on_message(&raw)? {
            let decision = if remote.protocol_version != local.protocol_version {
                debug!(
                    local = local.protocol_version,
                    remote = remote.protocol_version,
                    "protocol version mismatch, rejecting"
                );
                Ok(false)
            } else {
                match decide.take() {
                    Some(decide) => decide(&remote),
                    None => Ok(false),
                }
            };

            match decision {
                Ok(accept) => {
                    let response = HandshakeMessage::Response {
                        accept: Accept::Decision(accept),
                    };
                    channel.send(response.to_bytes()?).await?;
                    state.decided(accept);
                }
                Err(e) => {
                    let response = HandshakeMessage::Response {
                        accept: Accept::Error {
                            error: e.to_string(),
                        },
                    };
                    channel.send(response.to_bytes()?).await?;
                    return Err(e);
                }
            }
        }
    }
}
