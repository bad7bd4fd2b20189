use crate::link::{LinkClosed, PeerLink};
use crate::protocol::{PeerMessage, SessionConfig, WireKhet};
use khetworld_cache::ContentCache;
use khetworld_common::{Khet, KhetId, Pose};
use khetworld_registry::{EntityRegistry, RegistryError, SourceMode};
use std::collections::BTreeMap;
use std::fmt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Connection lifecycle.
///
/// `Idle -> WaitingForLocalId -> Open -> (Connecting ->) Connected ->
/// Disconnected -> Idle`. Hosts skip `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    WaitingForLocalId,
    Open,
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts the connection and owns the authoritative khet set.
    Host,
    /// Initiates the connection and mirrors the host.
    Joiner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSession {
    pub own_id: String,
    pub remote_id: String,
    pub role: Role,
}

/// What one received frame (or the loss of the link) amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Connected { remote_id: String },
    KhetlistSent { count: usize },
    KhetlistReceived { count: usize },
    RemoteAvatar { id: KhetId },
    RemotePose { seq: u64, pose: Pose },
    RemoteAvatarRemoved { id: KhetId },
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: ConnectionState,
    },
    #[error("already connected to {0}")]
    AlreadyConnected(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Link(#[from] LinkClosed),
    #[error("replica update failed: {0}")]
    Registry(#[from] RegistryError),
}

/// One-to-one replication channel to a remote peer.
pub struct PeerChannel<L> {
    state: ConnectionState,
    config: SessionConfig,
    own_id: Option<String>,
    session: Option<PeerSession>,
    link: Option<L>,
    last_pose_sent: Option<Instant>,
    next_seq: u64,
    last_applied_seq: Option<u64>,
    remote_avatar: Option<KhetId>,
    remote_pose: Option<Pose>,
}

impl<L: PeerLink> PeerChannel<L> {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            state: ConnectionState::Idle,
            config,
            own_id: None,
            session: None,
            link: None,
            last_pose_sent: None,
            next_seq: 0,
            last_applied_seq: None,
            remote_avatar: None,
            remote_pose: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn session(&self) -> Option<&PeerSession> {
        self.session.as_ref()
    }

    pub fn remote_avatar(&self) -> Option<&KhetId> {
        self.remote_avatar.as_ref()
    }

    /// Last pose applied from the remote peer.
    pub fn remote_pose(&self) -> Option<Pose> {
        self.remote_pose
    }

    /// Start waiting for the signalling layer to hand out a local peer id.
    pub fn begin(&mut self) -> Result<(), PeerError> {
        self.expect_state("begin", &[ConnectionState::Idle])?;
        self.state = ConnectionState::WaitingForLocalId;
        Ok(())
    }

    pub fn assign_local_id(&mut self, id: impl Into<String>) -> Result<(), PeerError> {
        self.expect_state("assign a local id", &[ConnectionState::WaitingForLocalId])?;
        let id = id.into();
        tracing::debug!(own_id = %id, "local peer id assigned");
        self.own_id = Some(id);
        self.state = ConnectionState::Open;
        Ok(())
    }

    /// Host side: take an inbound link and send `init`.
    ///
    /// Only one peer at a time; a second link gets a best-effort `exit` and
    /// is dropped.
    pub async fn accept(&mut self, mut link: L, remote_id: impl Into<String>) -> Result<(), PeerError> {
        let remote_id = remote_id.into();
        if let Some(session) = &self.session {
            tracing::warn!(rejected = %remote_id, current = %session.remote_id, "rejecting second connection");
            if let Ok(frame) = (PeerMessage::Exit {}).encode() {
                let _ = link.send(frame).await;
            }
            link.close();
            return Err(PeerError::AlreadyConnected(session.remote_id.clone()));
        }
        self.expect_state("accept", &[ConnectionState::Open])?;

        self.open_session(link, remote_id.clone(), Role::Host);
        self.state = ConnectionState::Connected;
        let init = PeerMessage::Init {
            config: self.config.clone(),
        };
        self.send(&init).await?;
        tracing::info!(%remote_id, "peer connected as host");
        Ok(())
    }

    /// Joiner side: start a session over an outbound link and wait for `init`.
    pub async fn connect(&mut self, link: L, remote_id: impl Into<String>) -> Result<(), PeerError> {
        self.expect_state("connect", &[ConnectionState::Open])?;
        let remote_id = remote_id.into();
        tracing::debug!(%remote_id, "connecting to host");
        self.open_session(link, remote_id, Role::Joiner);
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    /// Send the local pose if the streaming interval has elapsed since the
    /// last send. Returns whether a frame went out.
    pub async fn send_pose(&mut self, pose: Pose, now: Instant) -> Result<bool, PeerError> {
        self.expect_state("send a pose", &[ConnectionState::Connected])?;
        if let Some(last) = self.last_pose_sent {
            if now.saturating_duration_since(last) < self.config.position_interval() {
                return Ok(false);
            }
        }
        let seq = self.next_seq;
        self.send(&PeerMessage::Position {
            seq,
            position: pose.position,
            quaternion: pose.orientation,
        })
        .await?;
        self.next_seq += 1;
        self.last_pose_sent = Some(now);
        Ok(true)
    }

    /// Tell the remote peer which khet is our avatar.
    pub async fn announce_avatar(&mut self, id: &KhetId) -> Result<(), PeerError> {
        self.expect_state("announce an avatar", &[ConnectionState::Connected])?;
        self.send(&PeerMessage::Avatar { id: id.clone() }).await
    }

    /// Best-effort `exit`, then tear the session down.
    pub async fn disconnect(&mut self) -> Vec<PeerEvent> {
        if let Some(link) = self.link.as_mut() {
            if let Ok(frame) = (PeerMessage::Exit {}).encode() {
                if link.send(frame).await.is_err() {
                    tracing::debug!("exit not delivered, link already closed");
                }
            }
        }
        self.teardown()
    }

    /// Return to `Idle` after a disconnect.
    pub fn reset(&mut self) -> Result<(), PeerError> {
        self.expect_state("reset", &[ConnectionState::Disconnected, ConnectionState::Idle])?;
        self.state = ConnectionState::Idle;
        Ok(())
    }

    /// Receive and handle exactly one frame.
    ///
    /// Malformed or unexpected frames are logged and yield no events. Link
    /// loss tears the session down.
    pub async fn next_event<C: ContentCache>(
        &mut self,
        registry: &mut EntityRegistry,
        cache: &C,
    ) -> Result<Vec<PeerEvent>, PeerError> {
        let Some(link) = self.link.as_mut() else {
            return Err(PeerError::InvalidState {
                action: "receive",
                state: self.state,
            });
        };
        let Some(frame) = link.recv().await else {
            tracing::info!("peer link closed");
            return Ok(self.teardown());
        };

        let message = match PeerMessage::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed peer frame");
                return Ok(Vec::new());
            }
        };
        tracing::trace!(kind = message.kind(), "peer frame received");

        match self.handle(message, registry, cache).await {
            Ok(events) => Ok(events),
            Err(PeerError::Protocol(reason)) => {
                tracing::warn!(%reason, "dropping peer frame");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Drive the receive loop until the link closes or `cancel` fires.
    /// Cancelling sends a best-effort `exit`.
    pub async fn run<C: ContentCache>(
        &mut self,
        registry: &mut EntityRegistry,
        cache: &C,
        cancel: &CancellationToken,
        mut on_event: impl FnMut(&PeerEvent),
    ) -> Result<(), PeerError> {
        loop {
            let events = tokio::select! {
                biased;
                _ = cancel.cancelled() => self.disconnect().await,
                result = self.next_event(registry, cache) => result?,
            };
            let closed = events.iter().any(|e| matches!(e, PeerEvent::Closed));
            for event in &events {
                on_event(event);
            }
            if closed {
                return Ok(());
            }
        }
    }

    async fn handle<C: ContentCache>(
        &mut self,
        message: PeerMessage,
        registry: &mut EntityRegistry,
        cache: &C,
    ) -> Result<Vec<PeerEvent>, PeerError> {
        let role = self.session.as_ref().map(|s| s.role);
        match message {
            PeerMessage::Init { config } => {
                if role != Some(Role::Joiner) || self.state != ConnectionState::Connecting {
                    return Err(PeerError::Protocol(format!("unexpected init while {}", self.state)));
                }
                tracing::info!(world = %config.world_name, "session config received");
                self.config = config;
                self.state = ConnectionState::Connected;
                self.send(&PeerMessage::RequestKhetlist {}).await?;
                let remote_id = self
                    .session
                    .as_ref()
                    .map(|s| s.remote_id.clone())
                    .unwrap_or_default();
                Ok(vec![PeerEvent::Connected { remote_id }])
            }
            PeerMessage::RequestKhetlist {} => {
                if role != Some(Role::Host) {
                    return Err(PeerError::Protocol("khetlist requested from a joiner".into()));
                }
                let khets: BTreeMap<KhetId, WireKhet> = registry
                    .iter()
                    .map(|k| (k.id.clone(), WireKhet::from(k)))
                    .collect();
                let count = khets.len();
                self.send(&PeerMessage::Khetlist { khets }).await?;
                tracing::info!(count, "khetlist sent");
                Ok(vec![PeerEvent::KhetlistSent { count }])
            }
            PeerMessage::Khetlist { khets } => {
                if role != Some(Role::Joiner) {
                    return Err(PeerError::Protocol("khetlist sent to the host".into()));
                }
                let mut received = Vec::with_capacity(khets.len());
                for (key, wire) in khets {
                    match Khet::try_from(wire) {
                        Ok(khet) if khet.id == key => {
                            match khet.validate().and_then(|()| khet.verify_content_hash()) {
                                Ok(()) => received.push(khet),
                                Err(e) => tracing::warn!(error = %e, "dropping invalid khet"),
                            }
                        }
                        Ok(khet) => {
                            tracing::warn!(%key, id = %khet.id, "khetlist key does not match khet id")
                        }
                        Err(e) => tracing::warn!(error = %e, "dropping undecodable khet"),
                    }
                }
                for khet in received.iter().filter(|k| k.has_resident_asset()) {
                    if !cache.put(khet) {
                        tracing::warn!(id = %khet.id, "replicated khet not cached");
                    }
                }
                let count = registry.replace_all(SourceMode::PeerReplica, received)?;
                tracing::info!(count, "replica replaced from khetlist");
                Ok(vec![PeerEvent::KhetlistReceived { count }])
            }
            PeerMessage::Avatar { id } => {
                tracing::debug!(%id, "remote avatar announced");
                self.remote_avatar = Some(id.clone());
                Ok(vec![PeerEvent::RemoteAvatar { id }])
            }
            PeerMessage::Position {
                seq,
                position,
                quaternion,
            } => {
                if self.last_applied_seq.is_some_and(|last| seq <= last) {
                    tracing::trace!(seq, "dropping stale pose");
                    return Ok(Vec::new());
                }
                let pose = Pose {
                    position,
                    orientation: quaternion,
                };
                self.last_applied_seq = Some(seq);
                self.remote_pose = Some(pose);
                Ok(vec![PeerEvent::RemotePose { seq, pose }])
            }
            PeerMessage::Code { .. } => {
                tracing::info!("ignoring reserved code message");
                Ok(Vec::new())
            }
            PeerMessage::Exit {} => {
                tracing::info!("peer sent exit");
                Ok(self.teardown())
            }
        }
    }

    async fn send(&mut self, message: &PeerMessage) -> Result<(), PeerError> {
        let frame = message.encode()?;
        let Some(link) = self.link.as_mut() else {
            return Err(PeerError::Link(LinkClosed));
        };
        if let Err(e) = link.send(frame).await {
            tracing::warn!(kind = message.kind(), "send failed, tearing session down");
            self.teardown();
            return Err(e.into());
        }
        Ok(())
    }

    fn open_session(&mut self, link: L, remote_id: String, role: Role) {
        self.session = Some(PeerSession {
            own_id: self.own_id.clone().unwrap_or_default(),
            remote_id,
            role,
        });
        self.link = Some(link);
        self.last_pose_sent = None;
        self.next_seq = 0;
        self.last_applied_seq = None;
    }

    fn teardown(&mut self) -> Vec<PeerEvent> {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.session = None;
        self.remote_pose = None;
        self.state = ConnectionState::Disconnected;

        let mut events = Vec::new();
        if let Some(id) = self.remote_avatar.take() {
            events.push(PeerEvent::RemoteAvatarRemoved { id });
        }
        events.push(PeerEvent::Closed);
        events
    }

    fn expect_state(
        &self,
        action: &'static str,
        allowed: &[ConnectionState],
    ) -> Result<(), PeerError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PeerError::InvalidState {
                action,
                state: self.state,
            })
        }
    }
}
