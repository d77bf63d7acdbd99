//! Call session lifecycle management
//!
//! [`CallSessionManager`] is the single writer of call state. UI commands
//! and inbound signaling events both funnel through it; everything else in
//! the crate is driven from here. At most one session exists at a time,
//! and every path out of a session runs the same teardown.

use crate::activity::{AudioActivityDetector, DetectorConfig};
use crate::engine::{LinkEvent, PeerConnectionFactory, SessionDescription};
use crate::media::{AcquiredMedia, MediaAcquisition, MediaDevices, MediaError, MediaStreamHandle};
use crate::registry::{PeerLinkRegistry, RegistryError, RegistryUpdate};
use crate::signaling::{OutboundMessage, SignalingChannel, SignalingError, SignalingEvent};
use crate::types::{
    ActiveSpeakerSet, CallDirection, CallMode, CallTarget, ChatId, MediaKind, ParticipantInfo,
    PeerId, PeerKey, RingState, SessionSnapshot, SessionState, SpeakerId, UserId,
};
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// A session already exists
    #[error("Another call is already active")]
    AlreadyInCall,

    /// No incoming call to answer or reject
    #[error("No incoming call")]
    NoIncomingCall,

    /// Media acquisition failed
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Registry operation failed
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Signaling send failed
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// Why a session ended or a call attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The local user hung up
    LocalHangup,
    /// The local user rejected the incoming call
    LocalReject,
    /// The remote party ended the call
    RemoteEnded,
    /// The callee rejected the call
    RemoteRejected,
    /// The callee was in another call
    RemoteBusy,
    /// The callee was not connected
    RemoteOffline,
    /// The peer connection was lost
    ConnectionLost,
    /// Local media could not be acquired
    MediaUnavailable,
}

/// Session notifications for the UI layer
#[derive(Clone)]
pub enum SessionEvent {
    /// Lifecycle state changed
    StateChanged(SessionState),
    /// A participant joined (group calls)
    ParticipantJoined {
        /// Joiner's transient peer id
        peer: PeerId,
        /// Joiner's metadata
        info: ParticipantInfo,
    },
    /// A participant left (group calls)
    ParticipantLeft {
        /// Leaver's transient peer id
        peer: PeerId,
    },
    /// A remote media stream became available
    RemoteStreamAdded {
        /// Owning peer
        peer: PeerId,
        /// The stream
        stream: Arc<dyn MediaStreamHandle>,
    },
    /// A remote media stream went away with its peer
    RemoteStreamRemoved {
        /// Owning peer
        peer: PeerId,
    },
    /// The set of speakers above the speaking threshold changed
    ActiveSpeakersChanged {
        /// Who is currently speaking
        speakers: ActiveSpeakerSet,
    },
    /// Video was requested but acquisition fell back to audio-only
    MediaDegraded,
    /// A call attempt failed before or instead of connecting
    CallFailed {
        /// Failure classification
        reason: EndReason,
    },
    /// The session ended and the manager returned to idle
    SessionEnded {
        /// End classification
        reason: EndReason,
    },
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            Self::ParticipantJoined { peer, info } => f
                .debug_struct("ParticipantJoined")
                .field("peer", peer)
                .field("info", info)
                .finish(),
            Self::ParticipantLeft { peer } => {
                f.debug_struct("ParticipantLeft").field("peer", peer).finish()
            }
            Self::RemoteStreamAdded { peer, stream } => f
                .debug_struct("RemoteStreamAdded")
                .field("peer", peer)
                .field("stream", &stream.id())
                .finish(),
            Self::RemoteStreamRemoved { peer } => f
                .debug_struct("RemoteStreamRemoved")
                .field("peer", peer)
                .finish(),
            Self::ActiveSpeakersChanged { speakers } => f
                .debug_struct("ActiveSpeakersChanged")
                .field("speakers", speakers)
                .finish(),
            Self::MediaDegraded => write!(f, "MediaDegraded"),
            Self::CallFailed { reason } => {
                f.debug_struct("CallFailed").field("reason", reason).finish()
            }
            Self::SessionEnded { reason } => {
                f.debug_struct("SessionEnded").field("reason", reason).finish()
            }
        }
    }
}

/// Manager tuning
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionConfig {
    /// Active-speaker detector settings
    pub detector: DetectorConfig,
}

/// State of the one live call, if any
struct ActiveCall {
    direction: CallDirection,
    mode: CallMode,
    state: SessionState,
    chat_id: ChatId,
    /// What the user asked for
    requested_kind: MediaKind,
    /// What acquisition delivered
    effective_kind: MediaKind,
    degraded: bool,
    muted: bool,
    video_enabled: bool,
    ring: RingState,
    connected_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Direct calls: the other party's durable identity, when known
    counterpart_user: Option<UserId>,
    /// Direct calls: the other party's transient peer id, when known
    counterpart_socket: Option<PeerId>,
    /// Direct incoming: offer held until the user answers
    pending_offer: Option<SessionDescription>,
    local_stream: Arc<dyn MediaStreamHandle>,
}

impl ActiveCall {
    fn is_group(&self) -> bool {
        self.mode == CallMode::Group
    }
}

/// Single-writer orchestrator of the call session
///
/// Constructed with [`CallSessionManager::new`], which also spawns the
/// link-event pump; the pump stops when the manager is dropped.
pub struct CallSessionManager {
    registry: PeerLinkRegistry,
    media: MediaAcquisition,
    signaling: Arc<dyn SignalingChannel>,
    detector: AudioActivityDetector,
    session: RwLock<Option<ActiveCall>>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    events_tx: broadcast::Sender<SessionEvent>,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl CallSessionManager {
    /// Create a manager over the given capabilities and start its pump
    #[must_use]
    pub fn new(
        engine: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
        signaling: Arc<dyn SignalingChannel>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::idle());
        let (events_tx, _) = broadcast::channel(64);

        let manager = Arc::new(Self {
            registry: PeerLinkRegistry::new(engine, Arc::clone(&signaling), notice_tx),
            media: MediaAcquisition::new(devices),
            signaling,
            detector: AudioActivityDetector::new(config.detector),
            session: RwLock::new(None),
            snapshot_tx,
            events_tx,
            pump: parking_lot::Mutex::new(None),
        });

        let pump = tokio::spawn(Self::pump_loop(Arc::downgrade(&manager), notice_rx));
        *manager.pump.lock() = Some(pump);

        // Mirror speaker-set changes onto the event channel; exits when the
        // detector (and with it the watch sender) goes away.
        let mut speakers = manager.detector.subscribe();
        let events_tx = manager.events_tx.clone();
        tokio::spawn(async move {
            while speakers.changed().await.is_ok() {
                let set = speakers.borrow_and_update().clone();
                let _ = events_tx.send(SessionEvent::ActiveSpeakersChanged { speakers: set });
            }
        });
        manager
    }

    /// Drive link events from the engine back into the session
    async fn pump_loop(
        manager: Weak<CallSessionManager>,
        mut notices: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        while let Some(event) = notices.recv().await {
            let Some(manager) = manager.upgrade() else {
                break;
            };
            manager.process_link_event(event).await;
        }
    }

    async fn process_link_event(&self, event: LinkEvent) {
        let update = match self.registry.apply_link_event(event).await {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!(error = %e, "Link event handling failed");
                return;
            }
        };
        match update {
            None => {}
            Some(RegistryUpdate::RemoteStream { key, stream }) => {
                // A stream for the unresolved placeholder stays parked in
                // the registry; it surfaces when the answer remaps the link.
                if let Some(peer) = key.peer_id() {
                    self.surface_remote_stream(peer.clone(), stream).await;
                }
            }
            Some(RegistryUpdate::LinkClosed { key, .. }) => {
                self.handle_link_lost(key).await;
            }
        }
    }

    async fn surface_remote_stream(&self, peer: PeerId, stream: Arc<dyn MediaStreamHandle>) {
        self.detector
            .attach(SpeakerId::Peer(peer.clone()), Arc::clone(&stream))
            .await;
        self.emit(SessionEvent::RemoteStreamAdded { peer, stream });
        self.refresh_snapshot().await;
    }

    async fn handle_link_lost(&self, key: PeerKey) {
        let is_group = {
            let session = self.session.read().await;
            match session.as_ref() {
                Some(call) => call.is_group(),
                None => return,
            }
        };

        if is_group {
            if let Some(peer) = key.peer_id() {
                tracing::info!(peer = %peer, "Group participant connection lost");
                self.detector.detach(&SpeakerId::Peer(peer.clone())).await;
                self.emit(SessionEvent::RemoteStreamRemoved { peer: peer.clone() });
                self.emit(SessionEvent::ParticipantLeft { peer: peer.clone() });
                self.refresh_snapshot().await;
            }
        } else {
            tracing::warn!(peer = %key, "Direct call connection lost");
            self.teardown(EndReason::ConnectionLost).await;
        }
    }

    // ---- UI commands ----

    /// Start a call
    ///
    /// Acquires local media (with the audio-only fallback), then creates
    /// the placeholder link and sends the offer for direct calls, or
    /// announces the room call for group calls.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AlreadyInCall`] if a session exists, or the
    /// media/registry/signaling failure that aborted the attempt. On error
    /// the manager is left idle.
    #[tracing::instrument(skip(self), fields(chat_id = %target.chat_id()))]
    pub async fn start_call(
        &self,
        target: CallTarget,
        kind: MediaKind,
    ) -> Result<(), SessionError> {
        let mut session = self.session.write().await;
        if session.is_some() {
            return Err(SessionError::AlreadyInCall);
        }

        let acquired = self.media.acquire(kind).await?;
        let mode = target.mode();
        let chat_id = target.chat_id().clone();

        if let Err(e) = self.open_outgoing(&target, &acquired, kind).await {
            self.registry.close_all().await;
            acquired.stream.stop();
            return Err(e);
        }

        let counterpart_user = match &target {
            CallTarget::Direct { user_id, .. } => Some(user_id.clone()),
            CallTarget::Group { .. } => None,
        };

        let call = ActiveCall {
            direction: CallDirection::Outgoing,
            mode,
            state: SessionState::Outgoing,
            chat_id,
            requested_kind: kind,
            effective_kind: acquired.kind,
            degraded: acquired.degraded,
            muted: false,
            video_enabled: acquired.kind.has_video(),
            ring: RingState::Outgoing,
            connected_at: None,
            counterpart_user,
            counterpart_socket: None,
            pending_offer: None,
            local_stream: Arc::clone(&acquired.stream),
        };
        tracing::info!(mode = ?mode, kind = ?acquired.kind, "Outgoing call started");

        self.detector
            .attach(SpeakerId::Local, Arc::clone(&acquired.stream))
            .await;
        if acquired.degraded {
            self.emit(SessionEvent::MediaDegraded);
        }
        *session = Some(call);
        self.publish(session.as_ref()).await;
        self.emit(SessionEvent::StateChanged(SessionState::Outgoing));
        Ok(())
    }

    /// Link/offer setup for an outgoing call; session lock held by caller
    async fn open_outgoing(
        &self,
        target: &CallTarget,
        acquired: &AcquiredMedia,
        requested: MediaKind,
    ) -> Result<(), SessionError> {
        self.registry
            .set_local_stream(Some(Arc::clone(&acquired.stream)))
            .await;

        match target {
            CallTarget::Direct { user_id, chat_id } => {
                let handle = self.registry.create_link(PeerKey::Pending, true).await?;
                let offer = handle
                    .create_offer()
                    .await
                    .map_err(RegistryError::Engine)?;
                self.signaling
                    .send(OutboundMessage::Start {
                        target: Some(user_id.clone()),
                        chat_id: chat_id.clone(),
                        offer: Some(offer),
                        is_video: requested.has_video(),
                        is_group: false,
                    })
                    .await?;
            }
            CallTarget::Group { chat_id } => {
                self.signaling
                    .send(OutboundMessage::Start {
                        target: None,
                        chat_id: chat_id.clone(),
                        offer: None,
                        is_video: requested.has_video(),
                        is_group: true,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Answer the incoming call
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoIncomingCall`] unless a call is ringing,
    /// or the media/registry/signaling failure that aborted the answer. On
    /// failure the session is torn down rather than left half-open.
    #[tracing::instrument(skip(self))]
    pub async fn answer_call(&self) -> Result<(), SessionError> {
        let mut session = self.session.write().await;
        let call = session
            .as_mut()
            .filter(|c| c.state == SessionState::Incoming)
            .ok_or(SessionError::NoIncomingCall)?;

        let acquired = match self.media.acquire(call.requested_kind).await {
            Ok(acquired) => acquired,
            Err(e) => {
                // Without local media the call attempt is over; push the
                // caller off ring too.
                let refusal = match (call.is_group(), call.counterpart_socket.clone()) {
                    (false, Some(socket)) => Some(OutboundMessage::Reject {
                        to: socket,
                        chat_id: call.chat_id.clone(),
                        is_video: call.requested_kind.has_video(),
                    }),
                    _ => None,
                };
                let call = session.take();
                drop(session);
                if let Some(refusal) = refusal {
                    if let Err(send_err) = self.signaling.send(refusal).await {
                        tracing::warn!(error = %send_err, "Failed to refuse after media error");
                    }
                }
                self.emit(SessionEvent::CallFailed {
                    reason: EndReason::MediaUnavailable,
                });
                self.teardown_inner(call, EndReason::MediaUnavailable).await;
                return Err(e.into());
            }
        };
        call.effective_kind = acquired.kind;
        call.degraded = acquired.degraded;
        call.video_enabled = acquired.kind.has_video() && call.video_enabled;
        call.local_stream = Arc::clone(&acquired.stream);
        // Toggles made while ringing were recorded against the placeholder
        // stream; carry them onto the real tracks.
        acquired.stream.set_audio_enabled(!call.muted);
        if acquired.kind.has_video() {
            acquired.stream.set_video_enabled(call.video_enabled);
        }
        self.registry
            .set_local_stream(Some(Arc::clone(&acquired.stream)))
            .await;

        let result = match call.mode {
            CallMode::Direct => self.connect_direct_answer(call).await,
            CallMode::Group => self
                .signaling
                .send(OutboundMessage::Join {
                    chat_id: call.chat_id.clone(),
                })
                .await
                .map_err(SessionError::from),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "Answer failed, tearing down");
            let call = session.take();
            drop(session);
            self.teardown_inner(call, EndReason::ConnectionLost).await;
            return Err(e);
        }

        call.state = SessionState::Connected;
        call.ring = RingState::None;
        call.connected_at = Some(chrono::Utc::now());
        tracing::info!(mode = ?call.mode, "Call answered");

        self.detector
            .attach(SpeakerId::Local, Arc::clone(&acquired.stream))
            .await;
        if acquired.degraded {
            self.emit(SessionEvent::MediaDegraded);
        }
        self.publish(session.as_ref()).await;
        self.emit(SessionEvent::StateChanged(SessionState::Connected));
        Ok(())
    }

    /// Direct-answer negotiation; session lock held by caller
    async fn connect_direct_answer(&self, call: &mut ActiveCall) -> Result<(), SessionError> {
        let socket = call
            .counterpart_socket
            .clone()
            .ok_or(SessionError::NoIncomingCall)?;
        let offer = call
            .pending_offer
            .take()
            .ok_or(SessionError::NoIncomingCall)?;

        let key = PeerKey::Resolved(socket.clone());
        let handle = self.registry.create_link(key.clone(), false).await?;
        self.registry.apply_remote_description(&key, offer).await?;
        let answer = handle
            .create_answer()
            .await
            .map_err(RegistryError::Engine)?;
        self.signaling
            .send(OutboundMessage::Answer { to: socket, answer })
            .await?;
        Ok(())
    }

    /// Reject the incoming call and return to idle
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoIncomingCall`] unless a call is ringing
    #[tracing::instrument(skip(self))]
    pub async fn reject_call(&self) -> Result<(), SessionError> {
        let call = {
            let mut session = self.session.write().await;
            match session.as_ref() {
                Some(c) if c.state == SessionState::Incoming => session.take(),
                _ => return Err(SessionError::NoIncomingCall),
            }
        };

        if let Some(call) = &call {
            if !call.is_group() {
                if let Some(socket) = call.counterpart_socket.clone() {
                    self.signaling
                        .send(OutboundMessage::Reject {
                            to: socket,
                            chat_id: call.chat_id.clone(),
                            is_video: call.requested_kind.has_video(),
                        })
                        .await?;
                }
            }
        }
        self.teardown_inner(call, EndReason::LocalReject).await;
        Ok(())
    }

    /// Hang up the current call; no-op when idle
    ///
    /// # Errors
    ///
    /// Returns error if the hangup notification could not be sent; the
    /// local session is torn down regardless.
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self) -> Result<(), SessionError> {
        let call = self.session.write().await.take();
        let Some(call) = call else {
            return Ok(());
        };

        let message = if call.is_group() {
            OutboundMessage::Leave {
                chat_id: call.chat_id.clone(),
            }
        } else {
            OutboundMessage::End {
                to: call.counterpart_socket.clone(),
                target: call.counterpart_user.clone(),
                chat_id: call.chat_id.clone(),
                is_video: call.requested_kind.has_video(),
            }
        };
        let sent = self.signaling.send(message).await;

        self.teardown_inner(Some(call), EndReason::LocalHangup).await;
        sent.map_err(SessionError::from)
    }

    /// Toggle the local audio track; returns the new muted flag
    ///
    /// No-op returning `false` when idle.
    pub async fn toggle_mute(&self) -> bool {
        let mut session = self.session.write().await;
        let Some(call) = session.as_mut() else {
            return false;
        };
        call.muted = !call.muted;
        call.local_stream.set_audio_enabled(!call.muted);
        tracing::debug!(muted = call.muted, "Mute toggled");
        let muted = call.muted;
        self.publish(session.as_ref()).await;
        muted
    }

    /// Toggle the local video track; returns the new enabled flag
    ///
    /// No-op returning `false` when idle or when the effective media kind
    /// carries no video (including after a degraded fallback).
    pub async fn toggle_video(&self) -> bool {
        let mut session = self.session.write().await;
        let Some(call) = session.as_mut() else {
            return false;
        };
        if !call.effective_kind.has_video() {
            return false;
        }
        call.video_enabled = !call.video_enabled;
        call.local_stream.set_video_enabled(call.video_enabled);
        tracing::debug!(enabled = call.video_enabled, "Video toggled");
        let enabled = call.video_enabled;
        self.publish(session.as_ref()).await;
        enabled
    }

    // ---- inbound signaling ----

    /// Dispatch one inbound signaling event
    ///
    /// Events that do not fit the current state are logged and ignored;
    /// the session never transitions on a stale or mismatched event.
    ///
    /// # Errors
    ///
    /// Returns error if reacting to the event required a send or engine
    /// operation that failed
    #[tracing::instrument(skip(self, event), fields(kind = event.kind()))]
    pub async fn handle_signaling(&self, event: SignalingEvent) -> Result<(), SessionError> {
        match event {
            SignalingEvent::Incoming {
                from_socket_id,
                caller_id,
                caller_name,
                caller_avatar,
                chat_id,
                offer,
                is_video,
                is_group,
            } => {
                self.on_incoming(
                    from_socket_id,
                    caller_id,
                    caller_name,
                    caller_avatar,
                    chat_id,
                    offer,
                    is_video,
                    is_group,
                )
                .await
            }
            SignalingEvent::PeerJoined {
                peer_id,
                peer_socket_id,
                peer_name,
                peer_avatar,
            } => {
                self.on_peer_joined(peer_id, peer_socket_id, peer_name, peer_avatar)
                    .await
            }
            SignalingEvent::Offer {
                from,
                offer,
                caller_name,
                caller_avatar,
                caller_id,
            } => {
                self.on_offer(from, offer, caller_name, caller_avatar, caller_id)
                    .await
            }
            SignalingEvent::Answered {
                responder_socket_id,
                answer,
            } => self.on_answered(responder_socket_id, answer).await,
            SignalingEvent::IceCandidate { from, candidate } => {
                if self.session.read().await.is_some() {
                    self.registry
                        .queue_or_apply_candidate(&PeerKey::Resolved(from), candidate)
                        .await?;
                } else {
                    tracing::debug!("Candidate with no session dropped");
                }
                Ok(())
            }
            SignalingEvent::PeerLeft { peer_socket_id } => {
                self.on_peer_left(peer_socket_id).await;
                Ok(())
            }
            SignalingEvent::Ended { ender_id } => {
                self.on_ended(ender_id).await;
                Ok(())
            }
            SignalingEvent::Rejected => {
                self.on_call_refused(EndReason::RemoteRejected).await;
                Ok(())
            }
            SignalingEvent::Busy => {
                self.on_call_refused(EndReason::RemoteBusy).await;
                Ok(())
            }
            SignalingEvent::Offline => {
                self.on_call_refused(EndReason::RemoteOffline).await;
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_incoming(
        &self,
        from_socket_id: PeerId,
        caller_id: UserId,
        caller_name: String,
        caller_avatar: Option<String>,
        chat_id: ChatId,
        offer: Option<SessionDescription>,
        is_video: bool,
        is_group: bool,
    ) -> Result<(), SessionError> {
        let mut session = self.session.write().await;
        if session.is_some() {
            tracing::info!(caller = %caller_id, "Busy, refusing incoming call");
            self.signaling
                .send(OutboundMessage::Busy { to: from_socket_id })
                .await?;
            return Ok(());
        }
        if !is_group && offer.is_none() {
            tracing::warn!(caller = %caller_id, "Direct call without offer ignored");
            return Ok(());
        }

        let info = ParticipantInfo {
            user_id: caller_id.clone(),
            display_name: caller_name,
            avatar_url: caller_avatar,
        };
        self.registry
            .upsert_participant(from_socket_id.clone(), info)
            .await;

        *session = Some(ActiveCall {
            direction: CallDirection::Incoming,
            mode: if is_group {
                CallMode::Group
            } else {
                CallMode::Direct
            },
            state: SessionState::Incoming,
            chat_id,
            requested_kind: MediaKind::from_is_video(is_video),
            effective_kind: MediaKind::from_is_video(is_video),
            degraded: false,
            muted: false,
            video_enabled: is_video,
            ring: RingState::Incoming,
            connected_at: None,
            counterpart_user: Some(caller_id.clone()),
            counterpart_socket: Some(from_socket_id),
            pending_offer: offer,
            local_stream: Arc::new(NullStream),
        });
        tracing::info!(caller = %caller_id, is_group, is_video, "Incoming call");

        self.publish(session.as_ref()).await;
        self.emit(SessionEvent::StateChanged(SessionState::Incoming));
        Ok(())
    }

    async fn on_peer_joined(
        &self,
        peer_id: UserId,
        peer_socket_id: PeerId,
        peer_name: String,
        peer_avatar: Option<String>,
    ) -> Result<(), SessionError> {
        let mut session = self.session.write().await;
        let Some(call) = session.as_mut().filter(|c| c.is_group()) else {
            tracing::debug!(peer = %peer_socket_id, "peer-joined outside a group call ignored");
            return Ok(());
        };

        let info = ParticipantInfo {
            user_id: peer_id,
            display_name: peer_name,
            avatar_url: peer_avatar,
        };
        self.registry
            .upsert_participant(peer_socket_id.clone(), info.clone())
            .await;

        // The side already in the room initiates toward each joiner.
        let key = PeerKey::Resolved(peer_socket_id.clone());
        let handle = self.registry.create_link(key, true).await?;
        let offer = handle
            .create_offer()
            .await
            .map_err(RegistryError::Engine)?;
        self.signaling
            .send(OutboundMessage::Offer {
                to: peer_socket_id.clone(),
                offer,
            })
            .await?;
        tracing::info!(peer = %peer_socket_id, "Offered to joining participant");

        let mut state_changed = None;
        if call.state == SessionState::Outgoing {
            call.state = SessionState::Connected;
            call.ring = RingState::None;
            call.connected_at = Some(chrono::Utc::now());
            state_changed = Some(SessionState::Connected);
        }
        self.publish(session.as_ref()).await;
        self.emit(SessionEvent::ParticipantJoined {
            peer: peer_socket_id,
            info,
        });
        if let Some(state) = state_changed {
            self.emit(SessionEvent::StateChanged(state));
        }
        Ok(())
    }

    async fn on_offer(
        &self,
        from: PeerId,
        offer: SessionDescription,
        caller_name: Option<String>,
        caller_avatar: Option<String>,
        caller_id: Option<UserId>,
    ) -> Result<(), SessionError> {
        let mut session = self.session.write().await;
        let Some(call) = session.as_mut() else {
            tracing::debug!(from = %from, "Offer with no session ignored");
            return Ok(());
        };

        if let Some(user_id) = caller_id {
            self.registry
                .upsert_participant(
                    from.clone(),
                    ParticipantInfo {
                        display_name: caller_name.unwrap_or_else(|| user_id.0.clone()),
                        avatar_url: caller_avatar,
                        user_id,
                    },
                )
                .await;
        }

        let key = PeerKey::Resolved(from.clone());
        let handle = self.registry.create_link(key.clone(), false).await?;
        match self.registry.apply_remote_description(&key, offer).await {
            Ok(()) => {}
            Err(RegistryError::DescriptionAlreadySet(_)) => {
                tracing::warn!(from = %from, "Duplicate offer in round ignored");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        let answer = handle
            .create_answer()
            .await
            .map_err(RegistryError::Engine)?;
        self.signaling
            .send(OutboundMessage::Answer {
                to: from.clone(),
                answer,
            })
            .await?;
        tracing::info!(from = %from, "Answered peer offer");

        if call.is_group() && call.state == SessionState::Outgoing {
            call.state = SessionState::Connected;
            call.ring = RingState::None;
            call.connected_at = Some(chrono::Utc::now());
            self.publish(session.as_ref()).await;
            self.emit(SessionEvent::StateChanged(SessionState::Connected));
        } else {
            self.publish(session.as_ref()).await;
        }
        Ok(())
    }

    async fn on_answered(
        &self,
        responder_socket_id: PeerId,
        answer: SessionDescription,
    ) -> Result<(), SessionError> {
        let mut session = self.session.write().await;
        let Some(call) = session.as_mut().filter(|c| {
            !c.is_group()
                && c.direction == CallDirection::Outgoing
                && c.state == SessionState::Outgoing
        }) else {
            tracing::warn!(responder = %responder_socket_id, "Unexpected answer ignored");
            return Ok(());
        };

        self.registry
            .remap_placeholder(responder_socket_id.clone())
            .await?;
        let key = PeerKey::Resolved(responder_socket_id.clone());
        match self.registry.apply_remote_description(&key, answer).await {
            Ok(()) => {}
            Err(RegistryError::DescriptionAlreadySet(_)) => {
                tracing::warn!(responder = %responder_socket_id, "Duplicate answer ignored");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(user_id) = call.counterpart_user.clone() {
            self.registry
                .upsert_participant(
                    responder_socket_id.clone(),
                    ParticipantInfo {
                        display_name: user_id.0.clone(),
                        avatar_url: None,
                        user_id,
                    },
                )
                .await;
        }
        call.counterpart_socket = Some(responder_socket_id.clone());
        call.state = SessionState::Connected;
        call.ring = RingState::None;
        call.connected_at = Some(chrono::Utc::now());
        tracing::info!(responder = %responder_socket_id, "Direct call answered");

        // A remote track that arrived while the link was still pending is
        // parked in the registry; surface it now under the real identity.
        let parked: Vec<_> = self
            .registry
            .remote_streams()
            .await
            .into_iter()
            .filter(|(k, _)| *k == key)
            .collect();

        self.publish(session.as_ref()).await;
        drop(session);

        for (_, stream) in parked {
            self.surface_remote_stream(responder_socket_id.clone(), stream)
                .await;
        }
        self.emit(SessionEvent::StateChanged(SessionState::Connected));
        Ok(())
    }

    async fn on_peer_left(&self, peer_socket_id: PeerId) {
        let is_group = {
            let session = self.session.read().await;
            match session.as_ref() {
                Some(call) => call.is_group(),
                None => {
                    tracing::debug!(peer = %peer_socket_id, "peer-left with no session ignored");
                    return;
                }
            }
        };

        let key = PeerKey::Resolved(peer_socket_id.clone());
        self.registry.close_link(&key).await;

        if is_group {
            tracing::info!(peer = %peer_socket_id, "Participant left");
            self.detector
                .detach(&SpeakerId::Peer(peer_socket_id.clone()))
                .await;
            self.emit(SessionEvent::RemoteStreamRemoved {
                peer: peer_socket_id.clone(),
            });
            self.emit(SessionEvent::ParticipantLeft {
                peer: peer_socket_id,
            });
            self.refresh_snapshot().await;
        } else {
            tracing::info!(peer = %peer_socket_id, "Counterpart left, ending call");
            self.teardown(EndReason::RemoteEnded).await;
        }
    }

    async fn on_ended(&self, ender_id: UserId) {
        let is_direct = {
            let session = self.session.read().await;
            session.as_ref().is_some_and(|c| !c.is_group())
        };
        if is_direct {
            tracing::info!(ender = %ender_id, "Remote party ended the call");
            self.teardown(EndReason::RemoteEnded).await;
        } else {
            // Group calls end for the local user only by leaving; a stray
            // "ended" does not take the whole room down.
            tracing::debug!(ender = %ender_id, "ended outside a direct call ignored");
        }
    }

    async fn on_call_refused(&self, reason: EndReason) {
        let refusable = {
            let session = self.session.read().await;
            session
                .as_ref()
                .is_some_and(|c| c.direction == CallDirection::Outgoing)
        };
        if !refusable {
            tracing::debug!(reason = ?reason, "Refusal outside an outgoing call ignored");
            return;
        }
        tracing::info!(reason = ?reason, "Call refused");
        self.emit(SessionEvent::CallFailed { reason });
        self.teardown(reason).await;
    }

    // ---- teardown ----

    /// End the session and return to idle, emitting `SessionEnded`
    ///
    /// Idempotent; safe to call with no session.
    async fn teardown(&self, reason: EndReason) {
        let call = self.session.write().await.take();
        self.teardown_inner(call, reason).await;
    }

    async fn teardown_inner(&self, call: Option<ActiveCall>, reason: EndReason) {
        let Some(call) = call else {
            return;
        };
        tracing::info!(reason = ?reason, "Session teardown");
        self.detector.detach_all().await;
        self.registry.close_all().await;
        call.local_stream.stop();
        self.snapshot_tx.send_replace(SessionSnapshot::idle());
        self.emit(SessionEvent::SessionEnded { reason });
        self.emit(SessionEvent::StateChanged(SessionState::Idle));
    }

    // ---- observation ----

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Watch the snapshot for changes
    #[must_use]
    pub fn watch_snapshot(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Subscribe to session notifications
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Watch the active-speaker set
    #[must_use]
    pub fn active_speakers(&self) -> watch::Receiver<ActiveSpeakerSet> {
        self.detector.subscribe()
    }

    /// The local stream of the current call, if one is live
    #[must_use]
    pub async fn local_stream(&self) -> Option<Arc<dyn MediaStreamHandle>> {
        self.session
            .read()
            .await
            .as_ref()
            .filter(|c| c.state != SessionState::Incoming)
            .map(|c| Arc::clone(&c.local_stream))
    }

    /// Remote streams of the current call, keyed by peer
    #[must_use]
    pub async fn remote_streams(&self) -> Vec<(PeerKey, Arc<dyn MediaStreamHandle>)> {
        self.registry.remote_streams().await
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine; events are advisory.
        let _ = self.events_tx.send(event);
    }

    /// Rebuild and publish the snapshot from the current session
    async fn refresh_snapshot(&self) {
        let session = self.session.read().await;
        self.publish(session.as_ref()).await;
    }

    async fn publish(&self, call: Option<&ActiveCall>) {
        let snapshot = match call {
            None => SessionSnapshot::idle(),
            Some(call) => SessionSnapshot {
                state: call.state,
                direction: Some(call.direction),
                mode: Some(call.mode),
                media_kind: Some(call.effective_kind),
                chat_id: Some(call.chat_id.clone()),
                degraded: call.degraded,
                muted: call.muted,
                video_enabled: call.video_enabled,
                ring: call.ring,
                connected_at: call.connected_at,
                participants: self.registry.participants().await,
            },
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}

impl Drop for CallSessionManager {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

/// Placeholder stream for a ringing incoming call, before media is
/// acquired by `answer_call`
struct NullStream;

impl MediaStreamHandle for NullStream {
    fn id(&self) -> &str {
        "none"
    }
    fn has_audio(&self) -> bool {
        false
    }
    fn has_video(&self) -> bool {
        false
    }
    fn set_audio_enabled(&self, _enabled: bool) {}
    fn set_video_enabled(&self, _enabled: bool) {}
    fn audio_level(&self) -> f32 {
        0.0
    }
    fn stop(&self) {}
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sim::{SimEngine, SimMediaDevices, SimSignaling};

    struct Harness {
        engine: Arc<SimEngine>,
        signaling: Arc<SimSignaling>,
        manager: Arc<CallSessionManager>,
    }

    fn harness() -> Harness {
        let engine = Arc::new(SimEngine::new());
        let devices = Arc::new(SimMediaDevices::new());
        let signaling = Arc::new(SimSignaling::new());
        let manager = CallSessionManager::new(
            engine.clone(),
            devices,
            signaling.clone(),
            SessionConfig::default(),
        );
        Harness {
            engine,
            signaling,
            manager,
        }
    }

    fn incoming_direct(socket: &str) -> SignalingEvent {
        SignalingEvent::Incoming {
            from_socket_id: PeerId::new(socket),
            caller_id: UserId::new("alice"),
            caller_name: "Alice".into(),
            caller_avatar: None,
            chat_id: ChatId::new("dm-1"),
            offer: Some(SessionDescription::offer("v=0 offer")),
            is_video: false,
            is_group: false,
        }
    }

    #[tokio::test]
    async fn test_start_requires_idle() {
        let h = harness();
        let target = CallTarget::Direct {
            user_id: UserId::new("bob"),
            chat_id: ChatId::new("dm-1"),
        };
        h.manager
            .start_call(target.clone(), MediaKind::Audio)
            .await
            .unwrap();
        let second = h.manager.start_call(target, MediaKind::Audio).await;
        assert!(matches!(second, Err(SessionError::AlreadyInCall)));
    }

    #[tokio::test]
    async fn test_incoming_while_busy_refused_with_busy() {
        let h = harness();
        h.manager
            .handle_signaling(incoming_direct("s1"))
            .await
            .unwrap();
        h.signaling.take_sent();

        h.manager
            .handle_signaling(incoming_direct("s2"))
            .await
            .unwrap();

        let sent = h.signaling.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            OutboundMessage::Busy { to } if to.as_str() == "s2"
        ));
        // The existing ringing session is untouched.
        assert_eq!(h.manager.snapshot().state, SessionState::Incoming);
        assert_eq!(h.engine.created_count(), 0);
    }

    #[tokio::test]
    async fn test_incoming_during_outgoing_call_refused_with_busy() {
        let h = harness();
        h.manager
            .start_call(
                CallTarget::Direct {
                    user_id: UserId::new("bob"),
                    chat_id: ChatId::new("dm-1"),
                },
                MediaKind::Audio,
            )
            .await
            .unwrap();
        h.signaling.take_sent();

        h.manager
            .handle_signaling(incoming_direct("carol-sock"))
            .await
            .unwrap();

        let sent = h.signaling.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            OutboundMessage::Busy { to } if to.as_str() == "carol-sock"
        ));
        // The outgoing attempt keeps ringing.
        let snap = h.manager.snapshot();
        assert_eq!(snap.state, SessionState::Outgoing);
        assert_eq!(snap.ring, RingState::Outgoing);
    }

    #[tokio::test]
    async fn test_direct_incoming_without_offer_ignored() {
        let h = harness();
        h.manager
            .handle_signaling(SignalingEvent::Incoming {
                from_socket_id: PeerId::new("s1"),
                caller_id: UserId::new("alice"),
                caller_name: "Alice".into(),
                caller_avatar: None,
                chat_id: ChatId::new("dm-1"),
                offer: None,
                is_video: false,
                is_group: false,
            })
            .await
            .unwrap();
        assert_eq!(h.manager.snapshot().state, SessionState::Idle);
        assert!(h.signaling.take_sent().is_empty());
    }

    #[tokio::test]
    async fn test_answer_requires_ringing() {
        let h = harness();
        let result = h.manager.answer_call().await;
        assert!(matches!(result, Err(SessionError::NoIncomingCall)));
    }

    #[tokio::test]
    async fn test_toggles_are_noops_when_idle() {
        let h = harness();
        assert!(!h.manager.toggle_mute().await);
        assert!(!h.manager.toggle_video().await);
        assert_eq!(h.manager.snapshot().state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_end_call_when_idle_is_noop() {
        let h = harness();
        h.manager.end_call().await.unwrap();
        assert!(h.signaling.take_sent().is_empty());
    }

    #[tokio::test]
    async fn test_video_toggle_refused_after_degraded_fallback() {
        let engine = Arc::new(SimEngine::new());
        let devices = Arc::new(SimMediaDevices::new());
        devices.fail_video_with(crate::sim::SimMediaFailure::DeviceBusy);
        let signaling = Arc::new(SimSignaling::new());
        let manager = CallSessionManager::new(
            engine,
            devices,
            signaling,
            SessionConfig::default(),
        );

        manager
            .start_call(
                CallTarget::Group {
                    chat_id: ChatId::new("room"),
                },
                MediaKind::AudioVideo,
            )
            .await
            .unwrap();

        let snap = manager.snapshot();
        assert!(snap.degraded);
        assert_eq!(snap.media_kind, Some(MediaKind::Audio));
        assert!(!manager.toggle_video().await);
    }
}
