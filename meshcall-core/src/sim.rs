//! In-process simulation of the capability seams
//!
//! Deterministic stand-ins for the connection engine, device layer, and
//! signaling channel. Used by the crate's own tests and by the CLI demo
//! flows; none of these touch real devices or the network.

use crate::engine::{
    EngineError, IceCandidate, LinkConnectionState, LinkEvent, LinkId, LinkNotice,
    PeerConnectionFactory, PeerConnectionHandle, SessionDescription,
};
use crate::media::{MediaDevices, MediaError, MediaStreamHandle};
use crate::signaling::{OutboundMessage, SignalingChannel, SignalingError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Simulated media stream with a settable audio level
pub struct SimStream {
    id: String,
    has_audio: bool,
    has_video: bool,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    level: Mutex<f32>,
    stopped: AtomicBool,
}

impl SimStream {
    /// Create a stream with the given track combination
    #[must_use]
    pub fn new(id: impl Into<String>, has_audio: bool, has_video: bool) -> Self {
        Self {
            id: id.into(),
            has_audio,
            has_video,
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
            level: Mutex::new(0.0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Audio-only stream
    #[must_use]
    pub fn audio_only(id: impl Into<String>) -> Self {
        Self::new(id, true, false)
    }

    /// Audio-and-video stream
    #[must_use]
    pub fn audio_video(id: impl Into<String>) -> Self {
        Self::new(id, true, true)
    }

    /// Set the level reported by [`MediaStreamHandle::audio_level`]
    pub fn set_level(&self, level: f32) {
        *self.level.lock() = level;
    }

    /// Whether `stop` has been called
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Current audio track enabled flag
    #[must_use]
    pub fn is_audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    /// Current video track enabled flag
    #[must_use]
    pub fn is_video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }
}

impl MediaStreamHandle for SimStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn has_audio(&self) -> bool {
        self.has_audio
    }

    fn has_video(&self) -> bool {
        self.has_video
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::SeqCst);
    }

    fn audio_level(&self) -> f32 {
        if self.stopped.load(Ordering::SeqCst) || !self.has_audio {
            0.0
        } else {
            *self.level.lock()
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Failure class a [`SimMediaDevices`] should produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimMediaFailure {
    /// Device held by another application
    DeviceBusy,
    /// Access denied by the user or platform
    PermissionDenied,
    /// No such capture device
    DeviceNotFound,
}

impl SimMediaFailure {
    fn into_error(self) -> MediaError {
        match self {
            Self::DeviceBusy => MediaError::DeviceBusy("sim".into()),
            Self::PermissionDenied => MediaError::PermissionDenied("sim".into()),
            Self::DeviceNotFound => MediaError::DeviceNotFound("sim".into()),
        }
    }
}

/// Simulated device layer with scriptable failures
#[derive(Default)]
pub struct SimMediaDevices {
    fail_video: Mutex<Option<SimMediaFailure>>,
    fail_all: Mutex<Option<SimMediaFailure>>,
    request_count: AtomicUsize,
    granted: Mutex<Vec<Arc<SimStream>>>,
}

impl SimMediaDevices {
    /// Create a device layer that grants every request
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every request that includes video with `failure`
    pub fn fail_video_with(&self, failure: SimMediaFailure) {
        *self.fail_video.lock() = Some(failure);
    }

    /// Fail every request with `failure`
    pub fn fail_all_with(&self, failure: SimMediaFailure) {
        *self.fail_all.lock() = Some(failure);
    }

    /// Number of `get_user_media` calls seen so far
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    /// The most recently granted stream, if any request succeeded
    #[must_use]
    pub fn last_granted(&self) -> Option<Arc<SimStream>> {
        self.granted.lock().last().cloned()
    }
}

#[async_trait::async_trait]
impl MediaDevices for SimMediaDevices {
    async fn get_user_media(
        &self,
        audio: bool,
        video: bool,
    ) -> Result<Arc<dyn MediaStreamHandle>, MediaError> {
        let n = self.request_count.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = *self.fail_all.lock() {
            return Err(failure.into_error());
        }
        if video {
            if let Some(failure) = *self.fail_video.lock() {
                return Err(failure.into_error());
            }
        }
        let stream = Arc::new(SimStream::new(format!("sim-local-{n}"), audio, video));
        self.granted.lock().push(Arc::clone(&stream));
        Ok(stream)
    }
}

/// Simulated peer connection that records what was applied to it
///
/// Tests drive the remote side through the `emit_*` methods, which feed
/// the same notice channel a real engine would.
pub struct SimPeerConnection {
    link: LinkId,
    notices: mpsc::UnboundedSender<LinkEvent>,
    remote_description: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    local_stream: Mutex<Option<Arc<dyn MediaStreamHandle>>>,
    closed: AtomicBool,
}

impl SimPeerConnection {
    fn new(link: LinkId, notices: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            link,
            notices,
            remote_description: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            local_stream: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// The link this connection was created for
    #[must_use]
    pub fn link_id(&self) -> LinkId {
        self.link
    }

    /// The remote description applied so far, if any
    #[must_use]
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().clone()
    }

    /// Every candidate applied so far, in application order
    #[must_use]
    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    /// The attached local stream, if any
    #[must_use]
    pub fn local_stream(&self) -> Option<Arc<dyn MediaStreamHandle>> {
        self.local_stream.lock().clone()
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Emit a locally gathered candidate notice
    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        let _ = self.notices.send(LinkEvent {
            link: self.link,
            notice: LinkNotice::LocalCandidate(candidate),
        });
    }

    /// Emit a remote-track notice
    pub fn emit_remote_track(&self, stream: Arc<dyn MediaStreamHandle>) {
        let _ = self.notices.send(LinkEvent {
            link: self.link,
            notice: LinkNotice::RemoteTrack(stream),
        });
    }

    /// Emit a connection-state notice
    pub fn emit_state(&self, state: LinkConnectionState) {
        let _ = self.notices.send(LinkEvent {
            link: self.link,
            notice: LinkNotice::StateChanged(state),
        });
    }
}

#[async_trait::async_trait]
impl PeerConnectionHandle for SimPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        Ok(SessionDescription::offer(format!("v=0 sim-offer {}", self.link)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        if self.remote_description.lock().is_none() {
            return Err(EngineError::Negotiation(
                "answer requested before remote offer".into(),
            ));
        }
        Ok(SessionDescription::answer(format!(
            "v=0 sim-answer {}",
            self.link
        )))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        *self.remote_description.lock() = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn attach_local_stream(
        &self,
        stream: Arc<dyn MediaStreamHandle>,
    ) -> Result<(), EngineError> {
        *self.local_stream.lock() = Some(stream);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Simulated connection engine
///
/// Hands out [`SimPeerConnection`]s and keeps them in creation order so a
/// test can reach the connection behind any link.
#[derive(Default)]
pub struct SimEngine {
    connections: Mutex<Vec<Arc<SimPeerConnection>>>,
    fail_next: AtomicBool,
}

impl SimEngine {
    /// Create an engine that grants every connection request
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `create` call fail
    pub fn fail_next_create(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Number of connections created so far
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// The `index`-th connection, in creation order
    #[must_use]
    pub fn connection(&self, index: usize) -> Option<Arc<SimPeerConnection>> {
        self.connections.lock().get(index).cloned()
    }

    /// The most recently created connection
    #[must_use]
    pub fn last_connection(&self) -> Option<Arc<SimPeerConnection>> {
        self.connections.lock().last().cloned()
    }
}

#[async_trait::async_trait]
impl PeerConnectionFactory for SimEngine {
    async fn create(
        &self,
        link: LinkId,
        notices: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerConnectionHandle>, EngineError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Other("simulated engine failure".into()));
        }
        let conn = Arc::new(SimPeerConnection::new(link, notices));
        self.connections.lock().push(Arc::clone(&conn));
        Ok(conn)
    }
}

/// Simulated signaling channel that records outbound traffic
#[derive(Default)]
pub struct SimSignaling {
    sent: Mutex<Vec<OutboundMessage>>,
    fail_sends: AtomicBool,
}

impl SimSignaling {
    /// Create a channel that accepts every message
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `send` fail
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Drain and return every message sent since the last call
    #[must_use]
    pub fn take_sent(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.sent.lock())
    }
}

#[async_trait::async_trait]
impl SignalingChannel for SimSignaling {
    async fn send(&self, message: OutboundMessage) -> Result<(), SignalingError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SignalingError::SendFailed("simulated outage".into()));
        }
        tracing::trace!(kind = message.kind(), "Sim signaling send");
        self.sent.lock().push(message);
        Ok(())
    }
}
