//! Core call types and data structures

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Transport-assigned peer identifier
///
/// Identifies one connected participant's leg of a call. It is transient —
/// a participant gets a fresh one every time they connect — and distinct
/// from their durable [`UserId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create a new peer identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Durable user identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    /// Create a new user identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chat/room identifier the call is associated with
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub String);

impl ChatId {
    /// Create a new chat identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Two-phase peer identity for registry keys
///
/// A direct outgoing call creates its link before signaling has delivered
/// the answering peer's identifier, so the link starts life under
/// [`PeerKey::Pending`]. The registry's remap operation is the single
/// allowed `Pending → Resolved` transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerKey {
    /// Identity not yet known (direct-call initiator before the answer)
    Pending,
    /// Resolved transport-assigned identifier
    Resolved(PeerId),
}

impl PeerKey {
    /// Get the resolved peer id, if any
    #[must_use]
    pub fn peer_id(&self) -> Option<&PeerId> {
        match self {
            Self::Pending => None,
            Self::Resolved(id) => Some(id),
        }
    }

    /// Check whether this key is still the placeholder
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "<pending>"),
            Self::Resolved(id) => write!(f, "{id}"),
        }
    }
}

impl From<PeerId> for PeerKey {
    fn from(id: PeerId) -> Self {
        Self::Resolved(id)
    }
}

/// Who initiated the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// The local user initiated the call
    Outgoing,
    /// A remote party initiated the call
    Incoming,
}

/// Call topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallMode {
    /// One-to-one call
    Direct,
    /// Multi-party full-mesh call
    Group,
}

/// Requested media combination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    /// Audio only
    Audio,
    /// Audio and video
    AudioVideo,
}

impl MediaKind {
    /// Check if video is part of this media kind
    #[must_use]
    pub fn has_video(&self) -> bool {
        matches!(self, Self::AudioVideo)
    }

    /// Media kind implied by a signaling `is_video` flag
    #[must_use]
    pub fn from_is_video(is_video: bool) -> Self {
        if is_video {
            Self::AudioVideo
        } else {
            Self::Audio
        }
    }
}

/// Session state enumeration
///
/// `Idle` is both the initial and terminal state. `Outgoing` covers the
/// dialing and ringing phases of an initiated call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No active call
    Idle,
    /// A remote party is calling, not yet answered
    Incoming,
    /// A local call is dialing/ringing
    Outgoing,
    /// Call is live
    Connected,
}

/// Ring indicator requested of the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RingState {
    /// No indicator
    None,
    /// Incoming ring tone
    Incoming,
    /// Outgoing ring-back tone
    Outgoing,
}

/// Durable-identity metadata for one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    /// Durable user identifier
    pub user_id: UserId,
    /// Display name
    pub display_name: String,
    /// Avatar reference, if any
    pub avatar_url: Option<String>,
}

/// A participant currently classified as speaking
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpeakerId {
    /// The local user
    Local,
    /// A remote peer
    Peer(PeerId),
}

impl fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Peer(id) => write!(f, "{id}"),
        }
    }
}

/// Set of speakers currently above the speaking threshold
pub type ActiveSpeakerSet = HashSet<SpeakerId>;

/// What the local user is calling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    /// One-to-one call to a single user
    Direct {
        /// The callee's durable identity
        user_id: UserId,
        /// Chat the call belongs to
        chat_id: ChatId,
    },
    /// Multi-party call in a group room
    Group {
        /// Room the call belongs to
        chat_id: ChatId,
    },
}

impl CallTarget {
    /// Call mode implied by this target
    #[must_use]
    pub fn mode(&self) -> CallMode {
        match self {
            Self::Direct { .. } => CallMode::Direct,
            Self::Group { .. } => CallMode::Group,
        }
    }

    /// Chat the call belongs to
    #[must_use]
    pub fn chat_id(&self) -> &ChatId {
        match self {
            Self::Direct { chat_id, .. } | Self::Group { chat_id } => chat_id,
        }
    }
}

/// Read-only view of the session published to the UI layer
///
/// Replaced wholesale on every state-affecting transition; freely shared
/// for reads, mutated only by the session manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Current lifecycle state
    pub state: SessionState,
    /// Direction, when a call exists
    pub direction: Option<CallDirection>,
    /// Topology, when a call exists
    pub mode: Option<CallMode>,
    /// Effective media kind (reflects the audio-only fallback)
    pub media_kind: Option<MediaKind>,
    /// Chat the call belongs to
    pub chat_id: Option<ChatId>,
    /// Whether video was requested but acquisition fell back to audio
    pub degraded: bool,
    /// Whether the local audio track is muted
    pub muted: bool,
    /// Whether the local video track is enabled
    pub video_enabled: bool,
    /// Ring indicator the UI should play
    pub ring: RingState,
    /// When the call reached `Connected`, if it has
    pub connected_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Known participants, keyed by transient peer id
    pub participants: Vec<(PeerId, ParticipantInfo)>,
}

impl SessionSnapshot {
    /// Snapshot of the idle state
    #[must_use]
    pub fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            direction: None,
            mode: None,
            media_kind: None,
            chat_id: None,
            degraded: false,
            muted: false,
            video_enabled: false,
            ring: RingState::None,
            connected_at: None,
            participants: Vec::new(),
        }
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}
