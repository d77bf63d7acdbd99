//! Peer-connection engine capability
//!
//! The concrete WebRTC engine (SDP generation, ICE gathering, media
//! encoding) is consumed as an opaque capability behind these traits, never
//! reimplemented here. An engine implementation reports asynchronous link
//! activity — locally gathered candidates, remote track arrival, connection
//! state changes — through the mpsc sender handed to it at construction.

use crate::media::MediaStreamHandle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// Negotiation failed (offer/answer/description handling)
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// ICE candidate could not be applied
    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    /// Connection object is closed or unusable
    #[error("Connection closed")]
    Closed,

    /// Any other engine failure
    #[error("Engine error: {0}")]
    Other(String),
}

/// Which side of the negotiation a description represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Initiator's description
    Offer,
    /// Responder's description
    Answer,
}

/// Negotiated media/connection parameters exchanged to establish a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// SDP content
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A discovered network path proposal for a peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP media ID
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_mline_index: Option<u32>,
}

impl IceCandidate {
    /// Create a candidate from its candidate string
    #[must_use]
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Stable identifier for one peer connection
///
/// Survives the registry's placeholder remap, so notices emitted by the
/// engine stay addressable while the peer's registry key changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkId(pub Uuid);

impl LinkId {
    /// Create a new random link identifier
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection state reported by the engine for one link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkConnectionState {
    /// Freshly created
    New,
    /// Negotiating connectivity
    Connecting,
    /// Media can flow
    Connected,
    /// Connectivity lost
    Disconnected,
    /// Connectivity irrecoverably failed
    Failed,
    /// Closed locally
    Closed,
}

impl LinkConnectionState {
    /// Whether this state means the link is gone and must be closed
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Asynchronous activity reported by the engine for one link
#[derive(Clone)]
pub enum LinkNotice {
    /// A locally gathered candidate that must be forwarded to the peer
    LocalCandidate(IceCandidate),
    /// A remote media stream arrived on this link
    RemoteTrack(Arc<dyn MediaStreamHandle>),
    /// Connection state changed
    StateChanged(LinkConnectionState),
}

impl fmt::Debug for LinkNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalCandidate(c) => f
                .debug_tuple("LocalCandidate")
                .field(&c.candidate)
                .finish(),
            Self::RemoteTrack(s) => f.debug_tuple("RemoteTrack").field(&s.id()).finish(),
            Self::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
        }
    }
}

/// A notice tagged with the link it concerns
#[derive(Debug, Clone)]
pub struct LinkEvent {
    /// Which connection the notice is about
    pub link: LinkId,
    /// What happened
    pub notice: LinkNotice,
}

/// Handle to one underlying peer connection
///
/// Exclusively owned by its `PeerLink`; closed exactly once when the link
/// is destroyed.
#[async_trait::async_trait]
pub trait PeerConnectionHandle: Send + Sync {
    /// Create an offer and install it as the local description
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot generate a description
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    /// Create an answer and install it as the local description
    ///
    /// Valid only after a remote offer has been applied.
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot generate a description
    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    /// Apply the remote party's description
    ///
    /// # Errors
    ///
    /// Returns error if the description is rejected by the engine
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    /// Apply a remote ICE candidate
    ///
    /// # Errors
    ///
    /// Returns error if the candidate is rejected by the engine
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    /// Attach the local media stream's tracks to this connection
    ///
    /// # Errors
    ///
    /// Returns error if tracks cannot be attached
    async fn attach_local_stream(
        &self,
        stream: Arc<dyn MediaStreamHandle>,
    ) -> Result<(), EngineError>;

    /// Close the underlying connection, releasing engine resources
    ///
    /// Idempotent.
    async fn close(&self);
}

/// Factory for peer connections
#[async_trait::async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Construct a new peer connection
    ///
    /// The engine reports link activity for the connection through
    /// `notices`, tagged with `link`.
    ///
    /// # Errors
    ///
    /// Returns error if the connection object cannot be constructed
    async fn create(
        &self,
        link: LinkId,
        notices: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerConnectionHandle>, EngineError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_link_id_unique() {
        assert_ne!(LinkId::new(), LinkId::new());
    }

    #[test]
    fn test_terminal_states() {
        assert!(LinkConnectionState::Failed.is_terminal());
        assert!(LinkConnectionState::Disconnected.is_terminal());
        assert!(LinkConnectionState::Closed.is_terminal());
        assert!(!LinkConnectionState::Connected.is_terminal());
        assert!(!LinkConnectionState::Connecting.is_terminal());
    }

    #[test]
    fn test_description_constructors() {
        let offer = SessionDescription::offer("v=0");
        assert_eq!(offer.kind, SdpKind::Offer);
        let answer = SessionDescription::answer("v=0");
        assert_eq!(answer.kind, SdpKind::Answer);
    }

    #[test]
    fn test_description_serialization() {
        let offer = SessionDescription::offer("v=0\r\n");
        let json = serde_json::to_string(&offer).unwrap();
        assert!(json.contains("\"kind\":\"offer\""));
    }
}
