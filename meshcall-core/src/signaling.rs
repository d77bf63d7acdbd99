//! Signaling boundary
//!
//! Inbound events and outbound messages exchanged with the central
//! signaling channel. Delivery, reconnect and backoff are the channel
//! implementation's responsibility, never the session manager's.

use crate::engine::{IceCandidate, SessionDescription};
use crate::types::{ChatId, PeerId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// The channel could not deliver a message
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The channel is closed
    #[error("Channel closed")]
    Closed,
}

/// Inbound signaling events
///
/// A closed set: every event the transport can deliver is a variant here,
/// dispatched to named handlers by the session manager. Unknown or
/// malformed payloads fail deserialization at the transport edge and never
/// reach the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingEvent {
    /// A remote party is calling
    Incoming {
        /// Caller's transient socket id
        from_socket_id: PeerId,
        /// Caller's durable identity
        caller_id: UserId,
        /// Caller's display name
        caller_name: String,
        /// Caller's avatar reference
        caller_avatar: Option<String>,
        /// Chat the call belongs to
        chat_id: ChatId,
        /// Offer description (present for direct calls)
        offer: Option<SessionDescription>,
        /// Whether video was requested
        is_video: bool,
        /// Whether this is a group call
        is_group: bool,
    },

    /// A participant joined the group call
    PeerJoined {
        /// Joiner's durable identity
        peer_id: UserId,
        /// Joiner's transient socket id
        peer_socket_id: PeerId,
        /// Joiner's display name
        peer_name: String,
        /// Joiner's avatar reference
        peer_avatar: Option<String>,
    },

    /// A peer sent us an offer (group full-mesh setup)
    Offer {
        /// Sender's transient socket id
        from: PeerId,
        /// Offer description
        offer: SessionDescription,
        /// Sender's display name, if known
        caller_name: Option<String>,
        /// Sender's avatar reference, if known
        caller_avatar: Option<String>,
        /// Sender's durable identity, if known
        caller_id: Option<UserId>,
    },

    /// The callee answered our direct call
    Answered {
        /// Responder's transient socket id
        responder_socket_id: PeerId,
        /// Answer description
        answer: SessionDescription,
    },

    /// A peer relayed an ICE candidate
    IceCandidate {
        /// Sender's transient socket id
        from: PeerId,
        /// The candidate
        candidate: IceCandidate,
    },

    /// A participant left
    PeerLeft {
        /// Leaver's transient socket id
        peer_socket_id: PeerId,
    },

    /// The remote party ended the call
    Ended {
        /// Ender's durable identity
        ender_id: UserId,
    },

    /// The callee rejected our call
    Rejected,

    /// The callee is in another call
    Busy,

    /// The callee is not connected
    Offline,
}

impl SignalingEvent {
    /// Short variant name for tracing
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Incoming { .. } => "incoming",
            Self::PeerJoined { .. } => "peer-joined",
            Self::Offer { .. } => "offer",
            Self::Answered { .. } => "answered",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::PeerLeft { .. } => "peer-left",
            Self::Ended { .. } => "ended",
            Self::Rejected => "rejected",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }
}

/// Outbound signaling messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundMessage {
    /// Start a call
    Start {
        /// Callee's durable identity (direct calls)
        target: Option<UserId>,
        /// Chat the call belongs to
        chat_id: ChatId,
        /// Offer description (direct calls only; group offers are sent
        /// reactively as peers join)
        offer: Option<SessionDescription>,
        /// Whether video was requested
        is_video: bool,
        /// Whether this is a group call
        is_group: bool,
    },

    /// Join an already-running group call
    Join {
        /// Room to join
        chat_id: ChatId,
    },

    /// Offer to one peer
    Offer {
        /// Addressee's transient socket id
        to: PeerId,
        /// Offer description
        offer: SessionDescription,
    },

    /// Answer to one peer
    Answer {
        /// Addressee's transient socket id
        to: PeerId,
        /// Answer description
        answer: SessionDescription,
    },

    /// Relay an ICE candidate to one peer
    IceCandidate {
        /// Addressee's transient socket id
        to: PeerId,
        /// The candidate
        candidate: IceCandidate,
    },

    /// Reject an incoming call
    Reject {
        /// Caller's transient socket id
        to: PeerId,
        /// Chat the call belongs to
        chat_id: ChatId,
        /// Whether the call requested video
        is_video: bool,
    },

    /// End the call
    End {
        /// Counterpart's transient socket id, when known
        to: Option<PeerId>,
        /// Counterpart's durable user id, for cancelling before the
        /// socket is resolved
        target: Option<UserId>,
        /// Chat the call belongs to
        chat_id: ChatId,
        /// Whether the call requested video
        is_video: bool,
    },

    /// Leave a group call
    Leave {
        /// Room to leave
        chat_id: ChatId,
    },

    /// Refuse an incoming call because a session already exists
    Busy {
        /// Refused caller's transient socket id
        to: PeerId,
    },
}

impl OutboundMessage {
    /// Short variant name for tracing
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Join { .. } => "join",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Reject { .. } => "reject",
            Self::End { .. } => "end",
            Self::Leave { .. } => "leave",
            Self::Busy { .. } => "busy",
        }
    }
}

/// Duplex signaling channel capability
///
/// Implement this for your transport. Inbound events are delivered to the
/// session manager by the application's receive loop calling
/// [`crate::session::CallSessionManager::handle_signaling`].
#[async_trait::async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send a message to the signaling server
    ///
    /// # Errors
    ///
    /// Returns error if the message could not be handed to the transport
    async fn send(&self, message: OutboundMessage) -> Result<(), SignalingError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_inbound_event_tagging() {
        let event = SignalingEvent::Answered {
            responder_socket_id: PeerId::new("s9"),
            answer: SessionDescription::answer("v=0"),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"answered\""));

        let back: SignalingEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_incoming_event_shape() {
        let json = r#"{
            "type": "incoming",
            "from_socket_id": "s1",
            "caller_id": "u1",
            "caller_name": "Alice",
            "caller_avatar": null,
            "chat_id": "c1",
            "offer": {"kind": "offer", "sdp": "v=0"},
            "is_video": true,
            "is_group": false
        }"#;

        let event: SignalingEvent = serde_json::from_str(json).unwrap();
        match event {
            SignalingEvent::Incoming {
                from_socket_id,
                is_video,
                is_group,
                offer,
                ..
            } => {
                assert_eq!(from_socket_id.as_str(), "s1");
                assert!(is_video);
                assert!(!is_group);
                assert!(offer.is_some());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_event_rejected_at_the_edge() {
        let json = r#"{"type": "warp-speed", "to": "s1"}"#;
        assert!(serde_json::from_str::<SignalingEvent>(json).is_err());
    }

    #[test]
    fn test_outbound_busy_shape() {
        let msg = OutboundMessage::Busy {
            to: PeerId::new("s3"),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"busy\""));
        assert_eq!(msg.kind(), "busy");
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(SignalingEvent::Rejected.kind(), "rejected");
        assert_eq!(SignalingEvent::Busy.kind(), "busy");
        assert_eq!(SignalingEvent::Offline.kind(), "offline");
    }
}
