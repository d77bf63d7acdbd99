//! Meshcall - call session orchestration for mesh voice/video calls
//!
//! This library coordinates the lifecycle of one voice/video call at a
//! time over pluggable connection, media, and signaling capabilities:
//!
//! - **Single-writer sessions**: One [`CallSessionManager`] owns all call
//!   state; UI commands and signaling events funnel through it
//! - **Per-peer links**: A full-mesh registry with per-link candidate
//!   queues and a placeholder remap for direct outgoing calls
//! - **Media fallback**: Camera-busy/denied failures degrade a video call
//!   to audio-only instead of failing it
//! - **Active speakers**: A lazy sampling task classifies who is talking
//!
//! # Examples
//!
//! ```rust,no_run
//! use meshcall_core::{CallSessionManager, CallTarget, MediaKind, SessionConfig};
//! use meshcall_core::sim::{SimEngine, SimMediaDevices, SimSignaling};
//! use meshcall_core::types::{ChatId, UserId};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = CallSessionManager::new(
//!     Arc::new(SimEngine::new()),
//!     Arc::new(SimMediaDevices::new()),
//!     Arc::new(SimSignaling::new()),
//!     SessionConfig::default(),
//! );
//!
//! manager
//!     .start_call(
//!         CallTarget::Direct {
//!             user_id: UserId::new("bob"),
//!             chat_id: ChatId::new("dm-42"),
//!         },
//!         MediaKind::AudioVideo,
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Peer-connection engine capability
pub mod engine;

/// Media acquisition and device capability
pub mod media;

/// Signaling events and messages
pub mod signaling;

/// Per-peer connection registry
pub mod registry;

/// Active-speaker detection
pub mod activity;

/// Call session lifecycle management
pub mod session;

/// In-process simulation of the capability seams
pub mod sim;

// Re-export main types at crate root
pub use activity::{AudioActivityDetector, DetectorConfig};
pub use engine::{
    EngineError, IceCandidate, LinkConnectionState, LinkEvent, LinkId, LinkNotice,
    PeerConnectionFactory, PeerConnectionHandle, SessionDescription,
};
pub use media::{AcquiredMedia, MediaAcquisition, MediaDevices, MediaError, MediaStreamHandle};
pub use registry::{PeerLinkRegistry, RegistryError, RegistryUpdate};
pub use session::{
    CallSessionManager, EndReason, SessionConfig, SessionError, SessionEvent,
};
pub use signaling::{OutboundMessage, SignalingChannel, SignalingError, SignalingEvent};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::activity::{AudioActivityDetector, DetectorConfig};
    pub use crate::engine::{PeerConnectionFactory, PeerConnectionHandle, SessionDescription};
    pub use crate::media::{MediaDevices, MediaStreamHandle};
    pub use crate::session::{CallSessionManager, SessionConfig, SessionError, SessionEvent};
    pub use crate::signaling::{OutboundMessage, SignalingChannel, SignalingEvent};
    pub use crate::types::{
        CallDirection, CallMode, CallTarget, ChatId, MediaKind, PeerId, PeerKey, SessionSnapshot,
        SessionState, UserId,
    };
}
