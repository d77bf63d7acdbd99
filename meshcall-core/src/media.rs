//! Media acquisition and local device fallback policy
//!
//! The device layer is consumed behind the [`MediaDevices`] trait.
//! [`MediaAcquisition`] implements the camera-fallback policy: a request
//! that includes video and fails with a device-busy/permission class error
//! is retried audio-only and flagged as degraded; any other failure, or a
//! failure on the retry itself, is fatal to the call attempt.

use crate::types::MediaKind;
use std::sync::Arc;
use thiserror::Error;

/// Media-acquisition errors
#[derive(Error, Debug)]
pub enum MediaError {
    /// The user or platform denied device access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No matching capture device exists
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device exists but is held by another application
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Any other device failure
    #[error("Media error: {0}")]
    Other(String),
}

impl MediaError {
    /// Whether an audio-only retry is allowed after this failure
    ///
    /// Only camera-in-use and denied-permission failures on a request that
    /// included video are recoverable; a missing device is fatal.
    #[must_use]
    pub fn allows_audio_fallback(&self) -> bool {
        matches!(self, Self::DeviceBusy(_) | Self::PermissionDenied(_))
    }
}

/// Handle to an owned set of local or remote media tracks
///
/// The local handle is exclusively owned by the call session; remote
/// handles are owned by their peer link. `stop` must be idempotent, and
/// every handle is stopped when its owner is destroyed.
pub trait MediaStreamHandle: Send + Sync {
    /// Stable stream identifier
    fn id(&self) -> &str;

    /// Whether the stream carries an audio track
    fn has_audio(&self) -> bool;

    /// Whether the stream carries a video track
    fn has_video(&self) -> bool;

    /// Enable or disable the audio track in place
    fn set_audio_enabled(&self, enabled: bool);

    /// Enable or disable the video track in place
    fn set_video_enabled(&self, enabled: bool);

    /// Normalized average signal level of the audio track, `0.0..=1.0`
    ///
    /// Returns `0.0` for streams without audio or after `stop`.
    fn audio_level(&self) -> f32;

    /// Stop every track and release the capture resources
    fn stop(&self);
}

/// Device-media provider capability
#[async_trait::async_trait]
pub trait MediaDevices: Send + Sync {
    /// Request capture devices for the given track combination
    ///
    /// # Errors
    ///
    /// Returns a [`MediaError`] classifying the failure for the fallback
    /// policy
    async fn get_user_media(
        &self,
        audio: bool,
        video: bool,
    ) -> Result<Arc<dyn MediaStreamHandle>, MediaError>;
}

/// Result of a successful acquisition
pub struct AcquiredMedia {
    /// The acquired local stream
    pub stream: Arc<dyn MediaStreamHandle>,
    /// Effective media kind (audio-only after a degraded fallback)
    pub kind: MediaKind,
    /// Whether video was requested but acquisition fell back to audio
    pub degraded: bool,
}

impl std::fmt::Debug for AcquiredMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredMedia")
            .field("stream", &self.stream.id())
            .field("kind", &self.kind)
            .field("degraded", &self.degraded)
            .finish()
    }
}

/// Local media acquisition with camera-fallback policy
pub struct MediaAcquisition {
    devices: Arc<dyn MediaDevices>,
}

impl MediaAcquisition {
    /// Create a new acquisition front-end over a device provider
    #[must_use]
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self { devices }
    }

    /// Acquire the device combination implied by `kind`
    ///
    /// Audio is always required; video only when `kind` requests it. A
    /// device-busy/permission failure on a request that included video is
    /// retried audio-only and the result flagged degraded.
    ///
    /// # Errors
    ///
    /// Returns error if acquisition fails terminally; the caller must not
    /// create a session in that case.
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self, kind: MediaKind) -> Result<AcquiredMedia, MediaError> {
        let want_video = kind.has_video();

        match self.devices.get_user_media(true, want_video).await {
            Ok(stream) => {
                tracing::debug!(stream_id = %stream.id(), video = want_video, "Local media acquired");
                Ok(AcquiredMedia {
                    stream,
                    kind,
                    degraded: false,
                })
            }
            Err(e) if want_video && e.allows_audio_fallback() => {
                tracing::warn!(error = %e, "Video acquisition failed, retrying audio-only");
                let stream = self.devices.get_user_media(true, false).await?;
                tracing::info!(stream_id = %stream.id(), "Degraded to audio-only");
                Ok(AcquiredMedia {
                    stream,
                    kind: MediaKind::Audio,
                    degraded: true,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "Media acquisition failed");
                Err(e)
            }
        }
    }
}
