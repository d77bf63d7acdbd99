//! Active-speaker detection over attached audio streams
//!
//! A single sampling task polls the audio level of every attached stream
//! on a fixed tick and publishes the set of speakers above the threshold.
//! The task is started lazily with the first attachment and stopped when
//! the last stream detaches, so an idle session costs nothing.

use crate::media::MediaStreamHandle;
use crate::types::{ActiveSpeakerSet, SpeakerId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Detector tuning
#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    /// Sampling interval
    pub tick: Duration,
    /// Normalized level above which a stream counts as speaking
    pub threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(200),
            threshold: 0.05,
        }
    }
}

/// Shared between the detector handle and its sampling task
struct DetectorShared {
    streams: Mutex<HashMap<SpeakerId, Arc<dyn MediaStreamHandle>>>,
    active_tx: watch::Sender<ActiveSpeakerSet>,
    config: DetectorConfig,
}

impl DetectorShared {
    /// One sampling pass; publishes only when membership changed
    async fn sample(&self) {
        let active: ActiveSpeakerSet = {
            let streams = self.streams.lock().await;
            streams
                .iter()
                .filter(|(_, s)| s.audio_level() >= self.config.threshold)
                .map(|(id, _)| id.clone())
                .collect()
        };
        self.active_tx.send_if_modified(|current| {
            if *current == active {
                false
            } else {
                tracing::debug!(speakers = active.len(), "Active speakers changed");
                *current = active;
                true
            }
        });
    }
}

/// Polls attached streams and reports who is speaking
pub struct AudioActivityDetector {
    shared: Arc<DetectorShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AudioActivityDetector {
    /// Create a detector; no task runs until a stream is attached
    #[must_use]
    pub fn new(config: DetectorConfig) -> Self {
        let (active_tx, _) = watch::channel(ActiveSpeakerSet::new());
        Self {
            shared: Arc::new(DetectorShared {
                streams: Mutex::new(HashMap::new()),
                active_tx,
                config,
            }),
            task: Mutex::new(None),
        }
    }

    /// Subscribe to the active-speaker set
    ///
    /// Late subscribers observe the current set immediately.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ActiveSpeakerSet> {
        self.shared.active_tx.subscribe()
    }

    /// Attach a stream under the given speaker identity
    ///
    /// Streams without an audio track are ignored. Attaching a new stream
    /// for an identity that already has one replaces the old entry. The
    /// first attachment starts the sampling task.
    pub async fn attach(&self, speaker: SpeakerId, stream: Arc<dyn MediaStreamHandle>) {
        if !stream.has_audio() {
            tracing::debug!(speaker = %speaker, "Ignoring stream without audio");
            return;
        }
        {
            let mut streams = self.shared.streams.lock().await;
            streams.insert(speaker.clone(), stream);
        }
        tracing::debug!(speaker = %speaker, "Stream attached to detector");
        self.ensure_running().await;
    }

    /// Detach the stream for the given speaker identity
    ///
    /// Detaching the last stream stops the sampling task and publishes an
    /// empty set. Unknown identities are a no-op.
    pub async fn detach(&self, speaker: &SpeakerId) {
        let now_empty = {
            let mut streams = self.shared.streams.lock().await;
            if streams.remove(speaker).is_none() {
                return;
            }
            streams.is_empty()
        };
        tracing::debug!(speaker = %speaker, "Stream detached from detector");
        if now_empty {
            self.stop_task().await;
        } else {
            // Drop the departed speaker from the published set right away
            // instead of waiting out a tick.
            self.shared.sample().await;
        }
    }

    /// Detach every stream and stop the sampling task
    pub async fn detach_all(&self) {
        self.shared.streams.lock().await.clear();
        self.stop_task().await;
    }

    async fn ensure_running(&self) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                shared.sample().await;
            }
        }));
        tracing::debug!("Activity sampling started");
    }

    async fn stop_task(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            tracing::debug!("Activity sampling stopped");
        }
        self.shared
            .active_tx
            .send_if_modified(|current| {
                if current.is_empty() {
                    false
                } else {
                    current.clear();
                    true
                }
            });
    }
}

impl Drop for AudioActivityDetector {
    fn drop(&mut self) {
        // Mutex::get_mut needs no lock; we own the detector exclusively here.
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sim::SimStream;
    use crate::types::PeerId;

    fn fast_config() -> DetectorConfig {
        DetectorConfig {
            tick: Duration::from_millis(10),
            threshold: 0.05,
        }
    }

    async fn next_set(
        rx: &mut watch::Receiver<ActiveSpeakerSet>,
    ) -> ActiveSpeakerSet {
        rx.changed().await.unwrap();
        rx.borrow_and_update().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaker_above_threshold_reported() {
        let detector = AudioActivityDetector::new(fast_config());
        let mut rx = detector.subscribe();

        let local = Arc::new(SimStream::audio_only("local"));
        local.set_level(0.4);
        detector.attach(SpeakerId::Local, local).await;

        let set = next_set(&mut rx).await;
        assert!(set.contains(&SpeakerId::Local));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_updates_when_speaker_goes_quiet() {
        let detector = AudioActivityDetector::new(fast_config());
        let mut rx = detector.subscribe();

        let peer = SpeakerId::Peer(PeerId::new("s1"));
        let stream = Arc::new(SimStream::audio_only("remote"));
        stream.set_level(0.6);
        detector.attach(peer.clone(), Arc::clone(&stream) as _).await;

        let set = next_set(&mut rx).await;
        assert!(set.contains(&peer));

        stream.set_level(0.0);
        let set = next_set(&mut rx).await;
        assert!(set.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_publish_without_membership_change() {
        let detector = AudioActivityDetector::new(fast_config());
        let mut rx = detector.subscribe();

        let stream = Arc::new(SimStream::audio_only("local"));
        stream.set_level(0.9);
        detector.attach(SpeakerId::Local, stream.clone()).await;
        next_set(&mut rx).await;

        // Level varies but stays above the threshold; the set is unchanged
        // and no new value is published.
        stream.set_level(0.5);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_only_stream_ignored() {
        let detector = AudioActivityDetector::new(fast_config());
        let mut rx = detector.subscribe();

        let stream = Arc::new(SimStream::new("screen", false, true));
        detector.attach(SpeakerId::Local, stream).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!rx.has_changed().unwrap());
        assert!(rx.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_removes_speaker_immediately() {
        let detector = AudioActivityDetector::new(fast_config());
        let mut rx = detector.subscribe();

        let a = SpeakerId::Peer(PeerId::new("a"));
        let b = SpeakerId::Peer(PeerId::new("b"));
        let stream_a = Arc::new(SimStream::audio_only("a"));
        let stream_b = Arc::new(SimStream::audio_only("b"));
        stream_a.set_level(0.5);
        stream_b.set_level(0.5);
        detector.attach(a.clone(), stream_a).await;
        detector.attach(b.clone(), stream_b).await;

        let set = next_set(&mut rx).await;
        assert_eq!(set.len(), 2);

        detector.detach(&a).await;
        let set = next_set(&mut rx).await;
        assert!(!set.contains(&a));
        assert!(set.contains(&b));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_all_publishes_empty_set() {
        let detector = AudioActivityDetector::new(fast_config());
        let mut rx = detector.subscribe();

        let stream = Arc::new(SimStream::audio_only("local"));
        stream.set_level(0.5);
        detector.attach(SpeakerId::Local, stream).await;
        next_set(&mut rx).await;

        detector.detach_all().await;
        let set = next_set(&mut rx).await;
        assert!(set.is_empty());

        // With no streams the sampling task is gone; nothing publishes.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!rx.has_changed().unwrap());
    }
}
