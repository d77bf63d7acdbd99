//! Per-peer connection registry
//!
//! Owns every live peer connection, the candidate queues that make
//! negotiation correct independent of network delivery order, and the
//! placeholder remap for direct outgoing calls. All link mutation funnels
//! through this registry so the uniqueness and remap invariants hold.

use crate::engine::{
    IceCandidate, LinkEvent, LinkId, LinkNotice, PeerConnectionFactory, PeerConnectionHandle,
};
use crate::media::MediaStreamHandle;
use crate::signaling::{OutboundMessage, SignalingChannel, SignalingError};
use crate::types::{ParticipantInfo, PeerId, PeerKey};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// No link exists for the given key
    #[error("No link for peer {0}")]
    UnknownPeer(PeerKey),

    /// The remote description was already applied this negotiation round
    #[error("Remote description already set for peer {0}")]
    DescriptionAlreadySet(PeerKey),

    /// Engine failure
    #[error(transparent)]
    Engine(#[from] crate::engine::EngineError),

    /// Signaling failure
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// One peer's connection state
struct PeerLink {
    id: LinkId,
    handle: Arc<dyn PeerConnectionHandle>,
    is_initiator: bool,
    remote_description_set: bool,
    /// Remote candidates waiting for the remote description, arrival order
    pending_remote: Vec<IceCandidate>,
    /// Locally gathered candidates waiting for the placeholder to resolve,
    /// generation order
    pending_local: Vec<IceCandidate>,
    remote_stream: Option<Arc<dyn MediaStreamHandle>>,
}

struct RegistryState {
    links: HashMap<PeerKey, PeerLink>,
    keys_by_link: HashMap<LinkId, PeerKey>,
    /// Candidates that arrived before their link existed, arrival order
    orphan_candidates: HashMap<PeerKey, Vec<IceCandidate>>,
    participants: HashMap<PeerId, ParticipantInfo>,
    local_stream: Option<Arc<dyn MediaStreamHandle>>,
}

/// What the session manager must react to after a link event
pub enum RegistryUpdate {
    /// A remote stream arrived for a peer
    RemoteStream {
        /// Which peer
        key: PeerKey,
        /// The stream, owned by the link
        stream: Arc<dyn MediaStreamHandle>,
    },
    /// The registry closed a link after a connection failure
    LinkClosed {
        /// Which peer
        key: PeerKey,
        /// The removed stream, if one had arrived
        stream: Option<Arc<dyn MediaStreamHandle>>,
    },
}

/// Registry of live peer links
pub struct PeerLinkRegistry {
    factory: Arc<dyn PeerConnectionFactory>,
    signaling: Arc<dyn SignalingChannel>,
    notice_tx: mpsc::UnboundedSender<LinkEvent>,
    inner: Mutex<RegistryState>,
}

impl PeerLinkRegistry {
    /// Create a new registry
    ///
    /// Link notices from every connection the registry creates are tagged
    /// with their [`LinkId`] and emitted on `notice_tx`; the session
    /// manager's pump feeds them back through [`Self::apply_link_event`].
    #[must_use]
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        signaling: Arc<dyn SignalingChannel>,
        notice_tx: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            factory,
            signaling,
            notice_tx,
            inner: Mutex::new(RegistryState {
                links: HashMap::new(),
                keys_by_link: HashMap::new(),
                orphan_candidates: HashMap::new(),
                participants: HashMap::new(),
                local_stream: None,
            }),
        }
    }

    /// Set or clear the local media stream attached to new links
    pub async fn set_local_stream(&self, stream: Option<Arc<dyn MediaStreamHandle>>) {
        self.inner.lock().await.local_stream = stream;
    }

    /// Create a link for `key`, or return the existing one
    ///
    /// Idempotent: a second call for the same live key returns the same
    /// connection handle and never creates a duplicate. A new link gets
    /// the local media tracks attached (if acquired) and inherits any
    /// candidates that arrived for `key` before the link existed.
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot construct a connection
    #[tracing::instrument(skip(self), fields(peer = %key))]
    pub async fn create_link(
        &self,
        key: PeerKey,
        is_initiator: bool,
    ) -> Result<Arc<dyn PeerConnectionHandle>, RegistryError> {
        let mut state = self.inner.lock().await;

        if let Some(link) = state.links.get(&key) {
            tracing::debug!(link_id = %link.id, "Reusing existing link");
            return Ok(Arc::clone(&link.handle));
        }

        let id = LinkId::new();
        let handle = self.factory.create(id, self.notice_tx.clone()).await?;
        tracing::debug!(link_id = %id, is_initiator, "Link created");

        if let Some(local) = state.local_stream.clone() {
            handle.attach_local_stream(local).await?;
        }

        let pending_remote = state.orphan_candidates.remove(&key).unwrap_or_default();
        if !pending_remote.is_empty() {
            tracing::debug!(
                count = pending_remote.len(),
                "Inherited early candidates for new link"
            );
        }

        state.keys_by_link.insert(id, key.clone());
        state.links.insert(
            key,
            PeerLink {
                id,
                handle: Arc::clone(&handle),
                is_initiator,
                remote_description_set: false,
                pending_remote,
                pending_local: Vec::new(),
                remote_stream: None,
            },
        );

        Ok(handle)
    }

    /// Apply the remote description for `key` and flush queued candidates
    ///
    /// Every candidate queued for the link is applied in original arrival
    /// order, exactly once, immediately after the description is set.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownPeer`] if no link exists, or
    /// [`RegistryError::DescriptionAlreadySet`] if called twice in one
    /// negotiation round.
    #[tracing::instrument(skip(self, desc), fields(peer = %key))]
    pub async fn apply_remote_description(
        &self,
        key: &PeerKey,
        desc: crate::engine::SessionDescription,
    ) -> Result<(), RegistryError> {
        let mut state = self.inner.lock().await;
        let link = state
            .links
            .get_mut(key)
            .ok_or_else(|| RegistryError::UnknownPeer(key.clone()))?;

        if link.remote_description_set {
            return Err(RegistryError::DescriptionAlreadySet(key.clone()));
        }

        link.handle.set_remote_description(desc).await?;
        link.remote_description_set = true;

        let queued = std::mem::take(&mut link.pending_remote);
        let count = queued.len();
        for candidate in queued {
            link.handle.add_ice_candidate(candidate).await?;
        }
        if count > 0 {
            tracing::debug!(count, "Flushed queued remote candidates");
        }
        Ok(())
    }

    /// Apply a remote candidate now, or queue it until the description lands
    ///
    /// Candidates for a peer whose link does not exist yet are held in an
    /// orphan queue and drained into the link at creation/remap time, so
    /// delivery order between candidates and descriptions never matters.
    ///
    /// # Errors
    ///
    /// Returns error if the engine rejects an immediately applied candidate
    pub async fn queue_or_apply_candidate(
        &self,
        key: &PeerKey,
        candidate: IceCandidate,
    ) -> Result<(), RegistryError> {
        let mut state = self.inner.lock().await;
        match state.links.get_mut(key) {
            Some(link) if link.remote_description_set => {
                link.handle.add_ice_candidate(candidate).await?;
            }
            Some(link) => {
                link.pending_remote.push(candidate);
                tracing::trace!(peer = %key, queued = link.pending_remote.len(), "Candidate queued");
            }
            None => {
                state
                    .orphan_candidates
                    .entry(key.clone())
                    .or_default()
                    .push(candidate);
                tracing::trace!(peer = %key, "Candidate held for future link");
            }
        }
        Ok(())
    }

    /// Move the placeholder link to its real peer identifier
    ///
    /// Direct-call only. The link and any remote stream already received
    /// under the placeholder move, exactly once, to `new_id`; locally
    /// queued outbound candidates are flushed to `new_id` in original
    /// generation order. No-op (returns `false`) without a placeholder.
    ///
    /// # Errors
    ///
    /// Returns error if a flushed candidate cannot be sent
    #[tracing::instrument(skip(self), fields(peer = %new_id))]
    pub async fn remap_placeholder(&self, new_id: PeerId) -> Result<bool, RegistryError> {
        let mut state = self.inner.lock().await;

        let Some(mut link) = state.links.remove(&PeerKey::Pending) else {
            tracing::debug!("No placeholder link to remap");
            return Ok(false);
        };

        let new_key = PeerKey::Resolved(new_id.clone());

        // Candidates addressed to us under the real id may have raced ahead
        // of the remap; they belong to this link now.
        if let Some(mut early) = state.orphan_candidates.remove(&new_key) {
            link.pending_remote.append(&mut early);
        }

        let queued_local = std::mem::take(&mut link.pending_local);
        let flushed = queued_local.len();
        for candidate in queued_local {
            self.signaling
                .send(OutboundMessage::IceCandidate {
                    to: new_id.clone(),
                    candidate,
                })
                .await?;
        }

        state.keys_by_link.insert(link.id, new_key.clone());
        state.links.insert(new_key, link);
        tracing::info!(flushed, "Placeholder link remapped");
        Ok(true)
    }

    /// Record or update participant metadata for a peer
    pub async fn upsert_participant(&self, peer: PeerId, info: ParticipantInfo) {
        self.inner.lock().await.participants.insert(peer, info);
    }

    /// Close and remove the link for `key`
    ///
    /// Removes the associated remote stream and participant metadata.
    /// Idempotent: returns `None` when no link exists.
    #[tracing::instrument(skip(self), fields(peer = %key))]
    pub async fn close_link(&self, key: &PeerKey) -> Option<Arc<dyn MediaStreamHandle>> {
        let (handle, stream) = {
            let mut state = self.inner.lock().await;
            let link = state.links.remove(key)?;
            state.keys_by_link.remove(&link.id);
            state.orphan_candidates.remove(key);
            if let Some(id) = key.peer_id() {
                state.participants.remove(id);
            }
            (link.handle, link.remote_stream)
        };

        handle.close().await;
        if let Some(stream) = &stream {
            stream.stop();
        }
        tracing::info!("Link closed");
        stream
    }

    /// Close every link; used only during full session teardown
    pub async fn close_all(&self) {
        let links: Vec<PeerLink> = {
            let mut state = self.inner.lock().await;
            state.keys_by_link.clear();
            state.orphan_candidates.clear();
            state.participants.clear();
            state.local_stream = None;
            state.links.drain().map(|(_, link)| link).collect()
        };

        let count = links.len();
        for link in links {
            link.handle.close().await;
            if let Some(stream) = link.remote_stream {
                stream.stop();
            }
        }
        if count > 0 {
            tracing::info!(count, "All links closed");
        }
    }

    /// Route one engine notice to its link
    ///
    /// Local candidates are forwarded to the peer (or queued while the
    /// placeholder is unresolved); terminal connection states close the
    /// link on the registry's own initiative. Notices for links that no
    /// longer exist are dropped.
    ///
    /// # Errors
    ///
    /// Returns error if forwarding a candidate fails
    pub async fn apply_link_event(
        &self,
        event: LinkEvent,
    ) -> Result<Option<RegistryUpdate>, RegistryError> {
        let key = {
            let state = self.inner.lock().await;
            match state.keys_by_link.get(&event.link) {
                Some(key) => key.clone(),
                None => {
                    tracing::trace!(link_id = %event.link, "Notice for closed link dropped");
                    return Ok(None);
                }
            }
        };

        match event.notice {
            LinkNotice::LocalCandidate(candidate) => {
                if key.is_pending() {
                    let mut state = self.inner.lock().await;
                    if let Some(link) = state.links.get_mut(&key) {
                        link.pending_local.push(candidate);
                    }
                } else if let Some(peer) = key.peer_id() {
                    self.signaling
                        .send(OutboundMessage::IceCandidate {
                            to: peer.clone(),
                            candidate,
                        })
                        .await?;
                }
                Ok(None)
            }
            LinkNotice::RemoteTrack(stream) => {
                let mut state = self.inner.lock().await;
                if let Some(link) = state.links.get_mut(&key) {
                    link.remote_stream = Some(Arc::clone(&stream));
                    Ok(Some(RegistryUpdate::RemoteStream { key, stream }))
                } else {
                    Ok(None)
                }
            }
            LinkNotice::StateChanged(conn_state) => {
                if conn_state.is_terminal() {
                    tracing::warn!(peer = %key, state = ?conn_state, "Link connection lost");
                    let stream = self.close_link(&key).await;
                    Ok(Some(RegistryUpdate::LinkClosed { key, stream }))
                } else {
                    tracing::debug!(peer = %key, state = ?conn_state, "Link state changed");
                    Ok(None)
                }
            }
        }
    }

    /// Number of live links
    #[must_use]
    pub async fn link_count(&self) -> usize {
        self.inner.lock().await.links.len()
    }

    /// Whether a link exists for `key`
    #[must_use]
    pub async fn has_link(&self, key: &PeerKey) -> bool {
        self.inner.lock().await.links.contains_key(key)
    }

    /// Whether the link for `key` was created as initiator
    #[must_use]
    pub async fn is_initiator(&self, key: &PeerKey) -> Option<bool> {
        self.inner
            .lock()
            .await
            .links
            .get(key)
            .map(|l| l.is_initiator)
    }

    /// Snapshot of known participant metadata
    #[must_use]
    pub async fn participants(&self) -> Vec<(PeerId, ParticipantInfo)> {
        self.inner
            .lock()
            .await
            .participants
            .iter()
            .map(|(id, info)| (id.clone(), info.clone()))
            .collect()
    }

    /// Snapshot of remote streams, keyed by peer
    #[must_use]
    pub async fn remote_streams(&self) -> Vec<(PeerKey, Arc<dyn MediaStreamHandle>)> {
        self.inner
            .lock()
            .await
            .links
            .iter()
            .filter_map(|(key, link)| {
                link.remote_stream
                    .as_ref()
                    .map(|s| (key.clone(), Arc::clone(s)))
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::engine::{LinkConnectionState, SessionDescription};
    use crate::sim::{SimEngine, SimSignaling, SimStream};

    fn setup() -> (
        Arc<SimEngine>,
        Arc<SimSignaling>,
        PeerLinkRegistry,
        mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let engine = Arc::new(SimEngine::new());
        let signaling = Arc::new(SimSignaling::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = PeerLinkRegistry::new(engine.clone(), signaling.clone(), tx);
        (engine, signaling, registry, rx)
    }

    fn resolved(s: &str) -> PeerKey {
        PeerKey::Resolved(PeerId::new(s))
    }

    #[tokio::test]
    async fn test_create_link_is_idempotent() {
        let (engine, _, registry, _rx) = setup();
        let key = resolved("s1");

        let first = registry.create_link(key.clone(), true).await.unwrap();
        let second = registry.create_link(key.clone(), true).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.link_count().await, 1);
        assert_eq!(engine.created_count(), 1);
    }

    #[tokio::test]
    async fn test_candidates_flush_in_arrival_order_exactly_once() {
        let (engine, _, registry, _rx) = setup();
        let key = resolved("s1");
        registry.create_link(key.clone(), false).await.unwrap();

        for i in 0..3 {
            registry
                .queue_or_apply_candidate(&key, IceCandidate::new(format!("cand-{i}")))
                .await
                .unwrap();
        }

        let conn = engine.connection(0).unwrap();
        assert!(conn.added_candidates().is_empty());

        registry
            .apply_remote_description(&key, SessionDescription::offer("v=0"))
            .await
            .unwrap();

        let applied: Vec<String> = conn
            .added_candidates()
            .iter()
            .map(|c| c.candidate.clone())
            .collect();
        assert_eq!(applied, vec!["cand-0", "cand-1", "cand-2"]);

        // After the description is set, candidates apply immediately; the
        // queue never replays.
        registry
            .queue_or_apply_candidate(&key, IceCandidate::new("cand-3"))
            .await
            .unwrap();
        assert_eq!(conn.added_candidates().len(), 4);
    }

    #[tokio::test]
    async fn test_second_description_in_round_rejected() {
        let (_, _, registry, _rx) = setup();
        let key = resolved("s1");
        registry.create_link(key.clone(), false).await.unwrap();

        registry
            .apply_remote_description(&key, SessionDescription::offer("v=0"))
            .await
            .unwrap();
        let again = registry
            .apply_remote_description(&key, SessionDescription::offer("v=0"))
            .await;
        assert!(matches!(
            again,
            Err(RegistryError::DescriptionAlreadySet(_))
        ));
    }

    #[tokio::test]
    async fn test_orphan_candidates_inherited_by_new_link() {
        let (engine, _, registry, _rx) = setup();
        let key = resolved("s1");

        registry
            .queue_or_apply_candidate(&key, IceCandidate::new("early-0"))
            .await
            .unwrap();
        registry
            .queue_or_apply_candidate(&key, IceCandidate::new("early-1"))
            .await
            .unwrap();

        registry.create_link(key.clone(), false).await.unwrap();
        registry
            .apply_remote_description(&key, SessionDescription::offer("v=0"))
            .await
            .unwrap();

        let conn = engine.connection(0).unwrap();
        let applied: Vec<String> = conn
            .added_candidates()
            .iter()
            .map(|c| c.candidate.clone())
            .collect();
        assert_eq!(applied, vec!["early-0", "early-1"]);
    }

    #[tokio::test]
    async fn test_remap_moves_link_stream_and_flushes_local_candidates() {
        let (engine, signaling, registry, _rx) = setup();
        registry.create_link(PeerKey::Pending, true).await.unwrap();

        // A remote stream arrives while the link is still the placeholder.
        let conn = engine.connection(0).unwrap();
        let stream: Arc<dyn MediaStreamHandle> = Arc::new(SimStream::audio_video("remote-1"));
        let link_id = conn.link_id();
        registry
            .apply_link_event(LinkEvent {
                link: link_id,
                notice: LinkNotice::RemoteTrack(stream),
            })
            .await
            .unwrap();

        // Two locally gathered candidates queue while the peer is unknown.
        for i in 0..2 {
            registry
                .apply_link_event(LinkEvent {
                    link: link_id,
                    notice: LinkNotice::LocalCandidate(IceCandidate::new(format!("local-{i}"))),
                })
                .await
                .unwrap();
        }
        assert!(signaling.take_sent().is_empty());

        let moved = registry.remap_placeholder(PeerId::new("x")).await.unwrap();
        assert!(moved);

        assert!(!registry.has_link(&PeerKey::Pending).await);
        assert!(registry.has_link(&resolved("x")).await);

        let streams = registry.remote_streams().await;
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].0, resolved("x"));

        let sent = signaling.take_sent();
        let cands: Vec<(String, String)> = sent
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::IceCandidate { to, candidate } => {
                    Some((to.as_str().to_string(), candidate.candidate.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            cands,
            vec![
                ("x".to_string(), "local-0".to_string()),
                ("x".to_string(), "local-1".to_string()),
            ]
        );

        // Exactly once: remapping again is a no-op and resends nothing.
        let again = registry.remap_placeholder(PeerId::new("x")).await.unwrap();
        assert!(!again);
        assert!(signaling.take_sent().is_empty());
    }

    #[tokio::test]
    async fn test_local_candidates_for_resolved_peer_sent_immediately() {
        let (engine, signaling, registry, _rx) = setup();
        registry.create_link(resolved("s2"), true).await.unwrap();

        let conn = engine.connection(0).unwrap();
        registry
            .apply_link_event(LinkEvent {
                link: conn.link_id(),
                notice: LinkNotice::LocalCandidate(IceCandidate::new("c")),
            })
            .await
            .unwrap();

        let sent = signaling.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            OutboundMessage::IceCandidate { to, .. } if to.as_str() == "s2"
        ));
    }

    #[tokio::test]
    async fn test_terminal_connection_state_closes_link() {
        let (engine, _, registry, _rx) = setup();
        let key = resolved("s1");
        registry.create_link(key.clone(), false).await.unwrap();
        registry
            .upsert_participant(
                PeerId::new("s1"),
                ParticipantInfo {
                    user_id: crate::types::UserId::new("u1"),
                    display_name: "Bob".into(),
                    avatar_url: None,
                },
            )
            .await;

        let conn = engine.connection(0).unwrap();
        let update = registry
            .apply_link_event(LinkEvent {
                link: conn.link_id(),
                notice: LinkNotice::StateChanged(LinkConnectionState::Failed),
            })
            .await
            .unwrap();

        assert!(matches!(update, Some(RegistryUpdate::LinkClosed { .. })));
        assert_eq!(registry.link_count().await, 0);
        assert!(registry.participants().await.is_empty());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_link_is_idempotent() {
        let (_, _, registry, _rx) = setup();
        let key = resolved("s1");
        registry.create_link(key.clone(), false).await.unwrap();

        assert_eq!(registry.link_count().await, 1);
        registry.close_link(&key).await;
        assert_eq!(registry.link_count().await, 0);
        assert!(registry.close_link(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_close_all_empties_registry() {
        let (engine, _, registry, _rx) = setup();
        registry.create_link(resolved("s1"), true).await.unwrap();
        registry.create_link(resolved("s2"), true).await.unwrap();
        registry.create_link(resolved("s3"), false).await.unwrap();

        registry.close_all().await;
        assert_eq!(registry.link_count().await, 0);
        for i in 0..3 {
            assert!(engine.connection(i).unwrap().is_closed());
        }
    }
}
