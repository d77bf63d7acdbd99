//! Candidate ordering and placeholder-remap behavior driven through the
//! session manager, with signaling arriving in adversarial orders

use meshcall_core::engine::IceCandidate;
use meshcall_core::session::{CallSessionManager, SessionConfig};
use meshcall_core::sim::{SimEngine, SimMediaDevices, SimSignaling};
use meshcall_core::signaling::{OutboundMessage, SignalingEvent};
use meshcall_core::types::{CallTarget, ChatId, MediaKind, PeerId, SessionState, UserId};
use meshcall_core::SessionDescription;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    engine: Arc<SimEngine>,
    signaling: Arc<SimSignaling>,
    manager: Arc<CallSessionManager>,
}

fn harness() -> Harness {
    let engine = Arc::new(SimEngine::new());
    let signaling = Arc::new(SimSignaling::new());
    let manager = CallSessionManager::new(
        engine.clone(),
        Arc::new(SimMediaDevices::new()),
        signaling.clone(),
        SessionConfig::default(),
    );
    Harness {
        engine,
        signaling,
        manager,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

async fn start_direct(h: &Harness) {
    h.manager
        .start_call(
            CallTarget::Direct {
                user_id: UserId::new("bob"),
                chat_id: ChatId::new("dm-42"),
            },
            MediaKind::Audio,
        )
        .await
        .unwrap();
    h.signaling.take_sent();
}

fn answered(socket: &str) -> SignalingEvent {
    SignalingEvent::Answered {
        responder_socket_id: PeerId::new(socket),
        answer: SessionDescription::answer("v=0 answer"),
    }
}

fn remote_candidate(from: &str, c: &str) -> SignalingEvent {
    SignalingEvent::IceCandidate {
        from: PeerId::new(from),
        candidate: IceCandidate::new(c),
    }
}

#[tokio::test]
async fn test_local_candidates_held_until_remap_then_sent_in_order() {
    let h = harness();
    start_direct(&h).await;

    let conn = h.engine.connection(0).unwrap();
    for i in 0..3 {
        conn.emit_local_candidate(IceCandidate::new(format!("local-{i}")));
    }
    settle().await;

    // Nothing leaves before the answer resolves the peer.
    assert!(h.signaling.take_sent().is_empty());

    h.manager.handle_signaling(answered("bob-sock")).await.unwrap();

    let sent: Vec<(String, String)> = h
        .signaling
        .take_sent()
        .into_iter()
        .filter_map(|m| match m {
            OutboundMessage::IceCandidate { to, candidate } => {
                Some((to.0, candidate.candidate))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        sent,
        vec![
            ("bob-sock".to_string(), "local-0".to_string()),
            ("bob-sock".to_string(), "local-1".to_string()),
            ("bob-sock".to_string(), "local-2".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_candidates_generated_after_remap_sent_directly() {
    let h = harness();
    start_direct(&h).await;
    h.manager.handle_signaling(answered("bob-sock")).await.unwrap();
    h.signaling.take_sent();

    let conn = h.engine.connection(0).unwrap();
    conn.emit_local_candidate(IceCandidate::new("late"));
    settle().await;

    let sent = h.signaling.take_sent();
    assert_eq!(sent.len(), 1);
    assert!(matches!(
        &sent[0],
        OutboundMessage::IceCandidate { to, candidate }
            if to.as_str() == "bob-sock" && candidate.candidate == "late"
    ));
}

#[tokio::test]
async fn test_responder_candidates_racing_the_answer_apply_in_order() {
    let h = harness();
    start_direct(&h).await;

    // The responder's candidates arrive before its answer does.
    for i in 0..3 {
        h.manager
            .handle_signaling(remote_candidate("bob-sock", &format!("bob-{i}")))
            .await
            .unwrap();
    }
    let conn = h.engine.connection(0).unwrap();
    assert!(conn.added_candidates().is_empty());

    h.manager.handle_signaling(answered("bob-sock")).await.unwrap();

    let applied: Vec<String> = conn
        .added_candidates()
        .into_iter()
        .map(|c| c.candidate)
        .collect();
    assert_eq!(applied, vec!["bob-0", "bob-1", "bob-2"]);
    assert_eq!(h.manager.snapshot().state, SessionState::Connected);
}

#[tokio::test]
async fn test_duplicate_answer_is_ignored() {
    let h = harness();
    start_direct(&h).await;

    h.manager.handle_signaling(answered("bob-sock")).await.unwrap();
    let conn = h.engine.connection(0).unwrap();
    let first = conn.remote_description().unwrap();

    // A replayed answer neither errors nor disturbs the session.
    h.manager.handle_signaling(answered("bob-sock")).await.unwrap();
    assert_eq!(conn.remote_description().unwrap(), first);
    assert_eq!(h.manager.snapshot().state, SessionState::Connected);
    assert_eq!(h.engine.created_count(), 1);
}

#[tokio::test]
async fn test_candidates_before_group_offer_wait_for_the_link() {
    let h = harness();
    h.manager
        .start_call(
            CallTarget::Group {
                chat_id: ChatId::new("room-7"),
            },
            MediaKind::Audio,
        )
        .await
        .unwrap();
    h.signaling.take_sent();

    // A peer's candidates outrun the offer that creates its link.
    for i in 0..2 {
        h.manager
            .handle_signaling(remote_candidate("carol-sock", &format!("carol-{i}")))
            .await
            .unwrap();
    }
    assert_eq!(h.engine.created_count(), 0);

    h.manager
        .handle_signaling(SignalingEvent::Offer {
            from: PeerId::new("carol-sock"),
            offer: SessionDescription::offer("v=0 carol"),
            caller_name: Some("Carol".into()),
            caller_avatar: None,
            caller_id: Some(UserId::new("carol")),
        })
        .await
        .unwrap();

    let conn = h.engine.connection(0).unwrap();
    let applied: Vec<String> = conn
        .added_candidates()
        .into_iter()
        .map(|c| c.candidate)
        .collect();
    assert_eq!(applied, vec!["carol-0", "carol-1"]);
}

#[tokio::test]
async fn test_candidates_with_no_session_are_dropped() {
    let h = harness();
    h.manager
        .handle_signaling(remote_candidate("stray", "c0"))
        .await
        .unwrap();
    assert_eq!(h.engine.created_count(), 0);
    assert_eq!(h.manager.snapshot().state, SessionState::Idle);
}
