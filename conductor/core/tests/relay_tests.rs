//! Cross-process relay tests
//!
//! A session publishes through a `RelayEmitter`; a `RelayBridge` on the other
//! side re-emits into the push room of the session's conversation. Run over the
//! in-process relay and over a real hub socket.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use stream_conductor::{
    AdmissionController, ConversationId, FanoutEmitter, GenerationEvent, InMemoryRelay,
    InMemoryStore, OrchestratorConfig, Relay, RelayBridge, RelayEmitter, RelayServer, RoomHub,
    SessionId, SessionIdentity, SessionOutcome, SessionState, SseEmitter, StreamEvent,
    StreamEventKind, StreamOrchestrator, UnixSocketRelay,
};

const PREFIX: &str = "stream:";

fn orchestrator(
    session: &str,
    conversation: &str,
    emitter: RelayEmitter,
    admission: &Arc<AdmissionController>,
) -> StreamOrchestrator<RelayEmitter> {
    StreamOrchestrator::new(
        SessionState::new(SessionIdentity::new(session, conversation, "user-1", "Code")),
        emitter,
        Arc::new(InMemoryStore::new()),
        Arc::clone(admission),
        OrchestratorConfig::default(),
    )
}

fn tokens(
    parts: &[&str],
) -> impl futures::Stream<Item = anyhow::Result<GenerationEvent>> + Unpin + Send {
    let events: Vec<_> = parts
        .iter()
        .map(|p| Ok::<_, anyhow::Error>(GenerationEvent::token(*p)))
        .collect();
    futures::stream::iter(events)
}

async fn drain_until_terminal(rx: &mut broadcast::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("room event in time")
            .expect("room open");
        let terminal = event.kind.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

#[tokio::test]
async fn test_in_memory_relay_bridges_to_room() {
    let relay: Arc<dyn Relay> = Arc::new(InMemoryRelay::default());
    let hub = Arc::new(RoomHub::new(64));
    let bridge = RelayBridge::new(Arc::clone(&relay), Arc::clone(&hub), PREFIX);
    let admission = Arc::new(AdmissionController::new(1));

    let session = SessionId::from("s-1");
    let room = ConversationId::from("c-1");
    let mut viewer = hub.subscribe(&room);
    let bridged = bridge.bridge_session(&session, room.clone()).await.unwrap();

    let emitter = RelayEmitter::for_session(Arc::clone(&relay), PREFIX, &session);
    assert_eq!(emitter.channel(), "stream:s-1");
    let outcome = orchestrator("s-1", "c-1", emitter, &admission)
        .run(tokens(&["a", "b", "c"]))
        .await;
    assert!(matches!(outcome, SessionOutcome::Completed(_)));

    let events = drain_until_terminal(&mut viewer).await;
    let kinds: Vec<StreamEventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            StreamEventKind::Start,
            StreamEventKind::Chunk,
            StreamEventKind::Chunk,
            StreamEventKind::Chunk,
            StreamEventKind::Done
        ]
    );
    let offsets: Vec<Option<usize>> = events[1..4].iter().map(|e| e.offset).collect();
    assert_eq!(offsets, vec![Some(0), Some(1), Some(2)]);
    assert_eq!(bridged.await.unwrap(), 5);
}

#[tokio::test]
async fn test_bridge_ends_for_session_rejected_at_admission() {
    let relay: Arc<dyn Relay> = Arc::new(InMemoryRelay::default());
    let hub = Arc::new(RoomHub::new(64));
    let bridge = RelayBridge::new(Arc::clone(&relay), Arc::clone(&hub), PREFIX);

    // Hold the only slot so the next session cannot be admitted
    let admission = Arc::new(AdmissionController::new(1));
    let _held = admission.try_acquire().unwrap();

    let session = SessionId::from("s-1");
    let room = ConversationId::from("c-1");
    let mut viewer = hub.subscribe(&room);
    let bridged = bridge.bridge_session(&session, room).await.unwrap();

    let config = OrchestratorConfig {
        acquire_timeout: Duration::from_millis(20),
        ..OrchestratorConfig::default()
    };
    let outcome = StreamOrchestrator::new(
        SessionState::new(SessionIdentity::new("s-1", "c-1", "user-1", "Code")),
        RelayEmitter::for_session(Arc::clone(&relay), PREFIX, &session),
        Arc::new(InMemoryStore::new()),
        Arc::clone(&admission),
        config,
    )
    .run(tokens(&[]))
    .await;
    assert!(matches!(outcome, SessionOutcome::Rejected(_)));

    let forwarded = tokio::time::timeout(Duration::from_secs(2), bridged)
        .await
        .expect("bridge finishes after the rejection")
        .unwrap();
    assert_eq!(forwarded, 1);

    let event = viewer.recv().await.unwrap();
    assert_eq!(event.kind, StreamEventKind::Error);
    assert!(viewer.try_recv().is_err());
}

#[tokio::test]
async fn test_fanout_to_sse_and_relay() {
    let relay = Arc::new(InMemoryRelay::new(16));
    let mut subscription = relay.subscribe("stream:s-2").await.unwrap();
    let (sse, frames) = SseEmitter::channel(16);
    let admission = Arc::new(AdmissionController::new(1));

    let fanout = FanoutEmitter::new()
        .with(sse)
        .with(RelayEmitter::new(relay.clone(), "stream:s-2"));
    let outcome = StreamOrchestrator::new(
        SessionState::new(SessionIdentity::new("s-2", "c-2", "user-1", "Chat")),
        fanout,
        Arc::new(InMemoryStore::new()),
        admission,
        OrchestratorConfig::default(),
    )
    .run(tokens(&["x"]))
    .await;
    assert!(matches!(outcome, SessionOutcome::Completed(_)));

    let mut relayed = Vec::new();
    for _ in 0..3 {
        relayed.push(subscription.recv().await.unwrap().kind);
    }
    assert_eq!(
        relayed,
        vec![StreamEventKind::Start, StreamEventKind::Chunk, StreamEventKind::Done]
    );

    let sse_frames: Vec<String> = frames.collect().await;
    assert_eq!(sse_frames.len(), 2);
    assert!(sse_frames.iter().all(|f| f.starts_with("data: ")));
}

#[tokio::test]
async fn test_unix_socket_relay_bridges_between_processes() {
    let temp_dir = TempDir::new().unwrap();
    let socket_path = temp_dir.path().join("relay.sock");

    let mut server = RelayServer::new(socket_path.clone());
    server.listen().unwrap();
    let server = Arc::new(server);
    let shutdown = CancellationToken::new();
    let serving = {
        let server = Arc::clone(&server);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server.serve(shutdown).await })
    };

    // Connection-terminating side
    let edge_relay: Arc<dyn Relay> =
        Arc::new(UnixSocketRelay::connect(&socket_path).await.unwrap());
    let hub = Arc::new(RoomHub::new(64));
    let bridge = RelayBridge::new(Arc::clone(&edge_relay), Arc::clone(&hub), PREFIX);

    // Orchestrator side
    let worker_relay: Arc<dyn Relay> =
        Arc::new(UnixSocketRelay::connect(&socket_path).await.unwrap());
    let admission = Arc::new(AdmissionController::new(2));

    let mut rooms = Vec::new();
    let mut bridges = Vec::new();
    for (session, conversation) in [("s-1", "c-1"), ("s-2", "c-2")] {
        let room = ConversationId::from(conversation);
        rooms.push(hub.subscribe(&room));
        bridges.push(
            bridge
                .bridge_session(&SessionId::from(session), room)
                .await
                .unwrap(),
        );
    }

    let first = orchestrator(
        "s-1",
        "c-1",
        RelayEmitter::for_session(Arc::clone(&worker_relay), PREFIX, &SessionId::from("s-1")),
        &admission,
    )
    .run(tokens(&["one ", "two"]));
    let second = orchestrator(
        "s-2",
        "c-2",
        RelayEmitter::for_session(Arc::clone(&worker_relay), PREFIX, &SessionId::from("s-2")),
        &admission,
    )
    .run(tokens(&["three"]));
    let (first, second) = tokio::join!(first, second);
    assert!(matches!(first, SessionOutcome::Completed(_)));
    assert!(matches!(second, SessionOutcome::Completed(_)));

    let events_1 = drain_until_terminal(&mut rooms[0]).await;
    let events_2 = drain_until_terminal(&mut rooms[1]).await;

    // Each room only sees its own session, in publish order
    assert!(events_1.iter().all(|e| e.session_id == SessionId::from("s-1")));
    assert!(events_2.iter().all(|e| e.session_id == SessionId::from("s-2")));
    let text_1: String = events_1.iter().filter_map(|e| e.content.clone()).collect();
    assert_eq!(text_1, "one two");
    assert_eq!(
        events_1.last().unwrap().snapshot().unwrap().value,
        "one two"
    );
    assert_eq!(events_2.last().unwrap().snapshot().unwrap().value, "three");

    for handle in bridges {
        assert!(handle.await.unwrap() >= 3);
    }

    shutdown.cancel();
    serving.await.unwrap().unwrap();
}
