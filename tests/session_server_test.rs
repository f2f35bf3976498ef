//! End-to-end tests for live session connections
//!
//! Each test wires a full server (storage, hub, dispatcher) and talks to it
//! over in-memory duplex streams using the line-delimited JSON protocol.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{
    AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::task::JoinHandle;

use consensus_prioritizer::config::{
    Config, DatabaseConfig, HubConfig, LogFormat, LoggingConfig, ServerConfig,
};
use consensus_prioritizer::consensus::Choice;
use consensus_prioritizer::hub::Hub;
use consensus_prioritizer::storage::{
    Comparison, ComparisonSession, Criterion, SqliteStorage, StaticDirectory,
};
use consensus_prioritizer::{AppState, SessionServer, SharedState};

const PROJECT: i64 = 1;
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn create_test_config(hub: HubConfig) -> Config {
    Config {
        database: DatabaseConfig {
            path: ":memory:".into(),
            max_connections: 1,
        },
        logging: LoggingConfig {
            level: "warn".to_string(),
            format: LogFormat::Pretty,
        },
        server: ServerConfig::default(),
        hub,
    }
}

struct TestServer {
    state: SharedState,
    server: SessionServer,
    session: ComparisonSession,
    comparisons: Vec<Comparison>,
}

async fn start_server() -> TestServer {
    start_server_with(HubConfig::default()).await
}

/// Liveness timings short enough to observe within a test.
fn fast_hub_config() -> HubConfig {
    HubConfig {
        ping_interval_ms: 100,
        pong_wait_ms: 300,
        max_message_size: 64,
        ..HubConfig::default()
    }
}

async fn start_server_with(hub: HubConfig) -> TestServer {
    let config = create_test_config(hub);
    let storage = SqliteStorage::new_in_memory()
        .await
        .expect("Failed to create in-memory storage");
    let directory = Arc::new(StaticDirectory::with_project(PROJECT, &[10, 11], &[1, 2, 3]));
    let (hub, _hub_task) = Hub::spawn(&config.hub);

    let state = Arc::new(AppState::new(config, storage, directory, hub));
    let (session, comparisons) = state
        .ledger
        .start_session(PROJECT, Criterion::Value, None)
        .await
        .unwrap();

    TestServer {
        server: SessionServer::new(Arc::clone(&state)),
        state,
        session,
        comparisons,
    }
}

struct TestClient {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    task: JoinHandle<()>,
}

impl TestClient {
    fn connect(server: &TestServer) -> Self {
        let (client, remote) = tokio::io::duplex(64 * 1024);
        let task = server.server.serve(remote);
        let (reader, writer) = tokio::io::split(client);
        Self {
            reader: BufReader::new(reader),
            writer,
            task,
        }
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn send(&mut self, kind: &str, payload: Value) {
        let frame = json!({ "kind": kind, "payload": payload });
        self.send_raw(&frame.to_string()).await;
    }

    /// Next frame from the server; `None` once the server closed the stream.
    async fn recv(&mut self) -> Option<Value> {
        let mut line = String::new();
        let read = tokio::time::timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for server frame")
            .unwrap();
        if read == 0 {
            return None;
        }
        Some(serde_json::from_str(&line).unwrap())
    }

    /// Next frame, which must be of `kind`; returns its payload.
    async fn expect(&mut self, kind: &str) -> Value {
        let frame = self.recv().await.expect("stream closed");
        assert_eq!(frame["kind"], kind, "unexpected frame: {}", frame);
        frame["payload"].clone()
    }

    /// Next frame other than a liveness probe.
    async fn recv_skipping_pings(&mut self) -> Option<Value> {
        loop {
            let frame = self.recv().await?;
            if frame["kind"] != "ping" {
                return Some(frame);
            }
        }
    }

    async fn join(&mut self, session_id: &str, participant_id: i64) -> Value {
        self.send(
            "join-session",
            json!({ "session_id": session_id, "participant_id": participant_id }),
        )
        .await;
        self.expect("welcome").await
    }

    async fn vote(&mut self, comparison_id: &str, choice: Choice) {
        self.send(
            "vote-submitted",
            json!({ "comparison_id": comparison_id, "choice": choice }),
        )
        .await;
    }
}

#[tokio::test]
async fn test_join_receives_welcome() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server);

    let welcome = client.join(&server.session.id, 10).await;

    assert_eq!(welcome["session_id"], server.session.id.as_str());
    assert_eq!(welcome["participant_id"], 10);
    assert_eq!(welcome["criterion"], "value");
    assert_eq!(welcome["online"], json!([10]));
    assert_eq!(welcome["progress"]["completed"], 0);
    assert_eq!(welcome["progress"]["total"], 3);

    server.state.hub.flush().await.unwrap();
    let stats = server.state.hub.stats();
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.sessions, 1);
}

#[tokio::test]
async fn test_join_unknown_session_rejected() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server);

    client
        .send(
            "join-session",
            json!({ "session_id": "missing", "participant_id": 10 }),
        )
        .await;
    let error = client.expect("error").await;
    assert_eq!(error["code"], 4108);

    // Still usable afterwards.
    client.join(&server.session.id, 10).await;
}

#[tokio::test]
async fn test_unknown_kind_keeps_connection() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server);

    client.send("dance", json!({ "style": "waltz" })).await;
    let error = client.expect("error").await;
    assert_eq!(error["code"], 4001);

    client.join(&server.session.id, 10).await;
}

#[tokio::test]
async fn test_invalid_payload_keeps_connection() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server);

    client
        .send("join-session", json!({ "session_id": 42 }))
        .await;
    let error = client.expect("error").await;
    assert_eq!(error["code"], 4002);

    client.join(&server.session.id, 10).await;
}

#[tokio::test]
async fn test_malformed_frame_closes_connection() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server);

    client.send_raw("{not json").await;
    let error = client.expect("error").await;
    assert_eq!(error["code"], 4000);

    assert!(client.recv().await.is_none(), "server should close the stream");
    tokio::time::timeout(RECV_TIMEOUT, client.task)
        .await
        .expect("agent did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_vote_before_join_rejected() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server);

    client.vote(&server.comparisons[0].id, Choice::Tie).await;
    let error = client.expect("error").await;
    assert_eq!(error["code"], 4003);
}

#[tokio::test]
async fn test_votes_fan_out_to_session() {
    let server = start_server().await;
    let comparison = server.comparisons[0].clone();
    let mut alice = TestClient::connect(&server);
    let mut bob = TestClient::connect(&server);

    alice.join(&server.session.id, 10).await;
    server.state.hub.flush().await.unwrap();
    let welcome = bob.join(&server.session.id, 11).await;
    assert_eq!(welcome["online"], json!([10, 11]));

    let status = alice.expect("attendee-status").await;
    assert_eq!(status["participant_id"], 11);
    assert_eq!(status["online"], true);

    alice
        .vote(&comparison.id, Choice::Prefer { item_id: comparison.item_a_id })
        .await;
    let update = bob.expect("vote-update").await;
    assert_eq!(update["comparison_id"], comparison.id.as_str());
    assert_eq!(update["participant_id"], 10);
    assert_eq!(update["votes_cast"], 1);
    assert_eq!(update["votes_expected"], 2);

    bob.vote(&comparison.id, Choice::Prefer { item_id: comparison.item_a_id })
        .await;

    // The voter never sees its own vote-update; both see the close.
    for client in [&mut alice, &mut bob] {
        let reached = client.expect("consensus-reached").await;
        assert_eq!(reached["comparison_id"], comparison.id.as_str());
        assert_eq!(reached["winner_id"], comparison.item_a_id);
        assert_eq!(reached["is_tie"], false);

        let progress = client.expect("session-progress").await;
        assert_eq!(progress["completed"], 1);
        assert_eq!(progress["total"], 3);
    }
}

#[tokio::test]
async fn test_vote_on_closed_comparison_rejected() {
    let server = start_server().await;
    let comparison = server.comparisons[0].clone();
    server
        .state
        .ledger
        .submit_vote(PROJECT, &comparison.id, 10, Choice::Tie, None)
        .await
        .unwrap();
    server
        .state
        .ledger
        .submit_vote(PROJECT, &comparison.id, 11, Choice::Tie, None)
        .await
        .unwrap();

    let mut client = TestClient::connect(&server);
    client.join(&server.session.id, 10).await;
    client.vote(&comparison.id, Choice::Abstain).await;

    let error = client.expect("error").await;
    assert_eq!(error["code"], 4105);
}

#[tokio::test]
async fn test_leave_announces_departure() {
    let server = start_server().await;
    let mut alice = TestClient::connect(&server);
    let mut bob = TestClient::connect(&server);

    alice.join(&server.session.id, 10).await;
    bob.join(&server.session.id, 11).await;
    alice.expect("attendee-status").await;

    alice.send("leave-session", json!({})).await;

    let status = bob.expect("attendee-status").await;
    assert_eq!(status["participant_id"], 10);
    assert_eq!(status["online"], false);

    assert!(alice.recv().await.is_none());
    tokio::time::timeout(RECV_TIMEOUT, alice.task)
        .await
        .expect("agent did not stop")
        .unwrap();

    server.state.hub.flush().await.unwrap();
    assert_eq!(server.state.hub.online_participants(&server.session.id), vec![11]);
}

#[tokio::test]
async fn test_score_broadcast_reaches_project() {
    let server = start_server().await;
    let mut alice = TestClient::connect(&server);
    let mut bob = TestClient::connect(&server);

    alice.join(&server.session.id, 10).await;
    bob.join(&server.session.id, 11).await;
    alice.expect("attendee-status").await;

    alice
        .send(
            "score-submitted",
            json!({ "item_id": 2, "criterion": "complexity", "value": 5 }),
        )
        .await;
    let submitted = bob.expect("score-submitted").await;
    assert_eq!(submitted["item_id"], 2);
    assert_eq!(submitted["scores_submitted"], 1);
    assert!(submitted.get("value").is_none());

    bob.send(
        "score-submitted",
        json!({ "item_id": 2, "criterion": "complexity", "value": 5 }),
    )
    .await;
    alice.expect("score-submitted").await;
    let locked = alice.expect("consensus-locked").await;
    assert_eq!(locked["item_id"], 2);
    assert_eq!(locked["value"], 5);

    // Out-of-scale values are rejected to the sender only.
    bob.send(
        "score-submitted",
        json!({ "item_id": 3, "criterion": "value", "value": 4 }),
    )
    .await;
    bob.expect("consensus-locked").await;
    let error = bob.expect("error").await;
    assert_eq!(error["code"], 4102);
}

#[tokio::test]
async fn test_idle_connection_receives_ping() {
    let server = start_server_with(fast_hub_config()).await;
    let mut client = TestClient::connect(&server);

    let frame = client.recv().await.expect("stream closed");
    assert_eq!(frame["kind"], "ping");
}

#[tokio::test]
async fn test_missing_pongs_close_connection() {
    let server = start_server_with(fast_hub_config()).await;
    let mut client = TestClient::connect(&server);

    let mut pings = 0;
    while let Some(frame) = client.recv().await {
        assert_eq!(frame["kind"], "ping", "unexpected frame: {}", frame);
        pings += 1;
    }
    assert!(pings >= 1);

    tokio::time::timeout(RECV_TIMEOUT, client.task)
        .await
        .expect("agent did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_pongs_keep_connection_alive() {
    let server = start_server_with(fast_hub_config()).await;
    let mut client = TestClient::connect(&server);

    // Five probe rounds span well past the 300ms read deadline.
    for _ in 0..5 {
        client.expect("ping").await;
        client.send("pong", json!({})).await;
    }

    assert!(!client.task.is_finished());
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let server = start_server_with(fast_hub_config()).await;
    let mut client = TestClient::connect(&server);

    client.send_raw(&"x".repeat(200)).await;
    let frame = client.recv_skipping_pings().await.expect("stream closed");
    assert_eq!(frame["kind"], "error");
    assert_eq!(frame["payload"]["code"], 4009);

    assert!(
        client.recv_skipping_pings().await.is_none(),
        "server should close the stream"
    );
    tokio::time::timeout(RECV_TIMEOUT, client.task)
        .await
        .expect("agent did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_switching_session_announces_departure() {
    let server = start_server().await;
    let (complexity, _) = server
        .state
        .ledger
        .start_session(PROJECT, Criterion::Complexity, None)
        .await
        .unwrap();
    let mut alice = TestClient::connect(&server);
    let mut bob = TestClient::connect(&server);

    alice.join(&server.session.id, 10).await;
    bob.join(&server.session.id, 11).await;
    alice.expect("attendee-status").await;

    let welcome = alice.join(&complexity.id, 10).await;
    assert_eq!(welcome["criterion"], "complexity");

    let status = bob.expect("attendee-status").await;
    assert_eq!(status["session_id"], server.session.id.as_str());
    assert_eq!(status["participant_id"], 10);
    assert_eq!(status["online"], false);

    server.state.hub.flush().await.unwrap();
    assert_eq!(server.state.hub.online_participants(&server.session.id), vec![11]);
    assert_eq!(server.state.hub.online_participants(&complexity.id), vec![10]);
}
