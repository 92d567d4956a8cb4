use super::*;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

// =============================================================================
// TEST PEER
// =============================================================================

/// What the in-process peer does in response to one inbound text frame.
enum PeerAction {
    Send(String),
    Sleep(Duration),
    Close,
}

type Handler = Arc<dyn Fn(&str) -> Vec<PeerAction> + Send + Sync>;

struct Peer {
    url: String,
    inbound: mpsc::UnboundedReceiver<String>,
    connections: Arc<AtomicUsize>,
}

impl Peer {
    /// Next text frame the peer received from the client, in arrival order.
    async fn recv(&mut self) -> String {
        timeout(Duration::from_secs(3), self.inbound.recv())
            .await
            .expect("peer receive timed out")
            .expect("peer channel closed")
    }

    async fn assert_nothing_more(&mut self) {
        assert!(
            timeout(Duration::from_millis(150), self.inbound.recv()).await.is_err(),
            "peer received an unexpected extra frame"
        );
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Spawn a websocket peer on an ephemeral port. Each accept waits `accept_delay`
/// first, so the client's handshake stalls in the listen backlog until then.
async fn spawn_peer<F>(accept_delay: Duration, handler: F) -> Peer
where
    F: Fn(&str) -> Vec<PeerAction> + Send + Sync + 'static,
{
    spawn_peer_with(accept_delay, 0, handler).await
}

/// Like [`spawn_peer`], but the first `stalled` connections complete the
/// handshake and are then never read, so the client's writes back up.
async fn spawn_peer_with<F>(accept_delay: Duration, stalled: usize, handler: F) -> Peer
where
    F: Fn(&str) -> Vec<PeerAction> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind peer");
    let addr = listener.local_addr().expect("peer addr");
    let (tx, inbound) = mpsc::unbounded_channel();
    let connections = Arc::new(AtomicUsize::new(0));
    let handler: Handler = Arc::new(handler);

    let count = Arc::clone(&connections);
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            tokio::time::sleep(accept_delay).await;
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            if count.fetch_add(1, Ordering::SeqCst) < stalled {
                held.push(ws);
                continue;
            }

            let tx = tx.clone();
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                'conn: while let Some(Ok(msg)) = ws.next().await {
                    let Message::Text(text) = msg else { continue };
                    let text = text.as_str().to_owned();
                    let _ = tx.send(text.clone());
                    for action in handler(&text) {
                        match action {
                            PeerAction::Send(out) => {
                                if ws.send(Message::text(out)).await.is_err() {
                                    break 'conn;
                                }
                            }
                            PeerAction::Sleep(d) => tokio::time::sleep(d).await,
                            PeerAction::Close => {
                                let _ = ws.close(None).await;
                                break 'conn;
                            }
                        }
                    }
                }
            });
        }
    });

    Peer { url: format!("ws://{addr}"), inbound, connections }
}

fn parse(text: &str) -> Value {
    serde_json::from_str(text).expect("peer saw JSON")
}

/// Reply `{requestid, pong: true}` to anything carrying a `requestid`.
fn echo(text: &str) -> Vec<PeerAction> {
    let value = parse(text);
    match value.get("requestid") {
        Some(id) => vec![PeerAction::Send(json!({"requestid": id, "pong": true}).to_string())],
        None => Vec::new(),
    }
}

fn silent(_: &str) -> Vec<PeerAction> {
    Vec::new()
}

/// `echo`, but frames that are not JSON are ignored.
fn echo_json(text: &str) -> Vec<PeerAction> {
    if serde_json::from_str::<Value>(text).is_err() {
        return Vec::new();
    }
    echo(text)
}

/// Frames large enough, in total, to fill loopback socket buffers.
fn bulk_frame(seq: usize) -> String {
    format!("{seq:03}:{}", "x".repeat(1 << 20))
}

fn client_for(peer: &Peer, request_timeout_ms: u64) -> Client {
    let config = ClientConfig::new(peer.url.clone())
        .expect("peer url")
        .with_request_timeout(Duration::from_millis(request_timeout_ms))
        .with_connect_timeout(Duration::from_secs(2));
    Client::new(config)
}

async fn within<F: Future>(fut: F) -> F::Output {
    timeout(Duration::from_secs(3), fut).await.expect("test step timed out")
}

async fn open(client: &Client) {
    client.open_socket().expect("open");
    within(client.wait_for_state(ConnectionState::Open)).await.expect("reach Open");
}

// =============================================================================
// REQUEST / RESPONSE
// =============================================================================

#[tokio::test]
async fn request_on_open_connection_resolves_with_peer_payload() {
    let peer = spawn_peer(Duration::ZERO, echo).await;
    let client = client_for(&peer, 2_000);
    open(&client).await;

    let pending = client.send_request(&json!({"op": "ping"})).expect("submit");
    let id = pending.id();
    let value = within(pending).await.expect("response");

    assert_eq!(value, json!({"requestid": id.get(), "pong": true}));
    let stats = client.stats().await.expect("stats");
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.resolved, 1);
    assert_eq!(stats.state, ConnectionState::Open);
}

#[tokio::test]
async fn request_carries_envelope_fields_and_application_fields() {
    let mut peer = spawn_peer(Duration::ZERO, echo).await;
    let client = client_for(&peer, 2_000);

    let pending = client.send_request(&json!({"op": "ping", "n": 3})).expect("submit");
    let id = pending.id();
    within(pending).await.expect("response");

    let sent = parse(&peer.recv().await);
    assert_eq!(sent["requestid"], id.get());
    assert_eq!(sent["op"], "ping");
    assert_eq!(sent["n"], 3);
    assert!(sent["sent"].as_i64().is_some_and(|ts| ts > 0));
}

#[tokio::test]
async fn request_while_disconnected_is_queued_sent_on_open_then_times_out() {
    let mut peer = spawn_peer(Duration::from_millis(50), silent).await;
    let client = client_for(&peer, 300);

    let pending = client.send_request(&json!({"op": "ping"})).expect("submit");
    let id = pending.id();
    let stats = client.stats().await.expect("stats");
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.state, ConnectionState::Connecting);

    let sent = parse(&peer.recv().await);
    assert_eq!(sent["requestid"], id.get());

    let err = within(pending).await.expect_err("no reply means timeout");
    assert!(matches!(err, ClientError::Timeout { id: timed_out, .. } if timed_out == id));

    let stats = client.stats().await.expect("stats");
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.state, ConnectionState::Open);
}

#[tokio::test]
async fn back_to_back_requests_get_distinct_ids_and_resolve_out_of_order() {
    let held = Mutex::new(Vec::<Value>::new());
    let peer = spawn_peer(Duration::ZERO, move |text: &str| {
        let mut held = held.lock().expect("held lock");
        held.push(parse(text)["requestid"].clone());
        if held.len() < 2 {
            return Vec::new();
        }
        held.drain(..)
            .rev()
            .map(|id| PeerAction::Send(json!({"requestid": id, "echo": id}).to_string()))
            .collect()
    })
    .await;
    let client = client_for(&peer, 2_000);

    let first = client.send_request(&json!({"op": "a"})).expect("submit a");
    let second = client.send_request(&json!({"op": "b"})).expect("submit b");
    let (first_id, second_id) = (first.id(), second.id());
    assert_ne!(first_id, second_id);

    let (a, b) = within(async { tokio::join!(first, second) }).await;
    assert_eq!(a.expect("first")["echo"], first_id.get());
    assert_eq!(b.expect("second")["echo"], second_id.get());
}

#[tokio::test]
async fn concurrent_requests_all_get_distinct_ids() {
    let peer = spawn_peer(Duration::ZERO, echo).await;
    let client = client_for(&peer, 3_000);

    let tasks = (0..50)
        .map(|n| {
            let client = client.clone();
            tokio::spawn(async move {
                let pending = client.send_request(&json!({"n": n})).expect("submit");
                let id = pending.id();
                let value = pending.await.expect("response");
                assert_eq!(value["requestid"], id.get());
                id
            })
        })
        .collect::<Vec<_>>();

    let mut ids = HashSet::new();
    for task in tasks {
        ids.insert(within(task).await.expect("task"));
    }
    assert_eq!(ids.len(), 50);
    assert_eq!(client.stats().await.expect("stats").pending, 0);
}

#[tokio::test]
async fn non_object_request_payload_is_rejected_up_front() {
    let peer = spawn_peer(Duration::ZERO, echo).await;
    let client = client_for(&peer, 2_000);

    let err = client.send_request(&json!(["not", "an", "object"])).expect_err("array payload");
    assert!(matches!(err, ClientError::Codec(_)));

    let stats = client.stats().await.expect("stats");
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.state, ConnectionState::Disconnected);
}

// =============================================================================
// INBOUND CONTAINMENT
// =============================================================================

#[tokio::test]
async fn unsolicited_and_uncorrelated_frames_fire_nothing() {
    let peer = spawn_peer(Duration::ZERO, |text: &str| {
        let mut actions = vec![
            PeerAction::Send(json!({"requestid": 999}).to_string()),
            PeerAction::Send(json!({"event": "broadcast"}).to_string()),
        ];
        actions.extend(echo(text));
        actions
    })
    .await;
    let client = client_for(&peer, 2_000);

    let value = within(client.request(&json!({"op": "ping"}))).await.expect("response");
    assert_eq!(value["pong"], true);

    let stats = client.stats().await.expect("stats");
    assert_eq!(stats.unsolicited, 1);
    assert_eq!(stats.uncorrelated, 1);
    assert_eq!(stats.resolved, 1);
}

#[tokio::test]
async fn malformed_frames_are_discarded_without_failing_requests() {
    let peer = spawn_peer(Duration::ZERO, |text: &str| {
        let mut actions = vec![
            PeerAction::Send("not json {".to_owned()),
            PeerAction::Send("[1, 2]".to_owned()),
        ];
        actions.extend(echo(text));
        actions
    })
    .await;
    let client = client_for(&peer, 2_000);

    let value = within(client.request(&json!({"op": "ping"}))).await.expect("response");
    assert_eq!(value["pong"], true);

    let stats = client.stats().await.expect("stats");
    assert_eq!(stats.malformed, 2);
    assert_eq!(stats.state, ConnectionState::Open);
}

#[tokio::test]
async fn late_response_after_timeout_is_unsolicited() {
    let peer = spawn_peer(Duration::ZERO, |text: &str| {
        let mut actions = vec![PeerAction::Sleep(Duration::from_millis(300))];
        actions.extend(echo(text));
        actions
    })
    .await;
    let client = client_for(&peer, 100);

    let err = within(client.request(&json!({"op": "slow"}))).await.expect_err("timeout");
    assert!(err.is_timeout());
    assert_eq!(client.stats().await.expect("stats").pending, 0);

    within(async {
        while client.stats().await.expect("stats").unsolicited == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert_eq!(client.stats().await.expect("stats").resolved, 0);
}

// =============================================================================
// QUEUE AND RECONNECT
// =============================================================================

#[tokio::test]
async fn messages_queued_while_disconnected_flush_in_submission_order() {
    let mut peer = spawn_peer(Duration::from_millis(50), echo).await;
    let client = client_for(&peer, 2_000);

    for seq in 0..5 {
        client.send_message(&json!({"seq": seq})).expect("send");
    }
    let pending = client.send_request(&json!({"seq": 5})).expect("submit");
    for seq in 6..10 {
        client.send_message(&json!({"seq": seq})).expect("send");
    }
    assert_eq!(client.stats().await.expect("stats").queued, 10);

    for expected in 0..10 {
        let frame = parse(&peer.recv().await);
        assert_eq!(frame["seq"], expected);
    }
    within(pending).await.expect("queued request still resolves");
    peer.assert_nothing_more().await;
}

#[tokio::test]
async fn peer_close_leads_to_on_demand_reconnect() {
    let peer = spawn_peer(Duration::ZERO, |text: &str| {
        if parse(text)["op"] == "bye" {
            return vec![PeerAction::Close];
        }
        echo(text)
    })
    .await;
    let client = client_for(&peer, 2_000);

    within(client.request(&json!({"op": "ping"}))).await.expect("first response");
    client.send_message(&json!({"op": "bye"})).expect("send bye");
    within(client.wait_for_state(ConnectionState::Disconnected)).await.expect("peer closed");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(peer.connections(), 1);

    within(client.request(&json!({"op": "ping"}))).await.expect("response after reconnect");
    assert_eq!(peer.connections(), 2);
}

#[tokio::test]
async fn close_socket_disconnects_without_reconnecting() {
    let peer = spawn_peer(Duration::ZERO, echo).await;
    let client = client_for(&peer, 2_000);
    open(&client).await;

    within(client.close_socket()).await.expect("close");
    assert_eq!(client.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(peer.connections(), 1);
}

#[tokio::test]
async fn close_during_connect_discards_stale_socket_and_keeps_queue() {
    let mut peer = spawn_peer(Duration::from_millis(150), silent).await;
    let client = client_for(&peer, 3_000);

    client.send_message(&json!({"op": "queued"})).expect("send");
    assert_eq!(client.stats().await.expect("stats").state, ConnectionState::Connecting);
    within(client.close_socket()).await.expect("close");

    let stats = client.stats().await.expect("stats");
    assert_eq!(stats.state, ConnectionState::Disconnected);
    assert_eq!(stats.queued, 1);

    // The abandoned attempt completes its handshake but must not go live.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);

    open(&client).await;
    assert_eq!(parse(&peer.recv().await)["op"], "queued");
    peer.assert_nothing_more().await;
}

#[tokio::test]
async fn failed_connect_returns_to_disconnected_and_keeps_queue() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let config = ClientConfig::new(format!("ws://{addr}"))
        .expect("url")
        .with_request_timeout(Duration::from_millis(300));
    let client = Client::new(config);

    let err = within(client.request(&json!({"op": "ping"}))).await.expect_err("nobody listening");
    assert!(err.is_timeout());

    let stats = client.stats().await.expect("stats");
    assert_eq!(stats.state, ConnectionState::Disconnected);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.queued, 1);
}

// =============================================================================
// FIRE-AND-FORGET AND LIFECYCLE
// =============================================================================

#[tokio::test]
async fn send_message_carries_no_correlation_field() {
    let mut peer = spawn_peer(Duration::ZERO, silent).await;
    let client = client_for(&peer, 2_000);

    client.send_message(&json!({"op": "notify"})).expect("send");
    let frame = parse(&peer.recv().await);
    assert_eq!(frame, json!({"op": "notify"}));
}

#[tokio::test]
async fn unserializable_message_falls_back_to_raw_rendering() {
    let mut peer = spawn_peer(Duration::ZERO, silent).await;
    let client = client_for(&peer, 2_000);

    let bad: HashMap<(u8, u8), u8> = [((1, 2), 3)].into_iter().collect();
    client.send_message(&bad).expect("degraded send");

    assert_eq!(peer.recv().await, "{(1, 2): 3}");
}

#[tokio::test]
async fn dropping_the_last_client_fails_outstanding_requests_with_shutdown() {
    let peer = spawn_peer(Duration::ZERO, silent).await;
    let client = client_for(&peer, 5_000);
    open(&client).await;

    let pending = client.send_request(&json!({"op": "ping"})).expect("submit");
    drop(client);

    let err = within(pending).await.expect_err("driver stopped");
    assert!(matches!(err, ClientError::Shutdown));
}

// =============================================================================
// BACKPRESSURE AND LIMITS
// =============================================================================

#[tokio::test]
async fn peer_that_stops_reading_cannot_hold_up_request_timeouts() {
    let peer = spawn_peer_with(Duration::ZERO, usize::MAX, silent).await;
    let config = ClientConfig::new(peer.url.clone())
        .expect("peer url")
        .with_request_timeout(Duration::from_millis(200))
        .with_send_timeout(Duration::from_millis(100));
    let client = Client::new(config);
    open(&client).await;

    for seq in 0..64 {
        client.send_text(bulk_frame(seq)).expect("send");
    }
    let err = within(client.request(&json!({"op": "ping"}))).await.expect_err("never answered");
    assert!(err.is_timeout());

    let stats = within(client.stats()).await.expect("driver still responsive");
    assert_eq!(stats.pending, 0);
    within(client.close_socket()).await.expect("close still responsive");
}

#[tokio::test]
async fn stalled_connection_is_dropped_and_backlog_replays_on_the_next_one() {
    let mut peer = spawn_peer_with(Duration::ZERO, 1, echo_json).await;
    let config = ClientConfig::new(peer.url.clone())
        .expect("peer url")
        .with_request_timeout(Duration::from_secs(10))
        .with_send_timeout(Duration::from_millis(100));
    let client = Client::new(config);
    open(&client).await;

    for seq in 0..32 {
        client.send_text(bulk_frame(seq)).expect("send");
    }
    let pending = client.send_request(&json!({"op": "after-bulk"})).expect("submit");
    let id = pending.id();
    let response = timeout(Duration::from_secs(10), pending)
        .await
        .expect("replay finished in time")
        .expect("response from second connection");
    assert_eq!(response["requestid"], id.get());
    assert_eq!(peer.connections(), 2);

    // Only the second connection is ever read: a gapless, duplicate-free run
    // of the bulk frames, ending with the last one, then the request.
    let mut seqs = Vec::new();
    loop {
        let frame = peer.recv().await;
        if frame.starts_with('{') {
            assert_eq!(parse(&frame)["op"], "after-bulk");
            break;
        }
        seqs.push(frame[..3].parse::<usize>().expect("sequence prefix"));
    }
    assert_eq!(seqs.last(), Some(&31));
    assert!(seqs.windows(2).all(|pair| pair[1] == pair[0] + 1), "{seqs:?}");
}

#[tokio::test]
async fn oversized_request_fails_alone_and_later_requests_still_flow() {
    let mut peer = spawn_peer(Duration::ZERO, echo).await;
    let config = ClientConfig::new(peer.url.clone())
        .expect("peer url")
        .with_request_timeout(Duration::from_secs(2))
        .with_max_message_size(1024);
    let client = Client::new(config);

    client.send_message(&json!({"seq": 0})).expect("send");
    let oversized = client.send_request(&json!({"blob": "x".repeat(4096)})).expect("submit");
    client.send_message(&json!({"seq": 1})).expect("send");
    let small = client.send_request(&json!({"seq": 2})).expect("submit");

    let err = within(oversized).await.expect_err("too large");
    assert!(matches!(err, ClientError::Send(reason) if reason.contains("max_message_size")));
    within(small).await.expect("small request resolves");

    for expected in 0..3 {
        assert_eq!(parse(&peer.recv().await)["seq"], expected);
    }
    peer.assert_nothing_more().await;

    let stats = client.stats().await.expect("stats");
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.queued, 0);
}

#[tokio::test]
async fn oversized_message_on_open_connection_is_dropped_without_reconnecting() {
    let mut peer = spawn_peer(Duration::ZERO, echo).await;
    let config = ClientConfig::new(peer.url.clone())
        .expect("peer url")
        .with_max_message_size(1024);
    let client = Client::new(config);
    open(&client).await;

    client.send_text("y".repeat(2048)).expect("send");
    within(client.request(&json!({"op": "ping"}))).await.expect("response");

    assert_eq!(parse(&peer.recv().await)["op"], "ping");
    assert_eq!(peer.connections(), 1);
    assert_eq!(client.state(), ConnectionState::Open);
}
