use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use apitap::{ApiCall, CallCache, Reporter, RequestSnapshot, ResponseSnapshot, TapConfig};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{accept_async, accept_async_with_config, accept_hdr_async};
use tokio_util::sync::CancellationToken;

fn test_config(addr: SocketAddr) -> TapConfig {
    let mut config = TapConfig::new(addr.to_string(), "swordfish");
    config.tls = false;
    config.backoff_initial = Duration::from_millis(10);
    config.backoff_cap = Duration::from_millis(50);
    config.drain_timeout = Duration::from_secs(2);
    config
}

fn start_reporter(
    config: TapConfig,
    cache: Arc<CallCache>,
) -> (
    mpsc::Sender<ApiCall>,
    CancellationToken,
    tokio::task::JoinHandle<()>,
) {
    let (queue_tx, queue_rx) = mpsc::channel(100);
    let cancel = CancellationToken::new();
    let reporter = Reporter::new(Arc::new(config), cache, queue_rx, cancel.clone());
    let task = tokio::spawn(reporter.run());
    (queue_tx, cancel, task)
}

fn finalized_call(cache: &CallCache, id: &str) -> ApiCall {
    cache.create(id, "/things/:id", "GET", RequestSnapshot::default());
    cache
        .finalize(id, ResponseSnapshot::default())
        .expect("freshly created id")
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn acked_records_are_evicted_in_send_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Collector stub: greets with noise the client must ignore, then acks
    // every record it receives.
    let (seen_tx, mut seen_rx) = mpsc::channel::<String>(32);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let seen_tx = seen_tx.clone();
            tokio::spawn(async move {
                let mut socket = accept_async(stream).await.unwrap();
                socket.send(Message::Text("HELLO".to_string())).await.unwrap();
                socket
                    .send(Message::Text("OK:ghost".to_string()))
                    .await
                    .unwrap();
                socket
                    .send(Message::Text("ERROR:synthetic".to_string()))
                    .await
                    .unwrap();
                while let Some(Ok(message)) = socket.next().await {
                    if let Message::Text(text) = message {
                        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                        let id = value["reqId"].as_str().unwrap().to_string();
                        socket
                            .send(Message::Text(format!("OK:{id}")))
                            .await
                            .unwrap();
                        seen_tx.send(id).await.unwrap();
                    }
                }
            });
        }
    });

    let cache = Arc::new(CallCache::new());
    let (queue, cancel, task) = start_reporter(test_config(addr), Arc::clone(&cache));

    for id in ["a", "b", "c"] {
        let call = finalized_call(&cache, id);
        queue.send(call).await.unwrap();
    }

    // Delivered in enqueue order within the session.
    for expected in ["a", "b", "c"] {
        let seen = timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .expect("collector saw the record")
            .unwrap();
        assert_eq!(seen, expected);
    }

    // The ghost ack touched nothing; the real acks evicted everything.
    let cache_for_wait = Arc::clone(&cache);
    wait_until("cache eviction", move || cache_for_wait.is_empty()).await;

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn handshake_carries_bearer_secret_to_the_ws_endpoint() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (auth_tx, auth_rx) = tokio::sync::oneshot::channel::<(String, String)>();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
        let socket = accept_hdr_async(stream, |request: &Request, response: Response| {
            let auth = request
                .headers()
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let path = request.uri().path().to_string();
            let _ = auth_tx.send((auth, path));
            Ok(response)
        })
        .await
        .unwrap();
        drop(socket);
    });

    let cache = Arc::new(CallCache::new());
    let (_queue, cancel, task) = start_reporter(test_config(addr), Arc::clone(&cache));

    let (auth, path) = timeout(Duration::from_secs(5), auth_rx)
        .await
        .expect("handshake observed")
        .unwrap();
    assert_eq!(auth, "Bearer swordfish");
    assert_eq!(path, "/ws");

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn reconnects_after_a_dropped_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (reconnected_tx, reconnected_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        // First connection: handshake, then slam the door.
        let (stream, _) = listener.accept().await.unwrap();
        let socket = accept_async(stream).await.unwrap();
        drop(socket);

        // Second connection behaves. Signal only once its handshake is done,
        // so the record below cannot race onto the doomed first connection
        // (spec §8 scenario 3 permits a sent-but-unacked record to be lost).
        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = accept_async(stream).await.unwrap();
        let _ = reconnected_tx.send(());
        while let Some(Ok(message)) = socket.next().await {
            if let Message::Text(text) = message {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                let id = value["reqId"].as_str().unwrap();
                socket
                    .send(Message::Text(format!("OK:{id}")))
                    .await
                    .unwrap();
            }
        }
    });

    let cache = Arc::new(CallCache::new());
    let (queue, cancel, task) = start_reporter(test_config(addr), Arc::clone(&cache));

    reconnected_rx.await.unwrap();
    let call = finalized_call(&cache, "survivor");
    queue.send(call).await.unwrap();

    let cache_for_wait = Arc::clone(&cache);
    wait_until("ack after reconnect", move || cache_for_wait.is_empty()).await;

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn failed_send_is_parked_and_resent_first_after_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (seen_tx, mut seen_rx) = mpsc::channel::<String>(32);
    tokio::spawn(async move {
        // First connection: complete the handshake, then never read. An
        // oversized frame cannot flush and the client's write times out.
        let (stream, _) = listener.accept().await.unwrap();
        let stalled = accept_async(stream).await.unwrap();

        // Second connection reads and acks normally, with the read limits
        // lifted so the oversized record fits in one frame.
        let (stream, _) = listener.accept().await.unwrap();
        let mut limits = WebSocketConfig::default();
        limits.max_message_size = None;
        limits.max_frame_size = None;
        let mut socket = accept_async_with_config(stream, Some(limits)).await.unwrap();
        while let Some(Ok(message)) = socket.next().await {
            if let Message::Text(text) = message {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                let id = value["reqId"].as_str().unwrap().to_string();
                socket
                    .send(Message::Text(format!("OK:{id}")))
                    .await
                    .unwrap();
                seen_tx.send(id).await.unwrap();
            }
        }
        drop(stalled);
    });

    let mut config = test_config(addr);
    config.write_timeout = Duration::from_millis(500);

    let cache = Arc::new(CallCache::new());
    let (queue, cancel, task) = start_reporter(config, Arc::clone(&cache));

    // Far larger than any loopback socket buffer, so the first send wedges.
    let mut wedged = finalized_call(&cache, "wedged");
    wedged.response.body = "x".repeat(32 * 1024 * 1024);
    queue.send(wedged).await.unwrap();
    queue.send(finalized_call(&cache, "follower")).await.unwrap();

    // The parked record goes out first on the new connection, then the rest
    // of the queue in order.
    for expected in ["wedged", "follower"] {
        let seen = timeout(Duration::from_secs(10), seen_rx.recv())
            .await
            .expect("collector saw the record")
            .unwrap();
        assert_eq!(seen, expected);
    }

    let cache_for_wait = Arc::clone(&cache);
    wait_until("ack eviction", move || cache_for_wait.is_empty()).await;

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn stop_drains_the_queue_and_closes_cleanly() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Collector stub that never acks; it only witnesses frames and the close.
    let (seen_tx, mut seen_rx) = mpsc::channel::<String>(32);
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = accept_async(stream).await.unwrap();
        let _ = ready_tx.send(());
        while let Some(Ok(message)) = socket.next().await {
            match message {
                Message::Text(text) => {
                    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                    let id = value["reqId"].as_str().unwrap().to_string();
                    seen_tx.send(id).await.unwrap();
                }
                Message::Close(_) => {
                    seen_tx.send("CLOSE".to_string()).await.unwrap();
                    break;
                }
                _ => {}
            }
        }
    });

    let cache = Arc::new(CallCache::new());
    let (queue, cancel, task) = start_reporter(test_config(addr), Arc::clone(&cache));
    ready_rx.await.unwrap();

    for id in ["x", "y", "z"] {
        let call = finalized_call(&cache, id);
        queue.send(call).await.unwrap();
    }
    cancel.cancel();

    // Drain must finish well before the timeout and end in a close frame.
    timeout(Duration::from_secs(4), task)
        .await
        .expect("reporter stopped within the drain window")
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(Some(frame)) = timeout(Duration::from_secs(1), seen_rx.recv()).await {
        seen.push(frame);
    }
    assert_eq!(seen, vec!["x", "y", "z", "CLOSE"]);
}
