//! Collector transport.
//!
//! One long-lived websocket per process: the writer half sends finalized
//! records as JSON text frames, the reader half consumes `OK:`/`ERROR:` frames
//! and evicts acknowledged records from the cache. Transient failures never
//! surface to the host; the reporter reconnects with capped full-jitter
//! backoff and resumes from the head of its queue.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::CallCache;
use crate::config::TapConfig;
use crate::error::{Result, TapError};
use crate::record::ApiCall;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// How long the writer waits for the reader to observe the close handshake.
const CLOSE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, PartialEq)]
enum SessionEnd {
    Reconnect,
    Shutdown,
}

pub struct Reporter {
    config: Arc<TapConfig>,
    cache: Arc<CallCache>,
    queue: mpsc::Receiver<ApiCall>,
    cancel: CancellationToken,
    /// Head-of-line slot: a record whose send failed is parked here and is
    /// retried first after reconnect, preserving intra-session order.
    pending: Option<ApiCall>,
}

impl Reporter {
    pub fn new(
        config: Arc<TapConfig>,
        cache: Arc<CallCache>,
        queue: mpsc::Receiver<ApiCall>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            cache,
            queue,
            cancel,
            pending: None,
        }
    }

    /// Connect-and-serve loop. Runs until the cancel token fires or a process
    /// interrupt arrives; every other failure reconnects.
    pub async fn run(mut self) {
        let interrupt = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = interrupt.cancelled() => {}
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        info!("interrupt received, stopping reporter");
                        interrupt.cancel();
                    }
                }
            }
        });

        let mut attempt: u32 = 0;
        while !self.cancel.is_cancelled() {
            match self.connect().await {
                Ok(socket) => {
                    info!(host = %self.config.collector_host, "connected to collector");
                    attempt = 0;
                    if self.session(socket).await == SessionEnd::Shutdown {
                        break;
                    }
                }
                Err(err) => {
                    warn!(host = %self.config.collector_host, error = %err, "collector dial failed");
                }
            }

            let delay = backoff_delay(attempt, self.config.backoff_initial, self.config.backoff_cap);
            attempt = attempt.saturating_add(1);
            debug!(?delay, attempt, "backing off before reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        info!(unacked = self.cache.get_finalized().len(), "reporter stopped");
    }

    async fn connect(&self) -> Result<WsStream> {
        let mut request = self.config.collector_url().into_client_request()?;
        let bearer = format!("Bearer {}", self.config.api_secret);
        let bearer = HeaderValue::from_str(&bearer)
            .map_err(|_| TapError::Handshake("api secret is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (socket, response) = timeout(self.config.handshake_timeout, connect_async(request))
            .await
            .map_err(|_| TapError::Handshake("handshake timed out".into()))??;
        debug!(status = %response.status(), "collector handshake complete");
        Ok(socket)
    }

    /// Drive one connection. The reader runs as its own task; the writer runs
    /// here, pulling from the head-of-line slot first, then the queue.
    async fn session(&mut self, socket: WsStream) -> SessionEnd {
        let (mut sink, stream) = socket.split();
        let mut reader = tokio::spawn(read_loop(stream, Arc::clone(&self.cache)));

        let end = 'session: loop {
            while let Some(call) = self.pending.take() {
                if let Err(call) = self.send_record(&mut sink, call).await {
                    self.pending = Some(call);
                    break 'session SessionEnd::Reconnect;
                }
            }

            tokio::select! {
                _ = &mut reader => {
                    warn!("collector connection lost, reconnecting");
                    break SessionEnd::Reconnect;
                }
                _ = self.cancel.cancelled() => break SessionEnd::Shutdown,
                received = self.queue.recv() => match received {
                    Some(call) => self.pending = Some(call),
                    None => {
                        // Every sender is gone; nothing more will ever arrive.
                        self.cancel.cancel();
                        break SessionEnd::Shutdown;
                    }
                },
            }
        };

        if end == SessionEnd::Shutdown {
            self.drain(&mut sink).await;
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }));
            if let Err(err) = sink.send(close).await {
                debug!(error = %err, "close frame not delivered");
            }
            let _ = timeout(CLOSE_WAIT, &mut reader).await;
        }
        reader.abort();
        end
    }

    /// Send one record as a text frame. A serialization failure drops the
    /// record; a transport failure hands it back for the head-of-line slot.
    async fn send_record(
        &self,
        sink: &mut WsSink,
        call: ApiCall,
    ) -> std::result::Result<(), ApiCall> {
        let frame = match call.to_frame() {
            Ok(frame) => frame,
            Err(err) => {
                error!(request_id = %call.request_id, error = %err, "dropping unencodable record");
                return Ok(());
            }
        };
        match timeout(self.config.write_timeout, sink.send(Message::Text(frame))).await {
            Ok(Ok(())) => {
                debug!(request_id = %call.request_id, "record sent");
                Ok(())
            }
            Ok(Err(err)) => {
                warn!(request_id = %call.request_id, error = %err, "send failed");
                Err(call)
            }
            Err(_) => {
                warn!(request_id = %call.request_id, "send timed out");
                Err(call)
            }
        }
    }

    /// Flush whatever is already buffered, bounded by `drain_timeout`. New
    /// sends are refused from here on; records that miss the deadline are
    /// discarded by design.
    async fn drain(&mut self, sink: &mut WsSink) {
        self.queue.close();
        let deadline = Instant::now() + self.config.drain_timeout;
        let mut drained = 0usize;
        loop {
            let call = match self.pending.take() {
                Some(call) => call,
                None => match self.queue.try_recv() {
                    Ok(call) => call,
                    Err(_) => break,
                },
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("drain deadline reached, discarding remaining records");
                break;
            }
            let frame = match call.to_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    error!(request_id = %call.request_id, error = %err, "dropping unencodable record");
                    continue;
                }
            };
            match timeout(remaining, sink.send(Message::Text(frame))).await {
                Ok(Ok(())) => drained += 1,
                _ => {
                    warn!("drain send failed, discarding remaining records");
                    break;
                }
            }
        }
        debug!(drained, "drain complete");
    }
}

/// Consume collector frames until the connection drops.
async fn read_loop(mut stream: SplitStream<WsStream>, cache: Arc<CallCache>) {
    while let Some(next) = stream.next().await {
        match next {
            Ok(Message::Text(text)) => handle_frame(&text, &cache),
            Ok(Message::Close(frame)) => {
                info!(?frame, "collector closed the connection");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "collector read failed");
                break;
            }
        }
    }
}

fn handle_frame(text: &str, cache: &CallCache) {
    if let Some(request_id) = text.strip_prefix("OK:") {
        cache.delete(request_id);
        debug!(request_id, "record acknowledged");
    } else if let Some(detail) = text.strip_prefix("ERROR:") {
        error!(detail, "collector reported an error");
    } else {
        info!(frame = text, "ignoring unrecognized collector frame");
    }
}

/// Full-jitter exponential backoff: uniform over `(0, min(initial * 2^attempt, cap))`.
fn backoff_delay(attempt: u32, initial: Duration, cap: Duration) -> Duration {
    let ceiling = initial
        .saturating_mul(2u32.saturating_pow(attempt.min(16)))
        .min(cap);
    ceiling.mul_f64(rand::random::<f64>())
}
