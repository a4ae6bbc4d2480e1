//! Plugin entry point.
//!
//! `ApiTap::start` wires the cache, the bounded outbound queue, and the
//! reporter together, spawns the reporter in the background, and hands back
//! the state the host installs as middleware. One tap per server.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::CallCache;
use crate::config::TapConfig;
use crate::record::ApiCall;
use crate::reporter::Reporter;

/// Shared interceptor state: the correlation cache, the outbound queue, and
/// the configuration. Cheap to clone; adapters for other host frameworks can
/// build one directly with [`TapState::new`].
#[derive(Clone)]
pub struct TapState {
    cache: Arc<CallCache>,
    queue: OutboundQueue,
    config: Arc<TapConfig>,
}

impl TapState {
    pub fn new(cache: Arc<CallCache>, queue: mpsc::Sender<ApiCall>, config: Arc<TapConfig>) -> Self {
        Self {
            cache,
            queue: OutboundQueue::new(queue),
            config,
        }
    }

    pub fn cache(&self) -> &Arc<CallCache> {
        &self.cache
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn config(&self) -> &TapConfig {
        &self.config
    }
}

/// Order-preserving handoff from the interceptor to the reporter. Submissions
/// happen in non-async contexts (the capture tee completes inside `poll` or
/// `Drop`), so a full channel parks records in an overflow list that a single
/// drainer task replays in submission order.
#[derive(Clone)]
pub struct OutboundQueue {
    inner: Arc<OutboundInner>,
}

struct OutboundInner {
    sender: mpsc::Sender<ApiCall>,
    overflow: Mutex<Overflow>,
}

#[derive(Default)]
struct Overflow {
    parked: VecDeque<ApiCall>,
    draining: bool,
}

impl OutboundQueue {
    pub(crate) fn new(sender: mpsc::Sender<ApiCall>) -> Self {
        Self {
            inner: Arc::new(OutboundInner {
                sender,
                overflow: Mutex::new(Overflow::default()),
            }),
        }
    }

    /// Submit one record without dropping or reordering it. While the drainer
    /// owns the head of the line, every new record parks behind it, so
    /// submission order holds even under a saturated channel.
    pub fn push(&self, call: ApiCall) {
        {
            let mut overflow = self.inner.overflow.lock().expect("overflow lock poisoned");
            if overflow.draining {
                overflow.parked.push_back(call);
                return;
            }
            match self.inner.sender.try_send(call) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(call)) => {
                    debug!(request_id = %call.request_id, "outbound queue full, parking");
                    overflow.parked.push_back(call);
                    overflow.draining = true;
                }
                Err(mpsc::error::TrySendError::Closed(call)) => {
                    // Reporter is draining or gone; records past stop are discarded.
                    debug!(request_id = %call.request_id, "outbound queue closed, record discarded");
                    return;
                }
            }
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self.clone().drain_parked());
            }
            Err(_) => {
                let mut overflow = self.inner.overflow.lock().expect("overflow lock poisoned");
                overflow.parked.clear();
                overflow.draining = false;
                warn!("no runtime for backpressured enqueue, record discarded");
            }
        }
    }

    async fn drain_parked(self) {
        loop {
            let call = {
                let mut overflow = self.inner.overflow.lock().expect("overflow lock poisoned");
                match overflow.parked.pop_front() {
                    Some(call) => call,
                    None => {
                        overflow.draining = false;
                        return;
                    }
                }
            };
            if self.inner.sender.send(call).await.is_err() {
                let mut overflow = self.inner.overflow.lock().expect("overflow lock poisoned");
                let discarded = overflow.parked.len() + 1;
                overflow.parked.clear();
                overflow.draining = false;
                warn!(discarded, "outbound queue closed, parked records discarded");
                return;
            }
        }
    }
}

/// Handle for one running tap. Dropping it without [`ApiTap::stop`] aborts
/// the reporter task.
pub struct ApiTap {
    state: TapState,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ApiTap {
    /// Build the pipeline and spawn the reporter. Must be called from within
    /// a tokio runtime.
    pub fn start(config: TapConfig) -> Self {
        let config = Arc::new(config);
        let cache = Arc::new(CallCache::new());
        let (queue_tx, queue_rx) = mpsc::channel(config.outbound_queue_size.max(1));
        let cancel = CancellationToken::new();

        let reporter = Reporter::new(
            Arc::clone(&config),
            Arc::clone(&cache),
            queue_rx,
            cancel.clone(),
        );
        let task = tokio::spawn(reporter.run());

        Self {
            state: TapState::new(cache, queue_tx, config),
            cancel,
            task: Some(task),
        }
    }

    /// State to install via `axum::middleware::from_fn_with_state`.
    pub fn state(&self) -> TapState {
        self.state.clone()
    }

    pub fn cache(&self) -> &Arc<CallCache> {
        self.state.cache()
    }

    /// Signal the reporter to drain and wait for it to exit. In-flight host
    /// requests keep finalizing into the cache; records that miss the drain
    /// window are discarded.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "reporter task failed during shutdown");
                }
            }
        }
    }
}

impl Drop for ApiTap {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
