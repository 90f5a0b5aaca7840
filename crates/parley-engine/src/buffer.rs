//! Per-thread debounce buffer.
//!
//! Each push re-arms the thread's flush timer. When the quiet period passes
//! without another push, the buffered events are classified in arrival
//! order and emitted as one [`Batch`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use parley_core::events::{Batch, RawEvent};
use parley_core::ids::ThreadId;
use parley_core::transport::Transport;

use crate::cancel::CancelRegistry;
use crate::classifier::classify;

#[derive(Clone, Debug)]
pub struct IngestConfig {
    /// Quiet period before a buffer flushes.
    pub debounce: Duration,
    pub typing_refresh: Duration,
    /// Thread state with nothing buffered and no activity for this long is
    /// dropped by [`IngestBuffer::evict_idle`].
    pub idle_evict_after: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1_500),
            typing_refresh: Duration::from_millis(4_000),
            idle_evict_after: Duration::from_secs(30 * 60),
        }
    }
}

struct ThreadState {
    events: Vec<RawEvent>,
    /// Bumped on every push; a flush timer only fires for its own epoch.
    epoch: u64,
    flush: Option<JoinHandle<()>>,
    typing: Option<JoinHandle<()>>,
    last_activity: Instant,
}

impl ThreadState {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            epoch: 0,
            flush: None,
            typing: None,
            last_activity: Instant::now(),
        }
    }

    fn stop_timers(&mut self) {
        if let Some(handle) = self.flush.take() {
            handle.abort();
        }
        if let Some(handle) = self.typing.take() {
            handle.abort();
        }
    }
}

pub struct IngestBuffer {
    threads: DashMap<ThreadId, ThreadState>,
    cancel: Arc<CancelRegistry>,
    transport: Arc<dyn Transport>,
    batches: mpsc::UnboundedSender<Batch>,
    config: IngestConfig,
}

impl IngestBuffer {
    /// Returns the buffer and the receiving end of its batch channel.
    pub fn new(
        cancel: Arc<CancelRegistry>,
        transport: Arc<dyn Transport>,
        config: IngestConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Batch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffer = Arc::new(Self {
            threads: DashMap::new(),
            cancel,
            transport,
            batches: tx,
            config,
        });
        (buffer, rx)
    }

    /// Buffer an inbound event, pre-empting any generation running for the
    /// thread. Must be called from within a tokio runtime.
    #[instrument(skip_all, fields(thread_id = %raw.thread_id))]
    pub fn push(self: &Arc<Self>, raw: RawEvent) {
        let thread_id = raw.thread_id.clone();
        if self.cancel.abort(&thread_id) {
            debug!("new input pre-empted running generation");
        }

        let mut state = self.threads.entry(thread_id.clone()).or_insert_with(ThreadState::new);
        let first = state.events.is_empty();
        state.events.push(raw);
        state.epoch += 1;
        state.last_activity = Instant::now();

        if let Some(handle) = state.flush.take() {
            handle.abort();
        }
        let epoch = state.epoch;
        let debounce = self.config.debounce;
        let this = Arc::clone(self);
        let flush_thread = thread_id.clone();
        state.flush = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            this.fire(&flush_thread, epoch);
        }));

        if first {
            if let Some(handle) = state.typing.take() {
                handle.abort();
            }
            state.typing = Some(self.spawn_typing(thread_id));
        }
        debug!(buffered = state.events.len(), epoch, "event buffered");
    }

    fn fire(&self, thread_id: &ThreadId, epoch: u64) {
        let events = {
            let Some(mut state) = self.threads.get_mut(thread_id) else {
                return;
            };
            if state.epoch != epoch {
                return;
            }
            // The running task is this one; dropping its handle detaches it.
            state.flush = None;
            if let Some(handle) = state.typing.take() {
                handle.abort();
            }
            state.last_activity = Instant::now();
            std::mem::take(&mut state.events)
        };
        if events.is_empty() {
            return;
        }

        let batch = Batch {
            thread_id: thread_id.clone(),
            events: events.iter().map(classify).collect(),
        };
        debug!(thread_id = %thread_id, events = batch.len(), "flushing batch");
        if self.batches.send(batch).is_err() {
            warn!(thread_id = %thread_id, "batch receiver dropped, discarding batch");
        }
    }

    fn spawn_typing(&self, thread_id: ThreadId) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let refresh = self.config.typing_refresh;
        tokio::spawn(async move {
            loop {
                if let Err(e) = transport.typing(&thread_id).await {
                    debug!(thread_id = %thread_id, error = %e, "typing indicator failed");
                }
                tokio::time::sleep(refresh).await;
            }
        })
    }

    /// Drop thread states that have nothing buffered, no live generation,
    /// and no activity since `now - idle_evict_after`.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let limit = self.config.idle_evict_after;
        let mut evicted = 0;
        self.threads.retain(|thread_id, state| {
            let idle = state.events.is_empty()
                && now.saturating_duration_since(state.last_activity) >= limit
                && !self.cancel.is_active(thread_id);
            if idle {
                state.stop_timers();
                evicted += 1;
            }
            !idle
        });
        if evicted > 0 {
            debug!(evicted, remaining = self.threads.len(), "evicted idle threads");
        }
        evicted
    }

    /// Events waiting for the thread's flush timer.
    pub fn buffered(&self, thread_id: &ThreadId) -> usize {
        self.threads.get(thread_id).map_or(0, |s| s.events.len())
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Stop every timer. Buffered events are dropped.
    pub fn close(&self) {
        for mut state in self.threads.iter_mut() {
            state.stop_timers();
        }
        self.threads.clear();
    }
}
