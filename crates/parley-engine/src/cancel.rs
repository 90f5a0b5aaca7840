use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use parley_core::ids::ThreadId;

/// Handle for one generation round. Consumers check `token` between stream
/// reads and before every side effect.
#[derive(Clone, Debug)]
pub struct GenerationTask {
    pub thread_id: ThreadId,
    pub task_id: u64,
    pub token: CancellationToken,
    pub started_at: Instant,
}

impl GenerationTask {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct ActiveTask {
    task_id: u64,
    token: CancellationToken,
}

/// One live generation per thread, plus the per-thread queue of output
/// that was cut off by a cancellation.
pub struct CancelRegistry {
    active: DashMap<ThreadId, ActiveTask>,
    pending: DashMap<ThreadId, Vec<String>>,
    next_id: AtomicU64,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self {
            active: DashMap::new(),
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new task, cancelling whatever was running for the thread.
    pub fn start_task(&self, thread_id: &ThreadId) -> GenerationTask {
        let task_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let previous = self.active.insert(
            thread_id.clone(),
            ActiveTask {
                task_id,
                token: token.clone(),
            },
        );
        if let Some(prev) = previous {
            if !prev.token.is_cancelled() {
                prev.token.cancel();
                debug!(thread_id = %thread_id, superseded = prev.task_id, task_id, "superseded running task");
            }
        }
        GenerationTask {
            thread_id: thread_id.clone(),
            task_id,
            token,
            started_at: Instant::now(),
        }
    }

    /// Cancel the thread's task. Returns whether a live task was cancelled.
    pub fn abort(&self, thread_id: &ThreadId) -> bool {
        match self.active.remove(thread_id) {
            Some((_, task)) if !task.token.is_cancelled() => {
                task.token.cancel();
                debug!(thread_id = %thread_id, task_id = task.task_id, "aborted task");
                true
            }
            _ => false,
        }
    }

    /// Cancel every live task. Returns how many were live.
    pub fn abort_all(&self) -> usize {
        let threads: Vec<ThreadId> = self.active.iter().map(|e| e.key().clone()).collect();
        threads.iter().filter(|t| self.abort(t)).count()
    }

    /// Drop the handle, but only if it still belongs to `task`.
    pub fn finish(&self, task: &GenerationTask) -> bool {
        self.active
            .remove_if(&task.thread_id, |_, active| active.task_id == task.task_id)
            .is_some()
    }

    pub fn is_active(&self, thread_id: &ThreadId) -> bool {
        self.active
            .get(thread_id)
            .is_some_and(|t| !t.token.is_cancelled())
    }

    /// Number of threads with a live task.
    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|t| !t.token.is_cancelled()).count()
    }

    /// Queue output that was never delivered. Blank fragments are ignored.
    pub fn push_pending(&self, thread_id: &ThreadId, text: impl Into<String>) {
        let text = text.into();
        if text.trim().is_empty() {
            return;
        }
        self.pending.entry(thread_id.clone()).or_default().push(text);
    }

    /// Drain queued fragments in the order they were queued.
    pub fn take_pending(&self, thread_id: &ThreadId) -> Vec<String> {
        self.pending
            .remove(thread_id)
            .map(|(_, fragments)| fragments)
            .unwrap_or_default()
    }
}

impl Default for CancelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
