use std::sync::Arc;

use tracing::instrument;

use parley_core::history::{ContentPart, HistoryEntry, Role};
use parley_core::ids::ThreadId;
use parley_core::tokens::{count_or_estimate, TokenCounter};
use parley_store::{HistoryRepo, StoreError};

/// Per-thread conversation log with token-budgeted reads.
pub struct HistoryStore {
    repo: HistoryRepo,
    counter: Arc<dyn TokenCounter>,
}

impl HistoryStore {
    pub fn new(repo: HistoryRepo, counter: Arc<dyn TokenCounter>) -> Self {
        Self { repo, counter }
    }

    /// Cost the parts and persist them as a new entry.
    #[instrument(skip(self, parts), fields(thread_id = %thread_id, role = %role))]
    pub async fn append(
        &self,
        thread_id: &ThreadId,
        role: Role,
        parts: Vec<ContentPart>,
    ) -> Result<HistoryEntry, StoreError> {
        // Every entry costs at least one token so a read never needs more
        // than `budget + 1` rows.
        let cost = count_or_estimate(self.counter.as_ref(), &parts).await.max(1);
        self.repo.append(thread_id, role, parts, cost)
    }

    /// Most recent entries that fit `budget`, oldest first.
    pub fn read(&self, thread_id: &ThreadId, budget: u32) -> Result<Vec<HistoryEntry>, StoreError> {
        let limit = usize::try_from(budget).unwrap_or(usize::MAX).saturating_add(1);
        let newest_first = self.repo.newest_first(thread_id, limit)?;
        Ok(trim_to_budget(newest_first, budget))
    }

    pub fn clear(&self, thread_id: &ThreadId) -> Result<usize, StoreError> {
        self.repo.clear(thread_id)
    }
}

/// Keep the newest entries whose summed cost stays within `budget`.
///
/// Input is newest first; output is oldest first. Stops at the first entry
/// that would overflow, so an older cheap entry is never pulled in past a
/// skipped one. A newest entry that alone exceeds the budget is kept alone.
pub fn trim_to_budget(newest_first: Vec<HistoryEntry>, budget: u32) -> Vec<HistoryEntry> {
    let mut total: u64 = 0;
    let mut kept = Vec::new();
    for entry in newest_first {
        total += u64::from(entry.token_cost);
        if total > u64::from(budget) {
            if kept.is_empty() {
                kept.push(entry);
            }
            break;
        }
        kept.push(entry);
    }
    kept.reverse();
    kept
}
