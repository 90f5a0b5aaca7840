use chrono::Utc;
use tracing::instrument;

use parley_core::history::{ContentPart, HistoryEntry, Role};
use parley_core::ids::{EntryId, ThreadId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const TABLE: &str = "history_entries";

/// Append-only per-thread conversation log.
#[derive(Clone)]
pub struct HistoryRepo {
    db: Database,
}

impl HistoryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a new entry. Entries are never updated afterwards.
    #[instrument(skip(self, parts), fields(thread_id = %thread_id, role = %role))]
    pub fn append(
        &self,
        thread_id: &ThreadId,
        role: Role,
        parts: Vec<ContentPart>,
        token_cost: u32,
    ) -> Result<HistoryEntry, StoreError> {
        let entry = HistoryEntry {
            id: EntryId::new(),
            thread_id: thread_id.clone(),
            role,
            parts,
            created_at: Utc::now(),
            token_cost,
        };
        let parts_json = serde_json::to_string(&entry.parts)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO history_entries (id, thread_id, role, parts, token_cost, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    entry.id.as_str(),
                    entry.thread_id.as_str(),
                    entry.role.as_str(),
                    parts_json,
                    entry.token_cost,
                    entry.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;

        Ok(entry)
    }

    /// Up to `limit` entries, newest first.
    pub fn newest_first(
        &self,
        thread_id: &ThreadId,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, thread_id, role, parts, token_cost, created_at
                 FROM history_entries WHERE thread_id = ?1
                 ORDER BY seq DESC LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![thread_id.as_str(), limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(entry_from_row(row)?);
            }
            Ok(out)
        })
    }

    /// Remove every entry for the thread. Returns how many were removed.
    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub fn clear(&self, thread_id: &ThreadId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM history_entries WHERE thread_id = ?1",
                [thread_id.as_str()],
            )?)
        })
    }

    pub fn count(&self, thread_id: &ThreadId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM history_entries WHERE thread_id = ?1",
                [thread_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> Result<HistoryEntry, StoreError> {
    let id: String = row_helpers::get(row, 0, TABLE, "id")?;
    let thread_id: String = row_helpers::get(row, 1, TABLE, "thread_id")?;
    let role: String = row_helpers::get(row, 2, TABLE, "role")?;
    let parts: String = row_helpers::get(row, 3, TABLE, "parts")?;
    let token_cost: u32 = row_helpers::get(row, 4, TABLE, "token_cost")?;
    let created_at: String = row_helpers::get(row, 5, TABLE, "created_at")?;

    Ok(HistoryEntry {
        id: EntryId::from_raw(id),
        thread_id: ThreadId::from_raw(thread_id),
        role: row_helpers::parse_enum(&role, TABLE, "role")?,
        parts: row_helpers::parse_json(&parts, TABLE, "parts")?,
        created_at: row_helpers::parse_timestamp(&created_at, TABLE, "created_at")?,
        token_cost,
    })
}
