use std::collections::HashMap;

use chrono::{DateTime, Utc};

use parley_core::credentials::CooldownStore;
use parley_core::errors::PersistenceError;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const TABLE: &str = "credential_cooldowns";

/// Credential cooldown deadlines, keyed by slot id.
#[derive(Clone)]
pub struct CooldownRepo {
    db: Database,
}

impl CooldownRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or move the cooldown deadline for a slot.
    pub fn upsert(&self, slot_id: &str, until: DateTime<Utc>) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO credential_cooldowns (slot_id, cooldown_until, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(slot_id) DO UPDATE SET
                     cooldown_until = excluded.cooldown_until,
                     updated_at = excluded.updated_at",
                rusqlite::params![slot_id, until.to_rfc3339(), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Cooldowns still in force at `now`.
    pub fn active(&self, now: DateTime<Utc>) -> Result<HashMap<String, DateTime<Utc>>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT slot_id, cooldown_until FROM credential_cooldowns")?;
            let mut rows = stmt.query([])?;
            let mut out = HashMap::new();
            while let Some(row) = rows.next()? {
                let slot_id: String = row_helpers::get(row, 0, TABLE, "slot_id")?;
                let raw: String = row_helpers::get(row, 1, TABLE, "cooldown_until")?;
                let until = row_helpers::parse_timestamp(&raw, TABLE, "cooldown_until")?;
                if until > now {
                    out.insert(slot_id, until);
                }
            }
            Ok(out)
        })
    }

    /// Drop expired rows. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        // RFC 3339 strings in UTC compare lexically in time order.
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM credential_cooldowns WHERE cooldown_until <= ?1",
                [now.to_rfc3339()],
            )?)
        })
    }
}

impl CooldownStore for CooldownRepo {
    fn load_cooldowns(&self) -> Result<HashMap<String, DateTime<Utc>>, PersistenceError> {
        let now = Utc::now();
        if let Err(e) = self.purge_expired(now) {
            tracing::debug!(error = %e, "failed to purge expired cooldowns");
        }
        Ok(self.active(now)?)
    }

    fn save_cooldown(&self, slot_id: &str, until: DateTime<Utc>) -> Result<(), PersistenceError> {
        Ok(self.upsert(slot_id, until)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn repo() -> CooldownRepo {
        CooldownRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn save_and_load() {
        let repo = repo();
        let until = Utc::now() + Duration::seconds(60);
        repo.save_cooldown("gemini-2.0-flash/0", until).unwrap();

        let loaded = repo.load_cooldowns().unwrap();
        assert_eq!(loaded.get("gemini-2.0-flash/0"), Some(&until));
    }

    #[test]
    fn upsert_moves_deadline() {
        let repo = repo();
        let first = Utc::now() + Duration::seconds(10);
        let second = Utc::now() + Duration::seconds(90);
        repo.upsert("k", first).unwrap();
        repo.upsert("k", second).unwrap();
        assert_eq!(repo.active(Utc::now()).unwrap().get("k"), Some(&second));
    }

    #[test]
    fn expired_entries_not_loaded() {
        let repo = repo();
        repo.upsert("old", Utc::now() - Duration::seconds(5)).unwrap();
        repo.upsert("new", Utc::now() + Duration::seconds(5)).unwrap();

        let loaded = repo.load_cooldowns().unwrap();
        assert!(!loaded.contains_key("old"));
        assert!(loaded.contains_key("new"));
        // load purged the expired row
        assert_eq!(repo.purge_expired(Utc::now()).unwrap(), 0);
    }
}
