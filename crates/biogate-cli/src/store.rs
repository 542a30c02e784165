//! SQLite-backed template store and attempt cache.
//!
//! Templates are stored as JSON bodies keyed by identity. Attempt counters
//! carry an absolute expiry in unix milliseconds; increments are a single
//! `UPSERT … RETURNING` statement so concurrent processes never lose one.

use biogate_core::attempts::AttemptCache;
use biogate_core::{EnrolledTemplate, Identity, StoreError, TemplateStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn unavailable(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(unavailable)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(unavailable)?;
        conn.pragma_update(None, "synchronous", "NORMAL").map_err(unavailable)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(unavailable)?;

        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        tracing::info!(path = %path.display(), "template store opened");
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute_batch(
                "BEGIN;
                CREATE TABLE IF NOT EXISTS templates (
                    identity TEXT PRIMARY KEY,
                    version INTEGER NOT NULL,
                    body TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS attempts (
                    identity TEXT PRIMARY KEY,
                    count INTEGER NOT NULL,
                    expires_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS successes (
                    identity TEXT PRIMARY KEY,
                    at TEXT NOT NULL
                );
                COMMIT;",
            )
            .map_err(unavailable)
    }

    /// Enrolled identities, sorted.
    pub fn identities(&self) -> Result<Vec<Identity>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT identity FROM templates ORDER BY identity")
            .map_err(unavailable)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(unavailable)?;
        let identities = rows.map(|r| r.map(Identity::from).map_err(unavailable)).collect();
        identities
    }
}

impl TemplateStore for SqliteStore {
    fn fetch(&self, identity: &Identity) -> Result<Option<EnrolledTemplate>, StoreError> {
        let body: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT body FROM templates WHERE identity = ?1",
                params![identity.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(unavailable)?;

        body.map(|b| serde_json::from_str(&b).map_err(|e| StoreError::Corrupt(format!("{identity}: {e}"))))
            .transpose()
    }

    fn propose(&self, template: &EnrolledTemplate) -> Result<(), StoreError> {
        let body = serde_json::to_string(template).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(unavailable)?;

        let stored: Option<u32> = tx
            .query_row(
                "SELECT version FROM templates WHERE identity = ?1",
                params![template.identity.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(unavailable)?;
        if let Some(stored) = stored.filter(|&v| template.version <= v) {
            return Err(StoreError::Conflict {
                identity: template.identity.clone(),
                stored,
                proposed: template.version,
            });
        }

        tx.execute(
            "INSERT INTO templates (identity, version, body, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(identity) DO UPDATE SET
                version = excluded.version,
                body = excluded.body,
                updated_at = excluded.updated_at",
            params![
                template.identity.as_str(),
                template.version,
                body,
                template.updated_at.to_rfc3339()
            ],
        )
        .map_err(unavailable)?;
        tx.commit().map_err(unavailable)?;

        tracing::info!(identity = %template.identity, version = template.version, "template stored");
        Ok(())
    }

    fn remove(&self, identity: &Identity) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(unavailable)?;
        let removed = tx
            .execute("DELETE FROM templates WHERE identity = ?1", params![identity.as_str()])
            .map_err(unavailable)?;
        for table in ["attempts", "successes"] {
            tx.execute(&format!("DELETE FROM {table} WHERE identity = ?1"), params![identity.as_str()])
                .map_err(unavailable)?;
        }
        tx.commit().map_err(unavailable)?;
        Ok(removed > 0)
    }
}

impl AttemptCache for SqliteStore {
    fn count(&self, identity: &Identity) -> Result<u32, StoreError> {
        let count: Option<u32> = self
            .conn
            .lock()
            .query_row(
                "SELECT count FROM attempts WHERE identity = ?1 AND expires_at > ?2",
                params![identity.as_str(), now_millis()],
                |row| row.get(0),
            )
            .optional()
            .map_err(unavailable)?;
        Ok(count.unwrap_or(0))
    }

    fn increment(&self, identity: &Identity, ttl: Duration) -> Result<u32, StoreError> {
        let now = now_millis();
        let expires_at = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
        self.conn
            .lock()
            .query_row(
                "INSERT INTO attempts (identity, count, expires_at) VALUES (?1, 1, ?2)
                 ON CONFLICT(identity) DO UPDATE SET
                    count = CASE WHEN attempts.expires_at <= ?3 THEN 1 ELSE attempts.count + 1 END,
                    expires_at = excluded.expires_at
                 RETURNING count",
                params![identity.as_str(), expires_at, now],
                |row| row.get(0),
            )
            .map_err(unavailable)
    }

    fn reset(&self, identity: &Identity) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute("DELETE FROM attempts WHERE identity = ?1", params![identity.as_str()])
            .map_err(unavailable)?;
        Ok(())
    }

    fn record_success(&self, identity: &Identity, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO successes (identity, at) VALUES (?1, ?2)
                 ON CONFLICT(identity) DO UPDATE SET at = excluded.at",
                params![identity.as_str(), at.to_rfc3339()],
            )
            .map_err(unavailable)?;
        Ok(())
    }

    fn last_success(&self, identity: &Identity) -> Result<Option<DateTime<Utc>>, StoreError> {
        let at: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT at FROM successes WHERE identity = ?1",
                params![identity.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(unavailable)?;

        at.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| StoreError::Corrupt(format!("last success for {identity}: {e}")))
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use biogate_core::{FaceEncoding, VoiceFeatureSequence};
    use std::sync::Arc;
    use uuid::Uuid;

    fn open() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("nested/biogate.db")).unwrap();
        (dir, store)
    }

    fn template(identity: &str, version: u32) -> EnrolledTemplate {
        EnrolledTemplate {
            id: Uuid::new_v4(),
            identity: identity.into(),
            face: FaceEncoding {
                values: vec![0.25, -0.5, 1.0],
                model_version: Some("w600k_r50".into()),
            },
            voice: Some(VoiceFeatureSequence::new(vec![vec![0.1, 0.2], vec![0.3, 0.4]]).unwrap()),
            version,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_template_roundtrip_and_versioning() {
        let (_dir, store) = open();
        let id: Identity = "alice".into();
        assert!(store.fetch(&id).unwrap().is_none());

        let t1 = template("alice", 1);
        store.propose(&t1).unwrap();
        assert_eq!(store.fetch(&id).unwrap(), Some(t1));

        assert!(matches!(
            store.propose(&template("alice", 1)),
            Err(StoreError::Conflict { stored: 1, proposed: 1, .. })
        ));
        store.propose(&template("alice", 2)).unwrap();
        assert_eq!(store.fetch(&id).unwrap().unwrap().version, 2);
        assert_eq!(store.identities().unwrap(), vec![id.clone()]);

        assert!(store.remove(&id).unwrap());
        assert!(store.fetch(&id).unwrap().is_none());
    }

    #[test]
    fn test_remove_clears_counters_and_history() {
        let (_dir, store) = open();
        let id: Identity = "gina".into();
        store.propose(&template("gina", 1)).unwrap();
        store.increment(&id, Duration::from_secs(60)).unwrap();
        store.record_success(&id, Utc::now()).unwrap();

        assert!(store.remove(&id).unwrap());
        assert_eq!(store.count(&id).unwrap(), 0);
        assert!(store.last_success(&id).unwrap().is_none());
        assert!(!store.remove(&id).unwrap());
    }

    #[test]
    fn test_failed_remove_leaves_rows_intact() {
        let (_dir, store) = open();
        let id: Identity = "hank".into();
        store.propose(&template("hank", 1)).unwrap();
        store.increment(&id, Duration::from_secs(60)).unwrap();
        store.conn.lock().execute_batch("DROP TABLE successes").unwrap();

        assert!(matches!(store.remove(&id), Err(StoreError::Unavailable(_))));
        assert!(store.fetch(&id).unwrap().is_some());
        assert_eq!(store.count(&id).unwrap(), 1);
    }

    #[test]
    fn test_corrupt_body_reported() {
        let (_dir, store) = open();
        store
            .conn
            .lock()
            .execute(
                "INSERT INTO templates (identity, version, body, updated_at) VALUES ('bob', 1, '{', '')",
                [],
            )
            .unwrap();
        assert!(matches!(store.fetch(&"bob".into()), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_attempt_counter_lifecycle() {
        let (_dir, store) = open();
        let id: Identity = "carol".into();
        assert_eq!(store.count(&id).unwrap(), 0);
        assert_eq!(store.increment(&id, Duration::from_secs(60)).unwrap(), 1);
        assert_eq!(store.increment(&id, Duration::from_secs(60)).unwrap(), 2);
        assert_eq!(store.count(&id).unwrap(), 2);
        store.reset(&id).unwrap();
        assert_eq!(store.count(&id).unwrap(), 0);
    }

    #[test]
    fn test_expired_counter_restarts() {
        let (_dir, store) = open();
        let id: Identity = "dave".into();
        store.increment(&id, Duration::from_millis(0)).unwrap();
        store.increment(&id, Duration::from_millis(0)).unwrap();
        assert_eq!(store.count(&id).unwrap(), 0);
        assert_eq!(store.increment(&id, Duration::from_secs(60)).unwrap(), 1);
    }

    #[test]
    fn test_last_success() {
        let (_dir, store) = open();
        let id: Identity = "erin".into();
        assert!(store.last_success(&id).unwrap().is_none());
        let at = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z").unwrap().with_timezone(&Utc);
        store.record_success(&id, at).unwrap();
        assert_eq!(store.last_success(&id).unwrap(), Some(at));
    }

    #[test]
    fn test_concurrent_increments() {
        let (_dir, store) = open();
        let store = Arc::new(store);
        let id: Identity = "frank".into();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let id = id.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        store.increment(&id, Duration::from_secs(60)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.count(&id).unwrap(), 100);
    }
}
