/// SQLite card store.
///
/// One row per (session_id, category). Cheap cards are replaced wholesale, one
/// generation per transaction. The recap row also carries a nullable lock
/// timestamp that is only ever claimed through a conditional write, so two
/// requesters racing past the in-memory lock check cannot both win.
use crate::cards::{Category, StoredCard};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Payload(serde_json::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "card store error: {e}"),
            StoreError::Payload(e) => write!(f, "card payload error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Sqlite(e) => Some(e),
            StoreError::Payload(e) => Some(e),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Payload(e)
    }
}

/// Persistence contract for cards.
///
/// `try_claim_recap_lock` must be an atomic compare-and-swap: it succeeds only
/// when no lock is set or the existing one is at least `timeout` old, and the
/// check and the write happen in one statement.
pub trait CardStore {
    fn get_cards(&self, session_id: &str) -> Result<HashMap<Category, StoredCard>, StoreError>;

    fn get_card(
        &self,
        session_id: &str,
        category: Category,
    ) -> Result<Option<StoredCard>, StoreError>;

    /// Replace every card of a generation atomically.
    fn upsert_cards(&self, cards: &[StoredCard]) -> Result<(), StoreError>;

    fn try_claim_recap_lock(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<bool, StoreError>;

    fn clear_recap_lock(&self, session_id: &str) -> Result<(), StoreError>;

    /// Write a recap card and release its lock in the same statement.
    fn upsert_recap(&self, card: &StoredCard) -> Result<(), StoreError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// Opens (or creates) the card database at the given path.
pub fn open_or_create(path: &Path) -> Result<SqliteStore, StoreError> {
    let conn = Connection::open(path)?;
    SqliteStore::init(conn)
}

impl SqliteStore {
    fn init(conn: Connection) -> Result<Self, StoreError> {
        // WAL lets readers proceed while a generation is being written
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cards (
                session_id            TEXT NOT NULL,
                category              TEXT NOT NULL,
                version               INTEGER NOT NULL,
                computed_at           TEXT NOT NULL,
                up_to_line            INTEGER NOT NULL,
                payload               TEXT NOT NULL,
                computing_started_at  TEXT,
                PRIMARY KEY (session_id, category)
            );",
        )?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

const SELECT_CARD: &str = "SELECT session_id, category, version, computed_at, up_to_line, payload, computing_started_at FROM cards";

const UPSERT_CARD: &str = "INSERT INTO cards (session_id, category, version, computed_at, up_to_line, payload, computing_started_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)
     ON CONFLICT(session_id, category) DO UPDATE SET
        version = excluded.version,
        computed_at = excluded.computed_at,
        up_to_line = excluded.up_to_line,
        payload = excluded.payload,
        computing_started_at = NULL";

impl CardStore for SqliteStore {
    fn get_cards(&self, session_id: &str) -> Result<HashMap<Category, StoredCard>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{SELECT_CARD} WHERE session_id = ?1"))?;
        let rows = stmt.query_map([session_id], map_card)?;
        let mut cards = HashMap::new();
        for row in rows {
            if let Some(card) = row? {
                cards.insert(card.category, card);
            }
        }
        Ok(cards)
    }

    fn get_card(
        &self,
        session_id: &str,
        category: Category,
    ) -> Result<Option<StoredCard>, StoreError> {
        let conn = self.conn();
        let card = conn
            .query_row(
                &format!("{SELECT_CARD} WHERE session_id = ?1 AND category = ?2"),
                rusqlite::params![session_id, category.as_str()],
                map_card,
            )
            .optional()?;
        Ok(card.flatten())
    }

    fn upsert_cards(&self, cards: &[StoredCard]) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(UPSERT_CARD)?;
            for card in cards {
                stmt.execute(rusqlite::params![
                    card.session_id,
                    card.category.as_str(),
                    card.version,
                    format_ts(card.computed_at),
                    card.up_to_line as i64,
                    serde_json::to_string(&card.payload)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn try_claim_recap_lock(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<bool, StoreError> {
        // A first-ever claim inserts a version-0 placeholder row that no reader
        // treats as a card; it only carries the lock.
        let claimed = self.conn().execute(
            "INSERT INTO cards (session_id, category, version, computed_at, up_to_line, payload, computing_started_at)
             VALUES (?1, ?2, 0, ?3, 0, 'null', ?3)
             ON CONFLICT(session_id, category) DO UPDATE SET
                computing_started_at = excluded.computing_started_at
             WHERE cards.computing_started_at IS NULL OR cards.computing_started_at <= ?4",
            rusqlite::params![
                session_id,
                Category::SmartRecap.as_str(),
                format_ts(now),
                format_ts(now - timeout),
            ],
        )?;
        Ok(claimed == 1)
    }

    fn clear_recap_lock(&self, session_id: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE cards SET computing_started_at = NULL WHERE session_id = ?1 AND category = ?2",
            rusqlite::params![session_id, Category::SmartRecap.as_str()],
        )?;
        Ok(())
    }

    fn upsert_recap(&self, card: &StoredCard) -> Result<(), StoreError> {
        self.upsert_cards(std::slice::from_ref(card))
    }
}

/// Fixed-width UTC timestamp; lexical order equals time order.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Rows with an unknown category map to `None` and are skipped.
fn map_card(row: &rusqlite::Row) -> rusqlite::Result<Option<StoredCard>> {
    let category: String = row.get(1)?;
    let Some(category) = Category::parse(&category) else {
        return Ok(None);
    };
    let computed_at: String = row.get(3)?;
    let payload: String = row.get(5)?;
    let lock: Option<String> = row.get(6)?;
    let payload = serde_json::from_str(&payload).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Some(StoredCard {
        session_id: row.get(0)?,
        category,
        version: row.get(2)?,
        computed_at: parse_ts(3, &computed_at)?,
        up_to_line: row.get::<_, i64>(4)?.max(0) as u64,
        payload,
        computing_started_at: lock.as_deref().map(|s| parse_ts(6, s)).transpose()?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = open_or_create(&dir.path().join("cards.db")).unwrap();
        (dir, store)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_735_689_600 + secs, 0).unwrap()
    }

    fn card(category: Category, up_to_line: u64, payload: serde_json::Value) -> StoredCard {
        StoredCard {
            session_id: "s1".into(),
            category,
            version: category.version(),
            computed_at: at(0),
            up_to_line,
            payload,
            computing_started_at: None,
        }
    }

    #[test]
    fn upsert_then_read_back() {
        let (_dir, store) = test_store();
        store
            .upsert_cards(&[
                card(Category::Tokens, 10, serde_json::json!({"input": 5})),
                card(Category::Tools, 10, serde_json::json!({"total_calls": 2})),
            ])
            .unwrap();

        let cards = store.get_cards("s1").unwrap();
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[&Category::Tokens].payload["input"], 5);
        assert_eq!(cards[&Category::Tools].up_to_line, 10);
        assert_eq!(cards[&Category::Tools].computed_at, at(0));
        assert!(store.get_cards("other").unwrap().is_empty());
    }

    #[test]
    fn upsert_replaces_prior_row() {
        let (_dir, store) = test_store();
        store
            .upsert_cards(&[card(Category::Tokens, 10, serde_json::json!(1))])
            .unwrap();
        store
            .upsert_cards(&[card(Category::Tokens, 20, serde_json::json!(2))])
            .unwrap();
        let c = store.get_card("s1", Category::Tokens).unwrap().unwrap();
        assert_eq!(c.up_to_line, 20);
        assert_eq!(c.payload, serde_json::json!(2));
    }

    #[test]
    fn missing_card_is_none() {
        let (_dir, store) = test_store();
        assert!(store.get_card("s1", Category::SmartRecap).unwrap().is_none());
    }

    #[test]
    fn lock_claim_is_exclusive_until_timeout() {
        let (_dir, store) = test_store();
        let timeout = Duration::seconds(60);
        assert!(store.try_claim_recap_lock("s1", at(0), timeout).unwrap());
        assert!(!store.try_claim_recap_lock("s1", at(30), timeout).unwrap());
        assert!(!store.try_claim_recap_lock("s1", at(59), timeout).unwrap());
        // Boundary is inclusive.
        assert!(store.try_claim_recap_lock("s1", at(60), timeout).unwrap());

        let row = store.get_card("s1", Category::SmartRecap).unwrap().unwrap();
        assert_eq!(row.computing_started_at, Some(at(60)));
        assert_eq!(row.version, 0);
    }

    #[test]
    fn cleared_lock_can_be_reclaimed() {
        let (_dir, store) = test_store();
        let timeout = Duration::seconds(60);
        assert!(store.try_claim_recap_lock("s1", at(0), timeout).unwrap());
        store.clear_recap_lock("s1").unwrap();
        assert!(store.try_claim_recap_lock("s1", at(1), timeout).unwrap());
    }

    #[test]
    fn recap_upsert_releases_lock_and_keeps_card_on_reclaim() {
        let (_dir, store) = test_store();
        let timeout = Duration::seconds(60);
        assert!(store.try_claim_recap_lock("s1", at(0), timeout).unwrap());
        store
            .upsert_recap(&card(Category::SmartRecap, 7, serde_json::json!({"recap": "ok"})))
            .unwrap();
        let row = store.get_card("s1", Category::SmartRecap).unwrap().unwrap();
        assert_eq!(row.computing_started_at, None);
        assert_eq!(row.up_to_line, 7);

        // Claiming again only touches the lock column.
        assert!(store.try_claim_recap_lock("s1", at(5), timeout).unwrap());
        let row = store.get_card("s1", Category::SmartRecap).unwrap().unwrap();
        assert_eq!(row.payload["recap"], "ok");
        assert_eq!(row.computing_started_at, Some(at(5)));
    }

    #[test]
    fn locks_are_per_session() {
        let (_dir, store) = test_store();
        let timeout = Duration::seconds(60);
        assert!(store.try_claim_recap_lock("s1", at(0), timeout).unwrap());
        assert!(store.try_claim_recap_lock("s2", at(0), timeout).unwrap());
    }

    #[test]
    fn reopen_keeps_cards() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cards.db");
        {
            let store = open_or_create(&path).unwrap();
            store
                .upsert_cards(&[card(Category::Session, 3, serde_json::json!({}))])
                .unwrap();
        }
        let store = open_or_create(&path).unwrap();
        assert!(store.get_card("s1", Category::Session).unwrap().is_some());
    }

    #[test]
    fn timestamps_are_fixed_width() {
        assert_eq!(format_ts(at(0)), "2025-01-01T00:00:00.000Z");
        assert_eq!(parse_ts(0, "2025-01-01T00:00:00.000Z").unwrap(), at(0));
    }
}
