use anyhow::{anyhow, Result};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;

use super::{EventQuery, EventRecord};

/// SHA-256(prev_hash || payload). Links every stored event to its predecessor.
pub fn hash_entry(prev_hash: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(payload);
    hasher.finalize().into()
}

pub trait EventStore: Send {
    fn append(&mut self, record: &EventRecord) -> Result<()>;

    /// Matching records, oldest first.
    fn query(&mut self, query: &EventQuery) -> Result<Vec<EventRecord>>;

    fn len(&mut self) -> Result<usize>;

    /// Recompute the hash chain and fail on the first broken link.
    fn verify_chain(&mut self) -> Result<()>;
}

// -------------------- in-memory --------------------

struct StoredEvent {
    record: EventRecord,
    payload_json: String,
    prev_hash: [u8; 32],
    entry_hash: [u8; 32],
}

#[derive(Default)]
pub struct InMemoryEventStore {
    events: Vec<StoredEvent>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&mut self, record: &EventRecord) -> Result<()> {
        let prev_hash = self
            .events
            .last()
            .map(|e| e.entry_hash)
            .unwrap_or([0u8; 32]);
        let payload_json = serde_json::to_string(record)?;
        let entry_hash = hash_entry(&prev_hash, payload_json.as_bytes());
        self.events.push(StoredEvent {
            record: record.clone(),
            payload_json,
            prev_hash,
            entry_hash,
        });
        Ok(())
    }

    fn query(&mut self, query: &EventQuery) -> Result<Vec<EventRecord>> {
        let matches = self
            .events
            .iter()
            .filter(|e| query.matches(&e.record))
            .map(|e| e.record.clone())
            .collect();
        Ok(query.truncate(matches))
    }

    fn len(&mut self) -> Result<usize> {
        Ok(self.events.len())
    }

    fn verify_chain(&mut self) -> Result<()> {
        let mut expected_prev = [0u8; 32];
        for (index, event) in self.events.iter().enumerate() {
            verify_link(
                index as i64,
                &expected_prev,
                &event.prev_hash,
                &event.entry_hash,
                &event.payload_json,
            )?;
            expected_prev = event.entry_hash;
        }
        Ok(())
    }
}

// -------------------- sqlite --------------------

pub struct SqliteEventStore {
    conn: Connection,
    read_only: bool,
}

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl SqliteEventStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        let conn = Connection::open(db_path)
            .map_err(|e| anyhow!("failed to open event store {}: {}", db_path.display(), e))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mut store = Self {
            conn,
            read_only: false,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Read-only connection to an existing store. Under WAL it reads
    /// alongside a writer connection without waiting for it.
    pub fn open_read_only(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| anyhow!("failed to open event store {} for reading: {}", db_path.display(), e))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn,
            read_only: true,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut store = Self {
            conn: Connection::open_in_memory()?,
            read_only: false,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp_ms INTEGER NOT NULL,
              camera_id TEXT NOT NULL,
              kind TEXT NOT NULL,
              payload_json TEXT NOT NULL,
              prev_hash BLOB NOT NULL,
              entry_hash BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_time ON events(timestamp_ms);
            CREATE INDEX IF NOT EXISTS idx_events_camera ON events(camera_id, timestamp_ms);
            "#,
        )?;
        Ok(())
    }

    fn last_entry_hash(&self) -> Result<[u8; 32]> {
        let mut stmt = self
            .conn
            .prepare("SELECT entry_hash FROM events ORDER BY id DESC LIMIT 1")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => to_hash(row.get(0)?, "entry_hash"),
            None => Ok([0u8; 32]),
        }
    }
}

impl EventStore for SqliteEventStore {
    fn append(&mut self, record: &EventRecord) -> Result<()> {
        if self.read_only {
            return Err(anyhow!("event store opened read-only"));
        }
        let timestamp_ms = i64::try_from(record.timestamp_ms)
            .map_err(|_| anyhow!("event timestamp exceeds i64 range"))?;
        let prev_hash = self.last_entry_hash()?;
        let payload_json = serde_json::to_string(record)?;
        let entry_hash = hash_entry(&prev_hash, payload_json.as_bytes());

        self.conn.execute(
            r#"
            INSERT INTO events(timestamp_ms, camera_id, kind, payload_json, prev_hash, entry_hash)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                timestamp_ms,
                record.camera_id,
                record.kind.as_str(),
                payload_json,
                prev_hash.to_vec(),
                entry_hash.to_vec()
            ],
        )?;
        Ok(())
    }

    fn query(&mut self, query: &EventQuery) -> Result<Vec<EventRecord>> {
        let (sql, values) = select_payloads(query);
        let mut stmt = self.conn.prepare(&sql)?;
        let payloads = stmt
            .query_map(params_from_iter(values), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        // Selected newest first so LIMIT keeps the newest matches.
        payloads
            .into_iter()
            .rev()
            .map(|payload| {
                serde_json::from_str(&payload).map_err(|e| anyhow!("corrupt event payload: {}", e))
            })
            .collect()
    }

    fn len(&mut self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn verify_chain(&mut self) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, payload_json, prev_hash, entry_hash FROM events ORDER BY id ASC")?;
        let mut rows = stmt.query([])?;
        let mut expected_prev = [0u8; 32];
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let payload_json: String = row.get(1)?;
            let prev_hash = to_hash(row.get(2)?, "prev_hash")?;
            let entry_hash = to_hash(row.get(3)?, "entry_hash")?;
            verify_link(id, &expected_prev, &prev_hash, &entry_hash, &payload_json)?;
            expected_prev = entry_hash;
        }
        Ok(())
    }
}

/// SELECT with every filter of `query`, newest first, bounded by its limit.
fn select_payloads(query: &EventQuery) -> (String, Vec<Value>) {
    fn clamp(v: u64) -> i64 {
        i64::try_from(v).unwrap_or(i64::MAX)
    }

    let mut sql = String::from("SELECT payload_json FROM events WHERE 1 = 1");
    let mut values = Vec::new();
    if let Some(since) = query.since_ms {
        values.push(Value::Integer(clamp(since)));
        sql.push_str(&format!(" AND timestamp_ms >= ?{}", values.len()));
    }
    if let Some(until) = query.until_ms {
        values.push(Value::Integer(clamp(until)));
        sql.push_str(&format!(" AND timestamp_ms <= ?{}", values.len()));
    }
    if let Some(camera_id) = &query.camera_id {
        values.push(Value::Text(camera_id.clone()));
        sql.push_str(&format!(" AND camera_id = ?{}", values.len()));
    }
    if !query.kinds.is_empty() {
        let mut placeholders = Vec::with_capacity(query.kinds.len());
        for kind in &query.kinds {
            values.push(Value::Text(kind.as_str().to_string()));
            placeholders.push(format!("?{}", values.len()));
        }
        sql.push_str(&format!(" AND kind IN ({})", placeholders.join(", ")));
    }
    sql.push_str(" ORDER BY id DESC");
    if let Some(limit) = query.limit {
        values.push(Value::Integer(clamp(limit as u64)));
        sql.push_str(&format!(" LIMIT ?{}", values.len()));
    }
    (sql, values)
}

fn to_hash(bytes: Vec<u8>, column: &str) -> Result<[u8; 32]> {
    if bytes.len() != 32 {
        return Err(anyhow!("corrupt event log: {} size {}", column, bytes.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn verify_link(
    id: i64,
    expected_prev: &[u8; 32],
    prev_hash: &[u8; 32],
    entry_hash: &[u8; 32],
    payload_json: &str,
) -> Result<()> {
    if prev_hash != expected_prev {
        return Err(anyhow!(
            "event chain broken at {}: prev_hash {} != {}",
            id,
            hex::encode(prev_hash),
            hex::encode(expected_prev)
        ));
    }
    let recomputed = hash_entry(prev_hash, payload_json.as_bytes());
    if &recomputed != entry_hash {
        return Err(anyhow!(
            "event {} payload does not match entry_hash {}",
            id,
            hex::encode(entry_hash)
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn record(ts: u64, camera: &str, kind: EventKind) -> EventRecord {
        EventRecord::new(kind, camera, "test").at(ts)
    }

    #[test]
    fn in_memory_chain_verifies() -> Result<()> {
        let mut store = InMemoryEventStore::new();
        for ts in 0..5 {
            store.append(&record(ts, "cam-1", EventKind::CameraOnline))?;
        }
        store.verify_chain()?;
        store.events[2].payload_json = "{}".to_string();
        assert!(store.verify_chain().is_err());
        Ok(())
    }

    #[test]
    fn sqlite_chain_detects_tampering() -> Result<()> {
        let mut store = SqliteEventStore::open_in_memory()?;
        store.append(&record(1, "cam-1", EventKind::CameraOnline))?;
        store.append(&record(2, "cam-1", EventKind::DetectionStart))?;
        store.append(&record(3, "cam-1", EventKind::DetectionEnd))?;
        store.verify_chain()?;
        store.conn.execute(
            "UPDATE events SET payload_json = replace(payload_json, 'test', 'edited') WHERE id = 2",
            [],
        )?;
        assert!(store.verify_chain().is_err());
        Ok(())
    }

    #[test]
    fn sqlite_query_matches_in_memory() -> Result<()> {
        let mut sqlite = SqliteEventStore::open_in_memory()?;
        let mut memory = InMemoryEventStore::new();
        let records = [
            record(5, "cam-1", EventKind::CameraOnline),
            record(6, "cam-2", EventKind::CameraOffline),
            record(7, "cam-1", EventKind::DetectionStart),
            record(9, "cam-1", EventKind::DetectionEnd),
        ];
        for r in &records {
            sqlite.append(r)?;
            memory.append(r)?;
        }
        let queries = [
            EventQuery::all(),
            EventQuery::all().camera("cam-1").since(6),
            EventQuery::all().until(6),
            EventQuery::all().kind(EventKind::DetectionEnd),
            EventQuery::all().camera("cam-1").limit(1),
        ];
        for q in &queries {
            assert_eq!(sqlite.query(q)?, memory.query(q)?, "{:?}", q);
        }
        assert_eq!(sqlite.len()?, 4);
        Ok(())
    }

    #[test]
    fn kind_and_limit_filters_run_in_sql() -> Result<()> {
        let query = EventQuery::all()
            .camera("cam-1")
            .kind(EventKind::DetectionStart)
            .kind(EventKind::DetectionEnd)
            .limit(10);
        let (sql, values) = select_payloads(&query);
        assert!(sql.contains("kind IN (?2, ?3)"), "{}", sql);
        assert!(sql.ends_with("ORDER BY id DESC LIMIT ?4"), "{}", sql);
        assert_eq!(values.len(), 4);

        let mut store = SqliteEventStore::open_in_memory()?;
        for ts in 0..200 {
            let kind = if ts % 10 == 0 {
                EventKind::DetectionStart
            } else {
                EventKind::CameraOnline
            };
            store.append(&record(ts, "cam-1", kind))?;
        }
        let newest = store.query(&EventQuery::all().kind(EventKind::DetectionStart).limit(3))?;
        let stamps: Vec<u64> = newest.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(stamps, vec![170, 180, 190]);
        Ok(())
    }

    #[test]
    fn read_only_connection_sees_appends_and_refuses_writes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.db");
        let mut writer = SqliteEventStore::open(&path)?;
        let mut reader = SqliteEventStore::open_read_only(&path)?;
        writer.append(&record(1, "cam-1", EventKind::CameraOnline))?;
        writer.append(&record(2, "cam-1", EventKind::CameraOffline))?;
        assert_eq!(reader.len()?, 2);
        assert_eq!(reader.query(&EventQuery::all().limit(1))?[0].timestamp_ms, 2);
        reader.verify_chain()?;
        assert!(reader.append(&record(3, "cam-1", EventKind::Error)).is_err());
        Ok(())
    }
}
