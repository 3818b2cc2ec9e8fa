//! Event records and the shared, append-only event log.
//!
//! Workers append detection transitions and camera status changes; readers
//! query by time window, camera and kind, optionally grouped for display.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

mod store;

pub use store::{hash_entry, EventStore, InMemoryEventStore, SqliteEventStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    DetectionStart,
    DetectionEnd,
    CameraOnline,
    CameraOffline,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::DetectionStart,
        EventKind::DetectionEnd,
        EventKind::CameraOnline,
        EventKind::CameraOffline,
        EventKind::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::DetectionStart => "detection-start",
            EventKind::DetectionEnd => "detection-end",
            EventKind::CameraOnline => "camera-online",
            EventKind::CameraOffline => "camera-offline",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| anyhow!("unknown event kind '{}'", s))
    }
}

/// Immutable log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp_ms: u64,
    pub camera_id: String,
    pub kind: EventKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl EventRecord {
    /// Record stamped with the current wall-clock time.
    pub fn new(kind: EventKind, camera_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp_ms: crate::now_ms(),
            camera_id: camera_id.into(),
            kind,
            message: message.into(),
            score: None,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn at(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }
}

/// Filter for event retrieval. Empty fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventQuery {
    /// Inclusive lower bound.
    pub since_ms: Option<u64>,
    /// Inclusive upper bound.
    pub until_ms: Option<u64>,
    pub camera_id: Option<String>,
    pub kinds: Vec<EventKind>,
    /// Keep only the newest `limit` matches (still returned oldest first).
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn since(mut self, since_ms: u64) -> Self {
        self.since_ms = Some(since_ms);
        self
    }

    pub fn until(mut self, until_ms: u64) -> Self {
        self.until_ms = Some(until_ms);
        self
    }

    pub fn camera(mut self, camera_id: impl Into<String>) -> Self {
        self.camera_id = Some(camera_id.into());
        self
    }

    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &EventRecord) -> bool {
        self.since_ms.map_or(true, |since| record.timestamp_ms >= since)
            && self.until_ms.map_or(true, |until| record.timestamp_ms <= until)
            && self
                .camera_id
                .as_deref()
                .map_or(true, |camera| record.camera_id == camera)
            && (self.kinds.is_empty() || self.kinds.contains(&record.kind))
    }

    /// Apply `limit` to matches collected oldest first.
    pub(crate) fn truncate(&self, mut records: Vec<EventRecord>) -> Vec<EventRecord> {
        if let Some(limit) = self.limit {
            if records.len() > limit {
                records.drain(..records.len() - limit);
            }
        }
        records
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventGrouping {
    Camera,
    Kind,
}

impl FromStr for EventGrouping {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "camera" => Ok(EventGrouping::Camera),
            "kind" | "type" => Ok(EventGrouping::Kind),
            other => Err(anyhow!("unknown grouping '{}'", other)),
        }
    }
}

/// Group records by camera id or event kind, preserving order within a group.
pub fn group_events(
    records: Vec<EventRecord>,
    grouping: EventGrouping,
) -> BTreeMap<String, Vec<EventRecord>> {
    let mut groups: BTreeMap<String, Vec<EventRecord>> = BTreeMap::new();
    for record in records {
        let key = match grouping {
            EventGrouping::Camera => record.camera_id.clone(),
            EventGrouping::Kind => record.kind.as_str().to_string(),
        };
        groups.entry(key).or_default().push(record);
    }
    groups
}

/// Append-only event log shared by all workers.
///
/// Appends are serialized by one lock around the writing store. A SQLite log
/// also keeps a read-only connection behind its own lock, so queries never
/// hold up a worker's append.
pub struct EventLog {
    store: Mutex<Box<dyn EventStore>>,
    reader: Option<Mutex<Box<dyn EventStore>>>,
}

impl EventLog {
    pub fn new(store: Box<dyn EventStore>) -> Self {
        Self {
            store: Mutex::new(store),
            reader: None,
        }
    }

    /// Log that answers queries from `reader` instead of the writing store.
    pub fn with_reader(store: Box<dyn EventStore>, reader: Box<dyn EventStore>) -> Self {
        Self {
            store: Mutex::new(store),
            reader: Some(Mutex::new(reader)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(InMemoryEventStore::new()))
    }

    pub fn sqlite(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let writer = SqliteEventStore::open(path)?;
        let reader = SqliteEventStore::open_read_only(path)?;
        Ok(Self::with_reader(Box::new(writer), Box::new(reader)))
    }

    // Stores are left consistent by every call, so a panicking holder
    // does not invalidate the log for other cameras.
    fn lock(&self) -> MutexGuard<'_, Box<dyn EventStore>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_reader(&self) -> MutexGuard<'_, Box<dyn EventStore>> {
        match &self.reader {
            Some(reader) => reader.lock().unwrap_or_else(PoisonError::into_inner),
            None => self.lock(),
        }
    }

    pub fn append(&self, record: EventRecord) -> Result<()> {
        self.lock().append(&record)?;
        match record.kind {
            EventKind::Error | EventKind::CameraOffline => log::warn!(
                "event: {} camera={} {}",
                record.kind,
                record.camera_id,
                record.message
            ),
            _ => log::info!(
                "event: {} camera={} {}",
                record.kind,
                record.camera_id,
                record.message
            ),
        }
        Ok(())
    }

    /// Append, logging instead of propagating a store failure.
    pub fn record(&self, record: EventRecord) {
        let kind = record.kind;
        let camera_id = record.camera_id.clone();
        if let Err(e) = self.append(record) {
            log::error!(
                "event: failed to append {} for camera {}: {:#}",
                kind,
                camera_id,
                e
            );
        }
    }

    pub fn query(&self, query: &EventQuery) -> Result<Vec<EventRecord>> {
        self.lock_reader().query(query)
    }

    pub fn grouped(
        &self,
        query: &EventQuery,
        grouping: EventGrouping,
    ) -> Result<BTreeMap<String, Vec<EventRecord>>> {
        Ok(group_events(self.query(query)?, grouping))
    }

    pub fn len(&self) -> Result<usize> {
        self.lock_reader().len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn verify_chain(&self) -> Result<()> {
        self.lock_reader().verify_chain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    fn sample() -> Vec<EventRecord> {
        vec![
            EventRecord::new(EventKind::CameraOnline, "cam-1", "online").at(10),
            EventRecord::new(EventKind::DetectionStart, "cam-1", "smoke")
                .with_score(5.0)
                .at(20),
            EventRecord::new(EventKind::CameraOffline, "cam-2", "timeout").at(30),
            EventRecord::new(EventKind::DetectionEnd, "cam-1", "clear").at(40),
        ]
    }

    #[test]
    fn kind_names_match_wire_format() -> Result<()> {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>()?, kind);
            let json = serde_json::to_string(&kind)?;
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        Ok(())
    }

    #[test]
    fn query_filters_by_window_camera_and_kind() -> Result<()> {
        let log = EventLog::in_memory();
        for record in sample() {
            log.append(record)?;
        }
        assert_eq!(log.len()?, 4);
        let window = log.query(&EventQuery::all().since(20).until(30))?;
        assert_eq!(window.len(), 2);
        let cam1 = log.query(&EventQuery::all().camera("cam-1"))?;
        assert_eq!(cam1.len(), 3);
        let starts = log.query(&EventQuery::all().kind(EventKind::DetectionStart))?;
        assert_eq!(starts[0].score, Some(5.0));
        let newest = log.query(&EventQuery::all().limit(2))?;
        let stamps: Vec<u64> = newest.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(stamps, vec![30, 40]);
        Ok(())
    }

    #[test]
    fn poisoned_lock_does_not_block_later_appends() -> Result<()> {
        let log = Arc::new(EventLog::in_memory());
        log.append(EventRecord::new(EventKind::CameraOnline, "cam-1", "online"))?;
        let holder = Arc::clone(&log);
        let crashed = thread::spawn(move || {
            let _guard = holder.store.lock();
            panic!("camera thread died holding the event log");
        })
        .join();
        assert!(crashed.is_err());
        assert!(log.store.is_poisoned());

        log.append(EventRecord::new(EventKind::CameraOnline, "cam-2", "online"))?;
        assert_eq!(log.len()?, 2);
        log.verify_chain()?;
        Ok(())
    }

    #[test]
    fn sqlite_queries_do_not_wait_for_the_append_lock() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = Arc::new(EventLog::sqlite(dir.path().join("events.db"))?);
        for record in sample() {
            log.append(record)?;
        }

        let appending = log.store.lock().unwrap_or_else(PoisonError::into_inner);
        let (tx, rx) = mpsc::channel();
        let reader = Arc::clone(&log);
        let query = thread::spawn(move || {
            let newest = reader.query(&EventQuery::all().limit(1)).map(|r| r.len());
            let _ = tx.send(newest);
        });
        let answered = rx.recv_timeout(Duration::from_secs(5));
        drop(appending);
        query.join().expect("query thread");
        assert_eq!(answered.expect("query blocked behind append lock")?, 1);
        Ok(())
    }

    #[test]
    fn grouping_by_camera_and_kind() -> Result<()> {
        let log = EventLog::in_memory();
        for record in sample() {
            log.append(record)?;
        }
        let by_camera = log.grouped(&EventQuery::all(), EventGrouping::Camera)?;
        assert_eq!(by_camera["cam-1"].len(), 3);
        assert_eq!(by_camera["cam-2"].len(), 1);
        let by_kind = log.grouped(&EventQuery::all(), EventGrouping::Kind)?;
        assert_eq!(by_kind.len(), 4);
        assert_eq!(by_kind["camera-offline"][0].camera_id, "cam-2");
        assert_eq!("type".parse::<EventGrouping>()?, EventGrouping::Kind);
        Ok(())
    }
}
