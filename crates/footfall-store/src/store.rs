//! Synchronous SQLite store: schema, row codecs, queries.
//!
//! Embeddings are stored as little-endian `f32` blobs next to their
//! dimension; timestamps as RFC 3339 UTC strings, which SQLite's date
//! functions parse directly.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode};
use thiserror::Error;

use footfall_core::{Embedding, EventKind, VisitEvent, VisitorId};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS visitors (
    visitor_id    TEXT PRIMARY KEY,
    first_seen    TEXT NOT NULL,
    last_seen     TEXT NOT NULL,
    embedding     BLOB NOT NULL,
    embedding_dim INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    event_id           INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp          TEXT NOT NULL,
    visitor_id         TEXT NOT NULL
                         REFERENCES visitors(visitor_id) ON DELETE CASCADE,
    event_type         TEXT NOT NULL CHECK (event_type IN ('entry', 'exit')),
    cropped_image_path TEXT,
    confidence         REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_type      ON events(event_type);
CREATE INDEX IF NOT EXISTS idx_events_visitor   ON events(visitor_id);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
CREATE INDEX IF NOT EXISTS idx_visitors_first_seen ON visitors(first_seen);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store call timed out")]
    Timeout,
    #[error("store thread exited")]
    ChannelClosed,
    #[error("corrupt row for visitor {visitor}: {reason}")]
    CorruptRow { visitor: String, reason: String },
}

impl StoreError {
    /// Retryable failures leave in-memory state authoritative; the caller
    /// keeps the write queued and tries again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Timeout => true,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// One persisted visitor, as loaded for the gallery.
#[derive(Debug, Clone)]
pub struct VisitorRow {
    pub visitor: VisitorId,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub embedding: Embedding,
}

/// Aggregated entry/exit counts for one day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyCount {
    pub day: String,
    pub entries: i64,
    pub exits: i64,
}

/// Per-visitor totals for the analytics views.
#[derive(Debug, Clone)]
pub struct VisitorSummary {
    pub visitor: VisitorId,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub entries: i64,
    pub exits: i64,
}

/// One persisted event row.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub event_id: i64,
    pub event: VisitEvent,
}

fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(visitor: &str, s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            visitor: visitor.to_string(),
            reason: format!("bad timestamp {s:?}: {e}"),
        })
}

fn encode_embedding(embedding: &Embedding) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.dim() * 4);
    for v in &embedding.values {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

fn decode_embedding(visitor: &str, blob: &[u8], dim: usize) -> Result<Embedding, StoreError> {
    if blob.len() != dim * 4 {
        return Err(StoreError::CorruptRow {
            visitor: visitor.to_string(),
            reason: format!("embedding blob is {} bytes, expected {}", blob.len(), dim * 4),
        });
    }
    let values = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(Embedding::new(values))
}

fn decode_visitor_id(s: &str) -> Result<VisitorId, StoreError> {
    VisitorId::parse(s).map_err(|e| StoreError::CorruptRow {
        visitor: s.to_string(),
        reason: format!("bad visitor id: {e}"),
    })
}

/// Owns the SQLite connection. Lives on the store thread; see
/// [`crate::handle`].
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        // journal_mode returns a row; in-memory databases report "memory".
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Bulk-load every visitor row, ordered by first sighting.
    pub fn load_visitors(&self) -> Result<Vec<VisitorRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT visitor_id, first_seen, last_seen, embedding, embedding_dim
             FROM visitors ORDER BY first_seen",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let first_seen: String = row.get(1)?;
            let last_seen: String = row.get(2)?;
            let blob: Vec<u8> = row.get(3)?;
            let dim: usize = row.get(4)?;
            out.push(VisitorRow {
                visitor: decode_visitor_id(&id)?,
                first_seen: decode_ts(&id, &first_seen)?,
                last_seen: decode_ts(&id, &last_seen)?,
                embedding: decode_embedding(&id, &blob, dim)?,
            });
        }
        Ok(out)
    }

    pub fn insert_visitor(
        &self,
        visitor: VisitorId,
        embedding: &Embedding,
        first_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let ts = encode_ts(&first_seen);
        self.conn.execute(
            "INSERT OR IGNORE INTO visitors
               (visitor_id, first_seen, last_seen, embedding, embedding_dim)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                visitor.to_string(),
                ts,
                ts,
                encode_embedding(embedding),
                embedding.dim(),
            ],
        )?;
        Ok(())
    }

    /// Advance a visitor's last-seen timestamp. Idempotent: an older
    /// timestamp never rewinds the column.
    pub fn touch_visitor(
        &self,
        visitor: VisitorId,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE visitors SET last_seen = ?2
             WHERE visitor_id = ?1 AND last_seen < ?2",
            params![visitor.to_string(), encode_ts(&last_seen)],
        )?;
        Ok(())
    }

    pub fn append_event(&self, event: &VisitEvent) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO events
               (timestamp, visitor_id, event_type, cropped_image_path, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                encode_ts(&event.timestamp),
                event.visitor.to_string(),
                event.kind.as_str(),
                event.crop_path,
                event.confidence as f64,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn visitor_count(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM visitors", [], |r| r.get(0))?)
    }

    /// Per-day entry/exit counts for the most recent `days` days of data.
    pub fn daily_counts(&self, days: u32) -> Result<Vec<DailyCount>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT date(timestamp) AS day,
                    SUM(event_type = 'entry') AS entries,
                    SUM(event_type = 'exit') AS exits
             FROM events
             GROUP BY day ORDER BY day DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([days], |row| {
            Ok(DailyCount {
                day: row.get(0)?,
                entries: row.get(1)?,
                exits: row.get(2)?,
            })
        })?;
        let mut out = rows.collect::<Result<Vec<_>, _>>()?;
        out.reverse();
        Ok(out)
    }

    pub fn visitor_summaries(&self) -> Result<Vec<VisitorSummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT v.visitor_id, v.first_seen, v.last_seen,
                    COALESCE(SUM(e.event_type = 'entry'), 0),
                    COALESCE(SUM(e.event_type = 'exit'), 0)
             FROM visitors v LEFT JOIN events e ON e.visitor_id = v.visitor_id
             GROUP BY v.visitor_id ORDER BY v.first_seen",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let first_seen: String = row.get(1)?;
            let last_seen: String = row.get(2)?;
            out.push(VisitorSummary {
                visitor: decode_visitor_id(&id)?,
                first_seen: decode_ts(&id, &first_seen)?,
                last_seen: decode_ts(&id, &last_seen)?,
                entries: row.get(3)?,
                exits: row.get(4)?,
            });
        }
        Ok(out)
    }

    pub fn recent_events(&self, limit: u32) -> Result<Vec<EventRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, timestamp, visitor_id, event_type,
                    cropped_image_path, confidence
             FROM events ORDER BY event_id DESC LIMIT ?1",
        )?;
        let mut rows = stmt.query([limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(2)?;
            let ts: String = row.get(1)?;
            let kind: String = row.get(3)?;
            let kind = EventKind::parse(&kind).ok_or_else(|| StoreError::CorruptRow {
                visitor: id.clone(),
                reason: format!("bad event type {kind:?}"),
            })?;
            out.push(EventRow {
                event_id: row.get(0)?,
                event: VisitEvent {
                    visitor: decode_visitor_id(&id)?,
                    kind,
                    timestamp: decode_ts(&id, &ts)?,
                    confidence: row.get::<_, f64>(5)? as f32,
                    crop_path: row.get(4)?,
                },
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use footfall_core::EventKind;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).unwrap()
    }

    fn event(visitor: VisitorId, kind: EventKind, at: DateTime<Utc>) -> VisitEvent {
        VisitEvent {
            visitor,
            kind,
            timestamp: at,
            confidence: 0.9,
            crop_path: Some("crops/2026-03-01/x.jpg".into()),
        }
    }

    #[test]
    fn test_visitor_rows_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let id = VisitorId::new();
        let emb = Embedding::new(vec![0.25, -1.5, 3.0]);
        store.insert_visitor(id, &emb, ts(9)).unwrap();

        let rows = store.load_visitors().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].visitor, id);
        assert_eq!(rows[0].embedding, emb);
        assert_eq!(rows[0].first_seen, ts(9));
        assert_eq!(rows[0].last_seen, ts(9));
    }

    #[test]
    fn test_touch_visitor_never_rewinds_last_seen() {
        let store = Store::open_in_memory().unwrap();
        let id = VisitorId::new();
        store
            .insert_visitor(id, &Embedding::new(vec![1.0]), ts(9))
            .unwrap();

        store.touch_visitor(id, ts(12)).unwrap();
        store.touch_visitor(id, ts(10)).unwrap();

        let rows = store.load_visitors().unwrap();
        assert_eq!(rows[0].last_seen, ts(12));
    }

    #[test]
    fn test_event_append_requires_visitor_row() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .append_event(&event(VisitorId::new(), EventKind::Entry, ts(9)))
            .unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_deleting_a_visitor_cascades_to_events() {
        let store = Store::open_in_memory().unwrap();
        let id = VisitorId::new();
        store
            .insert_visitor(id, &Embedding::new(vec![1.0]), ts(9))
            .unwrap();
        store.append_event(&event(id, EventKind::Entry, ts(9))).unwrap();
        store.append_event(&event(id, EventKind::Exit, ts(10))).unwrap();

        // Administrative deletion happens outside the core; the schema
        // still has to clean up.
        store
            .conn
            .execute("DELETE FROM visitors", [])
            .unwrap();
        assert!(store.recent_events(10).unwrap().is_empty());
    }

    #[test]
    fn test_daily_counts_aggregate_by_day() {
        let store = Store::open_in_memory().unwrap();
        let a = VisitorId::new();
        let b = VisitorId::new();
        store.insert_visitor(a, &Embedding::new(vec![1.0]), ts(8)).unwrap();
        store.insert_visitor(b, &Embedding::new(vec![0.5]), ts(8)).unwrap();

        store.append_event(&event(a, EventKind::Entry, ts(9))).unwrap();
        store.append_event(&event(b, EventKind::Entry, ts(10))).unwrap();
        store.append_event(&event(a, EventKind::Exit, ts(11))).unwrap();

        let counts = store.daily_counts(7).unwrap();
        assert_eq!(
            counts,
            vec![DailyCount { day: "2026-03-01".into(), entries: 2, exits: 1 }]
        );
    }

    #[test]
    fn test_visitor_summaries_join_event_totals() {
        let store = Store::open_in_memory().unwrap();
        let id = VisitorId::new();
        store.insert_visitor(id, &Embedding::new(vec![1.0]), ts(8)).unwrap();
        store.append_event(&event(id, EventKind::Entry, ts(9))).unwrap();
        store.append_event(&event(id, EventKind::Exit, ts(10))).unwrap();
        store.append_event(&event(id, EventKind::Entry, ts(11))).unwrap();

        let summaries = store.visitor_summaries().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].entries, 2);
        assert_eq!(summaries[0].exits, 1);
    }

    #[test]
    fn test_recent_events_come_back_newest_first() {
        let store = Store::open_in_memory().unwrap();
        let id = VisitorId::new();
        store.insert_visitor(id, &Embedding::new(vec![1.0]), ts(8)).unwrap();
        store.append_event(&event(id, EventKind::Entry, ts(9))).unwrap();
        store.append_event(&event(id, EventKind::Exit, ts(10))).unwrap();

        let events = store.recent_events(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.kind, EventKind::Exit);
        assert_eq!(events[1].event.kind, EventKind::Entry);
        assert_eq!(events[0].event.crop_path.as_deref(), Some("crops/2026-03-01/x.jpg"));
    }
}
