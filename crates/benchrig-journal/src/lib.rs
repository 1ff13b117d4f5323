//! `benchrig-journal` – append-only event journal for the bench rig.
//!
//! Every temperature sample, trigger, sweep step and command outcome is
//! written to a local SQLite database before the caller moves on, so a crash
//! mid-sequence still leaves a readable record of what the hardware did.
//! Calibration points for the potentiometer live in the same table under
//! their own kind.
//!
//! # Storage layout
//!
//! | column    | type    | description                                  |
//! |-----------|---------|----------------------------------------------|
//! | seq       | INTEGER | Monotonic insertion order                    |
//! | id        | TEXT    | UUID v4, unique                              |
//! | timestamp | TEXT    | RFC-3339 creation time (UTC)                 |
//! | kind      | TEXT    | [`EntryKind`] tag                            |
//! | payload   | TEXT    | JSON body of the event                       |
//!
//! # Example
//!
//! ```rust
//! use benchrig_journal::{EntryKind, EventSink, JournalEntry, SqliteJournal};
//! use serde_json::json;
//!
//! let journal = SqliteJournal::open_in_memory().unwrap();
//! journal
//!     .record(JournalEntry::new(EntryKind::Trigger, json!({"cycles": 5})))
//!     .unwrap();
//!
//! let recent = journal.recent(Some(EntryKind::Trigger), 10).unwrap();
//! assert_eq!(recent[0].payload["cycles"], 5);
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("journal payload error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unknown journal entry kind '{0}'")]
    UnknownKind(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Entries
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Temperature,
    Trigger,
    SweepStep,
    Command,
    Calibration,
}

impl EntryKind {
    pub const ALL: [EntryKind; 5] = [
        EntryKind::Temperature,
        EntryKind::Trigger,
        EntryKind::SweepStep,
        EntryKind::Command,
        EntryKind::Calibration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Temperature => "temperature",
            EntryKind::Trigger => "trigger",
            EntryKind::SweepStep => "sweep_step",
            EntryKind::Command => "command",
            EntryKind::Calibration => "calibration",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = JournalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntryKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| JournalError::UnknownKind(s.to_string()))
    }
}

/// One journalled event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: EntryKind,
    pub payload: Value,
}

impl JournalEntry {
    /// A fresh entry stamped with a new UUID and the current UTC time.
    pub fn new(kind: EntryKind, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            payload,
        }
    }

    /// Serialise `body` into a fresh entry.
    pub fn of<T: Serialize>(kind: EntryKind, body: &T) -> Result<Self, JournalError> {
        Ok(Self::new(kind, serde_json::to_value(body)?))
    }
}

/// A measured point of the potentiometer transfer curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub name: String,
    pub code: u8,
    pub voltage: f64,
    #[serde(default)]
    pub notes: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Sink trait
// ─────────────────────────────────────────────────────────────────────────────

/// Destination for journal entries.
///
/// `record` returns only once the entry is durable, so callers may treat a
/// successful return as the event having happened on record.
pub trait EventSink: Send + Sync {
    fn record(&self, entry: JournalEntry) -> Result<(), JournalError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteJournal
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed [`EventSink`].
pub struct SqliteJournal {
    conn: Mutex<Connection>,
}

impl SqliteJournal {
    /// Open (or create) a journal file at `path` in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let conn = Connection::open(path.as_ref())?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %path.as_ref().display(), journal_mode = %mode, "journal opened");
        let journal = Self {
            conn: Mutex::new(conn),
        };
        journal.init_schema()?;
        Ok(journal)
    }

    /// Open a throwaway in-memory journal.
    pub fn open_in_memory() -> Result<Self, JournalError> {
        let journal = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        journal.init_schema()?;
        Ok(journal)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), JournalError> {
        self.conn().execute_batch(
            "CREATE TABLE IF NOT EXISTS journal (
                seq       INTEGER PRIMARY KEY AUTOINCREMENT,
                id        TEXT NOT NULL UNIQUE,
                timestamp TEXT NOT NULL,
                kind      TEXT NOT NULL,
                payload   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS journal_kind ON journal (kind, seq);",
        )?;
        Ok(())
    }

    /// The newest `limit` entries, optionally of one kind, oldest first.
    pub fn recent(
        &self,
        kind: Option<EntryKind>,
        limit: usize,
    ) -> Result<Vec<JournalEntry>, JournalError> {
        let conn = self.conn();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, kind, payload
             FROM journal
             WHERE ?1 IS NULL OR kind = ?1
             ORDER BY seq DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![kind.map(EntryKind::as_str), limit], |row| {
            let id: String = row.get(0)?;
            let timestamp: String = row.get(1)?;
            let kind: String = row.get(2)?;
            let payload: String = row.get(3)?;
            Ok((id, timestamp, kind, payload))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, timestamp, kind, payload) = row?;
            let id = Uuid::parse_str(&id).map_err(|e| {
                rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text)
            })?;
            let timestamp = timestamp.parse::<DateTime<Utc>>().map_err(|e| {
                rusqlite::Error::InvalidColumnType(1, e.to_string(), rusqlite::types::Type::Text)
            })?;
            entries.push(JournalEntry {
                id,
                timestamp,
                kind: kind.parse()?,
                payload: serde_json::from_str(&payload)?,
            });
        }
        entries.reverse();
        Ok(entries)
    }

    pub fn count(&self, kind: Option<EntryKind>) -> Result<u64, JournalError> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM journal WHERE ?1 IS NULL OR kind = ?1",
            params![kind.map(EntryKind::as_str)],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(n).unwrap_or_default())
    }

    pub fn record_calibration(&self, point: &CalibrationPoint) -> Result<(), JournalError> {
        self.record(JournalEntry::of(EntryKind::Calibration, point)?)
    }

    /// Every calibration point, oldest first.
    pub fn calibration_points(&self) -> Result<Vec<CalibrationPoint>, JournalError> {
        self.recent(Some(EntryKind::Calibration), usize::MAX)?
            .into_iter()
            .map(|e| serde_json::from_value(e.payload).map_err(JournalError::from))
            .collect()
    }
}

impl EventSink for SqliteJournal {
    fn record(&self, entry: JournalEntry) -> Result<(), JournalError> {
        let payload = serde_json::to_string(&entry.payload)?;
        self.conn().execute(
            "INSERT INTO journal (id, timestamp, kind, payload) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.id.to_string(),
                entry.timestamp.to_rfc3339(),
                entry.kind.as_str(),
                payload,
            ],
        )?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_tags_parse_back() {
        for kind in EntryKind::ALL {
            assert_eq!(kind.as_str().parse::<EntryKind>().unwrap(), kind);
        }
        assert!(matches!(
            "bogus".parse::<EntryKind>(),
            Err(JournalError::UnknownKind(_))
        ));
    }

    #[test]
    fn recent_returns_newest_in_insertion_order() {
        let journal = SqliteJournal::open_in_memory().unwrap();
        for cycles in [5, 4, 3, 2, 1] {
            journal
                .record(JournalEntry::new(EntryKind::Trigger, json!({ "cycles": cycles })))
                .unwrap();
        }

        let last_three: Vec<i64> = journal
            .recent(Some(EntryKind::Trigger), 3)
            .unwrap()
            .iter()
            .map(|e| e.payload["cycles"].as_i64().unwrap())
            .collect();
        assert_eq!(last_three, vec![3, 2, 1]);
    }

    #[test]
    fn recent_filters_by_kind() {
        let journal = SqliteJournal::open_in_memory().unwrap();
        journal
            .record(JournalEntry::new(EntryKind::Temperature, json!({ "temperature_k": 300.0 })))
            .unwrap();
        journal
            .record(JournalEntry::new(EntryKind::Command, json!({ "type": "all_off" })))
            .unwrap();

        assert_eq!(journal.recent(None, 10).unwrap().len(), 2);
        let temps = journal.recent(Some(EntryKind::Temperature), 10).unwrap();
        assert_eq!(temps.len(), 1);
        assert_eq!(temps[0].kind, EntryKind::Temperature);
        assert_eq!(journal.count(Some(EntryKind::Command)).unwrap(), 1);
        assert_eq!(journal.count(None).unwrap(), 2);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let journal = SqliteJournal::open_in_memory().unwrap();
        let entry = JournalEntry::new(EntryKind::Trigger, json!({}));
        journal.record(entry.clone()).unwrap();
        assert!(matches!(journal.record(entry), Err(JournalError::Sqlite(_))));
    }

    #[test]
    fn calibration_points_roundtrip_through_the_table() {
        let journal = SqliteJournal::open_in_memory().unwrap();
        let point = CalibrationPoint {
            name: "mid-scale".into(),
            code: 128,
            voltage: 2.5,
            notes: "bench DMM".into(),
        };
        journal.record_calibration(&point).unwrap();
        journal
            .record(JournalEntry::new(EntryKind::Trigger, json!({ "cycles": 1 })))
            .unwrap();

        assert_eq!(journal.calibration_points().unwrap(), vec![point]);
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        let entry = JournalEntry::new(EntryKind::SweepStep, json!({ "step": 0 }));
        {
            let journal = SqliteJournal::open(&path).unwrap();
            journal.record(entry.clone()).unwrap();
        }

        let reopened = SqliteJournal::open(&path).unwrap();
        let entries = reopened.recent(None, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, entry.id);
        assert_eq!(entries[0].payload, entry.payload);
    }
}
