//! SQLite-backed world/economy engine.
//!
//! The engine owns the persistent world grid and player records and exposes
//! the operation contract consumed by the transport layer: move, tap, drop,
//! build, upgrade, viewport and leaderboard reads. Transport, sessions and
//! broadcast fan-out live elsewhere; everything here is synchronous
//! request/response over the shared store.

use anyhow::Context;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod building;
pub mod cells;
pub mod economy;
pub mod players;
pub mod tap;
pub mod worldgen;

pub use building::{BuildOutcome, BuildingTemplate, DropOutcome, TemplateOffset};
pub use cells::Cell;
pub use players::PlayerState;
pub use tap::SweepReport;

pub use gridlands_protocol as protocol;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

pub(crate) fn new_id(prefix: &str) -> String {
    let c = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{c}", now_ms())
}

#[derive(Debug, Clone)]
pub struct Engine {
    db_path: PathBuf,
    players: players::PlayerCache,
}

impl Engine {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            players: players::PlayerCache::default(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub(crate) fn player_cache(&self) -> &players::PlayerCache {
        &self.players
    }

    pub fn open(&self) -> anyhow::Result<Connection> {
        let path = self.db_path.clone();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create db dir: {}", dir.display()))?;
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("open sqlite db: {}", path.display()))?;

        // Durable + fast defaults. The busy timeout matters here: tap
        // resolution retries optimistically and concurrent sessions hit the
        // same file.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_millis(2_000))?;

        migrate(&conn)?;
        Ok(conn)
    }

    /// Monotonic world revision, sourced from the event log. Transport layers
    /// poll this to decide when to re-broadcast viewports.
    pub fn get_rev(&self) -> anyhow::Result<i64> {
        let conn = self.open()?;
        let rev: Option<i64> =
            conn.query_row("SELECT MAX(seq) FROM event_log", [], |row| row.get(0))?;
        Ok(rev.unwrap_or(0))
    }
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    // Lightweight migrations: `user_version` + IF NOT EXISTS, because the
    // schema is still young and installs should stay resilient.
    let v: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if v < 1 {
        conn.execute_batch(
            r#"
-- Monotonic revision source for viewport sync and audit.
CREATE TABLE IF NOT EXISTS event_log (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  ts_ms INTEGER NOT NULL,
  kind TEXT NOT NULL,
  subject TEXT,
  payload_json TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_event_log_ts ON event_log(ts_ms);
CREATE INDEX IF NOT EXISTS idx_event_log_kind ON event_log(kind);

-- One row per materialized cell. The payload is the whole cell document;
-- `rev` is the compare-and-swap token for concurrent read-modify-writes.
-- `terminal` mirrors the document's collected state so regeneration sweeps
-- can find white cells without parsing every payload.
CREATE TABLE IF NOT EXISTS cells (
  x INTEGER NOT NULL,
  y INTEGER NOT NULL,
  payload_json TEXT NOT NULL DEFAULT '{}',
  terminal INTEGER NOT NULL DEFAULT 0,
  created_at_ms INTEGER NOT NULL,
  updated_at_ms INTEGER NOT NULL,
  rev INTEGER NOT NULL DEFAULT 1,
  PRIMARY KEY (x, y)
);

CREATE INDEX IF NOT EXISTS idx_cells_terminal ON cells(terminal);

-- Full player records. Single-writer per player, so plain full-row writes;
-- `rev` still increments for observability.
CREATE TABLE IF NOT EXISTS players (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  payload_json TEXT NOT NULL DEFAULT '{}',
  created_at_ms INTEGER NOT NULL,
  updated_at_ms INTEGER NOT NULL,
  rev INTEGER NOT NULL DEFAULT 1
);
"#,
        )?;

        conn.pragma_update(None, "user_version", 1_i64)?;
    }

    Ok(())
}

pub(crate) fn append_event_tx(
    tx: &rusqlite::Transaction<'_>,
    kind: &str,
    subject: Option<&str>,
    payload: serde_json::Value,
) -> anyhow::Result<i64> {
    let ts = now_ms();
    let payload_json = payload.to_string();
    tx.execute(
        "INSERT INTO event_log (ts_ms, kind, subject, payload_json) VALUES (?1, ?2, ?3, ?4)",
        (ts, kind, subject, payload_json),
    )?;
    Ok(tx.last_insert_rowid())
}

#[cfg(test)]
pub(crate) fn temp_engine() -> Engine {
    let p = std::env::temp_dir().join(format!(
        "gridlands-engine-test-{}.db",
        time::OffsetDateTime::now_utc().unix_timestamp_nanos()
    ));
    let engine = Engine::new(p);
    let _ = engine.open().expect("open db");
    engine
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let engine = temp_engine();
        // Re-opening runs migrate again against the same file.
        let _ = engine.open().unwrap();
        let conn = engine.open().unwrap();
        let v: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(v, 1);
    }

    #[test]
    fn rev_starts_at_zero_and_tracks_events() {
        let engine = temp_engine();
        assert_eq!(engine.get_rev().unwrap(), 0);

        let mut conn = engine.open().unwrap();
        let tx = conn.transaction().unwrap();
        append_event_tx(&tx, "test.event", None, serde_json::json!({})).unwrap();
        tx.commit().unwrap();

        assert_eq!(engine.get_rev().unwrap(), 1);
    }

    #[test]
    fn ids_are_unique() {
        let a = new_id("cell");
        let b = new_id("cell");
        assert_ne!(a, b);
    }
}
