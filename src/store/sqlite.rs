use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};

use super::{LockedRow, PhaseStore};
use crate::errors::StoreError;
use crate::phase::{PhaseKey, PhaseRecord, PhaseStatus};

/// Schema version stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_COLUMNS: &str = "run_id, phase_id, state, retry_attempt, revision_epoch,
     escalation_level, last_failure_reason, last_attempt_timestamp, started_at,
     completed_at, version";

/// SQLite-backed phase store.
///
/// Mutations run inside `BEGIN IMMEDIATE` transactions, which take SQLite's
/// write lock up front; a second writer (another connection or process) waits
/// up to the busy timeout and then fails with a transient error. Commits are
/// additionally guarded on the `version` column.
///
/// File-backed stores keep a second, query-only connection for `fetch` and
/// `fetch_run`. Under WAL it reads the last committed state while the write
/// connection holds (or waits for) the write lock.
pub struct SqlitePhaseStore {
    conn: Mutex<Connection>,
    reader: Option<Mutex<Connection>>,
}

impl SqlitePhaseStore {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;
        conn.busy_timeout(busy_timeout)
            .context("Failed to set busy timeout")?;
        // WAL lets unlocked reads proceed while another connection writes.
        let _mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("Failed to enable WAL journal mode")?;
        let mut store = Self {
            conn: Mutex::new(conn),
            reader: None,
        };
        store.init()?;
        store.reader = Some(Mutex::new(open_reader(path, busy_timeout)?));
        Ok(store)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        // A second in-memory connection would be a separate database, so
        // reads share the write connection.
        let store = Self {
            conn: Mutex::new(conn),
            reader: None,
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("DB lock poisoned: {}", e))?;
        run_migrations(&conn).context("Failed to run migrations")
    }

    /// Schema version currently recorded in the database file.
    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.read_connection()?;
        conn.query_row("PRAGMA user_version", [], |row| row.get(0))
            .context("Failed to read schema version")
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Backend(anyhow!("DB lock poisoned: {}", e)))
    }

    /// Connection for unlocked reads; never blocked by a pending `lock_row`.
    fn read_connection(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        match &self.reader {
            Some(reader) => reader
                .lock()
                .map_err(|e| StoreError::Backend(anyhow!("DB reader lock poisoned: {}", e))),
            None => self.connection(),
        }
    }
}

fn open_reader(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path).with_context(|| {
        format!(
            "Failed to open SQLite read connection at {}",
            path.display()
        )
    })?;
    conn.busy_timeout(busy_timeout)
        .context("Failed to set busy timeout")?;
    conn.pragma_update(None, "query_only", true)
        .context("Failed to make read connection query-only")?;
    Ok(conn)
}

fn run_migrations(conn: &Connection) -> Result<()> {
    let current: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .context("Failed to read schema version")?;
    if current > SCHEMA_VERSION {
        anyhow::bail!(
            "Database schema version {} is newer than supported version {}",
            current,
            SCHEMA_VERSION
        );
    }
    if current == SCHEMA_VERSION {
        return Ok(());
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS phase_records (
            run_id TEXT NOT NULL,
            phase_id TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'queued',
            retry_attempt INTEGER NOT NULL DEFAULT 0 CHECK (retry_attempt >= 0),
            revision_epoch INTEGER NOT NULL DEFAULT 0 CHECK (revision_epoch >= 0),
            escalation_level INTEGER NOT NULL DEFAULT 0
                CHECK (escalation_level >= 0 AND escalation_level <= 10),
            last_failure_reason TEXT,
            last_attempt_timestamp TEXT,
            started_at TEXT,
            completed_at TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (run_id, phase_id)
        );

        CREATE INDEX IF NOT EXISTS idx_phase_records_state ON phase_records(run_id, state);
        ",
    )
    .context("Failed to create phase_records table")?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)
        .context("Failed to record schema version")?;

    Ok(())
}

/// Map a rusqlite failure onto the store's error categories.
///
/// Busy/locked databases and I/O hiccups are transient. `SQLITE_LOCKED`
/// (a table lock held by a conflicting statement on a shared cache) is a
/// write-write conflict. Everything else is a backend error.
fn classify(err: rusqlite::Error, context: &str) -> StoreError {
    if let rusqlite::Error::SqliteFailure(ffi_err, _) = &err {
        match ffi_err.code {
            ErrorCode::DatabaseLocked => {
                return StoreError::Conflict(format!("{}: {}", context, err));
            }
            ErrorCode::DatabaseBusy
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::OperationInterrupted => {
                return StoreError::Transient(format!("{}: {}", context, err));
            }
            _ => {}
        }
    }
    StoreError::Backend(anyhow::Error::new(err).context(context.to_string()))
}

fn select_record(conn: &Connection, key: &PhaseKey) -> Result<Option<PhaseRecord>, StoreError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM phase_records WHERE run_id = ?1 AND phase_id = ?2",
                SELECT_COLUMNS
            ),
            params![key.run_id, key.phase_id],
            PhaseRow::from_row,
        )
        .optional()
        .map_err(|e| classify(e, "Failed to query phase record"))?;
    row.map(PhaseRow::into_record)
        .transpose()
        .map_err(StoreError::Backend)
}

impl PhaseStore for SqlitePhaseStore {
    fn fetch(&self, key: &PhaseKey) -> Result<Option<PhaseRecord>, StoreError> {
        let conn = self.read_connection()?;
        select_record(&conn, key)
    }

    fn fetch_run(&self, run_id: &str) -> Result<Vec<PhaseRecord>, StoreError> {
        let conn = self.read_connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM phase_records WHERE run_id = ?1 ORDER BY phase_id",
                SELECT_COLUMNS
            ))
            .map_err(|e| classify(e, "Failed to prepare fetch_run"))?;
        let rows = stmt
            .query_map(params![run_id], PhaseRow::from_row)
            .map_err(|e| classify(e, "Failed to query phase records"))?;
        let mut records = Vec::new();
        for row in rows {
            let r = row.map_err(|e| classify(e, "Failed to read phase record row"))?;
            records.push(r.into_record().map_err(StoreError::Backend)?);
        }
        Ok(records)
    }

    fn lock_row<'a>(&'a self, key: &PhaseKey) -> Result<Box<dyn LockedRow + 'a>, StoreError> {
        let conn = self.connection()?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| classify(e, "Failed to begin row transaction"))?;

        let mut locked = SqliteLockedRow {
            conn,
            key: key.clone(),
            current: None,
            open: true,
        };
        // On error `locked` is dropped here and rolls back.
        locked.current = select_record(&locked.conn, key)?;
        Ok(Box::new(locked))
    }
}

struct SqliteLockedRow<'a> {
    conn: MutexGuard<'a, Connection>,
    key: PhaseKey,
    current: Option<PhaseRecord>,
    open: bool,
}

impl LockedRow for SqliteLockedRow<'_> {
    fn current(&self) -> Option<&PhaseRecord> {
        self.current.as_ref()
    }

    fn commit(mut self: Box<Self>, mut next: PhaseRecord) -> Result<PhaseRecord, StoreError> {
        let expected = self.current.as_ref().map(|r| r.version);
        next.run_id = self.key.run_id.clone();
        next.phase_id = self.key.phase_id.clone();
        next.version = expected.unwrap_or(0) + 1;

        let changed = match expected {
            Some(expected) => self.conn.execute(
                "UPDATE phase_records SET
                    state = ?3,
                    retry_attempt = ?4,
                    revision_epoch = ?5,
                    escalation_level = ?6,
                    last_failure_reason = ?7,
                    last_attempt_timestamp = ?8,
                    started_at = ?9,
                    completed_at = ?10,
                    version = ?11,
                    updated_at = datetime('now')
                 WHERE run_id = ?1 AND phase_id = ?2 AND version = ?12",
                params![
                    next.run_id,
                    next.phase_id,
                    next.status.as_str(),
                    next.retry_attempt,
                    next.revision_epoch,
                    next.escalation_level,
                    next.last_failure_reason,
                    next.last_attempt_timestamp.map(|t| t.to_rfc3339()),
                    next.started_at.map(|t| t.to_rfc3339()),
                    next.completed_at.map(|t| t.to_rfc3339()),
                    next.version as i64,
                    expected as i64,
                ],
            ),
            None => self.conn.execute(
                "INSERT INTO phase_records (run_id, phase_id, state, retry_attempt, revision_epoch,
                    escalation_level, last_failure_reason, last_attempt_timestamp, started_at,
                    completed_at, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(run_id, phase_id) DO NOTHING",
                params![
                    next.run_id,
                    next.phase_id,
                    next.status.as_str(),
                    next.retry_attempt,
                    next.revision_epoch,
                    next.escalation_level,
                    next.last_failure_reason,
                    next.last_attempt_timestamp.map(|t| t.to_rfc3339()),
                    next.started_at.map(|t| t.to_rfc3339()),
                    next.completed_at.map(|t| t.to_rfc3339()),
                    next.version as i64,
                ],
            ),
        }
        .map_err(|e| classify(e, "Failed to write phase record"))?;

        if changed == 0 {
            return Err(StoreError::Conflict(format!(
                "{} was modified concurrently (expected version {})",
                self.key,
                expected.unwrap_or(0)
            )));
        }

        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| classify(e, "Failed to commit phase record"))?;
        self.open = false;
        Ok(next)
    }
}

impl Drop for SqliteLockedRow<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::debug!(key = %self.key, error = %e, "Rollback of row transaction failed");
            }
        }
    }
}

/// Raw row as stored, before status/timestamp parsing.
struct PhaseRow {
    run_id: String,
    phase_id: String,
    state: String,
    retry_attempt: u32,
    revision_epoch: u32,
    escalation_level: u32,
    last_failure_reason: Option<String>,
    last_attempt_timestamp: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    version: i64,
}

impl PhaseRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            phase_id: row.get(1)?,
            state: row.get(2)?,
            retry_attempt: row.get(3)?,
            revision_epoch: row.get(4)?,
            escalation_level: row.get(5)?,
            last_failure_reason: row.get(6)?,
            last_attempt_timestamp: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
            version: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<PhaseRecord> {
        let status: PhaseStatus = self
            .state
            .parse()
            .with_context(|| format!("Bad state for phase {}", self.phase_id))?;
        let version = u64::try_from(self.version).with_context(|| {
            format!(
                "Negative version {} for phase {}",
                self.version, self.phase_id
            )
        })?;
        Ok(PhaseRecord {
            status,
            retry_attempt: self.retry_attempt,
            revision_epoch: self.revision_epoch,
            escalation_level: self.escalation_level,
            last_failure_reason: self.last_failure_reason,
            last_attempt_timestamp: parse_timestamp(self.last_attempt_timestamp)?,
            started_at: parse_timestamp(self.started_at)?,
            completed_at: parse_timestamp(self.completed_at)?,
            version,
            run_id: self.run_id,
            phase_id: self.phase_id,
        })
    }
}

fn parse_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .with_context(|| format!("Invalid timestamp '{}'", s))
    })
    .transpose()
}
