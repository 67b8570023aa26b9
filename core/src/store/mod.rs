//! SQLite-backed lineage store
//!
//! Persists every pipeline entity by id with the columns needed for
//! enumeration lifted out and the full value as a JSON payload. Opens in
//! WAL mode, retries busy errors with bounded exponential backoff, and
//! refuses to start on a failed integrity check or a schema newer than
//! this build.

mod schema;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::events::PipelineEvent;
use self::types::{
    Attempt, AttemptStatus, Intent, Judgment, Specification, Survivor, Verification,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database busy: {0}")]
    Busy(String),

    #[error("database corrupt: {0}")]
    Corrupt(String),

    #[error("disk full: {0}")]
    DiskFull(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("sqlite error: {0}")]
    Sqlite(String),

    #[error("lock poisoned")]
    LockPoisoned,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(code, msg) => match code.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    Self::Busy(msg.clone().unwrap_or_else(|| "busy".into()))
                }
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                    Self::Corrupt(msg.clone().unwrap_or_else(|| "corrupt".into()))
                }
                rusqlite::ErrorCode::DiskFull => {
                    Self::DiskFull(msg.clone().unwrap_or_else(|| "disk full".into()))
                }
                _ => Self::Sqlite(e.to_string()),
            },
            _ => Self::Sqlite(e.to_string()),
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a Store
pub type SharedStore = Arc<Store>;

/// Maximum busy retries before surfacing `storage_contention`
const BUSY_RETRY_BUDGET: u32 = 6;

/// Base delay for the busy backoff; doubles per retry, capped below
const BUSY_BASE_DELAY_MS: u64 = 20;

/// Cap on a single busy backoff sleep
const BUSY_MAX_DELAY_MS: u64 = 500;

/// SQLite-backed persistent store for the pipeline lineage
pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Open or create a store at the given path.
    ///
    /// Runs the integrity check and forward migrations before returning;
    /// either failing means the store refuses to start.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Sqlite(format!("create data dir: {e}")))?;
        }
        let conn = Connection::open(&path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_millis(BUSY_BASE_DELAY_MS))?;

        let ok: String =
            conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if ok != "ok" {
            return Err(StoreError::Corrupt(ok));
        }

        Self::migrate(&conn)?;

        info!(path = %path.display(), "Store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedStore {
        Arc::new(self)
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn migrate(conn: &Connection) -> StoreResult<()> {
        let found: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if found > schema::SCHEMA_VERSION {
            return Err(StoreError::SchemaTooNew {
                found,
                supported: schema::SCHEMA_VERSION,
            });
        }
        for (i, migration) in schema::MIGRATIONS.iter().enumerate() {
            let target = i as i64 + 1;
            if found < target {
                debug!(from = found, to = target, "Applying store migration");
                conn.execute_batch(migration)?;
                conn.pragma_update(None, "user_version", target)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Busy-retry plumbing
    // =========================================================================

    /// Run an operation against the connection, retrying busy errors with
    /// bounded exponential backoff.
    fn with_conn<T>(&self, op: impl Fn(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut delay = Duration::from_millis(BUSY_BASE_DELAY_MS);
        let mut last_busy = String::new();
        for attempt in 0..=BUSY_RETRY_BUDGET {
            match op(&conn) {
                Err(StoreError::Busy(msg)) => {
                    last_busy = msg;
                    if attempt < BUSY_RETRY_BUDGET {
                        warn!(attempt, delay_ms = delay.as_millis() as u64, "Store busy, retrying");
                        std::thread::sleep(delay);
                        delay = (delay * 2).min(Duration::from_millis(BUSY_MAX_DELAY_MS));
                    }
                }
                other => return other,
            }
        }
        Err(StoreError::Busy(last_busy))
    }

    fn to_json<T: Serialize>(value: &T) -> StoreResult<String> {
        serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn from_json<T: DeserializeOwned>(json: &str) -> StoreResult<T> {
        serde_json::from_str(json).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    // =========================================================================
    // Intent operations
    // =========================================================================

    /// Insert or replace an intent
    pub fn put_intent(&self, intent: &Intent) -> StoreResult<()> {
        let payload = Self::to_json(intent)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO intents (id, session_id, status, created_at, updated_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    intent.id,
                    intent.session_id,
                    intent.status.to_string(),
                    intent.created_at.to_rfc3339(),
                    intent.updated_at.to_rfc3339(),
                    payload
                ],
            )?;
            Ok(())
        })
    }

    /// Get an intent by id
    pub fn get_intent(&self, intent_id: &str) -> StoreResult<Option<Intent>> {
        self.with_conn(|conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM intents WHERE id = ?1",
                    params![intent_id],
                    |row| row.get(0),
                )
                .optional()?;
            payload.map(|p| Self::from_json(&p)).transpose()
        })
    }

    /// Update an intent's status column and payload together
    pub fn update_intent_status(&self, intent: &Intent) -> StoreResult<()> {
        let payload = Self::to_json(intent)?;
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE intents SET status = ?2, updated_at = ?3, payload = ?4 WHERE id = ?1",
                params![
                    intent.id,
                    intent.status.to_string(),
                    intent.updated_at.to_rfc3339(),
                    payload
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("intent {}", intent.id)));
            }
            Ok(())
        })
    }

    /// List intents for a session, newest first
    pub fn list_intents_for_session(&self, session_id: &str) -> StoreResult<Vec<Intent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM intents WHERE session_id = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![session_id], |row| row.get::<_, String>(0))?;
            let mut intents = Vec::new();
            for row in rows {
                intents.push(Self::from_json(&row?)?);
            }
            Ok(intents)
        })
    }

    /// List every intent, newest first
    pub fn list_intents(&self) -> StoreResult<Vec<Intent>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT payload FROM intents ORDER BY created_at DESC")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut intents = Vec::new();
            for row in rows {
                intents.push(Self::from_json(&row?)?);
            }
            Ok(intents)
        })
    }

    /// Intents not in a terminal state, for startup resumption
    pub fn list_unfinished_intents(&self) -> StoreResult<Vec<Intent>> {
        Ok(self
            .list_intents()?
            .into_iter()
            .filter(|i| !i.status.is_terminal())
            .collect())
    }

    // =========================================================================
    // Specification operations
    // =========================================================================

    /// Insert or replace a specification
    pub fn put_spec(&self, spec: &Specification) -> StoreResult<()> {
        let payload = Self::to_json(spec)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO specs (id, intent_id, version, created_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    spec.id,
                    spec.intent_id,
                    spec.version,
                    spec.created_at.to_rfc3339(),
                    payload
                ],
            )?;
            Ok(())
        })
    }

    /// Get a specification by id
    pub fn get_spec(&self, spec_id: &str) -> StoreResult<Option<Specification>> {
        self.with_conn(|conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM specs WHERE id = ?1",
                    params![spec_id],
                    |row| row.get(0),
                )
                .optional()?;
            payload.map(|p| Self::from_json(&p)).transpose()
        })
    }

    /// Latest specification version for an intent
    pub fn latest_spec(&self, intent_id: &str) -> StoreResult<Option<Specification>> {
        self.with_conn(|conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM specs WHERE intent_id = ?1 ORDER BY version DESC LIMIT 1",
                    params![intent_id],
                    |row| row.get(0),
                )
                .optional()?;
            payload.map(|p| Self::from_json(&p)).transpose()
        })
    }

    // =========================================================================
    // Attempt operations
    // =========================================================================

    /// Insert or replace an attempt
    pub fn put_attempt(&self, attempt: &Attempt) -> StoreResult<()> {
        let payload = Self::to_json(attempt)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO attempts
                 (id, spec_id, spec_version, status, content_hash, created_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    attempt.id,
                    attempt.spec_id,
                    attempt.spec_version,
                    attempt.status.to_string(),
                    attempt.content_hash(),
                    attempt.created_at.to_rfc3339(),
                    payload
                ],
            )?;
            Ok(())
        })
    }

    /// Get an attempt by id
    pub fn get_attempt(&self, attempt_id: &str) -> StoreResult<Option<Attempt>> {
        self.with_conn(|conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM attempts WHERE id = ?1",
                    params![attempt_id],
                    |row| row.get(0),
                )
                .optional()?;
            payload.map(|p| Self::from_json(&p)).transpose()
        })
    }

    /// Update an attempt's status
    pub fn update_attempt_status(&self, attempt_id: &str, status: AttemptStatus) -> StoreResult<()> {
        let mut attempt = self
            .get_attempt(attempt_id)?
            .ok_or_else(|| StoreError::NotFound(format!("attempt {attempt_id}")))?;
        attempt.status = status;
        self.put_attempt(&attempt)
    }

    /// List attempts for a spec version, earliest first
    pub fn list_attempts(&self, spec_id: &str, spec_version: u32) -> StoreResult<Vec<Attempt>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM attempts
                 WHERE spec_id = ?1 AND spec_version = ?2 ORDER BY created_at ASC",
            )?;
            let rows =
                stmt.query_map(params![spec_id, spec_version], |row| row.get::<_, String>(0))?;
            let mut attempts = Vec::new();
            for row in rows {
                attempts.push(Self::from_json(&row?)?);
            }
            Ok(attempts)
        })
    }

    // =========================================================================
    // Verification operations
    // =========================================================================

    /// Insert or replace a verification
    pub fn put_verification(&self, verification: &Verification) -> StoreResult<()> {
        let payload = Self::to_json(verification)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO verifications (id, attempt_id, passed, created_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    verification.id,
                    verification.attempt_id,
                    verification.passed as i32,
                    verification.created_at.to_rfc3339(),
                    payload
                ],
            )?;
            Ok(())
        })
    }

    /// Get a verification by id
    pub fn get_verification(&self, id: &str) -> StoreResult<Option<Verification>> {
        self.with_conn(|conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM verifications WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            payload.map(|p| Self::from_json(&p)).transpose()
        })
    }

    /// Latest verification for an attempt
    pub fn latest_verification_for_attempt(
        &self,
        attempt_id: &str,
    ) -> StoreResult<Option<Verification>> {
        self.with_conn(|conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM verifications WHERE attempt_id = ?1
                     ORDER BY created_at DESC LIMIT 1",
                    params![attempt_id],
                    |row| row.get(0),
                )
                .optional()?;
            payload.map(|p| Self::from_json(&p)).transpose()
        })
    }

    // =========================================================================
    // Survivor operations
    // =========================================================================

    /// Insert or replace a survivor
    pub fn put_survivor(&self, survivor: &Survivor) -> StoreResult<()> {
        let payload = Self::to_json(survivor)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO survivors
                 (id, intent_id, attempt_id, verification_id, rank, presented, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    survivor.id,
                    survivor.intent_id,
                    survivor.attempt_id,
                    survivor.verification_id,
                    survivor.rank,
                    survivor.presented as i32,
                    payload
                ],
            )?;
            Ok(())
        })
    }

    /// Get a survivor by id
    pub fn get_survivor(&self, id: &str) -> StoreResult<Option<Survivor>> {
        self.with_conn(|conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM survivors WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            payload.map(|p| Self::from_json(&p)).transpose()
        })
    }

    /// Survivors of an intent, by ascending rank
    pub fn list_survivors_for_intent(&self, intent_id: &str) -> StoreResult<Vec<Survivor>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM survivors WHERE intent_id = ?1 ORDER BY rank ASC",
            )?;
            let rows = stmt.query_map(params![intent_id], |row| row.get::<_, String>(0))?;
            let mut survivors = Vec::new();
            for row in rows {
                survivors.push(Self::from_json(&row?)?);
            }
            Ok(survivors)
        })
    }

    /// Mark a survivor as presented to the human
    pub fn mark_presented(&self, survivor_id: &str) -> StoreResult<()> {
        let mut survivor = self
            .get_survivor(survivor_id)?
            .ok_or_else(|| StoreError::NotFound(format!("survivor {survivor_id}")))?;
        survivor.presented = true;
        self.put_survivor(&survivor)
    }

    // =========================================================================
    // Judgment operations
    // =========================================================================

    /// Insert a judgment
    pub fn put_judgment(&self, judgment: &Judgment) -> StoreResult<()> {
        let payload = Self::to_json(judgment)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO judgments (id, intent_id, decision, created_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    judgment.id,
                    judgment.intent_id,
                    judgment.decision.to_string(),
                    judgment.created_at.to_rfc3339(),
                    payload
                ],
            )?;
            Ok(())
        })
    }

    /// Judgments for an intent, earliest first
    pub fn list_judgments(&self, intent_id: &str) -> StoreResult<Vec<Judgment>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM judgments WHERE intent_id = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map(params![intent_id], |row| row.get::<_, String>(0))?;
            let mut judgments = Vec::new();
            for row in rows {
                judgments.push(Self::from_json(&row?)?);
            }
            Ok(judgments)
        })
    }

    // =========================================================================
    // Event operations
    // =========================================================================

    /// Append a pipeline event (serialized as JSON for debuggability)
    pub fn append_event(&self, intent_id: &str, event: &PipelineEvent) -> StoreResult<()> {
        let payload = Self::to_json(event)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO events (intent_id, created_at, payload) VALUES (?1, ?2, ?3)",
                params![intent_id, event.timestamp().to_rfc3339(), payload],
            )?;
            Ok(())
        })
    }

    /// Events for an intent, in append order
    pub fn list_events(&self, intent_id: &str) -> StoreResult<Vec<PipelineEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM events WHERE intent_id = ?1 ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map(params![intent_id], |row| row.get::<_, String>(0))?;
            let mut events = Vec::new();
            for row in rows {
                events.push(Self::from_json(&row?)?);
            }
            Ok(events)
        })
    }

    /// Remove every entity owned by a session (operator purge)
    pub fn purge_session(&self, session_id: &str) -> StoreResult<usize> {
        let intents = self.list_intents_for_session(session_id)?;
        self.with_conn(|conn| {
            let mut removed = 0usize;
            for intent in &intents {
                conn.execute(
                    "DELETE FROM events WHERE intent_id = ?1",
                    params![intent.id],
                )?;
                conn.execute(
                    "DELETE FROM judgments WHERE intent_id = ?1",
                    params![intent.id],
                )?;
                conn.execute(
                    "DELETE FROM survivors WHERE intent_id = ?1",
                    params![intent.id],
                )?;
                conn.execute(
                    "DELETE FROM verifications WHERE attempt_id IN
                     (SELECT id FROM attempts WHERE spec_id IN
                        (SELECT id FROM specs WHERE intent_id = ?1))",
                    params![intent.id],
                )?;
                conn.execute(
                    "DELETE FROM attempts WHERE spec_id IN
                     (SELECT id FROM specs WHERE intent_id = ?1)",
                    params![intent.id],
                )?;
                conn.execute("DELETE FROM specs WHERE intent_id = ?1", params![intent.id])?;
                removed += conn.execute("DELETE FROM intents WHERE id = ?1", params![intent.id])?;
            }
            Ok(removed)
        })
    }
}
