// crates/tga-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite State Store
// Description: Durable StateStore backed by SQLite WAL.
// Purpose: Persist the hash-chained execution log with a single serialized writer.
// Dependencies: tga-core, rusqlite, thiserror
// ============================================================================

//! ## Overview
//! `SqliteStateStore` wraps one `SQLite` connection behind a [`Mutex`]: a
//! single serialized writer, with the mutex itself as the only queueing
//! point. There is no background writer thread or batching, since every
//! `append` call is synchronous and fsync's before returning. Reads
//! (`tail`, `load_all`, `traces_in_state`) share the same connection and
//! mutex; recovery is the only caller that reads the whole log, and it runs
//! before any writer contends for the lock.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::params;

use tga_core::Digest;
use tga_core::ExecutionRecord;
use tga_core::State;
use tga_core::TraceId;
use tga_core::store::StateStore;
use tga_core::store::StateStoreError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Current on-disk schema version, persisted in the `schema_version` row.
pub const SCHEMA_VERSION: i64 = 1;

/// Maximum accepted length, in bytes, of the store's file path.
const MAX_PATH_LEN: usize = 4096;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised opening or operating the `SQLite`-backed store.
#[derive(Debug, thiserror::Error)]
pub enum SqliteStoreError {
    /// Filesystem I/O failure (path validation, directory creation, permissions).
    #[error("sqlite store io error: {0}")]
    Io(String),
    /// `SQLite` engine error.
    #[error("sqlite store db error: {0}")]
    Db(String),
    /// A persisted row could not be decoded into an [`ExecutionRecord`].
    #[error("sqlite store corrupt row: {0}")]
    Corrupt(String),
}

impl From<SqliteStoreError> for StateStoreError {
    fn from(err: SqliteStoreError) -> Self {
        Self::Backend(err.to_string())
    }
}

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Configuration for opening a [`SqliteStateStore`].
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    /// Absolute path to the database file.
    pub path: PathBuf,
    /// `SQLite` busy-timeout applied to the connection, in milliseconds.
    pub busy_timeout_ms: u64,
}

impl SqliteStoreConfig {
    /// Builds a configuration with the default busy timeout.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path, busy_timeout_ms: 5_000 }
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// `SQLite`-backed [`StateStore`] implementation.
pub struct SqliteStateStore {
    /// The single connection every operation serializes through.
    connection: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Opens (creating if absent) the database at `config.path`, enforcing
    /// owner-only file permissions and initializing the schema.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] if the path is invalid, the parent
    /// directory cannot be created, the file permissions cannot be
    /// enforced, or the connection cannot be opened or initialized.
    pub fn open(config: &SqliteStoreConfig) -> Result<Self, SqliteStoreError> {
        validate_store_path(&config.path)?;
        ensure_parent_dir(&config.path)?;
        let mut connection = open_connection(config)?;
        initialize_schema(&mut connection)?;
        enforce_owner_permissions(&config.path)?;
        Ok(Self { connection: Mutex::new(connection) })
    }

    /// Locks the connection, mapping a poisoned mutex to a backend error.
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StateStoreError> {
        self.connection
            .lock()
            .map_err(|_| StateStoreError::Backend("sqlite connection mutex poisoned".to_string()))
    }
}

impl StateStore for SqliteStateStore {
    fn append(&self, record: &ExecutionRecord) -> Result<(), StateStoreError> {
        let connection = self.lock()?;
        let tail: Option<(i64, Vec<u8>)> = connection
            .query_row(
                "SELECT sequence, record_hash FROM execution_states ORDER BY sequence DESC LIMIT 1",
                params![],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|err| StateStoreError::Backend(err.to_string()))?;
        #[allow(
            clippy::cast_possible_truncation,
            reason = "sequence is defined to fit in i64 for the lifetime of one log"
        )]
        let expected = tail.as_ref().map_or(1, |(sequence, _)| sequence + 1);
        if record.sequence as i64 != expected {
            return Err(StateStoreError::SequenceConflict {
                expected: u64::try_from(expected).unwrap_or(u64::MAX),
                actual: record.sequence,
            });
        }
        let expected_prev_hash = tail
            .map(|(_, hash_bytes)| digest_from_bytes(&hash_bytes))
            .transpose()
            .map_err(|err: SqliteStoreError| StateStoreError::Backend(err.to_string()))?
            .unwrap_or(Digest::EMPTY);
        if record.prev_hash != expected_prev_hash {
            return Err(StateStoreError::HashLinkMismatch { sequence: record.sequence });
        }
        let row = encode_record(record);
        connection
            .execute(
                "INSERT INTO execution_states (
                    sequence, trace_id, state, capability_hash, input_hash,
                    output_hash, prev_hash, record_hash, created_at, reason
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    row.sequence,
                    row.trace_id,
                    row.state,
                    row.capability_hash,
                    row.input_hash,
                    row.output_hash,
                    row.prev_hash,
                    row.record_hash,
                    row.created_at,
                    row.reason,
                ],
            )
            .map_err(|err| StateStoreError::Backend(err.to_string()))?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<ExecutionRecord>, StateStoreError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(
                "SELECT sequence, trace_id, state, capability_hash, input_hash, output_hash,
                        prev_hash, record_hash, created_at, reason
                 FROM execution_states ORDER BY sequence ASC",
            )
            .map_err(|err| StateStoreError::Backend(err.to_string()))?;
        let rows = statement
            .query_map(params![], decode_row)
            .map_err(|err| StateStoreError::Backend(err.to_string()))?;
        let mut records = Vec::new();
        for row in rows {
            let row = row.map_err(|err| StateStoreError::Backend(err.to_string()))?;
            records.push(decode_record(row).map_err(SqliteStoreError::from)?);
        }
        Ok(records)
    }

    fn tail(&self) -> Result<Option<ExecutionRecord>, StateStoreError> {
        let connection = self.lock()?;
        let row = connection
            .query_row(
                "SELECT sequence, trace_id, state, capability_hash, input_hash, output_hash,
                        prev_hash, record_hash, created_at, reason
                 FROM execution_states ORDER BY sequence DESC LIMIT 1",
                params![],
                decode_row,
            )
            .optional()
            .map_err(|err| StateStoreError::Backend(err.to_string()))?;
        row.map(|row| decode_record(row).map_err(StateStoreError::from)).transpose()
    }

    fn traces_in_state(&self, state: State) -> Result<Vec<TraceId>, StateStoreError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(
                "SELECT DISTINCT t.trace_id
                 FROM execution_states t
                 INNER JOIN (
                     SELECT trace_id, MAX(sequence) AS max_sequence
                     FROM execution_states GROUP BY trace_id
                 ) latest
                 ON t.trace_id = latest.trace_id AND t.sequence = latest.max_sequence
                 WHERE t.state = ?1",
            )
            .map_err(|err| StateStoreError::Backend(err.to_string()))?;
        let rows = statement
            .query_map(params![state.as_str()], |row| row.get::<_, String>(0))
            .map_err(|err| StateStoreError::Backend(err.to_string()))?;
        let mut traces = Vec::new();
        for row in rows {
            traces.push(TraceId::new(row.map_err(|err| StateStoreError::Backend(err.to_string()))?));
        }
        Ok(traces)
    }
}

// ============================================================================
// SECTION: Row encoding
// ============================================================================

/// The on-disk representation of one [`ExecutionRecord`] row.
struct EncodedRow {
    /// Sequence number, narrowed to fit a `SQLite` `INTEGER` column.
    sequence: i64,
    /// Trace identifier as its string form.
    trace_id: String,
    /// Persisted state string.
    state: &'static str,
    /// Capability hash bytes.
    capability_hash: Vec<u8>,
    /// Input hash bytes, if present.
    input_hash: Option<Vec<u8>>,
    /// Output hash bytes, if present.
    output_hash: Option<Vec<u8>>,
    /// Predecessor hash bytes.
    prev_hash: Vec<u8>,
    /// This record's own hash bytes.
    record_hash: Vec<u8>,
    /// Creation timestamp, nanoseconds since epoch.
    created_at: i64,
    /// Optional diagnostic reason code.
    reason: Option<String>,
}

/// Converts an in-memory [`ExecutionRecord`] into its row representation.
#[allow(clippy::cast_possible_wrap, reason = "sequence never approaches i64::MAX in practice")]
fn encode_record(record: &ExecutionRecord) -> EncodedRow {
    EncodedRow {
        sequence: record.sequence as i64,
        trace_id: record.trace_id.as_str().to_string(),
        state: record.state.as_str(),
        capability_hash: record.capability_hash.as_bytes().to_vec(),
        input_hash: record.input_hash.map(|digest| digest.as_bytes().to_vec()),
        output_hash: record.output_hash.map(|digest| digest.as_bytes().to_vec()),
        prev_hash: record.prev_hash.as_bytes().to_vec(),
        record_hash: record.record_hash.as_bytes().to_vec(),
        created_at: record.created_at,
        reason: record.reason.clone(),
    }
}

/// One raw row pulled out of `execution_states` before type decoding.
struct RawRow {
    /// Raw sequence column value.
    sequence: i64,
    /// Raw trace_id column value.
    trace_id: String,
    /// Raw state column value.
    state: String,
    /// Raw capability_hash column value.
    capability_hash: Vec<u8>,
    /// Raw input_hash column value.
    input_hash: Option<Vec<u8>>,
    /// Raw output_hash column value.
    output_hash: Option<Vec<u8>>,
    /// Raw prev_hash column value.
    prev_hash: Vec<u8>,
    /// Raw record_hash column value.
    record_hash: Vec<u8>,
    /// Raw created_at column value.
    created_at: i64,
    /// Raw reason column value.
    reason: Option<String>,
}

/// Pulls one row of `execution_states` into its raw, undecoded form.
fn decode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        sequence: row.get(0)?,
        trace_id: row.get(1)?,
        state: row.get(2)?,
        capability_hash: row.get(3)?,
        input_hash: row.get(4)?,
        output_hash: row.get(5)?,
        prev_hash: row.get(6)?,
        record_hash: row.get(7)?,
        created_at: row.get(8)?,
        reason: row.get(9)?,
    })
}

/// Decodes digest and state types out of a [`RawRow`], failing closed on corruption.
fn decode_record(row: RawRow) -> Result<ExecutionRecord, SqliteStoreError> {
    let state: State = row
        .state
        .parse()
        .map_err(|err: tga_core::record::UnknownStateError| SqliteStoreError::Corrupt(err.to_string()))?;
    let capability_hash = digest_from_bytes(&row.capability_hash)?;
    let input_hash = row.input_hash.as_deref().map(digest_from_bytes).transpose()?;
    let output_hash = row.output_hash.as_deref().map(digest_from_bytes).transpose()?;
    let prev_hash = digest_from_bytes(&row.prev_hash)?;
    let record_hash = digest_from_bytes(&row.record_hash)?;
    Ok(ExecutionRecord {
        sequence: u64::try_from(row.sequence)
            .map_err(|_| SqliteStoreError::Corrupt("negative sequence".to_string()))?,
        trace_id: TraceId::new(row.trace_id),
        state,
        capability_hash,
        input_hash,
        output_hash,
        prev_hash,
        record_hash,
        created_at: row.created_at,
        reason: row.reason,
    })
}

/// Decodes a fixed-width digest column, failing closed on a wrong-length blob.
fn digest_from_bytes(bytes: &[u8]) -> Result<Digest, SqliteStoreError> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SqliteStoreError::Corrupt(format!("expected 32-byte digest, got {}", bytes.len())))?;
    Ok(Digest::from_bytes(array))
}

// ============================================================================
// SECTION: Connection setup
// ============================================================================

/// Opens an `SQLite` connection with write-ahead logging enabled.
fn open_connection(config: &SqliteStoreConfig) -> Result<Connection, SqliteStoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(&config.path, flags)
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    connection
        .execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL; PRAGMA foreign_keys = ON;")
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    connection
        .busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    Ok(connection)
}

/// Creates or validates the `execution_states` schema.
fn initialize_schema(connection: &mut Connection) -> Result<(), SqliteStoreError> {
    let tx = connection.transaction().map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);
         CREATE TABLE IF NOT EXISTS execution_states (
             sequence INTEGER PRIMARY KEY,
             trace_id TEXT NOT NULL,
             state TEXT NOT NULL,
             capability_hash BLOB NOT NULL,
             input_hash BLOB,
             output_hash BLOB,
             prev_hash BLOB NOT NULL,
             record_hash BLOB NOT NULL,
             created_at INTEGER NOT NULL,
             reason TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_trace_sequence
             ON execution_states (trace_id, sequence DESC);
         CREATE INDEX IF NOT EXISTS idx_state ON execution_states (state);",
    )
    .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM schema_version LIMIT 1", params![], |row| row.get(0))
        .optional()
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    match version {
        None => {
            tx.execute("INSERT INTO schema_version (version) VALUES (?1)", params![SCHEMA_VERSION])
                .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        }
        Some(found) if found == SCHEMA_VERSION => {}
        Some(found) => {
            return Err(SqliteStoreError::Corrupt(format!(
                "schema version mismatch: found {found}, expected {SCHEMA_VERSION}"
            )));
        }
    }
    tx.commit().map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    Ok(())
}

/// Validates a store path against basic safety limits before it is opened.
fn validate_store_path(path: &Path) -> Result<(), SqliteStoreError> {
    if path.as_os_str().is_empty() {
        return Err(SqliteStoreError::Io("store path must not be empty".to_string()));
    }
    if !path.is_absolute() {
        return Err(SqliteStoreError::Io("store path must be absolute".to_string()));
    }
    if path.display().to_string().len() > MAX_PATH_LEN {
        return Err(SqliteStoreError::Io("store path exceeds length limit".to_string()));
    }
    Ok(())
}

/// Creates the store's parent directory if it does not already exist.
fn ensure_parent_dir(path: &Path) -> Result<(), SqliteStoreError> {
    let Some(parent) = path.parent() else {
        return Err(SqliteStoreError::Io("store path missing parent directory".to_string()));
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent).map_err(|err| SqliteStoreError::Io(err.to_string()))
}

/// Restricts the database file to owner read/write (0600).
#[cfg(unix)]
fn enforce_owner_permissions(path: &Path) -> Result<(), SqliteStoreError> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(path, permissions).map_err(|err| SqliteStoreError::Io(err.to_string()))
}

/// No-op on non-Unix targets, which have no equivalent owner-mode bits.
#[cfg(not(unix))]
fn enforce_owner_permissions(_path: &Path) -> Result<(), SqliteStoreError> {
    Ok(())
}

// ============================================================================
// SECTION: Tests
// ============================================================================
