// crates/tga-core/src/store.rs
// ============================================================================
// Module: StateStore Interface
// Description: Backend-agnostic contract for the durable append-only execution log.
// Purpose: Decouple the state machine and recovery from any one storage adapter.
// Dependencies: crate::{identifiers, record}, thiserror
// ============================================================================

//! ## Overview
//! `StateStore` is the narrow interface the execution state machine and
//! recovery depend on; the reference adapter (a `SQLite` file with
//! write-ahead logging) lives in a separate crate so this crate stays
//! backend-agnostic.

// ============================================================================
// SECTION: Imports
// ============================================================================

use crate::identifiers::TraceId;
use crate::record::ExecutionRecord;
use crate::record::State;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by a [`StateStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    /// `append` was called with a sequence not equal to `max(sequence) + 1`.
    #[error("sequence conflict: expected {expected}, got {actual}")]
    SequenceConflict {
        /// The sequence number that was required.
        expected: u64,
        /// The sequence number that was actually supplied.
        actual: u64,
    },
    /// `append` was called with a `prev_hash` not matching the current tail.
    #[error("hash link mismatch at sequence {sequence}")]
    HashLinkMismatch {
        /// The sequence number of the offending record.
        sequence: u64,
    },
    /// The underlying storage medium failed (I/O, driver, or encoding error).
    #[error("state store backend error: {0}")]
    Backend(String),
}

// ============================================================================
// SECTION: Trait
// ============================================================================

/// The durable, crash-safe, append-only store for execution records.
pub trait StateStore: Send + Sync {
    /// Atomically persists one record, durable before returning.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError::SequenceConflict`] or
    /// [`StateStoreError::HashLinkMismatch`] per the append contract, or
    /// [`StateStoreError::Backend`] on a storage failure.
    fn append(&self, record: &ExecutionRecord) -> Result<(), StateStoreError>;

    /// Returns every record in ascending `sequence` order. Used only by recovery.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError::Backend`] on a storage failure.
    fn load_all(&self) -> Result<Vec<ExecutionRecord>, StateStoreError>;

    /// Returns the last record, if any, without loading the whole log.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError::Backend`] on a storage failure.
    fn tail(&self) -> Result<Option<ExecutionRecord>, StateStoreError>;

    /// Returns the trace identifiers whose latest record is in `state`.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError::Backend`] on a storage failure.
    fn traces_in_state(&self, state: State) -> Result<Vec<TraceId>, StateStoreError>;
}
