// crates/tga-core/src/record.rs
// ============================================================================
// Module: Execution Record
// Description: The atomic, append-only unit of the tamper-evident log.
// Purpose: Represent one state-machine transition as a durable, hash-linked record.
// Dependencies: crate::identifiers, serde
// ============================================================================

//! ## Overview
//! An [`ExecutionRecord`] is written exactly once and never mutated. Every
//! record belongs to exactly one `trace_id` and carries the hash chain that
//! binds it to its predecessor. `State` is a closed tagged variant; string
//! encoding exists only for persistence, never as the in-memory representation.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::identifiers::Digest;
use crate::identifiers::TraceId;

// ============================================================================
// SECTION: State
// ============================================================================

/// The six states of the execution state machine.
///
/// # Invariants
/// - `is_terminal` classifies `Completed`, `Rejected`, `Failed`; all other
///   variants are non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    /// Initial state: a trace has been opened but not yet authorized.
    Pending,
    /// The capability and constraints were verified for this trace.
    Authorized,
    /// The single-writer lock was acquired and the tool call is dispatched.
    Executing,
    /// The tool call finished successfully.
    Completed,
    /// Authorization failed; the trace is closed.
    Rejected,
    /// The tool call finished unsuccessfully.
    Failed,
}

impl State {
    /// Returns whether this state closes the trace to further writes.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Failed)
    }

    /// Returns the stable persisted string form of this state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Authorized => "AUTHORIZED",
            Self::Executing => "EXECUTING",
            Self::Completed => "COMPLETED",
            Self::Rejected => "REJECTED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a persisted state string does not match a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized persisted state: {0}")]
pub struct UnknownStateError(String);

impl FromStr for State {
    type Err = UnknownStateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PENDING" => Ok(Self::Pending),
            "AUTHORIZED" => Ok(Self::Authorized),
            "EXECUTING" => Ok(Self::Executing),
            "COMPLETED" => Ok(Self::Completed),
            "REJECTED" => Ok(Self::Rejected),
            "FAILED" => Ok(Self::Failed),
            other => Err(UnknownStateError(other.to_string())),
        }
    }
}

// ============================================================================
// SECTION: Execution Record
// ============================================================================

/// One atomic, hash-linked entry in the append-only execution log.
///
/// # Invariants
/// - `sequence` is 1-based and gap-free across the whole log (I1).
/// - `record_hash` covers every other field including `prev_hash` (I2).
/// - `prev_hash` equals the predecessor's `record_hash`, or 32 zero bytes for
///   `sequence == 1` (I3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Strictly monotonic, gap-free position of this record in the log.
    pub sequence: u64,
    /// Identifier grouping all records belonging to one logical tool call.
    pub trace_id: TraceId,
    /// The state this record transitions the trace into.
    pub state: State,
    /// SHA-256 of the canonicalized capability payload, or [`Digest::EMPTY`].
    pub capability_hash: Digest,
    /// SHA-256 of the canonicalized tool input; `None` until `Authorized`.
    pub input_hash: Option<Digest>,
    /// SHA-256 of the canonicalized tool output; `None` until `Completed`.
    pub output_hash: Option<Digest>,
    /// SHA-256 of the predecessor's `record_hash`, or [`Digest::EMPTY`] for sequence 1.
    pub prev_hash: Digest,
    /// SHA-256 over the canonicalization of every preceding field.
    pub record_hash: Digest,
    /// Wall-clock creation timestamp, nanoseconds since the Unix epoch.
    pub created_at: i64,
    /// Optional short diagnostic code, populated on `Rejected`/`Failed`.
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::State;

    #[test]
    fn terminal_states_are_exactly_the_three_named() {
        assert!(State::Completed.is_terminal());
        assert!(State::Rejected.is_terminal());
        assert!(State::Failed.is_terminal());
        assert!(!State::Pending.is_terminal());
        assert!(!State::Authorized.is_terminal());
        assert!(!State::Executing.is_terminal());
    }

    #[test]
    fn state_string_round_trips() {
        for state in
            [State::Pending, State::Authorized, State::Executing, State::Completed, State::Rejected, State::Failed]
        {
            let parsed: State = state.as_str().parse().expect("known state string parses");
            assert_eq!(parsed, state);
        }
    }
}
