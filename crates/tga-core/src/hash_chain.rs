// crates/tga-core/src/hash_chain.rs
// ============================================================================
// Module: HashChain
// Description: Per-record digests binding each execution record to its predecessor.
// Purpose: Compute and verify the tamper-evident hash chain over the execution log.
// Dependencies: crate::{canonical, identifiers, record}, sha2
// ============================================================================

//! ## Overview
//! `HashChain` is the cryptographic spine of the execution log: `link`
//! computes a record's `record_hash` from its fields per (I2), and `verify`
//! walks an entire ordered log checking (I1)-(I3), returning the first
//! broken sequence number and the kind of break. Digests are raw bytes
//! internally and base64url (no padding) when surfaced externally — see
//! [`crate::identifiers::Digest`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use sha2::Digest as _;
use sha2::Sha256;

use crate::canonical::CanonicalError;
use crate::canonical::Value;
use crate::canonical::canonicalize;
use crate::identifiers::Digest;
use crate::record::ExecutionRecord;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// The way a hash chain verification can fail, per (I1)-(I3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokenKind {
    /// `record_hash` does not match the recomputed hash of the record's fields.
    HashMismatch,
    /// `sequence` values are not gap-free starting from 1.
    SequenceGap,
    /// `prev_hash` does not equal the predecessor's `record_hash`.
    PrevLinkMismatch,
}

impl BrokenKind {
    /// Returns the stable external label for this break kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HashMismatch => "HASH_MISMATCH",
            Self::SequenceGap => "SEQUENCE_GAP",
            Self::PrevLinkMismatch => "PREV_LINK_MISMATCH",
        }
    }
}

/// Errors raised while computing a digest or a link hash.
#[derive(Debug, thiserror::Error)]
pub enum HashChainError {
    /// The record's fields fell outside the canonicalization domain.
    #[error("record fields are not canonicalizable: {0}")]
    Canonical(#[from] CanonicalError),
}

/// The outcome of verifying a hash chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokenAt {
    /// The first sequence number at which the chain is broken.
    pub sequence: u64,
    /// The kind of break detected.
    pub kind: BrokenKind,
}

// ============================================================================
// SECTION: Digest
// ============================================================================

/// Computes the SHA-256 digest of canonicalized structured data.
#[must_use]
pub fn digest(value: &Value) -> Result<Digest, HashChainError> {
    let bytes = canonicalize(value)?;
    Ok(digest_bytes(&bytes))
}

/// Computes the SHA-256 digest of raw bytes directly (no canonicalization).
#[must_use]
pub fn digest_bytes(bytes: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let out = hasher.finalize();
    Digest::from_bytes(out.into())
}

// ============================================================================
// SECTION: Link
// ============================================================================

/// The fields covered by `record_hash`, per (I2), excluding `record_hash` itself.
#[derive(Debug, Clone, Copy)]
pub struct LinkFields<'a> {
    /// Predecessor's `record_hash`, or [`Digest::EMPTY`] for sequence 1.
    pub prev_hash: Digest,
    /// This record's sequence number.
    pub sequence: u64,
    /// This record's trace identifier, as a string.
    pub trace_id: &'a str,
    /// This record's persisted state string.
    pub state: &'a str,
    /// This record's capability hash.
    pub capability_hash: Digest,
    /// This record's input hash, if any.
    pub input_hash: Option<Digest>,
    /// This record's output hash, if any.
    pub output_hash: Option<Digest>,
    /// This record's creation timestamp.
    pub created_at: i64,
    /// This record's diagnostic reason, if any.
    pub reason: Option<&'a str>,
}

/// Computes `record_hash` for a set of link fields, per (I2):
/// `record_hash == SHA256(canonical(prev_hash ‖ sequence ‖ trace_id ‖ state ‖
/// capability_hash ‖ input_hash ‖ output_hash ‖ created_at ‖ reason))`.
///
/// # Errors
///
/// Returns [`HashChainError::Canonical`] if any field falls outside the
/// canonicalization domain (cannot occur for well-formed records, since every
/// field here is already a string, digest, or bounded integer).
pub fn link(fields: LinkFields<'_>) -> Result<Digest, HashChainError> {
    let value = Value::map([
        ("prev_hash".to_string(), Value::Str(fields.prev_hash.to_base64url())),
        ("sequence".to_string(), Value::Int(i64::try_from(fields.sequence).unwrap_or(i64::MAX))),
        ("trace_id".to_string(), Value::Str(fields.trace_id.to_string())),
        ("state".to_string(), Value::Str(fields.state.to_string())),
        ("capability_hash".to_string(), Value::Str(fields.capability_hash.to_base64url())),
        (
            "input_hash".to_string(),
            fields.input_hash.map_or(Value::Null, |digest| Value::Str(digest.to_base64url())),
        ),
        (
            "output_hash".to_string(),
            fields.output_hash.map_or(Value::Null, |digest| Value::Str(digest.to_base64url())),
        ),
        ("created_at".to_string(), Value::Int(fields.created_at)),
        (
            "reason".to_string(),
            fields.reason.map_or(Value::Null, |reason| Value::Str(reason.to_string())),
        ),
    ]);
    digest(&value)
}

/// Computes `link` directly from an [`ExecutionRecord`]'s fields.
///
/// # Errors
///
/// See [`link`].
pub fn link_record(record: &ExecutionRecord) -> Result<Digest, HashChainError> {
    link(LinkFields {
        prev_hash: record.prev_hash,
        sequence: record.sequence,
        trace_id: record.trace_id.as_str(),
        state: record.state.as_str(),
        capability_hash: record.capability_hash,
        input_hash: record.input_hash,
        output_hash: record.output_hash,
        created_at: record.created_at,
        reason: record.reason.as_deref(),
    })
}

// ============================================================================
// SECTION: Verify
// ============================================================================

/// Verifies an ordered slice of records against (I1)-(I3), returning the
/// first broken position, if any.
///
/// # Errors
///
/// Returns [`HashChainError`] only if a record's fields cannot be
/// canonicalized; integrity breaks are reported via the `Ok(Some(..))` arm,
/// not as an `Err`, since a broken chain is an expected, handled condition.
pub fn verify(records: &[ExecutionRecord]) -> Result<Option<BrokenAt>, HashChainError> {
    let mut expected_prev = Digest::EMPTY;
    for (index, record) in records.iter().enumerate() {
        let expected_sequence = u64::try_from(index).unwrap_or(u64::MAX) + 1;
        if record.sequence != expected_sequence {
            return Ok(Some(BrokenAt { sequence: expected_sequence, kind: BrokenKind::SequenceGap }));
        }
        if record.prev_hash != expected_prev {
            return Ok(Some(BrokenAt {
                sequence: record.sequence,
                kind: BrokenKind::PrevLinkMismatch,
            }));
        }
        let recomputed = link_record(record)?;
        if recomputed != record.record_hash {
            return Ok(Some(BrokenAt { sequence: record.sequence, kind: BrokenKind::HashMismatch }));
        }
        expected_prev = record.record_hash;
    }
    Ok(None)
}
