// crates/tga-core/src/lib.rs
// ============================================================================
// Crate: tga-core
// Description: Core governance primitives for the Talos Governance Agent.
// Purpose: Canonicalization, hash-chained audit log records, capability
//          verification, the execution state machine, and crash recovery.
// ============================================================================

//! ## Overview
//! `tga-core` is backend-agnostic: it defines the [`store::StateStore`]
//! contract and drives it, but owns no I/O itself. A durable adapter (such
//! as a `SQLite`-backed store) lives in a sibling crate and is wired in by
//! the caller.
//!
//! The modules below mirror the component boundaries of the execution
//! governance pipeline: identifiers and canonical encoding are the
//! foundation; the hash chain and execution record make the log
//! tamper-evident; the capability verifier is the trust boundary; the
//! session cache and state machine drive trace lifecycle; recovery rebuilds
//! in-memory state from the durable log at startup.

#![warn(missing_docs)]

/// Typed identifiers (`TraceId`, `CapabilityId`, `ToolName`, `SessionId`, `Digest`).
pub mod identifiers;

/// RFC 8785-style canonical JSON encoding used everywhere a digest is taken.
pub mod canonical;

/// The durable, hash-chained execution record and its `State` enum.
pub mod record;

/// Hash-chain linking and verification (invariants I1-I3).
pub mod hash_chain;

/// Ed25519 capability tokens: parsing and claim structure.
pub mod capability;

/// Capability verification: signature, audience, expiry, and replay checks.
pub mod verifier;

/// Bounded in-memory cache of live sessions.
pub mod session_cache;

/// Backend-agnostic contract for the durable append-only execution log.
pub mod store;

/// Observability hooks for state transitions and rejections.
pub mod audit;

/// The `ExecutionStateMachine` driving trace lifecycle transitions.
pub mod state_machine;

/// Startup recovery: hash-chain verification and orphan resolution.
pub mod recovery;

pub use audit::{AuditEvent, AuditSink, NoopAuditSink, VecAuditSink};
pub use capability::{CapabilityHeader, CapabilityPayload, ParseError, ParsedToken};
pub use hash_chain::{BrokenAt, BrokenKind, HashChainError, LinkFields};
pub use identifiers::{CapabilityId, Digest, Nonce, SessionId, ToolName, TraceId};
pub use record::{ExecutionRecord, State};
pub use recovery::{Recovery, RecoveryError, RecoveredIndex};
pub use session_cache::SessionCache;
pub use state_machine::{AuthorizeOutcome, ExecutionStateMachine, TransitionError};
pub use store::{StateStore, StateStoreError};
pub use verifier::{
    CapabilityVerifier, CapabilityVerifierConfig, RejectionKind, ReplaySource, UnauthorizedReason,
    VerifiedCapability,
};
