// crates/tga-core/src/audit.rs
// ============================================================================
// Module: Audit Sink
// Description: Observability hooks for state transitions and rejections.
// Purpose: Provide typed event notification without a hard logging dependency.
// Dependencies: crate::{identifiers, record, verifier}
// ============================================================================

//! ## Overview
//! TGA carries no `tracing`/`log` dependency; instead it exposes a thin,
//! dependency-light sink trait so deployments can plug in whatever
//! observability stack they already run, without TGA prescribing one: typed
//! event payloads, a no-op default, and a test-only in-memory sink.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Mutex;

use crate::identifiers::TraceId;
use crate::record::State;
use crate::verifier::RejectionKind;

// ============================================================================
// SECTION: Events
// ============================================================================

/// One observable event in the life of a trace.
#[derive(Debug, Clone)]
pub enum AuditEvent {
    /// A record was successfully appended, entering `to_state`.
    Transitioned {
        /// The trace this transition belongs to.
        trace_id: TraceId,
        /// The state the trace entered.
        to_state: State,
        /// The record's sequence number.
        sequence: u64,
    },
    /// A capability verification attempt was rejected.
    Rejected {
        /// The trace the rejected attempt was associated with, if known.
        trace_id: Option<TraceId>,
        /// The rejection reason.
        reason: RejectionKind,
    },
    /// Recovery resolved an orphaned or expired trace at startup.
    RecoveryResolved {
        /// The trace that was resolved.
        trace_id: TraceId,
        /// The diagnostic reason the trace was resolved with.
        reason: &'static str,
    },
}

// ============================================================================
// SECTION: Trait
// ============================================================================

/// Sink for audit events. Implementations must not block the caller for
/// longer than a metrics counter increment; this is not the durability path
/// (that is the [`crate::store::StateStore`]'s job).
pub trait AuditSink: Send + Sync {
    /// Records one audit event.
    fn record(&self, event: AuditEvent);
}

/// No-op audit sink; discards every event.
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _event: AuditEvent) {}
}

/// In-memory audit sink retaining every event, for tests.
#[derive(Default)]
pub struct VecAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl VecAuditSink {
    /// Builds an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a clone of every event recorded so far.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned, which can only happen if a
    /// prior `record` call panicked while holding the lock.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }
}

impl AuditSink for VecAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(event);
    }
}
