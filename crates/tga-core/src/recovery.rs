// crates/tga-core/src/recovery.rs
// ============================================================================
// Module: Recovery
// Description: Startup reconciliation of the durable log against in-memory state.
// Purpose: Make every restart fail closed on a broken log and resolve orphaned traces.
// Dependencies: crate::{audit, hash_chain, identifiers, record, state_machine, store}
// ============================================================================

//! ## Overview
//! `Recovery::run` is the only place the durable log is read in full. It
//! verifies the hash chain end to end, rebuilds the per-trace latest-state
//! index, validates that every trace's recorded state path is one the Moore
//! machine could have produced, and resolves traces left non-terminal by a
//! crash: an `Executing` trace becomes `Failed` (`RECOVERED_ORPHAN`), and any
//! `Authorized` trace becomes `Failed` (`CAPABILITY_EXPIRED_DURING_RECOVERY`),
//! since a persisted record carries only `capability_hash`, never the
//! capability's `expires_at`, leaving no way to confirm it is still valid.
//! The session cache starts cold; recovery never repopulates it.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::collections::HashSet;

use crate::audit::AuditEvent;
use crate::audit::AuditSink;
use crate::hash_chain::HashChainError;
use crate::hash_chain::LinkFields;
use crate::hash_chain::link;
use crate::hash_chain::verify as verify_hash_chain;
use crate::identifiers::Digest;
use crate::identifiers::TraceId;
use crate::record::ExecutionRecord;
use crate::record::State;
use crate::store::StateStore;
use crate::store::StateStoreError;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Reasons recovery refuses to bring a log online.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// Loading the durable log failed.
    #[error("failed to load the execution log: {0}")]
    Store(#[from] StateStoreError),
    /// The hash chain verification found a break; recovery fails closed.
    #[error("hash chain is broken at sequence {sequence}: {kind}")]
    HashChainBroken {
        /// The first broken sequence number.
        sequence: u64,
        /// The kind of break, as a stable label.
        kind: &'static str,
    },
    /// A trace's recorded sequence of states is not one the state machine
    /// could have produced.
    #[error("trace {trace_id} has an invalid recorded state path")]
    InvalidStatePath {
        /// The offending trace.
        trace_id: TraceId,
    },
    /// Appending a resolution record for an orphaned trace failed.
    #[error("failed to append a recovery resolution record: {0}")]
    ResolutionFailed(StateStoreError),
    /// A resolution record could not be hashed.
    #[error("failed to hash a recovery resolution record: {0}")]
    ResolutionHash(#[from] HashChainError),
}

// ============================================================================
// SECTION: Output
// ============================================================================

/// The reconciled state produced by a successful recovery run, ready to seed
/// an [`crate::state_machine::ExecutionStateMachine`].
#[derive(Debug, Clone)]
pub struct RecoveredIndex {
    /// The latest known state of every trace in the log, after resolution.
    pub latest_states: Vec<(TraceId, State)>,
    /// Every one-shot capability identifier already used by an `Authorized` record.
    pub used_one_shot_capabilities: Vec<Digest>,
    /// The traces recovery forcibly resolved, and why.
    pub resolved: Vec<(TraceId, &'static str)>,
}

const REASON_RECOVERED_ORPHAN: &str = "RECOVERED_ORPHAN";
const REASON_CAPABILITY_EXPIRED_DURING_RECOVERY: &str = "CAPABILITY_EXPIRED_DURING_RECOVERY";

/// Valid predecessor states for each state a well-formed log may record.
/// `Pending` has no predecessor: it is always the first record for a trace.
fn valid_predecessor(state: State, predecessor: Option<State>) -> bool {
    match (predecessor, state) {
        (None, State::Pending) => true,
        (Some(State::Pending), State::Authorized | State::Rejected) => true,
        (Some(State::Authorized), State::Executing) => true,
        (Some(State::Executing), State::Completed | State::Failed) => true,
        _ => false,
    }
}

// ============================================================================
// SECTION: Recovery
// ============================================================================

/// Runs startup reconciliation against a [`StateStore`] and an
/// [`AuditSink`].
pub struct Recovery<'a, S: StateStore> {
    store: &'a S,
    audit: &'a dyn AuditSink,
}

impl<'a, S: StateStore> Recovery<'a, S> {
    /// Builds a recovery run over `store`, reporting resolutions to `audit`.
    #[must_use]
    pub const fn new(store: &'a S, audit: &'a dyn AuditSink) -> Self {
        Self { store, audit }
    }

    /// Loads the entire log, verifies its hash chain, validates every
    /// trace's recorded state path, and resolves any trace left
    /// non-terminal by a crash.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::HashChainBroken`] or
    /// [`RecoveryError::InvalidStatePath`] fail-closed; the store is left
    /// untouched in either case. Returns [`RecoveryError::Store`] or
    /// [`RecoveryError::ResolutionFailed`] on a backend failure.
    pub fn run(&self) -> Result<RecoveredIndex, RecoveryError> {
        let records = self.store.load_all()?;

        if let Some(broken) = verify_hash_chain(&records)? {
            return Err(RecoveryError::HashChainBroken {
                sequence: broken.sequence,
                kind: broken.kind.as_str(),
            });
        }

        let mut by_trace: HashMap<TraceId, Vec<&ExecutionRecord>> = HashMap::new();
        for record in &records {
            by_trace.entry(record.trace_id.clone()).or_default().push(record);
        }

        // Resolution records are appended onto the *global* log tail, not
        // onto each orphaned trace's own last record: under concurrent
        // traces, a trace orphaned at an early sequence can be followed by
        // later, unrelated records, so the next free sequence and the
        // correct `prev_hash` only ever come from whatever the tail is at
        // the moment of resolution. Traces are resolved in a fixed
        // (sorted-by-`TraceId`) order so that order is deterministic across
        // runs.
        let mut tail = records.last().map(|record| (record.sequence, record.record_hash));

        let mut trace_ids: Vec<&TraceId> = by_trace.keys().collect();
        trace_ids.sort();

        let mut latest_states = Vec::with_capacity(by_trace.len());
        let mut used_one_shot_capabilities = HashSet::new();
        let mut resolved = Vec::new();

        for trace_id in trace_ids {
            let trace_records = &by_trace[trace_id];
            let mut predecessor: Option<State> = None;
            for record in trace_records.iter() {
                if !valid_predecessor(record.state, predecessor) {
                    return Err(RecoveryError::InvalidStatePath { trace_id: trace_id.clone() });
                }
                predecessor = Some(record.state);
                if record.state == State::Authorized && record.capability_hash != Digest::EMPTY {
                    used_one_shot_capabilities.insert(record.capability_hash);
                }
            }

            let last = *trace_records.last().expect("each trace has at least one record");
            let (resolved_state, resolution_reason) = self.resolve_orphan(trace_id, last, &mut tail)?;
            if let Some(reason) = resolution_reason {
                resolved.push((trace_id.clone(), reason));
            }
            latest_states.push((trace_id.clone(), resolved_state));
        }

        let used_one_shot_capabilities: Vec<Digest> = used_one_shot_capabilities.into_iter().collect();

        Ok(RecoveredIndex { latest_states, used_one_shot_capabilities, resolved })
    }

    /// Resolves one trace left non-terminal by a crash, appending a closing
    /// record if needed, and returns its final state plus the resolution
    /// reason, if any resolution was required.
    ///
    /// An `AUTHORIZED` trace is always resolved to `FAILED` here: the
    /// persisted record carries only `capability_hash`, never the
    /// capability's `expires_at`, so recovery has no way to tell whether
    /// the authorizing capability is still temporally valid. Per the
    /// fail-closed posture, an unresolvable `AUTHORIZED` trace is treated
    /// as expired rather than silently resumed.
    fn resolve_orphan(
        &self,
        trace_id: &TraceId,
        last: &ExecutionRecord,
        tail: &mut Option<(u64, Digest)>,
    ) -> Result<(State, Option<&'static str>), RecoveryError> {
        match last.state {
            State::Executing => {
                self.append_resolution(last, State::Failed, REASON_RECOVERED_ORPHAN, tail)?;
                self.audit.record(AuditEvent::RecoveryResolved {
                    trace_id: trace_id.clone(),
                    reason: REASON_RECOVERED_ORPHAN,
                });
                Ok((State::Failed, Some(REASON_RECOVERED_ORPHAN)))
            }
            State::Authorized => {
                self.append_resolution(last, State::Failed, REASON_CAPABILITY_EXPIRED_DURING_RECOVERY, tail)?;
                self.audit.record(AuditEvent::RecoveryResolved {
                    trace_id: trace_id.clone(),
                    reason: REASON_CAPABILITY_EXPIRED_DURING_RECOVERY,
                });
                Ok((State::Failed, Some(REASON_CAPABILITY_EXPIRED_DURING_RECOVERY)))
            }
            other => Ok((other, None)),
        }
    }

    /// Appends a resolution record chained off `tail` (the global log tail
    /// as of the most recent append, not `last`'s own position in the log),
    /// then advances `tail` to the new record.
    fn append_resolution(
        &self,
        last: &ExecutionRecord,
        state: State,
        reason: &'static str,
        tail: &mut Option<(u64, Digest)>,
    ) -> Result<(), RecoveryError> {
        let (prev_sequence, prev_hash) = tail.unwrap_or((0, Digest::EMPTY));
        let sequence = prev_sequence + 1;
        let created_at = last.created_at;
        let record_hash = link(LinkFields {
            prev_hash,
            sequence,
            trace_id: last.trace_id.as_str(),
            state: state.as_str(),
            capability_hash: last.capability_hash,
            input_hash: last.input_hash,
            output_hash: None,
            created_at,
            reason: Some(reason),
        })?;
        let record = ExecutionRecord {
            sequence,
            trace_id: last.trace_id.clone(),
            state,
            capability_hash: last.capability_hash,
            input_hash: last.input_hash,
            output_hash: None,
            prev_hash,
            record_hash,
            created_at,
            reason: Some(reason.to_string()),
        };
        self.store.append(&record).map_err(RecoveryError::ResolutionFailed)?;
        *tail = Some((sequence, record_hash));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::Recovery;
    use crate::audit::NoopAuditSink;
    use crate::hash_chain::link_record;
    use crate::identifiers::Digest;
    use crate::identifiers::TraceId;
    use crate::record::ExecutionRecord;
    use crate::record::State;
    use crate::store::StateStore;
    use crate::store::StateStoreError;

    #[derive(Default)]
    struct InMemoryStore {
        records: Mutex<Vec<ExecutionRecord>>,
    }

    impl StateStore for InMemoryStore {
        fn append(&self, record: &ExecutionRecord) -> Result<(), StateStoreError> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }

        fn load_all(&self) -> Result<Vec<ExecutionRecord>, StateStoreError> {
            Ok(self.records.lock().unwrap().clone())
        }

        fn tail(&self) -> Result<Option<ExecutionRecord>, StateStoreError> {
            Ok(self.records.lock().unwrap().last().cloned())
        }

        fn traces_in_state(&self, state: State) -> Result<Vec<TraceId>, StateStoreError> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|record| record.state == state)
                .map(|record| record.trace_id.clone())
                .collect())
        }
    }

    fn push(store: &InMemoryStore, trace_id: &str, state: State, sequence: u64, prev_hash: Digest) -> Digest {
        let mut record = ExecutionRecord {
            sequence,
            trace_id: TraceId::new(trace_id),
            state,
            capability_hash: Digest::EMPTY,
            input_hash: None,
            output_hash: None,
            prev_hash,
            record_hash: Digest::EMPTY,
            created_at: 1_000 + sequence as i64,
            reason: None,
        };
        record.record_hash = link_record(&record).unwrap();
        let hash = record.record_hash;
        store.append(&record).unwrap();
        hash
    }

    #[test]
    fn recovery_resolves_an_orphaned_executing_trace_to_failed() {
        let store = InMemoryStore::default();
        let h1 = push(&store, "t1", State::Pending, 1, Digest::EMPTY);
        let h2 = push(&store, "t1", State::Authorized, 2, h1);
        let _h3 = push(&store, "t1", State::Executing, 3, h2);

        let audit = NoopAuditSink;
        let recovery = Recovery::new(&store, &audit);
        let recovered = recovery.run().expect("recovery succeeds on a well-formed chain");

        assert_eq!(recovered.latest_states, vec![(TraceId::new("t1"), State::Failed)]);
        let records = store.load_all().unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[3].state, State::Failed);
        assert_eq!(records[3].reason.as_deref(), Some("RECOVERED_ORPHAN"));
    }

    #[test]
    fn recovery_leaves_completed_traces_untouched() {
        let store = InMemoryStore::default();
        let h1 = push(&store, "t1", State::Pending, 1, Digest::EMPTY);
        let h2 = push(&store, "t1", State::Authorized, 2, h1);
        let h3 = push(&store, "t1", State::Executing, 3, h2);
        let _h4 = push(&store, "t1", State::Completed, 4, h3);

        let audit = NoopAuditSink;
        let recovery = Recovery::new(&store, &audit);
        let recovered = recovery.run().unwrap();

        assert_eq!(recovered.latest_states, vec![(TraceId::new("t1"), State::Completed)]);
        assert_eq!(store.load_all().unwrap().len(), 4);
        assert!(recovered.resolved.is_empty());
    }

    #[test]
    fn recovery_fails_closed_on_a_broken_hash_chain() {
        let store = InMemoryStore::default();
        let _h1 = push(&store, "t1", State::Pending, 1, Digest::EMPTY);
        {
            let mut records = store.records.lock().unwrap();
            records[0].record_hash = Digest::from_bytes([1_u8; 32]);
        }

        let audit = NoopAuditSink;
        let recovery = Recovery::new(&store, &audit);
        let err = recovery.run().unwrap_err();
        assert!(matches!(err, super::RecoveryError::HashChainBroken { .. }));
    }

    #[test]
    fn recovery_fails_closed_on_an_invalid_state_path() {
        let store = InMemoryStore::default();
        let h1 = push(&store, "t1", State::Pending, 1, Digest::EMPTY);
        let _h2 = push(&store, "t1", State::Executing, 2, h1);

        let audit = NoopAuditSink;
        let recovery = Recovery::new(&store, &audit);
        let err = recovery.run().unwrap_err();
        assert!(matches!(err, super::RecoveryError::InvalidStatePath { .. }));
    }

    #[test]
    fn recovery_resolves_an_orphan_behind_a_later_completed_trace() {
        // Trace "a" is orphaned in `Executing` at sequence 3, but trace "b"
        // ran to completion afterwards, leaving "a" behind the global tail.
        let store = InMemoryStore::default();
        let a1 = push(&store, "a", State::Pending, 1, Digest::EMPTY);
        let a2 = push(&store, "a", State::Authorized, 2, a1);
        let a3 = push(&store, "a", State::Executing, 3, a2);
        let b1 = push(&store, "b", State::Pending, 4, a3);
        let b2 = push(&store, "b", State::Authorized, 5, b1);
        let b3 = push(&store, "b", State::Executing, 6, b2);
        let _b4 = push(&store, "b", State::Completed, 7, b3);

        let audit = NoopAuditSink;
        let recovery = Recovery::new(&store, &audit);
        let recovered = recovery.run().expect("recovery succeeds on a well-formed chain");

        assert_eq!(
            recovered.latest_states,
            vec![(TraceId::new("a"), State::Failed), (TraceId::new("b"), State::Completed)]
        );

        let records = store.load_all().unwrap();
        assert_eq!(records.len(), 8);
        let resolution = &records[7];
        assert_eq!(resolution.sequence, 8);
        assert_eq!(resolution.trace_id, TraceId::new("a"));
        assert_eq!(resolution.state, State::Failed);
        assert_eq!(resolution.prev_hash, records[6].record_hash);
        assert_eq!(crate::hash_chain::verify(&records).unwrap(), None);
    }

    #[test]
    fn recovery_reports_each_resolution_through_the_audit_sink() {
        use crate::audit::AuditEvent;
        use crate::audit::VecAuditSink;

        let store = InMemoryStore::default();
        let h1 = push(&store, "t1", State::Pending, 1, Digest::EMPTY);
        let h2 = push(&store, "t1", State::Authorized, 2, h1);
        let _h3 = push(&store, "t1", State::Executing, 3, h2);

        let audit = VecAuditSink::new();
        let recovery = Recovery::new(&store, &audit);
        recovery.run().expect("recovery succeeds on a well-formed chain");

        let events = audit.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            AuditEvent::RecoveryResolved { trace_id, reason: "RECOVERED_ORPHAN" }
                if *trace_id == TraceId::new("t1")
        ));
    }
}
