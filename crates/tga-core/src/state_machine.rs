// crates/tga-core/src/state_machine.rs
// ============================================================================
// Module: ExecutionStateMachine
// Description: The Moore machine driving one tool call from PENDING to a terminal state.
// Purpose: Gate every transition behind capability verification and a per-trace writer lock.
// Dependencies: crate::{audit, canonical, capability, hash_chain, identifiers, record, session_cache, store, verifier}
// ============================================================================

//! ## Overview
//! `ExecutionStateMachine` is a Moore machine: `authorize` opens a trace
//! (writing its `Pending` record) and immediately attempts the
//! `Pending -> Authorized` or `Pending -> Rejected` transition in the same
//! call, so records 1 and 2 of a trace's log both land from a single
//! `authorize` call. `dispatch`, `complete`, and `fail` drive the remaining
//! transitions. Every transition is gated by a
//! striped per-trace lock table: contention returns `TRACE_BUSY` rather than
//! queueing, and any event against a terminal trace is a no-op
//! `ALREADY_TERMINAL`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::TryLockError;

use serde_json::Map as JsonMap;
use serde_json::Value as JsonValue;

use crate::audit::AuditEvent;
use crate::audit::AuditSink;
use crate::canonical::canonicalize_serializable;
use crate::hash_chain::HashChainError;
use crate::hash_chain::LinkFields;
use crate::hash_chain::digest_bytes;
use crate::hash_chain::link;
use crate::identifiers::Digest;
use crate::identifiers::Nonce;
use crate::identifiers::TraceId;
use crate::record::ExecutionRecord;
use crate::record::State;
use crate::session_cache::SessionCache;
use crate::session_cache::SessionEntry;
use crate::store::StateStore;
use crate::store::StateStoreError;
use crate::verifier::CapabilityVerifier;
use crate::verifier::RejectionKind;
use crate::verifier::ReplaySource;
use crate::verifier::RequestContext;

/// Number of stripes in the per-trace lock table.
const LOCK_STRIPES: usize = 256;
/// Bound on append retries after a sequence/link race with another writer.
const MAX_APPEND_RETRIES: u32 = 8;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// The external outcome of a transition attempt that did not itself fail
/// the underlying capability check (that is reported inside
/// [`AuthorizeOutcome::Rejected`]).
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// The per-trace lock was already held; the caller should not queue.
    #[error("trace is busy")]
    TraceBusy,
    /// The trace has already reached a terminal state; the event is a no-op.
    #[error("trace already reached a terminal state")]
    AlreadyTerminal,
    /// The durable append failed after exhausting retries.
    #[error("state commit failed")]
    StateCommitFailed,
    /// The authorizing capability expired while the transition waited for the lock.
    #[error("capability expired before dispatch")]
    Expired,
}

// ============================================================================
// SECTION: Trace Index
// ============================================================================

#[derive(Debug, Clone)]
struct TraceIndexEntry {
    latest_state: State,
    capability_expires_at: Option<i64>,
}

// ============================================================================
// SECTION: Lock Table
// ============================================================================

struct LockTable {
    stripes: Vec<Mutex<()>>,
}

impl LockTable {
    fn new() -> Self {
        let mut stripes = Vec::with_capacity(LOCK_STRIPES);
        for _ in 0 .. LOCK_STRIPES {
            stripes.push(Mutex::new(()));
        }
        Self { stripes }
    }

    fn stripe_index(&self, trace_id: &TraceId) -> usize {
        let mut hash: u64 = 1_469_598_103_934_665_603;
        for byte in trace_id.as_str().as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(1_099_511_628_211);
        }
        (hash as usize) % self.stripes.len()
    }

    fn try_acquire(&self, trace_id: &TraceId) -> Result<std::sync::MutexGuard<'_, ()>, TransitionError> {
        let index = self.stripe_index(trace_id);
        match self.stripes[index].try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(TransitionError::TraceBusy),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        }
    }
}

// ============================================================================
// SECTION: Replay Tracking
// ============================================================================

/// Borrows both replay-tracking sets for the duration of one `verify` call.
struct ReplayGuard<'a> {
    used_capabilities: &'a HashSet<Digest>,
    used_nonces: &'a HashSet<(Digest, Nonce)>,
}

impl ReplaySource for ReplayGuard<'_> {
    fn was_used(&self, capability_hash: &Digest) -> bool {
        self.used_capabilities.contains(capability_hash)
    }

    fn nonce_seen(&self, capability_hash: &Digest, nonce: &Nonce) -> bool {
        self.used_nonces.contains(&(*capability_hash, nonce.clone()))
    }
}

// ============================================================================
// SECTION: Outcomes
// ============================================================================

/// The result of calling [`ExecutionStateMachine::authorize`].
#[derive(Debug, Clone)]
pub enum AuthorizeOutcome {
    /// The capability verified and the trace entered `Authorized`.
    Authorized {
        /// The session handle issued for fast repeat authorization.
        session_id: crate::identifiers::SessionId,
    },
    /// The capability failed verification and the trace entered `Rejected`.
    Rejected {
        /// The reason verification failed.
        reason: RejectionKind,
    },
}

// ============================================================================
// SECTION: State Machine
// ============================================================================

/// Drives one tool call through the Moore machine, persisting every
/// transition via a [`StateStore`].
pub struct ExecutionStateMachine<S: StateStore> {
    store: S,
    verifier: CapabilityVerifier,
    session_cache: Mutex<SessionCache>,
    audit: std::sync::Arc<dyn AuditSink>,
    lock_table: LockTable,
    trace_index: Mutex<HashMap<TraceId, TraceIndexEntry>>,
    used_one_shot_capabilities: Mutex<HashSet<Digest>>,
    used_nonces: Mutex<HashSet<(Digest, Nonce)>>,
}

impl<S: StateStore> ExecutionStateMachine<S> {
    /// Builds a new state machine. `trace_index` and
    /// `used_one_shot_capabilities` should be pre-populated from
    /// [`crate::recovery::Recovery`] output when resuming an existing log,
    /// and left empty for a brand-new store. `used_nonces` always starts
    /// empty: an [`ExecutionRecord`] never persists a capability's `nonce`,
    /// so nonce-freshness tracking cannot be rebuilt across a restart and is
    /// scoped to this process's lifetime.
    #[must_use]
    pub fn new(
        store: S,
        verifier: CapabilityVerifier,
        session_cache_capacity: usize,
        audit: std::sync::Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            verifier,
            session_cache: Mutex::new(SessionCache::new(session_cache_capacity)),
            audit,
            lock_table: LockTable::new(),
            trace_index: Mutex::new(HashMap::new()),
            used_one_shot_capabilities: Mutex::new(HashSet::new()),
            used_nonces: Mutex::new(HashSet::new()),
        }
    }

    /// Seeds the in-memory trace index and one-shot capability set, used by
    /// [`crate::recovery::Recovery`] to rehydrate state after a restart.
    pub fn seed_index(
        &self,
        latest_states: impl IntoIterator<Item = (TraceId, State)>,
        used_capabilities: impl IntoIterator<Item = Digest>,
    ) {
        let mut index = self.trace_index.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for (trace_id, state) in latest_states {
            index.insert(trace_id, TraceIndexEntry { latest_state: state, capability_expires_at: None });
        }
        drop(index);
        let mut used =
            self.used_one_shot_capabilities.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        used.extend(used_capabilities);
    }

    /// Opens a fresh trace and immediately attempts authorization: writes
    /// the `Pending` record, verifies the capability, then writes either
    /// the `Authorized` or `Rejected` record.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::TraceBusy`] if the trace is already
    /// in-flight, [`TransitionError::AlreadyTerminal`] if it already
    /// reached a terminal state, or [`TransitionError::StateCommitFailed`]
    /// if the durable append could not be completed.
    pub fn authorize(
        &self,
        trace_id: &TraceId,
        token_bytes: &[u8],
        tool: &crate::identifiers::ToolName,
        read_only: bool,
        input: &JsonMap<String, JsonValue>,
        now: i64,
    ) -> Result<AuthorizeOutcome, TransitionError> {
        let _guard = self.lock_table.try_acquire(trace_id)?;
        self.reject_if_already_present(trace_id)?;

        self.append_transition_with_reason(trace_id, State::Pending, Digest::EMPTY, None, None, None)?;
        self.set_trace_state(trace_id, State::Pending, None);

        let ctx = RequestContext { tool, read_only, input, now };
        let used_capabilities =
            self.used_one_shot_capabilities.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let used_nonces = self.used_nonces.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let replay = ReplayGuard { used_capabilities: &used_capabilities, used_nonces: &used_nonces };
        let verify_result = self.verifier.verify(token_bytes, &ctx, &replay);
        drop(used_nonces);
        drop(used_capabilities);

        match verify_result {
            Ok(verified) => {
                let input_hash = digest_bytes(
                    &canonicalize_serializable(input).map_err(|_| TransitionError::StateCommitFailed)?,
                );
                self.append_transition_with_reason(
                    trace_id,
                    State::Authorized,
                    verified.capability_hash,
                    Some(input_hash),
                    None,
                    None,
                )?;
                if verified.constraints.one_shot {
                    let mut used = self
                        .used_one_shot_capabilities
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    used.insert(verified.capability_hash);
                } else {
                    let mut nonces =
                        self.used_nonces.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    nonces.insert((verified.capability_hash, verified.nonce.clone()));
                }
                let payload_expires_at = parse_expires_at(&verified.canonical_payload_bytes);
                self.set_trace_state(trace_id, State::Authorized, payload_expires_at);
                let session_id = {
                    let mut cache =
                        self.session_cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    cache.insert(SessionEntry {
                        capability_hash: verified.capability_hash,
                        expires_at: payload_expires_at.unwrap_or(now),
                        trace_id_allow_list: vec![trace_id.clone()],
                    })
                };
                Ok(AuthorizeOutcome::Authorized { session_id })
            }
            Err(reason) => {
                self.append_transition_with_reason(
                    trace_id,
                    State::Rejected,
                    Digest::EMPTY,
                    None,
                    None,
                    Some(reason.as_str().to_string()),
                )?;
                self.set_trace_state(trace_id, State::Rejected, None);
                self.audit.record(AuditEvent::Rejected {
                    trace_id: Some(trace_id.clone()),
                    reason: reason.clone(),
                });
                Ok(AuthorizeOutcome::Rejected { reason })
            }
        }
    }

    /// Acquires the single-writer lock on `trace_id` and transitions
    /// `Authorized -> Executing`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::TraceBusy`] on lock contention or if the
    /// trace is not yet authorized, [`TransitionError::AlreadyTerminal`] if
    /// the trace is already terminal, or [`TransitionError::Expired`] if the
    /// authorizing capability expired while waiting for the lock.
    pub fn dispatch(&self, trace_id: &TraceId, now: i64) -> Result<(), TransitionError> {
        let _guard = self.lock_table.try_acquire(trace_id)?;
        let entry = self.require_state(trace_id, State::Authorized)?;
        if let Some(expires_at) = entry.capability_expires_at
            && now >= expires_at
        {
            self.append_transition_with_reason(
                trace_id,
                State::Failed,
                Digest::EMPTY,
                None,
                None,
                Some("CAPABILITY_EXPIRED".to_string()),
            )?;
            self.set_trace_state(trace_id, State::Failed, None);
            return Err(TransitionError::Expired);
        }
        self.append_transition_with_reason(trace_id, State::Executing, Digest::EMPTY, None, None, None)?;
        self.set_trace_state(trace_id, State::Executing, entry.capability_expires_at);
        Ok(())
    }

    /// Transitions `Executing -> Completed`, recording the output hash.
    ///
    /// # Errors
    ///
    /// See [`Self::dispatch`]; the trace must currently be `Executing`.
    pub fn complete(&self, trace_id: &TraceId, output: &JsonValue) -> Result<(), TransitionError> {
        let _guard = self.lock_table.try_acquire(trace_id)?;
        self.require_state(trace_id, State::Executing)?;
        let output_hash = digest_bytes(
            &canonicalize_serializable(output).map_err(|_| TransitionError::StateCommitFailed)?,
        );
        self.append_transition_with_reason(trace_id, State::Completed, Digest::EMPTY, None, Some(output_hash), None)?;
        self.set_trace_state(trace_id, State::Completed, None);
        Ok(())
    }

    /// Transitions `Executing -> Failed`, recording a diagnostic reason.
    ///
    /// # Errors
    ///
    /// See [`Self::dispatch`]; the trace must currently be `Executing`.
    pub fn fail(&self, trace_id: &TraceId, reason: &str) -> Result<(), TransitionError> {
        let _guard = self.lock_table.try_acquire(trace_id)?;
        self.require_state(trace_id, State::Executing)?;
        self.append_transition_with_reason(
            trace_id,
            State::Failed,
            Digest::EMPTY,
            None,
            None,
            Some(reason.to_string()),
        )?;
        self.set_trace_state(trace_id, State::Failed, None);
        Ok(())
    }

    /// Returns a reference to the underlying store, for recovery and
    /// read-only administrative queries.
    pub const fn store(&self) -> &S {
        &self.store
    }

    fn reject_if_already_present(&self, trace_id: &TraceId) -> Result<(), TransitionError> {
        let index = self.trace_index.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match index.get(trace_id) {
            None => Ok(()),
            Some(entry) if entry.latest_state.is_terminal() => Err(TransitionError::AlreadyTerminal),
            Some(_) => Err(TransitionError::TraceBusy),
        }
    }

    fn require_state(
        &self,
        trace_id: &TraceId,
        expected: State,
    ) -> Result<TraceIndexEntry, TransitionError> {
        let index = self.trace_index.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match index.get(trace_id) {
            Some(entry) if entry.latest_state == expected => Ok(entry.clone()),
            Some(entry) if entry.latest_state.is_terminal() => Err(TransitionError::AlreadyTerminal),
            _ => Err(TransitionError::TraceBusy),
        }
    }

    fn set_trace_state(&self, trace_id: &TraceId, state: State, capability_expires_at: Option<i64>) {
        let mut index = self.trace_index.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let expires_at = capability_expires_at.or_else(|| index.get(trace_id).and_then(|e| e.capability_expires_at));
        index.insert(trace_id.clone(), TraceIndexEntry { latest_state: state, capability_expires_at: expires_at });
    }

    fn append_transition_with_reason(
        &self,
        trace_id: &TraceId,
        state: State,
        capability_hash: Digest,
        input_hash: Option<Digest>,
        output_hash: Option<Digest>,
        reason: Option<String>,
    ) -> Result<(), TransitionError> {
        for _ in 0 .. MAX_APPEND_RETRIES {
            let tail = self.store.tail().map_err(|_| TransitionError::StateCommitFailed)?;
            let sequence = tail.as_ref().map_or(1, |record| record.sequence + 1);
            let prev_hash = tail.as_ref().map_or(Digest::EMPTY, |record| record.record_hash);
            let created_at = monotonic_now_nanos();
            let record_hash = link(LinkFields {
                prev_hash,
                sequence,
                trace_id: trace_id.as_str(),
                state: state.as_str(),
                capability_hash,
                input_hash,
                output_hash,
                created_at,
                reason: reason.as_deref(),
            })
            .map_err(|_: HashChainError| TransitionError::StateCommitFailed)?;
            let record = ExecutionRecord {
                sequence,
                trace_id: trace_id.clone(),
                state,
                capability_hash,
                input_hash,
                output_hash,
                prev_hash,
                record_hash,
                created_at,
                reason: reason.clone(),
            };
            match self.store.append(&record) {
                Ok(()) => {
                    self.audit.record(AuditEvent::Transitioned {
                        trace_id: trace_id.clone(),
                        to_state: state,
                        sequence,
                    });
                    return Ok(());
                }
                Err(StateStoreError::SequenceConflict { .. } | StateStoreError::HashLinkMismatch { .. }) => {
                    continue;
                }
                Err(StateStoreError::Backend(_)) => return Err(TransitionError::StateCommitFailed),
            }
        }
        Err(TransitionError::StateCommitFailed)
    }
}

/// Returns a monotonically increasing wall-clock timestamp in nanoseconds.
fn monotonic_now_nanos() -> i64 {
    use std::time::SystemTime;
    use std::time::UNIX_EPOCH;
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Extracts `expires_at` from a verified capability's canonical payload
/// bytes, for the session cache's expiry and the dispatch-time re-check.
fn parse_expires_at(canonical_payload_bytes: &[u8]) -> Option<i64> {
    let value: JsonValue = serde_json::from_slice(canonical_payload_bytes).ok()?;
    value.get("expires_at").and_then(JsonValue::as_i64)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use ed25519_dalek::Signer;
    use ed25519_dalek::SigningKey;
    use serde_json::json;

    use super::ExecutionStateMachine;
    use crate::audit::NoopAuditSink;
    use crate::capability::CapabilityHeader;
    use crate::capability::CapabilityPayload;
    use crate::identifiers::CapabilityId;
    use crate::identifiers::Nonce;
    use crate::identifiers::ToolName;
    use crate::identifiers::TraceId;
    use crate::record::ExecutionRecord;
    use crate::record::State;
    use crate::store::StateStore;
    use crate::store::StateStoreError;
    use crate::verifier::CapabilityVerifier;
    use crate::verifier::CapabilityVerifierConfig;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    #[derive(Default)]
    struct InMemoryStore {
        records: Mutex<Vec<ExecutionRecord>>,
    }

    impl StateStore for InMemoryStore {
        fn append(&self, record: &ExecutionRecord) -> Result<(), StateStoreError> {
            let mut records = self.records.lock().unwrap();
            let expected = records.last().map_or(1, |last| last.sequence + 1);
            if record.sequence != expected {
                return Err(StateStoreError::SequenceConflict { expected, actual: record.sequence });
            }
            records.push(record.clone());
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

    fn sign_token(signing_key: &SigningKey, payload: &CapabilityPayload) -> Vec<u8> {
        let header = CapabilityHeader { alg: "Ed25519".to_string(), typ: "capability".to_string() };
        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap());
        let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload).unwrap());
        let signing_input = format!("{header_b64}.{payload_b64}");
        let signature = signing_key.sign(signing_input.as_bytes());
        let sig_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());
        format!("{signing_input}.{sig_b64}").into_bytes()
    }

    fn machine(signing_key: &SigningKey) -> ExecutionStateMachine<InMemoryStore> {
        machine_with_audit(signing_key, std::sync::Arc::new(NoopAuditSink))
    }

    fn machine_with_audit(
        signing_key: &SigningKey,
        audit: std::sync::Arc<dyn crate::audit::AuditSink>,
    ) -> ExecutionStateMachine<InMemoryStore> {
        let verifier = CapabilityVerifier::new(CapabilityVerifierConfig {
            supervisor_public_key: signing_key.verifying_key(),
            audience: "tga-1".to_string(),
            clock_skew_seconds: 5,
        });
        ExecutionStateMachine::new(InMemoryStore::default(), verifier, 16, audit)
    }

    fn payload(constraints: serde_json::Value) -> CapabilityPayload {
        CapabilityPayload {
            capability_id: CapabilityId::new("cap-1"),
            issued_at: 100,
            expires_at: 10_000,
            audience: "tga-1".to_string(),
            subject: "agent-1".to_string(),
            tool: ToolName::new("fs.read"),
            constraints: constraints.as_object().unwrap().clone(),
            nonce: Nonce::new("n1"),
        }
    }

    #[test]
    fn full_happy_path_reaches_completed() {
        let signing_key = SigningKey::from_bytes(&[3_u8; 32]);
        let machine = machine(&signing_key);
        let token = sign_token(&signing_key, &payload(json!({})));
        let trace_id = TraceId::new("trace-1");
        let input = serde_json::Map::new();

        let outcome = machine
            .authorize(&trace_id, &token, &ToolName::new("fs.read"), true, &input, 200)
            .expect("authorize succeeds");
        assert!(matches!(outcome, super::AuthorizeOutcome::Authorized { .. }));

        machine.dispatch(&trace_id, 201).expect("dispatch succeeds");
        machine.complete(&trace_id, &json!({"ok": true})).expect("complete succeeds");

        let records = machine.store().load_all().unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].state, State::Pending);
        assert_eq!(records[1].state, State::Authorized);
        assert_eq!(records[2].state, State::Executing);
        assert_eq!(records[3].state, State::Completed);
        assert_eq!(crate::hash_chain::verify(&records).unwrap(), None);
    }

    #[test]
    fn rejected_capability_closes_the_trace() {
        let signing_key = SigningKey::from_bytes(&[3_u8; 32]);
        let machine = machine(&signing_key);
        let mut bad_payload = payload(json!({}));
        bad_payload.audience = "someone-else".to_string();
        let token = sign_token(&signing_key, &bad_payload);
        let trace_id = TraceId::new("trace-2");
        let input = serde_json::Map::new();

        let outcome = machine
            .authorize(&trace_id, &token, &ToolName::new("fs.read"), true, &input, 200)
            .expect("authorize resolves to a rejection, not an error");
        assert!(matches!(outcome, super::AuthorizeOutcome::Rejected { .. }));

        let dispatch_err = machine.dispatch(&trace_id, 201).unwrap_err();
        assert_eq!(dispatch_err, super::TransitionError::AlreadyTerminal);
    }

    #[test]
    fn repeated_authorize_on_the_same_trace_is_rejected() {
        let signing_key = SigningKey::from_bytes(&[3_u8; 32]);
        let machine = machine(&signing_key);
        let token = sign_token(&signing_key, &payload(json!({})));
        let trace_id = TraceId::new("trace-3");
        let input = serde_json::Map::new();

        machine.authorize(&trace_id, &token, &ToolName::new("fs.read"), true, &input, 200).unwrap();
        let second = machine.authorize(&trace_id, &token, &ToolName::new("fs.read"), true, &input, 200);
        assert!(second.is_err());
    }

    #[test]
    fn one_shot_capability_cannot_authorize_two_traces() {
        let signing_key = SigningKey::from_bytes(&[3_u8; 32]);
        let machine = machine(&signing_key);
        let token = sign_token(&signing_key, &payload(json!({"one_shot": true})));
        let input = serde_json::Map::new();

        let first =
            machine.authorize(&TraceId::new("trace-a"), &token, &ToolName::new("fs.read"), true, &input, 200).unwrap();
        assert!(matches!(first, super::AuthorizeOutcome::Authorized { .. }));

        let second =
            machine.authorize(&TraceId::new("trace-b"), &token, &ToolName::new("fs.read"), true, &input, 200).unwrap();
        assert!(matches!(second, super::AuthorizeOutcome::Rejected { .. }));
    }

    #[test]
    fn reusable_capability_rejects_a_repeated_nonce_but_accepts_a_fresh_one() {
        let signing_key = SigningKey::from_bytes(&[3_u8; 32]);
        let machine = machine(&signing_key);
        let token = sign_token(&signing_key, &payload(json!({})));
        let input = serde_json::Map::new();

        let first =
            machine.authorize(&TraceId::new("trace-a"), &token, &ToolName::new("fs.read"), true, &input, 200).unwrap();
        assert!(matches!(first, super::AuthorizeOutcome::Authorized { .. }));

        let replayed =
            machine.authorize(&TraceId::new("trace-b"), &token, &ToolName::new("fs.read"), true, &input, 200).unwrap();
        assert!(matches!(replayed, super::AuthorizeOutcome::Rejected { .. }));

        let mut fresh_payload = payload(json!({}));
        fresh_payload.nonce = Nonce::new("n2");
        let fresh_token = sign_token(&signing_key, &fresh_payload);
        let third = machine
            .authorize(&TraceId::new("trace-c"), &fresh_token, &ToolName::new("fs.read"), true, &input, 200)
            .unwrap();
        assert!(matches!(third, super::AuthorizeOutcome::Authorized { .. }));
    }

    #[test]
    fn failed_execution_is_terminal() {
        let signing_key = SigningKey::from_bytes(&[3_u8; 32]);
        let machine = machine(&signing_key);
        let token = sign_token(&signing_key, &payload(json!({})));
        let trace_id = TraceId::new("trace-4");
        let input = serde_json::Map::new();

        machine.authorize(&trace_id, &token, &ToolName::new("fs.read"), true, &input, 200).unwrap();
        machine.dispatch(&trace_id, 201).unwrap();
        machine.fail(&trace_id, "DOWNSTREAM_TIMEOUT").unwrap();

        let records = machine.store().load_all().unwrap();
        assert_eq!(records.last().unwrap().state, State::Failed);
        assert_eq!(records.last().unwrap().reason.as_deref(), Some("DOWNSTREAM_TIMEOUT"));
        assert_eq!(machine.complete(&trace_id, &json!({})).unwrap_err(), super::TransitionError::AlreadyTerminal);
    }

    #[test]
    fn audit_sink_observes_transitions_and_rejections() {
        use crate::audit::AuditEvent;
        use crate::audit::VecAuditSink;

        let signing_key = SigningKey::from_bytes(&[3_u8; 32]);
        let audit = std::sync::Arc::new(VecAuditSink::new());
        let machine = machine_with_audit(&signing_key, audit.clone());
        let token = sign_token(&signing_key, &payload(json!({})));
        let trace_id = TraceId::new("trace-5");
        let input = serde_json::Map::new();

        machine.authorize(&trace_id, &token, &ToolName::new("fs.read"), true, &input, 200).unwrap();
        machine.dispatch(&trace_id, 201).unwrap();

        let events = audit.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], AuditEvent::Transitioned { to_state: State::Pending, .. }));
        assert!(matches!(events[1], AuditEvent::Transitioned { to_state: State::Authorized, .. }));
        assert!(matches!(events[2], AuditEvent::Transitioned { to_state: State::Executing, .. }));

        let mut bad_payload = payload(json!({}));
        bad_payload.audience = "someone-else".to_string();
        let bad_token = sign_token(&signing_key, &bad_payload);
        machine
            .authorize(&TraceId::new("trace-6"), &bad_token, &ToolName::new("fs.read"), true, &input, 200)
            .unwrap();
        let events = audit.events();
        assert_eq!(events.len(), 6);
        assert!(matches!(events[3], AuditEvent::Transitioned { to_state: State::Pending, .. }));
        assert!(matches!(events[4], AuditEvent::Transitioned { to_state: State::Rejected, .. }));
        assert!(matches!(events[5], AuditEvent::Rejected { .. }));
    }
}
