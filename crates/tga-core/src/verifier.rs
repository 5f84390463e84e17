// crates/tga-core/src/verifier.rs
// ============================================================================
// Module: CapabilityVerifier
// Description: Cryptographic verification and constraint evaluation for capability tokens.
// Purpose: Decide, in a fixed order, whether a capability authorizes one tool call.
// Dependencies: crate::{capability, canonical, hash_chain, identifiers}, ed25519-dalek, subtle
// ============================================================================

//! ## Overview
//! `CapabilityVerifier::verify` runs the ordered checks from the governing
//! design: structural parse, signature, audience, temporal window, tool
//! match, constraint evaluation, replay — first failure wins. The Supervisor
//! public key is threaded through an explicit [`CapabilityVerifierConfig`]
//! constructed once at startup; there is no process-wide mutable key slot.

// ============================================================================
// SECTION: Imports
// ============================================================================

use ed25519_dalek::Signature;
use ed25519_dalek::Verifier;
use ed25519_dalek::VerifyingKey;
use serde_json::Value as JsonValue;
use subtle::ConstantTimeEq;

use crate::canonical::CanonicalError;
use crate::canonical::canonicalize_serializable;
use crate::capability::ParseError;
use crate::capability::ParsedToken;
use crate::capability::parse;
use crate::hash_chain::digest_bytes;
use crate::identifiers::CapabilityId;
use crate::identifiers::Digest;
use crate::identifiers::Nonce;
use crate::identifiers::ToolName;

/// Default clock skew tolerance applied to `issued_at`, in seconds.
pub const DEFAULT_CLOCK_SKEW_SECONDS: i64 = 5;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Explicit configuration for one [`CapabilityVerifier`] instance.
///
/// # Invariants
/// - Constructed once at startup; never mutated in place. Key rotation
///   replaces the whole verifier (and flushes the session cache), it does
///   not mutate this struct's key in place.
#[derive(Clone)]
pub struct CapabilityVerifierConfig {
    /// The Supervisor's Ed25519 public key.
    pub supervisor_public_key: VerifyingKey,
    /// TGA's own configured identity; must equal every token's `audience`.
    pub audience: String,
    /// Clock skew tolerance applied to the lower bound of the temporal window.
    pub clock_skew_seconds: i64,
}

// ============================================================================
// SECTION: Rejection
// ============================================================================

/// Sub-reason for an `UNAUTHORIZED` rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnauthorizedReason {
    /// The envelope failed to parse or named an unsupported algorithm.
    Malformed,
    /// Ed25519 signature verification failed.
    BadSignature,
    /// `audience` did not match TGA's configured identity.
    Audience,
    /// `tool` did not match the request context's tool.
    ToolMismatch,
    /// A constraint key was not recognized.
    UnknownConstraint(String),
    /// A recognized constraint was evaluated and not satisfied.
    ConstraintViolation(String),
}

impl UnauthorizedReason {
    /// Returns the stable external sub-reason label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "MALFORMED",
            Self::BadSignature => "BAD_SIGNATURE",
            Self::Audience => "AUDIENCE",
            Self::ToolMismatch => "TOOL_MISMATCH",
            Self::UnknownConstraint(_) => "UNKNOWN_CONSTRAINT",
            Self::ConstraintViolation(_) => "CONSTRAINT_VIOLATION",
        }
    }
}

/// The reason a capability verification failed, naming the external error
/// codes from the external interface surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionKind {
    /// Structural, cryptographic, or access-scope failure.
    Unauthorized(UnauthorizedReason),
    /// `now >= expires_at`.
    Expired,
    /// `now < issued_at - skew`.
    NotYetValid,
    /// A one-shot capability's `capability_id` already appears on a prior
    /// record, or a non-one-shot capability's `nonce` was already consumed.
    Replay,
}

impl RejectionKind {
    /// Returns the stable external error code for this rejection.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Expired => "EXPIRED",
            Self::NotYetValid => "NOT_YET_VALID",
            Self::Replay => "REPLAY",
        }
    }
}

// ============================================================================
// SECTION: Constraints
// ============================================================================

/// The constraints evaluated for one verified capability.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EvaluatedConstraints {
    /// Whether the request must be marked read-only by the caller.
    pub read_only: bool,
    /// Maximum canonicalized input size in bytes, if constrained.
    pub max_input_bytes: Option<u64>,
    /// Allowed top-level input keys, if constrained.
    pub allow_input_keys: Option<Vec<String>>,
    /// Denied top-level input keys, if constrained.
    pub deny_input_keys: Option<Vec<String>>,
    /// Whether this capability authorizes at most one `Authorized` transition.
    pub one_shot: bool,
}

const RECOGNIZED_CONSTRAINT_KEYS: &[&str] =
    &["read_only", "max_input_bytes", "allow_input_keys", "deny_input_keys", "one_shot"];

fn evaluate_constraints(
    raw: &serde_json::Map<String, JsonValue>,
) -> Result<EvaluatedConstraints, UnauthorizedReason> {
    for key in raw.keys() {
        if !RECOGNIZED_CONSTRAINT_KEYS.contains(&key.as_str()) {
            return Err(UnauthorizedReason::UnknownConstraint(key.clone()));
        }
    }
    let read_only = raw.get("read_only").and_then(JsonValue::as_bool).unwrap_or(false);
    let one_shot = raw.get("one_shot").and_then(JsonValue::as_bool).unwrap_or(false);
    let max_input_bytes = raw.get("max_input_bytes").and_then(JsonValue::as_u64);
    let allow_input_keys = raw.get("allow_input_keys").and_then(|value| {
        value.as_array().map(|items| {
            items.iter().filter_map(|item| item.as_str().map(str::to_string)).collect()
        })
    });
    let deny_input_keys = raw.get("deny_input_keys").and_then(|value| {
        value.as_array().map(|items| {
            items.iter().filter_map(|item| item.as_str().map(str::to_string)).collect()
        })
    });
    Ok(EvaluatedConstraints { read_only, max_input_bytes, allow_input_keys, deny_input_keys, one_shot })
}

// ============================================================================
// SECTION: Request Context
// ============================================================================

/// The caller-supplied context for one verification attempt.
#[derive(Debug, Clone)]
pub struct RequestContext<'a> {
    /// The tool the caller is about to invoke.
    pub tool: &'a ToolName,
    /// Whether the caller has marked this invocation read-only.
    pub read_only: bool,
    /// The tool input, as top-level JSON object keys (for allow/deny checks)
    /// plus its canonicalized byte length (for `max_input_bytes`).
    pub input: &'a serde_json::Map<String, JsonValue>,
    /// The current time, unix seconds.
    pub now: i64,
}

/// A source of prior capability usage, consulted for the replay check.
///
/// Keyed by `capability_hash` rather than `capability_id`: an
/// [`ExecutionRecord`](crate::record::ExecutionRecord) persists only the
/// hash of a capability's canonical payload, never its raw identifier, so
/// recovery can only rebuild this set from `capability_hash`.
///
/// Implemented by the execution log in production; a fixed set is
/// sufficient for tests.
pub trait ReplaySource {
    /// Returns whether a capability with this `capability_hash` already
    /// authorized a prior record.
    fn was_used(&self, capability_hash: &Digest) -> bool;

    /// Returns whether `nonce` was already consumed by a prior successful
    /// verification of the same `capability_hash`.
    ///
    /// Checked only for non-one-shot capabilities (one-shot capabilities are
    /// already fully blocked from reuse via [`Self::was_used`]): a reusable
    /// capability may authorize many traces over its lifetime, but each
    /// individual authorization must carry a nonce no prior authorization
    /// under that same capability has presented, so a captured wire message
    /// cannot be replayed verbatim. Defaults to `false` for sources that
    /// only track one-shot capability hashes and keep no nonce history.
    fn nonce_seen(&self, capability_hash: &Digest, nonce: &Nonce) -> bool {
        let _ = (capability_hash, nonce);
        false
    }
}

impl ReplaySource for std::collections::HashSet<Digest> {
    fn was_used(&self, capability_hash: &Digest) -> bool {
        self.contains(capability_hash)
    }
}

// ============================================================================
// SECTION: Verified Capability
// ============================================================================

/// The output of a successful verification.
#[derive(Debug, Clone)]
pub struct VerifiedCapability {
    /// The raw canonical payload bytes, as they appeared on the wire.
    pub canonical_payload_bytes: Vec<u8>,
    /// SHA-256 of the canonical payload bytes.
    pub capability_hash: Digest,
    /// The capability's own identifier.
    pub capability_id: CapabilityId,
    /// The capability's nonce, for the caller to record as seen once this
    /// verification is acted on.
    pub nonce: Nonce,
    /// The constraints evaluated from this capability's payload.
    pub constraints: EvaluatedConstraints,
}

// ============================================================================
// SECTION: Verifier
// ============================================================================

/// Verifies capability tokens against one configured Supervisor key.
pub struct CapabilityVerifier {
    config: CapabilityVerifierConfig,
}

impl CapabilityVerifier {
    /// Builds a verifier from an explicit configuration.
    #[must_use]
    pub const fn new(config: CapabilityVerifierConfig) -> Self {
        Self { config }
    }

    /// Runs the ordered verification checks against one token.
    ///
    /// # Errors
    ///
    /// Returns the first [`RejectionKind`] encountered, per the fixed check
    /// order: structural parse, signature, audience, temporal window, tool
    /// match, constraints, replay.
    pub fn verify(
        &self,
        token_bytes: &[u8],
        ctx: &RequestContext<'_>,
        replay: &dyn ReplaySource,
    ) -> Result<VerifiedCapability, RejectionKind> {
        let parsed = parse_structurally(token_bytes)?;

        verify_signature(&self.config.supervisor_public_key, &parsed)?;

        if !constant_time_str_eq(&parsed.payload.audience, &self.config.audience) {
            return Err(RejectionKind::Unauthorized(UnauthorizedReason::Audience));
        }

        check_temporal_window(&parsed, ctx.now, self.config.clock_skew_seconds)?;

        if !tool_matches(&parsed.payload.tool, ctx.tool) {
            return Err(RejectionKind::Unauthorized(UnauthorizedReason::ToolMismatch));
        }

        let constraints = evaluate_constraints(&parsed.payload.constraints)
            .map_err(RejectionKind::Unauthorized)?;

        check_constraints(&constraints, ctx)?;

        let capability_hash = digest_bytes(&parsed.canonical_payload_bytes);

        if constraints.one_shot {
            if replay.was_used(&capability_hash) {
                return Err(RejectionKind::Replay);
            }
        } else if replay.nonce_seen(&capability_hash, &parsed.payload.nonce) {
            return Err(RejectionKind::Replay);
        }

        Ok(VerifiedCapability {
            canonical_payload_bytes: parsed.canonical_payload_bytes,
            capability_hash,
            capability_id: parsed.payload.capability_id.clone(),
            nonce: parsed.payload.nonce.clone(),
            constraints,
        })
    }
}

fn parse_structurally(token_bytes: &[u8]) -> Result<ParsedToken, RejectionKind> {
    let parsed = parse(token_bytes).map_err(|err: ParseError| {
        let _ = err;
        RejectionKind::Unauthorized(UnauthorizedReason::Malformed)
    })?;
    if !parsed.header.is_supported() {
        return Err(RejectionKind::Unauthorized(UnauthorizedReason::Malformed));
    }
    Ok(parsed)
}

fn verify_signature(
    public_key: &VerifyingKey,
    parsed: &ParsedToken,
) -> Result<(), RejectionKind> {
    let signature_bytes: [u8; 64] = parsed
        .signature_bytes
        .as_slice()
        .try_into()
        .map_err(|_| RejectionKind::Unauthorized(UnauthorizedReason::BadSignature))?;
    let signature = Signature::from_bytes(&signature_bytes);
    public_key
        .verify(&parsed.signing_input, &signature)
        .map_err(|_| RejectionKind::Unauthorized(UnauthorizedReason::BadSignature))
}

fn check_temporal_window(
    parsed: &ParsedToken,
    now: i64,
    skew_seconds: i64,
) -> Result<(), RejectionKind> {
    let lower_bound = parsed.payload.issued_at.saturating_sub(skew_seconds);
    if now < lower_bound {
        return Err(RejectionKind::NotYetValid);
    }
    if now >= parsed.payload.expires_at {
        return Err(RejectionKind::Expired);
    }
    Ok(())
}

/// Matches `pattern` (the token's `tool`) against `requested`, allowing
/// exactly one dot-separated segment of `pattern` to be the wildcard `*`.
fn tool_matches(pattern: &ToolName, requested: &ToolName) -> bool {
    let pattern_segments: Vec<&str> = pattern.as_str().split('.').collect();
    let requested_segments: Vec<&str> = requested.as_str().split('.').collect();
    if pattern_segments.len() != requested_segments.len() {
        return false;
    }
    pattern_segments
        .iter()
        .zip(requested_segments.iter())
        .all(|(pattern_seg, requested_seg)| *pattern_seg == "*" || pattern_seg == requested_seg)
}

fn check_constraints(
    constraints: &EvaluatedConstraints,
    ctx: &RequestContext<'_>,
) -> Result<(), RejectionKind> {
    if constraints.read_only && !ctx.read_only {
        return Err(RejectionKind::Unauthorized(UnauthorizedReason::ConstraintViolation(
            "read_only".to_string(),
        )));
    }
    if let Some(max_bytes) = constraints.max_input_bytes {
        let size = canonical_input_size(ctx.input).map_err(|_| {
            RejectionKind::Unauthorized(UnauthorizedReason::ConstraintViolation(
                "max_input_bytes".to_string(),
            ))
        })?;
        if size > max_bytes {
            return Err(RejectionKind::Unauthorized(UnauthorizedReason::ConstraintViolation(
                "max_input_bytes".to_string(),
            )));
        }
    }
    if let Some(allowed) = &constraints.allow_input_keys
        && !ctx.input.keys().all(|key| allowed.contains(key))
    {
        return Err(RejectionKind::Unauthorized(UnauthorizedReason::ConstraintViolation(
            "allow_input_keys".to_string(),
        )));
    }
    if let Some(denied) = &constraints.deny_input_keys
        && ctx.input.keys().any(|key| denied.contains(key))
    {
        return Err(RejectionKind::Unauthorized(UnauthorizedReason::ConstraintViolation(
            "deny_input_keys".to_string(),
        )));
    }
    Ok(())
}

fn canonical_input_size(
    input: &serde_json::Map<String, JsonValue>,
) -> Result<u64, CanonicalError> {
    let bytes = canonicalize_serializable(input)?;
    Ok(u64::try_from(bytes.len()).unwrap_or(u64::MAX))
}

fn constant_time_str_eq(left: &str, right: &str) -> bool {
    left.len() == right.len() && left.as_bytes().ct_eq(right.as_bytes()).into()
}
