// crates/tga-core/src/capability.rs
// ============================================================================
// Module: Capability Token
// Description: Wire format and payload shape for Supervisor-signed capabilities.
// Purpose: Parse the detached-signature envelope without performing verification.
// Dependencies: crate::identifiers, serde, serde_json, base64
// ============================================================================

//! ## Overview
//! A capability token is a detached-signature envelope:
//! `<base64url(header)>.<base64url(canonical_payload)>.<base64url(signature)>`.
//! This module only parses the envelope into its constituent parts; signature
//! verification, temporal checks, and constraint evaluation live in
//! [`crate::verifier`]. Keeping parsing separate from verification lets the
//! verifier's ordered checks (§4.4) treat "does not parse" as the first,
//! cheapest failure mode.

// ============================================================================
// SECTION: Imports
// ============================================================================

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map as JsonMap;
use serde_json::Value as JsonValue;

use crate::identifiers::CapabilityId;
use crate::identifiers::Nonce;
use crate::identifiers::ToolName;

/// The only algorithm identifier TGA accepts. No fallback is attempted for
/// any other value; a mismatch here is a structural parse failure.
pub const REQUIRED_ALG: &str = "Ed25519";
/// The only token type identifier TGA accepts.
pub const REQUIRED_TYP: &str = "capability";

// ============================================================================
// SECTION: Header
// ============================================================================

/// The unsigned header segment of a capability token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityHeader {
    /// Signature algorithm; must be exactly `"Ed25519"`.
    pub alg: String,
    /// Token type; must be exactly `"capability"`.
    pub typ: String,
}

impl CapabilityHeader {
    /// Returns whether this header names the single algorithm TGA accepts.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.alg == REQUIRED_ALG && self.typ == REQUIRED_TYP
    }
}

// ============================================================================
// SECTION: Payload
// ============================================================================

/// The signed payload segment of a capability token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityPayload {
    /// Opaque unique identifier for this capability.
    pub capability_id: CapabilityId,
    /// Issuance time, unix seconds.
    pub issued_at: i64,
    /// Expiry time, unix seconds; the window's exclusive upper bound.
    pub expires_at: i64,
    /// Must equal TGA's configured identity.
    pub audience: String,
    /// The agent identity this capability was delegated to.
    pub subject: String,
    /// Fully qualified tool name or single-segment wildcard.
    pub tool: ToolName,
    /// Recognized constraint keys, kept as a raw JSON object so the verifier
    /// can detect unrecognized keys and fail closed.
    pub constraints: JsonMap<String, JsonValue>,
    /// Freshness token checked within the issuance window.
    pub nonce: Nonce,
}

// ============================================================================
// SECTION: Envelope
// ============================================================================

/// A parsed, not-yet-verified capability token.
#[derive(Debug, Clone)]
pub struct ParsedToken {
    /// The decoded header.
    pub header: CapabilityHeader,
    /// The decoded payload.
    pub payload: CapabilityPayload,
    /// The raw canonical payload bytes, exactly as they appeared in the
    /// token's second segment (used both for hashing and as the signed data).
    pub canonical_payload_bytes: Vec<u8>,
    /// The raw signature bytes from the token's third segment.
    pub signature_bytes: Vec<u8>,
    /// The exact UTF-8 bytes that were signed: `base64url(header) + "." +
    /// base64url(canonical_payload)`.
    pub signing_input: Vec<u8>,
}

/// Errors produced while parsing the envelope, prior to any cryptographic or
/// semantic check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The token did not split into exactly three dot-separated segments.
    #[error("token does not have exactly three segments")]
    WrongSegmentCount,
    /// A segment was not valid base64url.
    #[error("token segment is not valid base64url")]
    InvalidBase64,
    /// The header segment did not decode as JSON matching [`CapabilityHeader`].
    #[error("token header is not well-formed")]
    InvalidHeader,
    /// The payload segment did not decode as JSON matching [`CapabilityPayload`].
    #[error("token payload is not well-formed")]
    InvalidPayload,
}

/// Parses a capability token's three-segment envelope without verifying its
/// signature or evaluating any semantic rule.
///
/// # Errors
///
/// Returns [`ParseError`] if the envelope is not exactly three base64url
/// segments, or if either the header or payload segment fails to decode as
/// the expected JSON shape.
pub fn parse(token_bytes: &[u8]) -> Result<ParsedToken, ParseError> {
    let token_str = std::str::from_utf8(token_bytes).map_err(|_| ParseError::InvalidBase64)?;
    let segments: Vec<&str> = token_str.split('.').collect();
    let [header_seg, payload_seg, signature_seg] = segments.as_slice() else {
        return Err(ParseError::WrongSegmentCount);
    };

    let header_bytes =
        URL_SAFE_NO_PAD.decode(header_seg).map_err(|_| ParseError::InvalidBase64)?;
    let canonical_payload_bytes =
        URL_SAFE_NO_PAD.decode(payload_seg).map_err(|_| ParseError::InvalidBase64)?;
    let signature_bytes =
        URL_SAFE_NO_PAD.decode(signature_seg).map_err(|_| ParseError::InvalidBase64)?;

    let header: CapabilityHeader =
        serde_json::from_slice(&header_bytes).map_err(|_| ParseError::InvalidHeader)?;
    let payload: CapabilityPayload =
        serde_json::from_slice(&canonical_payload_bytes).map_err(|_| ParseError::InvalidPayload)?;

    let signing_input = format!("{header_seg}.{payload_seg}").into_bytes();

    Ok(ParsedToken { header, payload, canonical_payload_bytes, signature_bytes, signing_input })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::CapabilityHeader;
    use super::CapabilityPayload;
    use super::ParseError;
    use super::parse;
    use crate::identifiers::CapabilityId;
    use crate::identifiers::Nonce;
    use crate::identifiers::ToolName;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn sample_token_bytes() -> Vec<u8> {
        let header = CapabilityHeader { alg: "Ed25519".to_string(), typ: "capability".to_string() };
        let payload = CapabilityPayload {
            capability_id: CapabilityId::new("cap-1"),
            issued_at: 0,
            expires_at: 60,
            audience: "tga-1".to_string(),
            subject: "agent-1".to_string(),
            tool: ToolName::new("fs.read"),
            constraints: json!({"one_shot": true}).as_object().unwrap().clone(),
            nonce: Nonce::new("n1"),
        };
        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap());
        let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap());
        let sig_b64 = URL_SAFE_NO_PAD.encode([0_u8; 64]);
        format!("{header_b64}.{payload_b64}.{sig_b64}").into_bytes()
    }

    #[test]
    fn parses_a_well_formed_envelope() {
        let parsed = parse(&sample_token_bytes()).expect("well-formed token parses");
        assert!(parsed.header.is_supported());
        assert_eq!(parsed.payload.audience, "tga-1");
    }

    #[test]
    fn rejects_wrong_segment_count() {
        let err = parse(b"only.two").unwrap_err();
        assert_eq!(err, ParseError::WrongSegmentCount);
    }

    #[test]
    fn rejects_unsupported_algorithm_at_the_semantic_layer_not_parse_layer() {
        let mut bytes = sample_token_bytes();
        let header = CapabilityHeader { alg: "HS256".to_string(), typ: "capability".to_string() };
        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap());
        let token_str = std::str::from_utf8(&bytes).unwrap().to_string();
        let rest = token_str.splitn(2, '.').nth(1).unwrap().to_string();
        bytes = format!("{header_b64}.{rest}").into_bytes();
        let parsed = parse(&bytes).expect("still parses structurally");
        assert!(!parsed.header.is_supported());
    }
}
