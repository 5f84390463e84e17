// tga-system-tests/tests/helpers/mod.rs
// ============================================================================
// Module: Scenario Test Helpers
// Description: Shared fixtures for the six concrete end-to-end scenarios.
// Purpose: Build a real SqliteStateStore-backed state machine and sign test
//          capability tokens without duplicating envelope plumbing per file.
// Dependencies: tga-core, tga-store-sqlite, ed25519-dalek, tempfile
// ============================================================================

#![allow(dead_code, reason = "Not every scenario file uses every helper.")]

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::Signer;
use ed25519_dalek::SigningKey;
use serde_json::Map as JsonMap;
use serde_json::Value as JsonValue;
use tempfile::TempDir;
use tga_core::CapabilityHeader;
use tga_core::CapabilityPayload;
use tga_core::CapabilityId;
use tga_core::CapabilityVerifier;
use tga_core::ExecutionStateMachine;
use tga_core::Nonce;
use tga_core::NoopAuditSink;
use tga_core::ToolName;
use tga_store_sqlite::SqliteStateStore;
use tga_store_sqlite::SqliteStoreConfig;

/// The audience identity every test TGA instance is configured with.
pub const AUDIENCE: &str = "tga-1";

/// A live, file-backed store plus the temp directory that owns its file.
///
/// The directory must be kept alive for as long as the store is open; it is
/// only dropped (and the file removed) once the test is done with it.
pub struct TestStore {
    /// The open store handle.
    pub store: SqliteStateStore,
    /// The temp directory backing `store`'s database file.
    dir: TempDir,
}

/// Opens a fresh `SqliteStateStore` in a new temporary directory.
pub fn open_test_store() -> TestStore {
    let dir = tempfile::tempdir().expect("create temp dir");
    let db_path = dir.path().join("tga.sqlite3");
    let store =
        SqliteStateStore::open(&SqliteStoreConfig::new(db_path)).expect("open sqlite store");
    TestStore { store, dir }
}

/// Reopens a store at the same path an earlier `TestStore` used, simulating
/// a process restart against the same durable file.
pub fn reopen_store(path: &std::path::Path) -> SqliteStateStore {
    SqliteStateStore::open(&SqliteStoreConfig::new(path.to_path_buf())).expect("reopen sqlite store")
}

impl TestStore {
    /// Returns the path of the underlying database file, for simulating a
    /// restart by reopening a fresh `SqliteStateStore` over the same file.
    pub fn path(&self) -> std::path::PathBuf {
        self.dir.path().join("tga.sqlite3")
    }
}

/// Builds a Supervisor signing key deterministic within one test process.
pub fn supervisor_key() -> SigningKey {
    SigningKey::from_bytes(&[11_u8; 32])
}

/// Builds a state machine wired to `store`, trusting `signing_key`'s public
/// half as the Supervisor key, with TGA's own identity set to [`AUDIENCE`].
pub fn machine_for(store: SqliteStateStore, signing_key: &SigningKey) -> ExecutionStateMachine<SqliteStateStore> {
    let verifier = CapabilityVerifier::new(tga_core::CapabilityVerifierConfig {
        supervisor_public_key: signing_key.verifying_key(),
        audience: AUDIENCE.to_string(),
        clock_skew_seconds: 5,
    });
    ExecutionStateMachine::new(store, verifier, 64, Arc::new(NoopAuditSink))
}

/// Builds and signs a capability token for `tool`, with the given temporal
/// window, audience, and raw constraints object.
#[allow(clippy::too_many_arguments, reason = "Scenario fixtures vary every field independently.")]
pub fn sign_capability(
    signing_key: &SigningKey,
    capability_id: &str,
    tool: &str,
    audience: &str,
    issued_at: i64,
    expires_at: i64,
    constraints: JsonValue,
) -> Vec<u8> {
    let header = CapabilityHeader { alg: "Ed25519".to_string(), typ: "capability".to_string() };
    let payload = CapabilityPayload {
        capability_id: CapabilityId::new(capability_id),
        issued_at,
        expires_at,
        audience: audience.to_string(),
        subject: "agent-1".to_string(),
        tool: ToolName::new(tool),
        constraints: constraints.as_object().cloned().unwrap_or_else(JsonMap::new),
        nonce: Nonce::new(format!("nonce-{capability_id}")),
    };
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).expect("encode header"));
    let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).expect("encode payload"));
    let signing_input = format!("{header_b64}.{payload_b64}");
    let signature = signing_key.sign(signing_input.as_bytes());
    let sig_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());
    format!("{signing_input}.{sig_b64}").into_bytes()
}

/// An empty JSON object, for scenarios indifferent to tool input.
pub fn empty_input() -> JsonMap<String, JsonValue> {
    JsonMap::new()
}
