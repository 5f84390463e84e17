// tga-system-tests/tests/tampered_log.rs
// ============================================================================
// Scenario: Tampered log.
// Flipping one bit inside a persisted `output_hash` must make Recovery
// refuse to start, reporting HASH_CHAIN_BROKEN at the damaged sequence.
// ============================================================================

mod helpers;

use serde_json::json;
use tga_core::AuthorizeOutcome;
use tga_core::NoopAuditSink;
use tga_core::Recovery;
use tga_core::RecoveryError;
use tga_core::TraceId;

#[test]
fn a_single_flipped_bit_breaks_the_chain_and_recovery_refuses_to_start() {
    let test_store = helpers::open_test_store();
    let db_path = test_store.path();
    let signing_key = helpers::supervisor_key();
    let machine = helpers::machine_for(test_store.store, &signing_key);

    let token = helpers::sign_capability(
        &signing_key,
        "cap-tamper",
        "fs.read",
        helpers::AUDIENCE,
        0,
        600,
        json!({}),
    );

    let trace_id = TraceId::new("T6");
    let input = helpers::empty_input();
    let outcome = machine
        .authorize(&trace_id, &token, &tga_core::ToolName::new("fs.read"), true, &input, 30)
        .expect("authorize succeeds");
    assert!(matches!(outcome, AuthorizeOutcome::Authorized { .. }));
    machine.dispatch(&trace_id, 31).expect("dispatch succeeds");
    machine.complete(&trace_id, &json!({"ok": true})).expect("complete succeeds");
    drop(machine);

    let connection = rusqlite::Connection::open(&db_path).expect("open the raw sqlite file");
    let damaged_sequence: i64 = 4;
    let mut output_hash: Vec<u8> = connection
        .query_row(
            "SELECT output_hash FROM execution_states WHERE sequence = ?1",
            [damaged_sequence],
            |row| row.get(0),
        )
        .expect("read the COMPLETED record's output_hash");
    output_hash[0] ^= 0x01;
    connection
        .execute(
            "UPDATE execution_states SET output_hash = ?1 WHERE sequence = ?2",
            rusqlite::params![output_hash, damaged_sequence],
        )
        .expect("flip one bit in the persisted output_hash");
    drop(connection);

    let reopened = helpers::reopen_store(&db_path);
    let audit = NoopAuditSink;
    let recovery = Recovery::new(&reopened, &audit);
    let err = recovery.run().expect_err("recovery must fail closed on a tampered record");
    let RecoveryError::HashChainBroken { sequence, .. } = err else {
        panic!("expected recovery to report a broken hash chain");
    };
    assert_eq!(sequence, damaged_sequence.unsigned_abs());
}
