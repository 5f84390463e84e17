// tga-system-tests/tests/happy_path.rs
// ============================================================================
// Scenario: Happy path.
// A capability for `fs.read`, audience `tga-1`, expiring in 60s, one-shot,
// carries a trace from PENDING through COMPLETED with an intact hash chain.
// ============================================================================

mod helpers;

use serde_json::json;
use tga_core::AuthorizeOutcome;
use tga_core::State;
use tga_core::StateStore;
use tga_core::TraceId;

#[test]
fn happy_path_reaches_completed_with_an_intact_chain() {
    let test_store = helpers::open_test_store();
    let signing_key = helpers::supervisor_key();
    let machine = helpers::machine_for(test_store.store, &signing_key);

    let token = helpers::sign_capability(
        &signing_key,
        "cap-happy",
        "fs.read",
        helpers::AUDIENCE,
        0,
        60,
        json!({"one_shot": true}),
    );

    let trace_id = TraceId::new("T1");
    let mut input = helpers::empty_input();
    input.insert("path".to_string(), json!("/etc/hosts"));

    let outcome = machine
        .authorize(&trace_id, &token, &tga_core::ToolName::new("fs.read"), true, &input, 30)
        .expect("authorize does not fail closed on a valid token");
    let AuthorizeOutcome::Authorized { session_id } = outcome else {
        panic!("expected a valid, unexpired capability to authorize");
    };
    let _ = session_id.to_string();

    machine.dispatch(&trace_id, 31).expect("dispatch succeeds while the capability is still valid");
    machine.complete(&trace_id, &json!({"contents": "127.0.0.1 localhost"})).expect("complete succeeds");

    let records = machine.store().load_all().expect("load the full log");
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].sequence, 1);
    assert_eq!(records[0].state, State::Pending);
    assert_eq!(records[1].state, State::Authorized);
    assert_eq!(records[2].state, State::Executing);
    assert_eq!(records[3].state, State::Completed);
    assert!(records[3].output_hash.is_some());

    assert_eq!(tga_core::hash_chain::verify(&records).expect("chain verifies"), None);
}
