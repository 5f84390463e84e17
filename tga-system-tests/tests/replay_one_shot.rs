// tga-system-tests/tests/replay_one_shot.rs
// ============================================================================
// Scenario: Replay of a one-shot capability.
// The same `capability_id` used for a second trace after a successful
// AUTHORIZED is rejected as REPLAY; the first trace is unaffected.
// ============================================================================

mod helpers;

use serde_json::json;
use tga_core::AuthorizeOutcome;
use tga_core::RejectionKind;
use tga_core::TraceId;

#[test]
fn second_use_of_a_one_shot_capability_is_rejected_as_replay() {
    let test_store = helpers::open_test_store();
    let signing_key = helpers::supervisor_key();
    let machine = helpers::machine_for(test_store.store, &signing_key);

    let token = helpers::sign_capability(
        &signing_key,
        "cap-one-shot",
        "fs.read",
        helpers::AUDIENCE,
        0,
        60,
        json!({"one_shot": true}),
    );

    let input = helpers::empty_input();
    let tool = tga_core::ToolName::new("fs.read");

    let first = machine
        .authorize(&TraceId::new("T4-first"), &token, &tool, true, &input, 30)
        .expect("first authorize does not error");
    assert!(matches!(first, AuthorizeOutcome::Authorized { .. }));

    let second = machine
        .authorize(&TraceId::new("T4-second"), &token, &tool, true, &input, 31)
        .expect("second authorize resolves to a rejection, not an error");
    match second {
        AuthorizeOutcome::Rejected { reason } => assert_eq!(reason, RejectionKind::Replay),
        AuthorizeOutcome::Authorized { .. } => panic!("a one-shot capability must not authorize twice"),
    }
}
