// tga-system-tests/tests/audience_mismatch.rs
// ============================================================================
// Scenario: Audience mismatch.
// A token issued for `tga-2` presented against a TGA configured with
// identity `tga-1` is rejected as UNAUTHORIZED/AUDIENCE.
// ============================================================================

mod helpers;

use serde_json::json;
use tga_core::AuthorizeOutcome;
use tga_core::RejectionKind;
use tga_core::State;
use tga_core::StateStore;
use tga_core::TraceId;
use tga_core::UnauthorizedReason;

#[test]
fn audience_mismatch_is_rejected() {
    let test_store = helpers::open_test_store();
    let signing_key = helpers::supervisor_key();
    let machine = helpers::machine_for(test_store.store, &signing_key);

    let token = helpers::sign_capability(
        &signing_key,
        "cap-audience",
        "fs.read",
        "tga-2",
        0,
        60,
        json!({}),
    );

    let trace_id = TraceId::new("T3");
    let input = helpers::empty_input();

    let outcome = machine
        .authorize(&trace_id, &token, &tga_core::ToolName::new("fs.read"), true, &input, 30)
        .expect("authorize resolves to a rejection, not an error");
    match outcome {
        AuthorizeOutcome::Rejected { reason } => {
            assert_eq!(reason, RejectionKind::Unauthorized(UnauthorizedReason::Audience));
        }
        AuthorizeOutcome::Authorized { .. } => panic!("expected rejection on an audience mismatch"),
    }

    let records = machine.store().load_all().expect("load the full log");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].state, State::Pending);
    assert_eq!(records[1].state, State::Rejected);
    assert_eq!(records[1].reason.as_deref(), Some("UNAUTHORIZED"));
}
