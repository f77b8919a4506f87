mod common;

use common::{request, respond, template};
use mockd::prelude::*;

fn core() -> MockCore {
    MockdServerBuilder::new().build_core()
}

#[tokio::test]
async fn verify_exact_count_test() {
    let core = core();
    core.add_expectation(ExpectationDefinition::new(
        template("GET", "/ping"),
        respond(200, "pong"),
    ))
    .unwrap();

    core.dispatch(request("GET", "/ping")).await;
    core.dispatch(request("GET", "/ping")).await;

    assert!(core
        .verify(&VerificationRequest {
            request: template("GET", "/ping"),
            times: VerificationTimes::exactly(2),
        })
        .is_ok());

    let mismatch = core
        .verify(&VerificationRequest {
            request: template("GET", "/ping"),
            times: VerificationTimes::exactly(3),
        })
        .unwrap_err();
    assert!(mismatch
        .message
        .starts_with("Request not found exactly 3 times, expected:<"));
    assert!(mismatch.message.contains("but was:<"));
}

#[tokio::test]
async fn verify_at_least_test() {
    let core = core();
    core.add_expectation(ExpectationDefinition::new(
        template("GET", "/ping"),
        respond(200, "pong"),
    ))
    .unwrap();

    core.dispatch(request("GET", "/ping")).await;
    core.dispatch(request("GET", "/ping")).await;
    core.dispatch(request("GET", "/ping")).await;

    assert!(core
        .verify(&VerificationRequest {
            request: template("GET", "/ping"),
            times: VerificationTimes::at_least(2),
        })
        .is_ok());
    assert!(core
        .verify(&VerificationRequest {
            request: template("GET", "/ping"),
            times: VerificationTimes::at_least(4),
        })
        .is_err());
}

#[tokio::test]
async fn unmatched_requests_are_still_verifiable_test() {
    let core = core();

    // No expectation matches, but the request is logged anyway.
    core.dispatch(request("GET", "/nope")).await;

    assert!(core
        .verify(&VerificationRequest {
            request: template("GET", "/nope"),
            times: VerificationTimes::exactly(1),
        })
        .is_ok());
    assert!(core
        .verify(&VerificationRequest {
            request: template("GET", "/never"),
            times: VerificationTimes::exactly(0),
        })
        .is_ok());
}

#[tokio::test]
async fn verify_sequence_test() {
    let core = core();
    core.add_expectation(ExpectationDefinition::new(
        RequestTemplate::default(),
        respond(200, "ok"),
    ))
    .unwrap();

    core.dispatch(request("POST", "/login")).await;
    core.dispatch(request("GET", "/dashboard")).await;
    core.dispatch(request("POST", "/logout")).await;

    assert!(core
        .verify_sequence(&SequenceVerificationRequest {
            requests: vec![template("POST", "/login"), template("POST", "/logout")],
        })
        .is_ok());

    let mismatch = core
        .verify_sequence(&SequenceVerificationRequest {
            requests: vec![template("POST", "/logout"), template("POST", "/login")],
        })
        .unwrap_err();
    assert!(mismatch
        .message
        .starts_with("Request sequence not found, expected:<"));
}

#[tokio::test]
async fn bounded_log_evicts_oldest_test() {
    let core = MockdServerBuilder::new().log_capacity(4).build_core();

    // Each unmatched dispatch produces two log entries.
    for i in 0..5 {
        core.dispatch(request("GET", &format!("/r{}", i))).await;
    }

    assert_eq!(core.log().len(), 4);

    // The earliest request has been evicted and is no longer verifiable.
    assert!(core
        .verify(&VerificationRequest {
            request: template("GET", "/r0"),
            times: VerificationTimes::at_least(1),
        })
        .is_err());
    assert!(core
        .verify(&VerificationRequest {
            request: template("GET", "/r4"),
            times: VerificationTimes::exactly(1),
        })
        .is_ok());
}

#[tokio::test]
async fn retrieval_kinds_test() {
    let core = core();
    core.add_expectation(ExpectationDefinition::new(
        template("GET", "/ok"),
        respond(201, "made"),
    ))
    .unwrap();

    core.dispatch(request("GET", "/ok")).await;
    core.dispatch(request("GET", "/missing")).await;

    match core.retrieve(RetrieveKind::Requests, None) {
        RetrieveResult::Requests(requests) => {
            assert_eq!(requests.len(), 2);
            assert_eq!(requests[0].path(), "/ok");
        }
        other => panic!("unexpected result: {:?}", other),
    }

    match core.retrieve(RetrieveKind::RequestResponses, None) {
        RetrieveResult::RequestResponses(pairs) => {
            assert_eq!(pairs.len(), 2);
            assert_eq!(pairs[0].response.status, Some(201));
            assert_eq!(pairs[1].response.status, Some(404));
            assert_eq!(pairs[1].expectation_id, None);
        }
        other => panic!("unexpected result: {:?}", other),
    }

    match core.retrieve(RetrieveKind::ActiveExpectations, None) {
        RetrieveResult::ActiveExpectations(active) => assert_eq!(active.len(), 1),
        other => panic!("unexpected result: {:?}", other),
    }

    match core.retrieve(RetrieveKind::Requests, Some(&template("GET", "/missing"))) {
        RetrieveResult::Requests(requests) => {
            assert_eq!(requests.len(), 1);
            assert_eq!(requests[0].path(), "/missing");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn clear_with_filter_test() {
    let core = core();
    core.add_expectation(ExpectationDefinition::new(
        template("GET", "/a"),
        respond(200, "a"),
    ))
    .unwrap();
    core.add_expectation(ExpectationDefinition::new(
        template("GET", "/b"),
        respond(200, "b"),
    ))
    .unwrap();

    core.dispatch(request("GET", "/a")).await;
    core.dispatch(request("GET", "/b")).await;

    core.clear(Some(&template("GET", "/a")));

    let active = core.active_expectations(None);
    assert_eq!(active.len(), 1);
    assert_eq!(
        active[0].request.path,
        Some(NottableString::equal_to("/b"))
    );

    assert!(core
        .verify(&VerificationRequest {
            request: template("GET", "/a"),
            times: VerificationTimes::exactly(0),
        })
        .is_ok());
    assert!(core
        .verify(&VerificationRequest {
            request: template("GET", "/b"),
            times: VerificationTimes::exactly(1),
        })
        .is_ok());
}
