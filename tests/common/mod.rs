#![allow(dead_code)]

use mockd::{prelude::*, server::dispatch::DispatchOutcome};

pub fn template(method: &str, path: &str) -> RequestTemplate {
    RequestTemplate {
        method: Some(NottableString::equal_to(method)),
        path: Some(NottableString::equal_to(path)),
        ..Default::default()
    }
}

pub fn request(method: &str, path: &str) -> HttpRequest {
    HttpRequest::new(
        "http".to_string(),
        path.to_string(),
        method.to_string(),
        Vec::new(),
        BodyBytes::default(),
    )
}

pub fn respond(status: u16, body: &str) -> Action {
    Action::Respond {
        response: HttpResponse {
            status: Some(status),
            body: Some(body.into()),
            ..Default::default()
        },
    }
}

pub fn status_of(outcome: &DispatchOutcome) -> u16 {
    match outcome {
        DispatchOutcome::Response(response) => response.status.unwrap_or(200),
        other => panic!("expected an HTTP response, got {:?}", other),
    }
}

pub fn body_of(outcome: &DispatchOutcome) -> String {
    match outcome {
        DispatchOutcome::Response(response) => response
            .body
            .as_ref()
            .map(|body| body.to_maybe_lossy_str().to_string())
            .unwrap_or_default(),
        other => panic!("expected an HTTP response, got {:?}", other),
    }
}
