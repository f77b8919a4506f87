//! `mockd` is a programmable HTTP intermediary for testing. Clients register
//! expectations, each pairing a request template with an action, through a JSON
//! control-plane API under `/__mockd__/` or directly against the in-process
//! [`MockCore`](server::state::MockCore). Every other request is matched against
//! the active expectations and answered by the winning expectation's action:
//! static or templated responses, forwarding to an upstream, callbacks, or
//! connection-level fault injection.
//!
//! All traffic is recorded in a bounded event log, which backs request
//! verification ("was this request received exactly twice?"), order-sensitive
//! sequence verification and retrieval of requests, request/response pairs and
//! recorded expectations.
//!
//! # Example
//!
//! ```no_run
//! use mockd::prelude::*;
//!
//! # async fn example() {
//! let core = MockdServerBuilder::new().build_core();
//!
//! core.add_expectation(ExpectationDefinition::new(
//!     RequestTemplate {
//!         method: Some(NottableString::equal_to("GET")),
//!         path: Some(NottableString::equal_to("/hello")),
//!         ..Default::default()
//!     },
//!     Action::Respond {
//!         response: HttpResponse {
//!             status: Some(200),
//!             body: Some("hi".into()),
//!             ..Default::default()
//!         },
//!     },
//! ))
//! .unwrap();
//! # }
//! ```

pub mod common;
pub mod server;

pub mod prelude {
    pub use crate::{
        common::{
            data::{
                Action, ActiveExpectation, BodyMatcher, Delay, ExpectationDefinition,
                HttpRequest, HttpResponse, JsonMatchType, KeyValueTemplate, NottableString,
                RequestOverride, RequestTemplate, RetrieveKind, SequenceVerificationRequest,
                Template, TemplateKind, TimeToLive, TimeUnit, Times, VerificationRequest,
                VerificationTimes,
            },
            util::BodyBytes,
        },
        server::{
            builder::MockdServerBuilder,
            state::{CoreConfig, MockCore, RetrieveResult},
        },
    };
}
