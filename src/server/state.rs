use crate::{
    common::{
        data::{
            ActiveExpectation, ExpectationDefinition, HttpRequest, RequestTemplate, RetrieveKind,
            SequenceVerificationRequest, VerificationRequest,
        },
        http::{HttpClient, HyperHttpClient},
    },
    server::{
        callback::{CallbackChannel, CallbackLoader, CallbackRegistry, InMemoryCallbackLoader},
        dispatch::{
            not_found_response, ActionDispatcher, DispatchOutcome, PlaceholderTemplateEngine,
            TemplateEngine,
        },
        log::{EventLog, LogEntry, RequestResponsePair, VerificationMismatch},
        scheduler::Scheduler,
        store::{self, ExpectationStore},
    },
};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid expectation: {0}")]
    InvalidExpectation(#[from] store::Error),
}

/// Sizing and timing knobs of the matching core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub log_capacity: usize,
    pub max_expectations: usize,
    pub forward_timeout: Duration,
    pub callback_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_capacity: 10_000,
            max_expectations: 65_536,
            forward_timeout: Duration::from_secs(30),
            callback_timeout: Duration::from_secs(10),
        }
    }
}

/// The slice of recorded state returned by a retrieval.
#[derive(Serialize, Debug)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum RetrieveResult {
    Requests(Vec<HttpRequest>),
    RequestResponses(Vec<RequestResponsePair>),
    RecordedExpectations(Vec<ExpectationDefinition>),
    ActiveExpectations(Vec<ActiveExpectation>),
    All(Vec<LogEntry>),
}

/// The in-process facade over the expectation store, the event log and the action
/// dispatcher. The control-plane HTTP API is a thin serialization layer over this.
pub struct MockCore {
    store: ExpectationStore,
    log: EventLog,
    dispatcher: ActionDispatcher,
}

impl MockCore {
    pub fn new(
        config: CoreConfig,
        http_client: Arc<dyn HttpClient + Send + Sync>,
        template_engine: Arc<dyn TemplateEngine>,
        callback_loader: Arc<dyn CallbackLoader>,
        callback_channel: Option<Arc<dyn CallbackChannel>>,
    ) -> Self {
        let callbacks = Arc::new(CallbackRegistry::new());
        let dispatcher = ActionDispatcher::new(
            http_client,
            template_engine,
            callback_loader,
            callback_channel,
            callbacks,
            Scheduler::new(),
            config.forward_timeout,
            config.callback_timeout,
        );

        Self {
            store: ExpectationStore::new(config.max_expectations),
            log: EventLog::new(config.log_capacity),
            dispatcher,
        }
    }

    /// A core with the default collaborators: the hyper client, the placeholder
    /// template engine, an empty in-process callback loader and no callback channel.
    pub fn with_defaults(config: CoreConfig) -> Self {
        Self::new(
            config,
            Arc::new(HyperHttpClient::new()),
            Arc::new(PlaceholderTemplateEngine::new()),
            Arc::new(InMemoryCallbackLoader::new()),
            None,
        )
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// The correlation table remote callback replies are completed through.
    pub fn callbacks(&self) -> Arc<CallbackRegistry> {
        self.dispatcher.callbacks()
    }

    pub fn add_expectation(
        &self,
        definition: ExpectationDefinition,
    ) -> Result<ActiveExpectation, Error> {
        Ok(self.store.add(definition)?)
    }

    pub fn remove_expectation(&self, id: usize) -> bool {
        self.store.remove(id)
    }

    pub fn active_expectations(&self, filter: Option<&RequestTemplate>) -> Vec<ActiveExpectation> {
        self.store.active(filter)
    }

    /// Removes expectations and log entries selected by the filter, or everything
    /// when no filter is given.
    pub fn clear(&self, filter: Option<&RequestTemplate>) {
        self.store.clear(filter);
        self.log.clear(filter);
    }

    pub fn reset(&self) {
        tracing::debug!("resetting all state");
        self.store.reset();
        self.log.clear(None);
    }

    /// Runs a request through the matching core: log it, find and claim the first
    /// matching expectation, execute its action. Unmatched requests get the shared
    /// not-found response and are logged so negative verifications see them.
    pub async fn dispatch(&self, req: HttpRequest) -> DispatchOutcome {
        self.log.append(LogEntry::ReceivedRequest {
            request: req.clone(),
        });

        match self.store.first_match(&req) {
            Some(expectation) => {
                tracing::debug!(
                    expectation_id = expectation.id,
                    method = req.method_str(),
                    path = %req.path(),
                    "request matched expectation"
                );
                self.log.append(LogEntry::ExpectationMatched {
                    request: req.clone(),
                    expectation: expectation.snapshot(),
                });
                self.dispatcher.dispatch(&expectation, &req, &self.log).await
            }
            None => {
                tracing::debug!(
                    method = req.method_str(),
                    path = %req.path(),
                    "no expectation matched"
                );
                let response = not_found_response();
                self.log.append(LogEntry::RequestResponse {
                    request: req,
                    response: response.clone(),
                    expectation_id: None,
                });
                DispatchOutcome::Response(response)
            }
        }
    }

    pub fn retrieve(
        &self,
        kind: RetrieveKind,
        filter: Option<&RequestTemplate>,
    ) -> RetrieveResult {
        match kind {
            RetrieveKind::Requests => RetrieveResult::Requests(self.log.requests(filter)),
            RetrieveKind::RequestResponses => {
                RetrieveResult::RequestResponses(self.log.request_responses(filter))
            }
            RetrieveKind::RecordedExpectations => {
                RetrieveResult::RecordedExpectations(self.log.recorded_expectations(filter))
            }
            RetrieveKind::ActiveExpectations => {
                RetrieveResult::ActiveExpectations(self.store.active(filter))
            }
            RetrieveKind::All => RetrieveResult::All(
                self.log
                    .snapshot()
                    .iter()
                    .map(|entry| entry.as_ref().clone())
                    .collect(),
            ),
        }
    }

    pub fn verify(&self, request: &VerificationRequest) -> Result<(), VerificationMismatch> {
        self.log.verify(&request.request, request.times)
    }

    pub fn verify_sequence(
        &self,
        request: &SequenceVerificationRequest,
    ) -> Result<(), VerificationMismatch> {
        self.log.verify_sequence(&request.requests)
    }
}
