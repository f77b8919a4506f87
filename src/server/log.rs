use crate::{
    common::data::{
        Action, ActiveExpectation, ExpectationDefinition, HttpRequest, HttpResponse,
        RequestTemplate, Times, VerificationTimes,
    },
    server::matchers,
};
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

/// One recorded lifecycle event. Entries are immutable once appended.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEntry {
    ReceivedRequest {
        request: HttpRequest,
    },
    ExpectationMatched {
        request: HttpRequest,
        expectation: ActiveExpectation,
    },
    RequestResponse {
        request: HttpRequest,
        response: HttpResponse,
        expectation_id: Option<usize>,
    },
    ForwardedRequest {
        request: HttpRequest,
        forwarded: HttpRequest,
        response: Option<HttpResponse>,
        expectation_id: Option<usize>,
    },
    Message {
        message: String,
    },
}

impl LogEntry {
    fn request(&self) -> Option<&HttpRequest> {
        match self {
            LogEntry::ReceivedRequest { request } => Some(request),
            LogEntry::ExpectationMatched { request, .. } => Some(request),
            LogEntry::RequestResponse { request, .. } => Some(request),
            LogEntry::ForwardedRequest { request, .. } => Some(request),
            LogEntry::Message { .. } => None,
        }
    }
}

/// A recorded request/response pair, as returned by retrieval.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestResponsePair {
    pub request: HttpRequest,
    pub response: HttpResponse,
    pub expectation_id: Option<usize>,
}

/// A failed verification: the framed failure message plus an optional line diff
/// against the closest recorded request.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VerificationMismatch {
    pub message: String,
    pub diff: Option<String>,
}

type Listener = Box<dyn Fn(&Arc<LogEntry>) + Send + Sync>;

/// A capacity-bounded FIFO event log. Appending beyond capacity evicts the oldest
/// entry. Listeners are invoked on every append, outside the entries lock.
pub struct EventLog {
    capacity: usize,
    entries: Mutex<VecDeque<Arc<LogEntry>>>,
    listeners: Mutex<Vec<Listener>>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            // A log that cannot hold a single entry is useless, keep at least one.
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn append(&self, entry: LogEntry) {
        let entry = Arc::new(entry);

        {
            let mut entries = self.entries.lock().unwrap();
            while entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }

        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            listener(&entry);
        }
    }

    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&Arc<LogEntry>) + Send + Sync + 'static,
    {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }

    /// Removes entries whose request matches the filter, or all entries when no
    /// filter is given. Message entries are only removed by a full clear.
    pub fn clear(&self, filter: Option<&RequestTemplate>) {
        let mut entries = self.entries.lock().unwrap();
        match filter {
            None => entries.clear(),
            Some(filter) => entries.retain(|entry| {
                entry
                    .request()
                    .map_or(true, |req| !matchers::request_matches(filter, req))
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<LogEntry>> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    /// All received requests matching the filter, oldest first.
    pub fn requests(&self, filter: Option<&RequestTemplate>) -> Vec<HttpRequest> {
        self.snapshot()
            .iter()
            .filter_map(|entry| match entry.as_ref() {
                LogEntry::ReceivedRequest { request } => Some(request),
                _ => None,
            })
            .filter(|req| filter.map_or(true, |f| matchers::request_matches(f, req)))
            .cloned()
            .collect()
    }

    /// All recorded request/response pairs matching the filter, including not-found
    /// responses.
    pub fn request_responses(&self, filter: Option<&RequestTemplate>) -> Vec<RequestResponsePair> {
        self.snapshot()
            .iter()
            .filter_map(|entry| match entry.as_ref() {
                LogEntry::RequestResponse {
                    request,
                    response,
                    expectation_id,
                } => Some(RequestResponsePair {
                    request: request.clone(),
                    response: response.clone(),
                    expectation_id: *expectation_id,
                }),
                _ => None,
            })
            .filter(|pair| filter.map_or(true, |f| matchers::request_matches(f, &pair.request)))
            .collect()
    }

    /// Re-expresses forwarded request/response pairs as one-shot expectations, so a
    /// proxied session can be replayed as stubs.
    pub fn recorded_expectations(
        &self,
        filter: Option<&RequestTemplate>,
    ) -> Vec<ExpectationDefinition> {
        self.snapshot()
            .iter()
            .filter_map(|entry| match entry.as_ref() {
                LogEntry::ForwardedRequest {
                    request,
                    response: Some(response),
                    ..
                } => Some((request, response)),
                _ => None,
            })
            .filter(|(req, _)| filter.map_or(true, |f| matchers::request_matches(f, req)))
            .map(|(req, response)| {
                let mut definition = ExpectationDefinition::new(
                    RequestTemplate {
                        method: Some(req.method_str().into()),
                        path: Some(req.path().into()),
                        ..Default::default()
                    },
                    Action::Respond {
                        response: response.clone(),
                    },
                );
                definition.times = Times::exactly(1);
                definition
            })
            .collect()
    }

    /// Checks how often a matching request was received against the given bound.
    pub fn verify(
        &self,
        template: &RequestTemplate,
        times: VerificationTimes,
    ) -> Result<(), VerificationMismatch> {
        let received = self.requests(None);
        let observed = received
            .iter()
            .filter(|req| matchers::request_matches(template, req))
            .count() as u64;

        if times.check(observed) {
            return Ok(());
        }

        tracing::debug!(observed, expected = %times, "count verification failed");

        Err(VerificationMismatch {
            message: format!(
                "Request not found {}, expected:<{}> but was:<{}>",
                times,
                to_json(template),
                requests_to_json(&received),
            ),
            diff: closest_diff(template, &received),
        })
    }

    /// Checks that matching requests were received in the given relative order.
    /// Each call rescans the log from the start; unrelated requests in between are
    /// allowed.
    pub fn verify_sequence(
        &self,
        templates: &[RequestTemplate],
    ) -> Result<(), VerificationMismatch> {
        let received = self.requests(None);

        let mut cursor = received.iter();
        let in_order = templates.iter().all(|template| {
            cursor.any(|req| matchers::request_matches(template, req))
        });

        if in_order {
            return Ok(());
        }

        tracing::debug!(
            expected = templates.len(),
            received = received.len(),
            "sequence verification failed"
        );

        Err(VerificationMismatch {
            message: format!(
                "Request sequence not found, expected:<{}> but was:<{}>",
                to_json(templates),
                requests_to_json(&received),
            ),
            diff: None,
        })
    }
}

fn to_json<T: Serialize>(value: T) -> String {
    serde_json::to_string(&value).unwrap_or_else(|_| "{}".to_string())
}

fn requests_to_json(requests: &[HttpRequest]) -> String {
    match requests {
        [single] => to_json(single),
        many => to_json(many),
    }
}

/// Renders a line diff between the expected template and the recorded request
/// closest to it, in +/- notation.
fn closest_diff(template: &RequestTemplate, received: &[HttpRequest]) -> Option<String> {
    let expected = serde_json::to_string_pretty(template).ok()?;

    let closest = received
        .iter()
        .filter_map(|req| serde_json::to_string_pretty(req).ok())
        .max_by(|a, b| {
            let ratio_a = TextDiff::from_lines(expected.as_str(), a.as_str()).ratio();
            let ratio_b = TextDiff::from_lines(expected.as_str(), b.as_str()).ratio();
            ratio_a.total_cmp(&ratio_b)
        })?;

    let diff = TextDiff::from_lines(expected.as_str(), closest.as_str());
    let rendered = diff
        .iter_all_changes()
        .map(|change| {
            let sign = match change.tag() {
                ChangeTag::Equal => " ",
                ChangeTag::Insert => "+",
                ChangeTag::Delete => "-",
            };
            format!("{}{}", sign, change.to_string_lossy())
        })
        .collect::<String>();

    Some(rendered)
}
