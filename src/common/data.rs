use crate::{
    common::util::{opt_serde_body, BodyBytes},
    server::RequestMetadata,
};
use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr, time::Duration};

#[cfg(feature = "cookies")]
use headers::{Cookie, HeaderMapExt};

use crate::common::data::Error::{HeaderConversionError, RequestConversionError};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("expectation does not contain a request template")]
    MissingRequestTemplate,
    #[error("cannot convert header: {0}")]
    HeaderConversionError(String),
    #[error("cannot convert request to/from internal structure: {0}")]
    RequestConversionError(String),
    #[error("JSON conversion error: {0}")]
    JsonConversionError(#[from] serde_json::Error),
}

// ================================================================================================
// Request / Response abstractions
// ================================================================================================

/// A general abstraction of an HTTP request that flows through the matching core.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HttpRequest {
    scheme: String,
    uri: String,
    method: String,
    headers: Vec<(String, String)>,
    body: BodyBytes,
}

impl HttpRequest {
    pub fn new(
        scheme: String,
        uri: String,
        method: String,
        headers: Vec<(String, String)>,
        body: BodyBytes,
    ) -> Self {
        Self {
            scheme,
            uri,
            method,
            headers,
            body,
        }
    }

    /// The scheme the request was received with ("http" unless stated otherwise
    /// by the transport).
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The full URI string as received (origin-form or absolute-form).
    pub fn uri_str(&self) -> &str {
        &self.uri
    }

    /// The path component of the request URI.
    pub fn path(&self) -> String {
        self.uri
            .parse::<http::Uri>()
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| self.uri.clone())
    }

    /// The raw query string, if any.
    pub fn query(&self) -> Option<String> {
        self.uri
            .parse::<http::Uri>()
            .ok()
            .and_then(|u| u.query().map(|q| q.to_string()))
    }

    pub fn method_str(&self) -> &str {
        &self.method
    }

    pub fn headers_vec(&self) -> &Vec<(String, String)> {
        &self.headers
    }

    /// Decoded query parameters in order of appearance.
    pub fn query_params_vec(&self) -> Vec<(String, String)> {
        let query = self.query().unwrap_or_default();
        form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    pub fn body(&self) -> &BodyBytes {
        &self.body
    }

    pub fn body_ref(&self) -> &[u8] {
        self.body.as_ref()
    }

    #[cfg(feature = "cookies")]
    pub(crate) fn cookies(&self) -> Vec<(String, String)> {
        let mut header_map = http::HeaderMap::new();
        for (key, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                http::HeaderName::from_bytes(key.as_bytes()),
                http::HeaderValue::from_str(value),
            ) {
                header_map.append(name, value);
            }
        }

        let mut result = Vec::new();
        if let Some(cookie) = header_map.typed_get::<Cookie>() {
            for (key, value) in cookie.iter() {
                result.push((key.to_string(), value.to_string()));
            }
        }

        result
    }
}

fn http_headers_to_vec<T>(req: &http::Request<T>) -> Result<Vec<(String, String)>, Error> {
    req.headers()
        .iter()
        .map(|(name, value)| {
            let value_str = value
                .to_str()
                .map_err(|e| HeaderConversionError(e.to_string()))?;
            Ok((name.as_str().to_string(), value_str.to_string()))
        })
        .collect()
}

impl TryFrom<&http::Request<Bytes>> for HttpRequest {
    type Error = Error;

    fn try_from(value: &http::Request<Bytes>) -> Result<Self, Self::Error> {
        let scheme = value
            .extensions()
            .get::<RequestMetadata>()
            .map(|m| m.scheme)
            .unwrap_or("http");

        let headers = http_headers_to_vec(value)?;

        // Since Bytes shares data, clone does not copy the body.
        let body = BodyBytes::from(value.body().clone());

        Ok(HttpRequest::new(
            scheme.to_string(),
            value.uri().to_string(),
            value.method().to_string(),
            headers,
            body,
        ))
    }
}

impl TryFrom<&HttpRequest> for http::Request<Bytes> {
    type Error = Error;

    fn try_from(value: &HttpRequest) -> Result<Self, Self::Error> {
        let method = http::Method::from_bytes(value.method.as_bytes())
            .map_err(|e| RequestConversionError(e.to_string()))?;
        let uri: http::Uri = value
            .uri
            .parse()
            .map_err(|e: http::uri::InvalidUri| RequestConversionError(e.to_string()))?;

        let mut builder = http::Request::builder().method(method).uri(uri);
        for (k, v) in &value.headers {
            builder = builder.header(k, v);
        }

        builder
            .body(value.body.to_bytes())
            .map_err(|e| RequestConversionError(e.to_string()))
    }
}

/// A general abstraction of an HTTP response produced by the dispatcher.
#[derive(Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct HttpResponse {
    pub status: Option<u16>,
    pub headers: Option<Vec<(String, String)>>,
    #[serde(default, with = "opt_serde_body")]
    pub body: Option<BodyBytes>,
    pub delay: Option<Delay>,
}

impl HttpResponse {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TryFrom<&http::Response<Bytes>> for HttpResponse {
    type Error = Error;

    fn try_from(value: &http::Response<Bytes>) -> Result<Self, Self::Error> {
        let mut headers = Vec::with_capacity(value.headers().len());

        for (key, header_value) in value.headers() {
            let header_value = header_value
                .to_str()
                .map_err(|err| HeaderConversionError(err.to_string()))?;
            headers.push((key.as_str().to_string(), header_value.to_string()))
        }

        Ok(Self {
            status: Some(value.status().as_u16()),
            headers: if !headers.is_empty() {
                Some(headers)
            } else {
                None
            },
            body: if !value.body().is_empty() {
                Some(BodyBytes::from(value.body().clone()))
            } else {
                None
            },
            delay: None,
        })
    }
}

/// Prints the response body as a UTF-8 string.
impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field(
                "body",
                &self
                    .body
                    .as_ref()
                    .map(|x| String::from_utf8_lossy(x.as_ref()).to_string()),
            )
            .field("delay", &self.delay)
            .finish()
    }
}

// ================================================================================================
// Matching model
// ================================================================================================

/// A string matcher that compares by literal equality first and falls back to treating
/// its value as a regular expression. The result is inverted when `not` is set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NottableString {
    pub value: String,
    #[serde(default)]
    pub not: bool,
}

impl NottableString {
    pub fn equal_to<S: Into<String>>(value: S) -> Self {
        Self {
            value: value.into(),
            not: false,
        }
    }

    pub fn not<S: Into<String>>(value: S) -> Self {
        Self {
            value: value.into(),
            not: true,
        }
    }

    /// Whether the given value satisfies this matcher, honoring negation.
    pub fn matches(&self, actual: &str) -> bool {
        self.matches_value(actual) != self.not
    }

    /// Raw match without negation: literal equality, or a full regex match when the
    /// value compiles as a regular expression.
    pub(crate) fn matches_value(&self, actual: &str) -> bool {
        if self.value == actual {
            return true;
        }

        match Regex::new(&format!("^(?:{})$", self.value)) {
            Ok(re) => re.is_match(actual),
            Err(_) => false,
        }
    }
}

impl From<&str> for NottableString {
    fn from(value: &str) -> Self {
        NottableString::equal_to(value)
    }
}

impl From<String> for NottableString {
    fn from(value: String) -> Self {
        NottableString::equal_to(value)
    }
}

/// A matcher for one named multi-value entry (header, cookie or query parameter).
/// An empty `values` list asserts presence of the name only. A negated name asserts
/// that no entry with a matching name exists.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KeyValueTemplate {
    pub name: NottableString,
    #[serde(default)]
    pub values: Vec<NottableString>,
}

impl KeyValueTemplate {
    pub fn new<N: Into<NottableString>>(name: N, values: Vec<NottableString>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// Serde-friendly JSON body comparison mode.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum JsonMatchType {
    #[default]
    Strict,
    OnlyMatchingFields,
}

/// The strategy used to compare an expectation body against the request body.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BodyMatcher {
    Exact {
        value: String,
    },
    Regex {
        value: String,
    },
    Json {
        value: Value,
        #[serde(default)]
        match_type: JsonMatchType,
    },
    JsonSchema {
        value: Value,
    },
    Xml {
        value: String,
    },
    XPath {
        value: String,
    },
    /// Base64-encoded binary comparison.
    Binary {
        value: String,
    },
    FormUrlEncoded {
        params: Vec<KeyValueTemplate>,
    },
}

/// The request side of an expectation. Absent fields are wildcards. When `not` is
/// set the whole template matches exactly the requests it would otherwise reject.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct RequestTemplate {
    pub method: Option<NottableString>,
    pub path: Option<NottableString>,
    pub headers: Option<Vec<KeyValueTemplate>>,
    pub cookies: Option<Vec<KeyValueTemplate>>,
    pub query_params: Option<Vec<KeyValueTemplate>>,
    pub body: Option<BodyMatcher>,
    pub not: bool,
}

// ================================================================================================
// Timing
// ================================================================================================

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
    Minutes,
}

impl TimeUnit {
    pub fn to_duration(&self, value: u64) -> Duration {
        match self {
            TimeUnit::Milliseconds => Duration::from_millis(value),
            TimeUnit::Seconds => Duration::from_secs(value),
            TimeUnit::Minutes => Duration::from_secs(value * 60),
        }
    }
}

/// A delay applied while dispatching an action.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Delay {
    pub time_unit: TimeUnit,
    pub value: u64,
}

impl Delay {
    pub fn milliseconds(value: u64) -> Self {
        Self {
            time_unit: TimeUnit::Milliseconds,
            value,
        }
    }

    pub fn seconds(value: u64) -> Self {
        Self {
            time_unit: TimeUnit::Seconds,
            value,
        }
    }

    pub fn to_duration(&self) -> Duration {
        self.time_unit.to_duration(self.value)
    }
}

/// How often an expectation may be matched before it expires.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Times {
    pub remaining: u64,
    pub unlimited: bool,
}

impl Times {
    pub fn unlimited() -> Self {
        Self {
            remaining: 0,
            unlimited: true,
        }
    }

    pub fn exactly(n: u64) -> Self {
        Self {
            remaining: n,
            unlimited: false,
        }
    }
}

/// How long an expectation stays alive after being added.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeToLive {
    pub time_unit: Option<TimeUnit>,
    pub amount: Option<u64>,
    pub unlimited: bool,
}

impl TimeToLive {
    pub fn unlimited() -> Self {
        Self {
            time_unit: None,
            amount: None,
            unlimited: true,
        }
    }

    pub fn exactly(time_unit: TimeUnit, amount: u64) -> Self {
        Self {
            time_unit: Some(time_unit),
            amount: Some(amount),
            unlimited: false,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        if self.unlimited {
            return None;
        }
        match (self.time_unit, self.amount) {
            (Some(unit), Some(amount)) => Some(unit.to_duration(amount)),
            _ => None,
        }
    }
}

// ================================================================================================
// Actions
// ================================================================================================

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    Placeholder,
    Mustache,
    Velocity,
    Javascript,
}

/// A response or request template rendered by the configured [`crate::server::dispatch::TemplateEngine`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Template {
    pub kind: TemplateKind,
    pub template: String,
}

/// Replacement fields applied to a request before it is forwarded upstream.
/// Absent fields keep the original request's values.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct RequestOverride {
    pub method: Option<String>,
    pub path: Option<String>,
    pub headers: Option<Vec<(String, String)>>,
    #[serde(with = "opt_serde_body")]
    pub body: Option<BodyBytes>,
    pub scheme: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl RequestOverride {
    /// Builds the upstream request by overlaying this override on the original.
    pub fn apply(&self, base: &HttpRequest) -> HttpRequest {
        let base_uri: Option<http::Uri> = base.uri_str().parse().ok();

        let scheme = self
            .scheme
            .clone()
            .or_else(|| {
                base_uri
                    .as_ref()
                    .and_then(|u| u.scheme_str().map(|s| s.to_string()))
            })
            .unwrap_or_else(|| base.scheme().to_string());

        let authority = match (&self.host, self.port) {
            (Some(host), Some(port)) => Some(format!("{}:{}", host, port)),
            (Some(host), None) => Some(host.clone()),
            (None, port) => base_uri
                .as_ref()
                .and_then(|u| u.authority())
                .map(|a| match port {
                    Some(p) => format!("{}:{}", a.host(), p),
                    None => a.to_string(),
                }),
        };

        let path_and_query = match &self.path {
            Some(path) => {
                let query = base
                    .query()
                    .map(|q| format!("?{}", q))
                    .unwrap_or_default();
                format!("{}{}", path, query)
            }
            None => base_uri
                .as_ref()
                .and_then(|u| u.path_and_query())
                .map(|pq| pq.to_string())
                .unwrap_or_else(|| base.uri_str().to_string()),
        };

        let uri = match authority {
            Some(authority) => format!("{}://{}{}", scheme, authority, path_and_query),
            None => path_and_query,
        };

        let method = self
            .method
            .clone()
            .unwrap_or_else(|| base.method_str().to_string());

        let headers = match &self.headers {
            Some(replacement) => replacement.clone(),
            None => base.headers_vec().clone(),
        };

        let body = self
            .body
            .clone()
            .unwrap_or_else(|| base.body().clone());

        HttpRequest::new(scheme, uri, method, headers, body)
    }
}

/// The action an expectation performs once matched.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Return a canned response. The response carries its own optional delay.
    Respond { response: HttpResponse },
    /// Render a response from a template.
    RespondTemplate {
        template: Template,
        #[serde(default)]
        delay: Option<Delay>,
    },
    /// Produce a response from a named, locally registered callback.
    RespondCallback {
        callback_name: String,
        #[serde(default)]
        delay: Option<Delay>,
    },
    /// Produce a response by asking a remote client over the callback channel.
    RespondObjectCallback {
        client_id: String,
        #[serde(default)]
        delay: Option<Delay>,
    },
    /// Forward the request to the given upstream host.
    Forward {
        host: String,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        scheme: Option<String>,
        #[serde(default)]
        delay: Option<Delay>,
    },
    /// Render the upstream request from a template, then forward it.
    ForwardTemplate {
        template: Template,
        #[serde(default)]
        delay: Option<Delay>,
    },
    /// Rewrite the request through a named, locally registered callback, then forward it.
    ForwardCallback {
        callback_name: String,
        #[serde(default)]
        delay: Option<Delay>,
    },
    /// Ask a remote client for the request to forward.
    ForwardObjectCallback {
        client_id: String,
        #[serde(default)]
        delay: Option<Delay>,
    },
    /// Overlay fixed replacement fields on the request, then forward it.
    OverrideForwardedRequest {
        request: RequestOverride,
        #[serde(default)]
        delay: Option<Delay>,
    },
    /// Break the HTTP contract: emit raw bytes or drop the connection.
    Error {
        #[serde(default)]
        drop_connection: bool,
        #[serde(default)]
        response_bytes: Option<String>,
        #[serde(default)]
        delay: Option<Delay>,
    },
}

// ================================================================================================
// Expectations
// ================================================================================================

/// The wire-facing definition of an expectation. Carrying an existing `id` replaces
/// that expectation in place.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExpectationDefinition {
    #[serde(default)]
    pub id: Option<usize>,
    #[serde(default)]
    pub priority: i32,
    pub request: Option<RequestTemplate>,
    pub action: Action,
    #[serde(default = "Times::unlimited")]
    pub times: Times,
    #[serde(default = "TimeToLive::unlimited")]
    pub time_to_live: TimeToLive,
}

impl ExpectationDefinition {
    pub fn new(request: RequestTemplate, action: Action) -> Self {
        Self {
            id: None,
            priority: 0,
            request: Some(request),
            action,
            times: Times::unlimited(),
            time_to_live: TimeToLive::unlimited(),
        }
    }
}

/// A snapshot of an expectation currently held by the store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ActiveExpectation {
    pub id: usize,
    pub priority: i32,
    pub request: RequestTemplate,
    pub action: Action,
    pub times: Times,
    pub time_to_live: TimeToLive,
    /// Matches left before the expectation expires. `None` for unlimited budgets.
    pub remaining: Option<u64>,
}

// ================================================================================================
// Verification & retrieval
// ================================================================================================

/// The bound checked by a count verification: exact means `observed == count`,
/// otherwise `observed >= count`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationTimes {
    pub count: u64,
    pub exact: bool,
}

impl VerificationTimes {
    pub fn exactly(count: u64) -> Self {
        Self { count, exact: true }
    }

    pub fn at_least(count: u64) -> Self {
        Self {
            count,
            exact: false,
        }
    }

    pub fn check(&self, observed: u64) -> bool {
        if self.exact {
            observed == self.count
        } else {
            observed >= self.count
        }
    }
}

impl fmt::Display for VerificationTimes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.exact, self.count) {
            (true, 1) => write!(f, "exactly once"),
            (true, n) => write!(f, "exactly {} times", n),
            (false, 1) => write!(f, "at least once"),
            (false, n) => write!(f, "at least {} times", n),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VerificationRequest {
    pub request: RequestTemplate,
    pub times: VerificationTimes,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SequenceVerificationRequest {
    pub requests: Vec<RequestTemplate>,
}

/// Which slice of recorded state a retrieval returns.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetrieveKind {
    Requests,
    RequestResponses,
    RecordedExpectations,
    ActiveExpectations,
    All,
}

impl FromStr for RetrieveKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requests" => Ok(RetrieveKind::Requests),
            "request_responses" => Ok(RetrieveKind::RequestResponses),
            "recorded_expectations" => Ok(RetrieveKind::RecordedExpectations),
            "active_expectations" => Ok(RetrieveKind::ActiveExpectations),
            "all" => Ok(RetrieveKind::All),
            other => Err(format!("unknown retrieve kind: {}", other)),
        }
    }
}

/// The body returned for requests that could not be processed.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorResponse {
    pub message: String,
}

impl ErrorResponse {
    pub fn new<T: ToString>(message: &T) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}
