use crate::{
    common::{
        data::{self, Action, Delay, HttpRequest, HttpResponse, RequestOverride, Template, TemplateKind},
        http::{self, HttpClient},
        util::BodyBytes,
    },
    server::{
        callback::{CallbackChannel, CallbackLoader, CallbackRegistry, CallbackReply},
        log::{EventLog, LogEntry},
        scheduler::Scheduler,
        store::Expectation,
    },
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("template kind {0:?} is not supported by this engine")]
    UnsupportedKind(TemplateKind),
    #[error("rendered template is not valid JSON: {0}")]
    InvalidRendering(#[from] serde_json::Error),
}

/// Renders response and upstream-request templates. The built-in engine only
/// substitutes request placeholders; richer engines are injected from outside.
pub trait TemplateEngine: Send + Sync {
    fn render_response(
        &self,
        template: &Template,
        req: &HttpRequest,
    ) -> Result<HttpResponse, TemplateError>;

    fn render_request(
        &self,
        template: &Template,
        req: &HttpRequest,
    ) -> Result<HttpRequest, TemplateError>;
}

/// Minimal engine: replaces `{{request.method}}`, `{{request.path}}`,
/// `{{request.query}}` and `{{request.body}}` and parses the result as JSON.
#[derive(Default)]
pub struct PlaceholderTemplateEngine;

impl PlaceholderTemplateEngine {
    pub fn new() -> Self {
        Self
    }

    fn substitute(&self, template: &Template, req: &HttpRequest) -> Result<String, TemplateError> {
        if template.kind != TemplateKind::Placeholder {
            return Err(TemplateError::UnsupportedKind(template.kind));
        }

        Ok(template
            .template
            .replace("{{request.method}}", req.method_str())
            .replace("{{request.path}}", &req.path())
            .replace("{{request.query}}", &req.query().unwrap_or_default())
            .replace("{{request.body}}", &req.body().to_maybe_lossy_str()))
    }
}

impl TemplateEngine for PlaceholderTemplateEngine {
    fn render_response(
        &self,
        template: &Template,
        req: &HttpRequest,
    ) -> Result<HttpResponse, TemplateError> {
        let rendered = self.substitute(template, req)?;
        Ok(serde_json::from_str(&rendered)?)
    }

    fn render_request(
        &self,
        template: &Template,
        req: &HttpRequest,
    ) -> Result<HttpRequest, TemplateError> {
        let rendered = self.substitute(template, req)?;
        let replacement: RequestOverride = serde_json::from_str(&rendered)?;
        Ok(replacement.apply(req))
    }
}

/// What the transport layer must do with a dispatched request.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Write a regular HTTP response.
    Response(HttpResponse),
    /// Write these bytes verbatim and close the connection.
    Raw(Bytes),
    /// Drop the connection without writing anything.
    Close,
}

/// A recoverable action failure. Every fault resolves to the shared not-found
/// response at the dispatcher's single recovery point.
#[derive(Error, Debug)]
pub enum DispatchFault {
    #[error("template rendering failed: {0}")]
    Template(#[from] TemplateError),
    #[error("no callback registered under name {0:?}")]
    UnknownCallback(String),
    #[error("no callback channel is configured")]
    CallbackUnavailable,
    #[error("cannot deliver callback to client {0:?}")]
    CallbackDeliveryFailed(String),
    #[error("callback reply timed out")]
    CallbackTimeout,
    #[error("callback was canceled before a reply arrived")]
    CallbackCanceled,
    #[error("callback client sent a reply of the wrong kind")]
    InvalidCallbackReply,
    #[error("upstream request failed: {0}")]
    UpstreamError(#[from] http::Error),
    #[error("upstream request timed out")]
    UpstreamTimeout,
    #[error("cannot convert request: {0}")]
    RequestConversionError(#[from] data::Error),
    #[error("invalid base64 in error action: {0}")]
    InvalidResponseBytes(#[from] base64::DecodeError),
}

/// The response returned when no expectation matches or an action faults.
pub fn not_found_response() -> HttpResponse {
    HttpResponse {
        status: Some(404),
        headers: Some(vec![(
            "content-type".to_string(),
            "text/plain".to_string(),
        )]),
        body: Some(BodyBytes::from("request did not match any expectation")),
        delay: None,
    }
}

/// Executes the action of a matched expectation. One exhaustive switch covers all
/// action kinds; faults never escape, they degrade to a logged not-found response.
pub struct ActionDispatcher {
    http_client: Arc<dyn HttpClient + Send + Sync>,
    template_engine: Arc<dyn TemplateEngine>,
    callback_loader: Arc<dyn CallbackLoader>,
    callback_channel: Option<Arc<dyn CallbackChannel>>,
    callbacks: Arc<CallbackRegistry>,
    scheduler: Scheduler,
    forward_timeout: Duration,
    callback_timeout: Duration,
}

impl ActionDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http_client: Arc<dyn HttpClient + Send + Sync>,
        template_engine: Arc<dyn TemplateEngine>,
        callback_loader: Arc<dyn CallbackLoader>,
        callback_channel: Option<Arc<dyn CallbackChannel>>,
        callbacks: Arc<CallbackRegistry>,
        scheduler: Scheduler,
        forward_timeout: Duration,
        callback_timeout: Duration,
    ) -> Self {
        Self {
            http_client,
            template_engine,
            callback_loader,
            callback_channel,
            callbacks,
            scheduler,
            forward_timeout,
            callback_timeout,
        }
    }

    pub fn callbacks(&self) -> Arc<CallbackRegistry> {
        self.callbacks.clone()
    }

    pub async fn dispatch(
        &self,
        expectation: &Expectation,
        req: &HttpRequest,
        log: &EventLog,
    ) -> DispatchOutcome {
        match self.run(expectation, req, log).await {
            Ok(outcome) => outcome,
            Err(fault) => {
                tracing::warn!(
                    expectation_id = expectation.id,
                    error = %fault,
                    "action failed, answering not found"
                );
                log.append(LogEntry::Message {
                    message: format!(
                        "action of expectation {} failed: {}",
                        expectation.id, fault
                    ),
                });

                let response = not_found_response();
                log.append(LogEntry::RequestResponse {
                    request: req.clone(),
                    response: response.clone(),
                    expectation_id: Some(expectation.id),
                });
                DispatchOutcome::Response(response)
            }
        }
    }

    async fn run(
        &self,
        expectation: &Expectation,
        req: &HttpRequest,
        log: &EventLog,
    ) -> Result<DispatchOutcome, DispatchFault> {
        let id = expectation.id;

        match &expectation.action {
            Action::Respond { response } => {
                self.scheduler.delay(response.delay.as_ref()).await;
                Ok(self.respond(response.clone(), req, id, log))
            }

            Action::RespondTemplate { template, delay } => {
                let response = self.template_engine.render_response(template, req)?;
                self.scheduler.delay(delay.as_ref()).await;
                Ok(self.respond(response, req, id, log))
            }

            Action::RespondCallback {
                callback_name,
                delay,
            } => {
                let callback = self
                    .callback_loader
                    .response_callback(callback_name)
                    .ok_or_else(|| DispatchFault::UnknownCallback(callback_name.clone()))?;
                let response = callback(req);
                self.scheduler.delay(delay.as_ref()).await;
                Ok(self.respond(response, req, id, log))
            }

            Action::RespondObjectCallback { client_id, delay } => {
                match self.remote_callback(client_id, req).await? {
                    CallbackReply::Response(response) => {
                        self.scheduler.delay(delay.as_ref()).await;
                        Ok(self.respond(response, req, id, log))
                    }
                    CallbackReply::Request(_) => Err(DispatchFault::InvalidCallbackReply),
                }
            }

            Action::Forward {
                host,
                port,
                scheme,
                delay,
            } => {
                let rewrite = RequestOverride {
                    host: Some(host.clone()),
                    port: *port,
                    scheme: scheme.clone(),
                    ..Default::default()
                };
                self.forward(rewrite.apply(req), req, id, delay.as_ref(), log)
                    .await
            }

            Action::ForwardTemplate { template, delay } => {
                let forwarded = self.template_engine.render_request(template, req)?;
                self.forward(forwarded, req, id, delay.as_ref(), log).await
            }

            Action::ForwardCallback {
                callback_name,
                delay,
            } => {
                // An unknown forward callback forwards the request unmodified.
                let forwarded = match self.callback_loader.forward_callback(callback_name) {
                    Some(callback) => callback(req),
                    None => {
                        tracing::debug!(
                            callback_name,
                            "forward callback not registered, forwarding unmodified"
                        );
                        req.clone()
                    }
                };
                self.forward(forwarded, req, id, delay.as_ref(), log).await
            }

            Action::ForwardObjectCallback { client_id, delay } => {
                match self.remote_callback(client_id, req).await? {
                    CallbackReply::Request(forwarded) => {
                        self.forward(forwarded, req, id, delay.as_ref(), log).await
                    }
                    CallbackReply::Response(_) => Err(DispatchFault::InvalidCallbackReply),
                }
            }

            Action::OverrideForwardedRequest { request, delay } => {
                self.forward(request.apply(req), req, id, delay.as_ref(), log)
                    .await
            }

            Action::Error {
                drop_connection,
                response_bytes,
                delay,
            } => {
                self.scheduler.delay(delay.as_ref()).await;
                log.append(LogEntry::Message {
                    message: format!(
                        "expectation {} answered with a connection error (drop_connection={})",
                        id, drop_connection
                    ),
                });

                // Dropping the connection takes precedence over configured bytes.
                if *drop_connection {
                    return Ok(DispatchOutcome::Close);
                }

                match response_bytes {
                    Some(encoded) => {
                        let raw = BASE64.decode(encoded)?;
                        Ok(DispatchOutcome::Raw(Bytes::from(raw)))
                    }
                    None => Ok(DispatchOutcome::Close),
                }
            }
        }
    }

    fn respond(
        &self,
        response: HttpResponse,
        req: &HttpRequest,
        expectation_id: usize,
        log: &EventLog,
    ) -> DispatchOutcome {
        log.append(LogEntry::RequestResponse {
            request: req.clone(),
            response: response.clone(),
            expectation_id: Some(expectation_id),
        });
        DispatchOutcome::Response(response)
    }

    async fn forward(
        &self,
        forwarded: HttpRequest,
        original: &HttpRequest,
        expectation_id: usize,
        delay: Option<&Delay>,
        log: &EventLog,
    ) -> Result<DispatchOutcome, DispatchFault> {
        self.scheduler.delay(delay).await;

        tracing::debug!(uri = forwarded.uri_str(), "forwarding request upstream");

        let mut upstream_req: ::http::Request<Bytes> = (&forwarded).try_into()?;

        // The client derives the host header from the upstream URI.
        upstream_req.headers_mut().remove(::http::header::HOST);

        let upstream_res = self
            .scheduler
            .timeout(self.forward_timeout, self.http_client.send(upstream_req))
            .await
            .map_err(|_| DispatchFault::UpstreamTimeout)??;

        let response = HttpResponse::try_from(&upstream_res)?;

        log.append(LogEntry::ForwardedRequest {
            request: original.clone(),
            forwarded,
            response: Some(response.clone()),
            expectation_id: Some(expectation_id),
        });

        Ok(DispatchOutcome::Response(response))
    }

    async fn remote_callback(
        &self,
        client_id: &str,
        req: &HttpRequest,
    ) -> Result<CallbackReply, DispatchFault> {
        let channel = self
            .callback_channel
            .as_ref()
            .ok_or(DispatchFault::CallbackUnavailable)?;

        let (correlation_id, reply) = self.callbacks.register();

        if !channel.deliver(client_id, &correlation_id, req).await {
            self.callbacks.abandon(&correlation_id);
            return Err(DispatchFault::CallbackDeliveryFailed(client_id.to_string()));
        }

        match self.scheduler.timeout(self.callback_timeout, reply).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(DispatchFault::CallbackCanceled),
            Err(_) => {
                self.callbacks.abandon(&correlation_id);
                Err(DispatchFault::CallbackTimeout)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn request(method: &str, uri: &str, body: &str) -> HttpRequest {
        HttpRequest::new(
            "http".to_string(),
            uri.to_string(),
            method.to_string(),
            Vec::new(),
            BodyBytes::from(body),
        )
    }

    #[test]
    fn placeholder_response_rendering_test() {
        let engine = PlaceholderTemplateEngine::new();
        let template = Template {
            kind: TemplateKind::Placeholder,
            template: r#"{"status": 200, "body": "{{request.method}} {{request.path}}"}"#
                .to_string(),
        };

        let response = engine
            .render_response(&template, &request("GET", "/hello?x=1", ""))
            .unwrap();

        assert_eq!(response.status, Some(200));
        assert_eq!(
            response.body.unwrap().to_maybe_lossy_str(),
            "GET /hello"
        );
    }

    #[test]
    fn placeholder_request_rendering_test() {
        let engine = PlaceholderTemplateEngine::new();
        let template = Template {
            kind: TemplateKind::Placeholder,
            template: r#"{"host": "upstream.example", "path": "/rewritten{{request.path}}"}"#
                .to_string(),
        };

        let forwarded = engine
            .render_request(&template, &request("GET", "/orders", ""))
            .unwrap();

        assert_eq!(forwarded.uri_str(), "http://upstream.example/rewritten/orders");
    }

    #[test]
    fn unsupported_template_kind_test() {
        let engine = PlaceholderTemplateEngine::new();
        let template = Template {
            kind: TemplateKind::Mustache,
            template: "{}".to_string(),
        };

        let result = engine.render_response(&template, &request("GET", "/", ""));
        assert!(matches!(result, Err(TemplateError::UnsupportedKind(_))));
    }

    #[test]
    fn invalid_rendering_test() {
        let engine = PlaceholderTemplateEngine::new();
        let template = Template {
            kind: TemplateKind::Placeholder,
            template: "not json".to_string(),
        };

        let result = engine.render_response(&template, &request("GET", "/", ""));
        assert!(matches!(result, Err(TemplateError::InvalidRendering(_))));
    }
}
