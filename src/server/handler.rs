use crate::{
    common::data::{
        Error as DataError, ExpectationDefinition, HttpRequest, RequestTemplate,
        RetrieveKind, SequenceVerificationRequest, VerificationRequest,
    },
    server::{
        dispatch::DispatchOutcome,
        handler::Error::{
            ParamError, ParamFormatError, RequestBodyDeserializeError, RequestConversionError,
            ResponseBodyConversionError, ResponseBodySerializeError,
        },
        state,
        state::MockCore,
    },
};

use async_trait::async_trait;
use http::StatusCode;
use hyper::{body::Bytes, Method, Request, Response};
use path_tree::{Path, PathTree};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fmt::{Debug, Display},
    str::FromStr,
    sync::Arc,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot deserialize request body: {0}")]
    RequestBodyDeserializeError(serde_json::Error),
    #[error("cannot serialize response body: {0}")]
    ResponseBodySerializeError(serde_json::Error),
    #[error("cannot convert response body: {0}")]
    ResponseBodyConversionError(http::Error),
    #[error("expected URL parameters not found")]
    ParamError,
    #[error("URL parameter format is invalid: {0}")]
    ParamFormatError(String),
    #[error("invalid retrieve type: {0}")]
    RetrieveKindError(String),
    #[error("cannot modify state: {0}")]
    StateError(#[from] state::Error),
    #[error("invalid status code: {0}")]
    InvalidStatusCode(#[from] http::status::InvalidStatusCode),
    #[error("cannot convert request to internal data structure: {0}")]
    RequestConversionError(String),
}

/// What the transport should do with a routed request. Most requests produce a
/// regular HTTP response; fault injection can replace it with raw bytes or ask
/// for the connection to be dropped without writing anything.
#[derive(Debug)]
pub enum RoutedResponse {
    Http(Response<Bytes>),
    Raw(Bytes),
    Close,
}

enum RoutePath {
    Ping,
    Reset,
    ExpectationCollection,
    SingleExpectation,
    Clear,
    Retrieve,
    Verify,
    VerifySequence,
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: Request<Bytes>) -> Result<RoutedResponse, Error>;
}

/// Routes control-plane requests under `/__mockd__/` to [`MockCore`] operations
/// and hands everything else to the matching core.
pub struct MockdHandler {
    path_tree: PathTree<RoutePath>,
    core: Arc<MockCore>,
}

#[async_trait]
impl Handler for MockdHandler {
    async fn handle(&self, req: Request<Bytes>) -> Result<RoutedResponse, Error> {
        tracing::trace!("routing incoming request: {:?}", req);

        let method = req.method().clone();
        let path = req.uri().path().to_string();

        if let Some((matched_path, params)) = self.path_tree.find(&path) {
            match matched_path {
                RoutePath::Ping => {
                    if method == Method::GET {
                        return self.handle_ping();
                    }
                }
                RoutePath::Reset => {
                    if method == Method::DELETE {
                        return self.handle_reset();
                    }
                }
                RoutePath::ExpectationCollection => match method {
                    Method::POST => return self.handle_add_expectation(req),
                    Method::GET => return self.handle_list_expectations(),
                    Method::DELETE => return self.handle_delete_all_expectations(),
                    _ => {}
                },
                RoutePath::SingleExpectation => {
                    if method == Method::DELETE {
                        return self.handle_delete_expectation(params);
                    }
                }
                RoutePath::Clear => {
                    if method == Method::POST {
                        return self.handle_clear(req);
                    }
                }
                RoutePath::Retrieve => {
                    if method == Method::POST {
                        return self.handle_retrieve(req);
                    }
                }
                RoutePath::Verify => {
                    if method == Method::POST {
                        return self.handle_verify(req);
                    }
                }
                RoutePath::VerifySequence => {
                    if method == Method::POST {
                        return self.handle_verify_sequence(req);
                    }
                }
            }
        }

        self.catch_all(req).await
    }
}

impl MockdHandler {
    pub fn new(core: Arc<MockCore>) -> Self {
        let mut path_tree: PathTree<RoutePath> = PathTree::new();
        #[allow(unused_must_use)]
        {
            path_tree.insert("/__mockd__/ping", RoutePath::Ping);
            path_tree.insert("/__mockd__/state", RoutePath::Reset);
            path_tree.insert("/__mockd__/expectations", RoutePath::ExpectationCollection);
            path_tree.insert("/__mockd__/expectations/:id", RoutePath::SingleExpectation);
            path_tree.insert("/__mockd__/clear", RoutePath::Clear);
            path_tree.insert("/__mockd__/retrieve", RoutePath::Retrieve);
            path_tree.insert("/__mockd__/verify", RoutePath::Verify);
            path_tree.insert("/__mockd__/verify/sequence", RoutePath::VerifySequence);
        }

        Self { path_tree, core }
    }

    fn handle_ping(&self) -> Result<RoutedResponse, Error> {
        response::<()>(StatusCode::OK, None)
    }

    fn handle_reset(&self) -> Result<RoutedResponse, Error> {
        self.core.reset();
        response::<()>(StatusCode::NO_CONTENT, None)
    }

    fn handle_add_expectation(&self, req: Request<Bytes>) -> Result<RoutedResponse, Error> {
        let definition: ExpectationDefinition = parse_json_body(req)?;
        let active = self.core.add_expectation(definition)?;
        response(StatusCode::CREATED, Some(active))
    }

    fn handle_list_expectations(&self) -> Result<RoutedResponse, Error> {
        response(StatusCode::OK, Some(self.core.active_expectations(None)))
    }

    fn handle_delete_expectation(&self, params: Path) -> Result<RoutedResponse, Error> {
        let deleted = self.core.remove_expectation(param("id", params)?);
        let status_code = if deleted {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::NOT_FOUND
        };
        response::<()>(status_code, None)
    }

    fn handle_delete_all_expectations(&self) -> Result<RoutedResponse, Error> {
        self.core.clear(None);
        response::<()>(StatusCode::NO_CONTENT, None)
    }

    fn handle_clear(&self, req: Request<Bytes>) -> Result<RoutedResponse, Error> {
        let filter: Option<RequestTemplate> = parse_optional_json_body(req)?;
        self.core.clear(filter.as_ref());
        response::<()>(StatusCode::NO_CONTENT, None)
    }

    fn handle_retrieve(&self, req: Request<Bytes>) -> Result<RoutedResponse, Error> {
        let kind = match query_param(&req, "type") {
            None => RetrieveKind::Requests,
            Some(value) => value.parse().map_err(Error::RetrieveKindError)?,
        };
        let filter: Option<RequestTemplate> = parse_optional_json_body(req)?;
        let result = self.core.retrieve(kind, filter.as_ref());
        response(StatusCode::OK, Some(result))
    }

    fn handle_verify(&self, req: Request<Bytes>) -> Result<RoutedResponse, Error> {
        let verification: VerificationRequest = parse_json_body(req)?;
        match self.core.verify(&verification) {
            Ok(()) => response::<()>(StatusCode::ACCEPTED, None),
            Err(mismatch) => response(StatusCode::NOT_ACCEPTABLE, Some(mismatch)),
        }
    }

    fn handle_verify_sequence(&self, req: Request<Bytes>) -> Result<RoutedResponse, Error> {
        let verification: SequenceVerificationRequest = parse_json_body(req)?;
        match self.core.verify_sequence(&verification) {
            Ok(()) => response::<()>(StatusCode::ACCEPTED, None),
            Err(mismatch) => response(StatusCode::NOT_ACCEPTABLE, Some(mismatch)),
        }
    }

    async fn catch_all(&self, req: Request<Bytes>) -> Result<RoutedResponse, Error> {
        let internal_request: HttpRequest = (&req)
            .try_into()
            .map_err(|err: DataError| RequestConversionError(err.to_string()))?;

        match self.core.dispatch(internal_request).await {
            DispatchOutcome::Response(res) => {
                let status_code = match res.status {
                    None => StatusCode::OK,
                    Some(code) => StatusCode::from_u16(code)?,
                };

                let mut builder = Response::builder().status(status_code);

                if let Some(headers) = res.headers {
                    for (name, value) in headers {
                        builder = builder.header(name, value);
                    }
                }

                let response = builder
                    .body(res.body.map_or(Bytes::new(), |bytes| bytes.to_bytes()))
                    .map_err(ResponseBodyConversionError)?;

                Ok(RoutedResponse::Http(response))
            }
            DispatchOutcome::Raw(bytes) => Ok(RoutedResponse::Raw(bytes)),
            DispatchOutcome::Close => Ok(RoutedResponse::Close),
        }
    }
}

fn param<T>(name: &str, tree_path: Path) -> Result<T, Error>
where
    T: FromStr,
    T::Err: Debug + Display,
{
    for (n, v) in tree_path.params() {
        if n.eq(name) {
            let parse_result: Result<T, T::Err> = v.parse::<T>();
            let parsed_value = parse_result.map_err(|e| ParamFormatError(format!("{:?}", e)))?;
            return Ok(parsed_value);
        }
    }

    Err(ParamError)
}

fn query_param(req: &Request<Bytes>, name: &str) -> Option<String> {
    let query = req.uri().query().unwrap_or("");
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn response<T>(status: StatusCode, body: Option<T>) -> Result<RoutedResponse, Error>
where
    T: Serialize,
{
    let mut builder = Response::builder().status(status);

    if let Some(body_obj) = body {
        builder = builder.header("content-type", "application/json");

        let body_bytes = serde_json::to_vec(&body_obj).map_err(ResponseBodySerializeError)?;

        return Ok(RoutedResponse::Http(
            builder
                .body(Bytes::from(body_bytes))
                .map_err(ResponseBodyConversionError)?,
        ));
    }

    Ok(RoutedResponse::Http(
        builder
            .body(Bytes::new())
            .map_err(ResponseBodyConversionError)?,
    ))
}

fn parse_json_body<T>(req: Request<Bytes>) -> Result<T, Error>
where
    T: DeserializeOwned,
{
    let body: T =
        serde_json::from_slice(req.body().as_ref()).map_err(RequestBodyDeserializeError)?;
    Ok(body)
}

fn parse_optional_json_body<T>(req: Request<Bytes>) -> Result<Option<T>, Error>
where
    T: DeserializeOwned,
{
    if req.body().is_empty() {
        return Ok(None);
    }

    Ok(Some(parse_json_body(req)?))
}
