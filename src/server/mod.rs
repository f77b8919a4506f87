pub mod builder;
pub mod callback;
pub mod dispatch;
pub mod handler;
pub mod log;
pub mod matchers;
pub mod scheduler;
pub mod state;
pub mod store;

use futures_util::FutureExt;
use http::{Request, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::{
    body::{Bytes, Incoming},
    service::service_fn,
    Response,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ServerBuilder,
};
use std::{
    future::{pending, Future},
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
    sync::oneshot::Sender,
    task::spawn,
};

use crate::{
    common::data::ErrorResponse,
    server::{
        handler::{Handler, RoutedResponse},
        Error::{
            BufferError, LocalSocketAddrError, PublishSocketAddrError, RouterError,
            SocketBindError,
        },
    },
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot bind to socket addr {0}: {1}")]
    SocketBindError(SocketAddr, std::io::Error),
    #[error("cannot parse socket address: {0}")]
    SocketAddrParseError(#[from] std::net::AddrParseError),
    #[error("cannot obtain local socket address: {0}")]
    LocalSocketAddrError(std::io::Error),
    #[error("cannot send reserved TCP address to test thread {0}")]
    PublishSocketAddrError(SocketAddr),
    #[error("buffering error: {0}")]
    BufferError(hyper::Error),
    #[error("HTTP error: {0}")]
    HTTPError(#[from] http::Error),
    #[error("cannot process request: {0}")]
    RouterError(#[from] handler::Error),
    #[error("server connection error: {0}")]
    ServerConnectionError(Box<dyn std::error::Error + Send + Sync>),
}

/// Per-request connection metadata, attached to request extensions by the
/// transport so conversions can recover the scheme.
#[derive(Debug, Clone)]
pub(crate) struct RequestMetadata {
    pub scheme: &'static str,
}

impl RequestMetadata {
    pub fn new(scheme: &'static str) -> Self {
        Self { scheme }
    }
}

pub struct MockServerConfig {
    pub static_port: Option<u16>,
    pub expose: bool,
}

/// The TCP front of the mock: accepts connections, speaks HTTP/1 via hyper and
/// hands buffered requests to the [`Handler`]. Fault-injection outcomes bypass
/// hyper's response writing through a per-connection write override.
pub struct MockServer<H>
where
    H: Handler + Send + Sync + 'static,
{
    handler: Box<H>,
    config: MockServerConfig,
}

impl<H> MockServer<H>
where
    H: Handler + Send + Sync + 'static,
{
    pub fn new(handler: Box<H>, config: MockServerConfig) -> Self {
        MockServer { handler, config }
    }

    /// Starts the server and runs until the process ends.
    pub async fn start(self) -> Result<(), Error> {
        self.start_with_signals(None, pending()).await
    }

    /// Starts the server, optionally publishing the bound address, and runs the
    /// accept loop until the shutdown future resolves.
    pub async fn start_with_signals<F>(
        self,
        socket_addr_sender: Option<Sender<SocketAddr>>,
        shutdown: F,
    ) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let host = if self.config.expose {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        };
        let addr: SocketAddr =
            format!("{}:{}", host, self.config.static_port.unwrap_or(0)).parse()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SocketBindError(addr, e))?;

        let local_addr = listener.local_addr().map_err(LocalSocketAddrError)?;
        if let Some(sender) = socket_addr_sender {
            sender.send(local_addr).map_err(PublishSocketAddrError)?;
        }

        tracing::info!("listening on {}", local_addr);
        self.run_accept_loop(listener, shutdown).await
    }

    async fn run_accept_loop<F>(self, listener: TcpListener, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let shutdown = shutdown.shared();
        let server = Arc::new(self);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((tcp_stream, remote_address)) => {
                            let server = server.clone();
                            spawn(async move {
                                if let Err(err) = serve_connection(server, tcp_stream, remote_address).await {
                                    tracing::error!("{:?}", err);
                                }
                            });
                        },
                        Err(err) => {
                            tracing::error!("TCP accept error: {:?}", err);
                        },
                    };
                }
                _ = shutdown.clone() => {
                    break;
                }
            }
        }

        Ok(())
    }

    async fn service(
        self: Arc<Self>,
        req: Request<Incoming>,
        overrides: OverrideSlot,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Error> {
        tracing::trace!("new HTTP request received: {}", req.uri());

        let req = match buffer_request(req).await {
            Ok(req) => req,
            Err(err) => {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, BufferError(err));
            }
        };

        match self.handler.handle(req).await {
            Ok(RoutedResponse::Http(response)) => to_service_response(response),
            Ok(RoutedResponse::Raw(bytes)) => {
                overrides.set_raw(bytes);
                // The override swallows this response and writes the raw bytes instead.
                Ok(Response::builder().status(StatusCode::OK).body(empty())?)
            }
            Ok(RoutedResponse::Close) => {
                overrides.set_close();
                Ok(Response::builder().status(StatusCode::OK).body(empty())?)
            }
            Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, RouterError(err)),
        }
    }
}

async fn serve_connection<H>(
    server: Arc<MockServer<H>>,
    stream: TcpStream,
    remote_address: SocketAddr,
) -> Result<(), Error>
where
    H: Handler + Send + Sync + 'static,
{
    tracing::trace!("new TCP connection from {}", remote_address);

    let overrides = OverrideSlot::new();
    let guarded = GuardedStream::new(stream, overrides.clone());

    let mut server_builder = ServerBuilder::new(TokioExecutor::new());
    server_builder.http1().preserve_header_case(true);

    server_builder
        .serve_connection(
            TokioIo::new(guarded),
            service_fn(move |mut req| {
                req.extensions_mut().insert(RequestMetadata::new("http"));
                server.clone().service(req, overrides.clone())
            }),
        )
        .await
        .map_err(Error::ServerConnectionError)
}

async fn buffer_request(req: Request<Incoming>) -> Result<Request<Bytes>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    Ok(Request::from_parts(parts, body))
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn error_response(
    code: StatusCode,
    err: Error,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Error> {
    tracing::error!("failed to process request: {}", err);
    let body = serde_json::to_vec(&ErrorResponse::new(&err))
        .unwrap_or_else(|_| b"{\"message\":\"internal error\"}".to_vec());
    Ok(Response::builder()
        .status(code)
        .header("content-type", "application/json")
        .body(full(body))?)
}

fn to_service_response(
    response: Response<Bytes>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Error> {
    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, full(body)))
}

enum WriteOverride {
    None,
    Raw(Bytes),
    Close,
}

/// Shared between the service and the connection's [`GuardedStream`]. Setting an
/// override redirects or aborts everything hyper writes afterwards.
#[derive(Clone)]
struct OverrideSlot(Arc<Mutex<WriteOverride>>);

impl OverrideSlot {
    fn new() -> Self {
        OverrideSlot(Arc::new(Mutex::new(WriteOverride::None)))
    }

    fn set_raw(&self, bytes: Bytes) {
        *self.0.lock().unwrap() = WriteOverride::Raw(bytes);
    }

    fn set_close(&self) {
        *self.0.lock().unwrap() = WriteOverride::Close;
    }

    fn take(&self) -> WriteOverride {
        std::mem::replace(&mut *self.0.lock().unwrap(), WriteOverride::None)
    }
}

/// Wraps the TCP stream under hyper. Reads pass through untouched. While no
/// override is set, writes pass through as well. Once the service arms the
/// override, hyper's serialized response is swallowed and the connection either
/// carries the raw override bytes or fails writing, which makes hyper tear the
/// connection down without a response.
struct GuardedStream<S> {
    stream: S,
    overrides: OverrideSlot,
    pending: Option<Bytes>,
    pending_pos: usize,
    closed: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> GuardedStream<S> {
    fn new(stream: S, overrides: OverrideSlot) -> Self {
        GuardedStream {
            stream,
            overrides,
            pending: None,
            pending_pos: 0,
            closed: false,
        }
    }

    fn absorb_override(&mut self) {
        if self.closed || self.pending.is_some() {
            return;
        }
        match self.overrides.take() {
            WriteOverride::None => {}
            WriteOverride::Raw(bytes) => {
                self.pending = Some(bytes);
                self.pending_pos = 0;
            }
            WriteOverride::Close => {
                self.closed = true;
            }
        }
    }

    /// Writes as much of the pending raw payload as the socket accepts. Once it
    /// is fully written the connection refuses further writes.
    fn drain_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while let Some(pending) = &self.pending {
            let remaining = &pending[self.pending_pos..];
            if remaining.is_empty() {
                self.pending = None;
                self.closed = true;
                break;
            }
            match Pin::new(&mut self.stream).poll_write(cx, remaining) {
                Poll::Ready(Ok(written)) => self.pending_pos += written,
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for GuardedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for GuardedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = self.get_mut();
        this.absorb_override();

        if this.pending.is_some() {
            match this.drain_pending(cx) {
                Poll::Ready(Ok(())) | Poll::Pending => {
                    // Swallow hyper's bytes, the raw payload replaces them.
                    return Poll::Ready(Ok(buf.len()));
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            }
        }

        if this.closed {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }

        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        this.absorb_override();

        if this.pending.is_some() {
            match this.drain_pending(cx) {
                Poll::Ready(Ok(())) => {}
                other => return other,
            }
        }

        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();

        if this.pending.is_some() {
            match this.drain_pending(cx) {
                Poll::Ready(Ok(())) => {}
                other => return other,
            }
        }

        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}
