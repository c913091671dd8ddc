use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use hyper::header::CONTENT_LENGTH;
use hyper::service::service_fn;
use hyper::{Body, Method, StatusCode};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ajax::AjaxEndpoint;
use crate::request::Request;
use crate::response::Response;
use crate::router::{normalize_path, NormalizedPath, Pattern};
use crate::{static_content, Error};

/// Listener and processing parameters of the embedded server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// 0 binds an ephemeral port; see [`Server::port`] after `start()`.
    pub port: u16,
    /// Upper bound on concurrently served connections. Connections beyond
    /// the bound are dropped at accept time. `None` leaves it unbounded.
    pub max_queued_requests: Option<usize>,
    /// Budget for one request/response exchange. Long-poll endpoints are
    /// exempt.
    pub request_timeout: Duration,
    /// Upper bound of one buffered chunk when streaming large responses.
    pub max_response_buf_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_owned(),
            port: 0,
            max_queued_requests: None,
            request_timeout: Duration::from_secs(300),
            max_response_buf_size: 2 * 1024 * 1024,
        }
    }
}

type HandlerFuture = BoxFuture<'static, Result<Response, std::io::Error>>;
type BufferedHandler = Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>;
type StreamingHandler = Arc<dyn Fn(Request, Body) -> HandlerFuture + Send + Sync>;

enum RouteKind {
    /// The body is buffered before the handler runs.
    Buffered(BufferedHandler),
    /// The handler drives the body itself.
    Streaming(StreamingHandler),
    /// A static content tree mounted under a wildcard pattern.
    StaticContent(PathBuf),
    /// A long-poll endpoint; requests pend until `update()`.
    Ajax(Arc<AjaxEndpoint>),
}

struct Route {
    method: Method,
    pattern: Pattern,
    kind: RouteKind,
}

struct Inner {
    config: ServerConfig,
    routes: Mutex<Vec<Arc<Route>>>,
}

/// The embedded HTTP/1.1 server.
///
/// Handlers are registered up front; `start()` binds the listener and
/// serves until `stop()`. The server may be started again after a stop.
pub struct Server {
    inner: Arc<Inner>,
    state: Mutex<LifecycleState>,
}

#[derive(Default)]
struct LifecycleState {
    port: u16,
    cancel: Option<CancellationToken>,
    accept_task: Option<JoinHandle<()>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                routes: Mutex::new(Vec::new()),
            }),
            state: Mutex::new(LifecycleState::default()),
        }
    }

    /// Register a handler that receives the request with the body already
    /// buffered.
    pub fn add_handler<F, Fut>(&self, method: Method, pattern: &str, handler: F) -> Result<(), Error>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Response, std::io::Error>> + Send + 'static,
    {
        let handler: BufferedHandler = Arc::new(move |req| handler(req).boxed());
        self.add_route(method, pattern, RouteKind::Buffered(handler))
    }

    /// Register a handler that drives the request body itself.
    pub fn add_streaming_handler<F, Fut>(
        &self,
        method: Method,
        pattern: &str,
        handler: F,
    ) -> Result<(), Error>
    where
        F: Fn(Request, Body) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Response, std::io::Error>> + Send + 'static,
    {
        let handler: StreamingHandler = Arc::new(move |req, body| handler(req, body).boxed());
        self.add_route(method, pattern, RouteKind::Streaming(handler))
    }

    /// Mount a directory tree under a wildcard pattern, e.g.
    /// `("/www/*", "/usr/share/www")`.
    pub fn add_static_content(&self, pattern: &str, root: impl Into<PathBuf>) -> Result<(), Error> {
        self.add_route(Method::GET, pattern, RouteKind::StaticContent(root.into()))
    }

    /// Register a long-poll endpoint. GET requests pend on the returned
    /// handle until [`AjaxEndpoint::update`] is called.
    pub fn add_ajax_endpoint(&self, pattern: &str) -> Result<Arc<AjaxEndpoint>, Error> {
        let endpoint = AjaxEndpoint::new();
        self.add_route(Method::GET, pattern, RouteKind::Ajax(endpoint.clone()))?;
        Ok(endpoint)
    }

    fn add_route(&self, method: Method, pattern: &str, kind: RouteKind) -> Result<(), Error> {
        let pattern = Pattern::parse(pattern)?;
        self.inner.routes.lock().push(Arc::new(Route {
            method,
            pattern,
            kind,
        }));
        Ok(())
    }

    /// Bind the listener and begin serving. May be called again after
    /// `stop()`.
    pub async fn start(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.accept_task.is_some() {
            return Err(Error::State("the server is already running".to_owned()));
        }
        let addr: SocketAddr = format!("{}:{}", self.inner.config.bind_addr, self.inner.config.port)
            .parse()
            .map_err(|e| Error::State(format!("invalid bind address: {e}")))?;
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let port = listener.local_addr()?.port();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(self.inner.clone(), listener, cancel.clone()));

        state.port = port;
        state.cancel = Some(cancel);
        state.accept_task = Some(task);
        info!(port, "http server started");
        Ok(())
    }

    /// The bound port; valid after a successful `start()`.
    pub fn port(&self) -> u16 {
        self.state.lock().port
    }

    /// Close the listener and refuse further operations. In-flight
    /// connections are aborted.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = state.accept_task.take() {
            task.abort();
        }
        info!("http server stopped");
    }

    /// Wait until the accept loop exits.
    pub async fn wait(&self) {
        let task = self.state.lock().accept_task.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, cancel: CancellationToken) {
    let limiter = inner
        .config
        .max_queued_requests
        .map(|n| Arc::new(Semaphore::new(n)));
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let (stream, remote_addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        let permit = match &limiter {
            Some(limiter) => match limiter.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    debug!(%remote_addr, "dropping oversubscribed connection");
                    continue;
                }
            },
            None => None,
        };
        let inner = inner.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let service = service_fn(move |req| handle_request(inner.clone(), remote_addr, req));
            let conn = hyper::server::conn::Http::new()
                .http1_keep_alive(true)
                .serve_connection(stream, service);
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = conn => {
                    if let Err(e) = result {
                        debug!(%remote_addr, "connection error: {e}");
                    }
                }
            }
        });
    }
}

async fn handle_request(
    inner: Arc<Inner>,
    remote_addr: SocketAddr,
    req: hyper::Request<Body>,
) -> Result<hyper::Response<Body>, std::convert::Infallible> {
    let response = dispatch(inner, remote_addr, req).await;
    Ok(response.into_hyper())
}

async fn dispatch(inner: Arc<Inner>, remote_addr: SocketAddr, req: hyper::Request<Body>) -> Response {
    let (parts, body) = req.into_parts();
    let raw_path = parts.uri.path().to_owned();

    let segments = match normalize_path(&raw_path) {
        NormalizedPath::Segments(segments) => segments,
        NormalizedPath::EscapesRoot => {
            return Response::error_html(StatusCode::FORBIDDEN, "path escapes the document root")
        }
        NormalizedPath::Malformed => {
            return Response::error_html(StatusCode::BAD_REQUEST, "malformed request path")
        }
    };

    // A Content-Length that is present but unparsable is a protocol error.
    if let Some(value) = parts.headers.get(CONTENT_LENGTH) {
        let valid = value
            .to_str()
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .is_some();
        if !valid {
            return Response::error_html(StatusCode::BAD_REQUEST, "malformed Content-Length");
        }
    }

    let routes = inner.routes.lock().clone();
    let matched = routes.iter().find_map(|route| {
        if route.method != parts.method {
            return None;
        }
        route.pattern.matches(&segments).map(|params| (route.clone(), params))
    });
    let Some((route, params)) = matched else {
        return Response::error_html(StatusCode::NOT_FOUND, "no handler for the resource");
    };

    let query = parts
        .uri
        .query()
        .map(Request::parse_query)
        .unwrap_or_default();
    let mut request = Request {
        method: parts.method.clone(),
        path: format!("/{}", segments.join("/")),
        version: format!("{:?}", parts.version),
        params,
        query,
        headers: parts.headers,
        remote_addr,
        body: bytes::Bytes::new(),
    };

    let timeout = inner.config.request_timeout;
    let outcome = match &route.kind {
        RouteKind::Buffered(handler) => {
            let body = match hyper::body::to_bytes(body).await {
                Ok(body) => body,
                Err(e) => {
                    return Response::error_html(
                        StatusCode::BAD_REQUEST,
                        &format!("failed to read the request body: {e}"),
                    )
                }
            };
            request.body = body;
            let handler = handler.clone();
            run_with_timeout(timeout, handler(request)).await
        }
        RouteKind::Streaming(handler) => {
            let handler = handler.clone();
            run_with_timeout(timeout, handler(request, body)).await
        }
        RouteKind::StaticContent(root) => {
            let root = root.clone();
            let rel = request.params.get("*").cloned().unwrap_or_default();
            let original_path = raw_path.clone();
            run_with_timeout(
                timeout,
                async move { Ok(static_content::serve(&root, &rel, &original_path).await) }.boxed(),
            )
            .await
        }
        RouteKind::Ajax(endpoint) => {
            // Long-poll: hang until the endpoint is updated, exempt from
            // the request timeout.
            let rx = endpoint.subscribe();
            match rx.await {
                Ok(payload) => Ok(Response::text(
                    StatusCode::OK,
                    bytes::Bytes::from(payload),
                    "application/json",
                )),
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "the endpoint was dropped",
                )),
            }
        }
    };

    match outcome {
        Ok(response) => response,
        Err(e) => {
            let status = match e.kind() {
                std::io::ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
                std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
                std::io::ErrorKind::TimedOut => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            Response::error_html(status, &e.to_string())
        }
    }
}

async fn run_with_timeout(
    timeout: Duration,
    fut: HandlerFuture,
) -> Result<Response, std::io::Error> {
    // A handler panic must not take the connection down silently.
    let guarded = std::panic::AssertUnwindSafe(fut).catch_unwind();
    match tokio::time::timeout(timeout, guarded).await {
        Ok(Ok(result)) => result,
        Ok(Err(_panic)) => Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "the request handler panicked",
        )),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "the request processing timed out",
        )),
    }
}
