//! A one-shot asynchronous HTTP client.
//!
//! The request object is constructed in the `Created` state and driven by
//! `start()`. Transport-level failures (resolution, connect, send, a broken
//! read) are retried with a fixed spacing until the request succeeds, the
//! expiration timer fires, or the caller cancels. An optional endpoint
//! provider is consulted before every attempt so the target host/port may
//! be re-resolved after a failover.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Error;
use crate::method::Method;
use crate::url::Url;

/// Default cap of the response body size when the caller does not set one.
pub const DEFAULT_MAX_RESPONSE_BODY_SIZE: usize = 8 * 1024 * 1024;

/// Spacing between connection attempts.
const RETRY_IVAL: Duration = Duration::from_secs(1);

/// Re-resolves the `(host, port)` of the remote service before an attempt.
/// An error return makes the client reuse the previously known endpoint.
pub type HostPortProvider = Arc<dyn Fn() -> Result<(String, u16), Error> + Send + Sync>;

/// Completion callback; invoked exactly once, never under the internal
/// lock and never synchronously from within `cancel()`.
pub type OnFinish = Box<dyn FnOnce(AsyncReq) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The object was created and no request was initiated.
    Created,
    InProgress,
    /// Final state: a valid response was received.
    Finished,
    /// Final state: the request could not be delivered or understood.
    Failed,
    /// Final state: the response body is larger than requested. The code
    /// and the header remain accessible.
    BodyLimitError,
    /// Final state: explicitly cancelled before completion.
    Cancelled,
    /// Final state: the expiration timer fired before completion.
    Expired,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Created => "CREATED",
            State::InProgress => "IN_PROGRESS",
            State::Finished => "FINISHED",
            State::Failed => "FAILED",
            State::BodyLimitError => "BODY_LIMIT_ERROR",
            State::Cancelled => "CANCELLED",
            State::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, State::Created | State::InProgress)
    }
}

struct Shared {
    state: State,
    error: String,
    response_code: u16,
    /// Lower-cased header names; valid in `Finished` and `BodyLimitError`.
    response_headers: HashMap<String, String>,
    body: Bytes,
    on_finish: Option<OnFinish>,
}

struct Inner {
    client: reqwest::Client,
    method: Method,
    url: Url,
    data: Bytes,
    headers: Vec<(String, String)>,
    max_response_body_size: Mutex<usize>,
    expiration: Mutex<Duration>,
    host_port_provider: Mutex<Option<HostPortProvider>>,
    shared: Mutex<Shared>,
    cancel: CancellationToken,
    finished_tx: watch::Sender<bool>,
    finished_rx: watch::Receiver<bool>,
}

/// The retained request object. Clones share the same underlying request.
#[derive(Clone)]
pub struct AsyncReq {
    inner: Arc<Inner>,
}

impl AsyncReq {
    /// Validate the parameters and construct the request in the `Created`
    /// state. The actual execution is initiated by [`AsyncReq::start`].
    pub fn new(
        method: Method,
        url: &str,
        data: impl Into<Bytes>,
        headers: HashMap<String, String>,
    ) -> Result<Self, Error> {
        let url = Url::parse(url)?;
        let (finished_tx, finished_rx) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                client: reqwest::Client::new(),
                method,
                url,
                data: data.into(),
                headers: headers.into_iter().collect(),
                max_response_body_size: Mutex::new(DEFAULT_MAX_RESPONSE_BODY_SIZE),
                expiration: Mutex::new(Duration::ZERO),
                host_port_provider: Mutex::new(None),
                shared: Mutex::new(Shared {
                    state: State::Created,
                    error: String::new(),
                    response_code: 0,
                    response_headers: HashMap::new(),
                    body: Bytes::new(),
                    on_finish: None,
                }),
                cancel: CancellationToken::new(),
                finished_tx,
                finished_rx,
            }),
        })
    }

    /// Set the cap of the response body size. Zero selects the default
    /// internal limit.
    pub fn set_max_response_body_size(&self, size: usize) {
        *self.inner.max_response_body_size.lock() = if size == 0 {
            DEFAULT_MAX_RESPONSE_BODY_SIZE
        } else {
            size
        };
    }

    /// Set the total wall-clock budget from `start()` to any terminal
    /// state. Zero disables the timer.
    pub fn set_expiration(&self, expiration: Duration) {
        *self.inner.expiration.lock() = expiration;
    }

    /// Install the dynamic endpoint provider.
    pub fn set_host_port_provider(&self, provider: HostPortProvider) {
        *self.inner.host_port_provider.lock() = Some(provider);
    }

    /// Install the completion callback. Must be called before `start()`.
    pub fn set_on_finish(&self, on_finish: OnFinish) {
        self.inner.shared.lock().on_finish = Some(on_finish);
    }

    pub fn method(&self) -> Method {
        self.inner.method
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn state(&self) -> State {
        self.inner.shared.lock().state
    }

    /// Begin processing the request.
    ///
    /// Returns a logic error unless the request is still in the `Created`
    /// state (a cancelled or finished request cannot be restarted).
    pub fn start(&self) -> Result<(), Error> {
        {
            let mut shared = self.inner.shared.lock();
            if shared.state != State::Created {
                return Err(Error::Logic(format!(
                    "AsyncReq::start the current state {} is not CREATED",
                    shared.state.as_str()
                )));
            }
            shared.state = State::InProgress;
        }
        let this = self.clone();
        tokio::spawn(async move { this.drive().await });
        Ok(())
    }

    /// Cancel the ongoing request. Returns `false` if the request was
    /// already in a terminal state.
    pub fn cancel(&self) -> bool {
        let callback = {
            let mut shared = self.inner.shared.lock();
            match shared.state {
                State::Created | State::InProgress => {
                    shared.state = State::Cancelled;
                    shared.on_finish.take()
                }
                _ => return false,
            }
        };
        self.inner.cancel.cancel();
        self.notify(callback);
        true
    }

    /// Wait for the completion of the request.
    pub async fn wait(&self) {
        let mut rx = self.inner.finished_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// The last error message; meaningful in the terminal states.
    pub fn error_message(&self) -> String {
        self.inner.shared.lock().error.clone()
    }

    /// The HTTP status code; available in `Finished` and
    /// `BodyLimitError`.
    pub fn response_code(&self) -> Result<u16, Error> {
        let shared = self.inner.shared.lock();
        match shared.state {
            State::Finished | State::BodyLimitError => Ok(shared.response_code),
            state => Err(Error::Logic(format!(
                "AsyncReq::response_code not available in state {}",
                state.as_str()
            ))),
        }
    }

    /// A response header value (case-insensitive); available in
    /// `Finished` and `BodyLimitError`.
    pub fn response_header(&self, name: &str) -> Result<Option<String>, Error> {
        let shared = self.inner.shared.lock();
        match shared.state {
            State::Finished | State::BodyLimitError => {
                Ok(shared.response_headers.get(&name.to_lowercase()).cloned())
            }
            state => Err(Error::Logic(format!(
                "AsyncReq::response_header not available in state {}",
                state.as_str()
            ))),
        }
    }

    /// The response body; available only in `Finished`.
    pub fn response_body(&self) -> Result<Bytes, Error> {
        let shared = self.inner.shared.lock();
        match shared.state {
            State::Finished => Ok(shared.body.clone()),
            state => Err(Error::Logic(format!(
                "AsyncReq::response_body not available in state {}",
                state.as_str()
            ))),
        }
    }

    pub fn response_body_size(&self) -> Result<usize, Error> {
        Ok(self.response_body()?.len())
    }

    async fn drive(self) {
        let expiration = *self.inner.expiration.lock();
        let attempts = self.attempt_loop();
        let outcome = if expiration.is_zero() {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                outcome = attempts => outcome,
            }
        } else {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                outcome = attempts => outcome,
                _ = tokio::time::sleep(expiration) => {
                    self.finish(State::Expired, String::new(), None);
                    return;
                }
            }
        };
        match outcome {
            Outcome::Finished {
                code,
                headers,
                body,
            } => self.finish(State::Finished, String::new(), Some((code, headers, Some(body)))),
            Outcome::BodyLimit { code, headers } => self.finish(
                State::BodyLimitError,
                "the response body is larger than requested".to_owned(),
                Some((code, headers, None)),
            ),
            Outcome::Failed(error) => self.finish(State::Failed, error, None),
        }
    }

    /// Retry transport failures forever; the caller bounds the loop with
    /// cancellation or expiration.
    async fn attempt_loop(&self) -> Outcome {
        let mut endpoint: Option<(String, u16)> = None;
        loop {
            if let Some(provider) = self.inner.host_port_provider.lock().clone() {
                match provider() {
                    Ok(host_port) => endpoint = Some(host_port),
                    Err(e) => {
                        // Reuse the previous endpoint.
                        warn!(
                            "AsyncReq endpoint provider failed: {e}, url: {}",
                            self.inner.url
                        );
                    }
                }
            }
            match self.attempt(endpoint.as_ref()).await {
                AttemptResult::Done(outcome) => return outcome,
                AttemptResult::Retry(error) => {
                    warn!(
                        "AsyncReq attempt failed: {error}, method: {}, url: {}",
                        self.inner.method, self.inner.url
                    );
                    tokio::time::sleep(RETRY_IVAL).await;
                }
            }
        }
    }

    async fn attempt(&self, endpoint: Option<&(String, u16)>) -> AttemptResult {
        let url = match endpoint {
            Some((host, port)) => format!("http://{host}:{port}{}", self.inner.url.target()),
            None => self.inner.url.as_str().to_owned(),
        };
        let mut request = self
            .inner
            .client
            .request(self.inner.method.into(), &url)
            .body(self.inner.data.clone());
        for (name, value) in &self.inner.headers {
            request = request.header(name, value);
        }
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_builder() => {
                // Malformed request parameters cannot succeed on a retry.
                return AttemptResult::Done(Outcome::Failed(format!(
                    "failed to build the request: {e}"
                )));
            }
            Err(e) => return AttemptResult::Retry(format!("failed to send the request: {e}")),
        };

        let code = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_lowercase(),
                    value.to_str().unwrap_or_default().to_owned(),
                )
            })
            .collect();

        // Read the body up to the cap; going over it is a terminal,
        // distinguishable failure that preserves the header.
        let max_response_body_size = *self.inner.max_response_body_size.lock();
        let mut body = Vec::new();
        let mut stream = response;
        loop {
            match stream.chunk().await {
                Ok(Some(chunk)) => {
                    if body.len() + chunk.len() > max_response_body_size {
                        return AttemptResult::Done(Outcome::BodyLimit { code, headers });
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => {
                    return AttemptResult::Retry(format!("failed to read the response body: {e}"))
                }
            }
        }
        AttemptResult::Done(Outcome::Finished {
            code,
            headers,
            body: Bytes::from(body),
        })
    }

    fn finish(
        &self,
        state: State,
        error: String,
        response: Option<(u16, HashMap<String, String>, Option<Bytes>)>,
    ) {
        let callback = {
            let mut shared = self.inner.shared.lock();
            if shared.state != State::InProgress {
                // cancel() got there first.
                return;
            }
            shared.state = state;
            shared.error = error;
            if let Some((code, headers, body)) = response {
                shared.response_code = code;
                shared.response_headers = headers;
                if let Some(body) = body {
                    shared.body = body;
                }
            }
            shared.on_finish.take()
        };
        self.notify(callback);
    }

    /// Fire the completion callback (if any) outside the lock and wake
    /// the waiters. Taking the callback out of the shared state
    /// guarantees exactly-once delivery and breaks reference cycles with
    /// closures that captured this request.
    fn notify(&self, callback: Option<OnFinish>) {
        if let Some(callback) = callback {
            let this = self.clone();
            tokio::spawn(async move { callback(this) });
        }
        let _ = self.inner.finished_tx.send(true);
    }
}

enum Outcome {
    Finished {
        code: u16,
        headers: HashMap<String, String>,
        body: Bytes,
    },
    BodyLimit {
        code: u16,
        headers: HashMap<String, String>,
    },
    Failed(String),
}

enum AttemptResult {
    Done(Outcome),
    Retry(String),
}
