//! Retained request objects for the worker-management RPCs.
//!
//! A [`MgmtRequest`] wraps one outbound HTTP call to a worker-management
//! service with a two-level state machine, an expiration timer, idempotent
//! cancellation and an exactly-once completion callback. The
//! request-specific material (target, body, response interpretation) is
//! supplied by a [`MgmtRequestKind`] implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::debug;

use crate::async_req::{AsyncReq, HostPortProvider, State as ReqState};
use crate::error::Error;
use crate::method::Method;

/// The primary public state of a management request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtState {
    Created,
    InProgress,
    Finished,
}

impl MgmtState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MgmtState::Created => "CREATED",
            MgmtState::InProgress => "IN_PROGRESS",
            MgmtState::Finished => "FINISHED",
        }
    }
}

/// The refined sub-state of a request once it is `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedState {
    None,
    Success,
    ConfigError,
    BodyLimitError,
    ServerBad,
    ServerChunkInUse,
    ServerError,
    ServerBadResponse,
    TimeoutExpired,
    Cancelled,
}

impl ExtendedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtendedState::None => "NONE",
            ExtendedState::Success => "SUCCESS",
            ExtendedState::ConfigError => "CONFIG_ERROR",
            ExtendedState::BodyLimitError => "BODY_LIMIT_ERROR",
            ExtendedState::ServerBad => "SERVER_BAD",
            ExtendedState::ServerChunkInUse => "SERVER_CHUNK_IN_USE",
            ExtendedState::ServerError => "SERVER_ERROR",
            ExtendedState::ServerBadResponse => "SERVER_BAD_RESPONSE",
            ExtendedState::TimeoutExpired => "TIMEOUT_EXPIRED",
            ExtendedState::Cancelled => "CANCELLED",
        }
    }
}

/// Millisecond epochs of the request's milestones.
#[derive(Debug, Clone, Copy, Default)]
pub struct Performance {
    pub created_at: i64,
    pub started_at: i64,
    pub finished_at: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The HTTP call materialized by a request kind.
pub struct HttpReqSpec {
    pub method: Method,
    pub target: String,
    pub body: Value,
}

/// Request-specific material of a management request.
pub trait MgmtRequestKind: Send + 'static {
    /// String representing the request type, used for bookkeeping.
    fn type_name(&self) -> &'static str;

    /// Materialize the underlying HTTP request.
    fn create_http_req(&self) -> HttpReqSpec;

    /// Interpret the successfully received data object and choose the
    /// final extended state. Errors land the request in
    /// `SERVER_BAD_RESPONSE`.
    fn data_ready(&mut self, _data: &Value) -> Result<ExtendedState, Error> {
        Ok(ExtendedState::Success)
    }

    /// An ordered list of `(key, value)` pairs for optional storage.
    fn extended_persistent_state(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

pub type MgmtCallback<K> = Box<dyn FnOnce(MgmtRequest<K>) + Send>;

struct Shared<K: MgmtRequestKind> {
    state: MgmtState,
    extended_state: ExtendedState,
    server_error: String,
    info: Value,
    performance: Performance,
    job_id: String,
    on_finish: Option<MgmtCallback<K>>,
    http_req: Option<AsyncReq>,
}

struct Inner<K: MgmtRequestKind> {
    id: String,
    remote_service_key: String,
    remote_service_id: String,
    provider: HostPortProvider,
    /// Protocol fields merged into every request body
    /// (`version`, `instance_id`, `auth_key`, `admin_auth_key`).
    protocol_fields: Value,
    default_expiration: Duration,
    kind: Mutex<K>,
    shared: Mutex<Shared<K>>,
    finished_tx: watch::Sender<bool>,
    finished_rx: watch::Receiver<bool>,
}

/// A retained worker-management request. Clones share the same request.
pub struct MgmtRequest<K: MgmtRequestKind> {
    inner: Arc<Inner<K>>,
}

impl<K: MgmtRequestKind> Clone for MgmtRequest<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: MgmtRequestKind> MgmtRequest<K> {
    /// Construct the request in the `Created` state.
    ///
    /// `provider` resolves the `(host, port)` of the remote service;
    /// `protocol_fields` are merged into every outgoing body;
    /// `default_expiration` applies when `start()` is called with zero.
    pub fn new(
        kind: K,
        remote_service_key: &str,
        remote_service_id: &str,
        provider: HostPortProvider,
        protocol_fields: Value,
        default_expiration: Duration,
    ) -> Self {
        let (finished_tx, finished_rx) = watch::channel(false);
        let id = format!("{:016x}", rand::random::<u64>());
        Self {
            inner: Arc::new(Inner {
                id,
                remote_service_key: remote_service_key.to_owned(),
                remote_service_id: remote_service_id.to_owned(),
                provider,
                protocol_fields,
                default_expiration,
                kind: Mutex::new(kind),
                shared: Mutex::new(Shared {
                    state: MgmtState::Created,
                    extended_state: ExtendedState::None,
                    server_error: String::new(),
                    info: Value::Null,
                    performance: Performance {
                        created_at: now_ms(),
                        ..Performance::default()
                    },
                    job_id: String::new(),
                    on_finish: None,
                    http_req: None,
                }),
                finished_tx,
                finished_rx,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn type_name(&self) -> &'static str {
        self.inner.kind.lock().type_name()
    }

    pub fn remote_service_key(&self) -> &str {
        &self.inner.remote_service_key
    }

    pub fn remote_service_id(&self) -> &str {
        &self.inner.remote_service_id
    }

    pub fn state(&self) -> MgmtState {
        self.inner.shared.lock().state
    }

    pub fn extended_state(&self) -> ExtendedState {
        self.inner.shared.lock().extended_state
    }

    pub fn state2string(&self) -> String {
        let shared = self.inner.shared.lock();
        format!(
            "{}::{}",
            shared.state.as_str(),
            shared.extended_state.as_str()
        )
    }

    pub fn server_error(&self) -> String {
        self.inner.shared.lock().server_error.clone()
    }

    pub fn performance(&self) -> Performance {
        self.inner.shared.lock().performance
    }

    /// The identifier of the owning job; valid after `start()`.
    pub fn job_id(&self) -> Result<String, Error> {
        let shared = self.inner.shared.lock();
        if shared.state == MgmtState::Created {
            return Err(Error::Logic(
                "MgmtRequest::job_id the request hasn't started".to_owned(),
            ));
        }
        Ok(shared.job_id.clone())
    }

    /// The data object returned by the service; valid in
    /// `FINISHED::SUCCESS`.
    pub fn info(&self) -> Result<Value, Error> {
        let shared = self.inner.shared.lock();
        if shared.state != MgmtState::Finished || shared.extended_state != ExtendedState::Success {
            return Err(Error::Logic(format!(
                "MgmtRequest::info no info in state {}::{}",
                shared.state.as_str(),
                shared.extended_state.as_str()
            )));
        }
        Ok(shared.info.clone())
    }

    /// Access the request-specific state (e.g. parsed results).
    pub fn with_kind<R>(&self, f: impl FnOnce(&K) -> R) -> R {
        f(&self.inner.kind.lock())
    }

    pub fn set_on_finish(&self, on_finish: MgmtCallback<K>) {
        self.inner.shared.lock().on_finish = Some(on_finish);
    }

    /// Begin processing the request.
    pub fn start(&self, job_id: &str, expiration: Duration) -> Result<(), Error> {
        let spec = self.inner.kind.lock().create_http_req();
        let expiration = if expiration.is_zero() {
            self.inner.default_expiration
        } else {
            expiration
        };

        let mut body = spec.body;
        if let (Value::Object(body), Value::Object(protocol)) =
            (&mut body, &self.inner.protocol_fields)
        {
            for (key, value) in protocol {
                body.insert(key.clone(), value.clone());
            }
        }
        let (host, port) = (self.inner.provider)()?;
        let url = format!("http://{host}:{port}{}", spec.target);
        let headers =
            HashMap::from([("Content-Type".to_owned(), "application/json".to_owned())]);
        let http_req = AsyncReq::new(spec.method, &url, body.to_string(), headers)?;
        http_req.set_expiration(expiration);
        http_req.set_host_port_provider(self.inner.provider.clone());

        {
            let mut shared = self.inner.shared.lock();
            if shared.state != MgmtState::Created {
                return Err(Error::Logic(format!(
                    "MgmtRequest::start the current state {} is not CREATED",
                    shared.state.as_str()
                )));
            }
            shared.state = MgmtState::InProgress;
            shared.job_id = job_id.to_owned();
            shared.performance.started_at = now_ms();
            shared.http_req = Some(http_req.clone());
        }

        let this = self.clone();
        http_req.set_on_finish(Box::new(move |req| this.on_http_req_finished(req)));
        http_req.start()
    }

    /// Explicitly abort the request; equivalent to an expiration except
    /// the final state is `FINISHED::CANCELLED`. Idempotent; reports
    /// whether this call performed the transition.
    pub fn cancel(&self) -> bool {
        let http_req = {
            let shared = self.inner.shared.lock();
            if shared.state == MgmtState::Finished {
                return false;
            }
            shared.http_req.clone()
        };
        if let Some(http_req) = http_req {
            http_req.cancel();
        }
        self.finish(ExtendedState::Cancelled, String::new(), Value::Null)
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

    fn on_http_req_finished(&self, req: AsyncReq) {
        match req.state() {
            ReqState::Finished => {
                let code = req.response_code().unwrap_or_default();
                if !(200..300).contains(&code) {
                    self.finish(
                        ExtendedState::ServerError,
                        format!("http_code: {code}"),
                        Value::Null,
                    );
                    return;
                }
                let body = req.response_body().unwrap_or_default();
                let response: Value = match serde_json::from_slice(&body) {
                    Ok(response) => response,
                    Err(e) => {
                        self.finish(
                            ExtendedState::ServerBadResponse,
                            format!("failed to parse the response: {e}"),
                            Value::Null,
                        );
                        return;
                    }
                };
                if response.get("success").and_then(Value::as_i64).unwrap_or(0) == 0 {
                    let error = response
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned();
                    self.finish(ExtendedState::ServerError, error, response);
                    return;
                }
                let extended = match self.inner.kind.lock().data_ready(&response) {
                    Ok(extended) => extended,
                    Err(e) => {
                        self.finish(ExtendedState::ServerBadResponse, e.to_string(), response);
                        return;
                    }
                };
                self.finish(extended, String::new(), response);
            }
            ReqState::BodyLimitError => {
                self.finish(
                    ExtendedState::BodyLimitError,
                    req.error_message(),
                    Value::Null,
                );
            }
            ReqState::Expired => {
                self.finish(
                    ExtendedState::TimeoutExpired,
                    req.error_message(),
                    Value::Null,
                );
            }
            ReqState::Cancelled => {
                self.finish(ExtendedState::Cancelled, String::new(), Value::Null);
            }
            _ => {
                self.finish(
                    ExtendedState::ServerBadResponse,
                    req.error_message(),
                    Value::Null,
                );
            }
        }
    }

    /// Transition into `FINISHED` and fire the notification protocol.
    /// Returns whether this call performed the transition.
    fn finish(&self, extended_state: ExtendedState, server_error: String, info: Value) -> bool {
        let callback = {
            let mut shared = self.inner.shared.lock();
            if shared.state == MgmtState::Finished {
                return false;
            }
            shared.state = MgmtState::Finished;
            shared.extended_state = extended_state;
            shared.server_error = server_error;
            shared.info = info;
            shared.performance.finished_at = now_ms();
            shared.http_req = None;
            shared.on_finish.take()
        };
        let persistent = self.inner.kind.lock().extended_persistent_state();
        debug!(
            id = %self.inner.id,
            service = %self.inner.remote_service_id,
            state = %self.state2string(),
            ?persistent,
            "mgmt request finished"
        );
        // Post the notification instead of invoking it under the caller's
        // stack; taking the callback out first guarantees exactly-once
        // delivery.
        if let Some(callback) = callback {
            let this = self.clone();
            tokio::spawn(async move { callback(this) });
        }
        let _ = self.inner.finished_tx.send(true);
        true
    }
}

/// Round-trip a byte string through the worker's echo service.
pub struct TestEchoRequest {
    data: String,
    echo: Option<String>,
}

impl TestEchoRequest {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            echo: None,
        }
    }

    pub fn data_echo(&self) -> Option<&str> {
        self.echo.as_deref()
    }
}

impl MgmtRequestKind for TestEchoRequest {
    fn type_name(&self) -> &'static str {
        "QSERV_TEST_ECHO"
    }

    fn create_http_req(&self) -> HttpReqSpec {
        HttpReqSpec {
            method: Method::Post,
            target: "/echo".to_owned(),
            body: json!({"data": self.data.clone()}),
        }
    }

    fn data_ready(&mut self, data: &Value) -> Result<ExtendedState, Error> {
        let echo = data
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidArgument("no 'data' attribute in the response".to_owned()))?;
        self.echo = Some(echo.to_owned());
        Ok(ExtendedState::Success)
    }

    fn extended_persistent_state(&self) -> Vec<(String, String)> {
        vec![("data_length_bytes".to_owned(), self.data.len().to_string())]
    }
}

/// One replica entry reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QservReplica {
    pub chunk: u32,
    pub database: String,
    pub use_count: u32,
}

/// Replace the set of chunks served by a worker, restricted to the
/// databases of the allow-list.
pub struct SetReplicasRequest {
    new_replicas: Vec<QservReplica>,
    databases: Vec<String>,
    force: bool,
    replicas: Vec<QservReplica>,
}

impl SetReplicasRequest {
    pub fn new(new_replicas: Vec<QservReplica>, databases: Vec<String>, force: bool) -> Self {
        Self {
            new_replicas,
            databases,
            force,
            replicas: Vec::new(),
        }
    }

    /// The collection reported back by the worker.
    pub fn replicas(&self) -> &[QservReplica] {
        &self.replicas
    }
}

impl MgmtRequestKind for SetReplicasRequest {
    fn type_name(&self) -> &'static str {
        "QSERV_SET_REPLICAS"
    }

    fn create_http_req(&self) -> HttpReqSpec {
        // Leave replicas that belong to the requested databases only.
        let mut replicas = serde_json::Map::new();
        for replica in &self.new_replicas {
            if self.databases.contains(&replica.database) {
                let chunks = replicas
                    .entry(replica.database.clone())
                    .or_insert_with(|| json!([]));
                if let Some(chunks) = chunks.as_array_mut() {
                    chunks.push(json!(replica.chunk));
                }
            }
        }
        HttpReqSpec {
            method: Method::Post,
            target: "/replicas".to_owned(),
            body: json!({
                "replicas": replicas,
                "force": if self.force { 1 } else { 0 },
                "databases": self.databases.clone(),
            }),
        }
    }

    fn data_ready(&mut self, data: &Value) -> Result<ExtendedState, Error> {
        let invalid =
            || Error::InvalidArgument("unexpected shape of the 'replicas' attribute".to_owned());
        self.replicas.clear();
        let replicas = data
            .get("replicas")
            .and_then(Value::as_object)
            .ok_or_else(invalid)?;
        for (database, chunks) in replicas {
            for entry in chunks.as_array().ok_or_else(invalid)? {
                let chunk = entry
                    .get(0)
                    .and_then(Value::as_u64)
                    .ok_or_else(invalid)? as u32;
                let use_count = entry
                    .get(1)
                    .and_then(Value::as_u64)
                    .ok_or_else(invalid)? as u32;
                self.replicas.push(QservReplica {
                    chunk,
                    database: database.clone(),
                    use_count,
                });
            }
        }
        Ok(ExtendedState::Success)
    }

    fn extended_persistent_state(&self) -> Vec<(String, String)> {
        vec![
            (
                "num_replicas".to_owned(),
                self.new_replicas.len().to_string(),
            ),
            ("databases".to_owned(), self.databases.join(",")),
            ("force".to_owned(), (self.force as u8).to_string()),
        ]
    }
}

/// Remove one chunk replica across one or more databases.
pub struct RemoveReplicaRequest {
    chunk: u32,
    databases: Vec<String>,
    force: bool,
}

impl RemoveReplicaRequest {
    pub fn new(chunk: u32, databases: Vec<String>, force: bool) -> Self {
        Self {
            chunk,
            databases,
            force,
        }
    }
}

impl MgmtRequestKind for RemoveReplicaRequest {
    fn type_name(&self) -> &'static str {
        "QSERV_REMOVE_REPLICA"
    }

    fn create_http_req(&self) -> HttpReqSpec {
        HttpReqSpec {
            method: Method::Delete,
            target: "/replica".to_owned(),
            body: json!({
                "chunk": self.chunk,
                "databases": self.databases.clone(),
                "force": if self.force { 1 } else { 0 },
            }),
        }
    }

    fn extended_persistent_state(&self) -> Vec<(String, String)> {
        let mut result: Vec<(String, String)> = self
            .databases
            .iter()
            .map(|database| ("database".to_owned(), database.clone()))
            .collect();
        result.push(("chunk".to_owned(), self.chunk.to_string()));
        result.push(("force".to_owned(), (self.force as u8).to_string()));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> HostPortProvider {
        Arc::new(|| Ok(("127.0.0.1".to_owned(), 1)))
    }

    fn echo_request() -> MgmtRequest<TestEchoRequest> {
        MgmtRequest::new(
            TestEchoRequest::new("abc"),
            "worker",
            "worker-A",
            provider(),
            json!({"version": crate::meta::VERSION, "instance_id": "test"}),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn set_replicas_filters_by_database_allow_list() {
        let kind = SetReplicasRequest::new(
            vec![
                QservReplica {
                    chunk: 1,
                    database: "user_a".to_owned(),
                    use_count: 0,
                },
                QservReplica {
                    chunk: 2,
                    database: "user_b".to_owned(),
                    use_count: 0,
                },
            ],
            vec!["user_a".to_owned()],
            true,
        );
        let spec = kind.create_http_req();
        assert_eq!(spec.method, Method::Post);
        assert_eq!(spec.target, "/replicas");
        assert_eq!(spec.body["replicas"]["user_a"], json!([1]));
        assert!(spec.body["replicas"].get("user_b").is_none());
        assert_eq!(spec.body["force"], 1);
    }

    #[test]
    fn set_replicas_parses_the_reported_collection() {
        let mut kind = SetReplicasRequest::new(Vec::new(), Vec::new(), false);
        let state = kind
            .data_ready(&json!({"replicas": {"user_a": [[57, 2], [58, 0]]}}))
            .unwrap();
        assert_eq!(state, ExtendedState::Success);
        assert_eq!(
            kind.replicas(),
            &[
                QservReplica {
                    chunk: 57,
                    database: "user_a".to_owned(),
                    use_count: 2
                },
                QservReplica {
                    chunk: 58,
                    database: "user_a".to_owned(),
                    use_count: 0
                },
            ]
        );
        assert!(kind.data_ready(&json!({"replicas": [1]})).is_err());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_terminal() {
        let request = echo_request();
        assert_eq!(request.state(), MgmtState::Created);
        assert!(request.cancel());
        assert_eq!(request.state(), MgmtState::Finished);
        assert_eq!(request.extended_state(), ExtendedState::Cancelled);
        // The second call reports that no transition was performed.
        assert!(!request.cancel());
        // Terminal transitions never reverse.
        assert!(request.start("job-1", Duration::ZERO).is_err());
        request.wait().await;
    }

    #[tokio::test]
    async fn callback_is_delivered_exactly_once() {
        let request = echo_request();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        request.set_on_finish(Box::new(move |req| {
            let _ = tx.send(req.extended_state());
        }));
        request.cancel();
        request.cancel();
        assert_eq!(rx.recv().await, Some(ExtendedState::Cancelled));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn info_requires_success() {
        let request = echo_request();
        assert!(request.info().is_err());
        assert!(request.job_id().is_err());
    }
}
