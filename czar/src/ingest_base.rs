//! Common machinery of the czar ingest modules: Registry-based service
//! resolution, controller REST calls, and the transaction-scoped ingest
//! pipeline shared by the JSON and CSV paths.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use catalog_api::control::{RegistryServices, ReplicationConfig};
use catalog_api::trans::TransactionId;
use http_api::async_req::AsyncReq;
use http_api::error::Error;
use http_api::{meta, Method};

use crate::config::CzarConfig;

/// Database names provided by users must start with this prefix.
const USER_DATABASE_NAMES_PREFIX: &str = "user_";

/// Table names provided by users can not start with this prefix.
const QSERV_TABLE_NAMES_PREFIX: &str = "qserv";

// These parameters correspond to the present partitioning model of 150k
// chunks. Regular tables don't need them, but the Replication/Ingest
// system's API still requires some values.
const DEFAULT_NUM_STRIPES: u32 = 340;
const DEFAULT_NUM_SUB_STRIPES: u32 = 3;
const DEFAULT_OVERLAP: f64 = 0.01667;

const DEFAULT_DIRECTOR_TABLE_NAME: &str = "qserv_director";
const DEFAULT_CHUNK_ID: u32 = 0;

/// Reject database names lacking the mandatory user prefix.
pub fn verify_user_database_name(func: &str, database: &str) -> Result<(), Error> {
    let prefix = USER_DATABASE_NAMES_PREFIX;
    if database.len() <= prefix.len() || !database[..prefix.len()].eq_ignore_ascii_case(prefix) {
        return Err(Error::http(
            func,
            format!("database name doesn't start with the prefix: {prefix}"),
        ));
    }
    Ok(())
}

/// Reject table names carrying the reserved prefix.
pub fn verify_user_table_name(func: &str, table: &str) -> Result<(), Error> {
    if table.is_empty() {
        return Err(Error::http(func, "table name is empty"));
    }
    let prefix = QSERV_TABLE_NAMES_PREFIX;
    if table.len() >= prefix.len() && table[..prefix.len()].eq_ignore_ascii_case(prefix) {
        return Err(Error::http(
            func,
            format!("table name starts with the reserved prefix: {prefix}"),
        ));
    }
    Ok(())
}

/// Process-wide cache of the controller and worker base URLs. Entries
/// are resolved lazily through the Registry and never evicted.
pub struct UrlRegistry {
    registry_base_url: String,
    controller: Mutex<Option<String>>,
    workers: Mutex<HashMap<String, String>>,
}

impl UrlRegistry {
    pub fn new(registry_base_url: String) -> Arc<Self> {
        Arc::new(Self {
            registry_base_url,
            controller: Mutex::new(None),
            workers: Mutex::new(HashMap::new()),
        })
    }

    async fn services(&self, timeout: Duration) -> Result<RegistryServices, Error> {
        let url = format!("{}/services", self.registry_base_url);
        let req = AsyncReq::new(Method::Get, &url, "", HashMap::new())?;
        req.set_expiration(timeout);
        req.start()?;
        req.wait().await;
        if req.state() != http_api::async_req::State::Finished {
            return Err(Error::http(
                "UrlRegistry",
                format!("failed to pull services from the Registry at {url}: {}", req.error_message()),
            ));
        }
        serde_json::from_slice(&req.response_body()?)
            .map_err(|e| Error::http("UrlRegistry", format!("unexpected Registry response: {e}")))
    }

    /// The base URL of the master controller's REST service.
    pub async fn controller(&self, timeout: Duration) -> Result<String, Error> {
        if let Some(url) = self.controller.lock().clone() {
            return Ok(url);
        }
        let services = self.services(timeout).await?;
        let master = services.services.controllers.get("master").ok_or_else(|| {
            Error::http("UrlRegistry", "no master controller found in the Registry")
        })?;
        let url = format!("http://{}:{}", master.host_addr, master.port);
        *self.controller.lock() = Some(url.clone());
        Ok(url)
    }

    /// The base URL of a worker's ingest REST service.
    pub async fn worker(&self, worker_id: &str, timeout: Duration) -> Result<String, Error> {
        if let Some(url) = self.workers.lock().get(worker_id).cloned() {
            return Ok(url);
        }
        let services = self.services(timeout).await?;
        let mut workers = self.workers.lock();
        for (id, worker) in &services.services.workers {
            workers.insert(
                id.clone(),
                format!(
                    "http://{}:{}",
                    worker.replication.host_addr, worker.replication.http_loader_port
                ),
            );
        }
        workers.get(worker_id).cloned().ok_or_else(|| {
            Error::http(
                "UrlRegistry",
                format!("no connection parameters for worker: {worker_id}"),
            )
        })
    }
}

/// Services shared by the czar ingest modules.
pub struct IngestBase {
    config: Arc<CzarConfig>,
    urls: Arc<UrlRegistry>,
    timeout_sec: u32,
}

impl IngestBase {
    pub fn new(config: Arc<CzarConfig>, urls: Arc<UrlRegistry>) -> Self {
        let timeout_sec = config.request_timeout_sec;
        Self {
            config,
            urls,
            timeout_sec,
        }
    }

    pub fn set_timeout_sec(&mut self, timeout_sec: u32) {
        self.timeout_sec = timeout_sec.max(1);
    }

    pub fn timeout_sec(&self) -> u32 {
        self.timeout_sec
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec as u64)
    }

    /// The standard protocol attributes injected into every JSON body.
    pub fn set_protocol_fields(&self, data: &mut Value) {
        data["version"] = json!(meta::VERSION);
        data["instance_id"] = json!(self.config.instance_id.clone());
        data["auth_key"] = json!(self.config.auth.auth_key.clone());
        data["admin_auth_key"] = json!(self.config.auth.admin_auth_key.clone());
    }

    /// The same protocol attributes in multipart form, for requests that
    /// travel as `multipart/form-data`.
    pub fn protocol_form_fields(&self) -> Vec<(String, String)> {
        vec![
            ("version".to_owned(), meta::VERSION.to_string()),
            ("instance_id".to_owned(), self.config.instance_id.clone()),
            ("auth_key".to_owned(), self.config.auth.auth_key.clone()),
            (
                "admin_auth_key".to_owned(),
                self.config.auth.admin_auth_key.clone(),
            ),
        ]
    }

    /// The base URL of a worker's ingest service.
    pub async fn worker_base_url(&self, worker_id: &str) -> Result<String, Error> {
        self.urls.worker(worker_id, self.timeout()).await
    }

    /// Create (but do not start) an asynchronous POST request pushing a
    /// JSON payload to a worker's data-ingest service.
    pub async fn async_request_worker(
        &self,
        worker_id: &str,
        data: &str,
    ) -> Result<AsyncReq, Error> {
        let url = format!("{}/ingest/data", self.worker_base_url(worker_id).await?);
        let headers = HashMap::from([(
            "Content-Type".to_owned(),
            "application/json".to_owned(),
        )]);
        let req = AsyncReq::new(Method::Post, &url, data.to_owned(), headers)?;
        req.set_expiration(self.timeout());
        Ok(req)
    }

    /// Identifiers of the workers eligible for ingest: enabled and not
    /// in the read-only mode.
    pub async fn worker_ids(&self) -> Result<Vec<String>, Error> {
        let response = self
            .request_controller(Method::Get, "/replication/config", json!({}))
            .await?;
        let config: ReplicationConfig = serde_json::from_value(
            response.get("config").cloned().unwrap_or_default(),
        )
        .map_err(|e| Error::http("worker_ids", format!("unexpected controller response: {e}")))?;
        let worker_ids: Vec<String> = config
            .workers
            .iter()
            .filter(|w| w.is_writable())
            .map(|w| w.name.clone())
            .collect();
        if worker_ids.is_empty() {
            return Err(Error::http(
                "worker_ids",
                "no workers found in this Qserv instance",
            ));
        }
        Ok(worker_ids)
    }

    /// The transaction-scoped ingest pipeline shared by the JSON and the
    /// CSV paths. `submit_to_workers` pushes the payload to every worker
    /// and returns the per-worker error map; any reported error aborts
    /// the transaction and removes the table.
    ///
    /// Returns the warnings of the best-effort post-ingest steps.
    pub async fn ingest_data<F, Fut>(
        &self,
        database: &str,
        table: &str,
        schema: &Value,
        indexes: &Value,
        submit_to_workers: F,
    ) -> Result<Vec<(String, String)>, Error>
    where
        F: FnOnce(TransactionId) -> Fut,
        Fut: Future<Output = Result<HashMap<String, String>, Error>>,
    {
        self.unpublish_or_create_database(database).await?;
        self.create_table(database, table, schema).await?;

        let transaction_id = match self.start_transaction(database).await {
            Ok(id) => id,
            Err(e) => {
                self.delete_table(database, table).await.ok();
                return Err(e);
            }
        };

        let worker_errors = match submit_to_workers(transaction_id).await {
            Ok(errors) => errors,
            Err(e) => {
                self.abort_transaction(transaction_id).await.ok();
                self.delete_table(database, table).await.ok();
                return Err(e);
            }
        };
        if !worker_errors.is_empty() {
            self.abort_transaction(transaction_id).await.ok();
            self.delete_table(database, table).await.ok();
            return Err(Error::http_ext(
                "ingest_data",
                "error(s) reported by workers",
                json!({"worker_errors": worker_errors}),
            ));
        }

        self.commit_transaction(transaction_id).await?;
        self.publish_database(database).await?;

        // The post-ingest steps are allowed to fail without affecting
        // the success of the ingest; failures surface as warnings.
        let mut warnings = Vec::new();
        self.create_indexes(database, table, indexes, &mut warnings)
            .await;
        self.count_rows(database, table, &mut warnings).await;
        Ok(warnings)
    }

    pub async fn delete_database(&self, database: &str) -> Result<(), Error> {
        self.request_controller(
            Method::Delete,
            &format!("/ingest/database/{database}"),
            json!({}),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_table(&self, database: &str, table: &str) -> Result<(), Error> {
        self.request_controller(
            Method::Delete,
            &format!("/ingest/table/{database}/{table}"),
            json!({}),
        )
        .await?;
        Ok(())
    }

    /// Make the database ready to accept a new table: create it (with
    /// the mandatory director table) when unknown, unpublish it when
    /// already published, and backfill a missing director.
    async fn unpublish_or_create_database(&self, database: &str) -> Result<(), Error> {
        let response = self
            .request_controller(Method::Get, "/replication/config", json!({}))
            .await?;
        let config: ReplicationConfig = serde_json::from_value(
            response.get("config").cloned().unwrap_or_default(),
        )
        .map_err(|e| {
            Error::http(
                "unpublish_or_create_database",
                format!("unexpected controller response: {e}"),
            )
        })?;
        for entry in &config.databases {
            if entry.database.eq_ignore_ascii_case(database) {
                if entry.is_published != 0 {
                    self.unpublish_database(database).await?;
                }
                if entry.num_directors() == 0 {
                    self.create_director_table(database).await?;
                }
                return Ok(());
            }
        }
        self.create_database(database).await?;
        self.create_director_table(database).await
    }

    async fn create_database(&self, database: &str) -> Result<(), Error> {
        let data = json!({
            "database": database,
            "num_stripes": DEFAULT_NUM_STRIPES,
            "num_sub_stripes": DEFAULT_NUM_SUB_STRIPES,
            "overlap": DEFAULT_OVERLAP,
        });
        self.request_controller(Method::Post, "/ingest/database", data)
            .await?;
        Ok(())
    }

    async fn unpublish_database(&self, database: &str) -> Result<(), Error> {
        self.request_controller(
            Method::Put,
            &format!("/replication/config/database/{database}"),
            json!({"publish": 0}),
        )
        .await?;
        Ok(())
    }

    async fn publish_database(&self, database: &str) -> Result<(), Error> {
        self.request_controller(
            Method::Put,
            &format!("/ingest/database/{database}"),
            json!({}),
        )
        .await?;
        Ok(())
    }

    async fn create_table(&self, database: &str, table: &str, schema: &Value) -> Result<(), Error> {
        let data = json!({
            "database": database,
            "table": table,
            "is_partitioned": 0,
            "schema": schema,
        });
        self.request_controller(Method::Post, "/ingest/table/", data)
            .await?;
        Ok(())
    }

    async fn create_director_table(&self, database: &str) -> Result<(), Error> {
        let schema = json!([
            {"name": "objectId", "type": "BIGINT"},
            {"name": "ra", "type": "DOUBLE"},
            {"name": "dec", "type": "DOUBLE"},
            {"name": "chunkId", "type": "INT UNSIGNED NOT NULL"},
            {"name": "subChunkId", "type": "INT UNSIGNED NOT NULL"},
        ]);
        let data = json!({
            "description": "The mandatory director table of the catalog. The table may be empty.",
            "fields_terminated_by": ",",
            "database": database,
            "table": DEFAULT_DIRECTOR_TABLE_NAME,
            "is_partitioned": 1,
            "is_director": 1,
            "director_key": "objectId",
            "longitude_key": "ra",
            "latitude_key": "dec",
            "chunk_id_key": "chunkId",
            "sub_chunk_id_key": "subChunkId",
            "schema": schema,
        });
        self.request_controller(Method::Post, "/ingest/table/", data)
            .await?;
        self.allocate_chunk(database, DEFAULT_CHUNK_ID).await?;
        Ok(())
    }

    async fn start_transaction(&self, database: &str) -> Result<TransactionId, Error> {
        let response = self
            .request_controller(Method::Post, "/ingest/trans", json!({"database": database}))
            .await?;
        response
            .pointer(&format!("/databases/{database}/transactions/0/id"))
            .and_then(Value::as_u64)
            .map(|id| id as TransactionId)
            .ok_or_else(|| {
                Error::http(
                    "start_transaction",
                    "no transaction identifier found in the response",
                )
            })
    }

    async fn abort_transaction(&self, id: TransactionId) -> Result<(), Error> {
        self.abort_or_commit_transaction(id, true).await
    }

    async fn commit_transaction(&self, id: TransactionId) -> Result<(), Error> {
        self.abort_or_commit_transaction(id, false).await
    }

    async fn abort_or_commit_transaction(&self, id: TransactionId, abort: bool) -> Result<(), Error> {
        let service = format!("/ingest/trans/{id}?abort={}", if abort { "1" } else { "0" });
        self.request_controller(Method::Put, &service, json!({}))
            .await?;
        Ok(())
    }

    async fn allocate_chunk(&self, database: &str, chunk: u32) -> Result<Value, Error> {
        self.request_controller(
            Method::Post,
            "/ingest/chunk",
            json!({"database": database, "chunk": chunk}),
        )
        .await
    }

    async fn create_indexes(
        &self,
        database: &str,
        table: &str,
        indexes: &Value,
        warnings: &mut Vec<(String, String)>,
    ) {
        let Some(indexes) = indexes.as_array() else {
            return;
        };
        for index_def in indexes {
            if !index_def.is_object() {
                warnings.push((
                    "create_indexes".to_owned(),
                    "index definition is not a JSON object".to_owned(),
                ));
                continue;
            }
            let mut data = index_def.clone();
            data["database"] = json!(database);
            data["table"] = json!(table);
            data["overlap"] = json!(0);
            if let Err(e) = self
                .request_controller(Method::Post, "/replication/sql/index", data)
                .await
            {
                warnings.push(("create_indexes".to_owned(), format!("index creation failed: {e}")));
            }
        }
    }

    async fn count_rows(&self, database: &str, table: &str, warnings: &mut Vec<(String, String)>) {
        let data = json!({
            "database": database,
            "table": table,
            "row_counters_state_update_policy": "ENABLED",
            "row_counters_deploy_at_qserv": 1,
        });
        if let Err(e) = self
            .request_controller(Method::Post, "/ingest/table-stats", data)
            .await
        {
            warnings.push(("count_rows".to_owned(), format!("row count failed: {e}")));
        }
    }

    /// Send a request to the controller, wait for its completion and
    /// extract the result object.
    pub async fn request_controller(
        &self,
        method: Method,
        service: &str,
        data: Value,
    ) -> Result<Value, Error> {
        let controller = self.urls.controller(self.timeout()).await?;
        self.request(method, &format!("{controller}{service}"), data)
            .await
    }

    async fn request(&self, method: Method, url: &str, mut data: Value) -> Result<Value, Error> {
        let error_ext = json!({
            "method": method.to_string(),
            "url": url,
            "timeout_sec": self.timeout_sec,
        });
        let req = if method == Method::Get {
            let url = format!(
                "{url}?version={}&instance_id={}",
                meta::VERSION,
                self.config.instance_id
            );
            AsyncReq::new(method, &url, "", HashMap::new())?
        } else {
            self.set_protocol_fields(&mut data);
            let headers = HashMap::from([(
                "Content-Type".to_owned(),
                "application/json".to_owned(),
            )]);
            AsyncReq::new(method, url, data.to_string(), headers)?
        };
        req.set_expiration(self.timeout());
        req.start()?;
        req.wait().await;

        if req.state() != http_api::async_req::State::Finished {
            return Err(Error::http_ext(
                "request",
                format!(
                    "request state: {}, error: {}",
                    req.state().as_str(),
                    req.error_message()
                ),
                error_ext,
            ));
        }
        let code = req.response_code()?;
        if code != 200 {
            return Err(Error::http_ext("request", format!("http_code: {code}"), error_ext));
        }
        let response: Value = serde_json::from_slice(&req.response_body()?)
            .map_err(|e| Error::http_ext("request", format!("ex: {e}"), error_ext.clone()))?;
        debug!(%url, "controller response received");
        if response.get("success").and_then(Value::as_i64).unwrap_or(0) == 0 {
            let error = response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or_default();
            warn!(%url, %error, "controller request failed");
            return Err(Error::http_ext("request", format!("error: {error}"), error_ext));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_database_names_must_carry_the_prefix() {
        verify_user_database_name("f", "user_demo").unwrap();
        verify_user_database_name("f", "USER_demo").unwrap();
        assert!(verify_user_database_name("f", "user_").is_err());
        assert!(verify_user_database_name("f", "user").is_err());
        assert!(verify_user_database_name("f", "demo").is_err());
        assert!(verify_user_database_name("f", "").is_err());
    }

    #[test]
    fn user_table_names_must_avoid_the_reserved_prefix() {
        verify_user_table_name("f", "t1").unwrap();
        verify_user_table_name("f", "observations").unwrap();
        assert!(verify_user_table_name("f", "").is_err());
        assert!(verify_user_table_name("f", "qserv_director").is_err());
        assert!(verify_user_table_name("f", "QSERVInternal").is_err());
    }
}
