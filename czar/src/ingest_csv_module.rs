//! The CSV user-table ingest endpoint of the czar.
//!
//! The uploaded CSV payload is staged into a local file while the rest of
//! the multipart parameters (schema, indexes, dialect) are collected;
//! the staged file is then pushed to every eligible worker over the
//! synchronous multipart protocol through the worker-ingest thread pool.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::warn;

use http_api::error::Error;
use http_api::file_upload::FileUploadModule;
use http_api::module::RequestContext;

use crate::config::CzarConfig;
use crate::ingest_base::{verify_user_database_name, verify_user_table_name, IngestBase};
use crate::stats::CompletionTimeStats;
use crate::worker_ingest::{IngestResult, Processor, Request, ResultQueue};

pub struct IngestCsvModule {
    config: Arc<CzarConfig>,
    base: IngestBase,
    processor: Arc<Processor>,
    stats: Arc<CompletionTimeStats>,
    /// Which part is being received; decides where the data goes.
    part_name: String,
    csv_file: Option<std::fs::File>,
    csv_file_name: Option<Utf8PathBuf>,
    schema_buf: Vec<u8>,
    indexes_buf: Vec<u8>,
    /// Contribution counters reported by workers. The values are expected
    /// to agree across workers for fully replicated tables; keeping the
    /// last reported pair still yields them when only one worker
    /// succeeds.
    counters: Arc<Mutex<(u64, u64)>>,
}

impl IngestCsvModule {
    pub fn new(
        config: Arc<CzarConfig>,
        base: IngestBase,
        processor: Arc<Processor>,
        stats: Arc<CompletionTimeStats>,
    ) -> Self {
        Self {
            config,
            base,
            processor,
            stats,
            part_name: String::new(),
            csv_file: None,
            csv_file_name: None,
            schema_buf: Vec::new(),
            indexes_buf: Vec::new(),
            counters: Arc::new(Mutex::new((0, 0))),
        }
    }

    fn open_csv_file(&mut self) -> Result<(), Error> {
        let func = "open_csv_file";
        if self.csv_file_name.is_some() {
            return Err(Error::http(func, "the data file is already uploaded"));
        }
        let path = self
            .config
            .tmp_dir
            .join(format!("http-ingest-{:016x}.csv", rand::random::<u64>()));
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                Error::http(func, format!("failed to open the data file {path} for writing: {e}"))
            })?;
        self.csv_file = Some(file);
        self.csv_file_name = Some(path);
        Ok(())
    }

    /// Push the staged file to every eligible worker and collect the
    /// per-worker errors. The synchronous multipart POSTs run on the
    /// worker-ingest thread pool.
    async fn push_data_to_workers(
        &self,
        transaction_id: u32,
        table: &str,
        form_fields: Vec<(String, String)>,
    ) -> Result<HashMap<String, String>, Error> {
        let csv_file_name = self
            .csv_file_name
            .clone()
            .expect("the data file exists at this point");
        let timeout = self.base.timeout();

        let workers = self.base.worker_ids().await?;
        let result_queue = Arc::new(ResultQueue::new());
        for worker_id in &workers {
            let url = format!(
                "{}/ingest/csv",
                self.base.worker_base_url(worker_id).await?
            );
            self.processor.push(Request::new(
                sync_csv_request(
                    worker_id.clone(),
                    url,
                    form_fields.clone(),
                    csv_file_name.clone(),
                    timeout,
                    self.counters.clone(),
                ),
                result_queue.clone(),
            ));
        }
        tracing::debug!(
            transaction_id,
            table,
            num_workers = workers.len(),
            "pushing data to workers"
        );

        // Block a pool thread, not the request task, while collecting
        // exactly one result per worker.
        let num_workers = workers.len();
        let queue = result_queue.clone();
        let errors = tokio::task::spawn_blocking(move || {
            let mut errors = HashMap::new();
            for _ in 0..num_workers {
                let IngestResult { worker, error } = queue.pop();
                if !error.is_empty() {
                    errors.insert(worker, error);
                }
            }
            errors
        })
        .await
        .map_err(|e| Error::http("push_data_to_workers", format!("result collection failed: {e}")))?;
        Ok(errors)
    }
}

/// The closure executed on a worker-ingest pool thread: one synchronous
/// multipart POST. Failures are reported through the result record, never
/// by panicking.
fn sync_csv_request(
    worker_id: String,
    url: String,
    form_fields: Vec<(String, String)>,
    csv_file_name: Utf8PathBuf,
    timeout: Duration,
    counters: Arc<Mutex<(u64, u64)>>,
) -> impl FnOnce() -> IngestResult + Send + 'static {
    move || {
        let error = (|| -> Result<(), String> {
            let client = reqwest::blocking::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| format!("ex: {e}"))?;
            let mut form = reqwest::blocking::multipart::Form::new();
            for (name, value) in form_fields {
                form = form.text(name, value);
            }
            let form = form
                .file("rows", csv_file_name.as_std_path())
                .map_err(|e| format!("ex: {e}"))?;
            let response = client
                .post(&url)
                .multipart(form)
                .send()
                .map_err(|e| format!("ex: {e}"))?;
            if !response.status().is_success() {
                return Err(format!("http_code: {}", response.status().as_u16()));
            }
            let response: Value = response.json().map_err(|e| format!("ex: {e}"))?;
            if response.get("success").and_then(Value::as_i64).unwrap_or(0) == 0 {
                return Err(format!(
                    "error: {}",
                    response.get("error").and_then(Value::as_str).unwrap_or_default()
                ));
            }
            if let Some(contrib) = response.get("contrib") {
                let num_rows = contrib.get("num_rows").and_then(Value::as_u64).unwrap_or(0);
                let num_bytes = contrib.get("num_bytes").and_then(Value::as_u64).unwrap_or(0);
                *counters.lock() = (num_rows, num_bytes);
            }
            Ok(())
        })()
        .err()
        .unwrap_or_default();
        IngestResult {
            worker: worker_id,
            error,
        }
    }
}

impl FileUploadModule for IngestCsvModule {
    fn context(&self) -> String {
        "CZAR-INGEST-CSV ".to_owned()
    }

    async fn on_start_of_file(
        &mut self,
        _ctx: &mut RequestContext,
        name: &str,
        _filename: &str,
        _content_type: &str,
    ) -> Result<(), Error> {
        match name {
            "rows" => self.open_csv_file()?,
            "schema" => {
                if !self.schema_buf.is_empty() {
                    return Err(Error::http(&self.context(), "the schema file is already uploaded"));
                }
            }
            "indexes" => {
                if !self.indexes_buf.is_empty() {
                    return Err(Error::http(&self.context(), "the indexes file is already uploaded"));
                }
            }
            _ => {
                return Err(Error::http(
                    &self.context(),
                    format!("unexpected file name: {name}"),
                ))
            }
        }
        self.part_name = name.to_owned();
        Ok(())
    }

    async fn on_file_data(&mut self, _ctx: &mut RequestContext, data: &[u8]) -> Result<(), Error> {
        match self.part_name.as_str() {
            "rows" => {
                let file = self.csv_file.as_mut().expect("opened at the start of the part");
                file.write_all(data).map_err(|e| {
                    Error::http(
                        "on_file_data",
                        format!("failed to write the data file: {e}"),
                    )
                })?;
            }
            "schema" => self.schema_buf.extend_from_slice(data),
            "indexes" => self.indexes_buf.extend_from_slice(data),
            other => {
                return Err(Error::http(
                    &self.context(),
                    format!("unexpected file name: {other}"),
                ))
            }
        }
        Ok(())
    }

    async fn on_end_of_file(&mut self, ctx: &mut RequestContext) -> Result<(), Error> {
        match self.part_name.as_str() {
            "rows" => {
                // Close the file so its contents are visible to the pool
                // threads.
                self.csv_file = None;
            }
            name @ ("schema" | "indexes") => {
                let buf = if name == "schema" {
                    &self.schema_buf
                } else {
                    &self.indexes_buf
                };
                let parsed: Value = serde_json::from_slice(buf).map_err(|e| {
                    Error::http(
                        &self.context(),
                        format!("failed to parse the {name} file: {e}"),
                    )
                })?;
                ctx.body.set(name, parsed);
            }
            other => {
                return Err(Error::http(
                    &self.context(),
                    format!("unexpected file name: {other}"),
                ))
            }
        }
        Ok(())
    }

    async fn on_end_of_body(&mut self, ctx: &mut RequestContext) -> Result<Value, Error> {
        let func = "on_end_of_body";
        let started_at = std::time::Instant::now();
        ctx.check_api_version(func, 49)?;

        let database = ctx.body.required_str("database")?;
        let table = ctx.body.required_str("table")?;
        let charset_name = ctx.body.optional_str("charset_name", "latin1")?;
        let fields_terminated_by = ctx.body.optional_str("fields_terminated_by", r"\t")?;
        let fields_enclosed_by = ctx.body.optional_str("fields_enclosed_by", r"\0")?;
        let fields_escaped_by = ctx.body.optional_str("fields_escaped_by", r"\\")?;
        let lines_terminated_by = ctx.body.optional_str("lines_terminated_by", r"\n")?;
        let timeout_sec = ctx.body.optional_u32("timeout", self.base.timeout_sec())?;
        self.base.set_timeout_sec(timeout_sec.max(1));

        verify_user_database_name(func, &database)?;
        verify_user_table_name(func, &table)?;

        if self.csv_file_name.is_none() {
            return Err(Error::http(func, "data file is missing in the request"));
        }
        let schema = match ctx.body.get("schema") {
            None => return Err(Error::http(func, "table schema definition is missing in the request")),
            Some(Value::Array(schema)) if schema.is_empty() => {
                return Err(Error::http(func, "table schema in the request is empty"))
            }
            Some(schema @ Value::Array(_)) => schema.clone(),
            Some(_) => {
                return Err(Error::http(
                    func,
                    "table schema found in the request is not the JSON array",
                ))
            }
        };
        let indexes = match ctx.body.get("indexes") {
            None => json!([]),
            Some(indexes @ Value::Array(_)) => indexes.clone(),
            Some(_) => {
                return Err(Error::http(
                    func,
                    "index definitions found in the request is not the JSON array",
                ))
            }
        };

        let mut form_fields = vec![
            ("transaction_id".to_owned(), String::new()),
            ("table".to_owned(), table.clone()),
            ("chunk".to_owned(), "0".to_owned()),
            ("overlap".to_owned(), "0".to_owned()),
            ("charset_name".to_owned(), charset_name),
            ("fields_terminated_by".to_owned(), fields_terminated_by),
            ("fields_enclosed_by".to_owned(), fields_enclosed_by),
            ("fields_escaped_by".to_owned(), fields_escaped_by),
            ("lines_terminated_by".to_owned(), lines_terminated_by),
        ];
        form_fields.extend(self.base.protocol_form_fields());

        let warnings = self
            .base
            .ingest_data(&database, &table, &schema, &indexes, |transaction_id| {
                let mut form_fields = form_fields.clone();
                form_fields[0].1 = transaction_id.to_string();
                self.push_data_to_workers(transaction_id, &table, form_fields)
            })
            .await?;
        for (scope, message) in warnings {
            ctx.warn(format!("{scope}: {message}"));
        }

        self.stats.record(started_at.elapsed());
        let (num_rows, num_bytes) = *self.counters.lock();
        Ok(json!({"num_rows": num_rows, "num_bytes": num_bytes}))
    }
}

impl Drop for IngestCsvModule {
    fn drop(&mut self) {
        self.csv_file = None;
        if let Some(path) = self.csv_file_name.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path, "failed to delete the data file: {e}");
                }
            }
        }
    }
}
