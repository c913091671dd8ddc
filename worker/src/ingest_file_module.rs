//! The multipart CSV contribution service.
//!
//! One request carries the contribution parameters and a single `rows`
//! file part. The rows are streamed through the dialect parser into a
//! staging file and loaded with `LOAD DATA` once the part is complete.

use std::sync::Arc;

use serde_json::{json, Value};

use catalog_api::contrib::{ContribStatus, TransactionContrib};
use catalog_api::dialect::{Dialect, DialectInput};
use catalog_api::trans::TransactionState;
use http_api::error::Error;
use http_api::file_upload::FileUploadModule;
use http_api::module::RequestContext;
use http_api::request_body::RequestBody;

use crate::config::WorkerConfig;
use crate::csv;
use crate::db::DatabaseServices;
use crate::ingest_svc::IngestFileSvc;

/// Decode the four dialect attributes of a request body.
pub fn dialect_input_from_body(body: &RequestBody) -> Result<DialectInput, Error> {
    let defaults = DialectInput::default();
    Ok(DialectInput {
        fields_terminated_by: body
            .optional_str("fields_terminated_by", &defaults.fields_terminated_by)?,
        fields_enclosed_by: body
            .optional_str("fields_enclosed_by", &defaults.fields_enclosed_by)?,
        fields_escaped_by: body.optional_str("fields_escaped_by", &defaults.fields_escaped_by)?,
        lines_terminated_by: body
            .optional_str("lines_terminated_by", &defaults.lines_terminated_by)?,
    })
}

pub struct IngestFileModule {
    config: Arc<WorkerConfig>,
    db: Arc<DatabaseServices>,
    svc: IngestFileSvc,
    parser: Option<csv::Parser>,
    contrib: TransactionContrib,
}

impl IngestFileModule {
    pub fn new(config: Arc<WorkerConfig>, db: Arc<DatabaseServices>) -> Self {
        let svc = IngestFileSvc::new(config.clone(), db.clone());
        let contrib = TransactionContrib::new(0, &config.name);
        Self {
            config,
            db,
            svc,
            parser: None,
            contrib,
        }
    }

    fn fail(&mut self, error: impl Into<String>) -> Error {
        let error = error.into();
        self.contrib.fail(error.clone());
        self.svc.close_file();
        tracing::error!("{} {error}", self.context());
        Error::http(&self.context(), error)
    }
}

impl FileUploadModule for IngestFileModule {
    fn context(&self) -> String {
        "INGEST-FILE-HTTP-SVC ".to_owned()
    }

    async fn on_start_of_file(
        &mut self,
        ctx: &mut RequestContext,
        _name: &str,
        filename: &str,
        _content_type: &str,
    ) -> Result<(), Error> {
        let context = self.context();
        ctx.check_api_version("onStartOfFile", 38)?;

        if self.svc.is_open() {
            return Err(Error::http(&context, "a file is already opened"));
        }
        if !self.contrib.tmp_file.is_empty() {
            return Err(Error::http(&context, "the service only allows one file per request"));
        }

        self.contrib.transaction_id = ctx.body.required_u32("transaction_id")?;
        self.contrib.table = ctx.body.required_str("table")?;
        self.contrib.chunk = ctx.body.required_u32("chunk")?;
        self.contrib.is_overlap = ctx.body.required_bool("overlap")?;
        self.contrib.url = format!("data-csv://{}/{filename}", ctx.remote_addr.ip());
        self.contrib.charset_name = ctx
            .body
            .optional_str("charset_name", &self.config.ingest_charset_name)?;
        self.contrib.dialect = dialect_input_from_body(&ctx.body)?;
        self.contrib.max_num_warnings = ctx
            .body
            .optional_u64("max_num_warnings", self.config.loader_max_warnings)?;

        // Retries are allowed until the load attempt: nothing before it
        // changes the persistent state of the destination table.
        self.contrib.retry_allowed = true;

        // An invalid transaction identifier is not recorded as a
        // contribution: there is no context to attribute it to.
        let trans = self
            .db
            .transaction(self.contrib.transaction_id)
            .await
            .map_err(|e| Error::http(&context, e.to_string()))?;
        self.contrib.database = trans.database.clone();

        if trans.state != TransactionState::Started {
            let error = format!(
                "transactionId={} is not active",
                self.contrib.transaction_id
            );
            return Err(self.fail(error));
        }

        let dialect = Dialect::try_from(&self.contrib.dialect)
            .map_err(|e| self.fail(e.to_string()))?;
        self.parser = Some(csv::Parser::new(dialect));

        let table = self.contrib.table.clone();
        let charset_name = self.contrib.charset_name.clone();
        match self
            .svc
            .open_file(
                &trans,
                &table,
                dialect,
                &charset_name,
                self.contrib.chunk,
                self.contrib.is_overlap,
            )
            .await
        {
            Ok(path) => {
                self.contrib.tmp_file = path.to_string();
                self.contrib.status = ContribStatus::Started;
                Ok(())
            }
            Err(e) => Err(self.fail(e.to_string())),
        }
    }

    async fn on_file_data(&mut self, _ctx: &mut RequestContext, data: &[u8]) -> Result<(), Error> {
        if !self.svc.is_open() {
            return Err(Error::http(&self.context(), "no file was opened"));
        }
        let Self {
            svc,
            parser,
            contrib,
            ..
        } = self;
        let result = parser
            .as_mut()
            .expect("the parser exists while the file is open")
            .parse(data, false, |row| {
                svc.write_row(row)?;
                contrib.num_rows += 1;
                Ok(())
            });
        // The input byte count tracks the unmodified upload.
        self.contrib.num_bytes += data.len() as u64;
        if let Err(e) = result {
            self.contrib.system_error = e.raw_os_error().unwrap_or(0);
            return Err(self.fail(format!("failed to write the staging file: {e}")));
        }
        Ok(())
    }

    async fn on_end_of_file(&mut self, _ctx: &mut RequestContext) -> Result<(), Error> {
        if !self.svc.is_open() {
            return Err(Error::http(&self.context(), "no file was opened"));
        }

        // Flush the parser so the last row (if any) reaches the file.
        let Self {
            svc,
            parser,
            contrib,
            ..
        } = self;
        let result = parser
            .as_mut()
            .expect("the parser exists while the file is open")
            .parse(&[], true, |row| {
                svc.write_row(row)?;
                contrib.num_rows += 1;
                Ok(())
            });
        if let Err(e) = result {
            self.contrib.system_error = e.raw_os_error().unwrap_or(0);
            return Err(self.fail(format!("failed to write the staging file: {e}")));
        }
        self.contrib.status = ContribStatus::Read;

        // The irreversible step begins here.
        self.contrib.retry_allowed = false;
        match self
            .svc
            .load_data_into_table(self.contrib.max_num_warnings)
            .await
        {
            Ok(()) => {
                self.contrib.num_warnings = self.svc.num_warnings();
                self.contrib.warnings = self.svc.warnings().to_vec();
                self.contrib.num_rows_loaded = self.svc.num_rows_loaded();
                self.contrib.status = ContribStatus::Loaded;
                self.svc.close_file();
                Ok(())
            }
            Err(e) => Err(self.fail(format!("MySQL load failed, ex: {e}"))),
        }
    }

    async fn on_end_of_body(&mut self, _ctx: &mut RequestContext) -> Result<Value, Error> {
        if self.contrib.tmp_file.is_empty() {
            return Err(Error::http(&self.context(), "no file was sent in the request"));
        }
        if self.svc.is_open() {
            return Err(Error::http(&self.context(), "the file is still open"));
        }
        Ok(json!({"contrib": self.contrib.clone()}))
    }
}
