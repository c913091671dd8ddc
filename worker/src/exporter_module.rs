//! On-demand CSV export of a table or a chunk.
//!
//! The table contents are dumped with `SELECT ... INTO OUTFILE` into a
//! staging file which is then streamed back in bounded chunks. The
//! staging file outlives the handler: its ownership moves into the
//! response stream and it is removed when the transfer ends, successfully
//! or not.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use camino::Utf8PathBuf;
use futures::Stream;
use hyper::StatusCode;
use mysql_async::prelude::*;
use tokio_util::io::ReaderStream;
use tracing::{debug, error};

use catalog_api::control::ChunkNumberValidator;
use catalog_api::dialect::{Dialect, DialectInput};
use catalog_api::schema::{chunked_table_name, TRANS_ID_COLUMN};
use http_api::error::Error;
use http_api::module::RequestContext;

use crate::config::WorkerConfig;
use crate::db::{sql_id, sql_str, DatabaseServices, DbError};

/// Upper bound of one streamed record.
const MAX_REC_LEN: usize = 1024 * 1024;

/// MySQL's "no such table" server error.
const ER_NO_SUCH_TABLE: u16 = 1146;

/// Streams the staging file and removes it when dropped, whether the
/// transfer completed or the client went away.
struct StagedFileStream {
    inner: ReaderStream<tokio::fs::File>,
    path: Utf8PathBuf,
}

impl Stream for StagedFileStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for StagedFileStream {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(path = %self.path, "failed to remove the export staging file: {e}");
            }
        }
    }
}

pub struct ExporterModule {
    config: Arc<WorkerConfig>,
    db: Arc<DatabaseServices>,
}

impl ExporterModule {
    pub fn new(config: Arc<WorkerConfig>, db: Arc<DatabaseServices>) -> Self {
        Self { config, db }
    }

    pub fn context(&self) -> String {
        "WORKER-EXPORTER-HTTP-SVC ".to_owned()
    }

    /// The export endpoints bypass the JSON envelope: the payload is the
    /// CSV stream, and failures are HTML error pages. Missing resources
    /// are reported with 404, everything else with 500.
    pub async fn handle(&self, req: qhttp::Request) -> qhttp::Response {
        let mut ctx = match RequestContext::from_request(&req) {
            Ok(ctx) => ctx,
            Err(e) => return qhttp::Response::error_html(StatusCode::BAD_REQUEST, &e.to_string()),
        };
        match self.process(&mut ctx).await {
            Ok(response) => response,
            Err(e @ Error::InvalidArgument(_)) => {
                error!("{} {e}", self.context());
                qhttp::Response::error_html(StatusCode::NOT_FOUND, &e.to_string())
            }
            Err(e) => {
                error!("{} {e}", self.context());
                qhttp::Response::error_html(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            }
        }
    }

    async fn process(&self, ctx: &mut RequestContext) -> Result<qhttp::Response, Error> {
        let context = self.context();
        ctx.check_api_version("export", 53)?;

        let database = ctx.param("database")?.to_owned();
        let table = ctx.param("table")?.to_owned();
        let is_chunk = ctx.params.contains_key("chunk");

        let mut is_overlap = false;
        let mut chunk = 0u32;
        if is_chunk {
            let chunk_str = ctx.param("chunk")?;
            chunk = chunk_str.parse().map_err(|_| {
                Error::InvalidArgument(format!(
                    "the 'chunk' parameter is not a valid unsigned integer: '{chunk_str}'"
                ))
            })?;
            let validator =
                ChunkNumberValidator::new(self.config.num_stripes, self.config.num_sub_stripes);
            if !validator.valid(chunk) {
                return Err(Error::InvalidArgument(format!(
                    "chunk number {chunk} is not valid in the scope of database '{database}'"
                )));
            }
            is_overlap = ctx.query_flag("overlap", false)?;
        }

        let format = ctx.query_str("format", "CSV").to_uppercase();
        if format != "CSV" {
            return Err(Error::http(
                &context,
                format!(
                    "the 'format' parameter has unsupported value: '{format}'. The current \
                     implementation supports only 'CSV'."
                ),
            ));
        }
        let keep_trans_id = ctx.query_flag("keep_trans_id", false)?;
        let keep_chunk_id = ctx.query_flag("keep_chunk_id", false)?;
        let keep_sub_chunk_id = ctx.query_flag("keep_sub_chunk_id", false)?;

        let defaults = DialectInput::default();
        let dialect_input = DialectInput {
            fields_terminated_by: ctx
                .query_str("fields_terminated_by", &defaults.fields_terminated_by),
            fields_enclosed_by: ctx.query_str("fields_enclosed_by", &defaults.fields_enclosed_by),
            fields_escaped_by: ctx.query_str("fields_escaped_by", &defaults.fields_escaped_by),
            lines_terminated_by: ctx
                .query_str("lines_terminated_by", &defaults.lines_terminated_by),
        };
        let dialect =
            Dialect::try_from(&dialect_input).map_err(|e| Error::InvalidArgument(e.to_string()))?;

        let sql_table = if is_chunk {
            chunked_table_name(&table, chunk, is_overlap)
        } else {
            table.clone()
        };

        // The schema lookup doubles as the existence check for the table
        // or the chunk.
        let schema = self
            .db
            .table_schema(&database, &sql_table)
            .await
            .map_err(|e| match e {
                DbError::NoSuchTable(t) => Error::InvalidArgument(format!("no such table: {t}")),
                other => Error::http(&context, other.to_string()),
            })?;

        let keep_all = keep_trans_id && (!is_chunk || (keep_chunk_id && keep_sub_chunk_id));
        let columns = if keep_all {
            "*".to_owned()
        } else {
            let mut drop_columns = vec![];
            if !keep_trans_id {
                drop_columns.push(TRANS_ID_COLUMN.to_owned());
            }
            if is_chunk {
                if !keep_chunk_id {
                    drop_columns.push("chunkId".to_owned());
                }
                if !keep_sub_chunk_id {
                    drop_columns.push("subChunkId".to_owned());
                }
            }
            let kept: Vec<String> = schema
                .iter()
                .filter(|col| !drop_columns.contains(&col.name))
                .map(|col| sql_id(&col.name))
                .collect();
            if kept.is_empty() {
                return Err(Error::http(&context, "no columns left to export"));
            }
            kept.join(",")
        };

        // Generate the staging path and make sure it is usable. The file
        // must not exist when the dump statement runs.
        let path = self.config.exporter_tmp_dir.join(format!(
            "{database}-{sql_table}-{:016x}.csv",
            rand::random::<u64>()
        ));
        std::fs::write(&path, b"")
            .and_then(|_| std::fs::remove_file(&path))
            .map_err(|e| {
                Error::http(
                    &context,
                    format!("failed to validate the staging file path '{path}': {e}"),
                )
            })?;

        let query = format!(
            "SELECT {columns} FROM {}.{} INTO OUTFILE {} {}",
            sql_id(&database),
            sql_id(&sql_table),
            sql_str(path.as_str()),
            dialect.sql_options()
        );
        debug!(%query, "dumping the table");

        let mut conn = self
            .db
            .pool()
            .get_conn()
            .await
            .map_err(|e| Error::http(&context, e.to_string()))?;
        match conn.query_drop(&query).await {
            Ok(()) => {}
            Err(mysql_async::Error::Server(ref e)) if e.code == ER_NO_SUCH_TABLE => {
                return Err(Error::InvalidArgument(format!(
                    "no such table: {database}.{sql_table}"
                )));
            }
            Err(e) => return Err(Error::http(&context, e.to_string())),
        }

        let size = tokio::fs::metadata(path.as_std_path())
            .await
            .map_err(|e| Error::http(&context, format!("failed to stat '{path}': {e}")))?
            .len();
        let file = tokio::fs::File::open(path.as_std_path())
            .await
            .map_err(|e| Error::http(&context, format!("failed to open '{path}': {e}")))?;
        let stream = StagedFileStream {
            inner: ReaderStream::with_capacity(file, MAX_REC_LEN),
            path,
        };
        Ok(qhttp::Response::stream(
            StatusCode::OK,
            "text/csv",
            Some(size),
            Box::pin(stream),
        ))
    }
}
