//! User query endpoints of the czar front-end.
//!
//! Query planning and execution belong to the query engine behind the
//! czar's SQL frontend; this module drives it through the [`Dispatcher`]
//! seam and owns the HTTP-facing work: waiting for completion, reading
//! the per-query message table, and packaging the result set (with
//! binary-safe cell encoding) into the response envelope.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::*;
use serde_json::{json, Value};
use tracing::{debug, error};

use catalog_api::query::QueryId;
use catalog_api::schema::is_binary_column_type;
use catalog_api::sql::sql_id;
use http_api::error::Error;
use http_api::module::{Module, RequestContext};
use http_api::BinaryEncodingMode;

use crate::config::CzarConfig;

/// How often the module re-checks an executing query while a synchronous
/// caller waits on it.
const WAIT_POLL_IVAL: Duration = Duration::from_secs(1);

/// The outcome of a query submission or a status lookup.
#[derive(Debug, Clone, Default)]
pub struct SubmitResult {
    pub query_id: QueryId,
    pub result_table: String,
    pub message_table: String,
    pub result_query: String,
    pub status: String,
    pub czar_id: u32,
    pub czar_type: String,
    pub total_chunks: u64,
    pub completed_chunks: u64,
    pub collected_bytes: u64,
    pub collected_rows: u64,
    pub final_rows: u64,
    pub query_begin_epoch: u64,
    pub last_update_epoch: u64,
    pub error_message: String,
}

/// The seam to the query engine.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Register and start a user query; returns immediately with the
    /// query identity and the per-query table names.
    async fn submit_query(&self, query: &str, database: &str) -> Result<SubmitResult, Error>;

    async fn kill_query(&self, query_id: QueryId) -> Result<(), Error>;

    async fn query_info(&self, query_id: QueryId) -> Result<SubmitResult, Error>;
}

/// A [`Dispatcher`] speaking to the query engine through the czar's SQL
/// frontend and the query metadata tables.
pub struct SqlDispatcher {
    pool: mysql_async::Pool,
    qmeta_db: String,
    czar_id: u32,
}

impl SqlDispatcher {
    pub fn new(pool: mysql_async::Pool, config: &CzarConfig) -> Self {
        Self {
            pool,
            qmeta_db: config.qmeta_db.clone(),
            czar_id: config.id,
        }
    }
}

#[async_trait]
impl Dispatcher for SqlDispatcher {
    async fn submit_query(&self, query: &str, database: &str) -> Result<SubmitResult, Error> {
        let mut conn = self.pool.get_conn().await.map_err(sql_err)?;
        if !database.is_empty() {
            conn.query_drop(format!("USE {}", sql_id(database)))
                .await
                .map_err(sql_err)?;
        }
        // The frontend responds to SUBMIT with the query identity and the
        // names of the per-query tables.
        let row: Option<(u64, String, String)> = conn
            .query_first(format!("SUBMIT {query}"))
            .await
            .map_err(sql_err)?;
        let (query_id, result_table, message_table) = row.ok_or_else(|| {
            Error::http("submit_query", "the query engine returned no submission record")
        })?;
        Ok(SubmitResult {
            query_id,
            result_query: format!("SELECT * FROM {}", sql_id(&result_table)),
            result_table,
            message_table,
            status: "EXECUTING".to_owned(),
            czar_id: self.czar_id,
            czar_type: "http".to_owned(),
            ..SubmitResult::default()
        })
    }

    async fn kill_query(&self, query_id: QueryId) -> Result<(), Error> {
        let mut conn = self.pool.get_conn().await.map_err(sql_err)?;
        conn.query_drop(format!("CANCEL {query_id}"))
            .await
            .map_err(sql_err)
    }

    async fn query_info(&self, query_id: QueryId) -> Result<SubmitResult, Error> {
        let mut conn = self.pool.get_conn().await.map_err(sql_err)?;
        let query = format!(
            "SELECT qi.status, qi.czarId, qi.resultLocation, qi.msgTableName, qi.resultQuery, \
             qi.collectedBytes, qi.collectedRows, qi.finalRows, \
             UNIX_TIMESTAMP(qi.submitted), \
             COALESCE(qs.totalChunks, 0), COALESCE(qs.completedChunks, 0), \
             COALESCE(UNIX_TIMESTAMP(qs.lastUpdate), 0) \
             FROM {qmeta}.QInfo qi LEFT JOIN {qmeta}.QStatsTmp qs USING (queryId) \
             WHERE qi.queryId = {query_id}",
            qmeta = sql_id(&self.qmeta_db),
        );
        let row: Option<(
            String,
            u32,
            String,
            String,
            String,
            u64,
            u64,
            u64,
            u64,
            u64,
            u64,
            u64,
        )> = conn.query_first(query).await.map_err(sql_err)?;
        let Some((
            status,
            czar_id,
            result_location,
            message_table,
            result_query,
            collected_bytes,
            collected_rows,
            final_rows,
            query_begin_epoch,
            total_chunks,
            completed_chunks,
            last_update_epoch,
        )) = row
        else {
            return Err(Error::http(
                "query_info",
                format!("no info found for queryId={query_id}"),
            ));
        };
        // Result locations are recorded as 'table:<name>'.
        let result_table = result_location
            .strip_prefix("table:")
            .unwrap_or(&result_location)
            .to_owned();
        Ok(SubmitResult {
            query_id,
            result_table,
            message_table,
            result_query,
            status,
            czar_id,
            czar_type: "http".to_owned(),
            total_chunks,
            completed_chunks,
            collected_bytes,
            collected_rows,
            final_rows,
            query_begin_epoch,
            last_update_epoch,
            error_message: String::new(),
        })
    }
}

fn sql_err(e: mysql_async::Error) -> Error {
    Error::http("query", e.to_string())
}

pub enum QuerySubModule {
    Submit,
    SubmitAsync,
    Cancel,
    Status,
    Result,
    ResultDelete,
}

pub struct QueryModule {
    pool: mysql_async::Pool,
    dispatcher: Arc<dyn Dispatcher>,
    sub_module: QuerySubModule,
}

impl QueryModule {
    pub fn new(
        pool: mysql_async::Pool,
        dispatcher: Arc<dyn Dispatcher>,
        sub_module: QuerySubModule,
    ) -> Self {
        Self {
            pool,
            dispatcher,
            sub_module,
        }
    }

    fn query_id_of(ctx: &RequestContext) -> Result<QueryId, Error> {
        let qid = ctx.param("qid")?;
        qid.parse().map_err(|_| {
            Error::InvalidArgument(format!("the query identifier is not a number: '{qid}'"))
        })
    }

    async fn submit(&self, ctx: &mut RequestContext) -> Result<Value, Error> {
        ctx.check_api_version("submit", 35)?;
        let binary_encoding: BinaryEncodingMode =
            ctx.body.optional_str("binary_encoding", "hex")?.parse()?;
        let query = ctx.body.required_str("query")?;
        let database = ctx.body.optional_str("database", "")?;
        debug!(%query, %database, "submitting a query");

        let submitted = self.dispatcher.submit_query(&query, &database).await?;
        self.wait_and_extract_result(submitted, binary_encoding).await
    }

    async fn submit_async(&self, ctx: &mut RequestContext) -> Result<Value, Error> {
        ctx.check_api_version("submit_async", 32)?;
        let query = ctx.body.required_str("query")?;
        let database = ctx.body.optional_str("database", "")?;
        let submitted = self.dispatcher.submit_query(&query, &database).await?;
        // The placeholder tables of the submission are not used by async
        // clients; results are materialized when the query finishes.
        self.drop_table(&submitted.message_table).await;
        self.drop_table(&submitted.result_table).await;
        Ok(json!({"queryId": submitted.query_id}))
    }

    async fn cancel(&self, ctx: &mut RequestContext) -> Result<Value, Error> {
        ctx.check_api_version("cancel", 30)?;
        let query_id = Self::query_id_of(ctx)?;
        self.dispatcher.kill_query(query_id).await?;
        Ok(json!({}))
    }

    async fn status(&self, ctx: &mut RequestContext) -> Result<Value, Error> {
        ctx.check_api_version("status", 41)?;
        let query_id = Self::query_id_of(ctx)?;
        let info = self.dispatcher.query_info(query_id).await?;
        Ok(json!({"status": {
            "queryId": info.query_id,
            "status": info.status,
            "czarId": info.czar_id,
            "czarType": info.czar_type,
            "totalChunks": info.total_chunks,
            "completedChunks": info.completed_chunks,
            "collectedBytes": info.collected_bytes,
            "collectedRows": info.collected_rows,
            "finalRows": info.final_rows,
            "queryBeginEpoch": info.query_begin_epoch,
            "lastUpdateEpoch": info.last_update_epoch,
        }}))
    }

    async fn result(&self, ctx: &mut RequestContext) -> Result<Value, Error> {
        ctx.check_api_version("result", 35)?;
        let binary_encoding: BinaryEncodingMode = ctx
            .query_str("binary_encoding", "hex")
            .parse()?;
        let query_id = Self::query_id_of(ctx)?;
        let info = self.dispatcher.query_info(query_id).await?;
        self.wait_and_extract_result(info, binary_encoding).await
    }

    async fn result_delete(&self, ctx: &mut RequestContext) -> Result<Value, Error> {
        ctx.check_api_version("result_delete", 40)?;
        let query_id = Self::query_id_of(ctx)?;
        let info = self.dispatcher.query_info(query_id).await?;
        if info.status != "COMPLETED" {
            // The user must wait until the query finishes before
            // deleting the result set.
            return Err(Error::http(
                "result_delete",
                format!("queryId={query_id} is still executing"),
            ));
        }
        self.drop_table(&info.message_table).await;
        self.drop_table(&info.result_table).await;
        Ok(json!({}))
    }

    /// Block until the query leaves the `EXECUTING` state, check the
    /// per-query message table, then extract the schema and the rows.
    /// The message and result tables are removed on every path.
    async fn wait_and_extract_result(
        &self,
        submitted: SubmitResult,
        binary_encoding: BinaryEncodingMode,
    ) -> Result<Value, Error> {
        let mut info = submitted;
        while info.status == "EXECUTING" {
            tokio::time::sleep(WAIT_POLL_IVAL).await;
            info = self.dispatcher.query_info(info.query_id).await?;
        }

        let messages = self.read_message_table(&info.message_table).await;
        self.drop_table(&info.message_table).await;
        let messages = match messages {
            Ok(messages) => messages,
            Err(e) => {
                self.drop_table(&info.result_table).await;
                return Err(e);
            }
        };
        let error_msg: String = messages
            .iter()
            .filter(|(_, code, ..)| *code > 0)
            .map(|(chunk_id, code, message, severity)| {
                format!("[chunkId={chunk_id} code={code} message={message} severity={severity}], ")
            })
            .collect();
        if !error_msg.is_empty() || info.status != "COMPLETED" {
            self.drop_table(&info.result_table).await;
            let error = if error_msg.is_empty() {
                format!("queryId={} finished with status {}", info.query_id, info.status)
            } else {
                error_msg
            };
            error!("{error}");
            return Err(Error::http("wait_and_extract_result", error));
        }

        let extracted = self.extract_result(&info, binary_encoding).await;
        self.drop_table(&info.result_table).await;
        extracted
    }

    async fn read_message_table(
        &self,
        message_table: &str,
    ) -> Result<Vec<(String, i64, String, String)>, Error> {
        let mut conn = self.pool.get_conn().await.map_err(sql_err)?;
        conn.query(format!(
            "SELECT chunkId, code, message, severity+0 FROM {}",
            sql_id(message_table)
        ))
        .await
        .map_err(sql_err)
        .map(|rows: Vec<(i64, i64, String, i64)>| {
            rows.into_iter()
                .map(|(chunk_id, code, message, severity)| {
                    (chunk_id.to_string(), code, message, severity.to_string())
                })
                .collect()
        })
    }

    async fn extract_result(
        &self,
        info: &SubmitResult,
        binary_encoding: BinaryEncodingMode,
    ) -> Result<Value, Error> {
        let mut conn = self.pool.get_conn().await.map_err(sql_err)?;

        // Schema of the result table with the binary classification the
        // client needs to decode the cells.
        let columns: Vec<(String, String)> = conn
            .exec(
                "SELECT COLUMN_NAME, COLUMN_TYPE FROM information_schema.COLUMNS \
                 WHERE TABLE_NAME = ? AND TABLE_SCHEMA = DATABASE() \
                 ORDER BY ORDINAL_POSITION",
                (&info.result_table,),
            )
            .await
            .map_err(sql_err)?;
        let is_binary: Vec<bool> = columns
            .iter()
            .map(|(_, col_type)| is_binary_column_type(col_type))
            .collect();
        let schema: Vec<Value> = columns
            .iter()
            .map(|(name, col_type)| {
                json!({
                    "table": info.result_table.clone(),
                    "column": name.clone(),
                    "type": col_type.clone(),
                    "is_binary": if is_binary_column_type(col_type) { 1 } else { 0 },
                })
            })
            .collect();

        let result_rows: Vec<mysql_async::Row> = conn
            .query(&info.result_query)
            .await
            .map_err(sql_err)?;
        let mut rows = Vec::with_capacity(result_rows.len());
        for row in result_rows {
            let mut cells = Vec::with_capacity(row.len());
            for idx in 0..row.len() {
                let value: mysql_async::Value =
                    row.as_ref(idx).cloned().unwrap_or(mysql_async::Value::NULL);
                cells.push(cell_to_json(value, is_binary.get(idx).copied().unwrap_or(false), binary_encoding));
            }
            rows.push(Value::Array(cells));
        }
        Ok(json!({"schema": schema, "rows": rows}))
    }

    async fn drop_table(&self, table: &str) {
        if table.is_empty() {
            return;
        }
        let query = format!("DROP TABLE IF EXISTS {}", sql_id(table));
        match self.pool.get_conn().await {
            Ok(mut conn) => {
                if let Err(e) = conn.query_drop(&query).await {
                    error!("failed query={query} err={e}");
                }
            }
            Err(e) => error!("failed query={query} err={e}"),
        }
    }
}

/// Translate one result cell into its JSON form. Binary cells are
/// re-encoded per the requested mode; everything else travels as a
/// string, with SQL NULL represented by the literal "NULL".
fn cell_to_json(
    value: mysql_async::Value,
    is_binary: bool,
    binary_encoding: BinaryEncodingMode,
) -> Value {
    use mysql_async::Value as Sql;
    match value {
        Sql::NULL => json!("NULL"),
        Sql::Bytes(bytes) => {
            if is_binary {
                match binary_encoding {
                    BinaryEncodingMode::Hex => json!(hex::encode(bytes)),
                    BinaryEncodingMode::B64 => json!(base64::encode(bytes)),
                    BinaryEncodingMode::Array => {
                        json!(bytes.iter().map(|b| *b as u64).collect::<Vec<u64>>())
                    }
                }
            } else {
                json!(String::from_utf8_lossy(&bytes).into_owned())
            }
        }
        Sql::Int(v) => json!(v.to_string()),
        Sql::UInt(v) => json!(v.to_string()),
        Sql::Float(v) => json!(v.to_string()),
        Sql::Double(v) => json!(v.to_string()),
        Sql::Date(y, m, d, hh, mm, ss, _us) => {
            json!(format!("{y:04}-{m:02}-{d:02} {hh:02}:{mm:02}:{ss:02}"))
        }
        Sql::Time(neg, d, hh, mm, ss, _us) => {
            let sign = if neg { "-" } else { "" };
            json!(format!("{sign}{:02}:{mm:02}:{ss:02}", u32::from(hh) + 24 * d))
        }
    }
}

impl Module for QueryModule {
    fn context(&self) -> String {
        "CZAR-QUERY ".to_owned()
    }

    async fn execute(&mut self, ctx: &mut RequestContext) -> Result<Value, Error> {
        match self.sub_module {
            QuerySubModule::Submit => self.submit(ctx).await,
            QuerySubModule::SubmitAsync => self.submit_async(ctx).await,
            QuerySubModule::Cancel => self.cancel(ctx).await,
            QuerySubModule::Status => self.status(ctx).await,
            QuerySubModule::Result => self.result(ctx).await,
            QuerySubModule::ResultDelete => self.result_delete(ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_are_rendered_as_strings() {
        use mysql_async::Value as Sql;
        let mode = BinaryEncodingMode::Hex;
        assert_eq!(cell_to_json(Sql::NULL, false, mode), json!("NULL"));
        assert_eq!(
            cell_to_json(Sql::Bytes(b"abc".to_vec()), false, mode),
            json!("abc")
        );
        assert_eq!(cell_to_json(Sql::Int(-5), false, mode), json!("-5"));
        assert_eq!(cell_to_json(Sql::UInt(7), false, mode), json!("7"));
    }

    #[test]
    fn binary_cells_follow_the_requested_encoding() {
        use mysql_async::Value as Sql;
        let bytes = vec![0u8, 255, 16];
        assert_eq!(
            cell_to_json(Sql::Bytes(bytes.clone()), true, BinaryEncodingMode::Hex),
            json!("00ff10")
        );
        assert_eq!(
            cell_to_json(Sql::Bytes(bytes.clone()), true, BinaryEncodingMode::B64),
            json!(base64::encode(&bytes))
        );
        assert_eq!(
            cell_to_json(Sql::Bytes(bytes), true, BinaryEncodingMode::Array),
            json!([0, 255, 16])
        );
    }
}
