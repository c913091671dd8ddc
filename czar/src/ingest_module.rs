//! User-catalog ingest endpoints of the czar: JSON-row ingest and the
//! deletion of user databases and tables.

use std::collections::HashMap;

use serde_json::{json, Value};

use http_api::error::Error;
use http_api::module::{Module, RequestContext};
use http_api::BinaryEncodingMode;

use crate::ingest_base::{verify_user_database_name, verify_user_table_name, IngestBase};

pub enum IngestSubModule {
    IngestData,
    DeleteDatabase,
    DeleteTable,
}

pub struct IngestModule {
    base: IngestBase,
    sub_module: IngestSubModule,
}

impl IngestModule {
    pub fn new(base: IngestBase, sub_module: IngestSubModule) -> Self {
        Self { base, sub_module }
    }

    async fn ingest_data(&mut self, ctx: &mut RequestContext) -> Result<Value, Error> {
        let func = "ingest_data";
        ctx.check_api_version(func, 35)?;

        let database = ctx.body.required_str("database")?;
        let table = ctx.body.required_str("table")?;
        let timeout_sec = ctx
            .body
            .optional_u32("timeout", self.base.timeout_sec())?;
        self.base.set_timeout_sec(timeout_sec.max(1));

        // Validated here; decoding happens worker-side where the table
        // schema is at hand.
        let binary_encoding: BinaryEncodingMode =
            ctx.body.optional_str("binary_encoding", "hex")?.parse()?;

        verify_user_database_name(func, &database)?;
        verify_user_table_name(func, &table)?;

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
        let rows = match ctx.body.get("rows") {
            None => return Err(Error::http(func, "a collection of rows is missing in the request")),
            Some(Value::Array(rows)) if rows.is_empty() => {
                return Err(Error::http(func, "a collection of rows in the request is empty"))
            }
            Some(rows @ Value::Array(_)) => rows.clone(),
            Some(_) => {
                return Err(Error::http(
                    func,
                    "a collection of rows found in the request is not the JSON array",
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

        // The payload pushed to every eligible worker.
        let mut data = json!({
            "transaction_id": 0,
            "table": table.clone(),
            "chunk": 0,
            "overlap": 0,
            "rows": rows,
            "binary_encoding": binary_encoding.to_string(),
        });
        self.base.set_protocol_fields(&mut data);

        let base = &self.base;
        let warnings = base
            .ingest_data(&database, &table, &schema, &indexes, |transaction_id| {
                let mut data = data.clone();
                async move {
                    data["transaction_id"] = json!(transaction_id);
                    let payload = data.to_string();

                    // Requests are sent in parallel; the duration of each
                    // is bounded by the module timeout.
                    let mut requests = HashMap::new();
                    for worker_id in base.worker_ids().await? {
                        let request = base.async_request_worker(&worker_id, &payload).await?;
                        request.start()?;
                        requests.insert(worker_id, request);
                    }
                    for request in requests.values() {
                        request.wait().await;
                    }

                    let mut worker_errors = HashMap::new();
                    for (worker_id, request) in requests {
                        let error = match request.response_code() {
                            Err(e) => format!("ex: {e}"),
                            Ok(code) if code != 200 => format!("http_code: {code}"),
                            Ok(_) => {
                                match serde_json::from_slice::<Value>(
                                    &request.response_body().unwrap_or_default(),
                                ) {
                                    Err(e) => format!("ex: {e}"),
                                    Ok(response) => {
                                        if response
                                            .get("success")
                                            .and_then(Value::as_i64)
                                            .unwrap_or(0)
                                            == 0
                                        {
                                            format!(
                                                "error: {}",
                                                response
                                                    .get("error")
                                                    .and_then(Value::as_str)
                                                    .unwrap_or_default()
                                            )
                                        } else {
                                            String::new()
                                        }
                                    }
                                }
                            }
                        };
                        if !error.is_empty() {
                            worker_errors.insert(worker_id, error);
                        }
                    }
                    Ok(worker_errors)
                }
            })
            .await?;

        for (scope, message) in warnings {
            ctx.warn(format!("{scope}: {message}"));
        }
        Ok(json!({}))
    }

    async fn delete_database(&mut self, ctx: &mut RequestContext) -> Result<Value, Error> {
        let func = "delete_database";
        ctx.check_api_version(func, 34)?;
        let database = ctx.param("database")?.to_owned();
        let timeout_sec = ctx.body.optional_u32("timeout", self.base.timeout_sec())?;
        self.base.set_timeout_sec(timeout_sec.max(1));

        verify_user_database_name(func, &database)?;
        self.base.delete_database(&database).await?;
        Ok(json!({}))
    }

    async fn delete_table(&mut self, ctx: &mut RequestContext) -> Result<Value, Error> {
        let func = "delete_table";
        ctx.check_api_version(func, 34)?;
        let database = ctx.param("database")?.to_owned();
        let table = ctx.param("table")?.to_owned();
        let timeout_sec = ctx.body.optional_u32("timeout", self.base.timeout_sec())?;
        self.base.set_timeout_sec(timeout_sec.max(1));

        verify_user_database_name(func, &database)?;
        verify_user_table_name(func, &table)?;
        self.base.delete_table(&database, &table).await?;
        Ok(json!({}))
    }
}

impl Module for IngestModule {
    fn context(&self) -> String {
        "CZAR-INGEST ".to_owned()
    }

    async fn execute(&mut self, ctx: &mut RequestContext) -> Result<Value, Error> {
        match self.sub_module {
            IngestSubModule::IngestData => self.ingest_data(ctx).await,
            IngestSubModule::DeleteDatabase => self.delete_database(ctx).await,
            IngestSubModule::DeleteTable => self.delete_table(ctx).await,
        }
    }
}
