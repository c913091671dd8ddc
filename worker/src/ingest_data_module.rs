//! The synchronous JSON-row contribution service.
//!
//! Rows arrive as a JSON array of arrays; each row is validated against
//! the table schema, binary cells are decoded per the requested encoding,
//! and the batch is materialized into a CSV staging file that is loaded
//! exactly as an uploaded file would be.

use std::sync::Arc;

use serde_json::{json, Value};

use catalog_api::contrib::{ContribStatus, TransactionContrib};
use catalog_api::dialect::{Dialect, DialectInput};
use catalog_api::schema::{chunked_table_name, is_binary_column_type, ColumnDef, TRANS_ID_COLUMN};
use catalog_api::trans::TransactionState;
use http_api::error::Error;
use http_api::module::{Module, RequestContext};
use http_api::BinaryEncodingMode;

use crate::config::WorkerConfig;
use crate::db::{DatabaseServices, DbError};
use crate::ingest_svc::IngestFileSvc;

/// Materialize one JSON row into CSV bytes per the dialect.
///
/// `is_binary` has one entry per workflow-visible column (the transaction
/// identifier column excluded); the row must match its length exactly.
pub fn materialize_row(
    row: &Value,
    is_binary: &[bool],
    mode: BinaryEncodingMode,
    dialect: &Dialect,
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    let cells = row
        .as_array()
        .ok_or_else(|| Error::InvalidArgument("a row found in the request is not the JSON array".to_owned()))?;
    if cells.len() != is_binary.len() {
        return Err(Error::InvalidArgument(
            "the row size in the request doesn't match the table schema".to_owned(),
        ));
    }
    let quote = dialect.fields_enclosed_by();
    for (idx, cell) in cells.iter().enumerate() {
        if idx != 0 {
            out.push(dialect.fields_terminated_by());
        }
        if quote != 0 {
            out.push(quote);
        }
        if is_binary[idx] {
            out.extend_from_slice(&decode_binary_cell(cell, mode, idx)?);
        } else {
            append_primitive_cell(cell, idx, out)?;
        }
        if quote != 0 {
            out.push(quote);
        }
    }
    out.push(dialect.lines_terminated_by());
    Ok(())
}

fn decode_binary_cell(
    cell: &Value,
    mode: BinaryEncodingMode,
    col_idx: usize,
) -> Result<Vec<u8>, Error> {
    let type_error = |expected: &str| {
        Error::InvalidArgument(format!(
            "unsupported type '{}' found at column {col_idx} where {expected} was expected",
            type_name(cell)
        ))
    };
    let decode_error = |e: String| {
        Error::InvalidArgument(format!(
            "failed to decode a value of the '{mode}' binary encoded column at column {col_idx}: {e}"
        ))
    };
    match mode {
        BinaryEncodingMode::Hex => {
            let s = cell.as_str().ok_or_else(|| type_error("the string type"))?;
            hex::decode(s).map_err(|e| decode_error(e.to_string()))
        }
        BinaryEncodingMode::B64 => {
            let s = cell.as_str().ok_or_else(|| type_error("the string type"))?;
            base64::decode(s).map_err(|e| decode_error(e.to_string()))
        }
        BinaryEncodingMode::Array => {
            let values = cell.as_array().ok_or_else(|| type_error("the array type"))?;
            values
                .iter()
                .map(|v| {
                    v.as_u64()
                        .and_then(|b| u8::try_from(b).ok())
                        .ok_or_else(|| decode_error(format!("'{v}' is not a byte value")))
                })
                .collect()
        }
    }
}

fn append_primitive_cell(cell: &Value, col_idx: usize, out: &mut Vec<u8>) -> Result<(), Error> {
    match cell {
        Value::Bool(b) => out.extend_from_slice(if *b { b"1" } else { b"0" }),
        Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                out.extend_from_slice(v.to_string().as_bytes());
            } else if let Some(v) = n.as_i64() {
                out.extend_from_slice(v.to_string().as_bytes());
            } else {
                // Float cells take the fixed six-decimal form; the
                // shortest-round-trip form would drop the fractional
                // part of integral values.
                let v = n.as_f64().ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "unrepresentable number found at column {col_idx}"
                    ))
                })?;
                out.extend_from_slice(format!("{v:.6}").as_bytes());
            }
        }
        Value::String(s) => out.extend_from_slice(s.as_bytes()),
        other => {
            return Err(Error::InvalidArgument(format!(
                "unsupported type '{}' found at column {col_idx} where the boolean, numeric \
                 or string type was expected",
                type_name(other)
            )))
        }
    }
    Ok(())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub struct IngestDataModule {
    config: Arc<WorkerConfig>,
    db: Arc<DatabaseServices>,
    svc: IngestFileSvc,
    contrib: TransactionContrib,
}

impl IngestDataModule {
    pub fn new(config: Arc<WorkerConfig>, db: Arc<DatabaseServices>) -> Self {
        let svc = IngestFileSvc::new(config.clone(), db.clone());
        let contrib = TransactionContrib::new(0, &config.name);
        Self {
            config,
            db,
            svc,
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

    /// The schema of the destination table: the chunk table when the
    /// contribution targets one, the base table otherwise.
    async fn resolve_schema(&self, database: &str, table: &str) -> Result<Vec<ColumnDef>, Error> {
        let chunked = chunked_table_name(table, self.contrib.chunk, self.contrib.is_overlap);
        match self.db.table_schema(database, &chunked).await {
            Ok(schema) => Ok(schema),
            Err(DbError::NoSuchTable(_)) => self
                .db
                .table_schema(database, table)
                .await
                .map_err(|e| Error::InvalidArgument(e.to_string())),
            Err(e) => Err(Error::http(&self.context(), e.to_string())),
        }
    }
}

impl Module for IngestDataModule {
    fn context(&self) -> String {
        "INGEST-DATA-HTTP-SVC ".to_owned()
    }

    async fn execute(&mut self, ctx: &mut RequestContext) -> Result<Value, Error> {
        let context = self.context();
        ctx.check_api_version("syncProcessData", 35)?;

        self.contrib.transaction_id = ctx.body.required_u32("transaction_id")?;
        self.contrib.table = ctx.body.required_str("table")?;
        self.contrib.chunk = ctx.body.required_u32("chunk")?;
        self.contrib.is_overlap = ctx.body.required_bool("overlap")?;
        self.contrib.url = format!("data-json://{}/", ctx.remote_addr.ip());
        self.contrib.charset_name = ctx
            .body
            .optional_str("charset_name", &self.config.ingest_charset_name)?;
        self.contrib.max_num_warnings = ctx
            .body
            .optional_u64("max_num_warnings", self.config.loader_max_warnings)?;

        // JSON strings arrive quoted; the same quoting is kept in the
        // materialized CSV stream.
        self.contrib.dialect = DialectInput {
            fields_enclosed_by: "\"".to_owned(),
            ..DialectInput::default()
        };
        self.contrib.retry_allowed = true;

        let mode: BinaryEncodingMode = ctx
            .body
            .optional_str("binary_encoding", "hex")?
            .parse()?;

        let rows = match ctx.body.get("rows") {
            None => return Err(Error::http(&context, "a collection of rows is missing in the request")),
            Some(Value::Array(rows)) if rows.is_empty() => {
                return Err(Error::http(&context, "a collection of rows in the request is empty"))
            }
            Some(Value::Array(rows)) => rows.clone(),
            Some(_) => {
                return Err(Error::http(
                    &context,
                    "a collection of rows found in the request is not the JSON array",
                ))
            }
        };

        let trans = self
            .db
            .transaction(self.contrib.transaction_id)
            .await
            .map_err(|e| Error::http(&context, e.to_string()))?;
        self.contrib.database = trans.database.clone();

        if trans.state != TransactionState::Started {
            let error = format!("transactionId={} is not active", self.contrib.transaction_id);
            return Err(self.fail(error));
        }

        // Build the binary-column index off the schema. The transaction
        // identifier column leads the schema and is excluded: the ingest
        // machinery owns it.
        let table = self.contrib.table.clone();
        let schema = self.resolve_schema(&trans.database, &table).await?;
        if schema.is_empty() || schema[0].name != TRANS_ID_COLUMN {
            return Err(self.fail("incomplete or missing table schema"));
        }
        let is_binary: Vec<bool> = schema[1..]
            .iter()
            .map(|col| is_binary_column_type(&col.col_type))
            .collect();

        let dialect = Dialect::try_from(&self.contrib.dialect)
            .map_err(|e| self.fail(e.to_string()))?;
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
            }
            Err(e) => return Err(self.fail(e.to_string())),
        }

        // The storage overhead of the auto-prepended transaction
        // identifier: the 32-bit value, its optional quotes and the field
        // terminator.
        let quoted = dialect.fields_enclosed_by() != 0;
        let trans_id_overhead = std::mem::size_of::<u32>() as u64 + if quoted { 2 } else { 0 } + 1;

        let mut buf = Vec::new();
        for (row_idx, row) in rows.iter().enumerate() {
            buf.clear();
            if let Err(e) = materialize_row(row, &is_binary, mode, &dialect, &mut buf) {
                return Err(self.fail(format!("{e} (row {row_idx})")));
            }
            if let Err(e) = self.svc.write_row(&buf) {
                self.contrib.system_error = e.raw_os_error().unwrap_or(0);
                return Err(self.fail(format!(
                    "failed to write the row into the staging file at row {row_idx}: {e}"
                )));
            }
            self.contrib.num_rows += 1;
            self.contrib.num_bytes += trans_id_overhead + buf.len() as u64;
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
            }
            Err(e) => return Err(self.fail(format!("MySQL load failed, ex: {e}"))),
        }
        Ok(json!({"contrib": self.contrib.clone()}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unquoted_dialect() -> Dialect {
        Dialect::default()
    }

    fn quoted_dialect() -> Dialect {
        let input = DialectInput {
            fields_enclosed_by: "\"".to_owned(),
            ..DialectInput::default()
        };
        Dialect::try_from(&input).unwrap()
    }

    #[test]
    fn string_rows_round_trip_to_the_dialect_join() {
        // With all columns non-binary and all cells strings the emitted
        // stream is exactly the dialect join of the quoted cells.
        let rows = vec![json!(["a", "bc", "def"]), json!(["1", "2", "3"])];
        let mut out = Vec::new();
        for row in &rows {
            materialize_row(
                row,
                &[false, false, false],
                BinaryEncodingMode::Hex,
                &quoted_dialect(),
                &mut out,
            )
            .unwrap();
        }
        assert_eq!(out, b"\"a\"\t\"bc\"\t\"def\"\n\"1\"\t\"2\"\t\"3\"\n");
    }

    #[test]
    fn primitive_cells() {
        let mut out = Vec::new();
        materialize_row(
            &json!([true, false, 42, -7, 1.5, "x"]),
            &[false; 6],
            BinaryEncodingMode::Hex,
            &unquoted_dialect(),
            &mut out,
        )
        .unwrap();
        assert_eq!(out, b"1\t0\t42\t-7\t1.500000\tx\n");
    }

    #[test]
    fn float_cells_use_the_fixed_six_decimal_form() {
        // An integral float: the shortest display form would print it
        // without any fractional digits.
        let mut out = Vec::new();
        materialize_row(
            &json!([100000000.0, 0.5, -2.5]),
            &[false; 3],
            BinaryEncodingMode::Hex,
            &unquoted_dialect(),
            &mut out,
        )
        .unwrap();
        assert_eq!(out, b"100000000.000000\t0.500000\t-2.500000\n");
    }

    #[test]
    fn binary_cells_per_encoding() {
        for (mode, cell) in [
            (BinaryEncodingMode::Hex, json!("00ff10")),
            (BinaryEncodingMode::B64, json!(base64::encode([0u8, 255, 16]))),
            (BinaryEncodingMode::Array, json!([0, 255, 16])),
        ] {
            let mut out = Vec::new();
            materialize_row(
                &json!([cell]),
                &[true],
                mode,
                &unquoted_dialect(),
                &mut out,
            )
            .unwrap();
            assert_eq!(out, vec![0u8, 255, 16, b'\n'], "{mode}");
        }
    }

    #[test]
    fn shape_and_decoding_errors() {
        let mut out = Vec::new();
        // Not an array.
        assert!(materialize_row(
            &json!({"a": 1}),
            &[false],
            BinaryEncodingMode::Hex,
            &unquoted_dialect(),
            &mut out
        )
        .is_err());
        // Wrong width.
        assert!(materialize_row(
            &json!(["a", "b"]),
            &[false],
            BinaryEncodingMode::Hex,
            &unquoted_dialect(),
            &mut out
        )
        .is_err());
        // Bad hex digits.
        assert!(materialize_row(
            &json!(["zz"]),
            &[true],
            BinaryEncodingMode::Hex,
            &unquoted_dialect(),
            &mut out
        )
        .is_err());
        // A byte value out of range.
        assert!(materialize_row(
            &json!([[0, 256]]),
            &[true],
            BinaryEncodingMode::Array,
            &unquoted_dialect(),
            &mut out
        )
        .is_err());
        // Null is not a loadable cell.
        assert!(materialize_row(
            &json!([null]),
            &[false],
            BinaryEncodingMode::Hex,
            &unquoted_dialect(),
            &mut out
        )
        .is_err());
    }
}
