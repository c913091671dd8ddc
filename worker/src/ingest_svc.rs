//! The contribution loading machinery shared by the CSV and JSON-row
//! ingest services: staging-file management and the `LOAD DATA` step.

use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;

use camino::Utf8PathBuf;
use futures::StreamExt;
use mysql_async::prelude::*;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use catalog_api::dialect::Dialect;
use catalog_api::schema::chunked_table_name;
use catalog_api::trans::{TransactionId, TransactionInfo};
use http_api::error::Error;

use crate::config::WorkerConfig;
use crate::db::{sql_id, sql_str, DatabaseServices, DbError};

/// Attempts to generate a unique staging file name before giving up.
const MAX_TMP_FILE_RETRIES: usize = 16;

/// A transaction admits at most one concurrent loading contribution per
/// destination `(table, chunk, overlap)`.
type ContribKey = (TransactionId, String, u32, bool);
static LOADING_CONTRIBS: Lazy<Mutex<HashSet<ContribKey>>> = Lazy::new(Default::default);

/// One contribution's staging file and its path into MySQL.
///
/// The staging file is owned by exactly one handler and removed on every
/// exit path, the destructor included.
pub struct IngestFileSvc {
    config: Arc<WorkerConfig>,
    db: Arc<DatabaseServices>,
    file: Option<std::fs::File>,
    tmp_file: Option<Utf8PathBuf>,
    contrib_key: Option<ContribKey>,
    dest_database: String,
    dest_table: String,
    charset_name: String,
    dialect: Dialect,
    /// The `qserv_trans_id` cell prepended to every written row.
    row_prefix: Vec<u8>,
    num_rows_loaded: u64,
    num_warnings: u64,
    warnings: Vec<String>,
}

impl IngestFileSvc {
    pub fn new(config: Arc<WorkerConfig>, db: Arc<DatabaseServices>) -> Self {
        Self {
            config,
            db,
            file: None,
            tmp_file: None,
            contrib_key: None,
            dest_database: String::new(),
            dest_table: String::new(),
            charset_name: String::new(),
            dialect: Dialect::default(),
            row_prefix: Vec::new(),
            num_rows_loaded: 0,
            num_warnings: 0,
            warnings: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Resolve the destination table, create the uniquely named staging
    /// file and open it for writing. Returns the staging file path.
    pub async fn open_file(
        &mut self,
        trans: &TransactionInfo,
        table: &str,
        dialect: Dialect,
        charset_name: &str,
        chunk: u32,
        is_overlap: bool,
    ) -> Result<Utf8PathBuf, Error> {
        let context = "IngestFileSvc::open_file";
        if self.is_open() {
            return Err(Error::Logic(format!("{context} a file is already open")));
        }

        let key: ContribKey = (trans.id, table.to_owned(), chunk, is_overlap);
        if !LOADING_CONTRIBS.lock().insert(key.clone()) {
            return Err(Error::http(
                context,
                format!(
                    "another contribution into table '{table}' (chunk={chunk}, overlap={}) \
                     is already being loaded in transactionId={}",
                    is_overlap as u8, trans.id
                ),
            ));
        }
        self.contrib_key = Some(key);

        // Contributions into partitioned tables land in the chunk table;
        // regular tables are loaded directly.
        let chunked = chunked_table_name(table, chunk, is_overlap);
        self.dest_table = if self.db.table_exists(&trans.database, &chunked).await.map_err(db_err)? {
            chunked
        } else if self.db.table_exists(&trans.database, table).await.map_err(db_err)? {
            table.to_owned()
        } else {
            return Err(Error::InvalidArgument(format!(
                "no such table '{table}' in database '{}'",
                trans.database
            )));
        };
        self.dest_database = trans.database.clone();
        self.charset_name = charset_name.to_owned();
        self.dialect = dialect;

        // The first column of every ingested table is the transaction
        // identifier; it is prepended here rather than supplied by the
        // workflows.
        let quote = dialect.fields_enclosed_by();
        self.row_prefix.clear();
        if quote != 0 {
            self.row_prefix.push(quote);
        }
        self.row_prefix.extend_from_slice(trans.id.to_string().as_bytes());
        if quote != 0 {
            self.row_prefix.push(quote);
        }
        self.row_prefix.push(dialect.fields_terminated_by());

        for _ in 0..MAX_TMP_FILE_RETRIES {
            let path = self.config.loader_tmp_dir.join(format!(
                "{}-{}-{:016x}.csv",
                trans.id,
                table,
                rand::random::<u64>()
            ));
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    debug!(tmp_file = %path, table = %self.dest_table, "opened the staging file");
                    self.file = Some(file);
                    self.tmp_file = Some(path.clone());
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(Error::http(
                        context,
                        format!("failed to create the staging file '{path}': {e}"),
                    ))
                }
            }
        }
        Err(Error::http(
            context,
            format!(
                "failed to generate a unique staging file name in '{}'",
                self.config.loader_tmp_dir
            ),
        ))
    }

    /// Append one row (terminator included) to the staging file, with
    /// the transaction identifier cell prepended.
    pub fn write_row(&mut self, row: &[u8]) -> std::io::Result<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "no staging file is open")
        })?;
        file.write_all(&self.row_prefix)?;
        file.write_all(row)
    }

    /// Load the staging file into the destination table. This is the
    /// irreversible step: the caller must clear the contribution's retry
    /// flag before invoking it.
    pub async fn load_data_into_table(&mut self, max_num_warnings: u64) -> Result<(), Error> {
        let context = "IngestFileSvc::load_data_into_table";
        let path = self
            .tmp_file
            .clone()
            .ok_or_else(|| Error::Logic(format!("{context} no staging file")))?;
        if let Some(file) = self.file.as_mut() {
            file.flush()
                .map_err(|e| Error::http(context, format!("failed to flush '{path}': {e}")))?;
        }

        let query = format!(
            "LOAD DATA LOCAL INFILE {} INTO TABLE {}.{} CHARACTER SET {} {}",
            sql_str(path.as_str()),
            sql_id(&self.dest_database),
            sql_id(&self.dest_table),
            sql_str(&self.charset_name),
            self.dialect.sql_options()
        );
        debug!(%query, "loading the contribution");

        let mut conn = self.db.pool().get_conn().await.map_err(sql_err)?;
        let infile = tokio::fs::File::open(path.as_std_path())
            .await
            .map_err(|e| Error::http(context, format!("failed to reopen '{path}': {e}")))?;
        conn.set_infile_handler(async move { Ok(ReaderStream::new(infile).boxed()) });

        let result = conn.query_iter(query).await.map_err(sql_err)?;
        self.num_rows_loaded = result.affected_rows();
        drop(result);

        self.num_warnings = conn
            .query_first::<u64, _>("SHOW COUNT(*) WARNINGS")
            .await
            .map_err(sql_err)?
            .unwrap_or(0);
        if self.num_warnings > 0 && max_num_warnings > 0 {
            let rows: Vec<(String, u32, String)> = conn
                .query(format!("SHOW WARNINGS LIMIT {max_num_warnings}"))
                .await
                .map_err(sql_err)?;
            self.warnings = rows
                .into_iter()
                .map(|(level, code, message)| format!("{level} [{code}]: {message}"))
                .collect();
        }
        Ok(())
    }

    pub fn num_rows_loaded(&self) -> u64 {
        self.num_rows_loaded
    }

    pub fn num_warnings(&self) -> u64 {
        self.num_warnings
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn dest_database(&self) -> &str {
        &self.dest_database
    }

    pub fn dest_table(&self) -> &str {
        &self.dest_table
    }

    /// Close and delete the staging file. Safe to call on any exit path.
    pub fn close_file(&mut self) {
        self.file = None;
        if let Some(key) = self.contrib_key.take() {
            LOADING_CONTRIBS.lock().remove(&key);
        }
        if let Some(path) = self.tmp_file.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(tmp_file = %path, "failed to remove the staging file: {e}");
                }
            }
        }
    }
}

impl Drop for IngestFileSvc {
    fn drop(&mut self) {
        self.close_file();
    }
}

fn db_err(e: DbError) -> Error {
    match e {
        DbError::NoSuchTransaction(id) => {
            Error::InvalidArgument(format!("no such transaction: {id}"))
        }
        DbError::NoSuchTable(table) => Error::InvalidArgument(format!("no such table: {table}")),
        other => Error::http("db", other.to_string()),
    }
}

fn sql_err(e: mysql_async::Error) -> Error {
    Error::http("mysql", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_statement_shape() {
        // The statement is assembled from quoted pieces; spot-check the
        // quoting helpers compose as expected.
        let stmt = format!(
            "LOAD DATA LOCAL INFILE {} INTO TABLE {}.{} CHARACTER SET {} {}",
            sql_str("/tmp/5-t-00ff.csv"),
            sql_id("user_demo"),
            sql_id("t"),
            sql_str("latin1"),
            Dialect::default().sql_options()
        );
        assert_eq!(
            stmt,
            "LOAD DATA LOCAL INFILE '/tmp/5-t-00ff.csv' INTO TABLE `user_demo`.`t` \
             CHARACTER SET 'latin1' FIELDS TERMINATED BY '\\t' ESCAPED BY '\\\\' \
             LINES TERMINATED BY '\\n'"
        );
    }
}
