//! MySQL access of the worker services: the shared connection pool,
//! identifier/value quoting, and lookups against the replication
//! bookkeeping schema.

use mysql_async::prelude::*;
use mysql_async::{Opts, Pool};

use catalog_api::schema::ColumnDef;
use catalog_api::trans::{TransactionId, TransactionInfo, TransactionState};

pub use catalog_api::sql::{sql_id, sql_str};

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sql(#[from] mysql_async::Error),

    #[error("no such transaction: {0}")]
    NoSuchTransaction(TransactionId),

    #[error("no such table: {0}")]
    NoSuchTable(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// The worker's window into the shared MySQL server: the connection pool
/// plus queries against the replication bookkeeping schema.
pub struct DatabaseServices {
    pool: Pool,
    replica_db: String,
}

impl DatabaseServices {
    pub fn new(db_url: &str, replica_db: &str) -> Result<Self, DbError> {
        let opts = Opts::from_url(db_url)
            .map_err(|e| DbError::Config(format!("invalid database URL: {e}")))?;
        Ok(Self {
            pool: Pool::new(opts),
            replica_db: replica_db.to_owned(),
        })
    }

    /// The pool is shared across all worker-side handlers; connections
    /// are acquired per operation and returned on drop.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Look up a super-transaction in the bookkeeping schema.
    pub async fn transaction(&self, id: TransactionId) -> Result<TransactionInfo, DbError> {
        let mut conn = self.pool.get_conn().await?;
        let query = format!(
            "SELECT {}, {} FROM {}.{} WHERE {} = {}",
            sql_id("database"),
            sql_id("state"),
            sql_id(&self.replica_db),
            sql_id("transaction"),
            sql_id("id"),
            id
        );
        let row: Option<(String, String)> = conn.query_first(query).await?;
        let (database, state) = row.ok_or(DbError::NoSuchTransaction(id))?;
        let state = match state.as_str() {
            "STARTED" => TransactionState::Started,
            "FINISHED" => TransactionState::Finished,
            _ => TransactionState::Aborted,
        };
        Ok(TransactionInfo {
            id,
            database,
            state,
        })
    }

    pub async fn table_exists(&self, database: &str, table: &str) -> Result<bool, DbError> {
        let mut conn = self.pool.get_conn().await?;
        let count: Option<u64> = conn
            .exec_first(
                "SELECT COUNT(*) FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
                (database, table),
            )
            .await?;
        Ok(count.unwrap_or(0) != 0)
    }

    /// The schema of a table in column order.
    pub async fn table_schema(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Vec<ColumnDef>, DbError> {
        let mut conn = self.pool.get_conn().await?;
        let columns: Vec<(String, String)> = conn
            .exec(
                "SELECT COLUMN_NAME, COLUMN_TYPE FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
                (database, table),
            )
            .await?;
        if columns.is_empty() {
            return Err(DbError::NoSuchTable(format!("{database}.{table}")));
        }
        Ok(columns
            .into_iter()
            .map(|(name, col_type)| ColumnDef { name, col_type })
            .collect())
    }
}

