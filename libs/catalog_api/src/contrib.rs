use serde::{Deserialize, Serialize};

use crate::dialect::DialectInput;
use crate::trans::TransactionId;

/// Processing stage of a contribution.
///
/// The stages progress `Created -> Started -> Read -> Loaded`, or land in
/// `Failed` from any of them. A contribution that reached `Loaded` is never
/// retryable: the destination table has been modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContribStatus {
    Created,
    Started,
    Read,
    Loaded,
    Failed,
}

/// One unit of bulk data sent into a transaction: a CSV file or a JSON row
/// batch targeting one table at one worker, possibly the overlap of a chunk.
///
/// The descriptor is included verbatim in worker responses so the client
/// side can decide whether a failed contribution may be resubmitted
/// (`retry_allowed`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionContrib {
    pub transaction_id: TransactionId,
    pub database: String,
    pub table: String,
    pub chunk: u32,
    pub is_overlap: bool,
    pub worker: String,

    /// The logical source of the data, e.g. `data-csv://<addr>/<filename>`.
    pub url: String,
    pub charset_name: String,
    pub dialect: DialectInput,
    pub max_num_warnings: u64,

    pub status: ContribStatus,

    /// Cleared immediately before the irreversible `LOAD DATA` statement
    /// is issued.
    pub retry_allowed: bool,

    pub tmp_file: String,
    pub num_rows: u64,
    pub num_bytes: u64,
    pub num_rows_loaded: u64,
    pub num_warnings: u64,
    pub warnings: Vec<String>,

    pub http_error: u16,
    pub system_error: i32,
    pub error: String,
}

impl TransactionContrib {
    pub fn new(transaction_id: TransactionId, worker: &str) -> Self {
        Self {
            transaction_id,
            database: String::new(),
            table: String::new(),
            chunk: 0,
            is_overlap: false,
            worker: worker.to_owned(),
            url: String::new(),
            charset_name: String::new(),
            dialect: DialectInput::default(),
            max_num_warnings: 0,
            status: ContribStatus::Created,
            retry_allowed: false,
            tmp_file: String::new(),
            num_rows: 0,
            num_bytes: 0,
            num_rows_loaded: 0,
            num_warnings: 0,
            warnings: Vec::new(),
            http_error: 0,
            system_error: 0,
            error: String::new(),
        }
    }

    /// Record a failure, keeping the first reported error message.
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.error.is_empty() {
            self.error = error.into();
        }
        self.status = ContribStatus::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_invariants() {
        let mut contrib = TransactionContrib::new(12, "worker-A");
        assert_eq!(contrib.status, ContribStatus::Created);
        assert!(!contrib.retry_allowed);

        contrib.retry_allowed = true;
        contrib.status = ContribStatus::Read;

        // Loading is irreversible.
        contrib.retry_allowed = false;
        contrib.status = ContribStatus::Loaded;
        assert!(!contrib.retry_allowed);

        contrib.fail("disk full");
        contrib.fail("second error is ignored");
        assert_eq!(contrib.error, "disk full");
        assert_eq!(contrib.status, ContribStatus::Failed);
    }

    #[test]
    fn wire_form_keeps_snake_case_counters() {
        let contrib = TransactionContrib::new(7, "w");
        let json = serde_json::to_value(&contrib).unwrap();
        assert_eq!(json["transaction_id"], 7);
        assert_eq!(json["num_rows_loaded"], 0);
        assert_eq!(json["status"], "CREATED");
    }
}
