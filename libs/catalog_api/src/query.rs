use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Identifier of a user query registered by the czar.
pub type QueryId = u64;

/// Processing status of an async user query.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    Executing,
    Completed,
    Failed,
    Aborted,
}

/// The status tuple reported for an async query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStatusTuple {
    pub query_id: QueryId,
    pub status: QueryStatus,
    pub czar_id: u32,
    pub czar_type: String,
    pub total_chunks: u64,
    pub completed_chunks: u64,
    pub collected_bytes: u64,
    pub collected_rows: u64,
    pub final_rows: u64,
    pub query_begin_epoch: u64,
    pub last_update_epoch: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for status in [
            QueryStatus::Executing,
            QueryStatus::Completed,
            QueryStatus::Failed,
            QueryStatus::Aborted,
        ] {
            let s = status.to_string();
            assert_eq!(s.parse::<QueryStatus>().unwrap(), status);
        }
        assert!("RUNNING".parse::<QueryStatus>().is_err());
    }

    #[test]
    fn tuple_uses_camel_case_keys() {
        let tuple = QueryStatusTuple {
            query_id: 5,
            status: QueryStatus::Executing,
            czar_id: 1,
            czar_type: "http".to_owned(),
            total_chunks: 10,
            completed_chunks: 3,
            collected_bytes: 0,
            collected_rows: 0,
            final_rows: 0,
            query_begin_epoch: 100,
            last_update_epoch: 101,
        };
        let json = serde_json::to_value(&tuple).unwrap();
        assert_eq!(json["queryId"], 5);
        assert_eq!(json["completedChunks"], 3);
        assert_eq!(json["status"], "EXECUTING");
    }
}
