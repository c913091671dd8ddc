use serde::{Deserialize, Serialize};

/// Identifier of a super-transaction opened against the replication
/// controller. Contributions reference the transaction they belong to.
pub type TransactionId = u32;

/// State of a super-transaction as reported by the controller.
///
/// Only `Started` transactions accept contributions. `Finished` and
/// `Aborted` are terminal and mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Started,
    Finished,
    Aborted,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionState::Started)
    }
}

/// Transaction info as seen by a worker: the identifier, the owning
/// database and the current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub id: TransactionId,
    pub database: String,
    pub state: TransactionState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_state_wire_form() {
        assert_eq!(
            serde_json::to_string(&TransactionState::Started).unwrap(),
            "\"STARTED\""
        );
        let state: TransactionState = serde_json::from_str("\"ABORTED\"").unwrap();
        assert_eq!(state, TransactionState::Aborted);
        assert!(state.is_terminal());
        assert!(!TransactionState::Started.is_terminal());
    }
}
