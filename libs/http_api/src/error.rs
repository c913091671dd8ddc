use serde_json::Value;

/// The error type of the HTTP layer and of the request-processing
/// modules.
///
/// `Http` carries the optional machine-readable `error_ext` object which
/// the module framework forwards verbatim to clients in the response
/// envelope.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("authorization error: {0}")]
    Auth(String),

    #[error("logic error: {0}")]
    Logic(String),

    #[error("{message}")]
    Http {
        message: String,
        error_ext: Value,
    },
}

impl Error {
    pub fn http(context: &str, message: impl Into<String>) -> Self {
        Self::Http {
            message: format!("{context} {}", message.into()),
            error_ext: Value::Object(Default::default()),
        }
    }

    pub fn http_ext(context: &str, message: impl Into<String>, error_ext: Value) -> Self {
        Self::Http {
            message: format!("{context} {}", message.into()),
            error_ext,
        }
    }

    /// The machine-readable diagnostics of the error; an empty object for
    /// the variants that carry none.
    pub fn error_ext(&self) -> Value {
        match self {
            Self::Http { error_ext, .. } => error_ext.clone(),
            _ => Value::Object(Default::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_carries_the_extension() {
        let err = Error::http_ext(
            "ingest",
            "error(s) reported by workers",
            serde_json::json!({"worker_errors": {"B": "disk full"}}),
        );
        assert_eq!(err.to_string(), "ingest error(s) reported by workers");
        assert_eq!(err.error_ext()["worker_errors"]["B"], "disk full");
        assert_eq!(
            Error::InvalidArgument("x".into()).error_ext(),
            serde_json::json!({})
        );
    }
}
