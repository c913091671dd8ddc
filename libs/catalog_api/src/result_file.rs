use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::query::QueryId;

/// The file extension of the per-query result staging files, including
/// the '.' prefix.
pub const RESULT_FILE_EXT: &str = ".proto";

/// Attributes encoded in the name of a per-query result staging file.
///
/// The file path is required to have the following format:
/// ```text
/// [<folder>/]<czar-id>-<query-id>-<job-id>-<chunk-id>-<attemptcount>[.<ext>]
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultFileName {
    pub czar_id: u32,
    pub query_id: QueryId,
    pub job_id: u32,
    pub chunk_id: u32,
    pub attempt_count: u32,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid result file name '{file_name}': {reason}")]
pub struct ResultFileNameError {
    pub file_name: String,
    pub reason: String,
}

impl ResultFileName {
    pub fn from_path(path: &Path) -> Result<Self, ResultFileNameError> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ResultFileNameError {
                file_name: path.display().to_string(),
                reason: "no file name".to_owned(),
            })?;
        stem.parse()
    }
}

impl FromStr for ResultFileName {
    type Err = ResultFileNameError;

    fn from_str(file_name: &str) -> Result<Self, Self::Err> {
        let err = |reason: String| ResultFileNameError {
            file_name: file_name.to_owned(),
            reason,
        };
        let stem = file_name.strip_suffix(RESULT_FILE_EXT).unwrap_or(file_name);
        let attrs: Vec<&str> = stem.split('-').collect();
        if attrs.len() != 5 {
            return Err(err(format!(
                "expected 5 '-'-separated attributes, found {}",
                attrs.len()
            )));
        }
        let parse = |name: &str, value: &str| -> Result<u64, ResultFileNameError> {
            value
                .parse::<u64>()
                .map_err(|e| err(format!("attribute {name}='{value}' is not a number: {e}")))
        };
        let narrow = |name: &str, value: u64| -> Result<u32, ResultFileNameError> {
            u32::try_from(value)
                .map_err(|_| err(format!("attribute {name}={value} is out of range")))
        };
        Ok(Self {
            czar_id: narrow("czar-id", parse("czar-id", attrs[0])?)?,
            query_id: parse("query-id", attrs[1])?,
            job_id: narrow("job-id", parse("job-id", attrs[2])?)?,
            chunk_id: narrow("chunk-id", parse("chunk-id", attrs[3])?)?,
            attempt_count: narrow("attemptcount", parse("attemptcount", attrs[4])?)?,
        })
    }
}

impl fmt::Display for ResultFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}-{}",
            self.czar_id, self.query_id, self.job_id, self.chunk_id, self.attempt_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_and_with_extension() {
        let expected = ResultFileName {
            czar_id: 1,
            query_id: 2,
            job_id: 3,
            chunk_id: 4,
            attempt_count: 5,
        };
        assert_eq!("1-2-3-4-5".parse::<ResultFileName>().unwrap(), expected);
        assert_eq!(
            "1-2-3-4-5.proto".parse::<ResultFileName>().unwrap(),
            expected
        );
        assert_eq!(
            ResultFileName::from_path(Path::new("/qserv/results/1-2-3-4-5.proto")).unwrap(),
            expected
        );
    }

    #[test]
    fn display_round_trip() {
        let name = ResultFileName {
            czar_id: 123,
            query_id: u64::MAX,
            job_id: 0,
            chunk_id: 4294967295,
            attempt_count: 1,
        };
        assert_eq!(name.to_string().parse::<ResultFileName>().unwrap(), name);
    }

    #[test]
    fn reject_malformed_names() {
        assert!("1-2-3-4".parse::<ResultFileName>().is_err());
        assert!("1-2-3-4-5-6".parse::<ResultFileName>().is_err());
        assert!("a-2-3-4-5".parse::<ResultFileName>().is_err());
        // czar-id is 32-bit
        assert!("4294967296-2-3-4-5".parse::<ResultFileName>().is_err());
        // negative numbers never appear in valid names
        assert!("-1-2-3-4-5".parse::<ResultFileName>().is_err());
    }
}
