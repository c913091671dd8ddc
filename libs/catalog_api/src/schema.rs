use serde::{Deserialize, Serialize};

/// A column descriptor of a table schema as it travels in ingest requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub col_type: String,
}

/// The name of the column the ingest machinery prepends to every
/// partitioned or fully-replicated table to track the super-transaction
/// that delivered each row. Workflows never see or supply this column.
pub const TRANS_ID_COLUMN: &str = "qserv_trans_id";

/// The SQL type tokens that open every binary MySQL column type.
/// NOTE: values of the MySQL type BIT(N) are reported as binary strings
/// where the number of characters is equal to CEIL(N/8).
const BIN_TYPE_PREFIXES: &[&str] = &[
    "BIT",
    "BINARY",
    "VARBINARY",
    "TINYBLOB",
    "BLOB",
    "MEDIUMBLOB",
    "LONGBLOB",
];

/// Check if the SQL type represents a binary column. The match is
/// case-insensitive and ignores any length suffix, e.g. `varbinary(16)`.
pub fn is_binary_column_type(col_type: &str) -> bool {
    let upper = col_type.to_uppercase();
    BIN_TYPE_PREFIXES
        .iter()
        .any(|prefix| upper.starts_with(prefix))
}

/// The name of the MySQL table holding one chunk of a partitioned table,
/// or the chunk's overlap.
pub fn chunked_table_name(table: &str, chunk: u32, is_overlap: bool) -> String {
    if is_overlap {
        format!("{table}FullOverlap_{chunk}")
    } else {
        format!("{table}_{chunk}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_type_classification() {
        for t in [
            "BIT(1)",
            "binary(16)",
            "VARBINARY(255)",
            "TinyBlob",
            "BLOB",
            "MEDIUMBLOB",
            "longblob",
        ] {
            assert!(is_binary_column_type(t), "{t} must be binary");
        }
        for t in ["INT", "VARCHAR(16)", "DOUBLE", "TEXT", "DATETIME"] {
            assert!(!is_binary_column_type(t), "{t} must not be binary");
        }
    }

    #[test]
    fn chunked_table_names() {
        assert_eq!(chunked_table_name("Object", 57, false), "Object_57");
        assert_eq!(
            chunked_table_name("Object", 57, true),
            "ObjectFullOverlap_57"
        );
    }

    #[test]
    fn column_def_wire_form() {
        let col: ColumnDef = serde_json::from_str(r#"{"name":"ra","type":"DOUBLE"}"#).unwrap();
        assert_eq!(col.name, "ra");
        assert_eq!(col.col_type, "DOUBLE");
    }
}
