//! Quoting helpers for assembled SQL statements.

/// A backtick-quoted SQL identifier.
pub fn sql_id(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// A single-quoted SQL string literal.
pub fn sql_str(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_and_literal_quoting() {
        assert_eq!(sql_id("table"), "`table`");
        assert_eq!(sql_id("we`ird"), "`we``ird`");
        assert_eq!(sql_str("plain"), "'plain'");
        assert_eq!(sql_str("it's"), r"'it\'s'");
        assert_eq!(sql_str(r"back\slash"), r"'back\\slash'");
    }
}
