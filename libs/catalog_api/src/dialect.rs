use serde::{Deserialize, Serialize};

/// The CSV dialect attributes as they travel on the wire: each value is
/// a string holding either a single character or one of the JSON-style
/// escape sequences (`\t`, `\n`, `\r`, `\\`, `\0`).
///
/// `fields_enclosed_by` set to `\0` means the fields are not quoted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialectInput {
    #[serde(default = "DialectInput::default_fields_terminated_by")]
    pub fields_terminated_by: String,
    #[serde(default = "DialectInput::default_fields_enclosed_by")]
    pub fields_enclosed_by: String,
    #[serde(default = "DialectInput::default_fields_escaped_by")]
    pub fields_escaped_by: String,
    #[serde(default = "DialectInput::default_lines_terminated_by")]
    pub lines_terminated_by: String,
}

impl Default for DialectInput {
    fn default() -> Self {
        Self {
            fields_terminated_by: Self::default_fields_terminated_by(),
            fields_enclosed_by: Self::default_fields_enclosed_by(),
            fields_escaped_by: Self::default_fields_escaped_by(),
            lines_terminated_by: Self::default_lines_terminated_by(),
        }
    }
}

impl DialectInput {
    fn default_fields_terminated_by() -> String {
        r"\t".to_owned()
    }
    fn default_fields_enclosed_by() -> String {
        r"\0".to_owned()
    }
    fn default_fields_escaped_by() -> String {
        r"\\".to_owned()
    }
    fn default_lines_terminated_by() -> String {
        r"\n".to_owned()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid dialect character '{input}' for '{attribute}'")]
pub struct DialectError {
    pub attribute: &'static str,
    pub input: String,
}

/// The decoded dialect: every attribute is a single byte.
/// `fields_enclosed_by == 0` means the fields are not quoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    fields_terminated_by: u8,
    fields_enclosed_by: u8,
    fields_escaped_by: u8,
    lines_terminated_by: u8,
}

impl Default for Dialect {
    fn default() -> Self {
        Self {
            fields_terminated_by: b'\t',
            fields_enclosed_by: 0,
            fields_escaped_by: b'\\',
            lines_terminated_by: b'\n',
        }
    }
}

impl TryFrom<&DialectInput> for Dialect {
    type Error = DialectError;

    fn try_from(input: &DialectInput) -> Result<Self, DialectError> {
        Ok(Self {
            fields_terminated_by: decode_char("fields_terminated_by", &input.fields_terminated_by)?,
            fields_enclosed_by: decode_char("fields_enclosed_by", &input.fields_enclosed_by)?,
            fields_escaped_by: decode_char("fields_escaped_by", &input.fields_escaped_by)?,
            lines_terminated_by: decode_char("lines_terminated_by", &input.lines_terminated_by)?,
        })
    }
}

impl Dialect {
    pub fn fields_terminated_by(&self) -> u8 {
        self.fields_terminated_by
    }

    /// Zero when the fields are not quoted.
    pub fn fields_enclosed_by(&self) -> u8 {
        self.fields_enclosed_by
    }

    pub fn fields_escaped_by(&self) -> u8 {
        self.fields_escaped_by
    }

    pub fn lines_terminated_by(&self) -> u8 {
        self.lines_terminated_by
    }

    /// The `FIELDS ... LINES ...` clauses of `LOAD DATA INFILE` and
    /// `SELECT ... INTO OUTFILE` statements for this dialect.
    pub fn sql_options(&self) -> String {
        let mut out = format!(
            "FIELDS TERMINATED BY {}",
            char_literal(self.fields_terminated_by)
        );
        if self.fields_enclosed_by != 0 {
            out += &format!(" ENCLOSED BY {}", char_literal(self.fields_enclosed_by));
        }
        out += &format!(
            " ESCAPED BY {} LINES TERMINATED BY {}",
            char_literal(self.fields_escaped_by),
            char_literal(self.lines_terminated_by)
        );
        out
    }
}

/// Decode one dialect attribute into a single byte. The JSON-style escape
/// sequences are decoded first; any other single-character string is taken
/// verbatim.
fn decode_char(attribute: &'static str, input: &str) -> Result<u8, DialectError> {
    let err = || DialectError {
        attribute,
        input: input.to_owned(),
    };
    match input {
        r"\t" => Ok(b'\t'),
        r"\n" => Ok(b'\n'),
        r"\r" => Ok(b'\r'),
        r"\\" => Ok(b'\\'),
        r"\0" | "" => Ok(0),
        _ => {
            let bytes = input.as_bytes();
            if bytes.len() != 1 {
                return Err(err());
            }
            Ok(bytes[0])
        }
    }
}

/// A single-byte MySQL string literal, escaped where the plain character
/// would break the statement.
fn char_literal(c: u8) -> String {
    match c {
        b'\t' => "'\\t'".to_owned(),
        b'\n' => "'\\n'".to_owned(),
        b'\r' => "'\\r'".to_owned(),
        b'\\' => "'\\\\'".to_owned(),
        b'\'' => "'\\''".to_owned(),
        0 => "''".to_owned(),
        _ => format!("'{}'", c as char),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_dialect() {
        let dialect = Dialect::try_from(&DialectInput::default()).unwrap();
        assert_eq!(dialect, Dialect::default());
        assert_eq!(dialect.fields_terminated_by(), b'\t');
        assert_eq!(dialect.fields_enclosed_by(), 0);
        assert_eq!(dialect.fields_escaped_by(), b'\\');
        assert_eq!(dialect.lines_terminated_by(), b'\n');
    }

    #[test]
    fn decode_escapes_and_plain_chars() {
        let input = DialectInput {
            fields_terminated_by: ",".to_owned(),
            fields_enclosed_by: "\"".to_owned(),
            fields_escaped_by: r"\\".to_owned(),
            lines_terminated_by: r"\n".to_owned(),
        };
        let dialect = Dialect::try_from(&input).unwrap();
        assert_eq!(dialect.fields_terminated_by(), b',');
        assert_eq!(dialect.fields_enclosed_by(), b'"');
    }

    #[test]
    fn reject_multibyte_values() {
        let input = DialectInput {
            fields_terminated_by: "||".to_owned(),
            ..DialectInput::default()
        };
        let err = Dialect::try_from(&input).unwrap_err();
        assert_eq!(err.attribute, "fields_terminated_by");
    }

    #[test]
    fn sql_options_with_and_without_quotes() {
        let dialect = Dialect::default();
        assert_eq!(
            dialect.sql_options(),
            "FIELDS TERMINATED BY '\\t' ESCAPED BY '\\\\' LINES TERMINATED BY '\\n'"
        );
        let input = DialectInput {
            fields_enclosed_by: "\"".to_owned(),
            ..DialectInput::default()
        };
        let quoted = Dialect::try_from(&input).unwrap();
        assert!(quoted.sql_options().contains("ENCLOSED BY '\"'"));
    }
}
