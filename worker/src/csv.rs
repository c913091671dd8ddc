//! A dialect-driven streaming row splitter.
//!
//! The parser passes input bytes through unmodified; its only job is to
//! find row boundaries so the loader can count rows and write whole rows
//! into the staging file. A line terminator hidden behind the escape
//! character or inside enclosed fields is not a boundary.

use catalog_api::dialect::Dialect;

pub struct Parser {
    dialect: Dialect,
    row: Vec<u8>,
    in_quotes: bool,
    escaped: bool,
}

impl Parser {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            row: Vec::new(),
            in_quotes: false,
            escaped: false,
        }
    }

    /// Consume the next portion of the input, invoking `on_row` for every
    /// completed row (the terminator included). With `flush` set the
    /// buffered tail is emitted as the final, unterminated row.
    pub fn parse(
        &mut self,
        data: &[u8],
        flush: bool,
        mut on_row: impl FnMut(&[u8]) -> std::io::Result<()>,
    ) -> std::io::Result<()> {
        let quote = self.dialect.fields_enclosed_by();
        let escape = self.dialect.fields_escaped_by();
        let line_term = self.dialect.lines_terminated_by();

        for &byte in data {
            self.row.push(byte);
            if self.escaped {
                self.escaped = false;
                continue;
            }
            if escape != 0 && byte == escape {
                self.escaped = true;
                continue;
            }
            if quote != 0 && byte == quote {
                self.in_quotes = !self.in_quotes;
                continue;
            }
            if byte == line_term && !self.in_quotes {
                on_row(&self.row)?;
                self.row.clear();
            }
        }
        if flush {
            if !self.row.is_empty() {
                on_row(&self.row)?;
                self.row.clear();
            }
            self.in_quotes = false;
            self.escaped = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_api::dialect::DialectInput;

    fn rows_of(dialect: Dialect, chunks: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut parser = Parser::new(dialect);
        let mut rows = Vec::new();
        for (idx, chunk) in chunks.iter().enumerate() {
            let flush = idx + 1 == chunks.len();
            parser
                .parse(chunk, flush, |row| {
                    rows.push(row.to_vec());
                    Ok(())
                })
                .unwrap();
        }
        rows
    }

    #[test]
    fn default_dialect_splits_on_newlines() {
        let rows = rows_of(Dialect::default(), &[b"1\ta\n2\tb\n3\tc\n"]);
        assert_eq!(rows, vec![b"1\ta\n".to_vec(), b"2\tb\n".to_vec(), b"3\tc\n".to_vec()]);
    }

    #[test]
    fn split_across_chunks() {
        let rows = rows_of(Dialect::default(), &[b"1\ta", b"bc\n2\t", b"d\n"]);
        assert_eq!(rows, vec![b"1\tabc\n".to_vec(), b"2\td\n".to_vec()]);
    }

    #[test]
    fn unterminated_tail_is_flushed() {
        let rows = rows_of(Dialect::default(), &[b"1\ta\n2\tb"]);
        assert_eq!(rows, vec![b"1\ta\n".to_vec(), b"2\tb".to_vec()]);
    }

    #[test]
    fn escaped_terminator_is_not_a_boundary() {
        let rows = rows_of(Dialect::default(), &[b"a\\\nb\n"]);
        assert_eq!(rows, vec![b"a\\\nb\n".to_vec()]);
    }

    #[test]
    fn quoted_terminator_is_not_a_boundary() {
        let input = DialectInput {
            fields_enclosed_by: "\"".to_owned(),
            ..DialectInput::default()
        };
        let dialect = Dialect::try_from(&input).unwrap();
        let rows = rows_of(dialect, &[b"\"a\nb\"\tc\n"]);
        assert_eq!(rows, vec![b"\"a\nb\"\tc\n".to_vec()]);
    }

    #[test]
    fn empty_input_produces_no_rows() {
        assert!(rows_of(Dialect::default(), &[b""]).is_empty());
    }
}
