//! Streaming decomposition of `multipart/form-data` request bodies.
//!
//! The parser is fed with body chunks and pushes events into a
//! [`MultipartConsumer`]: a *parameter value* event for each part without a
//! `filename`, and an open/data/close event sequence for each file part.
//! Returning `false` from any event handler cancels the parse; a cancelled
//! parse never emits the terminal *finished* event.

use std::collections::HashMap;

/// Default upper bound of one file-data event.
pub const DEFAULT_MAX_RECORD_SIZE: usize = 1024 * 1024;

/// The parsed header block of one multipart entry.
#[derive(Debug, Clone, Default)]
pub struct ContentHeader {
    headers: HashMap<String, String>,
    name: String,
    filename: String,
    content_type: String,
}

impl ContentHeader {
    fn parse(raw: &str) -> Self {
        let mut headers = HashMap::new();
        for line in raw.split("\r\n") {
            if let Some((key, value)) = line.split_once(':') {
                headers.insert(key.trim().to_lowercase(), value.trim().to_owned());
            }
        }
        let disposition = headers
            .get("content-disposition")
            .cloned()
            .unwrap_or_default();
        let name = Self::param(&disposition, "name").unwrap_or_default();
        let filename = Self::param(&disposition, "filename").unwrap_or_default();
        let content_type = headers.get("content-type").cloned().unwrap_or_default();
        Self {
            headers,
            name,
            filename,
            content_type,
        }
    }

    /// Extract a quoted parameter of a header value. Parameter names are
    /// matched case-insensitively.
    fn param(header_value: &str, param: &str) -> Option<String> {
        let lower = header_value.to_lowercase();
        let tag = format!("{param}=\"");
        let pos = lower.find(&tag)?;
        let start = pos + tag.len();
        let end = header_value[start..].find('"')? + start;
        Some(header_value[start..end].trim().to_owned())
    }

    pub fn valid(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn is_file(&self) -> bool {
        !self.filename.is_empty()
    }

    /// Case-insensitive lookup of an arbitrary entry header.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_lowercase()).map(|s| s.as_str())
    }
}

/// Receiver of parser events. Every `bool` return decides whether parsing
/// continues.
pub trait MultipartConsumer {
    fn on_param_value(&mut self, hdr: &ContentHeader, name: &str, value: &[u8]) -> bool;
    fn on_file_open(&mut self, hdr: &ContentHeader, name: &str, filename: &str, content_type: &str)
        -> bool;
    fn on_file_data(&mut self, data: &[u8]) -> bool;
    fn on_file_close(&mut self) -> bool;
    fn on_finished(&mut self, error: &str);
}

/// Extract the boundary token of a `multipart/form-data` content type.
/// The parameter name is matched case-insensitively and an optionally
/// quoted value is accepted.
pub fn boundary_of(content_type: &str) -> Option<String> {
    let lower = content_type.to_lowercase();
    if !lower.starts_with("multipart/form-data") {
        return None;
    }
    let pos = lower.find("boundary=")?;
    let raw = content_type[pos + "boundary=".len()..]
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();
    let unquoted = raw.trim_matches('"');
    if unquoted.is_empty() {
        None
    } else {
        Some(unquoted.to_owned())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    Preamble,
    Headers,
    Body,
    Done,
    Cancelled,
    Failed,
}

/// The streaming push parser. Feed it body chunks with [`feed`] and signal
/// the end of the stream with [`finish`].
///
/// [`feed`]: MultipartParser::feed
/// [`finish`]: MultipartParser::finish
pub struct MultipartParser {
    delimiter: Vec<u8>,
    max_record_size: usize,
    buf: Vec<u8>,
    state: State,
    header: ContentHeader,
    param_value: Vec<u8>,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        Self::with_record_size(boundary, DEFAULT_MAX_RECORD_SIZE)
    }

    pub fn with_record_size(boundary: &str, max_record_size: usize) -> Self {
        Self {
            delimiter: format!("--{boundary}").into_bytes(),
            max_record_size: max_record_size.max(1),
            buf: Vec::new(),
            state: State::Preamble,
            header: ContentHeader::default(),
            param_value: Vec::new(),
        }
    }

    /// Parse the whole body in one go.
    pub fn parse(content_type: &str, body: &[u8], consumer: &mut dyn MultipartConsumer) {
        let Some(boundary) = boundary_of(content_type) else {
            consumer.on_finished("Content-Type is not multipart/form-data");
            return;
        };
        let mut parser = Self::new(&boundary);
        if parser.feed(body, consumer) {
            parser.finish(consumer);
        }
    }

    /// Push the next body chunk. Returns `false` once the consumer has
    /// cancelled the parse or the stream turned out malformed; further
    /// calls are no-ops then. Trailing bytes after the closing boundary
    /// are ignored.
    pub fn feed(&mut self, data: &[u8], consumer: &mut dyn MultipartConsumer) -> bool {
        match self.state {
            State::Cancelled | State::Failed => return false,
            State::Done => return true,
            _ => {}
        }
        self.buf.extend_from_slice(data);
        self.advance(consumer);
        !matches!(self.state, State::Cancelled | State::Failed)
    }

    /// Signal the end of the body stream: emits the terminal event unless
    /// the parse was cancelled.
    pub fn finish(&mut self, consumer: &mut dyn MultipartConsumer) {
        match self.state {
            State::Done => consumer.on_finished(""),
            State::Cancelled | State::Failed => {}
            _ => {
                self.state = State::Failed;
                consumer.on_finished(
                    "failed to find the end of the content entry in the request body",
                );
            }
        }
    }

    fn advance(&mut self, consumer: &mut dyn MultipartConsumer) {
        loop {
            match self.state {
                State::Preamble => {
                    let Some(pos) = find(&self.buf, &self.delimiter) else {
                        // Anything before the first delimiter is preamble;
                        // retain only a potential delimiter prefix.
                        let keep = self.buf.len().min(self.delimiter.len() - 1);
                        self.buf.drain(..self.buf.len() - keep);
                        return;
                    };
                    self.buf.drain(..pos + self.delimiter.len());
                    if !self.consume_delimiter_suffix(consumer) {
                        return;
                    }
                }
                State::Headers => {
                    let Some(pos) = find(&self.buf, b"\r\n\r\n") else {
                        return;
                    };
                    let raw = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
                    self.buf.drain(..pos + 4);
                    self.header = ContentHeader::parse(&raw);
                    if !self.header.valid() {
                        self.state = State::Failed;
                        consumer.on_finished("invalid content header found in the request body");
                        return;
                    }
                    self.param_value.clear();
                    if self.header.is_file() {
                        let hdr = self.header.clone();
                        if !consumer.on_file_open(
                            &hdr,
                            hdr.name(),
                            hdr.filename(),
                            hdr.content_type(),
                        ) {
                            self.state = State::Cancelled;
                            return;
                        }
                    }
                    self.state = State::Body;
                }
                State::Body => {
                    // The entry content ends with "\r\n--boundary".
                    let mut terminator = b"\r\n".to_vec();
                    terminator.extend_from_slice(&self.delimiter);
                    if let Some(pos) = find(&self.buf, &terminator) {
                        if !self.emit_content(pos, true, consumer) {
                            return;
                        }
                        self.buf.drain(..pos + terminator.len());
                        if !self.consume_delimiter_suffix(consumer) {
                            return;
                        }
                    } else {
                        // Emit what certainly belongs to the content and
                        // keep a tail that may hold a partial terminator.
                        let keep = self.buf.len().min(terminator.len() - 1);
                        let safe = self.buf.len() - keep;
                        if safe > 0 && !self.emit_content(safe, false, consumer) {
                            return;
                        }
                        if safe > 0 {
                            self.buf.drain(..safe);
                        }
                        return;
                    }
                }
                State::Done | State::Cancelled | State::Failed => return,
            }
        }
    }

    /// After a delimiter: "--" closes the stream, CRLF opens the next
    /// entry. Returns `false` when more input is needed or the parse is
    /// over.
    fn consume_delimiter_suffix(&mut self, consumer: &mut dyn MultipartConsumer) -> bool {
        if self.buf.len() < 2 {
            // Wait for more data; re-prepend the delimiter so the state
            // machine re-discovers it on the next feed.
            let mut restored = self.delimiter.clone();
            restored.extend_from_slice(&self.buf);
            self.buf = restored;
            self.state = State::Preamble;
            return false;
        }
        if &self.buf[..2] == b"--" {
            self.state = State::Done;
            return false;
        }
        if &self.buf[..2] == b"\r\n" {
            self.buf.drain(..2);
            self.state = State::Headers;
            return true;
        }
        self.state = State::Failed;
        consumer.on_finished("malformed boundary delimiter in the request body");
        false
    }

    /// Deliver `len` leading buffered bytes of the current entry. For the
    /// final portion of a parameter entry the accumulated value event is
    /// emitted.
    fn emit_content(
        &mut self,
        len: usize,
        entry_complete: bool,
        consumer: &mut dyn MultipartConsumer,
    ) -> bool {
        if self.header.is_file() {
            let mut offset = 0;
            while offset < len {
                let chunk = (len - offset).min(self.max_record_size);
                if !consumer.on_file_data(&self.buf[offset..offset + chunk]) {
                    self.state = State::Cancelled;
                    return false;
                }
                offset += chunk;
            }
            if entry_complete && !consumer.on_file_close() {
                self.state = State::Cancelled;
                return false;
            }
        } else {
            self.param_value.extend_from_slice(&self.buf[..len]);
            if entry_complete {
                let hdr = self.header.clone();
                let value = std::mem::take(&mut self.param_value);
                if !consumer.on_param_value(&hdr, hdr.name(), &value) {
                    self.state = State::Cancelled;
                    return false;
                }
            }
        }
        true
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        cancel_at: Option<String>,
    }

    impl Recorder {
        fn push(&mut self, event: String) -> bool {
            let cancel = self
                .cancel_at
                .as_ref()
                .map(|at| event.starts_with(at.as_str()))
                .unwrap_or(false);
            self.events.push(event);
            !cancel
        }
    }

    impl MultipartConsumer for Recorder {
        fn on_param_value(&mut self, _hdr: &ContentHeader, name: &str, value: &[u8]) -> bool {
            self.push(format!("param:{name}={}", String::from_utf8_lossy(value)))
        }
        fn on_file_open(
            &mut self,
            _hdr: &ContentHeader,
            name: &str,
            filename: &str,
            content_type: &str,
        ) -> bool {
            self.push(format!("open:{name}:{filename}:{content_type}"))
        }
        fn on_file_data(&mut self, data: &[u8]) -> bool {
            self.push(format!("data:{}", String::from_utf8_lossy(data)))
        }
        fn on_file_close(&mut self) -> bool {
            self.push("close".to_owned())
        }
        fn on_finished(&mut self, error: &str) {
            self.events.push(format!("finished:{error}"));
        }
    }

    fn body() -> Vec<u8> {
        concat!(
            "--sep\r\n",
            "Content-Disposition: form-data; name=\"transaction_id\"\r\n",
            "\r\n",
            "5\r\n",
            "--sep\r\n",
            "Content-Disposition: form-data; name=\"rows\"; filename=\"rows.csv\"\r\n",
            "Content-Type: text/csv\r\n",
            "\r\n",
            "1\ta\n2\tb\n3\tc\n\r\n",
            "--sep--\r\n"
        )
        .as_bytes()
        .to_vec()
    }

    #[test]
    fn eager_parse_emits_the_full_event_sequence() {
        let mut recorder = Recorder::default();
        MultipartParser::parse("multipart/form-data; boundary=sep", &body(), &mut recorder);
        assert_eq!(
            recorder.events,
            vec![
                "param:transaction_id=5",
                "open:rows:rows.csv:text/csv",
                "data:1\ta\n2\tb\n3\tc\n",
                "close",
                "finished:",
            ]
        );
    }

    #[test]
    fn streaming_parse_is_chunk_boundary_agnostic() {
        let body = body();
        // Exhaustively re-split the body at every position.
        for split in 1..body.len() {
            let mut recorder = Recorder::default();
            let mut parser = MultipartParser::new("sep");
            assert!(parser.feed(&body[..split], &mut recorder));
            assert!(parser.feed(&body[split..], &mut recorder));
            parser.finish(&mut recorder);
            assert_eq!(
                recorder.events.first().unwrap(),
                "param:transaction_id=5",
                "split at {split}"
            );
            assert_eq!(recorder.events.last().unwrap(), "finished:", "split at {split}");
            let opens = recorder.events.iter().filter(|e| e.starts_with("open")).count();
            let closes = recorder.events.iter().filter(|e| *e == "close").count();
            assert_eq!(opens, 1, "split at {split}");
            assert_eq!(closes, 1, "split at {split}");
            let data: String = recorder
                .events
                .iter()
                .filter_map(|e| e.strip_prefix("data:"))
                .collect();
            assert_eq!(data, "1\ta\n2\tb\n3\tc\n", "split at {split}");
        }
    }

    #[test]
    fn large_file_data_is_split_into_records() {
        let payload = "x".repeat(10);
        let body = format!(
            "--sep\r\nContent-Disposition: form-data; name=\"rows\"; filename=\"f\"\r\n\r\n{payload}\r\n--sep--\r\n"
        );
        let mut recorder = Recorder::default();
        let mut parser = MultipartParser::with_record_size("sep", 4);
        assert!(parser.feed(body.as_bytes(), &mut recorder));
        parser.finish(&mut recorder);
        let chunks: Vec<&String> = recorder
            .events
            .iter()
            .filter(|e| e.starts_with("data:"))
            .collect();
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.len() - "data:".len() <= 4));
    }

    #[test]
    fn cancellation_suppresses_further_events() {
        let mut recorder = Recorder {
            cancel_at: Some("open".to_owned()),
            ..Default::default()
        };
        let mut parser = MultipartParser::new("sep");
        assert!(!parser.feed(&body(), &mut recorder));
        parser.finish(&mut recorder);
        assert_eq!(recorder.events.last().unwrap(), "open:rows:rows.csv:text/csv");
        assert!(!recorder.events.iter().any(|e| e.starts_with("finished")));
    }

    #[test]
    fn wrong_content_type_reports_an_error() {
        let mut recorder = Recorder::default();
        MultipartParser::parse("application/json", b"{}", &mut recorder);
        assert_eq!(
            recorder.events,
            vec!["finished:Content-Type is not multipart/form-data"]
        );
    }

    #[test]
    fn truncated_body_reports_an_error() {
        let body = body();
        let mut recorder = Recorder::default();
        let mut parser = MultipartParser::new("sep");
        assert!(parser.feed(&body[..body.len() - 10], &mut recorder));
        parser.finish(&mut recorder);
        assert!(recorder
            .events
            .last()
            .unwrap()
            .starts_with("finished:failed to find the end"));
    }

    #[test]
    fn boundary_extraction() {
        assert_eq!(
            boundary_of("multipart/form-data; boundary=abc123").as_deref(),
            Some("abc123")
        );
        assert_eq!(
            boundary_of("multipart/form-data; charset=utf-8; boundary=\"a b\"").as_deref(),
            Some("a b")
        );
        assert_eq!(boundary_of("text/plain"), None);
        assert_eq!(boundary_of("multipart/form-data"), None);
    }

    #[test]
    fn header_parameters_are_case_insensitive() {
        let hdr = ContentHeader::parse(
            "CONTENT-DISPOSITION: form-data; NAME=\"a\"; FILENAME=\"b.csv\"\r\nCONTENT-TYPE: text/csv",
        );
        assert!(hdr.valid());
        assert_eq!(hdr.name(), "a");
        assert_eq!(hdr.filename(), "b.csv");
        assert!(hdr.is_file());
        assert_eq!(hdr.get("Content-Type"), Some("text/csv"));
    }
}
