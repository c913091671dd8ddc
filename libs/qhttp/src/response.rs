use bytes::Bytes;
use futures::stream::BoxStream;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Body, StatusCode};

/// The payload of a [`Response`].
pub enum ResponseBody {
    Empty,
    Bytes(Bytes),
    /// A streamed body. `content_length` is set when the total size is
    /// known up front (e.g. a staged export file).
    Stream {
        content_length: Option<u64>,
        stream: BoxStream<'static, std::io::Result<Bytes>>,
    },
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Empty => write!(f, "Empty"),
            ResponseBody::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            ResponseBody::Stream { content_length, .. } => {
                write!(f, "Stream(content_length={content_length:?})")
            }
        }
    }
}

/// A handler's response: status, headers and body.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
        }
    }

    /// An empty 200 response with the default content type.
    pub fn ok() -> Self {
        Self::new(StatusCode::OK).with_content_type("text/html")
    }

    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        Self::new(status)
            .with_body(Bytes::from(value.to_string()))
            .with_content_type("application/json")
    }

    pub fn text(status: StatusCode, content: impl Into<Bytes>, content_type: &str) -> Self {
        Self::new(status)
            .with_body(content.into())
            .with_content_type(content_type)
    }

    /// The pre-shipped HTML error body mentioning the status code.
    pub fn error_html(status: StatusCode, msg: &str) -> Self {
        let content = format!(
            "<!DOCTYPE html><html><head><title>Error</title></head><body><h1>Code: {}</h1><p>{}</p></body></html>",
            status.as_u16(),
            msg
        );
        Self::text(status, content, "text/html")
    }

    pub fn stream(
        status: StatusCode,
        content_type: &str,
        content_length: Option<u64>,
        stream: BoxStream<'static, std::io::Result<Bytes>>,
    ) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: ResponseBody::Stream {
                content_length,
                stream,
            },
        }
        .with_content_type(content_type)
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            self.headers.insert(CONTENT_TYPE, value);
        }
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = ResponseBody::Bytes(body);
        self
    }

    /// Lower into the hyper response sent on the wire.
    pub(crate) fn into_hyper(self) -> hyper::Response<Body> {
        let mut builder = hyper::Response::builder().status(self.status);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(self.headers);
        }
        let response = match self.body {
            ResponseBody::Empty => builder
                .header(CONTENT_LENGTH, 0)
                .body(Body::empty()),
            ResponseBody::Bytes(bytes) => builder
                .header(CONTENT_LENGTH, bytes.len())
                .body(Body::from(bytes)),
            ResponseBody::Stream {
                content_length,
                stream,
            } => {
                if let Some(len) = content_length {
                    builder = builder.header(CONTENT_LENGTH, len);
                }
                builder.body(Body::wrap_stream(stream))
            }
        };
        // The builder only fails on malformed parts which are all
        // validated above.
        response.unwrap_or_else(|_| hyper::Response::new(Body::empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_mentions_the_code() {
        let response = Response::error_html(StatusCode::NOT_FOUND, "no such table");
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        match &response.body {
            ResponseBody::Bytes(bytes) => {
                let content = String::from_utf8_lossy(bytes);
                assert!(content.contains("Code: 404"));
                assert!(content.contains("no such table"));
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn empty_response_has_zero_content_length() {
        let response = Response::ok().into_hyper();
        assert_eq!(response.headers()[CONTENT_LENGTH], "0");
        assert_eq!(response.headers()[CONTENT_TYPE], "text/html");
    }
}
