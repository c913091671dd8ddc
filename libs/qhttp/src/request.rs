use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use hyper::header::{HeaderMap, CONTENT_TYPE};
use hyper::Method;

/// A parsed incoming request as seen by the handlers.
///
/// The target path has been percent-decoded and normalized, path captures
/// from the route pattern are in `params`, and the query string is parsed
/// into `query`. For handlers registered with a buffered body the `body`
/// holds the complete payload; streaming handlers receive the raw
/// `hyper::Body` instead and `body` stays empty.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub version: String,
    pub params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub remote_addr: SocketAddr,
    pub body: Bytes,
}

impl Request {
    /// Case-insensitive header lookup; empty string when absent.
    pub fn header(&self, name: &str) -> String {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned()
    }

    pub fn content_type(&self) -> String {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned()
    }

    /// Parse a query string into a map. Parameter values are
    /// percent-decoded; parameters without '=' map to an empty string.
    pub fn parse_query(query: &str) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for pair in query.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = match pair.split_once('=') {
                Some((k, v)) => (k, v),
                None => (pair, ""),
            };
            let key = urlencoding::decode(key).map(|s| s.into_owned());
            let value = urlencoding::decode(value).map(|s| s.into_owned());
            if let (Ok(key), Ok(value)) = (key, value) {
                map.insert(key, value);
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing() {
        let query = Request::parse_query("a=1&b=two%20words&flag&empty=");
        assert_eq!(query["a"], "1");
        assert_eq!(query["b"], "two words");
        assert_eq!(query["flag"], "");
        assert_eq!(query["empty"], "");
        assert!(Request::parse_query("").is_empty());
    }
}
