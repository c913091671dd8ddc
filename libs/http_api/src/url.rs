use std::fmt;

use crate::error::Error;

/// A validated `http://` location of a remote resource.
///
/// The core client does not speak TLS, so every other scheme is rejected
/// at parse time. The port defaults to 80 when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    inner: url::Url,
}

impl Url {
    pub fn parse(input: &str) -> Result<Self, Error> {
        let inner = url::Url::parse(input)
            .map_err(|e| Error::InvalidArgument(format!("invalid url '{input}': {e}")))?;
        if inner.scheme() != "http" {
            return Err(Error::InvalidArgument(format!(
                "unsupported scheme '{}' in url '{input}', only 'http' is supported",
                inner.scheme()
            )));
        }
        if inner.host_str().unwrap_or_default().is_empty() {
            return Err(Error::InvalidArgument(format!(
                "no host in url '{input}'"
            )));
        }
        Ok(Self { inner })
    }

    pub fn host(&self) -> &str {
        self.inner.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.inner.port().unwrap_or(80)
    }

    /// The request target: the path plus the optional query string.
    pub fn target(&self) -> String {
        match self.inner.query() {
            Some(query) => format!("{}?{}", self.inner.path(), query),
            None => self.inner.path().to_owned(),
        }
    }

    pub fn as_str(&self) -> &str {
        self.inner.as_str()
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.inner.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port_target() {
        let url = Url::parse("http://qserv-worker-0:25004/ingest/csv?version=53").unwrap();
        assert_eq!(url.host(), "qserv-worker-0");
        assert_eq!(url.port(), 25004);
        assert_eq!(url.target(), "/ingest/csv?version=53");
    }

    #[test]
    fn port_defaults_to_80() {
        let url = Url::parse("http://controller/replication/config").unwrap();
        assert_eq!(url.port(), 80);
        assert_eq!(url.target(), "/replication/config");
    }

    #[test]
    fn non_http_schemes_are_rejected() {
        assert!(Url::parse("https://secure.example.com/").is_err());
        assert!(Url::parse("file:///etc/passwd").is_err());
        assert!(Url::parse("not a url").is_err());
    }
}
