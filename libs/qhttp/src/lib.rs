//! An embedded HTTP/1.1 server for the control-plane services.
//!
//! The crate wraps hyper with the routing, static-content, long-poll and
//! multipart-decomposition facilities the catalog services need. Handlers
//! receive a fully parsed [`Request`] (path captures, query parameters,
//! optionally buffered body) and return a [`Response`].

pub mod ajax;
pub mod multipart;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
mod static_content;

pub use ajax::AjaxEndpoint;
pub use request::Request;
pub use response::{Response, ResponseBody};
pub use server::{Server, ServerConfig};

/// Errors surfaced by the server machinery itself (listener setup,
/// lifecycle misuse). Handler-level failures are expressed as HTTP
/// responses instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid server state: {0}")]
    State(String),

    #[error("invalid route pattern '{0}'")]
    Pattern(String),
}
