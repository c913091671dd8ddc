//! HTTP plumbing shared by the control-plane services: the request
//! primitives, the one-shot async client, the per-request module framework
//! with authorization and API versioning, and the retained
//! worker-management request objects.

pub mod async_req;
pub mod auth;
pub mod binary_encoding;
pub mod error;
pub mod file_upload;
pub mod meta;
pub mod method;
pub mod mgmt;
pub mod module;
pub mod request_body;
pub mod url;

pub use crate::url::Url;
pub use auth::{AuthContext, AuthType};
pub use binary_encoding::BinaryEncodingMode;
pub use error::Error;
pub use method::Method;
