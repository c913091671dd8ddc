use serde::{Deserialize, Serialize};

/// Authorization requirements of a request-processing module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    /// Open access.
    None,
    /// `Authorization: Basic ...` with the configured user and password.
    Basic,
    /// `auth_key` (or the elevating `admin_auth_key`) in the request body.
    Required,
}

/// The process-wide authorization material: login credentials for
/// basic-auth endpoints and the two body keys for the ingest protocol.
/// Initialized once at startup and read freely thereafter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthContext {
    pub user: String,
    pub password: String,
    pub auth_key: String,
    pub admin_auth_key: String,
}
