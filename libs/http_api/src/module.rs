//! The per-request handler framework.
//!
//! Every server endpoint is implemented as a short-lived module: the
//! framework parses the JSON body, enforces authorization, runs the
//! module, and renders the canonical response envelope
//! `{success, error, error_ext, warning, ...}`. All outcomes, including
//! failures, are reported with HTTP 200; the envelope carries the verdict.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;

use hyper::{HeaderMap, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use crate::auth::{AuthContext, AuthType};
use crate::error::Error;
use crate::meta;
use crate::request_body::RequestBody;

/// Parsed request state shared with the module implementation.
pub struct RequestContext {
    pub method: hyper::Method,
    pub params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub remote_addr: SocketAddr,
    pub body: RequestBody,
    warnings: Vec<String>,
    is_admin: bool,
}

impl RequestContext {
    /// Parse the buffered request. GET requests carry no JSON body.
    pub fn from_request(req: &qhttp::Request) -> Result<Self, Error> {
        let body = if req.method == hyper::Method::GET {
            RequestBody::default()
        } else {
            RequestBody::from_slice(&req.body)?
        };
        Ok(Self {
            method: req.method.clone(),
            params: req.params.clone(),
            query: req.query.clone(),
            headers: req.headers.clone(),
            remote_addr: req.remote_addr,
            body,
            warnings: Vec::new(),
            is_admin: false,
        })
    }

    /// A captured path parameter.
    pub fn param(&self, name: &str) -> Result<&str, Error> {
        self.params
            .get(name)
            .map(|s| s.as_str())
            .ok_or_else(|| Error::InvalidArgument(format!("the required '{name}' parameter is missing")))
    }

    pub fn query_str(&self, name: &str, default: &str) -> String {
        self.query.get(name).cloned().unwrap_or_else(|| default.to_owned())
    }

    pub fn query_u64(&self, name: &str) -> Result<Option<u64>, Error> {
        match self.query.get(name) {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| {
                Error::InvalidArgument(format!(
                    "the '{name}' query parameter is not a valid unsigned integer: '{value}'"
                ))
            }),
        }
    }

    pub fn query_flag(&self, name: &str, default: bool) -> Result<bool, Error> {
        Ok(self.query_u64(name)?.map(|v| v != 0).unwrap_or(default))
    }

    /// Record a warning to be returned in the response envelope.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Privilege level granted by `admin_auth_key`.
    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    /// Validate the API version number of the request.
    ///
    /// The `version` attribute is looked up in the query string of GET
    /// requests and in the body otherwise. Its absence is noted in the
    /// response warning; a value outside `[min_version, current]` fails
    /// the request with the valid range in `error_ext`.
    pub fn check_api_version(&mut self, func: &str, min_version: u32) -> Result<(), Error> {
        let version = if self.method == hyper::Method::GET {
            self.query.get("version").map(|v| {
                v.parse::<u64>().map_err(|_| {
                    Error::InvalidArgument(format!("the 'version' attribute is not a number: '{v}'"))
                })
            })
        } else if self.body.has("version") {
            Some(self.body.required_u64("version"))
        } else {
            None
        };
        let Some(version) = version else {
            self.warn(format!(
                "No version number was provided in the request. Assuming the latest version: {}",
                meta::VERSION
            ));
            return Ok(());
        };
        let version = version?;
        if version < min_version as u64 || version > meta::VERSION as u64 {
            return Err(Error::http_ext(
                func,
                format!(
                    "the requested version {version} is not in the supported range [{min_version},{}]",
                    meta::VERSION
                ),
                json!({"min_version": min_version, "max_version": meta::VERSION}),
            ));
        }
        Ok(())
    }

    /// Enforce the module's authorization requirements.
    ///
    /// `Required` inspects the body: a matching `admin_auth_key` elevates
    /// the request, otherwise a matching `auth_key` is mandatory. No
    /// secret is ever echoed back.
    pub fn enforce_authorization(
        &mut self,
        auth: &AuthContext,
        auth_type: AuthType,
    ) -> Result<(), Error> {
        match auth_type {
            AuthType::None => Ok(()),
            AuthType::Basic => self.enforce_basic_authorization(auth),
            AuthType::Required => self.enforce_key_authorization(auth),
        }
    }

    fn enforce_basic_authorization(&self, auth: &AuthContext) -> Result<(), Error> {
        let header = self
            .headers
            .get(hyper::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Auth("the Authorization header is missing".to_owned()))?;
        let encoded = header
            .strip_prefix("Basic ")
            .ok_or_else(|| Error::Auth("unsupported authorization scheme".to_owned()))?;
        let decoded = base64::decode(encoded.trim())
            .map_err(|_| Error::Auth("malformed authorization credentials".to_owned()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| Error::Auth("malformed authorization credentials".to_owned()))?;
        let (user, password) = decoded
            .split_once(':')
            .ok_or_else(|| Error::Auth("malformed authorization credentials".to_owned()))?;
        if user != auth.user || password != auth.password {
            return Err(Error::Auth("invalid login credentials".to_owned()));
        }
        Ok(())
    }

    fn enforce_key_authorization(&mut self, auth: &AuthContext) -> Result<(), Error> {
        if self.body.has("admin_auth_key") {
            let admin_auth_key = self.body.required_str("admin_auth_key")?;
            if admin_auth_key != auth.admin_auth_key {
                return Err(Error::Auth(
                    "administrator's authorization key doesn't match".to_owned(),
                ));
            }
            self.is_admin = true;
            return Ok(());
        }
        if !self.body.has("auth_key") {
            return Err(Error::Auth(
                "authorization key is missing in the request body".to_owned(),
            ));
        }
        let auth_key = self.body.required_str("auth_key")?;
        if auth_key != auth.auth_key {
            return Err(Error::Auth("authorization key doesn't match".to_owned()));
        }
        Ok(())
    }
}

/// A request-processing module. The returned object becomes the payload
/// of the success envelope.
pub trait Module: Send {
    /// The context string for diagnostic printouts.
    fn context(&self) -> String;

    fn execute(
        &mut self,
        ctx: &mut RequestContext,
    ) -> impl Future<Output = Result<Value, Error>> + Send;
}

/// Run a module against a buffered request and render the envelope.
pub async fn execute_module<M: Module>(
    module: &mut M,
    auth: &AuthContext,
    auth_type: AuthType,
    req: qhttp::Request,
) -> qhttp::Response {
    let mut ctx = match RequestContext::from_request(&req) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&[], &e),
    };
    if let Err(e) = ctx.enforce_authorization(auth, auth_type) {
        debug!("{} authorization failed: {e}", module.context());
        return error_response(ctx.warnings(), &e);
    }
    match module.execute(&mut ctx).await {
        Ok(data) => data_response(&ctx, data),
        Err(e) => {
            debug!("{} failed: {e}", module.context());
            error_response(ctx.warnings(), &e)
        }
    }
}

/// The canonical success envelope wrapping the module's result object.
pub fn data_response(ctx: &RequestContext, data: Value) -> qhttp::Response {
    let mut result = match data {
        Value::Object(obj) => Value::Object(obj),
        Value::Null => json!({}),
        other => json!({ "data": other }),
    };
    result["success"] = json!(1);
    result["error"] = json!("");
    result["error_ext"] = json!({});
    result["warning"] = json!(ctx.warnings().join("; "));
    qhttp::Response::json(StatusCode::OK, &result)
}

/// The canonical failure envelope. Failures of the module logic are
/// reported with HTTP 200; the envelope carries the verdict.
pub fn error_response(warnings: &[String], error: &Error) -> qhttp::Response {
    let result = json!({
        "success": 0,
        "error": error.to_string(),
        "error_ext": error.error_ext(),
        "warning": warnings.join("; "),
    });
    qhttp::Response::json(StatusCode::OK, &result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn make_request(method: hyper::Method, body: &str) -> qhttp::Request {
        qhttp::Request {
            method,
            path: "/test".to_owned(),
            version: "HTTP/1.1".to_owned(),
            params: HashMap::new(),
            query: HashMap::new(),
            headers: HeaderMap::new(),
            remote_addr: "127.0.0.1:0".parse().unwrap(),
            body: Bytes::from(body.to_owned()),
        }
    }

    fn auth() -> AuthContext {
        AuthContext {
            user: "qserv".to_owned(),
            password: "changeme".to_owned(),
            auth_key: "secret".to_owned(),
            admin_auth_key: "admin-secret".to_owned(),
        }
    }

    #[test]
    fn key_authorization_paths() {
        let auth = auth();

        let req = make_request(hyper::Method::POST, r#"{"auth_key":"secret"}"#);
        let mut ctx = RequestContext::from_request(&req).unwrap();
        ctx.enforce_authorization(&auth, AuthType::Required).unwrap();
        assert!(!ctx.is_admin());

        let req = make_request(hyper::Method::POST, r#"{"admin_auth_key":"admin-secret"}"#);
        let mut ctx = RequestContext::from_request(&req).unwrap();
        ctx.enforce_authorization(&auth, AuthType::Required).unwrap();
        assert!(ctx.is_admin());

        // An admin key (even a wrong one) supersedes a valid auth_key.
        let req = make_request(
            hyper::Method::POST,
            r#"{"auth_key":"secret","admin_auth_key":"wrong"}"#,
        );
        let mut ctx = RequestContext::from_request(&req).unwrap();
        let err = ctx
            .enforce_authorization(&auth, AuthType::Required)
            .unwrap_err();
        assert!(!err.to_string().contains("admin-secret"), "no secret leaks");

        let req = make_request(hyper::Method::POST, r#"{}"#);
        let mut ctx = RequestContext::from_request(&req).unwrap();
        assert!(ctx.enforce_authorization(&auth, AuthType::Required).is_err());
    }

    #[test]
    fn basic_authorization() {
        let auth = auth();
        let req = make_request(hyper::Method::GET, "");
        let mut ctx = RequestContext::from_request(&req).unwrap();
        assert!(ctx.enforce_authorization(&auth, AuthType::Basic).is_err());

        let mut ctx = RequestContext::from_request(&req).unwrap();
        ctx.headers.insert(
            hyper::header::AUTHORIZATION,
            format!("Basic {}", base64::encode("qserv:changeme"))
                .parse()
                .unwrap(),
        );
        ctx.enforce_authorization(&auth, AuthType::Basic).unwrap();

        ctx.headers.insert(
            hyper::header::AUTHORIZATION,
            format!("Basic {}", base64::encode("qserv:wrong"))
                .parse()
                .unwrap(),
        );
        assert!(ctx.enforce_authorization(&auth, AuthType::Basic).is_err());
    }

    #[test]
    fn api_version_checks() {
        let req = make_request(hyper::Method::POST, r#"{"version": 12}"#);
        let mut ctx = RequestContext::from_request(&req).unwrap();
        ctx.check_api_version("test", 10).unwrap();
        assert!(ctx.warnings().is_empty());

        let err = ctx.check_api_version("test", 20).unwrap_err();
        assert_eq!(err.error_ext()["min_version"], 20);
        assert_eq!(err.error_ext()["max_version"], meta::VERSION);

        // Absence of the attribute produces a warning, not an error.
        let req = make_request(hyper::Method::POST, r#"{}"#);
        let mut ctx = RequestContext::from_request(&req).unwrap();
        ctx.check_api_version("test", 10).unwrap();
        assert_eq!(ctx.warnings().len(), 1);
    }

    #[test]
    fn envelopes() {
        let req = make_request(hyper::Method::POST, r#"{}"#);
        let mut ctx = RequestContext::from_request(&req).unwrap();
        ctx.warn("watch out");
        let response = data_response(&ctx, json!({"queryId": 7}));
        assert_eq!(response.status, StatusCode::OK);

        let error = Error::http_ext("f", "bad", json!({"k": "v"}));
        let response = error_response(&["w1".to_owned(), "w2".to_owned()], &error);
        assert_eq!(response.status, StatusCode::OK);
    }
}
