use serde_json::{json, Value};

/// The current version of the REST API. Services advertise it through
/// `GET /meta/version` and validate it against the `version` attribute
/// of incoming requests.
pub const VERSION: u32 = 53;

/// The payload of the service identity endpoint, wrapped into the
/// canonical response envelope.
pub fn version_payload(service_name: &str, info: Value) -> Value {
    let mut payload = match info {
        Value::Object(obj) => Value::Object(obj),
        _ => json!({}),
    };
    payload["name"] = json!(service_name);
    payload["version"] = json!(VERSION);
    payload["success"] = json!(1);
    payload["error"] = json!("");
    payload["error_ext"] = json!({});
    payload["warning"] = json!("");
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_identity_and_version() {
        let payload = version_payload(
            "CZAR-FRONTEND",
            json!({"kind": "czar-query-frontend", "instance_id": "qserv-prod"}),
        );
        assert_eq!(payload["name"], "CZAR-FRONTEND");
        assert_eq!(payload["version"], VERSION);
        assert_eq!(payload["kind"], "czar-query-frontend");
        assert_eq!(payload["success"], 1);
        assert_eq!(payload["error"], "");
    }
}
