use serde_json::{Map, Value};

use crate::error::Error;

/// Parameters of a request extracted from its JSON body.
///
/// Parameters routed in from multipart parts arrive as strings, so the
/// numeric accessors accept both JSON numbers and their decimal string
/// forms.
#[derive(Debug, Clone, Default)]
pub struct RequestBody {
    obj: Map<String, Value>,
}

impl RequestBody {
    pub fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::Object(obj) => Ok(Self { obj }),
            Value::Null => Ok(Self::default()),
            other => Err(Error::InvalidArgument(format!(
                "request body is not a JSON object: {other}"
            ))),
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        if data.is_empty() {
            return Ok(Self::default());
        }
        let value: Value = serde_json::from_slice(data)
            .map_err(|e| Error::InvalidArgument(format!("failed to parse the request body: {e}")))?;
        Self::from_value(value)
    }

    pub fn has(&self, name: &str) -> bool {
        self.obj.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.obj.get(name)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.obj.insert(name.to_owned(), value);
    }

    pub fn as_object(&self) -> &Map<String, Value> {
        &self.obj
    }

    pub fn required_str(&self, name: &str) -> Result<String, Error> {
        match self.obj.get(name) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(Error::InvalidArgument(format!(
                "parameter '{name}' is not a string: {other}"
            ))),
            None => Err(Error::InvalidArgument(format!(
                "required parameter '{name}' is missing in the request body"
            ))),
        }
    }

    pub fn optional_str(&self, name: &str, default: &str) -> Result<String, Error> {
        if self.has(name) {
            self.required_str(name)
        } else {
            Ok(default.to_owned())
        }
    }

    pub fn required_u64(&self, name: &str) -> Result<u64, Error> {
        let invalid = |value: &Value| {
            Error::InvalidArgument(format!(
                "parameter '{name}' is not an unsigned number: {value}"
            ))
        };
        match self.obj.get(name) {
            Some(value @ Value::Number(n)) => n.as_u64().ok_or_else(|| invalid(value)),
            Some(value @ Value::String(s)) => s.parse().map_err(|_| invalid(value)),
            Some(other) => Err(invalid(other)),
            None => Err(Error::InvalidArgument(format!(
                "required parameter '{name}' is missing in the request body"
            ))),
        }
    }

    pub fn optional_u64(&self, name: &str, default: u64) -> Result<u64, Error> {
        if self.has(name) {
            self.required_u64(name)
        } else {
            Ok(default)
        }
    }

    pub fn required_u32(&self, name: &str) -> Result<u32, Error> {
        let value = self.required_u64(name)?;
        u32::try_from(value)
            .map_err(|_| Error::InvalidArgument(format!("parameter '{name}'={value} is out of range")))
    }

    pub fn optional_u32(&self, name: &str, default: u32) -> Result<u32, Error> {
        if self.has(name) {
            self.required_u32(name)
        } else {
            Ok(default)
        }
    }

    /// Flags travel as 0/1 numbers or their string forms.
    pub fn required_bool(&self, name: &str) -> Result<bool, Error> {
        match self.obj.get(name) {
            Some(Value::Bool(b)) => Ok(*b),
            _ => Ok(self.required_u64(name)? != 0),
        }
    }

    pub fn optional_bool(&self, name: &str, default: bool) -> Result<bool, Error> {
        if self.has(name) {
            self.required_bool(name)
        } else {
            Ok(default)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(json: &str) -> RequestBody {
        RequestBody::from_slice(json.as_bytes()).unwrap()
    }

    #[test]
    fn accessors_handle_numbers_and_numeric_strings() {
        let body = body(r#"{"transaction_id": 5, "chunk": "7", "overlap": "0", "table": "t"}"#);
        assert_eq!(body.required_u32("transaction_id").unwrap(), 5);
        assert_eq!(body.required_u32("chunk").unwrap(), 7);
        assert!(!body.required_bool("overlap").unwrap());
        assert_eq!(body.required_str("table").unwrap(), "t");
        assert_eq!(body.optional_u64("missing", 42).unwrap(), 42);
        assert!(body.required_u64("missing").is_err());
        assert!(body.required_str("transaction_id").is_err());
    }

    #[test]
    fn empty_and_non_object_bodies() {
        assert!(!RequestBody::from_slice(b"").unwrap().has("x"));
        assert!(RequestBody::from_slice(b"[1,2]").is_err());
        assert!(RequestBody::from_slice(b"{invalid").is_err());
    }
}
