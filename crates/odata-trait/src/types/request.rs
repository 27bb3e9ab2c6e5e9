//! Requests handed to a transport and the responses it returns

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

pub const HEADER_IF_MATCH: &str = "If-Match";
pub const HEADER_ETAG: &str = "ETag";
pub const HEADER_SAP_MESSAGES: &str = "sap-messages";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl Method {
    /// Writes go into change-sets, reads do not
    pub fn is_modifying(self) -> bool {
        !matches!(self, Method::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// One request inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: Method,
    /// Relative to the service root, e.g. `SalesOrderList('42')?$select=Note`
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    /// 1-based change-set number; `None` for requests outside any change-set
    pub change_set: Option<u32>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl Response {
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn created(body: Value) -> Self {
        Self {
            status: 201,
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn no_content() -> Self {
        Self {
            status: 204,
            headers: BTreeMap::new(),
            body: Value::Null,
        }
    }

    /// Response carrying an OData `error` object
    pub fn error(status: u16, code: &str, message: &str) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: serde_json::json!({ "error": { "code": code, "message": message } }),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Headers are matched case-insensitively, as HTTP requires
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// ETag from the payload annotation, falling back to the `ETag` header
    pub fn etag(&self) -> Option<String> {
        self.body
            .get("@odata.etag")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.header(HEADER_ETAG).map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_etag_sources() {
        let from_body = Response::ok(json!({"@odata.etag": "W/\"1\"", "Note": "a"}));
        assert_eq!(from_body.etag().as_deref(), Some("W/\"1\""));

        let from_header = Response::no_content().with_header("etag", "W/\"2\"");
        assert_eq!(from_header.etag().as_deref(), Some("W/\"2\""));
        assert!(from_header.is_success());
    }

    #[test]
    fn test_error_response() {
        let response = Response::error(400, "CODE", "Value -1 not allowed");
        assert!(!response.is_success());
        assert_eq!(response.body["error"]["message"], "Value -1 not allowed");
    }
}
