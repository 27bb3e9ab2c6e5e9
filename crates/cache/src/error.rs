use odata_trait::{ErrorDetail, ODataError, Response};
use serde_json::Value;

pub type Result<T> = std::result::Result<T, ODataError>;

fn string_field(value: &Value, name: &str) -> Option<String> {
    value.get(name).and_then(Value::as_str).map(str::to_string)
}

/// Converts a non-2xx response into the error its waiters receive
pub fn error_from_response(response: &Response) -> ODataError {
    let Some(error) = response.body.get("error") else {
        return ODataError::transport(
            Some(response.status),
            format!("HTTP status {}", response.status),
        );
    };

    let details = error
        .get("details")
        .and_then(Value::as_array)
        .map(|details| {
            details
                .iter()
                .map(|detail| ErrorDetail {
                    code: string_field(detail, "code").unwrap_or_default(),
                    message: string_field(detail, "message").unwrap_or_default(),
                    target: string_field(detail, "target").filter(|t| !t.is_empty()),
                })
                .collect()
        })
        .unwrap_or_default();

    ODataError::Domain {
        status: response.status,
        code: string_field(error, "code").unwrap_or_default(),
        message: string_field(error, "message")
            .unwrap_or_else(|| format!("HTTP status {}", response.status)),
        target: string_field(error, "target").filter(|t| !t.is_empty()),
        details,
    }
}

/// Maps a transport result to the per-request outcome
pub fn check_response(response: Response) -> Result<Response> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(error_from_response(&response))
    }
}
