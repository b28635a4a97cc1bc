//! HTTP API数据模型

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use moegen_core::api::{ErrorCode, GenError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============= Requests =============

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    #[serde(default)]
    pub sub_task_id: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    #[serde(default)]
    pub sub_task_id: Option<Value>,
    #[serde(default)]
    pub mode: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    #[serde(default)]
    pub keys: Option<Value>,
}

/// Dashboard payloads are loosely typed; only non-empty strings count as ids.
pub fn string_field(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

// ============= Responses =============

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    pub fn ok() -> Json<Self> {
        Json(Self { ok: true })
    }
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub key: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveImageResponse {
    pub saved: bool,
    pub exists: bool,
    pub file_name: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: f64,
    pub requests_handled: u64,
    pub sse_clients: usize,
    pub active_subtasks: usize,
    pub pending_retries: usize,
    pub timestamp: String,
}

// ============= Error Handling =============

#[derive(Debug)]
pub enum HttpServerError {
    Unauthorized,
    InvalidRequest(String),
    Gen(GenError),
    Internal(String),
}

impl From<GenError> for HttpServerError {
    fn from(err: GenError) -> Self {
        Self::Gen(err)
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::InvalidInput | ErrorCode::ConfigError => StatusCode::BAD_REQUEST,
        ErrorCode::StorageError => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::TransportError | ErrorCode::ProtocolError | ErrorCode::ExtractionError => {
            StatusCode::BAD_GATEWAY
        }
        ErrorCode::Cancelled => StatusCode::CONFLICT,
    }
}

impl HttpServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Gen(err) => status_for(err.error_code()),
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HttpServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error_code, message) = match self {
            Self::Unauthorized => ("UNAUTHORIZED", "Unauthorized".to_string()),
            Self::InvalidRequest(msg) => ("INVALID_REQUEST", msg),
            Self::Gen(err) => {
                if status.is_server_error() {
                    tracing::error!(target: "moegen.http", error = %err, "request failed");
                }
                (err.error_code().as_str(), err.to_string())
            }
            Self::Internal(msg) => ("INTERNAL_ERROR", msg),
        };

        let body = serde_json::json!({
            "success": false,
            "error": message,
            "error_code": error_code,
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stop_request_deserialize() {
        let req: StopRequest =
            serde_json::from_value(json!({"subTaskId": "s1", "mode": "abort"})).unwrap();
        assert_eq!(string_field(req.sub_task_id.as_ref()).as_deref(), Some("s1"));
        assert_eq!(req.mode, Some(json!("abort")));
    }

    #[test]
    fn test_string_field_ignores_non_strings() {
        assert_eq!(string_field(Some(&json!(12))), None);
        assert_eq!(string_field(Some(&json!(""))), None);
        assert_eq!(string_field(None), None);
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (GenError::NotFound("task x".into()), StatusCode::NOT_FOUND),
            (GenError::InvalidInput("bad".into()), StatusCode::BAD_REQUEST),
            (GenError::Config("no key".into()), StatusCode::BAD_REQUEST),
            (
                GenError::protocol(Some(429), "rate limited"),
                StatusCode::BAD_GATEWAY,
            ),
            (
                GenError::storage(
                    "/tmp/x",
                    std::io::Error::new(std::io::ErrorKind::Other, "disk"),
                ),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(HttpServerError::from(err).status(), status);
        }
        assert_eq!(
            HttpServerError::Unauthorized.status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
