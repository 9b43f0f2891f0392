use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::lxc::LxcError;
use crate::registry::{AttachError, DetachError};

/// Structured error type for all control-plane handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 400 - Unit name failed validation.
    InvalidName(String),
    /// 400 - Malformed or invalid request body.
    InvalidRequest(String),
    /// 404 - The unit has no attached session.
    NotAttached(String),
    /// 409 - The unit already has a session (or one is being set up).
    AlreadyAttached(String),
    /// 503 - Every port in the session range is bound.
    PortsExhausted { start: u16, end: u16 },
    /// 503 - The service is draining sessions for shutdown.
    ShuttingDown,
    /// 500 - Spawning the attach process or its listener failed.
    AttachFailed(String),
    /// 500 - An `lxc-*` tool could not run or exited non-zero.
    CommandFailed(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidName(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotAttached(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyAttached(_) => StatusCode::CONFLICT,
            ApiError::PortsExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::AttachFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::CommandFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidName(_) => "invalid_name",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::NotAttached(_) => "not_attached",
            ApiError::AlreadyAttached(_) => "already_attached",
            ApiError::PortsExhausted { .. } => "ports_exhausted",
            ApiError::ShuttingDown => "shutting_down",
            ApiError::AttachFailed(_) => "attach_failed",
            ApiError::CommandFailed(_) => "command_failed",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::InvalidName(detail) => format!("Invalid container name: {}.", detail),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::NotAttached(name) => format!("Container is not attached: {}.", name),
            ApiError::AlreadyAttached(name) => {
                format!("Container is already attached: {}.", name)
            }
            ApiError::PortsExhausted { start, end } => {
                format!("No free session port in {}-{}. Detach a container and retry.", start, end)
            }
            ApiError::ShuttingDown => "Server is shutting down.".to_string(),
            ApiError::AttachFailed(detail) => format!("Failed to attach: {}.", detail),
            ApiError::CommandFailed(detail) => format!("Command failed: {}.", detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<AttachError> for ApiError {
    fn from(e: AttachError) -> Self {
        match e {
            AttachError::InvalidName(detail) => ApiError::InvalidName(detail),
            AttachError::AlreadyAttached(name) => ApiError::AlreadyAttached(name),
            AttachError::Exhausted(crate::port_pool::PoolError::Exhausted { start, end }) => {
                ApiError::PortsExhausted { start, end }
            }
            AttachError::Open(e) => ApiError::AttachFailed(e.to_string()),
            AttachError::ShuttingDown => ApiError::ShuttingDown,
            AttachError::Task(e) => ApiError::AttachFailed(e.to_string()),
        }
    }
}

impl From<DetachError> for ApiError {
    fn from(e: DetachError) -> Self {
        match e {
            DetachError::NotFound(name) => ApiError::NotAttached(name),
        }
    }
}

impl From<LxcError> for ApiError {
    fn from(e: LxcError) -> Self {
        ApiError::CommandFailed(e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::InvalidRequest(e.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;

    /// Helper: convert an ApiError into a response and extract the status and
    /// parsed JSON body.
    async fn response_parts(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let body = Body::new(response.into_body())
            .collect()
            .await
            .unwrap()
            .to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        (status, json)
    }

    #[tokio::test]
    async fn already_attached_is_conflict() {
        let (status, json) = response_parts(ApiError::AlreadyAttached("web".into())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"]["code"], "already_attached");
        assert!(json["error"]["message"].as_str().unwrap().contains("web"));
    }

    #[tokio::test]
    async fn not_attached_is_404() {
        let (status, json) = response_parts(ApiError::NotAttached("db".into())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "not_attached");
    }

    #[tokio::test]
    async fn exhaustion_is_503_with_range() {
        let (status, json) =
            response_parts(ApiError::PortsExhausted { start: 8001, end: 8999 }).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"]["code"], "ports_exhausted");
        assert!(json["error"]["message"].as_str().unwrap().contains("8001-8999"));
    }

    #[tokio::test]
    async fn invalid_name_is_400() {
        let (status, json) = response_parts(ApiError::InvalidName("bad".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "invalid_name");
    }

    #[tokio::test]
    async fn command_failed_is_500() {
        let (status, json) = response_parts(ApiError::CommandFailed("boom".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"]["code"], "command_failed");
    }

    #[tokio::test]
    async fn body_has_only_error_envelope() {
        let (_, json) = response_parts(ApiError::ShuttingDown).await;
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        let inner = obj["error"].as_object().unwrap();
        assert!(inner.contains_key("code"));
        assert!(inner.contains_key("message"));
    }

    #[test]
    fn attach_errors_map_to_api_errors() {
        let err: ApiError = AttachError::Exhausted(crate::port_pool::PoolError::Exhausted {
            start: 1,
            end: 2,
        })
        .into();
        assert_eq!(err.code(), "ports_exhausted");

        let err: ApiError = AttachError::AlreadyAttached("x".into()).into();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);

        let err: ApiError = AttachError::ShuttingDown.into();
        assert_eq!(err.code(), "shutting_down");
    }

    #[test]
    fn detach_not_found_maps_to_not_attached() {
        let err: ApiError = DetachError::NotFound("gone".into()).into();
        assert_eq!(err.code(), "not_attached");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
