use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use meh_common::envelope::FrameError;
use meh_common::{ControlError, Envelope, MehCode};
use serde::Serialize;
use serde_json::Value;

/// Structured error body returned on the HTTP surface.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub code: MehCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Tagged hub error. Rendered as an HTTP response before the client upgrade
/// and as a `_control` frame after it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct HubError {
    pub code: MehCode,
    pub message: String,
    pub details: Option<Value>,
}

impl HubError {
    pub fn new(code: MehCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_input(message: impl Into<String>) -> Self {
        Self::new(MehCode::BadInput, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(MehCode::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(MehCode::NotFound, message)
    }

    pub fn ws(message: impl Into<String>) -> Self {
        Self::new(MehCode::WsCommunication, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(MehCode::Internal, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn status(&self) -> StatusCode {
        match self.code {
            MehCode::BadInput => StatusCode::BAD_REQUEST,
            MehCode::Unauthorized => StatusCode::UNAUTHORIZED,
            MehCode::NotFound => StatusCode::NOT_FOUND,
            MehCode::WsCommunication | MehCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Encoded `_control` envelope for this error.
    pub fn control_frame(&self) -> Bytes {
        let mut control = ControlError::new(self.code, self.message.clone());
        if let Some(details) = &self.details {
            control = control.with_details(details.clone());
        }
        Envelope::control(&control).encode()
    }

    /// Client disconnects surface as `WSCommunication` constantly, so those
    /// stay at DEBUG.
    pub fn log(&self, session_id: &str) {
        match self.code {
            MehCode::WsCommunication => {
                tracing::debug!(%session_id, error = %self, details = ?self.details, "session error")
            }
            MehCode::Internal => {
                tracing::error!(%session_id, error = %self, details = ?self.details, "session error")
            }
            _ => tracing::info!(%session_id, error = %self, details = ?self.details, "session error"),
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<FrameError> for HubError {
    fn from(err: FrameError) -> Self {
        Self::bad_input("malformed envelope")
            .with_details(serde_json::json!({ "reason": err.to_string() }))
    }
}
