//! HTTP mapping for core errors.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::kernel::errors::{CoreError, ErrorKind};

/// Wrapper giving [`CoreError`] an HTTP rendering.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        Self(error)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        Self(CoreError::internal(error.to_string()))
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::LaneSaturated => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::NotOwner => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::ToolInvalidArguments
        | ErrorKind::ToolBudgetExceeded
        | ErrorKind::GatewayFailure
        | ErrorKind::Transient
        | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind;
        let body = Json(serde_json::json!({
            "error": kind.as_str(),
            "message": self.0.message,
        }));
        let mut response = (status_for(kind), body).into_response();
        if kind == ErrorKind::LaneSaturated {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
        }
        response
    }
}
