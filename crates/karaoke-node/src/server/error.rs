//! HTTP rendering of node errors.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use karaoke_core::wire::ErrorBody;

use crate::error::NodeError;
use crate::remote::RemoteError;

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::Validation(e) => (
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::BAD_REQUEST),
                ErrorBody::validation(*e),
            ),
            Self::Remote(RemoteError::Network(msg)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody::new("network_unavailable", msg.clone()),
            ),
            Self::Remote(e) => (StatusCode::BAD_GATEWAY, ErrorBody::new("remote_error", e.to_string())),
            Self::SizeMismatch { .. } => {
                (StatusCode::BAD_GATEWAY, ErrorBody::new("remote_error", self.to_string()))
            }
            Self::InvalidCode(_) => (StatusCode::BAD_REQUEST, ErrorBody::new("invalid_code", self.to_string())),
            Self::Storage(_) | Self::Io(_) | Self::Config(_) => {
                error!(error = %self, "Local failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody::new("local_store", self.to_string()),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
