use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use policy_core::error::DiscoveryError;
use serde_json::json;
use tracing::warn;

/// Maps `DiscoveryError` onto HTTP status codes for the RPC surface,
/// mirroring `ferrex-server`'s `errors` module.
pub struct ApiError(pub DiscoveryError);

impl From<DiscoveryError> for ApiError {
    fn from(err: DiscoveryError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, label) = match &self.0 {
            DiscoveryError::TransientIO(_) => (StatusCode::SERVICE_UNAVAILABLE, "transient_io"),
            DiscoveryError::MalformedRecord(_) => (StatusCode::BAD_REQUEST, "malformed_record"),
            DiscoveryError::PolicyConflict(_) => (StatusCode::CONFLICT, "policy_conflict"),
            DiscoveryError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            DiscoveryError::NotOnboarded(_) => (StatusCode::NOT_FOUND, "not_onboarded"),
        };
        warn!(error = %self.0, %label, "request failed");
        (
            status,
            Json(json!({
                "status": "error",
                "error": self.0.to_string(),
                "kind": label,
            })),
        )
            .into_response()
    }
}
