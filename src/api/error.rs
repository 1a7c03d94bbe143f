use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) => StatusCode::from_u16(*status_code).unwrap_or(StatusCode::BAD_GATEWAY),
            ApiError::Docker(_) => StatusCode::BAD_GATEWAY,
        };

        if status.is_server_error() {
            log::error!("{self}");
        }

        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Map the Docker daemon's 404 onto a NotFound for `name`, leaving every
/// other error untouched.
pub fn not_found(err: bollard::errors::Error, name: &str) -> ApiError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => ApiError::NotFound(name.to_string()),
        e => ApiError::Docker(e),
    }
}
