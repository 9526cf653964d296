use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::error::ApiError;

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub code: &'static str,
    pub message: String,
}

pub fn map_error(err: &ApiError) -> (StatusCode, Json<ErrorEnvelope>) {
    let status = match err {
        ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        ApiError::GraphNotFound(_) => StatusCode::NOT_FOUND,
        ApiError::SessionBusy { .. } => StatusCode::CONFLICT,
        ApiError::Capacity { .. } => StatusCode::CONFLICT,
        ApiError::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ApiError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ApiError::WorkerDead(_) => StatusCode::SERVICE_UNAVAILABLE,
        ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorEnvelope {
            code: err.code(),
            message: err.to_string(),
        }),
    )
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, ApiError::Internal(_)) {
            let correlation = ulid::Ulid::new().to_string().to_lowercase();
            tracing::error!(correlation_id = %correlation, error = %self, "internal error");
        }
        map_error(&self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn status_codes_follow_the_external_contract() {
        assert_eq!(
            map_error(&ApiError::BadRequest("x".into())).0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            map_error(&ApiError::SessionNotFound("x".into())).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            map_error(&ApiError::SessionBusy {
                session_id: "x".into(),
                state: "busy",
            })
            .0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            map_error(&ApiError::EngineUnavailable("x".into())).0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            map_error(&ApiError::Timeout {
                limit: Duration::from_secs(1),
            })
            .0,
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
