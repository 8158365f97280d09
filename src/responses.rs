use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

/// Error codes returned to callers, in the callable-function vocabulary.
pub const CODE_INVALID_ARGUMENT: &str = "invalid-argument";
pub const CODE_UNAUTHENTICATED: &str = "unauthenticated";
pub const CODE_NOT_FOUND: &str = "not-found";
pub const CODE_FAILED_PRECONDITION: &str = "failed-precondition";
pub const CODE_RESOURCE_EXHAUSTED: &str = "resource-exhausted";
pub const CODE_INTERNAL: &str = "internal";

#[derive(Serialize, Deserialize)]
pub struct JsonResponse {
    pub status: String,
    pub success: bool,
    pub message: String,
    pub code: Option<String>,
}

impl JsonResponse {
    pub fn success(msg: &str) -> impl IntoResponse {
        (
            StatusCode::OK,
            Json(JsonResponse {
                status: "success".to_string(),
                success: true,
                message: msg.to_string(),
                code: None,
            }),
        )
    }

    pub fn error_with_code(status: StatusCode, msg: &str, code: &str) -> impl IntoResponse {
        (
            status,
            Json(JsonResponse {
                status: "error".to_string(),
                success: false,
                message: msg.to_string(),
                code: Some(code.to_string()),
            }),
        )
    }

    pub fn not_found(msg: &str) -> impl IntoResponse {
        Self::error_with_code(StatusCode::NOT_FOUND, msg, CODE_NOT_FOUND)
    }

    pub fn server_error(msg: &str) -> impl IntoResponse {
        Self::error_with_code(StatusCode::INTERNAL_SERVER_ERROR, msg, CODE_INTERNAL)
    }

    pub fn unauthorized(msg: &str) -> impl IntoResponse {
        Self::error_with_code(StatusCode::UNAUTHORIZED, msg, CODE_UNAUTHENTICATED)
    }

    pub fn bad_request(msg: &str) -> impl IntoResponse {
        Self::error_with_code(StatusCode::BAD_REQUEST, msg, CODE_INVALID_ARGUMENT)
    }

    pub fn failed_precondition(msg: &str) -> impl IntoResponse {
        Self::error_with_code(StatusCode::BAD_REQUEST, msg, CODE_FAILED_PRECONDITION)
    }

    pub fn too_many_requests(msg: &str) -> impl IntoResponse {
        Self::error_with_code(StatusCode::TOO_MANY_REQUESTS, msg, CODE_RESOURCE_EXHAUSTED)
    }
}
