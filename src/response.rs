use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

/// Uniform envelope for every JSON response.
///
/// ```json
/// { "success": true, "data": { ... }, "message": "Attempt started" }
/// ```
///
/// Failures carry `success: false`, an empty `data` object and the reason in
/// `message`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T>
where
    T: Serialize,
{
    pub success: bool,
    pub data: T,
    pub message: String,
}

impl<T> ApiResponse<T>
where
    T: Serialize,
{
    pub fn success(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self
    where
        T: Default,
    {
        Self {
            success: false,
            data: T::default(),
            message: message.into(),
        }
    }
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Serialize,
{
    fn into_response(self) -> axum::response::Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// Shorthand for a 200 envelope.
pub fn ok<T: Serialize>(data: T, message: impl Into<String>) -> ApiResponse<T> {
    ApiResponse::success(data, message)
}

/// Empty JSON object used as `data` on error responses.
#[derive(Debug, Default, Serialize)]
pub struct Empty {}
