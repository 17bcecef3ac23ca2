use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation failed")]
    Validation { details: Vec<String> },
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("rate limited")]
    RateLimited { retry_after_secs: u64 },
    #[error("invalid state transition: {0}")]
    InvalidState(String),
    #[error("too many points requested")]
    TooManyPoints { bucket_count: usize, ceiling: usize },
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error code advertised both on REST (`{error, message}`) and on frame `error`
/// envelopes (`code`), per the §7 error-kind list.
impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Db(_) => "INTERNAL",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::Forbidden => "FORBIDDEN",
            AppError::NotFound => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Validation { .. } => "VALIDATION",
            AppError::MalformedFrame(_) => "MALFORMED",
            AppError::RateLimited { .. } => "RATE_LIMITED",
            AppError::InvalidState(_) => "INVALID_STATE",
            AppError::TooManyPoints { .. } => "TOO_MANY_POINTS",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Db(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::MalformedFrame(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::InvalidState(_) => StatusCode::CONFLICT,
            AppError::TooManyPoints { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    details: Vec<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if !matches!(self, AppError::Validation { .. }) {
            tracing::error!(code = self.code(), error = %self, "request failed");
        }
        let status = self.status();
        let details = match &self {
            AppError::Validation { details } => details.clone(),
            _ => Vec::new(),
        };
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
            details,
        };
        let mut response = (status, Json(body)).into_response();
        if let AppError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = axum::http::HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

/// Encodes an `AppError` as the `error` frame described in §4.1/§7.
pub fn frame_error_payload(err: &AppError) -> serde_json::Value {
    let details = match err {
        AppError::Validation { details } => details.clone(),
        _ => Vec::new(),
    };
    json!({ "code": err.code(), "message": err.to_string(), "details": details })
}

pub type AppResult<T> = Result<T, AppError>;
