use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transaction {0} not found")]
    TransactionNotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Transactions are only allowed between users from the same school")]
    CrossOrganizationTransaction,

    #[error("Invalid state transition: transaction is {actual}, expected {expected}")]
    InvalidStateTransition { expected: String, actual: String },

    #[error("Invalid handoff code")]
    InvalidHandoffCode,

    #[error("Charge authority error: {0}")]
    ChargeAuthority(String),

    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Store(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::TransactionNotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) => StatusCode::FORBIDDEN,
            AppError::InvalidCredential(_) => StatusCode::UNAUTHORIZED,
            AppError::CrossOrganizationTransaction => StatusCode::FORBIDDEN,
            AppError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            AppError::InvalidHandoffCode => StatusCode::BAD_REQUEST,
            AppError::ChargeAuthority(_) => StatusCode::BAD_GATEWAY,
            AppError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
