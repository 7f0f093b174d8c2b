use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IssuerError>;

#[derive(Error, Debug)]
pub enum IssuerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown batch: {0}")]
    UnknownBatch(String),

    #[error("Batch {0} was already submitted with different tokens")]
    BatchConflict(String),

    #[error("Unknown public key")]
    UnknownPublicKey,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Token already spent")]
    TokenAlreadySpent,

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for IssuerError {
    fn into_response(self) -> Response {
        let status = match &self {
            IssuerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            IssuerError::UnknownBatch(_) => StatusCode::NOT_FOUND,
            IssuerError::BatchConflict(_) => StatusCode::CONFLICT,
            IssuerError::UnknownPublicKey => StatusCode::BAD_REQUEST,
            IssuerError::InvalidSignature => StatusCode::UNAUTHORIZED,
            IssuerError::TokenAlreadySpent => StatusCode::CONFLICT,
            IssuerError::Crypto(_) => StatusCode::INTERNAL_SERVER_ERROR,
            IssuerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}
