//! Error taxonomy for the manager and its HTTP mapping.
//!
//! Generation failures never show up here: the adapter converts them into a
//! canned reply. Parameter changes report per-field problems in their own
//! result type. What remains are load-time configuration problems, lookups
//! that fail, and dispatch queue failures.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Model '{0}' not found")]
    ModelNotFound(String),

    #[error("Model ID '{0}' already exists")]
    ModelExists(String),

    #[error("Model file not found: {0}")]
    ModelFileNotFound(String),

    #[error("Conversation {0} not found")]
    ConversationNotFound(String),

    #[error("Conversation {0} already exists")]
    ConversationExists(String),

    #[error("{0}")]
    InvalidRequest(String),

    /// Bad model type, path, runtime binary or endpoint.
    #[error("Invalid model configuration: {0}")]
    Config(String),

    #[error("Failed to load model: {0}")]
    Load(String),

    #[error("Failed to download model: {0}")]
    Download(String),

    #[error("Dispatch queue is full")]
    QueueFull,

    #[error("Dispatch queue is closed")]
    QueueClosed,

    #[error("Dispatch queue is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ManagerResult<T> = Result<T, ManagerError>;

impl ManagerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ManagerError::ModelNotFound(_)
            | ManagerError::ModelFileNotFound(_)
            | ManagerError::ConversationNotFound(_) => StatusCode::NOT_FOUND,
            ManagerError::ModelExists(_) | ManagerError::ConversationExists(_) => {
                StatusCode::CONFLICT
            }
            ManagerError::InvalidRequest(_) | ManagerError::Config(_) => StatusCode::BAD_REQUEST,
            ManagerError::QueueFull | ManagerError::QueueClosed | ManagerError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ManagerError::Load(_) | ManagerError::Download(_) | ManagerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ManagerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
