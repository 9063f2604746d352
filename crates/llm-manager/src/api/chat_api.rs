//! Blocking chat endpoint

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use super::record;
use crate::error::{ManagerError, ManagerResult};
use crate::shared_state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub conversation_id: String,
    pub message: String,
}

impl ChatRequest {
    pub(crate) fn validate(&self) -> ManagerResult<()> {
        if self.conversation_id.trim().is_empty() {
            return Err(ManagerError::InvalidRequest("conversation_id is required".to_string()));
        }
        if self.message.trim().is_empty() {
            return Err(ManagerError::InvalidRequest("message is required".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub conversation_id: String,
    pub response: String,
}

/// Queues one turn and answers once the model has replied.
pub async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ManagerError> {
    let result = match req.validate() {
        Ok(()) => state.dispatch.send_message(&req.conversation_id, &req.message).await,
        Err(e) => Err(e),
    };
    let response = record("chat", result)?;

    Ok(Json(ChatResponse {
        conversation_id: req.conversation_id,
        response,
    }))
}
