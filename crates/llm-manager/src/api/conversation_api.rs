//! API endpoints for conversation management

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::record;
use crate::error::ManagerError;
use crate::memory::Message;
use crate::shared_state::{AppState, ConversationSummary};

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub model_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConversationDetailResponse {
    pub conversation_id: String,
    pub model_id: String,
    pub history: Vec<Message>,
}

pub async fn list_conversations(
    State(state): State<AppState>,
) -> Json<BTreeMap<String, ConversationSummary>> {
    crate::metrics::inc_request("list_conversations", "ok");
    Json(state.store.list_conversations())
}

pub async fn create_conversation(
    State(state): State<AppState>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<Value>, ManagerError> {
    let conversation_id = record(
        "create_conversation",
        state
            .store
            .create_conversation(&req.model_id, req.conversation_id.as_deref()),
    )?;

    Ok(Json(json!({
        "conversation_id": conversation_id,
        "model_id": req.model_id,
    })))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<ConversationDetailResponse>, ManagerError> {
    let detail = state.store.conversation_summary(&conversation_id).and_then(|summary| {
        Ok(ConversationDetailResponse {
            history: state.store.conversation_history(&conversation_id)?,
            model_id: summary.model_id,
            conversation_id: conversation_id.clone(),
        })
    });

    Ok(Json(record("get_conversation", detail)?))
}

pub async fn reset_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Value>, ManagerError> {
    record(
        "reset_conversation",
        state.dispatch.reset_conversation(&conversation_id).await,
    )?;

    Ok(Json(json!({
        "success": true,
        "conversation_id": conversation_id,
    })))
}
