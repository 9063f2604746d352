//! Streaming chat endpoint
//!
//! The turn runs through the dispatch queue like a blocking chat. Once the
//! reply is recorded it goes out as SSE `data:` events of
//! `{"content": ...}`, one per word, followed by `[DONE]`.

use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use std::convert::Infallible;
use std::time::Duration;
use tracing::debug;

use super::chat_api::ChatRequest;
use super::record;
use crate::shared_state::AppState;

pub const DONE_MARKER: &str = "[DONE]";

/// Splits a reply into word chunks that concatenate back to the input.
pub fn chunk_response(text: &str) -> Vec<String> {
    text.split_inclusive(char::is_whitespace)
        .map(str::to_string)
        .collect()
}

pub async fn chat_stream(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Response {
    let result = match req.validate() {
        Ok(()) => state.dispatch.stream_message(&req.conversation_id, &req.message).await,
        Err(e) => Err(e),
    };
    let reply = match record("chat_stream", result) {
        Ok(reply) => reply,
        Err(e) => return e.into_response(),
    };

    let chunks = chunk_response(&reply);
    debug!("Streaming {} chunk(s) for {}", chunks.len(), req.conversation_id);

    let output_stream = async_stream::stream! {
        for chunk in chunks {
            let data = serde_json::json!({ "content": chunk }).to_string();
            yield Ok::<_, Infallible>(Event::default().data(data));
        }
        yield Ok(Event::default().data(DONE_MARKER));
    };

    Sse::new(output_stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}
