//! HTTP facade over the model store and the dispatch queue

pub mod admin_api;
pub mod chat_api;
pub mod conversation_api;
pub mod model_api;
pub mod stream_api;

pub use admin_api::{get_status, health};
pub use chat_api::chat;
pub use conversation_api::{create_conversation, get_conversation, list_conversations, reset_conversation};
pub use model_api::{add_llm, analyze_model, delete_llm, initialize, list_models, modify_parameters};
pub use stream_api::chat_stream;

use crate::error::ManagerResult;
use crate::metrics;

/// Counts the request under `route` and hands the result back.
pub(crate) fn record<T>(route: &str, result: ManagerResult<T>) -> ManagerResult<T> {
    metrics::inc_request(route, if result.is_ok() { "ok" } else { "error" });
    result
}
