// LLM Studio / crates/llm-manager/src/lib.rs

pub mod api;
pub mod config;
pub mod download;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod model_runtime;
pub mod server;
pub mod shared_state;
pub mod telemetry;
pub mod worker_threads;

#[cfg(test)]
pub(crate) mod testing;

// Public API exports
pub use config::Config;
pub use error::{ManagerError, ManagerResult};
pub use memory::{Conversation, Message, Role};
pub use model_runtime::{BackendKind, ModelHandle, ModelSpec};
pub use server::{build_router, run_server};
pub use shared_state::{AppState, ModelStore};
pub use worker_threads::DispatchQueue;
