use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::backend_kind::BackendKind;

/// One prompt-in, text-out call against an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stop: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeMetadata {
    pub kind: BackendKind,
    pub runtime_name: String,
    /// Empty for engines that are not reachable over HTTP.
    pub base_url: String,
    pub supports_gpu: bool,
}

/// An inference engine bound to exactly one loaded model.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Runs the completion and returns the raw generated text.
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String>;

    /// Bytes of model weights backing this engine.
    fn size_bytes(&self) -> u64;

    /// Changes the CPU thread count. Engines that fix it at load time
    /// return an error.
    async fn set_threads(&mut self, _threads: u32) -> anyhow::Result<()> {
        Err(anyhow::anyhow!(
            "changing threads for {} at runtime is not supported",
            self.kind()
        ))
    }

    /// True when the engine owns a server that is not running, so a
    /// restart is due even without a parameter change.
    fn needs_restart(&self) -> bool {
        false
    }

    /// Releases the engine. Safe to call more than once.
    async fn shutdown(&mut self);

    fn metadata(&self) -> RuntimeMetadata;
}
