//! Backend classification
//!
//! Every loaded model is served by one of three engine families. The family
//! decides the prompt template and the stop sequences handed to the engine.

use serde::{Deserialize, Serialize};

use crate::error::ManagerError;
use crate::memory::{Message, Role};

const CHAT_STOPS: &[&str] = &["<|im_end|>", "<|user|>", "<|system|>"];
const TRANSCRIPT_STOPS: &[&str] = &["User:", "System:", "Assistant:"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Quantized GGUF weights served by llama.cpp.
    GgufEngine,
    /// Hugging Face transformer text-generation pipeline.
    TransformerPipeline,
    /// RWKV recurrent-state model.
    RecurrentState,
}

impl BackendKind {
    /// Model types accepted by the load endpoints, as shown to clients.
    pub fn supported_types() -> &'static [&'static str] {
        &[
            "llama (for llama.cpp compatible GGUF files)",
            "phi2 (for Phi-2 models)",
            "rwkv (for RWKV models)",
        ]
    }

    /// Picks the backend for a declared model type and path. A `.gguf` file
    /// always goes to llama.cpp, whatever type was declared.
    pub fn resolve(model_type: &str, path: &str) -> Result<Self, ManagerError> {
        let model_type = model_type.trim().to_lowercase();
        if path.to_lowercase().ends_with(".gguf") {
            return Ok(BackendKind::GgufEngine);
        }

        match model_type.as_str() {
            "phi2" | "transformer" | "transformer-pipeline" => Ok(BackendKind::TransformerPipeline),
            "rwkv" | "recurrent" | "recurrent-state" => Ok(BackendKind::RecurrentState),
            "llama" | "gguf" | "gguf-engine" => Err(ManagerError::Config(format!(
                "Non-GGUF files for model type {} are not supported",
                model_type
            ))),
            other => Err(ManagerError::Config(format!(
                "Unknown model type '{}'. Supported types: {}",
                other,
                Self::supported_types().join(", ")
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::GgufEngine => "gguf-engine",
            BackendKind::TransformerPipeline => "transformer-pipeline",
            BackendKind::RecurrentState => "recurrent-state",
        }
    }

    pub fn stop_tokens(&self) -> &'static [&'static str] {
        match self {
            BackendKind::GgufEngine | BackendKind::TransformerPipeline => CHAT_STOPS,
            BackendKind::RecurrentState => TRANSCRIPT_STOPS,
        }
    }

    /// Renders the history in this backend's template and leaves an open
    /// assistant turn at the end.
    pub fn format_prompt(&self, history: &[Message]) -> String {
        let mut prompt = String::new();
        match self {
            BackendKind::GgufEngine => {
                for msg in history {
                    prompt.push_str("<|im_start|>");
                    prompt.push_str(msg.role.as_str());
                    prompt.push('\n');
                    prompt.push_str(&msg.content);
                    prompt.push_str("<|im_end|>\n");
                }
                prompt.push_str("<|im_start|>assistant\n");
            }
            BackendKind::TransformerPipeline => {
                for msg in history {
                    prompt.push_str("<|");
                    prompt.push_str(msg.role.as_str());
                    prompt.push_str("|>\n");
                    prompt.push_str(&msg.content);
                    prompt.push('\n');
                }
                prompt.push_str("<|assistant|>\n");
            }
            BackendKind::RecurrentState => {
                for msg in history {
                    let speaker = match msg.role {
                        Role::System => "System",
                        Role::User => "User",
                        Role::Assistant => "Assistant",
                    };
                    prompt.push_str(speaker);
                    prompt.push_str(": ");
                    prompt.push_str(&msg.content);
                    prompt.push_str("\n\n");
                }
                prompt.push_str("Assistant:");
            }
        }
        prompt
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
