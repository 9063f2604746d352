//! Model runtime layer
//!
//! Normalizes three inference backends behind one `generate(history)` call:
//! - GGUF weights served by a spawned llama-server per model
//! - transformer pipelines behind a text-generation server
//! - RWKV models behind an OpenAI-style completions runner
//!
//! Each engine is an HTTP client of a local inference server; the backend
//! kind decides prompt template, stop tokens and which parameters can change
//! without a reload.
pub mod backend_kind;
pub mod format_detector;
pub mod gguf_runtime;
pub mod language_filter;
pub mod model_handle;
pub mod recurrent_runtime;
pub mod runtime_manager;
pub mod runtime_trait;
pub mod transformer_runtime;

pub use backend_kind::BackendKind;
pub use format_detector::{FormatDetector, GgufAnalysis};
pub use gguf_runtime::GGUFRuntime;
pub use model_handle::{ModelHandle, ModelInfo, ModelParams, ParameterReport, ParameterUpdate};
pub use recurrent_runtime::RecurrentRuntime;
pub use runtime_manager::{ModelSpec, RuntimeManager};
pub use runtime_trait::{CompletionRequest, InferenceEngine, RuntimeMetadata};
pub use transformer_runtime::TransformerRuntime;
