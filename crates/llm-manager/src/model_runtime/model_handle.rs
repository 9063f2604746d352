//! A loaded model: its backend, tunable parameters and engine.
//!
//! `generate` never fails. Engine errors come back as a canned reply so a
//! conversation always gets an assistant turn.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::backend_kind::BackendKind;
use super::language_filter::enforce_english;
use super::runtime_trait::{CompletionRequest, InferenceEngine, RuntimeMetadata};
use crate::memory::Message;
use crate::metrics;

pub const TEMPERATURE_RANGE: (f64, f64) = (0.0, 2.0);
pub const CONTEXT_WINDOW_RANGE: (i64, i64) = (128, 131_072);
pub const THREADS_RANGE: (i64, i64) = (1, 256);
pub const GPU_LAYERS_RANGE: (i64, i64) = (0, 1000);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub context_window: u32,
    pub n_threads: u32,
    pub n_gpu_layers: u32,
    pub temperature: f32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            context_window: 2048,
            n_threads: 4,
            n_gpu_layers: 0,
            temperature: 0.7,
        }
    }
}

impl ModelParams {
    /// Generation budget derived from the context window.
    pub fn max_tokens(&self) -> u32 {
        self.context_window / 4
    }
}

/// Raw, unvalidated parameter changes as received from a client.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ParameterUpdate {
    pub temperature: Option<Value>,
    pub context_window: Option<Value>,
    pub n_threads: Option<Value>,
    pub n_gpu_layers: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParameterReport {
    pub changes: BTreeMap<String, Value>,
    pub errors: BTreeMap<String, String>,
}

impl ParameterReport {
    fn change(&mut self, field: &str, value: Value) {
        self.changes.insert(field.to_string(), value);
    }

    fn error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.insert(field.to_string(), message.into());
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub model_type: String,
    pub backend: BackendKind,
    pub source: String,
    pub size_mb: f64,
    pub context_window: u32,
    pub n_threads: u32,
    pub n_gpu_layers: u32,
    pub temperature: f32,
    pub runtime: RuntimeMetadata,
}

pub struct ModelHandle {
    pub id: String,
    pub model_type: String,
    pub kind: BackendKind,
    pub source: String,
    params: RwLock<ModelParams>,
    engine: RwLock<Box<dyn InferenceEngine>>,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.id)
            .field("model_type", &self.model_type)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

fn integer_field(value: &Value, (min, max): (i64, i64)) -> Result<i64, String> {
    let n = value
        .as_i64()
        .ok_or_else(|| format!("must be an integer, got {}", value))?;
    if n < min || n > max {
        return Err(format!("must be between {} and {}, got {}", min, max, n));
    }
    Ok(n)
}

fn temperature_field(value: &Value) -> Result<f64, String> {
    let t = value
        .as_f64()
        .ok_or_else(|| format!("must be a number, got {}", value))?;
    let (min, max) = TEMPERATURE_RANGE;
    if !(min..=max).contains(&t) {
        return Err(format!("must be between {:.1} and {:.1}, got {}", min, max, t));
    }
    Ok(t)
}

impl ModelHandle {
    pub fn new(
        id: impl Into<String>,
        model_type: impl Into<String>,
        source: impl Into<String>,
        params: ModelParams,
        engine: Box<dyn InferenceEngine>,
    ) -> Self {
        Self {
            id: id.into(),
            model_type: model_type.into(),
            kind: engine.kind(),
            source: source.into(),
            params: RwLock::new(params),
            engine: RwLock::new(engine),
        }
    }

    pub async fn params(&self) -> ModelParams {
        *self.params.read().await
    }

    pub async fn build_request(&self, history: &[Message]) -> CompletionRequest {
        let params = self.params().await;
        CompletionRequest {
            prompt: self.kind.format_prompt(history),
            max_tokens: params.max_tokens(),
            temperature: params.temperature,
            stop: self.kind.stop_tokens().iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Produces the assistant reply for `history`.
    pub async fn generate(&self, history: &[Message]) -> String {
        let request = self.build_request(history).await;
        debug!(
            "Generating with {} (max_tokens={}, prompt={} chars)",
            self.id,
            request.max_tokens,
            request.prompt.len()
        );

        let started = Instant::now();
        let result = {
            let engine = self.engine.read().await;
            engine.complete(request).await
        };
        metrics::observe_generation(started.elapsed().as_secs_f64());

        match result {
            Ok(text) => enforce_english(text),
            Err(e) => {
                error!("Generation failed for model {}: {:#}", self.id, e);
                format!("I encountered an error processing your request: {}", e)
            }
        }
    }

    /// Weight size in megabytes; 0 when nothing is on local disk.
    pub async fn get_model_size(&self) -> f64 {
        let bytes = self.engine.read().await.size_bytes();
        bytes as f64 / (1024.0 * 1024.0)
    }

    /// Validates and applies each supplied field independently.
    pub async fn modify_parameters(&self, update: &ParameterUpdate) -> ParameterReport {
        let mut report = ParameterReport::default();
        let is_gguf = self.kind == BackendKind::GgufEngine;

        if let Some(value) = &update.temperature {
            match temperature_field(value) {
                Ok(t) => {
                    self.params.write().await.temperature = t as f32;
                    report.change("temperature", Value::from(t));
                }
                Err(e) => report.error("temperature", format!("temperature {}", e)),
            }
        }

        if let Some(value) = &update.context_window {
            match integer_field(value, CONTEXT_WINDOW_RANGE) {
                Ok(n) => {
                    let mut params = self.params.write().await;
                    if is_gguf && n != params.context_window as i64 {
                        report.error(
                            "context_window",
                            "changing context_window for gguf-engine models requires reload",
                        );
                    } else {
                        params.context_window = n as u32;
                        report.change("context_window", Value::from(n));
                    }
                }
                Err(e) => report.error("context_window", format!("context_window {}", e)),
            }
        }

        if let Some(value) = &update.n_threads {
            match integer_field(value, THREADS_RANGE) {
                Ok(_) if !is_gguf => {
                    report.error("n_threads", "n_threads only applies to gguf-engine models")
                }
                Ok(n) => {
                    let current = self.params().await.n_threads;
                    let applied = {
                        let mut engine = self.engine.write().await;
                        if n == current as i64 && !engine.needs_restart() {
                            Ok(())
                        } else {
                            engine.set_threads(n as u32).await
                        }
                    };
                    match applied {
                        Ok(()) => {
                            self.params.write().await.n_threads = n as u32;
                            report.change("n_threads", Value::from(n));
                        }
                        Err(e) => report.error("n_threads", format!("failed to apply n_threads: {}", e)),
                    }
                }
                Err(e) => report.error("n_threads", format!("n_threads {}", e)),
            }
        }

        if let Some(value) = &update.n_gpu_layers {
            match integer_field(value, GPU_LAYERS_RANGE) {
                Ok(n) => {
                    let mut params = self.params.write().await;
                    if is_gguf && n != params.n_gpu_layers as i64 {
                        report.error(
                            "n_gpu_layers",
                            "changing n_gpu_layers for gguf-engine models requires reload",
                        );
                    } else {
                        params.n_gpu_layers = n as u32;
                        report.change("n_gpu_layers", Value::from(n));
                    }
                }
                Err(e) => report.error("n_gpu_layers", format!("n_gpu_layers {}", e)),
            }
        }

        info!(
            "Parameters for {}: {} changed, {} rejected",
            self.id,
            report.changes.len(),
            report.errors.len()
        );
        report
    }

    pub async fn info(&self) -> ModelInfo {
        let params = self.params().await;
        let runtime = self.engine.read().await.metadata();
        ModelInfo {
            id: self.id.clone(),
            model_type: self.model_type.clone(),
            backend: self.kind,
            source: self.source.clone(),
            size_mb: self.get_model_size().await,
            context_window: params.context_window,
            n_threads: params.n_threads,
            n_gpu_layers: params.n_gpu_layers,
            temperature: params.temperature,
            runtime,
        }
    }

    /// Shuts the engine down. Waits for any in-flight generation first.
    pub async fn unload(&self) {
        self.engine.write().await.shutdown().await;
        info!("Model {} unloaded", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_runtime::language_filter::ENGLISH_ONLY_FALLBACK;
    use crate::testing::{EchoEngine, FailingEngine, RecordingEngine, ScriptedEngine};
    use serde_json::json;

    fn handle(engine: Box<dyn InferenceEngine>) -> ModelHandle {
        ModelHandle::new("m", "llama", "m.gguf", ModelParams::default(), engine)
    }

    fn greeting() -> Vec<Message> {
        vec![Message::system("..."), Message::user("Hi")]
    }

    #[tokio::test]
    async fn test_generate_wraps_roles_per_backend() {
        let gguf = handle(Box::new(EchoEngine::new(BackendKind::GgufEngine)));
        let prompt = gguf.generate(&greeting()).await;
        assert!(prompt.starts_with("<|im_start|>system\n...<|im_end|>\n"));
        assert!(prompt.ends_with("<|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\n"));

        let rwkv = handle(Box::new(EchoEngine::new(BackendKind::RecurrentState)));
        let prompt = rwkv.generate(&greeting()).await;
        assert_eq!(prompt, "System: ...\n\nUser: Hi\n\nAssistant:");
    }

    #[tokio::test]
    async fn test_request_uses_quarter_context_budget() {
        let engine = RecordingEngine::new(BackendKind::TransformerPipeline);
        let requests = engine.requests();
        let model = handle(Box::new(engine));

        model.generate(&greeting()).await;

        let sent = requests.lock().unwrap();
        assert_eq!(sent[0].max_tokens, 512);
        assert!((sent[0].temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(sent[0].stop, vec!["<|im_end|>", "<|user|>", "<|system|>"]);
    }

    #[tokio::test]
    async fn test_engine_failure_becomes_reply() {
        let model = handle(Box::new(FailingEngine::new(BackendKind::GgufEngine, "connection refused")));
        let reply = model.generate(&greeting()).await;
        assert_eq!(reply, "I encountered an error processing your request: connection refused");
    }

    #[tokio::test]
    async fn test_non_english_reply_is_replaced() {
        let model = handle(Box::new(ScriptedEngine::new(BackendKind::GgufEngine, "Привет, как дела?")));
        assert_eq!(model.generate(&greeting()).await, ENGLISH_ONLY_FALLBACK);
    }

    #[tokio::test]
    async fn test_model_size_in_megabytes() {
        let model = handle(Box::new(EchoEngine::new(BackendKind::GgufEngine).with_size(3 * 1024 * 1024)));
        assert!((model.get_model_size().await - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_gguf_rejects_gpu_layer_change() {
        let model = handle(Box::new(EchoEngine::new(BackendKind::GgufEngine)));
        let report = model
            .modify_parameters(&ParameterUpdate {
                n_gpu_layers: Some(json!(35)),
                ..Default::default()
            })
            .await;

        assert!(report.changes.is_empty());
        assert!(report.errors["n_gpu_layers"].contains("requires reload"));
        assert_eq!(model.params().await.n_gpu_layers, 0);
    }

    #[tokio::test]
    async fn test_gguf_same_context_window_is_reported_as_change() {
        let model = handle(Box::new(EchoEngine::new(BackendKind::GgufEngine)));
        let report = model
            .modify_parameters(&ParameterUpdate {
                context_window: Some(json!(2048)),
                n_gpu_layers: Some(json!(0)),
                ..Default::default()
            })
            .await;

        assert_eq!(report.changes["context_window"], json!(2048));
        assert_eq!(report.changes["n_gpu_layers"], json!(0));
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_gguf_threads_are_applied_to_engine() {
        let engine = EchoEngine::new(BackendKind::GgufEngine);
        let threads = engine.threads();
        let model = handle(Box::new(engine));

        let report = model
            .modify_parameters(&ParameterUpdate {
                n_threads: Some(json!(8)),
                ..Default::default()
            })
            .await;

        assert_eq!(report.changes["n_threads"], json!(8));
        assert_eq!(threads.load(std::sync::atomic::Ordering::SeqCst), 8);
        assert_eq!(model.params().await.n_threads, 8);
    }

    #[tokio::test]
    async fn test_same_threads_restart_a_stopped_engine() {
        let engine = EchoEngine::new(BackendKind::GgufEngine);
        let threads = engine.threads();
        let stopped = engine.stopped();
        stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        threads.store(0, std::sync::atomic::Ordering::SeqCst);
        let model = handle(Box::new(engine));

        let report = model
            .modify_parameters(&ParameterUpdate {
                n_threads: Some(json!(4)),
                ..Default::default()
            })
            .await;

        assert_eq!(report.changes["n_threads"], json!(4));
        assert!(!stopped.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(threads.load(std::sync::atomic::Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_same_threads_skip_restart_when_running() {
        let engine = EchoEngine::new(BackendKind::GgufEngine);
        let threads = engine.threads();
        threads.store(0, std::sync::atomic::Ordering::SeqCst);
        let model = handle(Box::new(engine));

        model
            .modify_parameters(&ParameterUpdate {
                n_threads: Some(json!(4)),
                ..Default::default()
            })
            .await;

        assert_eq!(threads.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_debug_names_the_model() {
        let model = handle(Box::new(EchoEngine::new(BackendKind::GgufEngine)));
        let shown = format!("{:?}", model);
        assert!(shown.contains("ModelHandle"));
        assert!(shown.contains("\"m\""));
    }

    #[tokio::test]
    async fn test_transformer_applies_context_and_rejects_threads() {
        let model = handle(Box::new(EchoEngine::new(BackendKind::TransformerPipeline)));
        let report = model
            .modify_parameters(&ParameterUpdate {
                context_window: Some(json!(4096)),
                n_threads: Some(json!(8)),
                n_gpu_layers: Some(json!(12)),
                ..Default::default()
            })
            .await;

        assert_eq!(report.changes["context_window"], json!(4096));
        assert_eq!(report.changes["n_gpu_layers"], json!(12));
        assert!(report.errors["n_threads"].contains("only applies to gguf-engine"));

        let params = model.params().await;
        assert_eq!(params.context_window, 4096);
        assert_eq!(params.max_tokens(), 1024);
    }

    #[tokio::test]
    async fn test_invalid_values_are_collected_per_field() {
        let model = handle(Box::new(EchoEngine::new(BackendKind::RecurrentState)));
        let report = model
            .modify_parameters(&ParameterUpdate {
                temperature: Some(json!(3.5)),
                context_window: Some(json!("big")),
                n_gpu_layers: Some(json!(-1)),
                ..Default::default()
            })
            .await;

        assert!(report.changes.is_empty());
        assert_eq!(report.errors.len(), 3);
        assert!(report.errors["temperature"].contains("between 0.0 and 2.0"));
        assert!(report.errors["context_window"].contains("must be an integer"));
        assert!(report.errors["n_gpu_layers"].contains("between 0 and 1000"));
        assert_eq!(model.params().await, ModelParams::default());
    }

    #[tokio::test]
    async fn test_temperature_applies_to_every_backend() {
        for kind in [
            BackendKind::GgufEngine,
            BackendKind::TransformerPipeline,
            BackendKind::RecurrentState,
        ] {
            let model = handle(Box::new(EchoEngine::new(kind)));
            let report = model
                .modify_parameters(&ParameterUpdate {
                    temperature: Some(json!(0)),
                    ..Default::default()
                })
                .await;
            assert_eq!(report.changes["temperature"], json!(0.0));
            assert_eq!(model.params().await.temperature, 0.0);
        }
    }

    #[tokio::test]
    async fn test_info_reports_backend_and_params() {
        let model = handle(Box::new(EchoEngine::new(BackendKind::GgufEngine)));
        let info = serde_json::to_value(model.info().await).unwrap();

        assert_eq!(info["type"], "llama");
        assert_eq!(info["backend"], "gguf-engine");
        assert_eq!(info["context_window"], 2048);
    }
}
