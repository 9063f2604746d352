//! Runtime Manager
//!
//! Turns a model declaration into a ready `ModelHandle`: resolves the
//! backend, picks the engine, and waits for it to come up. Nothing is
//! registered here; the caller inserts the handle once it is ready.

use super::backend_kind::BackendKind;
use super::format_detector::FormatDetector;
use super::gguf_runtime::{GGUFRuntime, GgufLaunchConfig};
use super::model_handle::{ModelHandle, ModelParams};
use super::recurrent_runtime::RecurrentRuntime;
use super::runtime_trait::InferenceEngine;
use super::transformer_runtime::TransformerRuntime;
use crate::config::Config;
use crate::error::{ManagerError, ManagerResult};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use validator::Validate;

const PORT_SCAN_LIMIT: u16 = 100;

fn default_model_type() -> String {
    "llama".to_string()
}

/// Declaration of one model, as found in `/api/initialize` bodies and the
/// startup models file.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ModelSpec {
    #[validate(length(min = 1, max = 128))]
    pub id: String,
    #[serde(rename = "type", default = "default_model_type")]
    pub model_type: String,
    #[validate(length(min = 1))]
    pub path: String,
    /// Existing inference server to use instead of spawning one.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    #[validate(range(min = 128, max = 131072))]
    pub context_window: Option<u32>,
    #[serde(default)]
    #[validate(range(min = 1, max = 256))]
    pub n_threads: Option<u32>,
    #[serde(default)]
    #[validate(range(min = 0, max = 1000))]
    pub n_gpu_layers: Option<u32>,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ModelsFile {
    #[serde(default)]
    models: Vec<ModelSpec>,
}

/// Reads `{"models": [...]}` from disk.
pub fn read_models_file(path: &Path) -> anyhow::Result<Vec<ModelSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read models config {}", path.display()))?;
    let file: ModelsFile = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid models config {}", path.display()))?;
    Ok(file.models)
}

pub struct RuntimeManager {
    config: Arc<Config>,
    next_port: AtomicU16,
}

impl RuntimeManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            next_port: AtomicU16::new(config.llama_base_port),
            config,
        }
    }

    pub fn params_for(&self, spec: &ModelSpec) -> ModelParams {
        ModelParams {
            context_window: spec.context_window.unwrap_or(self.config.default_context_window),
            n_threads: spec.n_threads.unwrap_or(self.config.default_threads),
            n_gpu_layers: spec.n_gpu_layers.unwrap_or(self.config.default_gpu_layers),
            temperature: spec.temperature.unwrap_or(self.config.default_temperature),
        }
    }

    /// Reserves the next bindable port for a spawned llama-server.
    fn allocate_port(&self) -> ManagerResult<u16> {
        for _ in 0..PORT_SCAN_LIMIT {
            let candidate = self.next_port.fetch_add(1, Ordering::SeqCst);
            if TcpListener::bind((self.config.llama_host.as_str(), candidate)).is_ok() {
                return Ok(candidate);
            }
        }
        Err(ManagerError::Load(format!(
            "no free port for llama-server near {}",
            self.config.llama_base_port
        )))
    }

    /// Builds and starts the engine for `spec`.
    pub async fn load(&self, spec: &ModelSpec) -> ManagerResult<ModelHandle> {
        spec.validate()
            .map_err(|e| ManagerError::InvalidRequest(format!("Invalid model spec '{}': {}", spec.id, e)))?;

        let kind = BackendKind::resolve(&spec.model_type, &spec.path)?;
        let params = self.params_for(spec);
        let resolved = self.config.resolve_model_path(&spec.path);
        let generate_timeout = Duration::from_secs(self.config.generate_timeout_seconds);

        info!("Loading model {} ({}) as {}", spec.id, spec.model_type, kind);

        let (engine, source): (Box<dyn InferenceEngine>, String) = match kind {
            BackendKind::GgufEngine => {
                if let Some(endpoint) = &spec.endpoint {
                    let runtime = GGUFRuntime::attach(endpoint, resolved.clone(), generate_timeout)
                        .await
                        .map_err(|e| ManagerError::Load(format!("{:#}", e)))?;
                    (Box::new(runtime), resolved.display().to_string())
                } else {
                    if !resolved.exists() {
                        return Err(ManagerError::Config(format!(
                            "Model file not found: {}",
                            resolved.display()
                        )));
                    }
                    let has_magic = FormatDetector::has_gguf_magic(&resolved)
                        .with_context(|| format!("Failed to read {}", resolved.display()))?;
                    if !has_magic {
                        return Err(ManagerError::Config(format!(
                            "{} is not a valid GGUF file (missing GGUF magic)",
                            resolved.display()
                        )));
                    }
                    let binary = self.config.llama_bin.clone().ok_or_else(|| {
                        ManagerError::Config(
                            "LLAMA_BIN is not set; cannot start llama-server for GGUF models".to_string(),
                        )
                    })?;

                    let launch = GgufLaunchConfig {
                        binary,
                        model_path: resolved.clone(),
                        host: self.config.llama_host.clone(),
                        port: self.allocate_port()?,
                        context_window: params.context_window,
                        threads: params.n_threads,
                        gpu_layers: params.n_gpu_layers,
                        health_timeout: Duration::from_secs(self.config.health_timeout_seconds),
                        generate_timeout,
                    };
                    let runtime = GGUFRuntime::launch(launch).await.map_err(|e| {
                        error!("Failed to start llama-server for {}: {:#}", spec.id, e);
                        ManagerError::Load(format!("{:#}", e))
                    })?;
                    (Box::new(runtime), resolved.display().to_string())
                }
            }
            BackendKind::TransformerPipeline => {
                let endpoint = self.require_endpoint(spec, kind)?;
                // Hub ids are kept as given; local directories are resolved.
                let source = if resolved.exists() {
                    resolved.clone()
                } else {
                    spec.path.clone().into()
                };
                let runtime = TransformerRuntime::connect(endpoint, source.clone(), generate_timeout)
                    .await
                    .map_err(|e| ManagerError::Load(format!("{:#}", e)))?;
                (Box::new(runtime), source.display().to_string())
            }
            BackendKind::RecurrentState => {
                let endpoint = self.require_endpoint(spec, kind)?;
                let runtime = RecurrentRuntime::connect(endpoint, resolved.clone(), generate_timeout)
                    .await
                    .map_err(|e| ManagerError::Load(format!("{:#}", e)))?;
                (Box::new(runtime), resolved.display().to_string())
            }
        };

        info!("Model {} ready ({})", spec.id, engine.metadata().runtime_name);
        Ok(ModelHandle::new(spec.id.clone(), spec.model_type.clone(), source, params, engine))
    }

    fn require_endpoint<'a>(&self, spec: &'a ModelSpec, kind: BackendKind) -> ManagerResult<&'a str> {
        spec.endpoint.as_deref().ok_or_else(|| {
            ManagerError::Config(format!(
                "Model '{}' uses the {} backend and needs an endpoint",
                spec.id, kind
            ))
        })
    }
}
