//! Recurrent-state runtime
//!
//! Client for an RWKV runner exposing an OpenAI-style `/v1/completions`
//! endpoint. The weight file itself stays on local disk for sizing.

use async_trait::async_trait;
use super::backend_kind::BackendKind;
use super::runtime_trait::*;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

pub struct RecurrentRuntime {
    http_client: reqwest::Client,
    base_url: String,
    weights: PathBuf,
    model_name: String,
}

impl RecurrentRuntime {
    pub async fn connect(endpoint: &str, weights: PathBuf, generate_timeout: Duration) -> anyhow::Result<Self> {
        let model_name = weights
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("rwkv")
            .to_string();
        let runtime = Self {
            http_client: reqwest::Client::builder()
                .timeout(generate_timeout)
                .build()
                .unwrap_or_default(),
            base_url: endpoint.trim_end_matches('/').to_string(),
            weights,
            model_name,
        };

        let resp = runtime.http_client
            .get(format!("{}/v1/models", runtime.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("RWKV runner at {} is unreachable: {}", runtime.base_url, e))?;
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!("RWKV runner health check returned: {}", resp.status()));
        }

        info!("RWKV runner ready at {} for {}", runtime.base_url, runtime.model_name);
        Ok(runtime)
    }
}

#[async_trait]
impl InferenceEngine for RecurrentRuntime {
    fn kind(&self) -> BackendKind {
        BackendKind::RecurrentState
    }

    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String> {
        let payload = serde_json::json!({
            "model": self.model_name,
            "prompt": request.prompt,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stop": request.stop,
        });

        let resp = self.http_client
            .post(format!("{}/v1/completions", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Inference request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Inference failed ({}): {}", status, body));
        }

        let response: serde_json::Value = resp.json().await
            .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

        response["choices"][0]["text"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("RWKV response has no choices[0].text"))
    }

    fn size_bytes(&self) -> u64 {
        std::fs::metadata(&self.weights).map(|m| m.len()).unwrap_or(0)
    }

    async fn shutdown(&mut self) {
        info!("Releasing RWKV runner client for {}", self.model_name);
    }

    fn metadata(&self) -> RuntimeMetadata {
        RuntimeMetadata {
            kind: BackendKind::RecurrentState,
            runtime_name: "RWKV runner".to_string(),
            base_url: self.base_url.clone(),
            supports_gpu: false,
        }
    }
}
