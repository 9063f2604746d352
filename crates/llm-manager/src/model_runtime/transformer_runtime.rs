//! Transformer pipeline runtime
//!
//! Client for a Hugging Face text-generation server (`/generate` contract).
//! The model source is either a hub id or a local directory of weights.

use async_trait::async_trait;
use super::backend_kind::BackendKind;
use super::runtime_trait::*;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const WEIGHT_EXTENSIONS: &[&str] = &["safetensors", "bin", "pt", "pth"];

pub struct TransformerRuntime {
    http_client: reqwest::Client,
    base_url: String,
    source: PathBuf,
}

impl TransformerRuntime {
    /// Connects to the pipeline server and checks that it is up.
    pub async fn connect(endpoint: &str, source: PathBuf, generate_timeout: Duration) -> anyhow::Result<Self> {
        let runtime = Self {
            http_client: reqwest::Client::builder()
                .timeout(generate_timeout)
                .build()
                .unwrap_or_default(),
            base_url: endpoint.trim_end_matches('/').to_string(),
            source,
        };

        let resp = runtime.http_client
            .get(format!("{}/health", runtime.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Transformer pipeline at {} is unreachable: {}", runtime.base_url, e))?;
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!(
                "Transformer pipeline health check returned: {}",
                resp.status()
            ));
        }

        info!("Transformer pipeline ready at {} for {}", runtime.base_url, runtime.source.display());
        Ok(runtime)
    }

    fn payload(request: &CompletionRequest) -> serde_json::Value {
        let mut parameters = serde_json::json!({
            "max_new_tokens": request.max_tokens,
            "stop": request.stop,
            "return_full_text": false,
        });
        // Greedy decoding when temperature is zero; the server rejects 0.0.
        if request.temperature > 0.0 {
            parameters["do_sample"] = serde_json::Value::Bool(true);
            parameters["temperature"] = serde_json::json!(request.temperature);
        } else {
            parameters["do_sample"] = serde_json::Value::Bool(false);
        }

        serde_json::json!({
            "inputs": request.prompt,
            "parameters": parameters,
        })
    }
}

/// Total size of weight files under `dir`, recursing into subdirectories.
fn weight_bytes(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                return weight_bytes(&path);
            }
            let is_weight = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| WEIGHT_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                .unwrap_or(false);
            if is_weight {
                entry.metadata().map(|m| m.len()).unwrap_or(0)
            } else {
                0
            }
        })
        .sum()
}

#[async_trait]
impl InferenceEngine for TransformerRuntime {
    fn kind(&self) -> BackendKind {
        BackendKind::TransformerPipeline
    }

    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String> {
        let resp = self.http_client
            .post(format!("{}/generate", self.base_url))
            .json(&Self::payload(&request))
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

        // Some pipeline servers wrap the result in a one-element array.
        let result = match &response {
            serde_json::Value::Array(items) => items.first().unwrap_or(&serde_json::Value::Null),
            other => other,
        };
        result["generated_text"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("pipeline response has no generated_text"))
    }

    fn size_bytes(&self) -> u64 {
        if self.source.is_dir() {
            weight_bytes(&self.source)
        } else {
            0
        }
    }

    async fn shutdown(&mut self) {
        info!("Releasing transformer pipeline client for {}", self.source.display());
    }

    fn metadata(&self) -> RuntimeMetadata {
        RuntimeMetadata {
            kind: BackendKind::TransformerPipeline,
            runtime_name: "text-generation pipeline".to_string(),
            base_url: self.base_url.clone(),
            supports_gpu: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn request(temperature: f32) -> CompletionRequest {
        CompletionRequest {
            prompt: "<|user|>\nHi\n<|assistant|>\n".to_string(),
            max_tokens: 256,
            temperature,
            stop: vec!["<|user|>".to_string()],
        }
    }

    #[test]
    fn test_zero_temperature_disables_sampling() {
        let payload = TransformerRuntime::payload(&request(0.0));
        assert_eq!(payload["parameters"]["do_sample"], false);
        assert!(payload["parameters"].get("temperature").is_none());

        let payload = TransformerRuntime::payload(&request(0.7));
        assert_eq!(payload["parameters"]["do_sample"], true);
        assert_eq!(payload["parameters"]["return_full_text"], false);
    }

    #[tokio::test]
    async fn test_generate_roundtrip() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/health").with_status(200).create_async().await;
        let generate = server
            .mock("POST", "/generate")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "inputs": "<|user|>\nHi\n<|assistant|>\n",
                "parameters": {"max_new_tokens": 256},
            })))
            .with_status(200)
            .with_body(r#"{"generated_text":"Hello!"}"#)
            .create_async()
            .await;

        let runtime = TransformerRuntime::connect(&server.url(), PathBuf::from("microsoft/phi-2"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(runtime.complete(request(0.7)).await.unwrap(), "Hello!");
        generate.assert_async().await;
    }

    #[tokio::test]
    async fn test_array_response_is_accepted() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/health").with_status(200).create_async().await;
        server
            .mock("POST", "/generate")
            .with_status(200)
            .with_body(r#"[{"generated_text":"Hi"}]"#)
            .create_async()
            .await;

        let runtime = TransformerRuntime::connect(&server.url(), PathBuf::from("phi"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(runtime.complete(request(0.0)).await.unwrap(), "Hi");
    }

    #[test]
    fn test_weight_bytes_counts_only_weights() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.safetensors"), vec![0u8; 1000]).unwrap();
        std::fs::write(dir.path().join("config.json"), b"{}").unwrap();
        std::fs::create_dir(dir.path().join("shards")).unwrap();
        std::fs::write(dir.path().join("shards").join("part-1.bin"), vec![0u8; 24]).unwrap();

        assert_eq!(weight_bytes(dir.path()), 1024);
        assert_eq!(weight_bytes(Path::new("/no/such/dir")), 0);
    }
}
