//! GGUF Runtime Adapter
//!
//! Wraps llama-server (llama.cpp) for GGUF models. One server process is
//! spawned per model and driven through its `/completion` endpoint.

use async_trait::async_trait;
use super::backend_kind::BackendKind;
use super::runtime_trait::*;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tokio::time::sleep;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct GgufLaunchConfig {
    pub binary: PathBuf,
    pub model_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub context_window: u32,
    pub threads: u32,
    pub gpu_layers: u32,
    pub health_timeout: Duration,
    pub generate_timeout: Duration,
}

pub struct GGUFRuntime {
    /// `None` when attached to a server this process does not own.
    launch: Option<GgufLaunchConfig>,
    server_process: Option<Child>,
    http_client: reqwest::Client,
    base_url: String,
    model_path: PathBuf,
}

impl GGUFRuntime {
    fn client(generate_timeout: Duration) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(generate_timeout)
            .build()
            .unwrap_or_default()
    }

    /// Spawns a llama-server for the model and waits until it reports healthy.
    pub async fn launch(config: GgufLaunchConfig) -> anyhow::Result<Self> {
        if !config.model_path.exists() {
            return Err(anyhow::anyhow!(
                "Model file not found: {}",
                config.model_path.display()
            ));
        }

        let mut runtime = Self {
            http_client: Self::client(config.generate_timeout),
            base_url: format!("http://{}:{}", config.host, config.port),
            model_path: config.model_path.clone(),
            server_process: None,
            launch: Some(config),
        };
        runtime.start_server().await?;
        Ok(runtime)
    }

    /// Uses an already running llama-server at `base_url`.
    pub async fn attach(
        base_url: &str,
        model_path: PathBuf,
        generate_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let runtime = Self {
            launch: None,
            server_process: None,
            http_client: Self::client(generate_timeout),
            base_url: base_url.trim_end_matches('/').to_string(),
            model_path,
        };
        runtime.health_check().await?;
        info!("Attached to llama-server at {}", runtime.base_url);
        Ok(runtime)
    }

    async fn start_server(&mut self) -> anyhow::Result<()> {
        let config = self
            .launch
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llama-server is not owned by this runtime"))?;

        if !config.binary.exists() {
            return Err(anyhow::anyhow!(
                "llama-server binary not found at: {}",
                config.binary.display()
            ));
        }

        info!("Starting llama-server for GGUF model: {}", config.model_path.display());
        info!("  Port: {}", config.port);
        info!("  Context Size: {}", config.context_window);
        info!("  Threads: {}", config.threads);
        info!("  GPU Layers: {}", config.gpu_layers);

        let mut cmd = Command::new(&config.binary);
        cmd.arg("--model").arg(&config.model_path)
            .arg("--host").arg(&config.host)
            .arg("--port").arg(config.port.to_string())
            .arg("--ctx-size").arg(config.context_window.to_string())
            .arg("--threads").arg(config.threads.to_string())
            .arg("--n-gpu-layers").arg(config.gpu_layers.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        let child = cmd.spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn llama-server: {}", e))?;
        self.server_process = Some(child);

        let started = Instant::now();
        let deadline = started + config.health_timeout;
        loop {
            sleep(HEALTH_POLL_INTERVAL).await;

            if let Some(child) = self.server_process.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    self.server_process = None;
                    return Err(anyhow::anyhow!("llama-server exited during startup ({})", status));
                }
            }

            if self.health_check().await.is_ok() {
                info!(
                    "GGUF runtime ready after {:.1}s at {}",
                    started.elapsed().as_secs_f64(),
                    self.base_url
                );
                return Ok(());
            }

            if Instant::now() >= deadline {
                self.stop_server();
                return Err(anyhow::anyhow!(
                    "llama-server failed to become healthy within {}s",
                    config.health_timeout.as_secs()
                ));
            }
        }
    }

    fn stop_server(&mut self) {
        if let Some(mut child) = self.server_process.take() {
            match child.kill() {
                Ok(_) => {
                    let _ = child.wait();
                    info!("llama-server process stopped");
                }
                Err(e) => warn!("Failed to kill llama-server process: {}", e),
            }
        }
    }

    pub async fn health_check(&self) -> anyhow::Result<()> {
        let health_url = format!("{}/health", self.base_url);
        let resp = self.http_client.get(&health_url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Health check failed: {}", e))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("Health check returned: {}", resp.status()))
        }
    }
}

#[async_trait]
impl InferenceEngine for GGUFRuntime {
    fn kind(&self) -> BackendKind {
        BackendKind::GgufEngine
    }

    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String> {
        let url = format!("{}/completion", self.base_url);

        let payload = serde_json::json!({
            "prompt": request.prompt,
            "n_predict": request.max_tokens,
            "temperature": request.temperature,
            "stop": request.stop,
            "stream": false,
        });

        let resp = self.http_client.post(&url)
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

        response["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("llama-server response has no content"))
    }

    fn size_bytes(&self) -> u64 {
        std::fs::metadata(&self.model_path).map(|m| m.len()).unwrap_or(0)
    }

    async fn set_threads(&mut self, threads: u32) -> anyhow::Result<()> {
        let Some(launch) = self.launch.as_mut() else {
            return Err(anyhow::anyhow!(
                "threads cannot be changed on an attached llama-server"
            ));
        };
        let previous = std::mem::replace(&mut launch.threads, threads);

        info!("Restarting llama-server with {} threads", threads);
        self.stop_server();
        let Err(e) = self.start_server().await else {
            return Ok(());
        };

        warn!("Restart with {} threads failed, going back to {}: {:#}", threads, previous, e);
        if let Some(launch) = self.launch.as_mut() {
            launch.threads = previous;
        }
        if let Err(restore) = self.start_server().await {
            error!("llama-server could not be restarted with {} threads: {:#}", previous, restore);
        }
        Err(e)
    }

    fn needs_restart(&self) -> bool {
        self.launch.is_some() && self.server_process.is_none()
    }

    async fn shutdown(&mut self) {
        info!("Shutting down GGUF runtime for {}", self.model_path.display());
        self.stop_server();
    }

    fn metadata(&self) -> RuntimeMetadata {
        RuntimeMetadata {
            kind: BackendKind::GgufEngine,
            runtime_name: "llama.cpp (llama-server)".to_string(),
            base_url: self.base_url.clone(),
            supports_gpu: true,
        }
    }
}

impl Drop for GGUFRuntime {
    fn drop(&mut self) {
        if let Some(mut child) = self.server_process.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
