// LLM Studio / crates/llm-manager/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an English language assistant. Always respond in English only, \
regardless of the language used to ask questions. If asked in another language, \
politely request English. Maintain a helpful, concise, and informative tone.";

#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for relative model paths and downloads.
    pub model_dir: PathBuf,
    /// `llama-server` binary; only needed to load GGUF models.
    pub llama_bin: Option<PathBuf>,
    pub llama_host: String,
    /// First port tried when spawning a `llama-server` for a model.
    pub llama_base_port: u16,
    pub api_host: String,
    pub api_port: u16,
    pub queue_size: usize,
    pub queue_timeout_seconds: u64,
    pub health_timeout_seconds: u64,
    pub generate_timeout_seconds: u64,
    pub history_cap: usize,
    pub system_prompt: String,
    /// JSON file with `{"models": [...]}` loaded at startup.
    pub models_config: Option<PathBuf>,
    pub default_context_window: u32,
    pub default_threads: u32,
    pub default_gpu_layers: u32,
    pub default_temperature: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("./models"),
            llama_bin: None,
            llama_host: "127.0.0.1".to_string(),
            llama_base_port: 8081,
            api_host: "0.0.0.0".to_string(),
            api_port: 5000,
            queue_size: 100,
            queue_timeout_seconds: 30,
            health_timeout_seconds: 60,
            generate_timeout_seconds: 600,
            history_cap: 30,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            models_config: None,
            default_context_window: 2048,
            default_threads: 4,
            default_gpu_layers: 0,
            default_temperature: 0.7,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let defaults = Self::default();

        let llama_bin = match env::var("LLAMA_BIN") {
            Ok(bin) if !bin.trim().is_empty() => {
                let path = PathBuf::from(bin);
                if !path.exists() {
                    warn!(
                        "LLAMA_BIN points to a missing file: {}. GGUF models will fail to load.",
                        path.display()
                    );
                }
                Some(path)
            }
            _ => {
                warn!("LLAMA_BIN not set; GGUF models can only attach to an existing llama-server endpoint");
                None
            }
        };

        // Auto-detect threads if set to "auto"
        let default_threads = match env::var("DEFAULT_THREADS") {
            Ok(v) if v == "auto" => Self::auto_detect_threads(),
            Ok(v) => v.parse().context("DEFAULT_THREADS must be a positive integer or \"auto\"")?,
            Err(_) => defaults.default_threads,
        };

        let models_config = env::var("MODELS_CONFIG")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            model_dir: env::var("MODEL_DIR").map(PathBuf::from).unwrap_or(defaults.model_dir),
            llama_bin,
            llama_host: env::var("LLAMA_HOST").unwrap_or(defaults.llama_host),
            llama_base_port: parse_env("LLAMA_BASE_PORT", defaults.llama_base_port)?,
            api_host: env::var("API_HOST").unwrap_or(defaults.api_host),
            api_port: parse_env("API_PORT", defaults.api_port)?,
            queue_size: parse_env("QUEUE_SIZE", defaults.queue_size)?,
            queue_timeout_seconds: parse_env("QUEUE_TIMEOUT_SECONDS", defaults.queue_timeout_seconds)?,
            health_timeout_seconds: parse_env("HEALTH_TIMEOUT_SECONDS", defaults.health_timeout_seconds)?,
            generate_timeout_seconds: parse_env(
                "GENERATE_TIMEOUT_SECONDS",
                defaults.generate_timeout_seconds,
            )?,
            history_cap: parse_env("HISTORY_CAP", defaults.history_cap)?,
            system_prompt: env::var("SYSTEM_PROMPT").unwrap_or(defaults.system_prompt),
            models_config,
            default_context_window: parse_env("DEFAULT_CONTEXT_WINDOW", defaults.default_context_window)?,
            default_threads,
            default_gpu_layers: parse_env("DEFAULT_GPU_LAYERS", defaults.default_gpu_layers)?,
            default_temperature: parse_env("DEFAULT_TEMPERATURE", defaults.default_temperature)?,
        }
        .validated()?)
    }

    /// Rejects values the queue and registry cannot work with.
    pub fn validated(self) -> Result<Self> {
        if self.queue_size == 0 {
            anyhow::bail!("QUEUE_SIZE must be at least 1");
        }
        // The system prompt always occupies one slot.
        if self.history_cap < 2 {
            anyhow::bail!("HISTORY_CAP must be at least 2, got {}", self.history_cap);
        }
        if self.default_threads == 0 {
            anyhow::bail!("DEFAULT_THREADS must be at least 1");
        }
        Ok(self)
    }

    /// Resolves a model path the way the model endpoints do: relative paths
    /// live under `model_dir`.
    pub fn resolve_model_path(&self, path: &str) -> PathBuf {
        let candidate = PathBuf::from(path);
        if candidate.is_absolute() {
            candidate
        } else {
            self.model_dir.join(candidate)
        }
    }

    fn auto_detect_threads() -> u32 {
        let num_cpus = num_cpus::get() as u32;
        info!("Auto-detected CPU cores: {}", num_cpus);

        match num_cpus {
            0..=2 => 1,
            3..=4 => (num_cpus * 2) / 3,
            5..=8 => (num_cpus * 3) / 5,
            9..=16 => num_cpus / 2,
            17..=32 => (num_cpus * 2) / 5,
            _ => 16,
        }
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Model Dir: {}", self.model_dir.display());
        info!(
            "- Llama Binary: {}",
            self.llama_bin
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<not set>".to_string())
        );
        info!("- Llama Ports: {}:{}+", self.llama_host, self.llama_base_port);
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Queue Size: {}", self.queue_size);
        info!("- Queue Timeout: {}s", self.queue_timeout_seconds);
        info!("- Health Timeout: {}s", self.health_timeout_seconds);
        info!("- Generate Timeout: {}s", self.generate_timeout_seconds);
        info!("- History Cap: {}", self.history_cap);
        info!(
            "- Defaults: ctx={} threads={} gpu_layers={} temperature={}",
            self.default_context_window,
            self.default_threads,
            self.default_gpu_layers,
            self.default_temperature
        );
        if let Some(path) = &self.models_config {
            info!("- Models Config: {}", path.display());
        }
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("Invalid API address {}:{}", self.api_host, self.api_port))
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}
