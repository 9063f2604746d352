//! Stub engines for unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::model_runtime::{
    BackendKind, CompletionRequest, InferenceEngine, ModelHandle, ModelParams, RuntimeMetadata,
};

fn stub_metadata(kind: BackendKind, name: &str) -> RuntimeMetadata {
    RuntimeMetadata {
        kind,
        runtime_name: name.to_string(),
        base_url: String::new(),
        supports_gpu: false,
    }
}

/// Replies with the prompt it was given.
pub(crate) struct EchoEngine {
    kind: BackendKind,
    size: u64,
    threads: Arc<AtomicU32>,
    stopped: Arc<AtomicBool>,
}

impl EchoEngine {
    pub(crate) fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            size: 0,
            threads: Arc::new(AtomicU32::new(4)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub(crate) fn threads(&self) -> Arc<AtomicU32> {
        self.threads.clone()
    }

    /// Set to make the engine report that its server is down.
    pub(crate) fn stopped(&self) -> Arc<AtomicBool> {
        self.stopped.clone()
    }
}

#[async_trait]
impl InferenceEngine for EchoEngine {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String> {
        Ok(request.prompt)
    }

    fn size_bytes(&self) -> u64 {
        self.size
    }

    async fn set_threads(&mut self, threads: u32) -> anyhow::Result<()> {
        if self.kind != BackendKind::GgufEngine {
            anyhow::bail!("echo engine only takes threads as gguf");
        }
        self.threads.store(threads, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn needs_restart(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn shutdown(&mut self) {}

    fn metadata(&self) -> RuntimeMetadata {
        stub_metadata(self.kind, "echo")
    }
}

/// Always replies with the same text.
pub(crate) struct ScriptedEngine {
    kind: BackendKind,
    reply: String,
}

impl ScriptedEngine {
    pub(crate) fn new(kind: BackendKind, reply: &str) -> Self {
        Self {
            kind,
            reply: reply.to_string(),
        }
    }
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn complete(&self, _request: CompletionRequest) -> anyhow::Result<String> {
        Ok(self.reply.clone())
    }

    fn size_bytes(&self) -> u64 {
        0
    }

    async fn shutdown(&mut self) {}

    fn metadata(&self) -> RuntimeMetadata {
        stub_metadata(self.kind, "scripted")
    }
}

pub(crate) struct FailingEngine {
    kind: BackendKind,
    message: String,
}

impl FailingEngine {
    pub(crate) fn new(kind: BackendKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl InferenceEngine for FailingEngine {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn complete(&self, _request: CompletionRequest) -> anyhow::Result<String> {
        Err(anyhow::anyhow!("{}", self.message))
    }

    fn size_bytes(&self) -> u64 {
        0
    }

    async fn shutdown(&mut self) {}

    fn metadata(&self) -> RuntimeMetadata {
        stub_metadata(self.kind, "failing")
    }
}

/// Panics inside `complete`.
pub(crate) struct PanickingEngine {
    kind: BackendKind,
}

impl PanickingEngine {
    pub(crate) fn new(kind: BackendKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl InferenceEngine for PanickingEngine {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn complete(&self, _request: CompletionRequest) -> anyhow::Result<String> {
        panic!("engine blew up");
    }

    fn size_bytes(&self) -> u64 {
        0
    }

    async fn shutdown(&mut self) {}

    fn metadata(&self) -> RuntimeMetadata {
        stub_metadata(self.kind, "panicking")
    }
}

/// Records every request and logs `start {name}` / `end {name}` around a
/// fixed delay, so tests can see whether calls overlap.
pub(crate) struct RecordingEngine {
    kind: BackendKind,
    name: String,
    delay: Duration,
    log: Arc<Mutex<Vec<String>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl RecordingEngine {
    pub(crate) fn new(kind: BackendKind) -> Self {
        Self::named(kind, "engine", Arc::new(Mutex::new(Vec::new())), Duration::ZERO)
    }

    pub(crate) fn named(
        kind: BackendKind,
        name: &str,
        log: Arc<Mutex<Vec<String>>>,
        delay: Duration,
    ) -> Self {
        Self {
            kind,
            name: name.to_string(),
            delay,
            log,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn requests(&self) -> Arc<Mutex<Vec<CompletionRequest>>> {
        self.requests.clone()
    }
}

#[async_trait]
impl InferenceEngine for RecordingEngine {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String> {
        self.log.lock().unwrap().push(format!("start {}", self.name));
        self.requests.lock().unwrap().push(request);
        tokio::time::sleep(self.delay).await;
        self.log.lock().unwrap().push(format!("end {}", self.name));
        Ok(format!("reply from {}", self.name))
    }

    fn size_bytes(&self) -> u64 {
        0
    }

    async fn shutdown(&mut self) {}

    fn metadata(&self) -> RuntimeMetadata {
        stub_metadata(self.kind, "recording")
    }
}

pub(crate) fn handle_with(id: &str, engine: Box<dyn InferenceEngine>) -> ModelHandle {
    ModelHandle::new(id, "llama", format!("{}.gguf", id), ModelParams::default(), engine)
}

pub(crate) fn echo_handle(id: &str, kind: BackendKind) -> ModelHandle {
    handle_with(id, Box::new(EchoEngine::new(kind)))
}
