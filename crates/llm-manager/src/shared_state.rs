//! Shared state for the HTTP facade and the dispatch worker
//!
//! `ModelStore` owns the loaded models and the conversations bound to them.
//! It is shared by `Arc`; every conversation references a model that is in
//! the store, and removing a model removes its conversations with it.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::Config;
use crate::download::ModelDownloader;
use crate::error::{ManagerError, ManagerResult};
use crate::memory::{Conversation, Message};
use crate::metrics;
use crate::model_runtime::{ModelHandle, ModelInfo, ModelSpec, RuntimeManager};
use crate::worker_threads::DispatchQueue;

/// Atomic counters for system metrics
#[derive(Default)]
pub struct AtomicCounters {
    pub conversations_created: AtomicUsize,
    pub processed_messages: AtomicUsize,
    pub models_loaded: AtomicUsize,
}

impl AtomicCounters {
    pub fn inc_conversations(&self) -> usize {
        self.conversations_created.fetch_add(1, Ordering::Relaxed)
    }

    pub fn inc_processed_messages(&self) -> usize {
        self.processed_messages.fetch_add(1, Ordering::Relaxed)
    }

    pub fn inc_models_loaded(&self) -> usize {
        self.models_loaded.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub model_id: String,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
}

impl ConversationSummary {
    fn of(conversation: &Conversation) -> Self {
        Self {
            model_id: conversation.model_id.clone(),
            message_count: conversation.history.len(),
            created_at: conversation.created_at,
        }
    }
}

pub struct ModelStore {
    models: DashMap<String, Arc<ModelHandle>>,
    conversations: DashMap<String, Conversation>,
    system_prompt: String,
    history_cap: usize,
    pub counters: AtomicCounters,
}

impl ModelStore {
    pub fn new(system_prompt: impl Into<String>, history_cap: usize) -> Self {
        Self {
            models: DashMap::new(),
            conversations: DashMap::new(),
            system_prompt: system_prompt.into(),
            history_cap,
            counters: AtomicCounters::default(),
        }
    }

    pub fn history_cap(&self) -> usize {
        self.history_cap
    }

    pub fn contains_model(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    pub fn insert_model(&self, handle: ModelHandle) -> ManagerResult<Arc<ModelHandle>> {
        let handle = match self.models.entry(handle.id.clone()) {
            Entry::Occupied(entry) => return Err(ManagerError::ModelExists(entry.key().clone())),
            Entry::Vacant(entry) => entry.insert(Arc::new(handle)).clone(),
        };
        self.counters.inc_models_loaded();
        metrics::set_loaded_models(self.models.len());
        Ok(handle)
    }

    pub fn get_model(&self, model_id: &str) -> ManagerResult<Arc<ModelHandle>> {
        self.models
            .get(model_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ManagerError::ModelNotFound(model_id.to_string()))
    }

    /// Whether a loaded model runs from `source`.
    pub fn source_in_use(&self, source: &str) -> bool {
        self.models.iter().any(|entry| entry.value().source == source)
    }

    /// Models sorted by id.
    pub fn models(&self) -> Vec<Arc<ModelHandle>> {
        let mut models: Vec<_> = self.models.iter().map(|entry| entry.value().clone()).collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    /// Removes the model and every conversation bound to it. Returns the
    /// handle, still loaded, and the number of conversations dropped.
    pub fn remove_model(&self, model_id: &str) -> ManagerResult<(Arc<ModelHandle>, usize)> {
        let (_, handle) = self
            .models
            .remove(model_id)
            .ok_or_else(|| ManagerError::ModelNotFound(model_id.to_string()))?;

        let before = self.conversations.len();
        self.conversations.retain(|_, conversation| conversation.model_id != model_id);
        let dropped = before.saturating_sub(self.conversations.len());

        metrics::set_loaded_models(self.models.len());
        info!("Removed model {} and {} conversation(s)", model_id, dropped);
        Ok((handle, dropped))
    }

    /// Empties the store, returning the models so the caller can unload them.
    pub fn drain_models(&self) -> Vec<Arc<ModelHandle>> {
        let ids: Vec<String> = self.models.iter().map(|entry| entry.key().clone()).collect();
        let drained = ids
            .iter()
            .filter_map(|id| self.models.remove(id).map(|(_, handle)| handle))
            .collect();
        self.conversations.clear();
        metrics::set_loaded_models(0);
        drained
    }

    /// Creates a conversation seeded with the system prompt. Without an
    /// explicit id it becomes `{model_id}_{n+1}` for the n conversations the
    /// model already has, bumped until free.
    pub fn create_conversation(
        &self,
        model_id: &str,
        conversation_id: Option<&str>,
    ) -> ManagerResult<String> {
        // Held until the insert is done so a concurrent model removal
        // cannot miss the new conversation.
        let _model = self
            .models
            .get(model_id)
            .ok_or_else(|| ManagerError::ModelNotFound(model_id.to_string()))?;

        let id = match conversation_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => {
                match self.conversations.entry(id.to_string()) {
                    Entry::Occupied(_) => return Err(ManagerError::ConversationExists(id.to_string())),
                    Entry::Vacant(entry) => {
                        entry.insert(Conversation::new(id, model_id, &self.system_prompt));
                    }
                }
                id.to_string()
            }
            None => {
                let mut n = self
                    .conversations
                    .iter()
                    .filter(|entry| entry.value().model_id == model_id)
                    .count()
                    + 1;
                loop {
                    let candidate = format!("{}_{}", model_id, n);
                    if let Entry::Vacant(entry) = self.conversations.entry(candidate.clone()) {
                        entry.insert(Conversation::new(&candidate, model_id, &self.system_prompt));
                        break candidate;
                    }
                    n += 1;
                }
            }
        };

        self.counters.inc_conversations();
        info!("Created conversation {} for model {}", id, model_id);
        Ok(id)
    }

    pub fn conversation_summary(&self, conversation_id: &str) -> ManagerResult<ConversationSummary> {
        self.conversations
            .get(conversation_id)
            .map(|conversation| ConversationSummary::of(&conversation))
            .ok_or_else(|| ManagerError::ConversationNotFound(conversation_id.to_string()))
    }

    pub fn conversation_history(&self, conversation_id: &str) -> ManagerResult<Vec<Message>> {
        self.conversations
            .get(conversation_id)
            .map(|conversation| conversation.history.clone())
            .ok_or_else(|| ManagerError::ConversationNotFound(conversation_id.to_string()))
    }

    pub fn reset_conversation(&self, conversation_id: &str) -> ManagerResult<()> {
        let mut conversation = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| ManagerError::ConversationNotFound(conversation_id.to_string()))?;
        conversation.reset(&self.system_prompt);
        Ok(())
    }

    pub fn list_conversations(&self) -> BTreeMap<String, ConversationSummary> {
        self.conversations
            .iter()
            .map(|entry| (entry.key().clone(), ConversationSummary::of(entry.value())))
            .collect()
    }

    /// Appends the user message and returns the bound model together with a
    /// snapshot of the history to generate from.
    pub fn begin_turn(
        &self,
        conversation_id: &str,
        message: &str,
    ) -> ManagerResult<(Arc<ModelHandle>, Vec<Message>)> {
        let (model_id, history) = {
            let mut conversation = self
                .conversations
                .get_mut(conversation_id)
                .ok_or_else(|| ManagerError::ConversationNotFound(conversation_id.to_string()))?;
            conversation.push(Message::user(message), self.history_cap);
            (conversation.model_id.clone(), conversation.history.clone())
        };
        let model = self.get_model(&model_id)?;
        Ok((model, history))
    }

    pub fn finish_turn(&self, conversation_id: &str, reply: &str) -> ManagerResult<()> {
        let mut conversation = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| ManagerError::ConversationNotFound(conversation_id.to_string()))?;
        conversation.push(Message::assistant(reply), self.history_cap);
        self.counters.inc_processed_messages();
        Ok(())
    }

    pub fn counts(&self) -> (usize, usize) {
        (self.models.len(), self.conversations.len())
    }
}

/// State handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<ModelStore>,
    pub dispatch: Arc<DispatchQueue>,
    pub runtime_manager: Arc<RuntimeManager>,
    pub downloader: Arc<ModelDownloader>,
    pub started_at: Instant,
}

impl AppState {
    /// Builds the store and starts the dispatch worker. Must run inside a
    /// tokio runtime.
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(ModelStore::new(config.system_prompt.clone(), config.history_cap));
        let dispatch = Arc::new(DispatchQueue::start(
            store.clone(),
            config.queue_size,
            std::time::Duration::from_secs(config.queue_timeout_seconds),
        ));

        Self {
            runtime_manager: Arc::new(RuntimeManager::new(config.clone())),
            downloader: Arc::new(ModelDownloader::new(config.model_dir.clone())),
            config,
            store,
            dispatch,
            started_at: Instant::now(),
        }
    }

    /// Loads a model and registers it once its engine is ready.
    pub async fn load_model(&self, spec: &ModelSpec) -> ManagerResult<ModelInfo> {
        if self.store.contains_model(&spec.id) {
            return Err(ManagerError::ModelExists(spec.id.clone()));
        }

        let handle = self.runtime_manager.load(spec).await?;
        let handle = self.store.insert_model(handle)?;
        Ok(handle.info().await)
    }

    /// Loads each model in order. Failures are logged and skipped.
    pub async fn load_models(&self, specs: &[ModelSpec]) -> Vec<String> {
        let mut loaded = Vec::new();
        for spec in specs {
            match self.load_model(spec).await {
                Ok(_) => loaded.push(spec.id.clone()),
                Err(e) => warn!("Skipping model {}: {}", spec.id, e),
            }
        }
        loaded
    }
}
