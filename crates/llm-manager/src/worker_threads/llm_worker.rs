//! Single-flight dispatch queue
//!
//! Every generation, conversation reset, model deletion and parameter
//! change goes through one
//! bounded channel drained by one consumer task, so at most one of them runs
//! at any time, across all models and conversations, in submission order.

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ManagerError, ManagerResult};
use crate::metrics;
use crate::model_runtime::{ParameterReport, ParameterUpdate};
use crate::shared_state::ModelStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMode {
    Send,
    Stream,
}

impl ChatMode {
    fn as_str(&self) -> &'static str {
        match self {
            ChatMode::Send => "send",
            ChatMode::Stream => "stream",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Dequeuing = 1,
    Executing = 2,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => WorkerState::Dequeuing,
            2 => WorkerState::Executing,
            _ => WorkerState::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Dequeuing => "dequeuing",
            WorkerState::Executing => "executing",
        }
    }
}

pub enum Job {
    Chat {
        request_id: Uuid,
        conversation_id: String,
        message: String,
        mode: ChatMode,
        enqueued_at: Instant,
        reply: oneshot::Sender<ManagerResult<String>>,
    },
    ResetConversation {
        conversation_id: String,
        reply: oneshot::Sender<ManagerResult<()>>,
    },
    DeleteModel {
        model_id: String,
        reply: oneshot::Sender<ManagerResult<usize>>,
    },
    ModifyParameters {
        model_id: String,
        update: ParameterUpdate,
        reply: oneshot::Sender<ManagerResult<ParameterReport>>,
    },
    Shutdown,
}

impl Job {
    /// Answers the job with `err` without running it.
    fn reject(self, err: fn() -> ManagerError) {
        match self {
            Job::Chat { reply, .. } => {
                let _ = reply.send(Err(err()));
            }
            Job::ResetConversation { reply, .. } => {
                let _ = reply.send(Err(err()));
            }
            Job::DeleteModel { reply, .. } => {
                let _ = reply.send(Err(err()));
            }
            Job::ModifyParameters { reply, .. } => {
                let _ = reply.send(Err(err()));
            }
            Job::Shutdown => {}
        }
    }
}

pub struct DispatchQueue {
    sender: mpsc::Sender<Job>,
    state: Arc<AtomicU8>,
    depth: Arc<AtomicUsize>,
    closed: AtomicBool,
    enqueue_timeout: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchQueue {
    /// Spawns the consumer task. Must run inside a tokio runtime.
    pub fn start(store: Arc<ModelStore>, capacity: usize, enqueue_timeout: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let state = Arc::new(AtomicU8::new(WorkerState::Idle as u8));
        let depth = Arc::new(AtomicUsize::new(0));

        let worker = tokio::spawn(run_worker(store, receiver, state.clone(), depth.clone()));
        info!("Dispatch queue started (capacity {})", capacity.max(1));

        Self {
            sender,
            state,
            depth,
            closed: AtomicBool::new(false),
            enqueue_timeout,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn enqueue(&self, job: Job) -> ManagerResult<()> {
        if self.is_closed() {
            return Err(ManagerError::QueueClosed);
        }

        self.depth.fetch_add(1, Ordering::SeqCst);
        metrics::inc_queue();
        match self.sender.send_timeout(job, self.enqueue_timeout).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                metrics::dec_queue();
                match e {
                    mpsc::error::SendTimeoutError::Timeout(_) => {
                        warn!("Dispatch queue full after {:?}", self.enqueue_timeout);
                        Err(ManagerError::QueueFull)
                    }
                    mpsc::error::SendTimeoutError::Closed(_) => Err(ManagerError::QueueClosed),
                }
            }
        }
    }

    async fn await_reply<T>(receiver: oneshot::Receiver<ManagerResult<T>>) -> ManagerResult<T> {
        receiver
            .await
            .map_err(|_| ManagerError::Internal(anyhow::anyhow!("dispatch worker dropped the request")))?
    }

    /// Queues one chat turn and waits for the assistant reply.
    pub async fn submit_chat(
        &self,
        conversation_id: &str,
        message: &str,
        mode: ChatMode,
    ) -> ManagerResult<String> {
        let (reply, receiver) = oneshot::channel();
        let request_id = Uuid::new_v4();
        debug!("Queueing {} request {} for {}", mode.as_str(), request_id, conversation_id);

        self.enqueue(Job::Chat {
            request_id,
            conversation_id: conversation_id.to_string(),
            message: message.to_string(),
            mode,
            enqueued_at: Instant::now(),
            reply,
        })
        .await?;
        Self::await_reply(receiver).await
    }

    pub async fn send_message(&self, conversation_id: &str, message: &str) -> ManagerResult<String> {
        self.submit_chat(conversation_id, message, ChatMode::Send).await
    }

    pub async fn stream_message(&self, conversation_id: &str, message: &str) -> ManagerResult<String> {
        self.submit_chat(conversation_id, message, ChatMode::Stream).await
    }

    /// Resets a conversation to its system prompt once every turn queued
    /// before it has been recorded.
    pub async fn reset_conversation(&self, conversation_id: &str) -> ManagerResult<()> {
        let (reply, receiver) = oneshot::channel();
        self.enqueue(Job::ResetConversation {
            conversation_id: conversation_id.to_string(),
            reply,
        })
        .await?;
        Self::await_reply(receiver).await
    }

    /// Removes a model and its conversations between generations, then
    /// unloads it. Returns the number of conversations dropped.
    pub async fn delete_model(&self, model_id: &str) -> ManagerResult<usize> {
        let (reply, receiver) = oneshot::channel();
        self.enqueue(Job::DeleteModel {
            model_id: model_id.to_string(),
            reply,
        })
        .await?;
        Self::await_reply(receiver).await
    }

    pub async fn modify_parameters(
        &self,
        model_id: &str,
        update: ParameterUpdate,
    ) -> ManagerResult<ParameterReport> {
        let (reply, receiver) = oneshot::channel();
        self.enqueue(Job::ModifyParameters {
            model_id: model_id.to_string(),
            update,
            reply,
        })
        .await?;
        Self::await_reply(receiver).await
    }

    /// Lets every job queued so far finish, fails anything queued after,
    /// and waits for the worker to exit. Later submissions get `QueueClosed`.
    pub async fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Dispatch queue shutting down ({} queued)", self.depth());
            if self.sender.send(Job::Shutdown).await.is_err() {
                warn!("Dispatch worker already stopped");
            }
        }

        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Dispatch worker ended abnormally: {}", e);
            }
        }
    }
}

async fn run_worker(
    store: Arc<ModelStore>,
    mut receiver: mpsc::Receiver<Job>,
    state: Arc<AtomicU8>,
    depth: Arc<AtomicUsize>,
) {
    let set_state = |s: WorkerState| state.store(s as u8, Ordering::SeqCst);
    let dequeued = || {
        depth.fetch_sub(1, Ordering::SeqCst);
        metrics::dec_queue();
    };

    loop {
        set_state(WorkerState::Idle);
        let Some(job) = receiver.recv().await else {
            break;
        };
        set_state(WorkerState::Dequeuing);

        if let Job::Shutdown = job {
            receiver.close();
            let mut stragglers = 0usize;
            while let Some(job) = receiver.recv().await {
                if !matches!(job, Job::Shutdown) {
                    dequeued();
                    stragglers += 1;
                }
                job.reject(|| ManagerError::ShuttingDown);
            }
            if stragglers > 0 {
                warn!("Rejected {} job(s) queued after shutdown", stragglers);
            }
            break;
        }

        dequeued();
        set_state(WorkerState::Executing);
        if AssertUnwindSafe(execute(&store, job)).catch_unwind().await.is_err() {
            error!("Dispatch job panicked; continuing with the next job");
        }
    }

    set_state(WorkerState::Idle);
    info!("Dispatch worker stopped");
}

async fn execute(store: &ModelStore, job: Job) {
    match job {
        Job::Chat {
            request_id,
            conversation_id,
            message,
            mode,
            enqueued_at,
            reply,
        } => {
            metrics::observe_queue_wait(enqueued_at.elapsed().as_secs_f64());
            debug!("Executing {} request {} for {}", mode.as_str(), request_id, conversation_id);

            let result = async {
                let (model, history) = store.begin_turn(&conversation_id, &message)?;
                let text = model.generate(&history).await;
                store.finish_turn(&conversation_id, &text)?;
                Ok(text)
            }
            .await;

            if let Err(e) = &result {
                warn!("Request {} failed: {}", request_id, e);
            }
            if reply.send(result).is_err() {
                debug!("Caller for request {} went away", request_id);
            }
        }
        Job::ResetConversation {
            conversation_id,
            reply,
        } => {
            let result = store.reset_conversation(&conversation_id);
            if result.is_ok() {
                info!("Reset conversation {}", conversation_id);
            }
            let _ = reply.send(result);
        }
        Job::DeleteModel { model_id, reply } => {
            let result = match store.remove_model(&model_id) {
                Ok((handle, dropped)) => {
                    handle.unload().await;
                    Ok(dropped)
                }
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }
        Job::ModifyParameters {
            model_id,
            update,
            reply,
        } => {
            let result = match store.get_model(&model_id) {
                Ok(handle) => Ok(handle.modify_parameters(&update).await),
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }
        Job::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_runtime::BackendKind;
    use crate::memory::Message;
    use crate::testing::{echo_handle, handle_with, PanickingEngine, RecordingEngine};
    use std::sync::Mutex as StdMutex;

    fn create_test_store() -> Arc<ModelStore> {
        Arc::new(ModelStore::new("sys", 30))
    }

    fn recording_model(
        store: &ModelStore,
        id: &str,
        log: &Arc<StdMutex<Vec<String>>>,
        delay_ms: u64,
    ) {
        let engine = RecordingEngine::named(
            BackendKind::GgufEngine,
            id,
            log.clone(),
            Duration::from_millis(delay_ms),
        );
        store.insert_model(handle_with(id, Box::new(engine))).unwrap();
    }

    #[tokio::test]
    async fn test_generations_never_overlap_and_keep_order() {
        let store = create_test_store();
        let log = Arc::new(StdMutex::new(Vec::new()));
        recording_model(&store, "a", &log, 50);
        recording_model(&store, "b", &log, 10);
        let conv_a = store.create_conversation("a", None).unwrap();
        let conv_b = store.create_conversation("b", None).unwrap();

        let queue = DispatchQueue::start(store.clone(), 8, Duration::from_secs(1));
        let (ra, rb) = tokio::join!(
            queue.send_message(&conv_a, "first"),
            queue.send_message(&conv_b, "second"),
        );

        assert_eq!(ra.unwrap(), "reply from a");
        assert_eq!(rb.unwrap(), "reply from b");
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start a", "end a", "start b", "end b"]
        );
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_chat_appends_both_turns() {
        let store = create_test_store();
        store.insert_model(echo_handle("m", BackendKind::RecurrentState)).unwrap();
        let conv = store.create_conversation("m", None).unwrap();
        let queue = DispatchQueue::start(store.clone(), 4, Duration::from_secs(1));

        let reply = queue.stream_message(&conv, "Hi").await.unwrap();
        assert_eq!(reply, "System: sys\n\nUser: Hi\n\nAssistant:");

        let history = store.conversation_history(&conv).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].content, reply);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_reported() {
        let store = create_test_store();
        let queue = DispatchQueue::start(store, 4, Duration::from_secs(1));

        let err = queue.send_message("nope", "Hi").await.unwrap_err();
        assert!(matches!(err, ManagerError::ConversationNotFound(_)));
        queue.shutdown().await;
        assert_eq!(queue.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn test_chat_queued_behind_delete_sees_no_conversation() {
        let store = create_test_store();
        let log = Arc::new(StdMutex::new(Vec::new()));
        recording_model(&store, "slow", &log, 50);
        let conv = store.create_conversation("slow", None).unwrap();
        let queue = DispatchQueue::start(store.clone(), 8, Duration::from_secs(1));

        let (first, deleted, after) = tokio::join!(
            queue.send_message(&conv, "one"),
            queue.delete_model("slow"),
            queue.send_message(&conv, "two"),
        );

        assert_eq!(first.unwrap(), "reply from slow");
        assert_eq!(deleted.unwrap(), 1);
        assert!(matches!(after, Err(ManagerError::ConversationNotFound(_))));
        assert_eq!(store.counts(), (0, 0));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_waits_for_running_turn() {
        let store = create_test_store();
        let log = Arc::new(StdMutex::new(Vec::new()));
        recording_model(&store, "slow", &log, 200);
        let conv = store.create_conversation("slow", None).unwrap();
        let queue = Arc::new(DispatchQueue::start(store.clone(), 8, Duration::from_secs(1)));

        let running = {
            let queue = queue.clone();
            let conv = conv.clone();
            tokio::spawn(async move { queue.send_message(&conv, "question").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.reset_conversation(&conv).await.unwrap();

        assert_eq!(running.await.unwrap().unwrap(), "reply from slow");
        assert_eq!(store.conversation_history(&conv).unwrap(), vec![Message::system("sys")]);

        let err = queue.reset_conversation("nope").await.unwrap_err();
        assert!(matches!(err, ManagerError::ConversationNotFound(_)));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_job_does_not_stop_queue() {
        let store = create_test_store();
        store.insert_model(echo_handle("m", BackendKind::GgufEngine)).unwrap();
        let conv = store.create_conversation("m", None).unwrap();
        let queue = DispatchQueue::start(store, 4, Duration::from_secs(1));

        let (failed, ok) = tokio::join!(
            queue.send_message("nope", "Hi"),
            queue.send_message(&conv, "Hi"),
        );

        assert!(matches!(failed, Err(ManagerError::ConversationNotFound(_))));
        assert!(ok.unwrap().ends_with("<|im_start|>assistant\n"));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_queue() {
        let store = create_test_store();
        store
            .insert_model(handle_with("boom", Box::new(PanickingEngine::new(BackendKind::GgufEngine))))
            .unwrap();
        store.insert_model(echo_handle("m", BackendKind::GgufEngine)).unwrap();
        let broken = store.create_conversation("boom", None).unwrap();
        let healthy = store.create_conversation("m", None).unwrap();
        let queue = DispatchQueue::start(store, 4, Duration::from_secs(1));

        let (panicked, ok) = tokio::join!(
            queue.send_message(&broken, "Hi"),
            queue.send_message(&healthy, "Hi"),
        );

        assert!(matches!(panicked, Err(ManagerError::Internal(_))));
        assert!(ok.is_ok());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_modify_parameters_through_queue() {
        let store = create_test_store();
        store.insert_model(echo_handle("m", BackendKind::GgufEngine)).unwrap();
        let queue = DispatchQueue::start(store, 4, Duration::from_secs(1));

        let report = queue
            .modify_parameters(
                "m",
                ParameterUpdate {
                    temperature: Some(serde_json::json!(0.2)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(report.changes.contains_key("temperature"));

        let err = queue.modify_parameters("ghost", ParameterUpdate::default()).await.unwrap_err();
        assert!(matches!(err, ManagerError::ModelNotFound(_)));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_times_out() {
        let store = create_test_store();
        let log = Arc::new(StdMutex::new(Vec::new()));
        recording_model(&store, "slow", &log, 300);
        let conv = store.create_conversation("slow", None).unwrap();
        let queue = Arc::new(DispatchQueue::start(store, 1, Duration::from_millis(50)));

        let running = {
            let queue = queue.clone();
            let conv = conv.clone();
            tokio::spawn(async move { queue.send_message(&conv, "running").await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let waiting = {
            let queue = queue.clone();
            let conv = conv.clone();
            tokio::spawn(async move { queue.send_message(&conv, "waiting").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = queue.send_message(&conv, "rejected").await.unwrap_err();
        assert!(matches!(err, ManagerError::QueueFull));

        assert!(running.await.unwrap().is_ok());
        assert!(waiting.await.unwrap().is_ok());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_closes() {
        let store = create_test_store();
        let log = Arc::new(StdMutex::new(Vec::new()));
        recording_model(&store, "m", &log, 20);
        let conv = store.create_conversation("m", None).unwrap();
        let queue = DispatchQueue::start(store, 8, Duration::from_secs(1));

        let (queued, ()) = tokio::join!(queue.send_message(&conv, "before"), queue.shutdown());
        assert_eq!(queued.unwrap(), "reply from m");
        assert_eq!(queue.depth(), 0);

        let err = queue.send_message(&conv, "after").await.unwrap_err();
        assert!(matches!(err, ManagerError::QueueClosed));

        // Idempotent.
        queue.shutdown().await;
    }
}
