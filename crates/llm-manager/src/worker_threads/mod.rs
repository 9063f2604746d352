pub mod llm_worker;
pub use llm_worker::{ChatMode, DispatchQueue, Job, WorkerState};
