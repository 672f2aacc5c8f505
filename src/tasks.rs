//! Background task lifecycle: per-conversation serialisation, durable
//! task state, and the submission surface for pipeline work.

pub mod manager;
pub mod mutex;
pub mod store;

pub use manager::{ActiveTaskSummary, TaskManager};
pub use mutex::{ConversationGuard, ConversationMutex};
pub use store::{PersistedTask, PhaseUpdate, TaskPhase, TaskStore};
