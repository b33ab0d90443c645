pub mod batch;
pub mod cache;
pub mod health;
pub mod parser_control;
pub mod scheduler;
pub mod task_store;

pub use batch::{BatchController, BatchPhase, update_task_state};
pub use cache::ResponseCache;
pub use health::{HealthAlert, HealthMonitor};
pub use parser_control::{DispatchContext, ParserControl, Routed};
pub use scheduler::Scheduler;
pub use task_store::{MemoryTaskStore, SqlTaskStore, TaskStore};
