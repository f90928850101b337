pub mod event;
pub mod host;
pub mod http_scheduler;
pub mod scheduler;
pub mod supervisor;
pub mod timer;
pub mod worker;

pub use event::RuntimeEvent;
pub use supervisor::{PendingBatch, SupervisorConfig, TaskSupervisor};
pub use worker::{Worker, WorkerHandle};
