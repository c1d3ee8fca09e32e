pub mod batch;
pub mod gateway;
pub mod ledger;
pub mod orchestrator;
pub mod parser;
pub mod scheduler;
pub mod transformer;
pub mod validator;

pub use batch::{BatchConfig, BatchProcessor};
pub use gateway::{ObjectStoreGateway, RetryPolicy};
pub use ledger::FileTracker;
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
