//! Process-isolated engine execution.
//!
//! The scheduler side ([`ModelScheduler`], [`ProcessManager`],
//! [`WorkerBridge`]) lives in the serving process; [`run_worker`] is the
//! entry point of the child process that actually holds an engine.

pub mod framing;
pub mod ipc_types;
pub mod process_manager;
pub mod scheduler;
pub mod worker_bridge;
pub mod worker_main;

pub use ipc_types::{MessageKind, WorkerMessage};
pub use process_manager::ProcessManager;
pub use scheduler::{CurrentModel, Inference, ModelScheduler, SchedulerOptions, StatsSnapshot};
pub use worker_bridge::WorkerBridge;
pub use worker_main::{run_worker, serve, WorkerExit};
