//! Generation service: wiring of the task store, queue, scheduler and API,
//! plus the task dispatcher and logging setup used by the `genserve`
//! binary.

pub mod app;
pub mod dispatcher;
pub mod logging;

pub use app::Services;
pub use dispatcher::{DispatcherHandle, StopReason, TaskDispatcher, TaskOutcome};
