//! Shared types for the generation service: task records, task types and
//! statuses, LoRA adapter configs, and the common error type.

pub mod error;
pub mod lora;
pub mod task;

pub use error::{GenError, Result};
pub use lora::{flatten_loras, LoraConfig, LoraSignature, ModelLoraConfig, SignatureEntry};
pub use task::{Params, TaskFamily, TaskPage, TaskRecord, TaskStatus, TaskType};

/// Current Unix timestamp in whole seconds.
pub fn current_timestamp_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current Unix timestamp in fractional seconds (render timing).
pub fn current_timestamp_f64() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}
