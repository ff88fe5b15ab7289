//! Application configuration and the LoRA adapter catalog.

mod app;
mod lora_catalog;

pub use app::{
    AppConfig, EngineBackend, EngineSettings, QueueConfig, SchedulerConfig, WorkerLaunchConfig,
};
pub use lora_catalog::{LoraCatalog, CATALOG_FILE_NAME};
