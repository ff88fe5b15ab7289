//! Inference engine adapters.
//!
//! An [`EngineFactory`] builds a loaded [`Engine`] for one task type; the
//! worker process owns at most one engine at a time. Engines are
//! synchronous and never shared across threads.

pub mod command;
pub mod memory;
pub mod params;
pub mod preview;
mod registry;

use genserve_types::{
    flatten_loras, GenError, LoraConfig, LoraSignature, ModelLoraConfig, Params, TaskType,
};
use serde_json::Value;
use thiserror::Error;

pub use memory::Placement;
pub use registry::EngineRegistry;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Load(String),
    #[error("{0}")]
    Inference(String),
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
}

impl From<EngineError> for GenError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Load(msg) => GenError::Load(msg),
            other => GenError::Inference(other.to_string()),
        }
    }
}

/// Everything an engine needs to come up.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub task_type: TaskType,
    pub params: Params,
    pub loras: Vec<LoraConfig>,
    pub placement: Placement,
}

impl LoadRequest {
    /// Build from worker `load` params: adapters come from `lora_configs`,
    /// placement from the accelerator's total memory.
    pub fn from_params(task_type: TaskType, params: Params) -> Result<Self, EngineError> {
        let loras = lora_configs(&params)?;
        let threshold = params
            .get("cpu_offload_threshold_gib")
            .and_then(Value::as_f64)
            .unwrap_or(memory::DEFAULT_CPU_OFFLOAD_THRESHOLD_GIB);
        Ok(Self {
            task_type,
            params,
            loras,
            placement: memory::detect_placement(threshold),
        })
    }

    pub fn string_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn flat_loras(&self) -> Vec<ModelLoraConfig> {
        flatten_loras(&self.loras)
    }
}

/// Adapter configs carried in a params map under `lora_configs`.
pub fn lora_configs(params: &Params) -> Result<Vec<LoraConfig>, EngineError> {
    match params.get("lora_configs") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| EngineError::InvalidParams(format!("lora_configs: {e}"))),
    }
}

/// A loaded pipeline.
pub trait Engine: Send {
    fn task_type(&self) -> TaskType;

    /// Run one generation. Returns a result mapping (output paths and
    /// metadata).
    fn run(&mut self, params: &Params) -> Result<Value, EngineError>;

    fn attach_loras(&mut self, loras: &[ModelLoraConfig]) -> Result<(), EngineError>;

    fn detach_loras(&mut self) -> Result<(), EngineError>;

    fn attached_loras(&self) -> LoraSignature;

    /// Release everything the engine holds. Must be safe to call on an
    /// engine whose setup only partly succeeded.
    fn unload(&mut self) -> Result<(), EngineError>;
}

pub trait EngineFactory: Send + Sync {
    /// Backend name selected by the `backend` load param.
    fn backend(&self) -> &'static str;

    /// Bring up an engine. A factory that fails must release whatever it
    /// built before returning the error.
    fn load(&self, request: &LoadRequest) -> Result<Box<dyn Engine>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn load_errors_stay_load_errors() {
        let err: GenError = EngineError::Load("no weights".into()).into();
        assert!(matches!(err, GenError::Load(_)));
        let err: GenError = EngineError::InvalidParams("width".into()).into();
        assert!(matches!(err, GenError::Inference(ref m) if m.contains("width")));
    }

    #[test]
    fn lora_configs_are_read_from_params() {
        let mut params = Params::new();
        assert!(lora_configs(&params).unwrap().is_empty());
        params.insert(
            "lora_configs".into(),
            json!([{"id": 1, "path": "/loras/a.safetensors", "strength": 0.5}]),
        );
        let loras = lora_configs(&params).unwrap();
        assert_eq!(loras[0].strength, Some(0.5));

        params.insert("lora_configs".into(), json!("nope"));
        assert!(matches!(
            lora_configs(&params),
            Err(EngineError::InvalidParams(_))
        ));
    }
}
