use std::collections::HashMap;

use log::info;

use crate::command::CommandEngineFactory;
use crate::preview::PreviewEngineFactory;
use crate::{Engine, EngineError, EngineFactory, LoadRequest};

pub const DEFAULT_BACKEND: &str = "preview";

/// Engine factories keyed by backend name.
pub struct EngineRegistry {
    factories: HashMap<&'static str, Box<dyn EngineFactory>>,
}

impl Default for EngineRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(PreviewEngineFactory));
        registry.register(Box::new(CommandEngineFactory));
        registry
    }
}

impl EngineRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, factory: Box<dyn EngineFactory>) {
        self.factories.insert(factory.backend(), factory);
    }

    /// Load the engine named by the request's `backend` param.
    pub fn load(&self, request: &LoadRequest) -> Result<Box<dyn Engine>, EngineError> {
        let backend = request.string_param("backend").unwrap_or(DEFAULT_BACKEND);
        let factory = self
            .factories
            .get(backend)
            .ok_or_else(|| EngineError::Load(format!("unknown engine backend: {backend}")))?;
        info!(
            "[ENGINE] loading {} with {backend} backend ({} placement, {} LoRA entries)",
            request.task_type,
            request.placement.as_str(),
            request.loras.len()
        );
        factory.load(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Placement;
    use genserve_types::{Params, TaskType};
    use serde_json::json;

    #[test]
    fn unknown_backend_is_a_load_error() {
        let mut params = Params::new();
        params.insert("backend".into(), json!("tensorrt"));
        let request = LoadRequest {
            task_type: TaskType::Text2Img,
            params,
            loras: Vec::new(),
            placement: Placement::Cpu,
        };
        let err = EngineRegistry::default().load(&request).err().unwrap();
        assert!(matches!(err, EngineError::Load(ref m) if m.contains("tensorrt")));
    }

    #[test]
    fn default_backend_is_preview() {
        let mut params = Params::new();
        params.insert("model_path".into(), json!("/models/Z-Image-Turbo"));
        let request = LoadRequest {
            task_type: TaskType::Text2Img,
            params,
            loras: Vec::new(),
            placement: Placement::Cpu,
        };
        let engine = EngineRegistry::default().load(&request).unwrap();
        assert_eq!(engine.task_type(), TaskType::Text2Img);
    }
}
