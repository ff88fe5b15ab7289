//! LoRA adapter catalog (`lora_config.json`).
//!
//! The file maps a per-task-type key (see [`TaskType::catalog_key`]) to the
//! list of adapters clients may reference by id. Relative adapter paths are
//! resolved against the LoRA directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use genserve_types::{GenError, LoraConfig, ModelLoraConfig, Result, TaskType};
use log::warn;
use serde_json::Value;

pub const CATALOG_FILE_NAME: &str = "lora_config.json";

#[derive(Debug, Clone, Default)]
pub struct LoraCatalog {
    entries: BTreeMap<String, Vec<LoraConfig>>,
    raw: Value,
    lora_dir: PathBuf,
}

impl LoraCatalog {
    /// Load `lora_config.json` from `config_dir`. A missing file is an empty
    /// catalog.
    pub fn load(config_dir: &Path, lora_dir: &Path) -> Result<Self> {
        let path = config_dir.join(CATALOG_FILE_NAME);
        if !path.exists() {
            warn!("[CONFIG] LoRA catalog not found at {}", path.display());
            return Ok(Self::empty(lora_dir));
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            GenError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&raw, lora_dir)
    }

    pub fn from_json(raw: &str, lora_dir: &Path) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| GenError::Config(format!("invalid LoRA catalog: {e}")))?;
        let entries: BTreeMap<String, Vec<LoraConfig>> = serde_json::from_value(value.clone())
            .map_err(|e| GenError::Config(format!("invalid LoRA catalog entry: {e}")))?;
        Ok(Self {
            entries,
            raw: value,
            lora_dir: lora_dir.to_path_buf(),
        })
    }

    /// No catalog file: `raw()` is null.
    pub fn empty(lora_dir: &Path) -> Self {
        Self {
            entries: BTreeMap::new(),
            raw: Value::Null,
            lora_dir: lora_dir.to_path_buf(),
        }
    }

    /// The catalog as loaded, for the config endpoint.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn entries_for(&self, task_type: TaskType) -> &[LoraConfig] {
        self.entries
            .get(task_type.catalog_key())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn find(&self, task_type: TaskType, id: i64) -> Result<&LoraConfig> {
        self.entries_for(task_type)
            .iter()
            .find(|cfg| cfg.id == Some(id))
            .ok_or_else(|| {
                GenError::Validation(format!("LoRA ID {id} is not configured for {task_type}"))
            })
    }

    /// Every id must exist in the task type's catalog list.
    pub fn validate_ids(&self, task_type: TaskType, ids: &[i64]) -> Result<()> {
        for &id in ids {
            self.find(task_type, id)?;
        }
        Ok(())
    }

    /// Every file referenced by the ids must exist under the LoRA directory.
    pub fn validate_files(&self, task_type: TaskType, ids: &[i64]) -> Result<()> {
        for &id in ids {
            let cfg = self.find(task_type, id)?;
            let files = [
                ("LoRA file", cfg.path.as_deref()),
                (
                    "LoRA high-noise model file",
                    cfg.high_noise_model.as_ref().map(|m| m.path.as_str()),
                ),
                (
                    "LoRA low-noise model file",
                    cfg.low_noise_model.as_ref().map(|m| m.path.as_str()),
                ),
            ];
            for (label, rel) in files {
                let Some(rel) = rel.filter(|p| !p.is_empty()) else {
                    continue;
                };
                let full = self.lora_dir.join(rel);
                if !full.exists() {
                    return Err(GenError::Validation(format!(
                        "{label} does not exist: {}",
                        full.display()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Catalog entries selected by `ids`, in catalog order, with every path
    /// joined to the LoRA directory.
    pub fn resolve(&self, task_type: TaskType, ids: &[i64]) -> Result<Vec<LoraConfig>> {
        self.validate_ids(task_type, ids)?;
        let resolved = self
            .entries_for(task_type)
            .iter()
            .filter(|cfg| cfg.id.is_some_and(|id| ids.contains(&id)))
            .map(|cfg| {
                let mut cfg = cfg.clone();
                cfg.path = cfg.path.map(|p| self.join(&p));
                cfg.high_noise_model = cfg.high_noise_model.map(|m| self.join_model(m));
                cfg.low_noise_model = cfg.low_noise_model.map(|m| self.join_model(m));
                cfg
            })
            .collect();
        Ok(resolved)
    }

    fn join(&self, rel: &str) -> String {
        self.lora_dir.join(rel).to_string_lossy().into_owned()
    }

    fn join_model(&self, mut model: ModelLoraConfig) -> ModelLoraConfig {
        model.path = self.join(&model.path);
        model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "z_image": [
            {"id": 1, "name": "anime", "path": "anime.safetensors", "strength": 0.8},
            {"id": 2, "name": "sketch", "path": "sketch.safetensors"}
        ],
        "wan_2_2_i2v": [
            {"id": 10, "name": "motion",
             "high_noise_model": {"path": "motion_high.safetensors", "strength": 0.7},
             "low_noise_model": {"path": "motion_low.safetensors"}}
        ]
    }"#;

    #[test]
    fn unknown_id_fails_validation() {
        let catalog = LoraCatalog::from_json(CATALOG, Path::new("/loras")).unwrap();
        assert!(catalog.validate_ids(TaskType::Text2Img, &[1, 2]).is_ok());
        let err = catalog.validate_ids(TaskType::Text2Img, &[3]).unwrap_err();
        assert!(matches!(err, GenError::Validation(_)));
        // ids are scoped per task type
        assert!(catalog.validate_ids(TaskType::Img2Img, &[1]).is_err());
    }

    #[test]
    fn resolve_joins_paths_in_catalog_order() {
        let catalog = LoraCatalog::from_json(CATALOG, Path::new("/loras")).unwrap();
        let resolved = catalog.resolve(TaskType::Text2Img, &[2, 1]).unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].id, Some(1));
        assert_eq!(resolved[0].path.as_deref(), Some("/loras/anime.safetensors"));

        let video = catalog.resolve(TaskType::Img2Video, &[10]).unwrap();
        assert_eq!(
            video[0].high_noise_model.as_ref().unwrap().path,
            "/loras/motion_high.safetensors"
        );
    }

    #[test]
    fn validate_files_checks_every_referenced_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("motion_high.safetensors"), b"x").unwrap();
        let catalog = LoraCatalog::from_json(CATALOG, dir.path()).unwrap();

        let err = catalog
            .validate_files(TaskType::Img2Video, &[10])
            .unwrap_err()
            .to_string();
        assert!(err.contains("low-noise"), "{err}");

        std::fs::write(dir.path().join("motion_low.safetensors"), b"x").unwrap();
        assert!(catalog.validate_files(TaskType::Img2Video, &[10]).is_ok());
    }

    #[test]
    fn missing_file_is_an_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = LoraCatalog::load(dir.path(), Path::new("/loras")).unwrap();
        assert!(catalog.entries_for(TaskType::Text2Img).is_empty());
        assert!(catalog.raw().is_null());
    }
}
