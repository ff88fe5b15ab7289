use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use genserve_types::{GenError, Params, Result, TaskFamily, TaskType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Which engine implementation the worker instantiates for a task type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineBackend {
    /// Built-in deterministic renderer.
    #[default]
    Preview,
    /// External pipeline runner spoken to over JSON lines.
    Command,
}

impl EngineBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineBackend::Preview => "preview",
            EngineBackend::Command => "command",
        }
    }
}

/// Per-task-type engine settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub backend: EngineBackend,
    /// Weights directory; defaults to a per-type folder under `model_dir`.
    pub model_path: Option<PathBuf>,
    /// Pipeline config file (video pipelines only).
    pub model_config_path: Option<PathBuf>,
    /// Runner argv for the `command` backend.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub load_timeout_secs: u64,
    pub run_timeout_secs: u64,
    /// Wait for the worker's reply to `unload`.
    pub unload_timeout_secs: u64,
    pub exit_timeout_secs: u64,
    pub kill_timeout_secs: u64,
    pub max_load_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            load_timeout_secs: 600,
            run_timeout_secs: 600,
            unload_timeout_secs: 60,
            exit_timeout_secs: 5,
            kill_timeout_secs: 3,
            max_load_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    pub poll_interval_ms: u64,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_multiplier: f64,
    pub reconnect_max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "ai_task_queue".to_string(),
            poll_interval_ms: 500,
            reconnect_initial_delay_ms: 2000,
            reconnect_multiplier: 1.5,
            reconnect_max_attempts: 5,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// How the scheduler launches worker processes. Empty `program` means the
/// running executable with `args` (default `["worker"]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerLaunchConfig {
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
}

impl Default for WorkerLaunchConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: vec!["worker".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub login_password: String,
    pub model_dir: PathBuf,
    pub lora_dir: PathBuf,
    pub file_save_dir: PathBuf,
    pub config_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub wan_config_dir: Option<PathBuf>,
    pub db_path: String,
    pub log_level: String,
    pub log_dir: PathBuf,
    pub cpu_offload_threshold_gib: f64,
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
    pub worker: WorkerLaunchConfig,
    pub engines: BTreeMap<TaskType, EngineSettings>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            login_password: "default-password".to_string(),
            model_dir: PathBuf::from("/models"),
            lora_dir: PathBuf::from("/loras"),
            file_save_dir: PathBuf::from("/files"),
            config_dir: PathBuf::from("config"),
            upload_dir: PathBuf::from("uploads"),
            wan_config_dir: None,
            db_path: "genserve.db".to_string(),
            log_level: "info".to_string(),
            log_dir: PathBuf::from("logs"),
            cpu_offload_threshold_gib: 32.0,
            scheduler: SchedulerConfig::default(),
            queue: QueueConfig::default(),
            worker: WorkerLaunchConfig::default(),
            engines: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Load from an optional JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GenError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| GenError::Config(format!("invalid config {}: {e}", path.display())))
    }

    /// Override fields from environment variables, read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HOST") {
            self.host = v;
        }
        if let Some(v) = lookup("PORT") {
            self.port = v
                .parse()
                .map_err(|_| GenError::Config(format!("PORT is not a valid port: {v}")))?;
        }
        if let Some(v) = lookup("LOGIN_PASSWORD") {
            self.login_password = v;
        }
        let paths: [(&str, &mut PathBuf); 6] = [
            ("MODEL_DIR", &mut self.model_dir),
            ("LORA_DIR", &mut self.lora_dir),
            ("FILE_SAVE_DIR", &mut self.file_save_dir),
            ("CONFIG_DIR", &mut self.config_dir),
            ("UPLOAD_DIR", &mut self.upload_dir),
            ("GENSERVE_LOG_DIR", &mut self.log_dir),
        ];
        for (key, slot) in paths {
            if let Some(v) = lookup(key) {
                *slot = PathBuf::from(v);
            }
        }
        if let Some(v) = lookup("WAN_MODEL_CONFIG_DIR") {
            self.wan_config_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("GENSERVE_DB_PATH") {
            self.db_path = v;
        }
        if let Some(v) = lookup("GENSERVE_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = lookup("GENSERVE_QUEUE_NAME") {
            self.queue.name = v;
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn engine(&self, task_type: TaskType) -> EngineSettings {
        self.engines.get(&task_type).cloned().unwrap_or_default()
    }

    /// Weights location for a task type.
    pub fn model_path(&self, task_type: TaskType) -> PathBuf {
        if let Some(path) = self.engine(task_type).model_path {
            return path;
        }
        let dir = match task_type {
            TaskType::Text2Img => "Z-Image-Turbo",
            TaskType::Img2Img => "Qwen-Image-Edit-2509-4bit",
            TaskType::Text2Video => "Wan2.1-Distill-Models",
            TaskType::Img2Video => "Wan2.2-Distill-Models",
        };
        self.model_dir.join(dir)
    }

    /// Pipeline config file for video task types.
    pub fn model_config_path(&self, task_type: TaskType) -> Option<PathBuf> {
        if let Some(path) = self.engine(task_type).model_config_path {
            return Some(path);
        }
        let wan_dir = self
            .wan_config_dir
            .clone()
            .unwrap_or_else(|| self.config_dir.join("wan"));
        match task_type {
            TaskType::Text2Video => Some(wan_dir.join("wan_t2v_distill_4step_cfg.json")),
            TaskType::Img2Video => Some(wan_dir.join("wan_moe_i2v_distill.json")),
            _ => None,
        }
    }

    /// Output directory for a task type's artifacts.
    pub fn output_dir(&self, task_type: TaskType) -> PathBuf {
        let family = match task_type.family() {
            TaskFamily::Image => "images",
            TaskFamily::Video => "videos",
        };
        self.file_save_dir.join(family).join(task_type.as_str())
    }

    /// Model-load parameters sent to the worker for a task type.
    pub fn engine_params(&self, task_type: TaskType) -> Params {
        let settings = self.engine(task_type);
        let mut params = Params::new();
        params.insert("backend".into(), json!(settings.backend.as_str()));
        params.insert(
            "model_path".into(),
            json!(self.model_path(task_type).to_string_lossy()),
        );
        if let Some(path) = self.model_config_path(task_type) {
            params.insert("model_config_path".into(), json!(path.to_string_lossy()));
        }
        if !settings.command.is_empty() {
            params.insert("command".into(), json!(settings.command));
        }
        params.insert(
            "cpu_offload_threshold_gib".into(),
            Value::from(self.cpu_offload_threshold_gib),
        );
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_deployment_values() {
        let config = AppConfig::default();
        assert_eq!(config.port, 5000);
        assert_eq!(config.queue.name, "ai_task_queue");
        assert_eq!(config.scheduler.max_load_attempts, 2);
        assert_eq!(config.cpu_offload_threshold_gib, 32.0);
    }

    #[test]
    fn env_overrides_replace_fields() {
        let mut config = AppConfig::default();
        config
            .apply_env(lookup_from(&[
                ("PORT", "8080"),
                ("MODEL_DIR", "/data/models"),
                ("GENSERVE_DB_PATH", "/tmp/x.db"),
            ]))
            .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.model_dir, PathBuf::from("/data/models"));
        assert_eq!(config.db_path, "/tmp/x.db");
        assert_eq!(
            config.model_path(TaskType::Text2Img),
            PathBuf::from("/data/models/Z-Image-Turbo")
        );
    }

    #[test]
    fn invalid_port_is_a_config_error() {
        let mut config = AppConfig::default();
        let err = config.apply_env(lookup_from(&[("PORT", "http")])).unwrap_err();
        assert!(matches!(err, GenError::Config(_)));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{"port": 7000, "engines": {"text2video": {"backend": "command", "command": ["python", "run.py"]}}}"#,
        )
        .unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.engine(TaskType::Text2Video).backend, EngineBackend::Command);
        assert_eq!(config.engine(TaskType::Text2Img).backend, EngineBackend::Preview);
    }

    #[test]
    fn engine_params_carry_backend_and_paths() {
        let config = AppConfig::default();
        let params = config.engine_params(TaskType::Img2Video);
        assert_eq!(params["backend"], "preview");
        assert!(params["model_config_path"]
            .as_str()
            .unwrap()
            .ends_with("wan_moe_i2v_distill.json"));
        assert!(!config.engine_params(TaskType::Text2Img).contains_key("model_config_path"));
    }
}
