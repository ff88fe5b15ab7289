use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::GenError;

/// Free-form generation parameters, as submitted by the client.
pub type Params = Map<String, Value>;

/// The four supported generation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Text2Img,
    Img2Img,
    Text2Video,
    Img2Video,
}

/// Output family of a task type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFamily {
    Image,
    Video,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::Text2Img,
        TaskType::Img2Img,
        TaskType::Text2Video,
        TaskType::Img2Video,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Text2Img => "text2img",
            TaskType::Img2Img => "img2img",
            TaskType::Text2Video => "text2video",
            TaskType::Img2Video => "img2video",
        }
    }

    pub fn family(&self) -> TaskFamily {
        match self {
            TaskType::Text2Img | TaskType::Img2Img => TaskFamily::Image,
            TaskType::Text2Video | TaskType::Img2Video => TaskFamily::Video,
        }
    }

    /// Key of this task type's adapter list in the LoRA catalog.
    pub fn catalog_key(&self) -> &'static str {
        match self {
            TaskType::Text2Img => "z_image",
            TaskType::Img2Img => "qwen_image_edit",
            TaskType::Text2Video => "wan_2_1_t2v",
            TaskType::Img2Video => "wan_2_2_i2v",
        }
    }

    /// Whether the task needs a source image in its params.
    pub fn needs_source_image(&self) -> bool {
        matches!(self, TaskType::Img2Img | TaskType::Img2Video)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = GenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| GenError::Validation(format!("unsupported task type: {s}")))
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Forward transitions: pending -> processing -> completed | failed.
    /// Re-entering `pending` is only possible through an explicit requeue.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Processing, Completed) | (Processing, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = GenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(GenError::Validation(format!("unknown task status: {other}"))),
        }
    }
}

/// Persisted state of one generation task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub params: Params,
    pub status: TaskStatus,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub render_start_time: Option<f64>,
    #[serde(default)]
    pub render_end_time: Option<f64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskRecord {
    /// A fresh pending task with a new UUID.
    pub fn new(task_type: TaskType, params: Params) -> Self {
        let now = crate::current_timestamp_secs();
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            task_type,
            params,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            render_start_time: None,
            render_end_time: None,
            result: None,
            error: None,
        }
    }

    /// Elapsed render time in seconds, once both marks are set.
    pub fn render_duration(&self) -> Option<f64> {
        match (self.render_start_time, self.render_end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// One page of the task listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPage {
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub tasks: Vec<TaskRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_type_parses_wire_names() {
        assert_eq!("img2video".parse::<TaskType>().unwrap(), TaskType::Img2Video);
        assert_eq!(TaskType::Text2Img.to_string(), "text2img");
        assert_eq!(
            serde_json::to_value(TaskType::Text2Video).unwrap(),
            json!("text2video")
        );
    }

    #[test]
    fn unknown_task_type_is_a_validation_error() {
        let err = "bogus".parse::<TaskType>().unwrap_err();
        assert!(matches!(err, GenError::Validation(_)));
    }

    #[test]
    fn families_split_image_and_video() {
        assert_eq!(TaskType::Img2Img.family(), TaskFamily::Image);
        assert_eq!(TaskType::Text2Video.family(), TaskFamily::Video);
        assert!(TaskType::Img2Video.needs_source_image());
        assert!(!TaskType::Text2Img.needs_source_image());
    }

    #[test]
    fn status_transitions_follow_lifecycle() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Completed));
    }

    #[test]
    fn new_record_is_pending_with_equal_timestamps() {
        let record = TaskRecord::new(TaskType::Text2Img, Params::new());
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.created_at, record.updated_at);
        assert!(record.result.is_none() && record.error.is_none());
        assert!(uuid::Uuid::parse_str(&record.task_id).is_ok());
    }

    #[test]
    fn record_without_optional_fields_deserializes() {
        let record: TaskRecord = serde_json::from_value(json!({
            "task_id": "abc",
            "task_type": "text2img",
            "status": "pending",
            "created_at": 1,
            "updated_at": 1
        }))
        .unwrap();
        assert!(record.params.is_empty());
        assert!(record.render_start_time.is_none());
        assert!(record.render_duration().is_none());
    }
}
