//! IPC protocol types for scheduler ↔ worker communication.
//!
//! One message shape in both directions; the scheduler sends `load`, `run`,
//! `unload` and `exit`, the worker answers each of the first three with
//! exactly one `result` or `error`. `exit` gets no reply.

use genserve_types::{Params, TaskType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Load,
    Run,
    Unload,
    Exit,
    Result,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerMessage {
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<TaskType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerMessage {
    fn bare(kind: MessageKind) -> Self {
        Self {
            kind,
            task_type: None,
            params: None,
            result: None,
            error: None,
        }
    }

    pub fn load(task_type: TaskType, params: Params) -> Self {
        Self {
            task_type: Some(task_type),
            params: Some(params),
            ..Self::bare(MessageKind::Load)
        }
    }

    pub fn run(params: Params) -> Self {
        Self {
            params: Some(params),
            ..Self::bare(MessageKind::Run)
        }
    }

    pub fn unload() -> Self {
        Self::bare(MessageKind::Unload)
    }

    pub fn exit() -> Self {
        Self::bare(MessageKind::Exit)
    }

    pub fn result(value: Value) -> Self {
        Self {
            result: Some(value),
            ..Self::bare(MessageKind::Result)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::bare(MessageKind::Error)
        }
    }

    /// A reply as `Ok(result)` or `Err(message)`. Non-reply kinds are an
    /// error.
    pub fn into_reply(self) -> Result<Value, String> {
        match self.kind {
            MessageKind::Result => Ok(self.result.unwrap_or(Value::Null)),
            MessageKind::Error => Err(self
                .error
                .unwrap_or_else(|| "worker reported an unspecified error".to_string())),
            other => Err(format!("unexpected {other:?} message from worker")),
        }
    }
}
