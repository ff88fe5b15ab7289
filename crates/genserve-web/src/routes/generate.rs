// Generation task submission and result polling for both task families.

use genserve_types::{Params, TaskFamily, TaskType};
use hyper::{Body, Request, Response};
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::request_parsing::parse_json_body;
use crate::response_helpers::{
    api_error, api_gen_error, api_ok, CODE_BAD_REQUEST, CODE_NOT_FOUND,
};
use crate::SharedState;

const IMAGE_STEPS: u32 = 50;
const IMAGE_SIZE: u32 = 512;
const VIDEO_STEPS: u32 = 4;
const VIDEO_WIDTH: u32 = 544;
const VIDEO_HEIGHT: u32 = 960;
const VIDEO_FRAMES: u32 = 81;

#[derive(Debug, Default, Deserialize)]
pub struct GenerateRequest {
    pub prompt: Option<String>,
    #[serde(default)]
    pub negative_prompt: String,
    pub seed: Option<u64>,
    pub steps: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub num_frames: Option<u32>,
    /// Base64 source image (img2img).
    pub image: Option<String>,
    /// Server-side source image path (img2video).
    pub image_path: Option<String>,
    #[serde(default)]
    pub lora_ids: Vec<i64>,
}

impl GenerateRequest {
    /// Task params with defaults filled in. `Err` is the client-facing
    /// validation message.
    pub fn into_params(self, task_type: TaskType) -> Result<Params, String> {
        let prompt = self
            .prompt
            .filter(|p| !p.trim().is_empty())
            .ok_or("prompt is required")?;

        let mut params = Params::new();
        params.insert("prompt".into(), json!(prompt));
        params.insert("negative_prompt".into(), json!(self.negative_prompt));
        params.insert("seed".into(), json!(self.seed));

        match task_type {
            TaskType::Text2Img => {
                params.insert("steps".into(), json!(self.steps.unwrap_or(IMAGE_STEPS)));
                params.insert("width".into(), json!(self.width.unwrap_or(IMAGE_SIZE)));
                params.insert("height".into(), json!(self.height.unwrap_or(IMAGE_SIZE)));
            }
            TaskType::Img2Img => {
                let image = self
                    .image
                    .filter(|i| !i.is_empty())
                    .ok_or("image is required")?;
                params.insert("image".into(), json!(image));
                params.insert("steps".into(), json!(self.steps.unwrap_or(IMAGE_STEPS)));
                // output size follows the source image unless given
                if let Some(width) = self.width {
                    params.insert("width".into(), json!(width));
                }
                if let Some(height) = self.height {
                    params.insert("height".into(), json!(height));
                }
            }
            TaskType::Text2Video | TaskType::Img2Video => {
                if task_type == TaskType::Img2Video {
                    let image_path = self
                        .image_path
                        .filter(|p| !p.is_empty())
                        .ok_or("image_path is required")?;
                    params.insert("image_path".into(), json!(image_path));
                }
                params.insert("steps".into(), json!(self.steps.unwrap_or(VIDEO_STEPS)));
                params.insert("width".into(), json!(self.width.unwrap_or(VIDEO_WIDTH)));
                params.insert("height".into(), json!(self.height.unwrap_or(VIDEO_HEIGHT)));
                params.insert(
                    "num_frames".into(),
                    json!(self.num_frames.unwrap_or(VIDEO_FRAMES)),
                );
            }
        }

        if !self.lora_ids.is_empty() {
            params.insert("lora_ids".into(), json!(self.lora_ids));
        }
        Ok(params)
    }
}

pub async fn create(req: Request<Body>, state: SharedState, task_type: TaskType) -> Response<Body> {
    let body: GenerateRequest = match parse_json_body(req.into_body()).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    let lora_ids = body.lora_ids.clone();
    let params = match body.into_params(task_type) {
        Ok(params) => params,
        Err(msg) => return api_error(CODE_BAD_REQUEST, msg),
    };

    if !lora_ids.is_empty() {
        let checked = state
            .catalog
            .validate_ids(task_type, &lora_ids)
            .and_then(|()| state.catalog.validate_files(task_type, &lora_ids));
        if let Err(e) = checked {
            return api_gen_error("validate LoRA", &e);
        }
    }

    match state.tasks.create_typed(task_type, params) {
        Ok(task_id) => {
            info!("[API] {task_type} task {task_id} submitted");
            api_ok(&format!("{task_type} request submitted"), json!({ "task_id": task_id }))
        }
        Err(e) => api_gen_error(&format!("submit {task_type} task"), &e),
    }
}

/// Status, result and error of a task of the given family.
pub fn result(state: &SharedState, family: TaskFamily, task_id: &str) -> Response<Body> {
    match state.tasks.get_task(task_id) {
        Ok(Some(task)) if task.task_type.family() == family => api_ok(
            "task result",
            json!({
                "task_id": task.task_id,
                "status": task.status,
                "result": task.result.unwrap_or(Value::Null),
                "error": task.error,
            }),
        ),
        Ok(_) => api_error(CODE_NOT_FOUND, "task not found"),
        Err(e) => api_gen_error("get task result", &e),
    }
}
