//! Generation parameter parsing and validation shared by the engines.

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use genserve_types::{Params, TaskFamily, TaskType};
use image::DynamicImage;
use serde_json::Value;

use crate::EngineError;

pub const MIN_DIMENSION: u32 = 64;
pub const MAX_DIMENSION: u32 = 2048;
pub const DIMENSION_MULTIPLE: u32 = 16;
pub const MAX_STEPS: u32 = 200;
pub const MAX_FRAMES: u32 = 241;

pub const IMAGE_DEFAULT_STEPS: u32 = 50;
pub const IMAGE_DEFAULT_SIZE: u32 = 512;
pub const VIDEO_DEFAULT_STEPS: u32 = 4;
pub const VIDEO_DEFAULT_WIDTH: u32 = 544;
pub const VIDEO_DEFAULT_HEIGHT: u32 = 960;
pub const VIDEO_DEFAULT_FRAMES: u32 = 81;

/// A validated generation request.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub seed: u64,
    pub steps: u32,
    pub width: u32,
    pub height: u32,
    /// 1 for image tasks.
    pub num_frames: u32,
    pub output_dir: PathBuf,
    pub output_name: String,
}

impl GenerationParams {
    /// Parse `params` for `task_type`. `source` supplies the dimensions for
    /// image-conditioned image tasks that omit width/height.
    pub fn parse(
        task_type: TaskType,
        params: &Params,
        source: Option<&DynamicImage>,
    ) -> Result<Self, EngineError> {
        let prompt = params
            .get("prompt")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| EngineError::InvalidParams("prompt is required".into()))?
            .to_string();

        let negative_prompt = params
            .get("negative_prompt")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        let seed = match params.get("seed") {
            None | Some(Value::Null) => rand::random::<u32>() as u64,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| EngineError::InvalidParams(format!("seed must be a non-negative integer, got {v}")))?,
        };

        let (default_steps, default_w, default_h, default_frames) = match task_type.family() {
            TaskFamily::Image => {
                let (w, h) = source
                    .map(|img| (snap_dimension(img.width()), snap_dimension(img.height())))
                    .unwrap_or((IMAGE_DEFAULT_SIZE, IMAGE_DEFAULT_SIZE));
                (IMAGE_DEFAULT_STEPS, w, h, 1)
            }
            TaskFamily::Video => (
                VIDEO_DEFAULT_STEPS,
                VIDEO_DEFAULT_WIDTH,
                VIDEO_DEFAULT_HEIGHT,
                VIDEO_DEFAULT_FRAMES,
            ),
        };

        let steps = u32_param(params, "steps", default_steps)?;
        if !(1..=MAX_STEPS).contains(&steps) {
            return Err(EngineError::InvalidParams(format!(
                "steps must be within 1..={MAX_STEPS}, got {steps}"
            )));
        }

        let width = u32_param(params, "width", default_w)?;
        let height = u32_param(params, "height", default_h)?;
        validate_dimension("width", width)?;
        validate_dimension("height", height)?;

        let num_frames = match task_type.family() {
            TaskFamily::Image => 1,
            TaskFamily::Video => {
                let n = u32_param(params, "num_frames", default_frames)?;
                if n == 0 || n > MAX_FRAMES || (n - 1) % 4 != 0 {
                    return Err(EngineError::InvalidParams(format!(
                        "num_frames must be 4k+1 and at most {MAX_FRAMES}, got {n}"
                    )));
                }
                n
            }
        };

        let output_dir = params
            .get("output_dir")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| EngineError::InvalidParams("output_dir is required".into()))?;
        let output_name = params
            .get("output_name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_{seed}", genserve_types::current_timestamp_secs()));

        Ok(Self {
            prompt,
            negative_prompt,
            seed,
            steps,
            width,
            height,
            num_frames,
            output_dir,
            output_name,
        })
    }

    pub fn output_path(&self, extension: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}.{extension}", self.output_name))
    }
}

fn u32_param(params: &Params, key: &str, default: u32) -> Result<u32, EngineError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| EngineError::InvalidParams(format!("{key} must be a positive integer, got {v}"))),
    }
}

pub fn validate_dimension(name: &str, value: u32) -> Result<(), EngineError> {
    if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&value) || value % DIMENSION_MULTIPLE != 0 {
        return Err(EngineError::InvalidParams(format!(
            "{name} must be a multiple of {DIMENSION_MULTIPLE} within {MIN_DIMENSION}..={MAX_DIMENSION}, got {value}"
        )));
    }
    Ok(())
}

/// Round a source dimension down to the nearest valid pipeline dimension.
fn snap_dimension(value: u32) -> u32 {
    let snapped = value - value % DIMENSION_MULTIPLE;
    snapped.clamp(MIN_DIMENSION, MAX_DIMENSION)
}

/// Conditioning image for image-to-image and image-to-video tasks: either
/// base64 data under `image` (optionally a data URL) or a file under
/// `image_path`.
pub fn source_image(params: &Params) -> Result<Option<DynamicImage>, EngineError> {
    if let Some(data) = params.get("image").and_then(Value::as_str) {
        let encoded = match data.split_once(";base64,") {
            Some((_, rest)) => rest,
            None => data,
        };
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| EngineError::InvalidParams(format!("image is not valid base64: {e}")))?;
        let img = image::load_from_memory(&bytes)
            .map_err(|e| EngineError::InvalidParams(format!("image could not be decoded: {e}")))?;
        return Ok(Some(img));
    }
    if let Some(path) = params.get("image_path").and_then(Value::as_str) {
        let img = image::open(path)
            .map_err(|e| EngineError::InvalidParams(format!("failed to open {path}: {e}")))?;
        return Ok(Some(img));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        let mut map = value.as_object().cloned().unwrap();
        map.insert("output_dir".into(), json!("/tmp/out"));
        map
    }

    #[test]
    fn image_defaults_apply() {
        let parsed = GenerationParams::parse(
            TaskType::Text2Img,
            &params(json!({"prompt": "a red cube", "seed": 7})),
            None,
        )
        .unwrap();
        assert_eq!((parsed.width, parsed.height), (512, 512));
        assert_eq!(parsed.steps, 50);
        assert_eq!(parsed.num_frames, 1);
        assert_eq!(parsed.seed, 7);
    }

    #[test]
    fn video_defaults_apply() {
        let parsed = GenerationParams::parse(
            TaskType::Text2Video,
            &params(json!({"prompt": "waves"})),
            None,
        )
        .unwrap();
        assert_eq!((parsed.width, parsed.height), (544, 960));
        assert_eq!(parsed.steps, 4);
        assert_eq!(parsed.num_frames, 81);
    }

    #[test]
    fn rejects_misaligned_or_out_of_range_dimensions() {
        for width in [100, 32, 4096] {
            let err = GenerationParams::parse(
                TaskType::Text2Img,
                &params(json!({"prompt": "x", "width": width})),
                None,
            )
            .unwrap_err();
            assert!(err.to_string().contains("width"), "{err}");
        }
    }

    #[test]
    fn rejects_bad_steps_and_frames() {
        assert!(GenerationParams::parse(
            TaskType::Text2Img,
            &params(json!({"prompt": "x", "steps": 0})),
            None
        )
        .is_err());
        assert!(GenerationParams::parse(
            TaskType::Text2Video,
            &params(json!({"prompt": "x", "num_frames": 80})),
            None
        )
        .is_err());
        assert!(GenerationParams::parse(
            TaskType::Text2Video,
            &params(json!({"prompt": "x", "num_frames": 5})),
            None
        )
        .is_ok());
    }

    #[test]
    fn prompt_and_output_dir_are_required() {
        let err = GenerationParams::parse(
            TaskType::Text2Img,
            &params(json!({"prompt": "   "})),
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("prompt"));

        let mut no_dir = Params::new();
        no_dir.insert("prompt".into(), json!("x"));
        assert!(GenerationParams::parse(TaskType::Text2Img, &no_dir, None).is_err());
    }

    #[test]
    fn source_image_sets_default_dimensions() {
        let source = DynamicImage::new_rgb8(300, 200);
        let parsed = GenerationParams::parse(
            TaskType::Img2Img,
            &params(json!({"prompt": "x"})),
            Some(&source),
        )
        .unwrap();
        assert_eq!((parsed.width, parsed.height), (288, 192));
    }

    #[test]
    fn decodes_base64_source_image() {
        let mut png = Vec::new();
        DynamicImage::new_rgb8(16, 16)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let mut map = Params::new();
        map.insert(
            "image".into(),
            json!(format!("data:image/png;base64,{}", STANDARD.encode(&png))),
        );
        let img = source_image(&map).unwrap().unwrap();
        assert_eq!(img.width(), 16);

        map.insert("image".into(), json!("%%%"));
        assert!(source_image(&map).is_err());
    }
}
