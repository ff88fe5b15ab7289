//! Built-in deterministic renderer.
//!
//! Validates requests the way a diffusion pipeline does and renders a
//! gradient/ripple pattern derived from the prompt, seed and attached
//! adapters: a PNG for image tasks, an animated GIF for video tasks.
//! Identical inputs always produce identical pixels.

use std::collections::hash_map::DefaultHasher;
use std::f32::consts::TAU;
use std::fs::{self, File};
use std::hash::{Hash, Hasher};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use genserve_types::{LoraSignature, ModelLoraConfig, Params, TaskFamily, TaskType};
use image::codecs::gif::{GifEncoder, Repeat};
use image::imageops::FilterType;
use image::{Delay, DynamicImage, Frame, Rgb, RgbImage, RgbaImage};
use log::{debug, info, warn};
use serde_json::{json, Value};

use crate::params::{source_image, GenerationParams};
use crate::{Engine, EngineError, EngineFactory, LoadRequest, Placement};

pub const PREVIEW_FPS: u32 = 16;

/// How much of the conditioning image survives in the output.
const SOURCE_WEIGHT: f32 = 0.65;

pub struct PreviewEngineFactory;

impl EngineFactory for PreviewEngineFactory {
    fn backend(&self) -> &'static str {
        "preview"
    }

    fn load(&self, request: &LoadRequest) -> Result<Box<dyn Engine>, EngineError> {
        let model_path = request
            .string_param("model_path")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| EngineError::Load(format!("model_path is required for {}", request.task_type)))?;
        if !model_path.exists() {
            debug!(
                "[ENGINE] preview renderer has no weights; {} not present",
                model_path.display()
            );
        }

        let mut engine = PreviewEngine {
            task_type: request.task_type,
            model_path,
            placement: request.placement,
            loras: Vec::new(),
        };
        // video pipelines take their adapters at construction time
        engine.attach_loras(&request.flat_loras())?;
        Ok(Box::new(engine))
    }
}

pub struct PreviewEngine {
    task_type: TaskType,
    model_path: PathBuf,
    placement: Placement,
    loras: Vec<ModelLoraConfig>,
}

impl PreviewEngine {
    fn palette(&self, params: &GenerationParams) -> Palette {
        let mut hasher = DefaultHasher::new();
        params.prompt.hash(&mut hasher);
        params.negative_prompt.hash(&mut hasher);
        params.seed.hash(&mut hasher);
        for lora in &self.loras {
            lora.path.hash(&mut hasher);
            lora.effective_strength().to_bits().hash(&mut hasher);
        }
        Palette::from_hash(hasher.finish(), params.steps)
    }

    fn render_image(&self, params: &GenerationParams, source: Option<&DynamicImage>) -> Result<Value, EngineError> {
        let palette = self.palette(params);
        let source = source.map(|img| conditioning(img, params));
        let frame = render_frame(&palette, params.width, params.height, 0.0, source.as_ref());

        let path = params.output_path("png");
        ensure_parent(&path)?;
        frame
            .save(&path)
            .map_err(|e| EngineError::Inference(format!("failed to write {}: {e}", path.display())))?;

        Ok(json!({
            "image_path": path.to_string_lossy(),
            "width": params.width,
            "height": params.height,
            "seed": params.seed,
            "steps": params.steps,
            "placement": self.placement.as_str(),
        }))
    }

    fn render_video(&self, params: &GenerationParams, source: Option<&DynamicImage>) -> Result<Value, EngineError> {
        let palette = self.palette(params);
        let source = source.map(|img| conditioning(img, params));

        let path = params.output_path("gif");
        ensure_parent(&path)?;
        let file = File::create(&path)
            .map_err(|e| EngineError::Inference(format!("failed to create {}: {e}", path.display())))?;
        let mut encoder = GifEncoder::new_with_speed(BufWriter::new(file), 20);
        encoder
            .set_repeat(Repeat::Infinite)
            .map_err(|e| EngineError::Inference(format!("gif encoder: {e}")))?;

        let delay = Delay::from_numer_denom_ms(1000, PREVIEW_FPS);
        for i in 0..params.num_frames {
            let phase = i as f32 / params.num_frames as f32;
            let rgb = render_frame(&palette, params.width, params.height, phase, source.as_ref());
            let rgba: RgbaImage = DynamicImage::ImageRgb8(rgb).to_rgba8();
            encoder
                .encode_frame(Frame::from_parts(rgba, 0, 0, delay))
                .map_err(|e| EngineError::Inference(format!("failed to encode frame {i}: {e}")))?;
        }

        Ok(json!({
            "video_path": path.to_string_lossy(),
            "width": params.width,
            "height": params.height,
            "num_frames": params.num_frames,
            "fps": PREVIEW_FPS,
            "seed": params.seed,
            "steps": params.steps,
            "placement": self.placement.as_str(),
        }))
    }
}

impl Engine for PreviewEngine {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    fn run(&mut self, params: &Params) -> Result<Value, EngineError> {
        let source = source_image(params)?;
        if self.task_type.needs_source_image() && source.is_none() {
            return Err(EngineError::InvalidParams(format!(
                "{} requires an input image",
                self.task_type
            )));
        }
        let parsed = GenerationParams::parse(self.task_type, params, source.as_ref())?;
        info!(
            "[ENGINE] rendering {} {}x{} steps={} frames={} seed={}",
            self.task_type, parsed.width, parsed.height, parsed.steps, parsed.num_frames, parsed.seed
        );
        match self.task_type.family() {
            TaskFamily::Image => self.render_image(&parsed, source.as_ref()),
            TaskFamily::Video => self.render_video(&parsed, source.as_ref()),
        }
    }

    fn attach_loras(&mut self, loras: &[ModelLoraConfig]) -> Result<(), EngineError> {
        for lora in loras {
            if lora.path.is_empty() {
                return Err(EngineError::Load("LoRA entry has an empty path".into()));
            }
            if !Path::new(&lora.path).exists() {
                warn!("[ENGINE] LoRA file {} not found; preview applies it by name only", lora.path);
            }
        }
        self.loras.extend_from_slice(loras);
        Ok(())
    }

    fn detach_loras(&mut self) -> Result<(), EngineError> {
        self.loras.clear();
        Ok(())
    }

    fn attached_loras(&self) -> LoraSignature {
        LoraSignature::from_flat(&self.loras)
    }

    fn unload(&mut self) -> Result<(), EngineError> {
        debug!("[ENGINE] releasing preview engine for {}", self.model_path.display());
        self.loras.clear();
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            EngineError::Inference(format!("failed to create {}: {e}", parent.display()))
        })?;
    }
    Ok(())
}

fn conditioning(img: &DynamicImage, params: &GenerationParams) -> RgbImage {
    img.resize_exact(params.width, params.height, FilterType::Triangle)
        .to_rgb8()
}

struct Palette {
    from: [f32; 3],
    to: [f32; 3],
    angle: f32,
    frequency: f32,
    amplitude: f32,
}

impl Palette {
    fn from_hash(hash: u64, steps: u32) -> Self {
        let byte = |i: u32| ((hash >> (i * 8)) & 0xff) as f32;
        Self {
            from: [byte(0), byte(1), byte(2)],
            to: [byte(3), byte(4), byte(5)],
            angle: byte(6) / 255.0 * TAU,
            // more denoising steps, finer detail
            frequency: 2.0 + (steps.min(200) as f32).sqrt(),
            amplitude: 12.0 + byte(7) / 255.0 * 24.0,
        }
    }
}

fn render_frame(
    palette: &Palette,
    width: u32,
    height: u32,
    phase: f32,
    source: Option<&RgbImage>,
) -> RgbImage {
    let (sin_a, cos_a) = palette.angle.sin_cos();
    RgbImage::from_fn(width, height, |x, y| {
        let u = x as f32 / width as f32;
        let v = y as f32 / height as f32;
        let t = ((u - 0.5) * cos_a + (v - 0.5) * sin_a + 0.5).clamp(0.0, 1.0);
        let ripple = ((u + v) * palette.frequency * TAU + phase * TAU).sin() * palette.amplitude;

        let mut px = [0u8; 3];
        for c in 0..3 {
            let mut value = palette.from[c] + (palette.to[c] - palette.from[c]) * t + ripple;
            if let Some(src) = source {
                value = src.get_pixel(x, y)[c] as f32 * SOURCE_WEIGHT + value * (1.0 - SOURCE_WEIGHT);
            }
            px[c] = value.clamp(0.0, 255.0) as u8;
        }
        Rgb(px)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn load(task_type: TaskType, loras: Vec<genserve_types::LoraConfig>) -> Box<dyn Engine> {
        let mut params = Params::new();
        params.insert("model_path".into(), json!("/models/preview"));
        PreviewEngineFactory
            .load(&LoadRequest {
                task_type,
                params,
                loras,
                placement: Placement::Cpu,
            })
            .unwrap()
    }

    fn run_params(dir: &Path, extra: Value) -> Params {
        let mut params = extra.as_object().cloned().unwrap();
        params.insert("output_dir".into(), json!(dir.to_string_lossy()));
        params.insert("output_name".into(), json!("out"));
        params
    }

    #[test]
    fn missing_model_path_fails_load() {
        let err = PreviewEngineFactory
            .load(&LoadRequest {
                task_type: TaskType::Text2Img,
                params: Params::new(),
                loras: Vec::new(),
                placement: Placement::Cpu,
            })
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Load(_)));
    }

    #[test]
    fn text2img_writes_png_with_requested_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = load(TaskType::Text2Img, Vec::new());
        let result = engine
            .run(&run_params(
                dir.path(),
                json!({"prompt": "a red cube", "width": 64, "height": 96, "steps": 9, "seed": 1}),
            ))
            .unwrap();

        let path = result["image_path"].as_str().unwrap();
        assert!(path.ends_with("out.png"));
        let img = image::open(path).unwrap();
        assert_eq!((img.width(), img.height()), (64, 96));
    }

    #[test]
    fn same_inputs_render_same_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = load(TaskType::Text2Img, Vec::new());
        let base = json!({"prompt": "a red cube", "width": 64, "height": 64, "seed": 42, "steps": 4});

        let first = engine.run(&run_params(dir.path(), base.clone())).unwrap();
        let first = image::open(first["image_path"].as_str().unwrap()).unwrap().to_rgb8();
        let second = engine.run(&run_params(dir.path(), base)).unwrap();
        let second = image::open(second["image_path"].as_str().unwrap()).unwrap().to_rgb8();
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_dimensions_fail_inference() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = load(TaskType::Text2Img, Vec::new());
        let err = engine
            .run(&run_params(dir.path(), json!({"prompt": "x", "width": 100})))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidParams(_)));
    }

    #[test]
    fn img2img_requires_a_source_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = load(TaskType::Img2Img, Vec::new());
        let err = engine
            .run(&run_params(dir.path(), json!({"prompt": "x"})))
            .unwrap_err();
        assert!(err.to_string().contains("input image"));
    }

    #[test]
    fn img2video_animates_the_source_image() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.png");
        DynamicImage::new_rgb8(64, 64).save(&source).unwrap();

        let mut engine = load(TaskType::Img2Video, Vec::new());
        let result = engine
            .run(&run_params(
                dir.path(),
                json!({"prompt": "pan left", "image_path": source.to_string_lossy(),
                       "width": 64, "height": 64, "num_frames": 5, "seed": 3}),
            ))
            .unwrap();
        assert_eq!(result["num_frames"], 5);
        let path = PathBuf::from(result["video_path"].as_str().unwrap());
        assert_eq!(path.extension().unwrap(), "gif");
        assert!(fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn lora_swap_replaces_attached_set() {
        let lora = genserve_types::LoraConfig {
            id: Some(1),
            path: Some("/loras/a.safetensors".into()),
            strength: Some(0.7),
            ..Default::default()
        };
        let mut engine = load(TaskType::Text2Video, vec![lora.clone()]);
        assert_eq!(
            engine.attached_loras(),
            LoraSignature::from_configs(Some(&[lora]))
        );

        engine.detach_loras().unwrap();
        assert!(engine.attached_loras().is_empty());
        engine.unload().unwrap();
    }
}
