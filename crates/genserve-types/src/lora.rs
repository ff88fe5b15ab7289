use std::fmt;

use serde::{Deserialize, Serialize};

/// Strength applied when a catalog entry leaves it unset.
pub const DEFAULT_LORA_STRENGTH: f64 = 1.0;

/// One adapter file attached to one model of a (possibly dual) pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelLoraConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
}

impl ModelLoraConfig {
    pub fn effective_strength(&self) -> f64 {
        self.strength.unwrap_or(DEFAULT_LORA_STRENGTH)
    }
}

/// A LoRA catalog entry.
///
/// Single-model pipelines use `path`; dual-expert video pipelines use the
/// `high_noise_model` / `low_noise_model` pair. An entry may carry both.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LoraConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_noise_model: Option<ModelLoraConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_noise_model: Option<ModelLoraConfig>,
}

/// Flatten catalog entries into the ordered adapter list an engine attaches:
/// per entry, high-noise first, then low-noise, then its own `path`.
pub fn flatten_loras(configs: &[LoraConfig]) -> Vec<ModelLoraConfig> {
    let mut flat = Vec::new();
    for cfg in configs {
        if let Some(high) = &cfg.high_noise_model {
            flat.push(ModelLoraConfig {
                name: Some("high_noise_model".to_string()),
                ..high.clone()
            });
        }
        if let Some(low) = &cfg.low_noise_model {
            flat.push(ModelLoraConfig {
                name: Some("low_noise_model".to_string()),
                ..low.clone()
            });
        }
        if let Some(path) = cfg.path.as_deref().filter(|p| !p.is_empty()) {
            flat.push(ModelLoraConfig {
                name: cfg.name.clone(),
                path: path.to_string(),
                strength: cfg.strength,
            });
        }
    }
    flat
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub path: String,
    pub strength: f64,
}

/// Canonical identity of an adapter set, used for cache-hit decisions.
///
/// The ordered list of (resolved path, effective strength) pairs of the
/// flattened configs. Names do not participate; no adapters and an empty
/// adapter list are the same signature.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LoraSignature(Vec<SignatureEntry>);

impl LoraSignature {
    pub fn from_configs(configs: Option<&[LoraConfig]>) -> Self {
        Self::from_flat(&flatten_loras(configs.unwrap_or_default()))
    }

    pub fn from_flat(flat: &[ModelLoraConfig]) -> Self {
        LoraSignature(
            flat.iter()
                .map(|l| SignatureEntry {
                    path: l.path.clone(),
                    strength: l.effective_strength(),
                })
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> &[SignatureEntry] {
        &self.0
    }
}

impl fmt::Display for LoraSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("[]");
        }
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|e| format!("{}@{}", e.path, e.strength))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(path: &str, strength: Option<f64>) -> LoraConfig {
        LoraConfig {
            id: Some(1),
            name: Some("style".into()),
            path: Some(path.into()),
            strength,
            ..Default::default()
        }
    }

    #[test]
    fn none_and_empty_are_the_same_signature() {
        assert_eq!(
            LoraSignature::from_configs(None),
            LoraSignature::from_configs(Some(&[]))
        );
        assert!(LoraSignature::from_configs(None).is_empty());
    }

    #[test]
    fn missing_strength_defaults_to_one() {
        assert_eq!(
            LoraSignature::from_configs(Some(&[single("/l/a.safetensors", None)])),
            LoraSignature::from_configs(Some(&[single("/l/a.safetensors", Some(1.0))]))
        );
    }

    #[test]
    fn names_do_not_affect_identity() {
        let mut renamed = single("/l/a.safetensors", Some(0.8));
        renamed.name = Some("other".into());
        assert_eq!(
            LoraSignature::from_configs(Some(&[single("/l/a.safetensors", Some(0.8))])),
            LoraSignature::from_configs(Some(&[renamed]))
        );
    }

    #[test]
    fn strength_and_order_matter() {
        let a = single("/l/a.safetensors", Some(0.8));
        let b = single("/l/b.safetensors", None);
        assert_ne!(
            LoraSignature::from_configs(Some(&[a.clone()])),
            LoraSignature::from_configs(Some(&[single("/l/a.safetensors", Some(0.5))]))
        );
        assert_ne!(
            LoraSignature::from_configs(Some(&[a.clone(), b.clone()])),
            LoraSignature::from_configs(Some(&[b, a]))
        );
    }

    #[test]
    fn dual_expert_entries_flatten_high_then_low() {
        let cfg = LoraConfig {
            id: Some(7),
            high_noise_model: Some(ModelLoraConfig {
                name: None,
                path: "/l/high.safetensors".into(),
                strength: Some(0.6),
            }),
            low_noise_model: Some(ModelLoraConfig {
                name: None,
                path: "/l/low.safetensors".into(),
                strength: None,
            }),
            ..Default::default()
        };
        let flat = flatten_loras(&[cfg]);
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0].name.as_deref(), Some("high_noise_model"));
        assert_eq!(flat[1].path, "/l/low.safetensors");
        assert_eq!(flat[1].effective_strength(), 1.0);
    }
}
