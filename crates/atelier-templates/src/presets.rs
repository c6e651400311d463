use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::calculators::{apply_category_calculator, canonical_category};
use crate::model::Template;
use crate::PresetError;

pub const QUALITY_SIDECAR_KEY: &str = "_quality";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    Draft,
    Standard,
    High,
    Ultra,
}

impl QualityLevel {
    pub fn rank(self) -> u8 {
        match self {
            QualityLevel::Draft => 1,
            QualityLevel::Standard => 2,
            QualityLevel::High => 3,
            QualityLevel::Ultra => 4,
        }
    }

    pub fn priority(self) -> &'static str {
        match self {
            QualityLevel::Draft => "low",
            QualityLevel::Standard => "normal",
            QualityLevel::High => "high",
            QualityLevel::Ultra => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityPreset {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub level: QualityLevel,
    #[serde(default)]
    pub is_custom: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_preset: Option<String>,
    #[serde(default = "one")]
    pub time_multiplier: f64,
    #[serde(default = "one")]
    pub resource_multiplier: f64,
    #[serde(default = "one")]
    pub cost_multiplier: f64,
    /// Category key (`image_generation`, ...) → parameter overlay.
    #[serde(default)]
    pub parameters: HashMap<String, Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_count: u64,
}

fn one() -> f64 {
    1.0
}

fn overlay(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

pub fn builtin_presets() -> Vec<QualityPreset> {
    vec![
        QualityPreset {
            id: "draft".to_string(),
            name: "Draft".to_string(),
            description: "Fast generation for previews and iterations".to_string(),
            level: QualityLevel::Draft,
            is_custom: false,
            base_preset: None,
            time_multiplier: 0.3,
            resource_multiplier: 0.5,
            cost_multiplier: 0.25,
            parameters: HashMap::from([
                (
                    "image_generation".to_string(),
                    overlay(&[
                        ("steps", json!(15)),
                        ("cfg_scale", json!(7.0)),
                        ("sampler", json!("euler")),
                        ("resolution_scale", json!(0.75)),
                    ]),
                ),
                (
                    "video_generation".to_string(),
                    overlay(&[
                        ("fps", json!(12)),
                        ("frames", json!(24)),
                        ("resolution_scale", json!(0.5)),
                        ("motion_quality", json!("low")),
                    ]),
                ),
                (
                    "audio_generation".to_string(),
                    overlay(&[
                        ("sample_rate", json!(22050)),
                        ("bitrate", json!(128)),
                        ("processing_quality", json!("fast")),
                    ]),
                ),
            ]),
            created_by: None,
            created_at: None,
            usage_count: 0,
        },
        QualityPreset {
            id: "standard".to_string(),
            name: "Standard".to_string(),
            description: "Balanced quality and speed for most use cases".to_string(),
            level: QualityLevel::Standard,
            is_custom: false,
            base_preset: None,
            time_multiplier: 1.0,
            resource_multiplier: 1.0,
            cost_multiplier: 1.0,
            parameters: HashMap::from([
                (
                    "image_generation".to_string(),
                    overlay(&[
                        ("steps", json!(30)),
                        ("cfg_scale", json!(7.5)),
                        ("sampler", json!("dpm++_2m")),
                        ("resolution_scale", json!(1.0)),
                    ]),
                ),
                (
                    "video_generation".to_string(),
                    overlay(&[
                        ("fps", json!(24)),
                        ("frames", json!(48)),
                        ("resolution_scale", json!(1.0)),
                        ("motion_quality", json!("medium")),
                    ]),
                ),
                (
                    "audio_generation".to_string(),
                    overlay(&[
                        ("sample_rate", json!(44100)),
                        ("bitrate", json!(192)),
                        ("processing_quality", json!("balanced")),
                    ]),
                ),
            ]),
            created_by: None,
            created_at: None,
            usage_count: 0,
        },
        QualityPreset {
            id: "high".to_string(),
            name: "High Quality".to_string(),
            description: "Enhanced quality for professional use".to_string(),
            level: QualityLevel::High,
            is_custom: false,
            base_preset: None,
            time_multiplier: 2.5,
            resource_multiplier: 1.5,
            cost_multiplier: 2.0,
            parameters: HashMap::from([
                (
                    "image_generation".to_string(),
                    overlay(&[
                        ("steps", json!(50)),
                        ("cfg_scale", json!(8.0)),
                        ("sampler", json!("dpm++_2m_karras")),
                        ("resolution_scale", json!(1.0)),
                        ("enable_hr_fix", json!(true)),
                        ("hr_scale", json!(2.0)),
                    ]),
                ),
                (
                    "video_generation".to_string(),
                    overlay(&[
                        ("fps", json!(30)),
                        ("frames", json!(90)),
                        ("resolution_scale", json!(1.0)),
                        ("motion_quality", json!("high")),
                        ("interpolation", json!(true)),
                    ]),
                ),
                (
                    "audio_generation".to_string(),
                    overlay(&[
                        ("sample_rate", json!(48000)),
                        ("bitrate", json!(256)),
                        ("processing_quality", json!("high")),
                        ("enable_enhancement", json!(true)),
                    ]),
                ),
            ]),
            created_by: None,
            created_at: None,
            usage_count: 0,
        },
        QualityPreset {
            id: "ultra".to_string(),
            name: "Ultra Quality".to_string(),
            description: "Maximum quality for final production".to_string(),
            level: QualityLevel::Ultra,
            is_custom: false,
            base_preset: None,
            time_multiplier: 5.0,
            resource_multiplier: 2.0,
            cost_multiplier: 4.0,
            parameters: HashMap::from([
                (
                    "image_generation".to_string(),
                    overlay(&[
                        ("steps", json!(100)),
                        ("cfg_scale", json!(8.5)),
                        ("sampler", json!("dpm++_3m_sde_karras")),
                        ("resolution_scale", json!(1.0)),
                        ("enable_hr_fix", json!(true)),
                        ("hr_scale", json!(2.0)),
                        ("hr_steps", json!(20)),
                        ("enable_refinement", json!(true)),
                    ]),
                ),
                (
                    "video_generation".to_string(),
                    overlay(&[
                        ("fps", json!(60)),
                        ("frames", json!(180)),
                        ("resolution_scale", json!(1.0)),
                        ("motion_quality", json!("ultra")),
                        ("interpolation", json!(true)),
                        ("temporal_coherence", json!(true)),
                    ]),
                ),
                (
                    "audio_generation".to_string(),
                    overlay(&[
                        ("sample_rate", json!(96000)),
                        ("bitrate", json!(320)),
                        ("processing_quality", json!("ultra")),
                        ("enable_enhancement", json!(true)),
                        ("enable_mastering", json!(true)),
                    ]),
                ),
            ]),
            created_by: None,
            created_at: None,
            usage_count: 0,
        },
    ]
}

/// Manages built-in and user-defined presets and applies them to inputs.
pub struct PresetManager {
    presets: RwLock<HashMap<String, QualityPreset>>,
}

impl Default for PresetManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PresetManager {
    pub fn new() -> Self {
        let presets = builtin_presets()
            .into_iter()
            .map(|preset| (preset.id.clone(), preset))
            .collect();
        Self {
            presets: RwLock::new(presets),
        }
    }

    pub async fn get(&self, id: &str) -> Option<QualityPreset> {
        self.presets.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<QualityPreset> {
        let mut presets: Vec<QualityPreset> =
            self.presets.read().await.values().cloned().collect();
        presets.sort_by(|a, b| a.level.cmp(&b.level).then_with(|| a.name.cmp(&b.name)));
        presets
    }

    /// Register a custom preset. Inheritance is one level deep: the base
    /// preset must exist and must not itself inherit. Parent parameters are
    /// merged in under the child's overrides at registration time.
    pub async fn register_custom(
        &self,
        mut preset: QualityPreset,
        user_id: &str,
    ) -> Result<QualityPreset, PresetError> {
        let mut presets = self.presets.write().await;
        if presets.contains_key(&preset.id) {
            return Err(PresetError::Duplicate {
                id: preset.id.clone(),
            });
        }

        if let Some(base_id) = preset.base_preset.clone() {
            let base = presets.get(&base_id).ok_or_else(|| PresetError::UnknownBase {
                id: preset.id.clone(),
                base: base_id.clone(),
            })?;
            if base.base_preset.is_some() {
                return Err(PresetError::InheritanceTooDeep {
                    id: preset.id.clone(),
                    base: base_id,
                });
            }
            for (category, base_overlay) in &base.parameters {
                let merged = preset
                    .parameters
                    .entry(category.clone())
                    .or_insert_with(Map::new);
                for (key, value) in base_overlay {
                    merged.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }

        preset.is_custom = true;
        preset.created_by = Some(user_id.to_string());
        preset.created_at = Some(Utc::now());
        presets.insert(preset.id.clone(), preset.clone());
        Ok(preset)
    }

    /// Apply a preset over validated user inputs, producing the final input
    /// set plus a `_quality` sidecar. Applying the same preset twice is a
    /// no-op: an existing sidecar with the same preset id short-circuits.
    pub async fn apply(
        &self,
        preset_id: &str,
        template: &Template,
        inputs: &Value,
    ) -> Result<Value, PresetError> {
        let preset = {
            let mut presets = self.presets.write().await;
            let preset = presets.get_mut(preset_id).ok_or_else(|| PresetError::NotFound {
                id: preset_id.to_string(),
            })?;
            preset.usage_count += 1;
            preset.clone()
        };

        let mut params = match inputs {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };

        if let Some(sidecar) = params.get(QUALITY_SIDECAR_KEY) {
            if sidecar.get("id").and_then(Value::as_str) == Some(preset_id) {
                return Ok(Value::Object(params));
            }
        }

        let category = canonical_category(template.category());
        let category_overlay = preset.parameters.get(&category);

        let calculator_applies = matches!(
            category.as_str(),
            "image_generation" | "video_generation" | "audio_generation" | "text_generation"
        );
        if category_overlay.is_none() && !calculator_applies && !has_global_effect(&preset) {
            return Err(PresetError::Incompatible {
                preset: preset_id.to_string(),
                template: template.id().to_string(),
                reason: format!("no parameters defined for category '{category}'"),
            });
        }

        // Preset fills never override what the user set explicitly;
        // resolution_scale is consumed by the calculators, not forwarded.
        if let Some(category_overlay) = category_overlay {
            for (key, value) in category_overlay {
                if key != "resolution_scale" && !params.contains_key(key) {
                    params.insert(key.clone(), value.clone());
                }
            }
        }

        apply_category_calculator(&category, &mut params, &preset);
        apply_global_scaling(&mut params, &preset);

        let base_time = template
            .body
            .requirements
            .resources
            .estimated_time_seconds
            .unwrap_or(60.0);
        let base_memory = template.body.requirements.resources.memory_gb;
        params.insert(
            QUALITY_SIDECAR_KEY.to_string(),
            json!({
                "id": preset.id,
                "name": preset.name,
                "level": preset.level.rank(),
                "estimated_time": base_time * preset.time_multiplier,
                "estimated_cost": preset.cost_multiplier,
                "resource_hints": {
                    "memory_gb": base_memory * preset.resource_multiplier,
                    "memory_multiplier": preset.resource_multiplier,
                    "time_multiplier": preset.time_multiplier,
                    "priority": preset.level.priority(),
                },
            }),
        );

        Ok(Value::Object(params))
    }
}

fn has_global_effect(preset: &QualityPreset) -> bool {
    preset.time_multiplier != 1.0 || preset.resource_multiplier != 1.0
}

fn apply_global_scaling(params: &mut Map<String, Value>, preset: &QualityPreset) {
    // Steps come straight from the preset table; iterations scale by time.
    if !params.contains_key("steps") {
        if let Some(iterations) = params.get("iterations").and_then(Value::as_f64) {
            params.insert(
                "iterations".to_string(),
                json!((iterations * preset.time_multiplier) as i64),
            );
        }
    }

    if preset.resource_multiplier < 1.0 {
        if let Some(batch_size) = params.get("batch_size").and_then(Value::as_f64) {
            let scaled = ((batch_size * preset.resource_multiplier) as i64).max(1);
            params.insert("batch_size".to_string(), json!(scaled));
        }
    }
}
