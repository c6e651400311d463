use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::presets::{PresetManager, QualityLevel, QualityPreset};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseCase {
    Preview,
    Iteration,
    Review,
    ClientPresentation,
    FinalDelivery,
    SocialMedia,
    Print,
    Broadcast,
    Web,
    Mobile,
}

fn preset_for_use_case(use_case: UseCase) -> &'static str {
    match use_case {
        UseCase::Preview | UseCase::Iteration => "draft",
        UseCase::Review | UseCase::SocialMedia | UseCase::Web | UseCase::Mobile => "standard",
        UseCase::ClientPresentation | UseCase::Broadcast => "high",
        UseCase::FinalDelivery | UseCase::Print => "ultra",
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecommendationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_case: Option<UseCase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_platform: Option<String>,
    /// Wall-clock budget in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_constraint_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_constraint: Option<f64>,
    /// "minimum", "balanced", or "maximum".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_requirement: Option<String>,
    /// Available VRAM on the target hardware.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_vram_gb: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOffs {
    pub time_factor: f64,
    pub cost_factor: f64,
    pub quality_gain: f64,
    pub resource_usage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityRecommendation {
    pub recommended_preset: String,
    pub confidence: f64,
    pub reasoning: String,
    pub trade_offs: TradeOffs,
    pub alternatives: Vec<Value>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

const BASE_TIME_SECS: f64 = 60.0;
const BASE_COST: f64 = 0.01;
const BASE_VRAM_GB: f64 = 8.0;

/// Recommends a quality preset from use case and constraints. Rule-based:
/// the use-case table picks a starting point, then time, budget, and
/// hardware constraints walk it down a level at a time.
pub struct RecommendationEngine<'a> {
    presets: &'a PresetManager,
    platform_preferences: HashMap<&'static str, &'static str>,
}

impl<'a> RecommendationEngine<'a> {
    pub fn new(presets: &'a PresetManager) -> Self {
        let platform_preferences = HashMap::from([
            ("instagram", "standard"),
            ("twitter", "standard"),
            ("youtube", "high"),
            ("tiktok", "standard"),
            ("web", "standard"),
            ("print_a4", "ultra"),
            ("print_poster", "ultra"),
        ]);
        Self {
            presets,
            platform_preferences,
        }
    }

    pub async fn recommend(&self, context: &RecommendationContext) -> QualityRecommendation {
        let mut preset_id = self.rule_based(context);
        let mut confidence = 0.9;

        if let Some(limit) = context.time_constraint_secs {
            let (adjusted, factor) = self.step_down_while(preset_id, |preset| {
                BASE_TIME_SECS * preset.time_multiplier > limit
            });
            preset_id = adjusted;
            confidence *= factor;
        }

        if let Some(budget) = context.budget_constraint {
            let (adjusted, factor) = self.step_down_while(preset_id, |preset| {
                BASE_COST * preset.cost_multiplier > budget
            });
            preset_id = adjusted;
            confidence *= factor;
        }

        if let Some(vram) = context.available_vram_gb {
            let (adjusted, factor) = self.step_down_while(preset_id, |preset| {
                BASE_VRAM_GB * preset.resource_multiplier > vram
            });
            preset_id = adjusted;
            confidence *= factor;
        }

        let preset = match self.presets.get(preset_id).await {
            Some(preset) => preset,
            None => {
                preset_id = "standard";
                self.presets
                    .get("standard")
                    .await
                    .expect("standard preset is built in")
            }
        };

        QualityRecommendation {
            recommended_preset: preset_id.to_string(),
            confidence,
            reasoning: self.reasoning(&preset, context),
            trade_offs: TradeOffs {
                time_factor: preset.time_multiplier,
                cost_factor: preset.cost_multiplier,
                quality_gain: preset.level.rank() as f64 / QualityLevel::Ultra.rank() as f64,
                resource_usage: preset.resource_multiplier,
            },
            alternatives: self.alternatives(preset_id).await,
            warnings: self.warnings(&preset, context),
        }
    }

    fn rule_based(&self, context: &RecommendationContext) -> &'static str {
        if let Some(use_case) = context.use_case {
            return preset_for_use_case(use_case);
        }
        if let Some(requirement) = context.quality_requirement.as_deref() {
            return match requirement {
                "minimum" => "draft",
                "maximum" => "ultra",
                _ => "standard",
            };
        }
        if let Some(platform) = context.target_platform.as_deref() {
            if let Some(preferred) = self.platform_preferences.get(platform) {
                return preferred;
            }
        }
        "standard"
    }

    /// Walk down one level at a time while the constraint predicate holds;
    /// confidence shrinks with each step.
    fn step_down_while(
        &self,
        start: &'static str,
        exceeds: impl Fn(&QualityPreset) -> bool,
    ) -> (&'static str, f64) {
        let order = ["draft", "standard", "high", "ultra"];
        let presets = crate::presets::builtin_presets();
        let mut index = order.iter().position(|id| *id == start).unwrap_or(1);
        let mut confidence: f64 = 1.0;

        while index > 0 {
            let preset = presets
                .iter()
                .find(|preset| preset.id == order[index])
                .expect("builtin preset table covers every level");
            if !exceeds(preset) {
                break;
            }
            index -= 1;
            confidence -= 0.1;
        }
        (order[index], confidence.max(0.5))
    }

    fn reasoning(&self, preset: &QualityPreset, context: &RecommendationContext) -> String {
        let mut reasons = Vec::new();
        if let Some(use_case) = context.use_case {
            let reason = match use_case {
                UseCase::Preview | UseCase::Iteration => {
                    "fast turnaround matters more than final quality"
                }
                UseCase::Review | UseCase::Web | UseCase::Mobile | UseCase::SocialMedia => {
                    "balanced quality is enough for this audience"
                }
                UseCase::ClientPresentation | UseCase::Broadcast => {
                    "presentation-grade output justifies the extra time"
                }
                UseCase::FinalDelivery | UseCase::Print => {
                    "final deliverables warrant maximum quality"
                }
            };
            reasons.push(reason.to_string());
        }
        if context.time_constraint_secs.is_some() {
            reasons.push("adjusted for the time budget".to_string());
        }
        if context.available_vram_gb.is_some() {
            reasons.push("adjusted for available VRAM".to_string());
        }
        if reasons.is_empty() {
            reasons.push("default balanced profile".to_string());
        }
        format!("{} ({}): {}", preset.name, preset.id, reasons.join("; "))
    }

    async fn alternatives(&self, recommended: &str) -> Vec<Value> {
        self.presets
            .list()
            .await
            .into_iter()
            .filter(|preset| preset.id != recommended)
            .map(|preset| {
                json!({
                    "preset": preset.id,
                    "level": preset.level.rank(),
                    "time_multiplier": preset.time_multiplier,
                    "cost_multiplier": preset.cost_multiplier,
                })
            })
            .collect()
    }

    fn warnings(&self, preset: &QualityPreset, context: &RecommendationContext) -> Vec<String> {
        let mut out = Vec::new();
        if preset.level == QualityLevel::Ultra {
            if let Some(limit) = context.time_constraint_secs {
                if BASE_TIME_SECS * preset.time_multiplier > limit {
                    out.push("ultra quality will exceed the stated time budget".to_string());
                }
            }
        }
        if preset.level == QualityLevel::Draft
            && matches!(
                context.use_case,
                Some(UseCase::FinalDelivery) | Some(UseCase::Print)
            )
        {
            out.push("draft quality is below what this use case usually needs".to_string());
        }
        out
    }
}
