use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    pub description: String,
    pub weight: f64,
    #[serde(default)]
    pub optional: bool,
}

impl StageDefinition {
    pub fn new(name: &str, description: &str, weight: f64) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            weight,
            optional: false,
        }
    }
}

pub fn stages_for_category(category: &str) -> Vec<StageDefinition> {
    match category {
        "image_generation" => vec![
            StageDefinition::new("queue", "Waiting in queue", 0.05),
            StageDefinition::new("model_loading", "Loading models", 0.15),
            StageDefinition::new("generation", "Generating image", 0.70),
            StageDefinition::new("post_processing", "Post-processing", 0.10),
        ],
        "video_generation" => vec![
            StageDefinition::new("queue", "Waiting in queue", 0.02),
            StageDefinition::new("model_loading", "Loading models", 0.08),
            StageDefinition::new("frame_generation", "Generating frames", 0.80),
            StageDefinition::new("video_encoding", "Encoding video", 0.10),
        ],
        "audio_generation" => vec![
            StageDefinition::new("queue", "Waiting in queue", 0.05),
            StageDefinition::new("text_processing", "Processing text", 0.10),
            StageDefinition::new("synthesis", "Synthesizing audio", 0.75),
            StageDefinition::new("normalization", "Normalizing audio", 0.10),
        ],
        "text_generation" => vec![
            StageDefinition::new("queue", "Waiting in queue", 0.05),
            StageDefinition::new("context_loading", "Loading context", 0.10),
            StageDefinition::new("generation", "Generating text", 0.80),
            StageDefinition::new("formatting", "Formatting output", 0.05),
        ],
        _ => vec![
            StageDefinition::new("queue", "Waiting in queue", 0.05),
            StageDefinition::new("preparation", "Preparing execution", 0.15),
            StageDefinition::new("execution", "Processing", 0.70),
            StageDefinition::new("finalization", "Finalizing results", 0.10),
        ],
    }
}

/// Normalize weights so they sum to 1; equal shares when all are zero.
pub fn normalized_weights(stages: &[StageDefinition]) -> Vec<f64> {
    let total: f64 = stages.iter().map(|s| s.weight).sum();
    if total == 0.0 {
        let share = 1.0 / stages.len().max(1) as f64;
        return vec![share; stages.len()];
    }
    stages.iter().map(|s| s.weight / total).collect()
}

/// Skip rules driven by task context flags.
pub fn should_skip_stage(stage: &StageDefinition, context: &Map<String, Value>) -> bool {
    let flag = |key: &str| context.get(key).and_then(Value::as_bool).unwrap_or(false);

    if stage.optional && flag("skip_optional") {
        return true;
    }

    match stage.name.as_str() {
        "post_processing" => flag("skip_post_processing"),
        "normalization" => flag("skip_normalization"),
        "formatting" => flag("raw_output"),
        _ => false,
    }
}

/// Stage tables per category plus per-template overrides.
#[derive(Default)]
pub struct StageCatalog {
    custom: RwLock<HashMap<String, Vec<StageDefinition>>>,
}

impl StageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_template_stages(
        &self,
        template_id: impl Into<String>,
        stages: Vec<StageDefinition>,
    ) {
        self.custom.write().await.insert(template_id.into(), stages);
    }

    pub async fn stages_for(&self, template_id: &str, category: &str) -> Vec<StageDefinition> {
        if let Some(custom) = self.custom.read().await.get(template_id) {
            return custom.clone();
        }
        stages_for_category(category)
    }

    pub async fn stage_index(&self, template_id: &str, category: &str, name: &str) -> Option<usize> {
        self.stages_for(template_id, category)
            .await
            .iter()
            .position(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn category_tables_have_four_weighted_stages() {
        for category in [
            "image_generation",
            "video_generation",
            "audio_generation",
            "text_generation",
            "default",
        ] {
            let stages = stages_for_category(category);
            assert_eq!(stages.len(), 4, "{category}");
            let total: f64 = stages.iter().map(|s| s.weight).sum();
            assert!((total - 1.0).abs() < 1e-9, "{category} weights sum to {total}");
        }
    }

    #[test]
    fn unknown_category_falls_back_to_default() {
        let stages = stages_for_category("telemetry");
        assert_eq!(stages[2].name, "execution");
    }

    #[test]
    fn zero_weights_normalize_to_equal_shares() {
        let stages = vec![
            StageDefinition::new("a", "", 0.0),
            StageDefinition::new("b", "", 0.0),
        ];
        assert_eq!(normalized_weights(&stages), vec![0.5, 0.5]);
    }

    #[test]
    fn skip_rules_follow_context_flags() {
        let stage = StageDefinition::new("post_processing", "", 0.1);
        let mut context = Map::new();
        assert!(!should_skip_stage(&stage, &context));
        context.insert("skip_post_processing".to_string(), json!(true));
        assert!(should_skip_stage(&stage, &context));

        let formatting = StageDefinition::new("formatting", "", 0.05);
        let mut context = Map::new();
        context.insert("raw_output".to_string(), json!(true));
        assert!(should_skip_stage(&formatting, &context));
    }

    #[tokio::test]
    async fn custom_template_stages_override_category() {
        let catalog = StageCatalog::new();
        catalog
            .register_template_stages(
                "style_transfer",
                vec![
                    StageDefinition::new("queue", "Waiting", 0.1),
                    StageDefinition::new("transfer", "Transferring style", 0.9),
                ],
            )
            .await;
        let stages = catalog.stages_for("style_transfer", "image_generation").await;
        assert_eq!(stages.len(), 2);
        assert_eq!(
            catalog
                .stage_index("style_transfer", "image_generation", "transfer")
                .await,
            Some(1)
        );
        let other = catalog.stages_for("image_gen", "image_generation").await;
        assert_eq!(other.len(), 4);
    }
}
