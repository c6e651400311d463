use serde_json::{json, Map, Value};

use crate::presets::{QualityLevel, QualityPreset};

/// Normalize template categories to the keys the calculators and preset
/// tables use.
pub fn canonical_category(category: &str) -> String {
    match category.to_ascii_lowercase().as_str() {
        "image" | "img2img" | "inpainting" | "upscaling" => "image_generation".to_string(),
        "video" | "animation" | "motion" => "video_generation".to_string(),
        "audio" | "music" | "voice" | "sound" => "audio_generation".to_string(),
        "text" | "llm" => "text_generation".to_string(),
        other => other.to_string(),
    }
}

/// Run the category-specific parameter adjustments for a preset.
pub fn apply_category_calculator(
    category: &str,
    params: &mut Map<String, Value>,
    preset: &QualityPreset,
) {
    match category {
        "image_generation" => calculate_image(params, preset),
        "video_generation" => calculate_video(params, preset),
        "audio_generation" => calculate_audio(params, preset),
        "text_generation" => calculate_text(params, preset),
        _ => {}
    }
}

fn get_f64(params: &Map<String, Value>, key: &str) -> Option<f64> {
    params.get(key).and_then(Value::as_f64)
}

fn resolution_scale(preset: &QualityPreset, category: &str) -> Option<f64> {
    preset
        .parameters
        .get(category)?
        .get("resolution_scale")?
        .as_f64()
}

fn calculate_image(params: &mut Map<String, Value>, preset: &QualityPreset) {
    if preset.level >= QualityLevel::High
        && params.get("sampler").and_then(Value::as_str) == Some("euler")
    {
        params.insert("sampler".to_string(), json!("dpm++_2m_karras"));
    }

    if preset.level >= QualityLevel::High {
        params.insert("enable_attention_slicing".to_string(), json!(false));
        params.insert("enable_vae_slicing".to_string(), json!(false));

        if preset.level == QualityLevel::Ultra && !params.contains_key("enable_hr_fix") {
            params.insert("enable_hr_fix".to_string(), json!(true));
            params.insert("hr_scale".to_string(), json!(2.0));
            params.insert("hr_steps".to_string(), json!(20));
        }
    }

    if get_f64(params, "width").unwrap_or(512.0) > 1024.0 {
        let cfg = get_f64(params, "cfg_scale").unwrap_or(7.5);
        params.insert("cfg_scale".to_string(), json!(cfg + 0.5));
    }

    if let Some(scale) = resolution_scale(preset, "image_generation") {
        if scale != 1.0 {
            let width = get_f64(params, "width").unwrap_or(512.0);
            let height = get_f64(params, "height").unwrap_or(512.0);
            params.insert("width".to_string(), json!((width * scale) as i64));
            params.insert("height".to_string(), json!((height * scale) as i64));
        }
    }

    if preset.level >= QualityLevel::High && get_f64(params, "steps").unwrap_or(0.0) < 30.0 {
        params.insert("steps".to_string(), json!(30));
    }
}

fn calculate_video(params: &mut Map<String, Value>, preset: &QualityPreset) {
    if preset.level >= QualityLevel::High {
        params.insert("interpolation".to_string(), json!(true));
        params.insert("interpolation_factor".to_string(), json!(2));
    }

    if preset.level == QualityLevel::Ultra {
        params.insert("temporal_coherence".to_string(), json!(true));
        params.insert("motion_smoothing".to_string(), json!(true));
    }

    if let Some(interval) = get_f64(params, "keyframe_interval") {
        let interval = interval as i64;
        let adjusted = match preset.level {
            QualityLevel::Draft => (interval * 2).min(60),
            QualityLevel::Ultra => (interval / 2).max(1),
            _ => interval,
        };
        params.insert("keyframe_interval".to_string(), json!(adjusted));
    }

    if let Some(scale) = resolution_scale(preset, "video_generation") {
        if scale != 1.0 {
            let width = get_f64(params, "width").unwrap_or(1280.0);
            let height = get_f64(params, "height").unwrap_or(720.0);
            params.insert("width".to_string(), json!((width * scale) as i64));
            params.insert("height".to_string(), json!((height * scale) as i64));
        }
    }

    let min_fps = match preset.level {
        QualityLevel::Draft => 12.0,
        QualityLevel::Standard => 24.0,
        QualityLevel::High => 30.0,
        QualityLevel::Ultra => 60.0,
    };
    if get_f64(params, "fps").unwrap_or(24.0) < min_fps {
        params.insert("fps".to_string(), json!(min_fps as i64));
    }
}

fn calculate_audio(params: &mut Map<String, Value>, preset: &QualityPreset) {
    if preset.level >= QualityLevel::High {
        params.insert("enable_enhancement".to_string(), json!(true));
        params.insert("noise_reduction".to_string(), json!(true));
    }

    if preset.level == QualityLevel::Ultra {
        params.insert("enable_mastering".to_string(), json!(true));
        params.insert("normalize".to_string(), json!(true));
        params.insert("eq_preset".to_string(), json!("professional"));
    }

    match params.get("content_type").and_then(Value::as_str) {
        Some("voice") if preset.level >= QualityLevel::High => {
            params.insert("voice_enhancement".to_string(), json!(true));
            params.insert("de_essing".to_string(), json!(true));
        }
        Some("music") if preset.level >= QualityLevel::High => {
            params.insert("stereo_width".to_string(), json!(1.2));
            params.insert("harmonic_enhancement".to_string(), json!(true));
        }
        _ => {}
    }

    let min_sample_rate = match preset.level {
        QualityLevel::Draft => 22050.0,
        QualityLevel::Standard => 44100.0,
        QualityLevel::High => 48000.0,
        QualityLevel::Ultra => 96000.0,
    };
    if get_f64(params, "sample_rate").unwrap_or(44100.0) < min_sample_rate {
        params.insert("sample_rate".to_string(), json!(min_sample_rate as i64));
    }
}

fn calculate_text(params: &mut Map<String, Value>, preset: &QualityPreset) {
    let settings: Vec<(&str, Value)> = match preset.level {
        QualityLevel::Draft => vec![
            ("temperature", json!(0.8)),
            ("top_p", json!(0.9)),
            ("max_tokens", json!(512)),
            ("repetition_penalty", json!(1.1)),
        ],
        QualityLevel::Standard => vec![
            ("temperature", json!(0.7)),
            ("top_p", json!(0.92)),
            ("max_tokens", json!(1024)),
            ("repetition_penalty", json!(1.15)),
        ],
        QualityLevel::High => vec![
            ("temperature", json!(0.6)),
            ("top_p", json!(0.95)),
            ("max_tokens", json!(2048)),
            ("repetition_penalty", json!(1.2)),
            ("beam_search", json!(true)),
            ("num_beams", json!(3)),
        ],
        QualityLevel::Ultra => vec![
            ("temperature", json!(0.5)),
            ("top_p", json!(0.98)),
            ("max_tokens", json!(4096)),
            ("repetition_penalty", json!(1.25)),
            ("beam_search", json!(true)),
            ("num_beams", json!(5)),
            ("early_stopping", json!(true)),
        ],
    };

    for (key, value) in settings {
        if !params.contains_key(key) {
            params.insert(key.to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presets::builtin_presets;

    fn preset(id: &str) -> QualityPreset {
        builtin_presets()
            .into_iter()
            .find(|p| p.id == id)
            .unwrap()
    }

    #[test]
    fn canonical_category_maps_aliases() {
        assert_eq!(canonical_category("image"), "image_generation");
        assert_eq!(canonical_category("Music"), "audio_generation");
        assert_eq!(canonical_category("llm"), "text_generation");
        assert_eq!(canonical_category("image_generation"), "image_generation");
        assert_eq!(canonical_category("processing"), "processing");
    }

    #[test]
    fn high_quality_upgrades_euler_sampler() {
        let mut params = Map::new();
        params.insert("sampler".to_string(), json!("euler"));
        apply_category_calculator("image_generation", &mut params, &preset("high"));
        assert_eq!(params["sampler"], "dpm++_2m_karras");
        assert_eq!(params["steps"], 30);
    }

    #[test]
    fn draft_scales_resolution_down() {
        let mut params = Map::new();
        params.insert("width".to_string(), json!(512));
        params.insert("height".to_string(), json!(512));
        apply_category_calculator("image_generation", &mut params, &preset("draft"));
        assert_eq!(params["width"], 384);
        assert_eq!(params["height"], 384);
    }

    #[test]
    fn large_width_bumps_cfg_scale() {
        let mut params = Map::new();
        params.insert("width".to_string(), json!(2048));
        params.insert("cfg_scale".to_string(), json!(7.5));
        apply_category_calculator("image_generation", &mut params, &preset("standard"));
        assert_eq!(params["cfg_scale"], 8.0);
    }

    #[test]
    fn ultra_video_enables_temporal_coherence_and_min_fps() {
        let mut params = Map::new();
        params.insert("fps".to_string(), json!(24));
        apply_category_calculator("video_generation", &mut params, &preset("ultra"));
        assert_eq!(params["temporal_coherence"], true);
        assert_eq!(params["fps"], 60);
    }

    #[test]
    fn voice_content_gets_voice_chain_at_high() {
        let mut params = Map::new();
        params.insert("content_type".to_string(), json!("voice"));
        apply_category_calculator("audio_generation", &mut params, &preset("high"));
        assert_eq!(params["voice_enhancement"], true);
        assert_eq!(params["de_essing"], true);
        assert_eq!(params["sample_rate"], 48000);
    }

    #[test]
    fn text_settings_do_not_override_user_values() {
        let mut params = Map::new();
        params.insert("temperature".to_string(), json!(0.95));
        apply_category_calculator("text_generation", &mut params, &preset("ultra"));
        assert_eq!(params["temperature"], 0.95);
        assert_eq!(params["num_beams"], 5);
    }

    #[test]
    fn unknown_category_is_untouched() {
        let mut params = Map::new();
        params.insert("anything".to_string(), json!(1));
        apply_category_calculator("processing", &mut params, &preset("ultra"));
        assert_eq!(params.len(), 1);
    }
}
