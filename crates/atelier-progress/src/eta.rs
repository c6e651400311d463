use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// One completed run, kept for ETA prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHistoryEntry {
    pub task_id: String,
    pub template_id: String,
    pub quality: String,
    pub stage_durations: HashMap<usize, f64>,
    pub total_duration: f64,
    pub completed_at: DateTime<Utc>,
    pub success: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct EtaPrediction {
    pub eta: DateTime<Utc>,
    pub confidence: f64,
}

const HISTORY_CAP: usize = 1000;
const HISTORY_WINDOW_DAYS: i64 = 7;
const MATCH_LIMIT: usize = 100;
const MIN_MATCHES: usize = 3;
const CACHE_TTL: Duration = Duration::from_secs(3600);
const FALLBACK_CONFIDENCE: f64 = 0.3;

fn default_stage_duration(stage: usize) -> f64 {
    match stage {
        0 => 5.0,   // queue
        1 => 30.0,  // preparation / loading
        2 => 120.0, // main execution
        3 => 20.0,  // finalization
        _ => 60.0,
    }
}

/// Predicts completion times from per-stage duration history. History is
/// bounded by count and implicitly by the seven-day match window;
/// predictions are cached per (template, quality, stage, percent) for an
/// hour.
pub struct EtaPredictor {
    history: Mutex<VecDeque<TaskHistoryEntry>>,
    cache: Mutex<HashMap<String, (EtaPrediction, Instant)>>,
}

impl Default for EtaPredictor {
    fn default() -> Self {
        Self::new()
    }
}

impl EtaPredictor {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(VecDeque::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn record_completion(&self, entry: TaskHistoryEntry) {
        let mut history = self.history.lock().await;
        history.push_back(entry);
        while history.len() > HISTORY_CAP {
            history.pop_front();
        }
    }

    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }

    pub async fn predict(
        &self,
        template_id: &str,
        quality: &str,
        current_stage: usize,
        stage_progress: f64,
        total_stages: usize,
    ) -> EtaPrediction {
        let stage_progress = stage_progress.clamp(0.0, 1.0);
        let cache_key = format!(
            "{template_id}:{quality}:{current_stage}:{}",
            (stage_progress * 100.0) as u32
        );

        {
            let cache = self.cache.lock().await;
            if let Some((prediction, at)) = cache.get(&cache_key) {
                if at.elapsed() < CACHE_TTL {
                    return *prediction;
                }
            }
        }

        let matches = self.similar_runs(template_id, quality).await;
        let prediction = if matches.len() < MIN_MATCHES {
            self.fallback(current_stage, stage_progress, total_stages)
        } else {
            self.from_history(&matches, current_stage, stage_progress, total_stages)
        };

        let mut cache = self.cache.lock().await;
        cache.retain(|_, (_, at)| at.elapsed() < CACHE_TTL);
        cache.insert(cache_key, (prediction, Instant::now()));
        prediction
    }

    /// Successful runs of the same template and quality completed within the
    /// last seven days, newest first, at most `MATCH_LIMIT`.
    async fn similar_runs(&self, template_id: &str, quality: &str) -> Vec<TaskHistoryEntry> {
        let cutoff = Utc::now() - ChronoDuration::days(HISTORY_WINDOW_DAYS);
        let history = self.history.lock().await;
        let mut matches: Vec<TaskHistoryEntry> = history
            .iter()
            .filter(|entry| {
                entry.template_id == template_id
                    && entry.quality == quality
                    && entry.success
                    && entry.completed_at > cutoff
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        matches.truncate(MATCH_LIMIT);
        matches
    }

    fn from_history(
        &self,
        matches: &[TaskHistoryEntry],
        current_stage: usize,
        stage_progress: f64,
        total_stages: usize,
    ) -> EtaPrediction {
        let mut per_stage: HashMap<usize, Vec<f64>> = HashMap::new();
        for entry in matches {
            for (stage, duration) in &entry.stage_durations {
                per_stage.entry(*stage).or_default().push(*duration);
            }
        }

        let p75: HashMap<usize, f64> = per_stage
            .iter()
            .map(|(stage, durations)| (*stage, percentile(durations, 75.0)))
            .collect();
        let average = if p75.is_empty() {
            60.0
        } else {
            p75.values().sum::<f64>() / p75.len() as f64
        };

        let mut remaining =
            p75.get(&current_stage).copied().unwrap_or(average) * (1.0 - stage_progress);
        for stage in (current_stage + 1)..total_stages {
            remaining += p75.get(&stage).copied().unwrap_or(average);
        }

        let confidence = self.confidence(matches);
        let adjusted = remaining * (1.0 + (1.0 - confidence) * 0.5);

        EtaPrediction {
            eta: Utc::now() + ChronoDuration::milliseconds((adjusted * 1000.0) as i64),
            confidence,
        }
    }

    /// Confidence starts at min(0.95, 0.7 + 0.02·n) and is scaled down for
    /// stale samples and high duration variance.
    fn confidence(&self, matches: &[TaskHistoryEntry]) -> f64 {
        let mut confidence = (0.7 + 0.02 * matches.len() as f64).min(0.95);

        if let Some(oldest) = matches.last() {
            let age_days = (Utc::now() - oldest.completed_at).num_days();
            if age_days > 30 {
                confidence *= 0.8;
            } else if age_days > 7 {
                confidence *= 0.9;
            }
        }

        let durations: Vec<f64> = matches.iter().map(|m| m.total_duration).collect();
        if durations.len() > 1 {
            let mean = durations.iter().sum::<f64>() / durations.len() as f64;
            if mean > 0.0 {
                let variance = durations
                    .iter()
                    .map(|d| (d - mean).powi(2))
                    .sum::<f64>()
                    / (durations.len() - 1) as f64;
                let cv = variance.sqrt() / mean;
                if cv > 0.5 {
                    confidence *= 0.7;
                } else if cv > 0.3 {
                    confidence *= 0.85;
                }
            }
        }

        confidence.clamp(0.1, 0.95)
    }

    fn fallback(
        &self,
        current_stage: usize,
        stage_progress: f64,
        total_stages: usize,
    ) -> EtaPrediction {
        let mut remaining = default_stage_duration(current_stage) * (1.0 - stage_progress);
        for stage in (current_stage + 1)..total_stages {
            remaining += default_stage_duration(stage);
        }
        EtaPrediction {
            eta: Utc::now() + ChronoDuration::milliseconds((remaining * 1000.0) as i64),
            confidence: FALLBACK_CONFIDENCE,
        }
    }
}

fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let index = (sorted.len() - 1) as f64 * pct / 100.0;
    let lower = index.floor() as usize;
    let upper = index.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        sorted[lower] + (sorted[upper] - sorted[lower]) * (index - lower as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(template: &str, quality: &str, total: f64, stage2: f64) -> TaskHistoryEntry {
        TaskHistoryEntry {
            task_id: uuid_like(),
            template_id: template.to_string(),
            quality: quality.to_string(),
            stage_durations: HashMap::from([(0, 2.0), (1, 10.0), (2, stage2), (3, 5.0)]),
            total_duration: total,
            completed_at: Utc::now(),
            success: true,
        }
    }

    fn uuid_like() -> String {
        format!("t-{}", rand_suffix())
    }

    fn rand_suffix() -> u128 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    }

    #[test]
    fn percentile_interpolates() {
        let values = vec![10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&values, 75.0), 32.5);
        assert_eq!(percentile(&values, 100.0), 40.0);
        assert_eq!(percentile(&[], 75.0), 0.0);
    }

    #[tokio::test]
    async fn zero_history_falls_back_to_defaults() {
        let predictor = EtaPredictor::new();
        let prediction = predictor.predict("image_gen", "standard", 0, 0.0, 4).await;
        assert!(prediction.confidence <= 0.5);
        let remaining = (prediction.eta - Utc::now()).num_seconds();
        // 5 + 30 + 120 + 20 = 175s of defaults
        assert!((170..=180).contains(&remaining), "remaining {remaining}");
    }

    #[tokio::test]
    async fn history_drives_prediction_once_three_matches_exist() {
        let predictor = EtaPredictor::new();
        for _ in 0..5 {
            predictor
                .record_completion(entry("image_gen", "standard", 60.0, 40.0))
                .await;
        }
        let prediction = predictor.predict("image_gen", "standard", 2, 0.5, 4).await;
        assert!(prediction.confidence > 0.5);
        let remaining = (prediction.eta - Utc::now()).num_seconds();
        // p75(stage2)=40 → 40*0.5 + p75(stage3)=5, adjusted upward by confidence
        assert!((20..=40).contains(&remaining), "remaining {remaining}");
    }

    #[tokio::test]
    async fn mismatched_quality_is_ignored() {
        let predictor = EtaPredictor::new();
        for _ in 0..5 {
            predictor
                .record_completion(entry("image_gen", "ultra", 600.0, 500.0))
                .await;
        }
        let prediction = predictor.predict("image_gen", "standard", 0, 0.0, 4).await;
        assert_eq!(prediction.confidence, FALLBACK_CONFIDENCE);
    }

    #[tokio::test]
    async fn high_variance_lowers_confidence() {
        let stable = EtaPredictor::new();
        let noisy = EtaPredictor::new();
        for index in 0..10 {
            stable
                .record_completion(entry("image_gen", "standard", 60.0, 40.0))
                .await;
            let wild = if index % 2 == 0 { 10.0 } else { 200.0 };
            noisy
                .record_completion(entry("image_gen", "standard", wild, wild))
                .await;
        }
        let stable_prediction = stable.predict("image_gen", "standard", 1, 0.0, 4).await;
        let noisy_prediction = noisy.predict("image_gen", "standard", 1, 0.0, 4).await;
        assert!(noisy_prediction.confidence < stable_prediction.confidence);
    }

    #[tokio::test]
    async fn predictions_are_cached_per_progress_bucket() {
        let predictor = EtaPredictor::new();
        let first = predictor.predict("image_gen", "standard", 0, 0.101, 4).await;
        // Same bucket (10%), history changed meanwhile; cache still answers.
        for _ in 0..5 {
            predictor
                .record_completion(entry("image_gen", "standard", 60.0, 40.0))
                .await;
        }
        let second = predictor.predict("image_gen", "standard", 0, 0.109, 4).await;
        assert_eq!(first.eta, second.eta);
        assert_eq!(first.confidence, second.confidence);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let predictor = EtaPredictor::new();
        for _ in 0..(HISTORY_CAP + 50) {
            predictor
                .record_completion(entry("image_gen", "standard", 60.0, 40.0))
                .await;
        }
        assert_eq!(predictor.history_len().await, HISTORY_CAP);
    }
}
