use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const PREVIEW_INTERVALS: [f64; 3] = [0.25, 0.5, 0.75];
const INTERVAL_TOLERANCE: f64 = 0.02;

const PREVIEW_STAGES: [&str; 4] = ["generation", "frame_generation", "synthesis", "execution"];
const PREVIEW_CATEGORIES: [&str; 3] = ["image_generation", "video_generation", "audio_generation"];

/// Produces preview artifact references at fixed progress intervals. The
/// actual artifact bytes live with the worker; the engine only tracks a
/// reference per `(task, rounded progress)`.
#[derive(Default)]
pub struct PreviewGenerator {
    cache: Mutex<HashMap<String, String>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PreviewGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn interval_for(progress: f64) -> Option<u32> {
        PREVIEW_INTERVALS
            .iter()
            .find(|interval| (progress - **interval).abs() < INTERVAL_TOLERANCE)
            .map(|interval| (interval * 100.0) as u32)
    }

    fn eligible(category: &str, stage_name: &str) -> bool {
        PREVIEW_STAGES.contains(&stage_name) && PREVIEW_CATEGORIES.contains(&category)
    }

    /// Return a preview reference when the stage, category, and progress all
    /// line up; at most one per `(task, interval)` across concurrent callers.
    pub async fn maybe_generate(
        &self,
        task_id: &str,
        category: &str,
        stage_name: &str,
        progress: f64,
    ) -> Option<String> {
        if !Self::eligible(category, stage_name) {
            return None;
        }
        let interval = Self::interval_for(progress)?;
        let cache_key = format!("{task_id}:{interval}");

        if let Some(existing) = self.cache.lock().await.get(&cache_key) {
            return Some(existing.clone());
        }

        // One preview generation per task at a time.
        let task_lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(task_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = task_lock.lock().await;

        let mut cache = self.cache.lock().await;
        if let Some(existing) = cache.get(&cache_key) {
            return Some(existing.clone());
        }
        let reference = format!("preview://{task_id}/{interval}");
        cache.insert(cache_key, reference.clone());
        Some(reference)
    }

    /// Drop cached previews and the lock entry once a task is done.
    pub async fn cleanup_task(&self, task_id: &str) {
        let prefix = format!("{task_id}:");
        self.cache
            .lock()
            .await
            .retain(|key, _| !key.starts_with(&prefix));
        self.locks.lock().await.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generates_only_near_intervals() {
        let generator = PreviewGenerator::new();
        assert!(generator
            .maybe_generate("t-1", "image_generation", "generation", 0.50)
            .await
            .is_some());
        assert!(generator
            .maybe_generate("t-1", "image_generation", "generation", 0.40)
            .await
            .is_none());
        assert!(generator
            .maybe_generate("t-1", "image_generation", "generation", 0.74)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn ineligible_stage_or_category_skipped() {
        let generator = PreviewGenerator::new();
        assert!(generator
            .maybe_generate("t-1", "image_generation", "model_loading", 0.5)
            .await
            .is_none());
        assert!(generator
            .maybe_generate("t-1", "text_generation", "generation", 0.5)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn same_interval_yields_same_reference() {
        let generator = PreviewGenerator::new();
        let first = generator
            .maybe_generate("t-1", "video_generation", "frame_generation", 0.25)
            .await
            .unwrap();
        let second = generator
            .maybe_generate("t-1", "video_generation", "frame_generation", 0.26)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn concurrent_callers_get_one_reference() {
        let generator = Arc::new(PreviewGenerator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let generator = generator.clone();
            handles.push(tokio::spawn(async move {
                generator
                    .maybe_generate("t-1", "image_generation", "generation", 0.5)
                    .await
            }));
        }
        let mut references = Vec::new();
        for handle in handles {
            references.push(handle.await.unwrap().unwrap());
        }
        references.dedup();
        assert_eq!(references.len(), 1);
    }

    #[tokio::test]
    async fn cleanup_clears_task_state() {
        let generator = PreviewGenerator::new();
        generator
            .maybe_generate("t-1", "image_generation", "generation", 0.25)
            .await
            .unwrap();
        generator.cleanup_task("t-1").await;
        assert!(generator.cache.lock().await.is_empty());
        assert!(generator.locks.lock().await.is_empty());
    }
}
