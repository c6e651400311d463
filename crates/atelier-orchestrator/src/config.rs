use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use atelier_pool::PoolConfig;

/// Engine configuration, deserializable from a YAML file with every field
/// defaulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub template_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_wait_reap_interval_secs")]
    pub wait_reap_interval_secs: u64,
    #[serde(default = "default_healing_interval_secs")]
    pub healing_interval_secs: u64,
    /// GPU capacity is configured, not probed.
    #[serde(default)]
    pub gpu_memory_gb: f64,
    #[serde(default)]
    pub gpu_count: u32,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: f64,
}

fn default_task_timeout_secs() -> u64 {
    600
}
fn default_wait_reap_interval_secs() -> u64 {
    5
}
fn default_healing_interval_secs() -> u64 {
    60
}
fn default_requests_per_minute() -> f64 {
    100.0
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            template_dirs: Vec::new(),
            pool: PoolConfig::default(),
            task_timeout_secs: default_task_timeout_secs(),
            wait_reap_interval_secs: default_wait_reap_interval_secs(),
            healing_interval_secs: default_healing_interval_secs(),
            gpu_memory_gb: 0.0,
            gpu_count: 0,
            requests_per_minute: default_requests_per_minute(),
        }
    }
}

impl EngineConfig {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let config = serde_yaml::from_str(&raw)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = EngineConfig::default();
        assert_eq!(config.task_timeout_secs, 600);
        assert_eq!(config.pool.min_workers, 1);
        assert_eq!(config.pool.max_workers, 10);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config: EngineConfig = serde_yaml::from_str(
            r#"
template_dirs: ["/etc/atelier/templates"]
pool:
  min_workers: 2
  max_workers: 6
  scale_up_threshold: 3
  scale_down_threshold: 0
  idle_timeout_secs: 120
  health_check_interval_secs: 30
gpu_memory_gb: 24
gpu_count: 1
"#,
        )
        .unwrap();
        assert_eq!(config.pool.min_workers, 2);
        assert_eq!(config.gpu_count, 1);
        assert_eq!(config.task_timeout_secs, 600);
    }
}
