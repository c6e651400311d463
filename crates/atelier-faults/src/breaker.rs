use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub circuit_opens: u64,
    pub success_rate: f64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
#[error("circuit breaker '{name}' is open; next attempt at {next_attempt}")]
pub struct BreakerOpen {
    pub name: String,
    pub next_attempt: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    total_calls: u64,
    total_failures: u64,
    total_successes: u64,
    circuit_opens: u64,
}

/// Per-downstream failure gate: closed → open after `failure_threshold`
/// consecutive failures; open → half-open after `recovery_timeout`; one
/// probe call allowed in half-open, closing again only after
/// `success_threshold` consecutive successes.
pub struct CircuitBreaker {
    pub name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                last_success: None,
                total_calls: 0,
                total_failures: 0,
                total_successes: 0,
                circuit_opens: 0,
            }),
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    /// Gate a call. Fails fast while open and the recovery timeout has not
    /// elapsed; otherwise lets the call proceed (transitioning to half-open
    /// when the timeout has elapsed).
    pub async fn acquire(&self) -> Result<(), BreakerOpen> {
        let mut inner = self.inner.lock().await;
        inner.total_calls += 1;

        if inner.state == BreakerState::Open {
            let elapsed_ok = match inner.last_failure {
                Some(last) => {
                    Utc::now() - last
                        > ChronoDuration::seconds(self.config.recovery_timeout_secs as i64)
                }
                None => true,
            };
            if elapsed_ok {
                inner.state = BreakerState::HalfOpen;
                info!(breaker = %self.name, "circuit breaker entering half-open state");
            } else {
                let next_attempt = inner
                    .last_failure
                    .map(|last| {
                        last + ChronoDuration::seconds(self.config.recovery_timeout_secs as i64)
                    })
                    .unwrap_or_else(Utc::now);
                return Err(BreakerOpen {
                    name: self.name.clone(),
                    next_attempt,
                });
            }
        }
        Ok(())
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.total_successes += 1;
        inner.last_success = Some(Utc::now());

        if inner.state == BreakerState::HalfOpen {
            inner.success_count += 1;
            if inner.success_count >= self.config.success_threshold {
                inner.state = BreakerState::Closed;
                inner.failure_count = 0;
                inner.success_count = 0;
                info!(breaker = %self.name, "circuit breaker closed after recovery");
            }
        } else {
            inner.failure_count = 0;
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.total_failures += 1;
        inner.failure_count += 1;
        inner.last_failure = Some(Utc::now());

        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Open;
            inner.success_count = 0;
            inner.circuit_opens += 1;
            warn!(breaker = %self.name, "circuit breaker reopened after failure in half-open state");
        } else if inner.state == BreakerState::Closed
            && inner.failure_count >= self.config.failure_threshold
        {
            inner.state = BreakerState::Open;
            inner.circuit_opens += 1;
            warn!(
                breaker = %self.name,
                failures = inner.failure_count,
                "circuit breaker opened"
            );
        }
    }

    /// Wrap a call: gate, run, record the outcome.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<Result<T, E>, BreakerOpen>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.acquire().await?;
        let outcome = f().await;
        match &outcome {
            Ok(_) => self.record_success().await,
            Err(_) => self.record_failure().await,
        }
        Ok(outcome)
    }

    /// Manual reset to closed with zeroed counters.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        info!(breaker = %self.name, "circuit breaker manually reset");
    }

    pub async fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().await;
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            circuit_opens: inner.circuit_opens,
            success_rate: if inner.total_calls > 0 {
                inner.total_successes as f64 / inner.total_calls as f64
            } else {
                0.0
            },
            last_failure_time: inner.last_failure,
            last_success_time: inner.last_success,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerHealth {
    pub healthy: bool,
    pub total_breakers: usize,
    pub open_breakers: Vec<String>,
    pub health_percentage: f64,
}

/// The catalog of breakers, one per downstream service. Unknown services
/// get a breaker with the default profile on first use.
pub struct BreakerSet {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Default for BreakerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerSet {
    pub fn new() -> Self {
        let defaults = [
            ("default", BreakerConfig::default()),
            (
                "comfyui",
                BreakerConfig {
                    failure_threshold: 3,
                    recovery_timeout_secs: 30,
                    success_threshold: 2,
                },
            ),
            (
                "storage",
                BreakerConfig {
                    failure_threshold: 5,
                    recovery_timeout_secs: 60,
                    success_threshold: 3,
                },
            ),
            (
                "gpu_allocation",
                BreakerConfig {
                    failure_threshold: 2,
                    recovery_timeout_secs: 120,
                    success_threshold: 1,
                },
            ),
            (
                "external_api",
                BreakerConfig {
                    failure_threshold: 4,
                    recovery_timeout_secs: 45,
                    success_threshold: 2,
                },
            ),
        ];
        let breakers = defaults
            .into_iter()
            .map(|(name, config)| {
                (
                    name.to_string(),
                    Arc::new(CircuitBreaker::new(name, config)),
                )
            })
            .collect();
        Self {
            breakers: RwLock::new(breakers),
        }
    }

    pub async fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().await.get(service) {
            return existing.clone();
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, BreakerConfig::default())))
            .clone()
    }

    pub async fn add_breaker(&self, service: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(service, config));
        self.breakers
            .write()
            .await
            .insert(service.to_string(), breaker.clone());
        breaker
    }

    pub async fn all_stats(&self) -> HashMap<String, BreakerStats> {
        let breakers = self.breakers.read().await.clone();
        let mut out = HashMap::new();
        for (name, breaker) in breakers {
            out.insert(name, breaker.stats().await);
        }
        out
    }

    pub async fn open_breakers(&self) -> Vec<String> {
        let breakers = self.breakers.read().await.clone();
        let mut out = Vec::new();
        for (name, breaker) in breakers {
            if breaker.state().await == BreakerState::Open {
                out.push(name);
            }
        }
        out.sort();
        out
    }

    pub async fn reset(&self, service: &str) -> bool {
        let breaker = self.breakers.read().await.get(service).cloned();
        match breaker {
            Some(breaker) => {
                breaker.reset().await;
                true
            }
            None => false,
        }
    }

    pub async fn reset_all(&self) {
        let breakers = self.breakers.read().await.clone();
        for breaker in breakers.values() {
            breaker.reset().await;
        }
    }

    pub async fn health(&self) -> BreakerHealth {
        let total = self.breakers.read().await.len();
        let open = self.open_breakers().await;
        BreakerHealth {
            healthy: open.is_empty(),
            total_breakers: total,
            open_breakers: open.clone(),
            health_percentage: if total > 0 {
                (total - open.len()) as f64 / total as f64 * 100.0
            } else {
                100.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker(failure_threshold: u32, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "probe",
            BreakerConfig {
                failure_threshold,
                recovery_timeout_secs: 0,
                success_threshold,
            },
        )
    }

    #[tokio::test]
    async fn opens_after_exact_failure_threshold() {
        let breaker = CircuitBreaker::new(
            "comfyui",
            BreakerConfig {
                failure_threshold: 3,
                recovery_timeout_secs: 30,
                success_threshold: 2,
            },
        );
        for _ in 0..2 {
            breaker.acquire().await.unwrap();
            breaker.record_failure().await;
        }
        assert_eq!(breaker.state().await, BreakerState::Closed);

        breaker.acquire().await.unwrap();
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Open);

        let err = breaker.acquire().await.unwrap_err();
        assert_eq!(err.name, "comfyui");
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures_when_closed() {
        let breaker = fast_breaker(3, 1);
        breaker.acquire().await.unwrap();
        breaker.record_failure().await;
        breaker.acquire().await.unwrap();
        breaker.record_failure().await;
        breaker.acquire().await.unwrap();
        breaker.record_success().await;
        breaker.acquire().await.unwrap();
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_needs_success_threshold_to_close() {
        let breaker = fast_breaker(1, 2);
        breaker.acquire().await.unwrap();
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Open);

        // recovery_timeout is zero, so the next acquire probes half-open.
        breaker.acquire().await.unwrap();
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);
        breaker.record_success().await;
        assert_eq!(
            breaker.state().await,
            BreakerState::HalfOpen,
            "one success is not enough when success_threshold is 2"
        );
        breaker.acquire().await.unwrap();
        breaker.record_success().await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn failure_in_half_open_reopens() {
        let breaker = fast_breaker(1, 2);
        breaker.acquire().await.unwrap();
        breaker.record_failure().await;
        breaker.acquire().await.unwrap();
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Open);
        assert_eq!(breaker.stats().await.circuit_opens, 2);
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_within_timeout() {
        let breaker = CircuitBreaker::new(
            "storage",
            BreakerConfig {
                failure_threshold: 1,
                recovery_timeout_secs: 3600,
                success_threshold: 1,
            },
        );
        breaker.acquire().await.unwrap();
        breaker.record_failure().await;
        for _ in 0..3 {
            assert!(breaker.acquire().await.is_err());
        }
    }

    #[tokio::test]
    async fn call_wrapper_records_outcomes() {
        let breaker = fast_breaker(2, 1);
        let ok: Result<Result<u32, String>, _> = breaker.call(|| async { Ok(7) }).await;
        assert_eq!(ok.unwrap().unwrap(), 7);
        let err: Result<Result<u32, String>, _> =
            breaker.call(|| async { Err("boom".to_string()) }).await;
        assert!(err.unwrap().is_err());
        let stats = breaker.stats().await;
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.total_failures, 1);
        assert_eq!(stats.success_rate, 0.5);
    }

    #[tokio::test]
    async fn manual_reset_closes_and_zeros() {
        let breaker = fast_breaker(1, 2);
        breaker.acquire().await.unwrap();
        breaker.record_failure().await;
        breaker.reset().await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
        assert_eq!(breaker.stats().await.failure_count, 0);
    }

    #[tokio::test]
    async fn set_has_default_catalog_and_grows_on_demand() {
        let set = BreakerSet::new();
        let stats = set.all_stats().await;
        for name in ["default", "comfyui", "storage", "gpu_allocation", "external_api"] {
            assert!(stats.contains_key(name), "missing breaker {name}");
        }

        let dynamic = set.breaker("takes_service").await;
        assert_eq!(dynamic.name, "takes_service");
        assert!(set.all_stats().await.contains_key("takes_service"));
    }

    #[tokio::test]
    async fn set_health_reports_open_breakers() {
        let set = BreakerSet::new();
        let gpu = set.breaker("gpu_allocation").await;
        gpu.acquire().await.unwrap();
        gpu.record_failure().await;
        gpu.acquire().await.unwrap();
        gpu.record_failure().await;

        let health = set.health().await;
        assert!(!health.healthy);
        assert_eq!(health.open_breakers, vec!["gpu_allocation"]);
        assert!(set.reset("gpu_allocation").await);
        assert!(set.health().await.healthy);
    }
}
