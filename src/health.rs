//! Provider health checks and circuit breaking
//!
//! Health checks are observations for operators: a background monitor probes
//! registered providers and keeps a bounded history ring per provider. The
//! circuit breaker is deliberately decoupled — it reacts only to actual call
//! outcomes, never to health probe results.

use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Health status of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Result of a single health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub latency_ms: f64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn healthy(latency_ms: f64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            latency_ms,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn unhealthy(latency_ms: f64, error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            latency_ms,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Interface for providers that support health checks
#[async_trait]
pub trait HealthCheckable: Send + Sync {
    /// Perform a health check on the provider
    async fn health_check(&self) -> HealthCheckResult;

    /// Provider name for monitoring and logs (e.g. "storage_local")
    fn provider_name(&self) -> &str;
}

/// Circuit breaker tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Successes required to close from half-open
    pub success_threshold: u32,
    /// Seconds the circuit stays open before admitting a probe call
    pub timeout_seconds: u64,
    /// Concurrent calls admitted while half-open
    pub half_open_request_limit: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout_seconds: 60,
            half_open_request_limit: 3,
        }
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing, rejecting requests
    Open,
    /// Testing whether the provider recovered
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_in_flight: u32,
    last_failure_time: Option<Instant>,
}

/// Point-in-time view of a breaker for operators
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub is_operational: bool,
}

/// Per-provider circuit breaker
///
/// Admission counting and success/failure bookkeeping happen inside the
/// mutex; the wrapped call executes outside it.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Where a call was admitted, so completion can be accounted correctly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Closed,
    HalfOpen,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_in_flight: 0,
                last_failure_time: None,
            }),
        }
    }

    /// Execute a future through the breaker
    ///
    /// Rejects with `CircuitOpen` when the circuit is open, or when the
    /// half-open concurrent admission limit is reached.
    pub async fn call<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        let admission = self.admit()?;
        match fut.await {
            Ok(value) => {
                self.record_success(admission);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(admission);
                Err(e)
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock").state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock");
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            is_operational: inner.state != CircuitState::Open,
        }
    }

    fn admit(&self) -> Result<Admission> {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            CircuitState::Closed => Ok(Admission::Closed),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= Duration::from_secs(self.config.timeout_seconds) {
                    tracing::info!("Circuit breaker transitioning to half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    inner.half_open_in_flight = 1;
                    Ok(Admission::HalfOpen)
                } else {
                    let remaining =
                        Duration::from_secs(self.config.timeout_seconds).saturating_sub(elapsed);
                    Err(RuntimeError::CircuitOpen(format!(
                        "retry after {}s",
                        remaining.as_secs().max(1)
                    )))
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_request_limit {
                    Err(RuntimeError::CircuitOpen(
                        "half-open request limit reached".to_string(),
                    ))
                } else {
                    inner.half_open_in_flight += 1;
                    Ok(Admission::HalfOpen)
                }
            }
        }
    }

    fn record_success(&self, admission: Admission) {
        let mut inner = self.inner.lock().expect("breaker lock");
        if admission == Admission::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!("Circuit breaker closed after recovery");
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.half_open_in_flight = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, admission: Admission) {
        let mut inner = self.inner.lock().expect("breaker lock");
        if admission == Admission::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        inner.failure_count += 1;
        inner.last_failure_time = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = inner.failure_count,
                        "Circuit breaker opened"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("Circuit breaker reopened after failure in half-open state");
                inner.state = CircuitState::Open;
                inner.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }
}

/// Latest health view for a registered provider
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub latest: Option<HealthCheckResult>,
    pub history_size: usize,
}

struct MonitorInner {
    check_interval: Duration,
    max_history: usize,
    providers: RwLock<HashMap<String, Arc<dyn HealthCheckable>>>,
    history: RwLock<HashMap<String, VecDeque<HealthCheckResult>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MonitorInner {
    async fn check_health(&self, name: &str) -> Result<HealthCheckResult> {
        let provider = {
            let providers = self.providers.read().expect("provider lock");
            providers
                .get(name)
                .cloned()
                .ok_or_else(|| RuntimeError::NotFound(format!("Provider not registered: {}", name)))?
        };

        let result = provider.health_check().await;
        self.record(name, result.clone());
        Ok(result)
    }

    fn record(&self, name: &str, result: HealthCheckResult) {
        let mut history = self.history.write().expect("history lock");
        let ring = history.entry(name.to_string()).or_default();
        ring.push_back(result);
        while ring.len() > self.max_history {
            ring.pop_front();
        }
    }
}

/// Background health monitor
///
/// Probes every registered provider on a fixed interval and appends results
/// to a bounded per-provider ring. Results are observations only — they do
/// not mutate circuit breakers.
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

impl HealthMonitor {
    pub fn new(check_interval_seconds: u64) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                check_interval: Duration::from_secs(check_interval_seconds),
                max_history: 100,
                providers: RwLock::new(HashMap::new()),
                history: RwLock::new(HashMap::new()),
                shutdown: Mutex::new(None),
                task: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Register a provider for periodic health checks
    pub fn register(&self, name: impl Into<String>, provider: Arc<dyn HealthCheckable>) {
        let name = name.into();
        tracing::info!(provider = %name, "Registered provider for health monitoring");
        self.inner
            .providers
            .write()
            .expect("provider lock")
            .insert(name.clone(), provider);
        self.inner
            .history
            .write()
            .expect("history lock")
            .entry(name)
            .or_default();
    }

    /// Check a single provider now and record the result
    pub async fn check_health(&self, name: &str) -> Result<HealthCheckResult> {
        self.inner.check_health(name).await
    }

    /// Start the monitoring loop; idempotent
    pub async fn start(&self) {
        {
            let mut shutdown = self.inner.shutdown.lock().expect("shutdown lock");
            if shutdown.is_some() {
                return;
            }
            let (tx, rx) = watch::channel(false);
            *shutdown = Some(tx);
            drop(shutdown);

            let monitor = Arc::clone(&self.inner);
            let mut rx = rx;
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(monitor.check_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let names: Vec<String> = {
                                let providers = monitor.providers.read().expect("provider lock");
                                providers.keys().cloned().collect()
                            };
                            for name in names {
                                match monitor.check_health(&name).await {
                                    Ok(result) if result.status == HealthStatus::Unhealthy => {
                                        tracing::warn!(
                                            provider = %name,
                                            error = ?result.error,
                                            "Provider is unhealthy"
                                        );
                                    }
                                    Ok(_) => {}
                                    Err(e) => {
                                        tracing::error!(provider = %name, error = %e, "Health check failed");
                                    }
                                }
                            }
                        }
                        _ = rx.changed() => break,
                    }
                }
            });
            *self.inner.task.lock().await = Some(handle);
        }
        tracing::info!("Health monitor started");
    }

    /// Stop the monitoring loop and await its termination
    pub async fn stop(&self) {
        let sender = self.inner.shutdown.lock().expect("shutdown lock").take();
        if let Some(tx) = sender {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.inner.task.lock().await.take() {
            let _ = handle.await;
        }
        tracing::info!("Health monitor stopped");
    }

    /// Latest recorded result for a provider
    pub fn latest(&self, name: &str) -> Option<HealthCheckResult> {
        let history = self.inner.history.read().expect("history lock");
        history.get(name).and_then(|ring| ring.back().cloned())
    }

    /// Current status of one provider
    pub fn status(&self, name: &str) -> Result<ProviderHealth> {
        let providers = self.inner.providers.read().expect("provider lock");
        if !providers.contains_key(name) {
            return Err(RuntimeError::NotFound(format!(
                "Provider not registered: {}",
                name
            )));
        }
        let history = self.inner.history.read().expect("history lock");
        let ring = history.get(name);
        Ok(ProviderHealth {
            name: name.to_string(),
            latest: ring.and_then(|r| r.back().cloned()),
            history_size: ring.map(|r| r.len()).unwrap_or(0),
        })
    }

    /// Status of every registered provider
    pub fn all_status(&self) -> Vec<ProviderHealth> {
        let names: Vec<String> = {
            let providers = self.inner.providers.read().expect("provider lock");
            providers.keys().cloned().collect()
        };
        names
            .into_iter()
            .filter_map(|n| self.status(&n).ok())
            .collect()
    }
}
