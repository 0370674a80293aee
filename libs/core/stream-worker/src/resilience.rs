//! Circuit breaker with state shared across processes.
//!
//! ```text
//! ┌─────────┐  failures >= threshold  ┌────────┐
//! │ CLOSED  │ ──────────────────────> │  OPEN  │ <─┐
//! └─────────┘   (within the window)   └────────┘   │
//!      ^                                   │       │ probe failed
//!      │                                   │ cooldown elapsed
//!      │      probe succeeded     ┌─────────────┐  │
//!      └───────────────────────── │  HALF-OPEN  │ ─┘
//!                                 └─────────────┘
//! ```
//!
//! Every caller of a dependency shares one breaker entry in a
//! [`BreakerStateStore`]. [`RedisBreakerStore`] makes each transition a single
//! Lua script so concurrent workers never admit two probes;
//! [`InMemoryBreakerStore`] gives tests and single-process tools the same
//! semantics.
//!
//! ```rust,ignore
//! let breaker = CircuitBreaker::new("vector-store", BreakerConfig::default(), store);
//! let vector = breaker.call(|| repo.get(owner_id)).await?;
//! ```

use crate::error::StreamError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use redis::Script;
use redis::aio::ConnectionManager;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures within `window` that open the circuit
    pub failure_threshold: u32,
    /// Time spent open before a probe is admitted
    pub cooldown: Duration,
    /// Failures older than this no longer count
    pub window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            window: Duration::from_secs(60),
        }
    }
}

impl BreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    fn cooldown_ms(&self) -> i64 {
        self.cooldown.as_millis() as i64
    }

    fn window_ms(&self) -> i64 {
        self.window.as_millis() as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub failure_count: u32,
    pub is_open: bool,
    pub opened_at: Option<DateTime<Utc>>,
    pub state: CircuitState,
}

impl BreakerSnapshot {
    fn closed(failure_count: u32) -> Self {
        Self {
            failure_count,
            is_open: false,
            opened_at: None,
            state: CircuitState::Closed,
        }
    }

    fn open(failure_count: u32, opened_at_ms: i64, config: &BreakerConfig, now_ms: i64) -> Self {
        let state = if now_ms >= opened_at_ms + config.cooldown_ms() {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        };
        Self {
            failure_count,
            is_open: true,
            opened_at: DateTime::from_timestamp_millis(opened_at_ms),
            state,
        }
    }
}

/// Decision for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single call allowed through after the cooldown
    Probe,
    Rejected,
}

/// Shared breaker state. Implementations must make every method atomic per name.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BreakerStateStore: Send + Sync {
    /// Decide whether a call may proceed. At most one probe is admitted per
    /// cooldown period.
    async fn admit(
        &self,
        name: &str,
        config: &BreakerConfig,
        now_ms: i64,
    ) -> Result<Admission, StreamError>;

    /// Count a failure. Returns `true` when this failure opened (or re-opened)
    /// the circuit.
    async fn record_failure(
        &self,
        name: &str,
        config: &BreakerConfig,
        now_ms: i64,
        probe: bool,
    ) -> Result<bool, StreamError>;

    /// A probe succeeded. Returns `true` when the circuit was closed by it.
    async fn record_success(&self, name: &str) -> Result<bool, StreamError>;

    async fn snapshot(
        &self,
        name: &str,
        config: &BreakerConfig,
        now_ms: i64,
    ) -> Result<BreakerSnapshot, StreamError>;

    async fn reset(&self, name: &str) -> Result<(), StreamError>;
}

#[derive(Debug, Clone, Default)]
struct Entry {
    failures: u32,
    first_failure_ms: i64,
    open: bool,
    opened_at_ms: i64,
    probe_until_ms: i64,
}

impl Entry {
    /// Mirrors the key expiry used by the Redis store.
    fn expired(&self, config: &BreakerConfig, now_ms: i64) -> bool {
        if self.open {
            now_ms >= self.opened_at_ms + config.cooldown_ms() + config.window_ms()
        } else {
            self.failures > 0 && now_ms >= self.first_failure_ms + config.window_ms()
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryBreakerStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<T>(
        &self,
        name: &str,
        config: &BreakerConfig,
        now_ms: i64,
        f: impl FnOnce(&mut Entry) -> T,
    ) -> Result<T, StreamError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StreamError::Config("breaker state lock poisoned".to_string()))?;
        let entry = entries.entry(name.to_string()).or_default();
        if entry.expired(config, now_ms) {
            *entry = Entry::default();
        }
        Ok(f(entry))
    }
}

#[async_trait]
impl BreakerStateStore for InMemoryBreakerStore {
    async fn admit(
        &self,
        name: &str,
        config: &BreakerConfig,
        now_ms: i64,
    ) -> Result<Admission, StreamError> {
        self.with_entry(name, config, now_ms, |e| {
            if !e.open {
                return Admission::Allowed;
            }
            if now_ms < e.opened_at_ms + config.cooldown_ms() || now_ms < e.probe_until_ms {
                return Admission::Rejected;
            }
            e.probe_until_ms = now_ms + config.cooldown_ms();
            Admission::Probe
        })
    }

    async fn record_failure(
        &self,
        name: &str,
        config: &BreakerConfig,
        now_ms: i64,
        probe: bool,
    ) -> Result<bool, StreamError> {
        self.with_entry(name, config, now_ms, |e| {
            if e.open {
                if probe {
                    e.opened_at_ms = now_ms;
                    e.probe_until_ms = 0;
                    return true;
                }
                return false;
            }

            if e.failures == 0 {
                e.first_failure_ms = now_ms;
            }
            e.failures += 1;
            if e.failures >= config.failure_threshold {
                e.open = true;
                e.opened_at_ms = now_ms;
                e.probe_until_ms = 0;
                return true;
            }
            false
        })
    }

    async fn record_success(&self, name: &str) -> Result<bool, StreamError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StreamError::Config("breaker state lock poisoned".to_string()))?;
        Ok(entries.remove(name).is_some_and(|e| e.open))
    }

    async fn snapshot(
        &self,
        name: &str,
        config: &BreakerConfig,
        now_ms: i64,
    ) -> Result<BreakerSnapshot, StreamError> {
        self.with_entry(name, config, now_ms, |e| {
            if e.open {
                BreakerSnapshot::open(e.failures, e.opened_at_ms, config, now_ms)
            } else {
                BreakerSnapshot::closed(e.failures)
            }
        })
    }

    async fn reset(&self, name: &str) -> Result<(), StreamError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StreamError::Config("breaker state lock poisoned".to_string()))?;
        entries.remove(name);
        Ok(())
    }
}

const ADMIT_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'open') ~= '1' then
  return 0
end
local now = tonumber(ARGV[1])
local cooldown = tonumber(ARGV[2])
local opened_at = tonumber(redis.call('HGET', KEYS[1], 'opened_at') or '0')
if now < opened_at + cooldown then
  return 2
end
local probe_until = tonumber(redis.call('HGET', KEYS[1], 'probe_until') or '0')
if now < probe_until then
  return 2
end
redis.call('HSET', KEYS[1], 'probe_until', now + cooldown)
return 1
"#;

const FAILURE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local threshold = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local cooldown = tonumber(ARGV[4])
local probe = ARGV[5] == '1'
if redis.call('HGET', KEYS[1], 'open') == '1' then
  if probe then
    redis.call('HSET', KEYS[1], 'opened_at', now, 'probe_until', 0)
    redis.call('PEXPIRE', KEYS[1], cooldown + window)
    return 1
  end
  return 0
end
local failures = redis.call('HINCRBY', KEYS[1], 'failures', 1)
if failures == 1 then
  redis.call('PEXPIRE', KEYS[1], window)
end
if failures >= threshold then
  redis.call('HSET', KEYS[1], 'open', 1, 'opened_at', now, 'probe_until', 0)
  redis.call('PEXPIRE', KEYS[1], cooldown + window)
  return 1
end
return 0
"#;

const SUCCESS_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'open') == '1' then
  redis.call('DEL', KEYS[1])
  return 1
end
return 0
"#;

/// Breaker state in a Redis hash `breaker:{name}` with fields
/// `failures`, `open`, `opened_at` and `probe_until`.
#[derive(Clone)]
pub struct RedisBreakerStore {
    redis: ConnectionManager,
    admit: Script,
    failure: Script,
    success: Script,
}

impl RedisBreakerStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            admit: Script::new(ADMIT_SCRIPT),
            failure: Script::new(FAILURE_SCRIPT),
            success: Script::new(SUCCESS_SCRIPT),
        }
    }

    fn key(name: &str) -> String {
        format!("breaker:{}", name)
    }
}

#[async_trait]
impl BreakerStateStore for RedisBreakerStore {
    async fn admit(
        &self,
        name: &str,
        config: &BreakerConfig,
        now_ms: i64,
    ) -> Result<Admission, StreamError> {
        let mut conn = self.redis.clone();
        let decision: i64 = self
            .admit
            .key(Self::key(name))
            .arg(now_ms)
            .arg(config.cooldown_ms())
            .invoke_async(&mut conn)
            .await?;

        Ok(match decision {
            0 => Admission::Allowed,
            1 => Admission::Probe,
            _ => Admission::Rejected,
        })
    }

    async fn record_failure(
        &self,
        name: &str,
        config: &BreakerConfig,
        now_ms: i64,
        probe: bool,
    ) -> Result<bool, StreamError> {
        let mut conn = self.redis.clone();
        let opened: i64 = self
            .failure
            .key(Self::key(name))
            .arg(now_ms)
            .arg(config.failure_threshold)
            .arg(config.window_ms().max(1))
            .arg(config.cooldown_ms())
            .arg(if probe { 1 } else { 0 })
            .invoke_async(&mut conn)
            .await?;
        Ok(opened == 1)
    }

    async fn record_success(&self, name: &str) -> Result<bool, StreamError> {
        let mut conn = self.redis.clone();
        let closed: i64 = self
            .success
            .key(Self::key(name))
            .invoke_async(&mut conn)
            .await?;
        Ok(closed == 1)
    }

    async fn snapshot(
        &self,
        name: &str,
        config: &BreakerConfig,
        now_ms: i64,
    ) -> Result<BreakerSnapshot, StreamError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(Self::key(name))
            .query_async(&mut conn)
            .await?;

        let number = |field: &str| {
            fields
                .get(field)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0)
        };

        let failures = number("failures") as u32;
        if number("open") == 1 {
            Ok(BreakerSnapshot::open(failures, number("opened_at"), config, now_ms))
        } else {
            Ok(BreakerSnapshot::closed(failures))
        }
    }

    async fn reset(&self, name: &str) -> Result<(), StreamError> {
        let mut conn = self.redis.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(Self::key(name))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit '{name}' is open")]
    Open { name: String },

    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    store: Arc<dyn BreakerStateStore>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: BreakerConfig,
        store: Arc<dyn BreakerStateStore>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            store,
        }
    }

    /// Breaker whose state lives only in this process.
    pub fn in_memory(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::new(name, config, Arc::new(InMemoryBreakerStore::new()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Run `op` through the breaker, counting every error as a failure.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with(op, |_| true).await
    }

    /// Run `op` through the breaker. Errors for which `is_failure` returns
    /// `false` are passed through without counting against the dependency.
    pub async fn call_with<T, E, F, Fut>(
        &self,
        op: F,
        is_failure: impl Fn(&E) -> bool,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = match self.store.admit(&self.name, &self.config, now_ms()).await {
            Ok(admission) => admission,
            Err(e) => {
                warn!(breaker = %self.name, error = %e, "Breaker state unavailable, admitting call");
                Admission::Allowed
            }
        };

        let probe = match admission {
            Admission::Rejected => {
                counter!("circuit_breaker_rejections_total", "breaker" => self.name.clone())
                    .increment(1);
                return Err(BreakerError::Open {
                    name: self.name.clone(),
                });
            }
            Admission::Probe => {
                info!(breaker = %self.name, "Circuit half-open, admitting probe");
                self.transition("half_open");
                true
            }
            Admission::Allowed => false,
        };

        match op().await {
            Ok(value) => {
                if probe {
                    self.on_probe_success().await;
                }
                Ok(value)
            }
            Err(e) => {
                if is_failure(&e) {
                    self.on_failure(probe).await;
                } else if probe {
                    self.on_probe_success().await;
                }
                Err(BreakerError::Inner(e))
            }
        }
    }

    pub async fn snapshot(&self) -> Result<BreakerSnapshot, StreamError> {
        self.store.snapshot(&self.name, &self.config, now_ms()).await
    }

    pub async fn reset(&self) -> Result<(), StreamError> {
        self.store.reset(&self.name).await?;
        info!(breaker = %self.name, "Circuit breaker reset");
        Ok(())
    }

    async fn on_failure(&self, probe: bool) {
        match self
            .store
            .record_failure(&self.name, &self.config, now_ms(), probe)
            .await
        {
            Ok(true) => {
                warn!(
                    breaker = %self.name,
                    probe,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "Circuit opened"
                );
                self.transition("open");
            }
            Ok(false) => {}
            Err(e) => warn!(breaker = %self.name, error = %e, "Failed to record breaker failure"),
        }
    }

    async fn on_probe_success(&self) {
        match self.store.record_success(&self.name).await {
            Ok(true) => {
                info!(breaker = %self.name, "Circuit closed");
                self.transition("closed");
            }
            Ok(false) => {}
            Err(e) => warn!(breaker = %self.name, error = %e, "Failed to record breaker success"),
        }
    }

    fn transition(&self, to: &'static str) {
        counter!(
            "circuit_breaker_transitions_total",
            "breaker" => self.name.clone(),
            "to" => to
        )
        .increment(1);
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> BreakerConfig {
        BreakerConfig::default()
    }

    async fn fail_times(store: &InMemoryBreakerStore, n: u32, now: i64) -> bool {
        let mut opened = false;
        for _ in 0..n {
            opened = store.record_failure("dep", &config(), now, false).await.unwrap();
        }
        opened
    }

    #[tokio::test]
    async fn test_opens_at_threshold() {
        let store = InMemoryBreakerStore::new();
        assert!(!fail_times(&store, 4, 1_000).await);
        assert_eq!(store.admit("dep", &config(), 1_000).await.unwrap(), Admission::Allowed);

        assert!(store.record_failure("dep", &config(), 1_000, false).await.unwrap());
        assert_eq!(store.admit("dep", &config(), 1_001).await.unwrap(), Admission::Rejected);

        let snapshot = store.snapshot("dep", &config(), 1_001).await.unwrap();
        assert!(snapshot.is_open);
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.failure_count, 5);
    }

    #[tokio::test]
    async fn test_failures_outside_window_do_not_count() {
        let store = InMemoryBreakerStore::new();
        fail_times(&store, 4, 0).await;
        // window is 60s; the counter starts over
        assert!(!fail_times(&store, 4, 61_000).await);
        assert_eq!(store.admit("dep", &config(), 61_000).await.unwrap(), Admission::Allowed);
    }

    #[tokio::test]
    async fn test_single_probe_after_cooldown() {
        let store = InMemoryBreakerStore::new();
        fail_times(&store, 5, 0).await;

        assert_eq!(store.admit("dep", &config(), 59_999).await.unwrap(), Admission::Rejected);
        assert_eq!(store.admit("dep", &config(), 60_000).await.unwrap(), Admission::Probe);
        assert_eq!(store.admit("dep", &config(), 60_001).await.unwrap(), Admission::Rejected);
        assert_eq!(
            store.snapshot("dep", &config(), 60_001).await.unwrap().state,
            CircuitState::HalfOpen
        );
    }

    #[tokio::test]
    async fn test_probe_success_closes() {
        let store = InMemoryBreakerStore::new();
        fail_times(&store, 5, 0).await;
        assert_eq!(store.admit("dep", &config(), 60_000).await.unwrap(), Admission::Probe);

        assert!(store.record_success("dep").await.unwrap());
        let snapshot = store.snapshot("dep", &config(), 60_001).await.unwrap();
        assert_eq!(snapshot, BreakerSnapshot::closed(0));
        assert_eq!(store.admit("dep", &config(), 60_001).await.unwrap(), Admission::Allowed);
    }

    #[tokio::test]
    async fn test_probe_failure_restarts_cooldown() {
        let store = InMemoryBreakerStore::new();
        fail_times(&store, 5, 0).await;
        assert_eq!(store.admit("dep", &config(), 60_000).await.unwrap(), Admission::Probe);

        assert!(store.record_failure("dep", &config(), 60_500, true).await.unwrap());
        assert_eq!(store.admit("dep", &config(), 100_000).await.unwrap(), Admission::Rejected);
        assert_eq!(store.admit("dep", &config(), 120_500).await.unwrap(), Admission::Probe);
    }

    #[tokio::test]
    async fn test_late_failure_while_open_is_ignored() {
        let store = InMemoryBreakerStore::new();
        fail_times(&store, 5, 0).await;
        assert!(!store.record_failure("dep", &config(), 30_000, false).await.unwrap());
        assert_eq!(store.admit("dep", &config(), 60_000).await.unwrap(), Admission::Probe);
    }

    #[tokio::test]
    async fn test_breaker_fails_fast_when_open() {
        let breaker = CircuitBreaker::in_memory("vector-store", config());
        let calls = AtomicU32::new(0);

        for _ in 0..5 {
            let result: Result<(), BreakerError<&str>> = breaker
                .call(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("timeout")
                })
                .await;
            assert!(matches!(result, Err(BreakerError::Inner("timeout"))));
        }

        let result: Result<(), BreakerError<&str>> = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(result.unwrap_err().is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_excluded_errors_do_not_trip() {
        let breaker = CircuitBreaker::in_memory("vector-store", config());

        for _ in 0..10 {
            let result: Result<(), BreakerError<&str>> = breaker
                .call_with(|| async { Err("conflict") }, |e| *e != "conflict")
                .await;
            assert!(!result.unwrap_err().is_open());
        }
        assert!(!breaker.snapshot().await.unwrap().is_open);
    }

    #[tokio::test]
    async fn test_probe_through_breaker_closes_circuit() {
        let breaker =
            CircuitBreaker::in_memory("encoder", config().with_cooldown(Duration::ZERO));
        for _ in 0..5 {
            let _: Result<(), BreakerError<&str>> = breaker.call(|| async { Err("down") }).await;
        }
        assert!(breaker.snapshot().await.unwrap().is_open);

        let result: Result<u32, BreakerError<&str>> = breaker.call(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert!(!breaker.snapshot().await.unwrap().is_open);
    }

    #[tokio::test]
    async fn test_store_error_fails_open() {
        let mut store = MockBreakerStateStore::new();
        store
            .expect_admit()
            .returning(|_, _, _| Err(StreamError::Config("redis down".into())));
        store.expect_record_failure().never();

        let breaker = CircuitBreaker::new("dep", config(), Arc::new(store));
        let result: Result<u32, BreakerError<&str>> = breaker.call(|| async { Ok(1) }).await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    #[ignore] // Requires actual Redis
    async fn test_redis_store_transitions() {
        let redis = test_utils::TestRedis::new().await;
        let store = RedisBreakerStore::new(redis.connection());
        let cfg = config();

        for _ in 0..4 {
            assert!(!store.record_failure("it", &cfg, 0, false).await.unwrap());
        }
        assert!(store.record_failure("it", &cfg, 0, false).await.unwrap());
        assert_eq!(store.admit("it", &cfg, 1).await.unwrap(), Admission::Rejected);
        assert_eq!(store.admit("it", &cfg, 60_000).await.unwrap(), Admission::Probe);
        assert_eq!(store.admit("it", &cfg, 60_001).await.unwrap(), Admission::Rejected);
        assert!(store.record_success("it").await.unwrap());
        assert!(!store.snapshot("it", &cfg, 60_002).await.unwrap().is_open);
    }
}
