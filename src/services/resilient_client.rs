//! Circuit-breaker guarded access to the remote cache backend.
//!
//! Every cache call of the services goes through [`ResilientClient::call`] or
//! [`ResilientClient::execute_with_fallback`]; call sites only choose a fallback.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{RwLock, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::{
    config::CircuitConfig,
    dao::cache::{CacheBackend, CacheError, CacheResult},
};

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow to the backend.
    Closed,
    /// Calls fail fast until the cooldown elapses.
    Open,
    /// One trial call decides whether to close again.
    HalfOpen,
}

/// Failure of a guarded backend call.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The breaker rejected the call without reaching the backend.
    #[error("circuit breaker is open")]
    CircuitOpen,
    /// No backend is installed yet.
    #[error("cache backend is not connected")]
    Unavailable,
    /// The backend answered with an error.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

struct BreakerState {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Consecutive-failure circuit breaker with a single half-open trial.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerState>,
}

/// Admission granted by [`CircuitBreaker::try_acquire`]; report the outcome through it.
///
/// Dropping a trial permit without an outcome (the call was cancelled) frees the trial slot.
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    /// Record a successful call.
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    /// Record a failed call.
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    /// Closed breaker opening after `failure_threshold` consecutive failures.
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cooled_down(&self, inner: &BreakerState) -> bool {
        inner
            .last_failure
            .is_none_or(|at| at.elapsed() >= self.cooldown)
    }

    /// Current position. An open breaker whose cooldown elapsed reports `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.state {
            CircuitState::Open if self.cooled_down(&inner) => CircuitState::HalfOpen,
            state => state,
        }
    }

    /// Consecutive failures recorded since the last success.
    pub fn failures(&self) -> u32 {
        self.lock().failures
    }

    /// Ask permission to call the backend.
    pub fn try_acquire(&self) -> Result<Permit<'_>, BackendError> {
        let mut inner = self.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                if !self.cooled_down(&inner) {
                    return Err(BackendError::CircuitOpen);
                }
                info!("circuit breaker cooldown elapsed; allowing a trial call");
                inner.state = CircuitState::HalfOpen;
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(BackendError::CircuitOpen);
                }
                true
            }
        };
        if trial {
            inner.trial_in_flight = true;
        }
        Ok(Permit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    /// Close the breaker and reset the failure counter.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!("circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.trial_in_flight = false;
    }

    /// Count a failure, opening the breaker at the threshold or after a failed trial.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.trial_in_flight = false;
        let should_open =
            inner.state == CircuitState::HalfOpen || inner.failures >= self.failure_threshold;
        if should_open && inner.state != CircuitState::Open {
            warn!(
                failures = inner.failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "circuit breaker opened"
            );
        }
        if should_open {
            inner.state = CircuitState::Open;
        }
    }
}

/// Owner of one cache backend connection and the breaker guarding it.
///
/// Constructed once at startup and shared by reference; `close()` ends its lifecycle.
pub struct ResilientClient {
    label: &'static str,
    backend: RwLock<Option<Arc<dyn CacheBackend>>>,
    breaker: CircuitBreaker,
    degraded: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ResilientClient {
    /// Client without a backend. It stays degraded until one is installed.
    pub fn new(label: &'static str, config: &CircuitConfig) -> Arc<Self> {
        let (degraded, _rx) = watch::channel(true);
        Arc::new(Self {
            label,
            backend: RwLock::new(None),
            breaker: CircuitBreaker::new(config.failure_threshold, config.cooldown()),
            degraded,
            supervisor: Mutex::new(None),
        })
    }

    /// Client with `backend` already installed.
    pub async fn with_backend(
        label: &'static str,
        config: &CircuitConfig,
        backend: Arc<dyn CacheBackend>,
    ) -> Arc<Self> {
        let client = Self::new(label, config);
        client.install(backend).await;
        client
    }

    /// Name used in logs to tell pools apart.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Install a backend and leave degraded mode.
    pub async fn install(&self, backend: Arc<dyn CacheBackend>) {
        {
            let mut guard = self.backend.write().await;
            *guard = Some(backend);
        }
        self.set_degraded(false);
    }

    /// Drop the current backend and enter degraded mode.
    pub async fn clear(&self) {
        {
            let mut guard = self.backend.write().await;
            guard.take();
        }
        self.set_degraded(true);
    }

    /// Keep the supervisor task so [`ResilientClient::close`] can stop it.
    pub fn attach_supervisor(&self, handle: JoinHandle<()>) {
        let mut guard = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = guard.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the supervisor and release the backend connection.
    pub async fn close(&self) {
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.clear().await;
        info!(client = self.label, "cache client closed");
    }

    /// Installed backend, or `None` when none is connected or the breaker is open.
    pub async fn get_client(&self) -> Option<Arc<dyn CacheBackend>> {
        if self.breaker.state() == CircuitState::Open {
            return None;
        }
        let guard = self.backend.read().await;
        guard.as_ref().cloned()
    }

    /// Run `op` against the backend through the breaker.
    pub async fn call<T, F>(&self, op: F) -> Result<T, BackendError>
    where
        F: FnOnce(&dyn CacheBackend) -> BoxFuture<'static, CacheResult<T>>,
    {
        let backend = {
            let guard = self.backend.read().await;
            guard.as_ref().cloned()
        };
        let Some(backend) = backend else {
            return Err(BackendError::Unavailable);
        };

        let permit = self.breaker.try_acquire()?;
        match op(backend.as_ref()).await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                permit.failure();
                Err(err.into())
            }
        }
    }

    /// Run `op`, returning `fallback` on any failure. Never fails.
    pub async fn execute_with_fallback<T, F>(&self, op: F, fallback: T) -> T
    where
        F: FnOnce(&dyn CacheBackend) -> BoxFuture<'static, CacheResult<T>>,
    {
        match self.call(op).await {
            Ok(value) => value,
            Err(err) => {
                warn!(client = self.label, error = %err, "cache call failed; using fallback");
                fallback
            }
        }
    }

    /// Snapshot of the breaker position.
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Whether the supervisor currently considers the backend unreachable.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Wait until a backend is installed and healthy. Returns `false` once `timeout` elapses first.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut watcher = self.degraded.subscribe();
        matches!(
            tokio::time::timeout(timeout, watcher.wait_for(|degraded| !*degraded)).await,
            Ok(Ok(_))
        )
    }

    pub(crate) fn set_degraded(&self, value: bool) {
        self.degraded.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }
}
