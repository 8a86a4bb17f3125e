//! Execution substrate: lifecycle, retry, timeout and circuit breaking.
//!
//! Every storage and network call of the kernel goes through a [`Runner`]:
//!
//! 1. The circuit breaker admits or rejects the call (`CircuitOpen`).
//! 2. Each attempt runs under the per-attempt timeout and the caller's
//!    [`Deadline`], whichever is closer.
//! 3. Transient failures (`Timeout`, `Backend { transient: true }`) are retried
//!    with exponential backoff; everything else returns at once.
//! 4. An attempt timeout of a non-idempotent operation is surfaced as
//!    `Timeout` and never retried, since the abandoned attempt may have
//!    written.
//! 5. One [`RunRecord`] is handed to the [`MetricsSink`] per call.
//!
//! [`RunnableTask`] wraps a [`Runnable`] in the checked lifecycle
//! `Created -> Initializing -> Ready -> Running -> {Completed | Failed} -> Stopped`.

pub mod breaker;
pub mod metrics;
pub mod retry;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{GraphError, Result};

pub use breaker::{BreakerConfig, BreakerPermit, BreakerState, CircuitBreaker};
pub use metrics::{InMemoryMetrics, MetricsSink, NoOpMetrics, RunOutcome, RunRecord, TracingMetrics};
pub use retry::RetryPolicy;

/// Lifecycle state of a runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnableState {
    /// Constructed, no resources held.
    Created,
    /// `setup` in progress.
    Initializing,
    /// Resources acquired.
    Ready,
    /// An execution is in flight.
    Running,
    /// Last execution succeeded.
    Completed,
    /// Setup or last execution failed.
    Failed,
    /// Torn down; terminal.
    Stopped,
}

impl RunnableState {
    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(self, to: RunnableState) -> bool {
        use RunnableState::*;
        matches!(
            (self, to),
            (Created, Initializing)
                | (Created, Stopped)
                | (Initializing, Ready)
                | (Initializing, Failed)
                | (Ready, Running)
                | (Ready, Stopped)
                | (Running, Completed)
                | (Running, Failed)
                | (Completed, Running)
                | (Completed, Stopped)
                | (Failed, Running)
                | (Failed, Initializing)
                | (Failed, Stopped)
        )
    }
}

impl fmt::Display for RunnableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Initializing => "INITIALIZING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        };
        write!(f, "{}", s)
    }
}

/// Absolute point in time after which a call is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    /// Deadline at an instant.
    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    /// Time left (zero once expired).
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

/// What a call does and to what, for errors, logs and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    /// Operation name.
    pub operation: String,
    /// Target identifier.
    pub target: String,
    /// Whether repeating the operation is safe after an abandoned attempt.
    pub idempotent: bool,
}

impl OperationContext {
    /// Idempotent operation on a target.
    pub fn new(operation: impl Into<String>, target: impl fmt::Display) -> Self {
        Self {
            operation: operation.into(),
            target: target.to_string(),
            idempotent: true,
        }
    }

    /// Mark the operation non-idempotent.
    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    fn timeout(&self, attempt: u32) -> GraphError {
        GraphError::Timeout {
            operation: self.operation.clone(),
            target: self.target.clone(),
            attempt,
        }
    }
}

/// Runner configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Retry policy.
    pub retry: RetryPolicy,
    /// Per-attempt timeout in milliseconds.
    pub attempt_timeout_ms: Option<u64>,
    /// Circuit breaker; disabled when absent.
    pub breaker: Option<BreakerConfig>,
}

impl RunnerConfig {
    /// Per-attempt timeout as a `Duration`.
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }
}

/// Runs operations with retry, timeout and circuit breaking.
///
/// Cheap to clone; clones share the breaker and the metrics sink.
#[derive(Clone)]
pub struct Runner {
    config: RunnerConfig,
    breaker: Option<Arc<CircuitBreaker>>,
    metrics: Arc<dyn MetricsSink>,
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .field("breaker", &self.breaker)
            .finish()
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

impl Runner {
    /// Create a runner emitting metrics through `tracing`.
    pub fn new(config: RunnerConfig) -> Self {
        Self::with_metrics(config, Arc::new(TracingMetrics))
    }

    /// Create a runner with an explicit metrics sink.
    pub fn with_metrics(config: RunnerConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        let breaker = config.breaker.clone().map(|cfg| {
            Arc::new(CircuitBreaker::new("runner", cfg).with_metrics(Arc::clone(&metrics)))
        });
        Self {
            config,
            breaker,
            metrics,
        }
    }

    /// Single attempt, no timeout, no breaker.
    pub fn direct() -> Self {
        Self::passthrough(Arc::new(NoOpMetrics))
    }

    /// Single attempt, no timeout, no breaker, still reporting to `metrics`.
    pub fn passthrough(metrics: Arc<dyn MetricsSink>) -> Self {
        Self::with_metrics(
            RunnerConfig {
                retry: RetryPolicy::none(),
                attempt_timeout_ms: None,
                breaker: None,
            },
            metrics,
        )
    }

    /// Configuration.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// The shared breaker, if enabled.
    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_deref()
    }

    /// Metrics sink.
    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Run `f` with no overall deadline.
    pub async fn call<T, F, Fut>(&self, op: &OperationContext, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.call_with_deadline(op, None, f).await
    }

    /// Run `f`, abandoning the in-flight attempt once `deadline` passes.
    pub async fn call_with_deadline<T, F, Fut>(
        &self,
        op: &OperationContext,
        deadline: Option<Deadline>,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let max_attempts = self.config.retry.attempts();
        let mut attempt = 0u32;

        let result = loop {
            let permit = match &self.breaker {
                Some(breaker) => match breaker.acquire(&op.operation, &op.target) {
                    Ok(permit) => Some(permit),
                    Err(e) => break Err(e),
                },
                None => None,
            };
            attempt += 1;

            let outcome = self.attempt(op, attempt, deadline, f()).await;
            let err = match outcome {
                Ok(value) => {
                    if let Some(permit) = permit {
                        permit.succeed();
                    }
                    break Ok(value);
                }
                Err(err) => err,
            };

            // Non-transient errors mean the backend answered.
            if let Some(permit) = permit {
                if err.is_transient() {
                    permit.fail();
                } else {
                    permit.succeed();
                }
            }

            if deadline.map(|d| d.is_expired()).unwrap_or(false) {
                break Err(op.timeout(attempt));
            }
            if !err.is_transient() {
                break Err(err);
            }
            if matches!(err, GraphError::Timeout { .. }) && !op.idempotent {
                break Err(err);
            }
            if attempt >= max_attempts {
                break Err(GraphError::RetryExhausted {
                    operation: op.operation.clone(),
                    target: op.target.clone(),
                    attempts: attempt,
                    last_error: Box::new(err),
                });
            }

            let delay = self.config.retry.delay_for(attempt);
            if let Some(d) = deadline {
                if d.remaining() <= delay {
                    break Err(op.timeout(attempt));
                }
            }
            warn!(
                operation = %op.operation,
                target = %op.target,
                attempt = attempt,
                wait_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying after backoff"
            );
            tokio::time::sleep(delay).await;
        };

        let record = RunRecord {
            operation: op.operation.clone(),
            target: op.target.clone(),
            duration: start.elapsed(),
            attempts: attempt,
            retries: attempt.saturating_sub(1),
            outcome: match &result {
                Ok(_) => RunOutcome::Success,
                Err(e) => RunOutcome::Failure(e.code().to_string()),
            },
        };
        debug!(operation = %op.operation, target = %op.target, attempts = attempt, "Call finished");
        self.metrics.record_run(&record);
        result
    }

    async fn attempt<T, Fut>(
        &self,
        op: &OperationContext,
        attempt: u32,
        deadline: Option<Deadline>,
        fut: Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let limit = match (self.config.attempt_timeout(), deadline.map(|d| d.remaining())) {
            (Some(a), Some(d)) => Some(a.min(d)),
            (a, d) => a.or(d),
        };
        match limit {
            None => fut.await,
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(op.timeout(attempt)),
            },
        }
    }
}

/// A unit of work with explicit resource acquisition and release.
///
/// `execute` performs a single attempt; retry, timeout and breaker are the
/// job of [`RunnableTask::run`].
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Value produced by a successful execution.
    type Output: Send;

    /// Operation name used in errors and metrics.
    fn name(&self) -> &str;

    /// Target identifier used in errors and metrics.
    fn target(&self) -> String {
        "-".to_string()
    }

    /// Whether `execute` may be repeated after an abandoned attempt.
    fn idempotent(&self) -> bool {
        true
    }

    /// Acquire resources.
    async fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Perform one attempt.
    async fn execute(&self) -> Result<Self::Output>;

    /// Release resources.
    async fn teardown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Drives a [`Runnable`] through its lifecycle.
pub struct RunnableTask<R: Runnable> {
    runnable: R,
    runner: Runner,
    state: RunnableState,
    initialized: bool,
}

impl<R: Runnable> RunnableTask<R> {
    /// Wrap a runnable.
    pub fn new(runnable: R, runner: Runner) -> Self {
        Self {
            runnable,
            runner,
            state: RunnableState::Created,
            initialized: false,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunnableState {
        self.state
    }

    /// The wrapped runnable.
    pub fn inner(&self) -> &R {
        &self.runnable
    }

    fn transition(&mut self, to: RunnableState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(GraphError::InvalidTransition { from: self.state, to });
        }
        debug!(runnable = self.runnable.name(), from = %self.state, to = %to, "Lifecycle transition");
        self.state = to;
        Ok(())
    }

    /// Set up (first call only) and execute with retry, timeout and breaker.
    pub async fn run(&mut self, deadline: Option<Deadline>) -> Result<R::Output> {
        if !self.initialized {
            self.transition(RunnableState::Initializing)?;
            if let Err(e) = self.runnable.setup().await {
                self.transition(RunnableState::Failed)?;
                return Err(e);
            }
            self.initialized = true;
            self.transition(RunnableState::Ready)?;
        }
        self.transition(RunnableState::Running)?;

        let op = OperationContext {
            operation: self.runnable.name().to_string(),
            target: self.runnable.target(),
            idempotent: self.runnable.idempotent(),
        };
        let runnable = &self.runnable;
        let result = self
            .runner
            .call_with_deadline(&op, deadline, || runnable.execute())
            .await;

        let next = if result.is_ok() {
            RunnableState::Completed
        } else {
            RunnableState::Failed
        };
        self.transition(next)?;
        result
    }

    /// Tear down and enter the terminal state.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.state.can_transition_to(RunnableState::Stopped) {
            return Err(GraphError::InvalidTransition {
                from: self.state,
                to: RunnableState::Stopped,
            });
        }
        if self.initialized {
            self.runnable.teardown().await?;
            self.initialized = false;
        }
        self.transition(RunnableState::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn runner(max_attempts: u32, metrics: Arc<InMemoryMetrics>) -> Runner {
        Runner::with_metrics(
            RunnerConfig {
                retry: RetryPolicy {
                    max_attempts,
                    base_delay_ms: 10,
                    multiplier: 2.0,
                    max_delay_ms: 100,
                },
                attempt_timeout_ms: Some(1_000),
                breaker: None,
            },
            metrics,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let runner = runner(3, metrics.clone());
        let calls = AtomicU32::new(0);

        let value = runner
            .call(&OperationContext::new("get_entity", "a"), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GraphError::backend("get_entity", "connection reset", true))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        let record = &metrics.runs()[0];
        assert_eq!(record.attempts, 3);
        assert_eq!(record.retries, 2);
        assert_eq!(record.outcome, RunOutcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_carries_context() {
        let runner = runner(2, Arc::new(InMemoryMetrics::new()));
        let err = runner
            .call(&OperationContext::new("add_entity", "e1"), || async {
                Err::<(), _>(GraphError::backend("add_entity", "reset", true))
            })
            .await
            .unwrap_err();

        match err {
            GraphError::RetryExhausted { operation, target, attempts, .. } => {
                assert_eq!(operation, "add_entity");
                assert_eq!(target, "e1");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_and_not_found_are_not_retried() {
        let runner = runner(5, Arc::new(InMemoryMetrics::new()));
        let calls = AtomicU32::new(0);
        let err = runner
            .call(&OperationContext::new("add_entity", "e1"), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(GraphError::validation("age", "expected integer"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Validation { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_idempotent_timeout_is_not_retried() {
        let runner = runner(5, Arc::new(InMemoryMetrics::new()));
        let calls = AtomicU32::new(0);
        let op = OperationContext::new("append_log", "e1").non_idempotent();
        let err = runner
            .call(&op, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, GraphError::Timeout { attempt: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_abandons_in_flight_attempt() {
        let runner = runner(5, Arc::new(InMemoryMetrics::new()));
        let err = runner
            .call_with_deadline(
                &OperationContext::new("get_entity", "a"),
                Some(Deadline::after(Duration::from_millis(200))),
                || async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_fails_fast_without_calling() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let runner = Runner::with_metrics(
            RunnerConfig {
                retry: RetryPolicy::none(),
                attempt_timeout_ms: None,
                breaker: Some(BreakerConfig::new(3, Duration::from_secs(10))),
            },
            metrics.clone(),
        );
        let op = OperationContext::new("get_entity", "a");
        for _ in 0..3 {
            let _ = runner
                .call(&op, || async { Err::<(), _>(GraphError::backend("get_entity", "down", true)) })
                .await;
        }
        assert_eq!(runner.breaker().map(|b| b.state()), Some(BreakerState::Open));

        let calls = AtomicU32::new(0);
        let err = runner
            .call(&op, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(10)).await;
        runner.call(&op, || async { Ok(()) }).await.unwrap();
        assert_eq!(runner.breaker().map(|b| b.state()), Some(BreakerState::Closed));
        assert_eq!(metrics.runs().last().map(|r| r.attempts), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_half_open_call_does_not_wedge_breaker() {
        let runner = Runner::with_metrics(
            RunnerConfig {
                retry: RetryPolicy::none(),
                attempt_timeout_ms: None,
                breaker: Some(BreakerConfig::new(1, Duration::from_secs(10))),
            },
            Arc::new(NoOpMetrics),
        );
        let op = OperationContext::new("get_entity", "a");
        let _ = runner
            .call(&op, || async { Err::<(), _>(GraphError::backend("get_entity", "down", true)) })
            .await;
        tokio::time::advance(Duration::from_secs(11)).await;

        // Caller gives up on the half-open call before it settles.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            runner.call(&op, || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(runner.breaker().map(|b| b.state()), Some(BreakerState::HalfOpen));

        tokio::time::advance(Duration::from_secs(3600)).await;
        runner.call(&op, || async { Ok(()) }).await.unwrap();
        assert_eq!(runner.breaker().map(|b| b.state()), Some(BreakerState::Closed));
    }

    struct CountingTask {
        setups: u32,
        executions: AtomicU32,
        fail_setup: bool,
    }

    #[async_trait]
    impl Runnable for CountingTask {
        type Output = u32;

        fn name(&self) -> &str {
            "counting_task"
        }

        async fn setup(&mut self) -> Result<()> {
            self.setups += 1;
            if self.fail_setup {
                return Err(GraphError::backend("setup", "no connection", false));
            }
            Ok(())
        }

        async fn execute(&self) -> Result<u32> {
            Ok(self.executions.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    fn counting_task(fail_setup: bool) -> CountingTask {
        CountingTask {
            setups: 0,
            executions: AtomicU32::new(0),
            fail_setup,
        }
    }

    #[tokio::test]
    async fn test_lifecycle_happy_path() {
        let mut task = RunnableTask::new(counting_task(false), Runner::direct());
        assert_eq!(task.state(), RunnableState::Created);

        assert_eq!(task.run(None).await.unwrap(), 1);
        assert_eq!(task.state(), RunnableState::Completed);
        assert_eq!(task.run(None).await.unwrap(), 2);
        assert_eq!(task.inner().setups, 1);

        task.stop().await.unwrap();
        assert_eq!(task.state(), RunnableState::Stopped);

        let err = task.run(None).await.unwrap_err();
        assert!(matches!(
            err,
            GraphError::InvalidTransition { from: RunnableState::Stopped, .. }
        ));
    }

    #[tokio::test]
    async fn test_setup_failure_enters_failed() {
        let mut task = RunnableTask::new(counting_task(true), Runner::direct());
        assert!(task.run(None).await.is_err());
        assert_eq!(task.state(), RunnableState::Failed);
        assert_eq!(task.inner().executions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_transition_table() {
        assert!(RunnableState::Created.can_transition_to(RunnableState::Initializing));
        assert!(!RunnableState::Created.can_transition_to(RunnableState::Running));
        assert!(!RunnableState::Stopped.can_transition_to(RunnableState::Initializing));
        assert!(RunnableState::Failed.can_transition_to(RunnableState::Stopped));
    }
}
