//! Saga orchestration for the Courier messaging middleware.
//!
//! A saga is an ordered list of steps where every step knows how to undo
//! itself. The orchestrator runs the steps in order; when one fails it
//! walks the already-executed steps backwards and compensates each, so a
//! half-finished distributed operation rolls back instead of dangling.
//!
//! ```text
//! execute:     A ──► B ──► C ──► Completed
//!
//! B fails:     A ──► B✗
//!              └──◄── compensate(A) ──► Compensated
//! ```
//!
//! Steps own their domain effects; the saga owns the step list, the
//! state machine and the data. Data is handed to one step at a time as
//! an exclusive borrow, which is what makes the step↔saga relationship
//! acyclic.
//!
//! # Example
//!
//! ```rust,ignore
//! use courier_saga::{SagaOrchestrator, SagaStep};
//!
//! let orchestrator = SagaOrchestrator::new(options)
//!     .step(PlaceOrder)
//!     .step(ChargePayment)
//!     .step(ReserveInventory);
//!
//! let result = orchestrator.execute(checkout_data, "corr-1").await?;
//! if !result.success {
//!     println!("rolled back after {:?}", result.failed_step);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use courier_core::broker::BrokerFuture;
use courier_core::config::SagaOptions;
use courier_core::error::BrokerError;
use courier_resilience::retry::RetryPolicy;

/// Saga lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaState {
    /// Created, not yet executed.
    NotStarted,
    /// Steps are executing.
    Running,
    /// Every step succeeded.
    Completed,
    /// A step failed; compensation is walking back.
    Compensating,
    /// Compensation finished cleanly.
    Compensated,
    /// Compensation itself failed.
    Failed,
}

/// One unit of saga work with its inverse.
pub trait SagaStep<D>: Send + Sync {
    /// Step name used in results, events and logs.
    fn name(&self) -> &str;

    /// Perform the step's effect on `data`.
    fn execute<'a>(&'a self, data: &'a mut D) -> BrokerFuture<'a, ()>;

    /// Undo a previously successful execution of this step.
    fn compensate<'a>(&'a self, data: &'a mut D) -> BrokerFuture<'a, ()>;
}

/// Outcome of one saga execution.
#[derive(Debug)]
pub struct SagaResult<D> {
    /// Saga instance id.
    pub saga_id: Uuid,
    /// Correlation id supplied by the caller.
    pub correlation_id: String,
    /// Terminal state.
    pub state: SagaState,
    /// Whether every step succeeded.
    pub success: bool,
    /// Name of the failing step, when one failed.
    pub failed_step: Option<String>,
    /// Whether compensation (if any ran) succeeded completely.
    pub compensation_succeeded: bool,
    /// Steps that executed successfully.
    pub executed_steps: usize,
    /// Steps that compensated successfully.
    pub compensated_steps: usize,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
    /// The error from the failing step, when one failed.
    pub error: Option<BrokerError>,
    /// The saga data after execution (and compensation, if any).
    pub data: D,
    /// When the saga was created.
    pub created_at: DateTime<Utc>,
    /// When the saga last changed state.
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle event payload.
#[derive(Debug, Clone)]
pub struct SagaEvent {
    /// Saga instance id.
    pub saga_id: Uuid,
    /// Correlation id supplied by the caller.
    pub correlation_id: String,
    /// Terminal state reached.
    pub state: SagaState,
    /// Steps that executed successfully.
    pub executed_steps: usize,
    /// Steps that compensated successfully.
    pub compensated_steps: usize,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

/// Callback invoked with a [`SagaEvent`].
pub type SagaCallback = Arc<dyn Fn(SagaEvent) + Send + Sync>;

/// Ordered step executor with reverse-order compensation.
pub struct SagaOrchestrator<D> {
    options: SagaOptions,
    steps: Vec<Arc<dyn SagaStep<D>>>,
    on_completed: Mutex<Option<SagaCallback>>,
    on_failed: Mutex<Option<SagaCallback>>,
    on_compensated: Mutex<Option<SagaCallback>>,
}

impl<D: Send> SagaOrchestrator<D> {
    /// Create an orchestrator with no steps.
    #[must_use]
    pub fn new(options: SagaOptions) -> Self {
        Self {
            options,
            steps: Vec::new(),
            on_completed: Mutex::new(None),
            on_failed: Mutex::new(None),
            on_compensated: Mutex::new(None),
        }
    }

    /// Append a step. Steps run in the order they are added.
    #[must_use]
    pub fn step(mut self, step: impl SagaStep<D> + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Number of registered steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Register the completed-lifecycle callback.
    pub async fn on_completed(&self, callback: SagaCallback) {
        *self.on_completed.lock().await = Some(callback);
    }

    /// Register the failed-lifecycle callback.
    pub async fn on_failed(&self, callback: SagaCallback) {
        *self.on_failed.lock().await = Some(callback);
    }

    /// Register the compensated-lifecycle callback.
    pub async fn on_compensated(&self, callback: SagaCallback) {
        *self.on_compensated.lock().await = Some(callback);
    }

    /// Execute the saga to completion or compensation.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Cancelled`] only via
    /// [`execute_with_cancellation`](Self::execute_with_cancellation);
    /// step failures are reported inside the [`SagaResult`], not as an
    /// `Err`.
    pub async fn execute(
        &self,
        data: D,
        correlation_id: impl Into<String>,
    ) -> Result<SagaResult<D>, BrokerError> {
        self.execute_with_cancellation(data, correlation_id, &CancellationToken::new())
            .await
    }

    /// Execute the saga under a cancellation token.
    ///
    /// Cancellation aborts the step loop immediately without compensating
    /// already-executed steps and surfaces as an error.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Cancelled`] when `cancellation` fires
    /// before or during a step.
    pub async fn execute_with_cancellation(
        &self,
        mut data: D,
        correlation_id: impl Into<String>,
        cancellation: &CancellationToken,
    ) -> Result<SagaResult<D>, BrokerError> {
        let saga_id = Uuid::new_v4();
        let correlation_id = correlation_id.into();
        let created_at = Utc::now();
        let started = Instant::now();
        let mut executed: Vec<usize> = Vec::new();

        info!(
            saga_id = %saga_id,
            correlation_id = %correlation_id,
            steps = self.steps.len(),
            "Saga starting"
        );

        let mut failure: Option<(usize, BrokerError)> = None;
        for (index, step) in self.steps.iter().enumerate() {
            if cancellation.is_cancelled() {
                return Err(BrokerError::Cancelled);
            }

            match self
                .run_step_with_retries(step.as_ref(), &mut data, cancellation)
                .await
            {
                Ok(()) => executed.push(index),
                Err(BrokerError::Cancelled) => return Err(BrokerError::Cancelled),
                Err(step_error) => {
                    error!(
                        saga_id = %saga_id,
                        step = step.name(),
                        error = %step_error,
                        "Saga step failed"
                    );
                    failure = Some((index, step_error));
                    break;
                },
            }
        }

        let Some((failed_index, step_error)) = failure else {
            let result = SagaResult {
                saga_id,
                correlation_id: correlation_id.clone(),
                state: SagaState::Completed,
                success: true,
                failed_step: None,
                compensation_succeeded: true,
                executed_steps: executed.len(),
                compensated_steps: 0,
                elapsed: started.elapsed(),
                error: None,
                data,
                created_at,
                updated_at: Utc::now(),
            };
            info!(saga_id = %saga_id, elapsed_ms = result.elapsed.as_millis() as u64, "Saga completed");
            self.emit(&self.on_completed, &result).await;
            return Ok(result);
        };

        // Compensation phase: walk executed steps in reverse.
        let mut compensated = 0usize;
        let mut compensation_succeeded = true;
        for &index in executed.iter().rev() {
            let step = &self.steps[index];
            match step.compensate(&mut data).await {
                Ok(()) => {
                    compensated += 1;
                },
                Err(compensation_error) => {
                    compensation_succeeded = false;
                    warn!(
                        saga_id = %saga_id,
                        step = step.name(),
                        error = %compensation_error,
                        "Saga compensation failed"
                    );
                    if !self.options.continue_compensation_on_error {
                        break;
                    }
                },
            }
        }

        let state = if compensation_succeeded {
            SagaState::Compensated
        } else {
            SagaState::Failed
        };
        let result = SagaResult {
            saga_id,
            correlation_id,
            state,
            success: false,
            failed_step: Some(self.steps[failed_index].name().to_string()),
            compensation_succeeded,
            executed_steps: executed.len(),
            compensated_steps: compensated,
            elapsed: started.elapsed(),
            error: Some(step_error),
            data,
            created_at,
            updated_at: Utc::now(),
        };
        warn!(
            saga_id = %result.saga_id,
            failed_step = result.failed_step.as_deref().unwrap_or(""),
            compensated = result.compensated_steps,
            compensation_succeeded,
            "Saga rolled back"
        );
        if compensation_succeeded {
            self.emit(&self.on_compensated, &result).await;
        } else {
            self.emit(&self.on_failed, &result).await;
        }
        Ok(result)
    }

    /// Run one step, retrying per the options before giving up, each
    /// attempt bounded by the step timeout and raced against
    /// cancellation.
    async fn run_step_with_retries(
        &self,
        step: &dyn SagaStep<D>,
        data: &mut D,
        cancellation: &CancellationToken,
    ) -> Result<(), BrokerError> {
        let retry_policy = RetryPolicy {
            max_attempts: if self.options.auto_retry_failed_steps {
                self.options.max_retry_attempts
            } else {
                0
            },
            initial_delay: self.options.retry_delay(),
            max_delay: self.options.retry_delay() * 32,
            multiplier: 2.0,
            exponential: self.options.use_exponential_backoff,
        };

        let mut attempt = 0u32;
        loop {
            let outcome = tokio::select! {
                () = cancellation.cancelled() => return Err(BrokerError::Cancelled),
                timed = tokio::time::timeout(self.options.step_timeout(), step.execute(data)) => {
                    match timed {
                        Ok(step_result) => step_result,
                        Err(_elapsed) => Err(BrokerError::Timeout(self.options.step_timeout())),
                    }
                },
            };

            match outcome {
                Ok(()) => return Ok(()),
                Err(step_error) => {
                    if attempt >= retry_policy.max_attempts {
                        return Err(step_error);
                    }
                    let delay = retry_policy.delay_for_attempt(attempt);
                    warn!(
                        step = step.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %step_error,
                        "Saga step failed, retrying"
                    );
                    tokio::select! {
                        () = cancellation.cancelled() => return Err(BrokerError::Cancelled),
                        () = tokio::time::sleep(delay) => {},
                    }
                    attempt += 1;
                },
            }
        }
    }

    async fn emit(&self, slot: &Mutex<Option<SagaCallback>>, result: &SagaResult<D>) {
        if let Some(callback) = slot.lock().await.as_ref() {
            callback(SagaEvent {
                saga_id: result.saga_id,
                correlation_id: result.correlation_id.clone(),
                state: result.state,
                executed_steps: result.executed_steps,
                compensated_steps: result.compensated_steps,
                elapsed: result.elapsed,
            });
        }
    }
}
