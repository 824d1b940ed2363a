//! Ordered step pipelines with reverse-order rollback.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use common::RunId;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{ExecutorError, SecondaryRollbackFault};
use crate::executor::DispatchExecutor;
use crate::lock;
use crate::monitor::{MonitorStatus, RequestMonitor};
use crate::state::SequenceState;
use crate::status::ErrorCause;
use crate::step::Step;

/// What happened during one sequence run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SequenceReport {
    /// Steps whose forward action succeeded, in execution order.
    pub executed: Vec<String>,
    /// Steps whose rollback ran, in rollback order.
    pub rolled_back: Vec<String>,
    /// Rollback actions that failed; logged, never reported as the outcome.
    pub rollback_faults: Vec<SecondaryRollbackFault>,
    /// The cause the sequence finished with, if it did not succeed.
    pub failure: Option<ErrorCause>,
}

struct Shared {
    state: watch::Sender<SequenceState>,
    report: Mutex<SequenceReport>,
}

/// Read-only view of a sequence's progress, usable after submission.
#[derive(Clone)]
pub struct SequenceObserver {
    shared: Arc<Shared>,
}

impl SequenceObserver {
    /// Returns the current state.
    pub fn state(&self) -> SequenceState {
        *self.shared.state.borrow()
    }

    /// Subscribes to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SequenceState> {
        self.shared.state.subscribe()
    }

    /// Returns a snapshot of the run report.
    pub fn report(&self) -> SequenceReport {
        lock(&self.shared.report).clone()
    }
}

impl std::fmt::Debug for SequenceObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceObserver")
            .field("state", &self.state())
            .finish()
    }
}

type ParentLink = Box<dyn FnOnce(&DispatchExecutor) -> RequestMonitor + Send>;

/// An ordered pipeline of steps sharing one context.
///
/// Steps run one at a time on a dispatch executor. A step only starts once
/// the previous one completed its monitor successfully. When a step fails,
/// or cancellation is observed, every step that already succeeded is rolled
/// back in reverse order before the overall monitor reports the original
/// cause.
pub struct Sequence<C> {
    name: String,
    context: Arc<C>,
    steps: Vec<Arc<dyn Step<C>>>,
    parent: Option<ParentLink>,
    shared: Arc<Shared>,
}

impl<C: Send + Sync + 'static> Sequence<C> {
    /// Creates an empty sequence.
    pub fn new(name: impl Into<String>, context: Arc<C>) -> Self {
        let (state, _) = watch::channel(SequenceState::NotStarted);
        Self {
            name: name.into(),
            context,
            steps: Vec::new(),
            parent: None,
            shared: Arc::new(Shared {
                state,
                report: Mutex::default(),
            }),
        }
    }

    /// Appends a step.
    pub fn with_step(self, step: impl Step<C> + 'static) -> Self {
        self.with_shared_step(Arc::new(step))
    }

    /// Appends a step that may be shared with other sequences.
    pub fn with_shared_step(mut self, step: Arc<dyn Step<C>>) -> Self {
        self.steps.push(step);
        self
    }

    /// Makes the overall monitor a child of `parent`, so canceling `parent`
    /// cancels the sequence.
    pub fn with_parent<P: Send + 'static>(mut self, parent: &RequestMonitor<P>) -> Self {
        let parent = parent.clone();
        self.parent = Some(Box::new(move |executor| {
            RequestMonitor::child_on(executor, &parent)
        }));
        self
    }

    /// Returns the sequence name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the sequence has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the step names in execution order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    /// Returns an observer that stays valid after submission.
    pub fn observer(&self) -> SequenceObserver {
        SequenceObserver {
            shared: self.shared.clone(),
        }
    }

    /// Starts the sequence on `executor` and returns its overall monitor.
    ///
    /// Register a completion callback on the returned monitor, or cancel it
    /// to stop the sequence at the next step boundary.
    pub fn submit(self, executor: &DispatchExecutor) -> Result<RequestMonitor, ExecutorError> {
        let overall = match self.parent {
            Some(link) => link(executor),
            None => RequestMonitor::new(executor),
        };
        let run = Arc::new(Run {
            name: self.name,
            run_id: RunId::new(),
            context: self.context,
            steps: self.steps,
            executor: executor.clone(),
            overall: overall.clone(),
            shared: self.shared,
            started: Instant::now(),
        });

        metrics::counter!("sequence_executions_total").increment(1);
        tracing::info!(
            sequence = %run.name,
            run_id = %run.run_id,
            steps = run.steps.len(),
            "sequence submitted"
        );

        executor.submit(move || run.execute_step(0))?;
        Ok(overall)
    }
}

impl<C> std::fmt::Debug for Sequence<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("name", &self.name)
            .field(
                "steps",
                &self.steps.iter().map(|step| step.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Why a run stopped before the last step.
#[derive(Debug, Clone)]
enum Abort {
    Error(ErrorCause),
    Cancelled(ErrorCause),
}

impl Abort {
    fn cause(&self) -> &ErrorCause {
        match self {
            Abort::Error(cause) | Abort::Cancelled(cause) => cause,
        }
    }
}

struct Run<C> {
    name: String,
    run_id: RunId,
    context: Arc<C>,
    steps: Vec<Arc<dyn Step<C>>>,
    executor: DispatchExecutor,
    overall: RequestMonitor,
    shared: Arc<Shared>,
    started: Instant,
}

impl<C: Send + Sync + 'static> Run<C> {
    fn set_state(&self, state: SequenceState) {
        self.shared.state.send_replace(state);
    }

    fn execute_step(self: &Arc<Self>, index: usize) {
        if index == self.steps.len() {
            self.finish_success();
            return;
        }
        if self.overall.is_canceled() {
            tracing::info!(
                sequence = %self.name,
                run_id = %self.run_id,
                index,
                "cancellation observed before step"
            );
            self.roll_back_below(index, Abort::Cancelled(ErrorCause::cancelled()));
            return;
        }

        self.set_state(SequenceState::Running(index));
        let step = self.steps[index].clone();
        tracing::info!(
            sequence = %self.name,
            run_id = %self.run_id,
            step = step.name(),
            index,
            "step started"
        );

        let run = self.clone();
        let rm = RequestMonitor::child_of(&self.overall)
            .on_complete(move |rm| run.step_completed(index, rm));
        self.invoke(step.name(), rm, |rm| step.execute(&self.context, rm));
    }

    fn step_completed(self: &Arc<Self>, index: usize, rm: RequestMonitor) {
        let step = self.steps[index].name();
        match rm.status() {
            MonitorStatus::Success => {
                tracing::debug!(sequence = %self.name, step, index, "step completed");
                lock(&self.shared.report).executed.push(step.to_string());
                self.execute_step(index + 1);
            }
            MonitorStatus::Cancelled => {
                tracing::info!(sequence = %self.name, step, index, "step cancelled");
                let cause = rm.error().unwrap_or_else(ErrorCause::cancelled);
                self.roll_back_below(index, Abort::Cancelled(cause));
            }
            MonitorStatus::Error => {
                let cause = rm
                    .error()
                    .unwrap_or_else(|| ErrorCause::internal("Step failed without a cause"));
                // Cancellation only masks the error if it was requested before
                // the step reported its failure.
                let abort = if rm.canceled_before_completion() {
                    Abort::Cancelled(ErrorCause::cancelled().with_cause(cause))
                } else {
                    Abort::Error(cause)
                };
                tracing::warn!(
                    sequence = %self.name,
                    step,
                    index,
                    cause = %abort.cause(),
                    "step failed"
                );
                self.roll_back_below(index, abort);
            }
            MonitorStatus::Pending => {
                tracing::error!(sequence = %self.name, step, index, "callback fired while pending");
            }
        }
    }

    /// Rolls back the step just below `upper`, then continues downwards.
    fn roll_back_below(self: &Arc<Self>, upper: usize, abort: Abort) {
        let Some(index) = upper.checked_sub(1) else {
            self.finish_failure(abort);
            return;
        };

        self.set_state(SequenceState::RollingBack(index));
        let step = self.steps[index].clone();
        tracing::info!(
            sequence = %self.name,
            run_id = %self.run_id,
            step = step.name(),
            index,
            "rolling back step"
        );

        let run = self.clone();
        let rm = RequestMonitor::new(&self.executor)
            .on_complete(move |rm| run.rollback_completed(index, rm, abort));
        self.invoke(step.name(), rm, |rm| step.rollback(&self.context, rm));
    }

    fn rollback_completed(self: &Arc<Self>, index: usize, rm: RequestMonitor, abort: Abort) {
        let step = self.steps[index].name().to_string();
        let mut report = lock(&self.shared.report);
        report.rolled_back.push(step.clone());
        if !rm.is_success() {
            let fault = SecondaryRollbackFault {
                index,
                step,
                cause: rm
                    .error()
                    .unwrap_or_else(|| ErrorCause::internal("Rollback failed without a cause")),
            };
            metrics::counter!("sequence_rollback_faults_total").increment(1);
            tracing::warn!(sequence = %self.name, run_id = %self.run_id, %fault, "secondary rollback fault");
            report.rollback_faults.push(fault);
        }
        drop(report);

        self.roll_back_below(index, abort);
    }

    /// Runs a step action, turning a panic into a failed monitor.
    fn invoke(&self, step: &str, rm: RequestMonitor, action: impl FnOnce(RequestMonitor)) {
        let guard = rm.clone();
        if catch_unwind(AssertUnwindSafe(|| action(rm))).is_err() {
            tracing::error!(sequence = %self.name, step, "step action panicked");
            if guard.is_pending() {
                let _ = guard.complete_with_error(ErrorCause::internal(format!(
                    "Step '{step}' panicked"
                )));
            }
        }
    }

    fn finish_success(&self) {
        self.set_state(SequenceState::Succeeded);
        let duration = self.started.elapsed().as_secs_f64();
        metrics::histogram!("sequence_duration_seconds").record(duration);
        metrics::counter!("sequence_completed").increment(1);
        tracing::info!(sequence = %self.name, run_id = %self.run_id, duration, "sequence succeeded");

        if let Err(err) = self.overall.done() {
            tracing::error!(sequence = %self.name, %err, "overall monitor already completed");
        }
    }

    fn finish_failure(&self, abort: Abort) {
        let (state, cause) = match abort {
            Abort::Error(cause) => (SequenceState::Failed, cause),
            Abort::Cancelled(cause) => (SequenceState::Cancelled, cause),
        };
        lock(&self.shared.report).failure = Some(cause.clone());
        self.set_state(state);

        let duration = self.started.elapsed().as_secs_f64();
        metrics::histogram!("sequence_duration_seconds").record(duration);
        if state == SequenceState::Cancelled {
            metrics::counter!("sequence_cancelled").increment(1);
        } else {
            metrics::counter!("sequence_failed").increment(1);
        }
        tracing::warn!(
            sequence = %self.name,
            run_id = %self.run_id,
            %state,
            %cause,
            duration,
            "sequence did not complete"
        );

        if let Err(err) = self.overall.complete_with_error(cause) {
            tracing::error!(sequence = %self.name, %err, "overall monitor already completed");
        }
    }
}
