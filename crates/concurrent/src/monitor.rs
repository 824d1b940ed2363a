//! Completion tokens for asynchronous operations.
//!
//! A [`RequestMonitor`] is handed to the code performing an operation, which
//! completes it exactly once. Whoever started the operation observes the
//! outcome through the completion callback, which always runs on the
//! monitor's [`DispatchExecutor`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};

use crate::error::MonitorError;
use crate::executor::DispatchExecutor;
use crate::lock;
use crate::status::ErrorCause;

/// Lifecycle of a request monitor. Transitions are one-way out of `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MonitorStatus {
    #[default]
    Pending,
    Success,
    Error,
    Cancelled,
}

impl MonitorStatus {
    /// Returns true once the monitor was completed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MonitorStatus::Pending)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorStatus::Pending => "Pending",
            MonitorStatus::Success => "Success",
            MonitorStatus::Error => "Error",
            MonitorStatus::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Node of the cancellation tree.
///
/// Parents own their pending children; a child only keeps a weak
/// back-reference so it can unlink itself once completed. Cancellation walks
/// down, never up.
#[derive(Debug, Default)]
struct CancelNode {
    canceled: AtomicBool,
    parent: Weak<CancelNode>,
    children: Mutex<Vec<Arc<CancelNode>>>,
}

impl CancelNode {
    fn child_of(parent: &Arc<CancelNode>) -> Arc<CancelNode> {
        let mut siblings = lock(&parent.children);
        let child = Arc::new(CancelNode {
            canceled: AtomicBool::new(parent.is_canceled()),
            parent: Arc::downgrade(parent),
            children: Mutex::default(),
        });
        siblings.push(child.clone());
        child
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
        let children = lock(&self.children).clone();
        for child in children {
            child.cancel();
        }
    }

    fn detach(self: &Arc<Self>) {
        if let Some(parent) = self.parent.upgrade() {
            lock(&parent.children).retain(|child| !Arc::ptr_eq(child, self));
        }
    }
}

type Callback<T> = Box<dyn FnOnce(RequestMonitor<T>) + Send + 'static>;
type SettleHook = Box<dyn FnOnce() + Send + 'static>;

struct MonitorState<T> {
    status: MonitorStatus,
    result: Option<T>,
    error: Option<ErrorCause>,
    canceled_before_completion: bool,
    callback: Option<Callback<T>>,
    callback_fired: bool,
    settle_hooks: Vec<SettleHook>,
}

impl<T> Default for MonitorState<T> {
    fn default() -> Self {
        Self {
            status: MonitorStatus::Pending,
            result: None,
            error: None,
            canceled_before_completion: false,
            callback: None,
            callback_fired: false,
            settle_hooks: Vec::new(),
        }
    }
}

struct MonitorInner<T> {
    executor: DispatchExecutor,
    cancel: Arc<CancelNode>,
    state: Mutex<MonitorState<T>>,
}

/// A pending asynchronous operation and its eventual outcome.
///
/// The handle is cheap to clone; all clones observe the same operation.
pub struct RequestMonitor<T = ()> {
    inner: Arc<MonitorInner<T>>,
}

impl<T> Clone for RequestMonitor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> RequestMonitor<T> {
    /// Creates a root monitor whose callback runs on `executor`.
    pub fn new(executor: &DispatchExecutor) -> Self {
        Self::with_node(executor, Arc::new(CancelNode::default()))
    }

    /// Creates a monitor that is canceled whenever `parent` is canceled.
    ///
    /// The child runs its callback on the parent's executor. A child created
    /// under an already canceled parent starts out canceled.
    pub fn child_of<P>(parent: &RequestMonitor<P>) -> Self {
        Self::child_on(&parent.inner.executor, parent)
    }

    /// Like [`child_of`](Self::child_of), but runs the callback on `executor`.
    pub fn child_on<P>(executor: &DispatchExecutor, parent: &RequestMonitor<P>) -> Self {
        Self::with_node(executor, CancelNode::child_of(&parent.inner.cancel))
    }

    fn with_node(executor: &DispatchExecutor, cancel: Arc<CancelNode>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                executor: executor.clone(),
                cancel,
                state: Mutex::new(MonitorState::default()),
            }),
        }
    }

    /// Installs the completion callback on a freshly created monitor.
    pub fn on_complete<F>(self, callback: F) -> Self
    where
        F: FnOnce(RequestMonitor<T>) + Send + 'static,
    {
        if let Err(err) = self.set_completion_callback(callback) {
            tracing::error!(%err, "completion callback rejected");
        }
        self
    }

    /// Sets the callback fired once the monitor completes.
    ///
    /// A callback installed after completion is dispatched right away. A
    /// pending monitor's previous callback is replaced.
    pub fn set_completion_callback<F>(&self, callback: F) -> Result<(), MonitorError>
    where
        F: FnOnce(RequestMonitor<T>) + Send + 'static,
    {
        let mut state = lock(&self.inner.state);
        if !state.status.is_terminal() {
            state.callback = Some(Box::new(callback));
            return Ok(());
        }
        if state.callback_fired {
            return Err(MonitorError::CallbackAlreadyFired);
        }
        state.callback_fired = true;
        drop(state);
        self.dispatch_callback(Box::new(callback));
        Ok(())
    }

    /// Completes the monitor successfully with `result`.
    pub fn complete(&self, result: T) -> Result<(), MonitorError> {
        self.finish(MonitorStatus::Success, Some(result), None)
    }

    /// Completes the monitor with a failure.
    ///
    /// A cause carrying the cancellation code completes it as `Cancelled`.
    pub fn complete_with_error(&self, cause: ErrorCause) -> Result<(), MonitorError> {
        let status = if cause.is_cancellation() {
            MonitorStatus::Cancelled
        } else {
            MonitorStatus::Error
        };
        self.finish(status, None, Some(cause))
    }

    /// Completes the monitor as canceled.
    pub fn complete_cancelled(&self) -> Result<(), MonitorError> {
        self.complete_with_error(ErrorCause::cancelled())
    }

    /// Requests cancellation of this operation and every child operation.
    ///
    /// This does not complete the monitor; the code performing the operation
    /// is expected to notice and complete it with a cancellation cause.
    pub fn cancel(&self) {
        tracing::debug!(executor = %self.inner.executor.name(), "request monitor canceled");
        self.inner.cancel.cancel();
    }

    /// Returns true if cancellation was requested or the monitor completed canceled.
    pub fn is_canceled(&self) -> bool {
        self.inner.cancel.is_canceled() || self.status() == MonitorStatus::Cancelled
    }

    /// Returns the current status.
    pub fn status(&self) -> MonitorStatus {
        lock(&self.inner.state).status
    }

    /// Returns true while the operation has not completed.
    pub fn is_pending(&self) -> bool {
        self.status() == MonitorStatus::Pending
    }

    /// Returns true if the operation completed successfully.
    pub fn is_success(&self) -> bool {
        self.status() == MonitorStatus::Success
    }

    /// Returns the failure cause, if the operation failed or was canceled.
    pub fn error(&self) -> Option<ErrorCause> {
        lock(&self.inner.state).error.clone()
    }

    /// Moves the result payload out of the monitor.
    pub fn take_result(&self) -> Option<T> {
        lock(&self.inner.state).result.take()
    }

    /// Returns the executor completion callbacks run on.
    pub fn executor(&self) -> &DispatchExecutor {
        &self.inner.executor
    }

    /// Whether cancellation had been requested at the moment the monitor completed.
    pub(crate) fn canceled_before_completion(&self) -> bool {
        lock(&self.inner.state).canceled_before_completion
    }

    /// Runs `hook` on the completing thread as soon as the monitor completes.
    ///
    /// Hooks must not touch session state; they exist so a blocked foreign
    /// thread can be woken without going through the executor.
    pub(crate) fn on_settled<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = lock(&self.inner.state);
        if state.status.is_terminal() {
            drop(state);
            hook();
        } else {
            state.settle_hooks.push(Box::new(hook));
        }
    }

    /// Takes the outcome once completed: the payload on success, the cause otherwise.
    pub(crate) fn take_outcome(&self) -> Option<Result<T, ErrorCause>> {
        let mut state = lock(&self.inner.state);
        match state.status {
            MonitorStatus::Pending => None,
            MonitorStatus::Success => Some(
                state
                    .result
                    .take()
                    .ok_or_else(|| ErrorCause::internal("Result was already taken")),
            ),
            MonitorStatus::Error | MonitorStatus::Cancelled => Some(Err(state
                .error
                .clone()
                .unwrap_or_else(|| ErrorCause::internal("Failed without a cause")))),
        }
    }

    fn finish(
        &self,
        status: MonitorStatus,
        result: Option<T>,
        error: Option<ErrorCause>,
    ) -> Result<(), MonitorError> {
        let (callback, hooks) = {
            let mut state = lock(&self.inner.state);
            if state.status.is_terminal() {
                return Err(MonitorError::DoubleCompletion {
                    status: state.status,
                });
            }
            state.canceled_before_completion = self.inner.cancel.is_canceled();
            state.status = status;
            state.result = result;
            state.error = error;
            let callback = state.callback.take();
            state.callback_fired = callback.is_some();
            (callback, std::mem::take(&mut state.settle_hooks))
        };

        self.inner.cancel.detach();
        for hook in hooks {
            if catch_unwind(AssertUnwindSafe(hook)).is_err() {
                tracing::error!("request monitor settle hook panicked");
            }
        }
        if let Some(callback) = callback {
            self.dispatch_callback(callback);
        }
        Ok(())
    }

    fn dispatch_callback(&self, callback: Callback<T>) {
        let monitor = self.clone();
        let executor = &self.inner.executor;
        if executor.submit_or_run_inline(Box::new(move || callback(monitor))) {
            tracing::debug!(
                executor = %executor.name(),
                "executor shut down, completion callback ran inline"
            );
        }
    }
}

impl RequestMonitor<()> {
    /// Completes a unit monitor successfully.
    pub fn done(&self) -> Result<(), MonitorError> {
        self.complete(())
    }
}

impl<T> std::fmt::Debug for RequestMonitor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("RequestMonitor")
            .field("executor", &self.inner.executor.name())
            .field("status", &state.status)
            .field("canceled", &self.inner.cancel.is_canceled())
            .field("error", &state.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn executor() -> DispatchExecutor {
        DispatchExecutor::new("monitor-test").unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_complete_fires_callback_on_executor() {
        let executor = executor();
        let (tx, rx) = oneshot::channel();

        let dispatch = executor.clone();
        let rm = RequestMonitor::<u32>::new(&executor).on_complete(move |rm| {
            let _ = tx.send((rm.take_result(), dispatch.is_dispatch_context()));
        });
        rm.complete(42).unwrap();

        assert_eq!(rx.await.unwrap(), (Some(42), true));
        assert!(rm.is_success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_callback_runs_inline_after_shutdown() {
        let executor = executor();
        let (tx, rx) = oneshot::channel();

        let dispatch = executor.clone();
        let rm = RequestMonitor::<u32>::new(&executor).on_complete(move |rm| {
            let _ = tx.send((rm.take_result(), dispatch.is_dispatch_context()));
        });
        executor.shutdown();
        rm.complete(7).unwrap();

        assert_eq!(rx.await.unwrap(), (Some(7), false));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_double_completion_is_rejected() {
        let executor = executor();
        let rm = RequestMonitor::<()>::new(&executor);

        rm.done().unwrap();
        assert_eq!(
            rm.complete_with_error(ErrorCause::new(7, "late")),
            Err(MonitorError::DoubleCompletion {
                status: MonitorStatus::Success
            })
        );
        assert_eq!(
            rm.done(),
            Err(MonitorError::DoubleCompletion {
                status: MonitorStatus::Success
            })
        );
        assert!(rm.error().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_error_and_cancelled_status() {
        let executor = executor();

        let failed = RequestMonitor::<()>::new(&executor);
        failed
            .complete_with_error(ErrorCause::new(7, "boom"))
            .unwrap();
        assert_eq!(failed.status(), MonitorStatus::Error);
        assert_eq!(failed.error().unwrap().code, 7);
        assert!(!failed.is_canceled());

        let cancelled = RequestMonitor::<()>::new(&executor);
        cancelled.complete_cancelled().unwrap();
        assert_eq!(cancelled.status(), MonitorStatus::Cancelled);
        assert!(cancelled.is_canceled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_is_advisory() {
        let executor = executor();
        let rm = RequestMonitor::<()>::new(&executor);

        rm.cancel();
        assert!(rm.is_canceled());
        assert!(rm.is_pending());

        rm.complete_cancelled().unwrap();
        assert_eq!(rm.status(), MonitorStatus::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_propagates_to_children_only() {
        let executor = executor();
        let parent = RequestMonitor::<()>::new(&executor);
        let child = RequestMonitor::<String>::child_of(&parent);
        let grandchild = RequestMonitor::<()>::child_of(&child);

        child.cancel();
        assert!(child.is_canceled());
        assert!(grandchild.is_canceled());
        assert!(!parent.is_canceled());

        parent.cancel();
        let late_child = RequestMonitor::<()>::child_of(&parent);
        assert!(late_child.is_canceled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_completed_child_is_not_canceled_by_parent() {
        let executor = executor();
        let parent = RequestMonitor::<()>::new(&executor);
        let child = RequestMonitor::<()>::child_of(&parent);

        child.done().unwrap();
        parent.cancel();

        assert!(!child.is_canceled());
        assert!(lock(&parent.inner.cancel.children).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_callback_installed_after_completion_fires_once() {
        let executor = executor();
        let rm = RequestMonitor::<()>::new(&executor);
        rm.done().unwrap();

        let (tx, rx) = oneshot::channel();
        rm.set_completion_callback(move |rm| {
            let _ = tx.send(rm.status());
        })
        .unwrap();
        assert_eq!(rx.await.unwrap(), MonitorStatus::Success);

        assert_eq!(
            rm.set_completion_callback(|_| {}),
            Err(MonitorError::CallbackAlreadyFired)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_canceled_before_completion_is_recorded() {
        let executor = executor();

        let canceled_first = RequestMonitor::<()>::new(&executor);
        canceled_first.cancel();
        canceled_first
            .complete_with_error(ErrorCause::new(7, "boom"))
            .unwrap();
        assert!(canceled_first.canceled_before_completion());

        let failed_first = RequestMonitor::<()>::new(&executor);
        failed_first
            .complete_with_error(ErrorCause::new(7, "boom"))
            .unwrap();
        failed_first.cancel();
        assert!(!failed_first.canceled_before_completion());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_take_outcome() {
        let executor = executor();
        let rm = RequestMonitor::<u8>::new(&executor);
        assert!(rm.take_outcome().is_none());

        rm.complete(3).unwrap();
        assert_eq!(rm.take_outcome(), Some(Ok(3)));
        assert!(matches!(rm.take_outcome(), Some(Err(_))));
    }
}
