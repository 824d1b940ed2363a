//! Per-session serialization point.
//!
//! A [`DispatchExecutor`] owns one FIFO queue drained by a single tokio task,
//! so tasks submitted to the same executor never overlap and run in
//! submission order. Different executors are independent tokio tasks and run
//! in parallel on the runtime's worker pool.

use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ExecutorError;
use crate::lock;

type Task = Box<dyn FnOnce() + Send + 'static>;

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_EXECUTOR: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Marks the current thread as running inside an executor until dropped.
struct DispatchGuard {
    previous: Option<u64>,
}

impl DispatchGuard {
    fn enter(id: u64) -> Self {
        let previous = CURRENT_EXECUTOR.with(|current| current.replace(Some(id)));
        Self { previous }
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        CURRENT_EXECUTOR.with(|current| current.set(self.previous));
    }
}

struct ExecutorInner {
    id: u64,
    name: String,
    runtime: Handle,
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
}

/// A single logical serialization context for one session.
///
/// Cloning the executor yields another handle to the same queue.
#[derive(Clone)]
pub struct DispatchExecutor {
    inner: Arc<ExecutorInner>,
}

impl DispatchExecutor {
    /// Starts an executor on the tokio runtime of the calling context.
    pub fn new(name: impl Into<String>) -> Result<Self, ExecutorError> {
        let runtime = Handle::try_current().map_err(|_| ExecutorError::NoRuntime)?;
        Ok(Self::with_runtime(name, &runtime))
    }

    /// Starts an executor whose queue is drained on `runtime`.
    pub fn with_runtime(name: impl Into<String>, runtime: &Handle) -> Self {
        let id = NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel();

        runtime.spawn(dispatch_loop(id, name.clone(), receiver));
        tracing::debug!(executor = %name, id, "dispatch executor started");

        Self {
            inner: Arc::new(ExecutorInner {
                id,
                name,
                runtime: runtime.clone(),
                sender: Mutex::new(Some(sender)),
            }),
        }
    }

    /// Returns the executor name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the runtime hosting the executor, for work that must not run
    /// on the dispatch queue itself.
    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Queues `task` behind every task submitted before it.
    pub fn submit<F>(&self, task: F) -> Result<(), ExecutorError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = lock(&self.inner.sender);
        let sent = match sender.as_ref() {
            Some(sender) => sender.send(Box::new(task)).is_ok(),
            None => false,
        };
        if sent {
            Ok(())
        } else {
            Err(self.shut_down_error())
        }
    }

    /// Queues `task`, or runs it on the calling thread once the executor has
    /// shut down. Returns true if it ran inline.
    pub(crate) fn submit_or_run_inline(&self, task: Task) -> bool {
        let rejected = {
            let sender = lock(&self.inner.sender);
            match sender.as_ref() {
                Some(sender) => sender.send(task).err().map(|err| err.0),
                None => Some(task),
            }
        };
        match rejected {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs `task` inline when already inside this executor, otherwise queues it.
    pub fn execute<F>(&self, task: F) -> Result<(), ExecutorError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_dispatch_context() {
            task();
            Ok(())
        } else {
            self.submit(task)
        }
    }

    /// Queues `task` once `delay` has elapsed.
    ///
    /// The returned handle can cancel the task while it is still waiting.
    pub fn schedule<F>(&self, task: F, delay: Duration) -> Result<ScheduledTask, ExecutorError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(self.shut_down_error());
        }

        let executor = self.clone();
        let handle = self.inner.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = executor.submit(task) {
                tracing::debug!(%err, "scheduled task dropped");
            }
        });
        Ok(ScheduledTask { handle })
    }

    /// Returns true if the calling code is running inside this executor.
    pub fn is_dispatch_context(&self) -> bool {
        CURRENT_EXECUTOR.with(|current| current.get() == Some(self.inner.id))
    }

    /// Stops accepting tasks. Tasks already queued still run.
    pub fn shutdown(&self) {
        if lock(&self.inner.sender).take().is_some() {
            tracing::debug!(executor = %self.inner.name, "dispatch executor shutting down");
        }
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        lock(&self.inner.sender).is_none()
    }

    fn shut_down_error(&self) -> ExecutorError {
        ExecutorError::ShutDown {
            name: self.inner.name.clone(),
        }
    }
}

impl std::fmt::Debug for DispatchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchExecutor")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

/// Handle to a task queued with [`DispatchExecutor::schedule`].
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Drops the task if its delay has not elapsed yet.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Returns true once the task was queued or canceled.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn dispatch_loop(id: u64, name: String, mut receiver: mpsc::UnboundedReceiver<Task>) {
    while let Some(task) = receiver.recv().await {
        metrics::counter!("dispatch_tasks_total").increment(1);
        let outcome = {
            let _guard = DispatchGuard::enter(id);
            catch_unwind(AssertUnwindSafe(task))
        };
        if outcome.is_err() {
            metrics::counter!("dispatch_task_panics_total").increment(1);
            tracing::error!(executor = %name, "dispatch task panicked");
        }
    }
    tracing::debug!(executor = %name, "dispatch executor stopped");
}
