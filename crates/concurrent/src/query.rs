//! Blocking bridge from foreign threads into a dispatch executor.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{QueryError, QueryResult};
use crate::executor::DispatchExecutor;
use crate::lock;
use crate::monitor::RequestMonitor;
use crate::status::ErrorCause;

#[derive(Debug, Default)]
struct WaitSlot {
    settled: bool,
    interrupted: bool,
}

/// Lock and condition a blocked caller waits on.
#[derive(Debug, Default)]
struct Waiter {
    slot: Mutex<WaitSlot>,
    condvar: Condvar,
}

impl Waiter {
    fn settle(&self) {
        lock(&self.slot).settled = true;
        self.condvar.notify_all();
    }

    fn interrupt(&self) {
        lock(&self.slot).interrupted = true;
        self.condvar.notify_all();
    }
}

type Operation<T> = Box<dyn FnOnce(RequestMonitor<T>) + Send + 'static>;

/// Runs an operation inside a dispatch executor and blocks the calling
/// thread until the operation completes its monitor.
///
/// A query must be run from a thread outside the executor it targets;
/// running it from inside fails with [`QueryError::Deadlock`] instead of
/// blocking forever. Detection compares executor identity only: a task of
/// one executor may still block on a query targeting a different executor.
pub struct Query<T> {
    monitor: RequestMonitor<T>,
    operation: Operation<T>,
    timeout: Option<Duration>,
    waiter: Arc<Waiter>,
}

impl<T: Send + 'static> Query<T> {
    /// Creates a query that will run `operation` on `executor`.
    pub fn new<F>(executor: &DispatchExecutor, operation: F) -> Self
    where
        F: FnOnce(RequestMonitor<T>) + Send + 'static,
    {
        Self {
            monitor: RequestMonitor::new(executor),
            operation: Box::new(operation),
            timeout: None,
            waiter: Arc::default(),
        }
    }

    /// Gives up waiting after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The monitor the operation completes.
    ///
    /// Useful as a parent for child monitors, or to cancel the operation.
    pub fn monitor(&self) -> &RequestMonitor<T> {
        &self.monitor
    }

    /// Returns a handle that wakes the blocked caller with [`QueryError::Interrupted`].
    pub fn interrupter(&self) -> QueryInterrupter {
        QueryInterrupter {
            waiter: self.waiter.clone(),
        }
    }

    /// Submits the operation and blocks until it completes.
    #[tracing::instrument(skip(self), fields(executor = %self.monitor.executor().name()))]
    pub fn run(self) -> QueryResult<T> {
        let Query {
            monitor,
            operation,
            timeout,
            waiter,
        } = self;

        let executor = monitor.executor().clone();
        if executor.is_dispatch_context() {
            tracing::error!(
                executor = %executor.name(),
                "query invoked from inside the executor it targets"
            );
            return Err(QueryError::Deadlock {
                executor: executor.name().to_string(),
            });
        }

        let settled = waiter.clone();
        monitor.on_settled(move || settled.settle());

        let target = monitor.clone();
        executor.submit(move || {
            let guard = target.clone();
            if catch_unwind(AssertUnwindSafe(|| operation(target))).is_err() {
                tracing::error!("query operation panicked");
                if guard.is_pending() {
                    let _ = guard
                        .complete_with_error(ErrorCause::internal("Query operation panicked"));
                }
            }
        })?;

        wait(&waiter, &monitor, timeout)?;

        match monitor.take_outcome() {
            Some(Ok(result)) => Ok(result),
            Some(Err(cause)) if cause.is_cancellation() => Err(QueryError::Cancelled(cause)),
            Some(Err(cause)) => Err(QueryError::Failed(cause)),
            None => Err(QueryError::Failed(ErrorCause::internal(
                "Query woke up before completion",
            ))),
        }
    }
}

fn wait<T: Send + 'static>(
    waiter: &Waiter,
    monitor: &RequestMonitor<T>,
    timeout: Option<Duration>,
) -> QueryResult<()> {
    let deadline = timeout.map(|timeout| (Instant::now() + timeout, timeout));
    let mut slot = lock(&waiter.slot);

    loop {
        if slot.settled {
            return Ok(());
        }
        if slot.interrupted {
            drop(slot);
            monitor.cancel();
            return Err(QueryError::Interrupted);
        }

        slot = match deadline {
            None => waiter
                .condvar
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner),
            Some((deadline, timeout)) => {
                let now = Instant::now();
                if now >= deadline {
                    tracing::warn!(?timeout, "query timed out");
                    return Err(QueryError::Timeout(timeout));
                }
                waiter
                    .condvar
                    .wait_timeout(slot, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        };
    }
}

/// Wakes a thread blocked in [`Query::run`].
#[derive(Debug, Clone)]
pub struct QueryInterrupter {
    waiter: Arc<Waiter>,
}

impl QueryInterrupter {
    /// Interrupts the blocked caller; the query's monitor is marked canceled.
    pub fn interrupt(&self) {
        self.waiter.interrupt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tokio::runtime::Runtime;

    fn runtime() -> Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_query_returns_result() {
        let rt = runtime();
        let executor = DispatchExecutor::with_runtime("query", rt.handle());

        let inner = executor.clone();
        let result = Query::new(&executor, move |rm: RequestMonitor<bool>| {
            rm.complete(inner.is_dispatch_context()).unwrap();
        })
        .run();

        assert_eq!(result, Ok(true));
    }

    #[test]
    fn test_query_reraises_cause() {
        let rt = runtime();
        let executor = DispatchExecutor::with_runtime("query", rt.handle());

        let result = Query::new(&executor, |rm: RequestMonitor<()>| {
            rm.complete_with_error(ErrorCause::new(7, "refused")).unwrap();
        })
        .run();

        assert_eq!(result, Err(QueryError::Failed(ErrorCause::new(7, "refused"))));
    }

    #[test]
    fn test_query_completed_later_from_another_task() {
        let rt = runtime();
        let executor = DispatchExecutor::with_runtime("query", rt.handle());

        let result = Query::new(&executor, |rm: RequestMonitor<u32>| {
            let executor = rm.executor().clone();
            executor
                .schedule(move || rm.complete(5).unwrap(), Duration::from_millis(20))
                .unwrap();
        })
        .run();

        assert_eq!(result, Ok(5));
    }

    #[test]
    fn test_query_from_dispatch_context_is_deadlock() {
        let rt = runtime();
        let executor = DispatchExecutor::with_runtime("query", rt.handle());
        let (tx, rx) = mpsc::channel();

        let inner = executor.clone();
        executor
            .submit(move || {
                let outcome = Query::new(&inner, |rm: RequestMonitor<()>| rm.done().unwrap()).run();
                tx.send(outcome).unwrap();
            })
            .unwrap();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Err(QueryError::Deadlock {
                executor: "query".to_string()
            })
        );
    }

    #[test]
    fn test_query_across_executors_is_not_deadlock() {
        let rt = runtime();
        let caller = DispatchExecutor::with_runtime("caller", rt.handle());
        let target = DispatchExecutor::with_runtime("target", rt.handle());
        let (tx, rx) = mpsc::channel();

        caller
            .submit(move || {
                let outcome = Query::new(&target, |rm: RequestMonitor<u32>| rm.complete(3).unwrap())
                    .with_timeout(Duration::from_secs(5))
                    .run();
                tx.send(outcome).unwrap();
            })
            .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(3));
    }

    #[test]
    fn test_query_timeout_discards_late_completion() {
        let rt = runtime();
        let executor = DispatchExecutor::with_runtime("query", rt.handle());
        let (tx, rx) = mpsc::channel();

        let result = Query::new(&executor, move |rm: RequestMonitor<()>| {
            tx.send(rm).unwrap();
        })
        .with_timeout(Duration::from_millis(30))
        .run();
        assert_eq!(result, Err(QueryError::Timeout(Duration::from_millis(30))));

        let late = rx.recv().unwrap();
        assert!(late.done().is_ok());
    }

    #[test]
    fn test_interrupt_cancels_monitor() {
        let rt = runtime();
        let executor = DispatchExecutor::with_runtime("query", rt.handle());
        let (tx, rx) = mpsc::channel();

        let query = Query::new(&executor, move |rm: RequestMonitor<()>| {
            tx.send(rm).unwrap();
        });
        let interrupter = query.interrupter();
        let interrupting = std::thread::spawn(move || {
            let rm = rx.recv().unwrap();
            interrupter.interrupt();
            rm
        });

        assert_eq!(query.run(), Err(QueryError::Interrupted));
        let rm = interrupting.join().unwrap();
        assert!(rm.is_canceled());
    }

    #[test]
    fn test_cancelled_operation() {
        let rt = runtime();
        let executor = DispatchExecutor::with_runtime("query", rt.handle());

        let result = Query::new(&executor, |rm: RequestMonitor<()>| {
            rm.complete_cancelled().unwrap();
        })
        .run();

        assert_eq!(result, Err(QueryError::Cancelled(ErrorCause::cancelled())));
    }

    #[test]
    fn test_shut_down_executor_fails_fast() {
        let rt = runtime();
        let executor = DispatchExecutor::with_runtime("query", rt.handle());
        executor.shutdown();

        let result = Query::new(&executor, |rm: RequestMonitor<()>| rm.done().unwrap()).run();
        assert!(matches!(result, Err(QueryError::Executor(_))));
    }
}
