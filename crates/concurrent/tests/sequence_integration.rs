//! Integration tests for the step sequence engine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use concurrent::{
    DispatchExecutor, ErrorCause, FnStep, MonitorStatus, RequestMonitor, Sequence, SequenceState,
    Step, codes,
};
use tokio::sync::{mpsc, oneshot};

#[derive(Default)]
struct Journal {
    entries: Mutex<Vec<String>>,
}

impl Journal {
    fn record(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }
}

fn ok_step(name: &'static str) -> FnStep<Journal> {
    FnStep::new(name, move |journal: &Arc<Journal>, rm| {
        journal.record(format!("execute {name}"));
        rm.done().unwrap();
    })
    .with_rollback(move |journal: &Arc<Journal>, rm| {
        journal.record(format!("rollback {name}"));
        rm.done().unwrap();
    })
}

fn failing_step(name: &'static str, code: i32) -> FnStep<Journal> {
    FnStep::new(name, move |journal: &Arc<Journal>, rm| {
        journal.record(format!("execute {name}"));
        rm.complete_with_error(ErrorCause::new(code, format!("{name} failed")))
            .unwrap();
    })
    .with_rollback(move |journal: &Arc<Journal>, rm| {
        journal.record(format!("rollback {name}"));
        rm.done().unwrap();
    })
}

/// A step that hands its monitor to the test instead of completing it.
fn held_step(
    name: &'static str,
    held: mpsc::UnboundedSender<RequestMonitor>,
) -> FnStep<Journal> {
    FnStep::new(name, move |journal: &Arc<Journal>, rm| {
        journal.record(format!("execute {name}"));
        held.send(rm).unwrap();
    })
    .with_rollback(move |journal: &Arc<Journal>, rm| {
        journal.record(format!("rollback {name}"));
        rm.done().unwrap();
    })
}

async fn finished(overall: &RequestMonitor) -> RequestMonitor {
    let (tx, rx) = oneshot::channel();
    overall
        .set_completion_callback(move |rm| {
            let _ = tx.send(rm);
        })
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("sequence did not finish")
        .unwrap()
}

fn executor() -> DispatchExecutor {
    DispatchExecutor::new("sequence-test").unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_all_steps_succeed_without_rollback() {
    let executor = executor();
    let journal = Arc::new(Journal::default());
    let sequence = Sequence::new("happy", journal.clone())
        .with_step(ok_step("a"))
        .with_step(ok_step("b"))
        .with_step(ok_step("c"));
    let observer = sequence.observer();

    let overall = sequence.submit(&executor).unwrap();
    let done = finished(&overall).await;

    assert!(done.is_success());
    assert_eq!(journal.entries(), vec!["execute a", "execute b", "execute c"]);
    assert_eq!(observer.state(), SequenceState::Succeeded);
    let report = observer.report();
    assert_eq!(report.executed, vec!["a", "b", "c"]);
    assert!(report.rolled_back.is_empty());
    assert!(report.failure.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_step_rolls_back_predecessors_and_reports_original_cause() {
    let executor = executor();
    let journal = Arc::new(Journal::default());
    let sequence = Sequence::new("abc", journal.clone())
        .with_step(ok_step("a"))
        .with_step(failing_step("b", 7))
        .with_step(ok_step("c"));
    let observer = sequence.observer();

    let overall = sequence.submit(&executor).unwrap();
    let done = finished(&overall).await;

    assert_eq!(done.status(), MonitorStatus::Error);
    assert_eq!(done.error().unwrap().code, 7);
    assert_eq!(journal.count("rollback a"), 1);
    assert_eq!(journal.count("execute c"), 0);
    assert_eq!(journal.count("rollback b"), 0);
    assert_eq!(
        journal.entries(),
        vec!["execute a", "execute b", "rollback a"]
    );
    assert_eq!(observer.state(), SequenceState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rollback_is_strictly_descending_for_every_failure_position() {
    const NAMES: [&str; 5] = ["s0", "s1", "s2", "s3", "s4"];

    for failing in 0..NAMES.len() {
        let executor = executor();
        let journal = Arc::new(Journal::default());
        let mut sequence = Sequence::new("positions", journal.clone());
        for (index, name) in NAMES.into_iter().enumerate() {
            sequence = if index == failing {
                sequence.with_step(failing_step(name, 100 + index as i32))
            } else {
                sequence.with_step(ok_step(name))
            };
        }

        let overall = sequence.submit(&executor).unwrap();
        let done = finished(&overall).await;
        assert_eq!(done.error().unwrap().code, 100 + failing as i32);

        let rollbacks: Vec<String> = journal
            .entries()
            .into_iter()
            .filter(|e| e.starts_with("rollback"))
            .collect();
        let expected: Vec<String> = (0..failing)
            .rev()
            .map(|index| format!("rollback {}", NAMES[index]))
            .collect();
        assert_eq!(rollbacks, expected, "failure at step {failing}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rollback_fault_does_not_override_original_cause() {
    let executor = executor();
    let journal = Arc::new(Journal::default());
    let broken_rollback = FnStep::new("a", |journal: &Arc<Journal>, rm| {
        journal.record("execute a");
        rm.done().unwrap();
    })
    .with_rollback(|journal: &Arc<Journal>, rm| {
        journal.record("rollback a");
        rm.complete_with_error(ErrorCause::new(99, "cannot undo a"))
            .unwrap();
    });
    let sequence = Sequence::new("faulty", journal.clone())
        .with_step(broken_rollback)
        .with_step(ok_step("b"))
        .with_step(failing_step("c", 7));
    let observer = sequence.observer();

    let overall = sequence.submit(&executor).unwrap();
    let done = finished(&overall).await;

    assert_eq!(done.error().unwrap().code, 7);
    assert_eq!(
        journal.entries(),
        vec!["execute a", "execute b", "execute c", "rollback b", "rollback a"]
    );
    let report = observer.report();
    assert_eq!(report.rolled_back, vec!["b", "a"]);
    assert_eq!(report.rollback_faults.len(), 1);
    assert_eq!(report.rollback_faults[0].index, 0);
    assert_eq!(report.rollback_faults[0].cause.code, 99);
    assert_eq!(report.failure.unwrap().code, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_marks_running_step_and_stops_pipeline() {
    let executor = executor();
    let journal = Arc::new(Journal::default());
    let (held_tx, mut held_rx) = mpsc::unbounded_channel();
    let sequence = Sequence::new("cancel", journal.clone())
        .with_step(ok_step("a"))
        .with_step(held_step("b", held_tx))
        .with_step(ok_step("c"));
    let observer = sequence.observer();

    let overall = sequence.submit(&executor).unwrap();
    let step_b = held_rx.recv().await.unwrap();
    assert!(!step_b.is_canceled());

    overall.cancel();
    assert!(step_b.is_canceled());
    step_b.complete_cancelled().unwrap();

    let done = finished(&overall).await;
    assert_eq!(done.status(), MonitorStatus::Cancelled);
    assert_eq!(done.error().unwrap().code, codes::CANCELLED);
    assert_eq!(journal.count("execute c"), 0);
    assert_eq!(
        journal.entries(),
        vec!["execute a", "execute b", "rollback a"]
    );
    assert_eq!(observer.state(), SequenceState::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_ignored_by_step_still_stops_next_step() {
    let executor = executor();
    let journal = Arc::new(Journal::default());
    let (held_tx, mut held_rx) = mpsc::unbounded_channel();
    let sequence = Sequence::new("stubborn", journal.clone())
        .with_step(ok_step("a"))
        .with_step(held_step("b", held_tx))
        .with_step(ok_step("c"));

    let overall = sequence.submit(&executor).unwrap();
    let step_b = held_rx.recv().await.unwrap();
    overall.cancel();
    step_b.done().unwrap();

    let done = finished(&overall).await;
    assert_eq!(done.status(), MonitorStatus::Cancelled);
    assert_eq!(
        journal.entries(),
        vec!["execute a", "execute b", "rollback b", "rollback a"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_during_last_step_that_succeeds_completes() {
    let executor = executor();
    let journal = Arc::new(Journal::default());
    let (held_tx, mut held_rx) = mpsc::unbounded_channel();
    let sequence = Sequence::new("late-cancel", journal.clone())
        .with_step(ok_step("a"))
        .with_step(held_step("b", held_tx));
    let observer = sequence.observer();

    let overall = sequence.submit(&executor).unwrap();
    let step_b = held_rx.recv().await.unwrap();
    overall.cancel();
    step_b.done().unwrap();

    let done = finished(&overall).await;
    assert_eq!(done.status(), MonitorStatus::Success);
    assert_eq!(journal.entries(), vec!["execute a", "execute b"]);
    assert_eq!(journal.count("rollback a"), 0);
    assert_eq!(journal.count("rollback b"), 0);
    assert_eq!(observer.state(), SequenceState::Succeeded);
    assert!(observer.report().rolled_back.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancellation_observed_before_error_wins() {
    let executor = executor();
    let journal = Arc::new(Journal::default());
    let (held_tx, mut held_rx) = mpsc::unbounded_channel();
    let sequence = Sequence::new("tie-cancel", journal.clone())
        .with_step(ok_step("a"))
        .with_step(held_step("b", held_tx));

    let overall = sequence.submit(&executor).unwrap();
    let step_b = held_rx.recv().await.unwrap();
    overall.cancel();
    step_b
        .complete_with_error(ErrorCause::new(7, "late failure"))
        .unwrap();

    let done = finished(&overall).await;
    let cause = done.error().unwrap();
    assert_eq!(done.status(), MonitorStatus::Cancelled);
    assert!(cause.is_cancellation());
    assert_eq!(cause.cause.unwrap().code, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_error_reported_before_cancellation_wins() {
    let executor = executor();
    let journal = Arc::new(Journal::default());
    let (held_tx, mut held_rx) = mpsc::unbounded_channel();
    let sequence = Sequence::new("tie-error", journal.clone())
        .with_step(ok_step("a"))
        .with_step(held_step("b", held_tx));

    let overall = sequence.submit(&executor).unwrap();
    let step_b = held_rx.recv().await.unwrap();
    step_b
        .complete_with_error(ErrorCause::new(7, "real failure"))
        .unwrap();
    overall.cancel();

    let done = finished(&overall).await;
    assert_eq!(done.status(), MonitorStatus::Error);
    assert_eq!(done.error().unwrap().code, 7);
    assert_eq!(journal.count("rollback a"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_steps_complete_asynchronously_on_dispatch_context() {
    let executor = executor();
    let journal = Arc::new(Journal::default());
    let dispatch = executor.clone();
    let slow = FnStep::new("slow", move |journal: &Arc<Journal>, rm| {
        journal.record(format!("slow on dispatch: {}", dispatch.is_dispatch_context()));
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            rm.done().unwrap();
        });
    });
    let sequence = Sequence::new("async", journal.clone())
        .with_step(slow)
        .with_step(ok_step("after"));

    let overall = sequence.submit(&executor).unwrap();
    let done = finished(&overall).await;

    assert!(done.is_success());
    assert_eq!(
        journal.entries(),
        vec!["slow on dispatch: true", "execute after"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_step_fails_sequence_and_rolls_back() {
    let executor = executor();
    let journal = Arc::new(Journal::default());
    let panicking = FnStep::new("explodes", |_: &Arc<Journal>, _rm| panic!("step bug"));
    let sequence = Sequence::new("panic", journal.clone())
        .with_step(ok_step("a"))
        .with_step(panicking);

    let overall = sequence.submit(&executor).unwrap();
    let done = finished(&overall).await;

    assert_eq!(done.error().unwrap().code, codes::INTERNAL_ERROR);
    assert_eq!(journal.entries(), vec!["execute a", "rollback a"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_observer_publishes_transitions() {
    let executor = executor();
    let journal = Arc::new(Journal::default());
    let sequence = Sequence::new("observed", journal.clone())
        .with_step(ok_step("a"))
        .with_step(failing_step("b", 7));
    let observer = sequence.observer();
    let mut states = observer.subscribe();
    assert_eq!(*states.borrow(), SequenceState::NotStarted);

    let overall = sequence.submit(&executor).unwrap();
    finished(&overall).await;

    states
        .wait_for(|state| state.is_terminal())
        .await
        .unwrap();
    assert_eq!(observer.state(), SequenceState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parent_cancellation_reaches_running_step() {
    let executor = executor();
    let journal = Arc::new(Journal::default());
    let launch = RequestMonitor::<()>::new(&executor);
    let (held_tx, mut held_rx) = mpsc::unbounded_channel();
    let sequence = Sequence::new("child", journal.clone())
        .with_step(held_step("a", held_tx))
        .with_step(ok_step("b"))
        .with_parent(&launch);

    let overall = sequence.submit(&executor).unwrap();
    let step_a = held_rx.recv().await.unwrap();

    launch.cancel();
    assert!(overall.is_canceled());
    assert!(step_a.is_canceled());
    step_a.complete_cancelled().unwrap();

    let done = finished(&overall).await;
    assert_eq!(done.status(), MonitorStatus::Cancelled);
    assert_eq!(journal.count("execute b"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_sequence_succeeds() {
    let executor = executor();
    let sequence = Sequence::new("empty", Arc::new(Journal::default()));
    assert!(sequence.is_empty());

    let overall = sequence.submit(&executor).unwrap();
    assert!(finished(&overall).await.is_success());
}

struct CountingStep {
    name: String,
}

impl Step<Journal> for CountingStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, journal: &Arc<Journal>, rm: RequestMonitor) {
        journal.record(format!("execute {}", self.name));
        rm.done().unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_trait_step_without_rollback_uses_default() {
    let executor = executor();
    let journal = Arc::new(Journal::default());
    let sequence = Sequence::new("trait", journal.clone())
        .with_step(CountingStep {
            name: "plain".to_string(),
        })
        .with_step(failing_step("fails", 7));
    let observer = sequence.observer();

    let overall = sequence.submit(&executor).unwrap();
    let done = finished(&overall).await;

    assert_eq!(done.error().unwrap().code, 7);
    assert_eq!(journal.entries(), vec!["execute plain", "execute fails"]);
    assert_eq!(observer.report().rolled_back, vec!["plain"]);
    assert!(observer.report().rollback_faults.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_submit_to_shut_down_executor_fails() {
    let executor = executor();
    executor.shutdown();
    let sequence = Sequence::new("late", Arc::new(Journal::default())).with_step(ok_step("a"));

    assert!(sequence.submit(&executor).is_err());
}
