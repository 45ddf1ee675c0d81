//! Integration tests for the dispatcher loop: atomicity, ordering, reports,
//! reactors and the reentrancy fault. No external services required.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use keel_engine::{
    AccessReport, Action, ActionError, Dispatcher, EngineConfig, Outcome, Reactor, Receipt,
    SubmitError, Submitter, Ticket, Transaction,
};
use keel_storage::{
    Compartment, CompartmentKey, Discriminant, ExpectedKind, MutationKind, State, Storage,
    StorageError,
};

// ---------------------------------------------------------------------------
// Test compartments
// ---------------------------------------------------------------------------

const COUNTING: Discriminant = Discriminant::new("Counting");
const DONE: Discriminant = Discriminant::new("Done");

#[derive(Debug, Clone, PartialEq)]
enum CounterState {
    Counting { value: i64 },
    Done,
}

impl State for CounterState {
    fn discriminant(&self) -> Discriminant {
        match self {
            CounterState::Counting { .. } => COUNTING,
            CounterState::Done => DONE,
        }
    }
}

struct Counter;

impl Compartment for Counter {
    const KEY: CompartmentKey = CompartmentKey::new("Counter");
    type State = CounterState;
}

/// Ordered log of action labels, appended by the actions themselves.
#[derive(Debug, Clone, PartialEq, Default)]
struct Trail(Vec<String>);

impl State for Trail {
    fn discriminant(&self) -> Discriminant {
        Discriminant::new("Trail")
    }
}

struct Journal;

impl Compartment for Journal {
    const KEY: CompartmentKey = CompartmentKey::new("Journal");
    type State = Trail;
}

#[derive(Debug, Clone, PartialEq)]
struct Flag;

impl State for Flag {
    fn discriminant(&self) -> Discriminant {
        Discriminant::new("Flag")
    }
}

struct X;

impl Compartment for X {
    const KEY: CompartmentKey = CompartmentKey::new("X");
    type State = Flag;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn quiet_config() -> EngineConfig {
    EngineConfig::default().with_name("test")
}

fn set_counter(id: &str, state: CounterState) -> Action {
    Action::new(id, move |txn| {
        txn.store::<Counter>(state)?;
        Ok(())
    })
}

fn mark(label: &str) -> Action {
    let label = label.to_string();
    Action::new(format!("mark:{label}"), move |txn| {
        let mut trail = txn.get::<Journal>().cloned().unwrap_or_default();
        trail.0.push(label);
        txn.store::<Journal>(trail)?;
        Ok(())
    })
}

fn require_x_absent() -> Action {
    Action::new("init-x", |txn| {
        txn.store_expecting::<X>(Flag, ExpectedKind::Initialization)?;
        Ok(())
    })
}

fn trail(dispatcher: &Dispatcher) -> Vec<String> {
    dispatcher
        .fetch::<Journal>()
        .map(|trail| trail.0)
        .unwrap_or_default()
}

#[derive(Default)]
struct CountingReactor {
    calls: AtomicUsize,
    tickets: Mutex<Vec<Ticket>>,
}

impl Reactor for CountingReactor {
    fn react(&self, report: &AccessReport, _submitter: &Submitter) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tickets.lock().unwrap().push(report.ticket());
    }
}

// =========================================================================
// Scenarios
// =========================================================================

#[test]
fn counter_lifecycle_through_transactions() {
    let dispatcher = Dispatcher::new(quiet_config());

    let report = dispatcher.execute(set_counter("init", CounterState::Counting { value: 0 }));
    assert_eq!(report.records()[0].kind, MutationKind::Initialization);
    assert_eq!(
        dispatcher.fetch::<Counter>().unwrap(),
        CounterState::Counting { value: 0 }
    );

    let report = dispatcher.execute(set_counter("bump", CounterState::Counting { value: 5 }));
    assert_eq!(report.records()[0].kind, MutationKind::Actualization);
    assert_eq!(
        dispatcher.fetch::<Counter>().unwrap(),
        CounterState::Counting { value: 5 }
    );

    let report = dispatcher.execute(Action::new("finish", |txn| {
        txn.store::<Counter>(CounterState::Done)?;
        txn.remove::<Counter>(Some(DONE), true)?;
        Ok(())
    }));
    let kinds: Vec<_> = report.records().iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![MutationKind::Transition, MutationKind::Deinitialization]
    );
    assert_eq!(
        dispatcher.fetch::<Counter>(),
        Err(StorageError::KeyNotFound { key: Counter::KEY })
    );
}

#[test]
fn second_require_absent_is_rejected() {
    let dispatcher = Dispatcher::new(quiet_config());

    let first = dispatcher.execute(require_x_absent());
    let second = dispatcher.execute(require_x_absent());

    assert!(first.is_processed());
    assert_eq!(first.records()[0].kind, MutationKind::Initialization);

    match &second.outcome {
        Outcome::Rejected(ActionError::Storage(StorageError::SemanticMutation {
            expected,
            actual,
            ..
        })) => {
            assert_eq!(*expected, ExpectedKind::Initialization);
            assert_eq!(*actual, MutationKind::Actualization);
        }
        other => panic!("expected semantic mutation rejection, got {other:?}"),
    }
    assert_eq!(second.storage.history().len(), 1);
    assert_eq!(dispatcher.snapshot().history().len(), 1);
}

// =========================================================================
// Atomicity
// =========================================================================

#[test]
fn failed_body_leaves_no_trace() {
    let dispatcher = Dispatcher::new(quiet_config());
    dispatcher.execute(set_counter("seed", CounterState::Counting { value: 1 }));
    let before = dispatcher.snapshot();

    let report = dispatcher.execute(Action::new("half-done", |txn| {
        txn.store::<Counter>(CounterState::Counting { value: 2 })?;
        txn.store::<X>(Flag)?;
        txn.store::<Counter>(CounterState::Done)?;
        txn.precondition(false, "inventory exhausted")?;
        Ok(())
    }));

    assert_eq!(
        report.rejection(),
        Some(&ActionError::precondition("inventory exhausted"))
    );
    assert!(report.records().is_empty());

    let after = dispatcher.snapshot();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(
        after.fetch::<Counter>().unwrap(),
        CounterState::Counting { value: 1 }
    );
    assert!(!after.contains::<X>());
    assert_eq!(after.history().len(), 1);
}

#[test]
fn storage_error_mid_body_rolls_back_earlier_writes() {
    let dispatcher = Dispatcher::new(quiet_config());

    let report = dispatcher.execute(Action::new("bad-remove", |txn| {
        txn.store::<X>(Flag)?;
        txn.remove::<Counter>(None, true)?;
        Ok(())
    }));

    assert_eq!(
        report.rejection(),
        Some(&ActionError::Storage(StorageError::KeyNotFound { key: Counter::KEY }))
    );
    assert!(dispatcher.snapshot().is_empty());
    assert!(dispatcher.snapshot().history().is_empty());
}

#[test]
fn snapshots_are_immutable_between_commits() {
    let dispatcher = Dispatcher::new(quiet_config());
    dispatcher.execute(set_counter("a", CounterState::Counting { value: 1 }));
    let held = dispatcher.snapshot();

    dispatcher.execute(set_counter("b", CounterState::Counting { value: 2 }));

    assert_eq!(
        held.fetch::<Counter>().unwrap(),
        CounterState::Counting { value: 1 }
    );
    assert_eq!(
        dispatcher.fetch::<Counter>().unwrap(),
        CounterState::Counting { value: 2 }
    );
}

// =========================================================================
// Ordering
// =========================================================================

#[test]
fn outside_submissions_commit_in_order() {
    let dispatcher = Dispatcher::new(quiet_config());

    let a = dispatcher.submit(mark("A"));
    let b = dispatcher.submit(mark("B"));
    let c = dispatcher.submit(mark("C"));

    assert!(a.ticket() < b.ticket() && b.ticket() < c.ticket());
    assert_eq!(trail(&dispatcher), vec!["A", "B", "C"]);
}

#[test]
fn submission_from_body_runs_after_everything_queued_ahead() {
    let seen = Arc::new(Mutex::new(Vec::<(String, Option<Ticket>)>::new()));
    let sink = seen.clone();
    let dispatcher = Dispatcher::builder(quiet_config())
        .on_report(move |report| {
            sink.lock()
                .unwrap()
                .push((report.origin.action.clone(), report.origin.caused_by));
        })
        .build();

    // The gate queues A, B, C from inside a body, so all three are waiting
    // when A runs and queues D.
    dispatcher.submit(Action::new("gate", |txn| {
        let a = Action::new("mark:A", |txn| {
            txn.submit(mark("D")).map_err(|e| ActionError::precondition(e.to_string()))?;
            let mut trail = txn.get::<Journal>().cloned().unwrap_or_default();
            trail.0.push("A".into());
            txn.store::<Journal>(trail)?;
            // D is queued but must not have run yet.
            assert_eq!(txn.fetch::<Journal>().map(|t| t.0.len()).unwrap_or(0), 1);
            Ok(())
        });
        for action in [a, mark("B"), mark("C")] {
            txn.submit(action)
                .map_err(|e| ActionError::precondition(e.to_string()))?;
        }
        Ok(())
    }));

    assert_eq!(trail(&dispatcher), vec!["A", "B", "C", "D"]);

    let seen = seen.lock().unwrap();
    let actions: Vec<&str> = seen.iter().map(|(a, _)| a.as_str()).collect();
    assert_eq!(actions, vec!["gate", "mark:A", "mark:B", "mark:C", "mark:D"]);

    let gate = ticket_of(&dispatcher, "gate");
    let a = ticket_of(&dispatcher, "mark:A");
    assert_eq!(seen[1].1, Some(gate));
    assert_eq!(seen[4].1, Some(a));
}

fn ticket_of(dispatcher: &Dispatcher, action: &str) -> Ticket {
    dispatcher
        .recent_reports()
        .into_iter()
        .find(|r| r.origin.action == action)
        .map(|r| r.ticket())
        .unwrap()
}

#[test]
fn deferred_submission_survives_parent_rejection() {
    let dispatcher = Dispatcher::new(quiet_config());

    let report = dispatcher.execute(Action::new("doomed", |txn| {
        txn.submit(mark("after"))
            .map_err(|e| ActionError::precondition(e.to_string()))?;
        Err(ActionError::precondition("nope"))
    }));

    assert!(!report.is_processed());
    assert_eq!(trail(&dispatcher), vec!["after"]);
}

#[test]
fn concurrent_submitters_never_interleave_bodies() {
    let dispatcher = Dispatcher::new(quiet_config().with_report_log_capacity(0));
    dispatcher.execute(set_counter("seed", CounterState::Counting { value: 0 }));
    let in_body = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            let in_body = in_body.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    let in_body = in_body.clone();
                    dispatcher.submit(Action::new("increment", move |txn| {
                        assert!(!in_body.swap(true, Ordering::SeqCst), "bodies overlapped");
                        let value = match txn.fetch::<Counter>()? {
                            CounterState::Counting { value } => value,
                            CounterState::Done => 0,
                        };
                        txn.store::<Counter>(CounterState::Counting { value: value + 1 })?;
                        in_body.store(false, Ordering::SeqCst);
                        Ok(())
                    }));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(dispatcher.pending(), 0);
    assert_eq!(
        dispatcher.fetch::<Counter>().unwrap(),
        CounterState::Counting { value: 400 }
    );
}

#[test]
fn execute_waits_for_another_drainer() {
    let dispatcher = Dispatcher::new(quiet_config());
    let started = Arc::new(AtomicBool::new(false));

    let background = {
        let dispatcher = dispatcher.clone();
        let started = started.clone();
        thread::spawn(move || {
            dispatcher.submit(Action::new("slow", move |txn| {
                started.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                txn.store::<X>(Flag)?;
                Ok(())
            }));
        })
    };
    while !started.load(Ordering::SeqCst) {
        thread::yield_now();
    }

    let report = dispatcher.execute(mark("after-slow"));

    assert!(report.is_processed());
    assert!(report.storage.contains::<X>());
    background.join().unwrap();
}

// =========================================================================
// Reports and reactors
// =========================================================================

#[test]
fn every_attempt_is_reported_once() {
    let count = Arc::new(AtomicUsize::new(0));
    let hook_count = count.clone();
    let dispatcher = Dispatcher::builder(quiet_config())
        .on_report(move |_| {
            hook_count.fetch_add(1, Ordering::SeqCst);
        })
        .build();

    dispatcher.execute(require_x_absent());
    dispatcher.execute(require_x_absent());
    dispatcher.execute(mark("ok"));

    assert_eq!(count.load(Ordering::SeqCst), 3);
    let reports = dispatcher.recent_reports();
    let processed: Vec<bool> = reports.iter().map(AccessReport::is_processed).collect();
    assert_eq!(processed, vec![true, false, true]);
}

#[test]
fn reactors_skip_rejected_transactions() {
    let reactor = Arc::new(CountingReactor::default());
    let dispatcher = Dispatcher::builder(quiet_config())
        .reactor(reactor.clone())
        .build();

    let ok = dispatcher.execute(require_x_absent());
    dispatcher.execute(require_x_absent());
    dispatcher.execute(Action::new("noop", |_| Ok(())));

    assert_eq!(reactor.calls.load(Ordering::SeqCst), 2);
    let tickets = reactor.tickets.lock().unwrap().clone();
    assert_eq!(tickets[0], ok.ticket());
}

struct FollowUp;

impl Reactor for FollowUp {
    fn react(&self, report: &AccessReport, submitter: &Submitter) {
        let done = report
            .records()
            .iter()
            .any(|r| r.next_as::<Counter>() == Some(&CounterState::Done));
        if done {
            submitter.submit(mark("celebrate")).unwrap();
        }
    }
}

#[test]
fn reactor_follow_up_runs_after_the_pass() {
    let dispatcher = Dispatcher::builder(quiet_config()).reactor(FollowUp).build();

    let report = dispatcher.execute(set_counter("finish", CounterState::Done));

    assert!(report.is_processed());
    assert_eq!(trail(&dispatcher), vec!["celebrate"]);
    let follow_up = dispatcher.recent_reports().pop().unwrap();
    assert_eq!(follow_up.origin.caused_by, Some(report.ticket()));
}

#[test]
fn report_log_is_bounded() {
    let dispatcher = Dispatcher::new(quiet_config().with_report_log_capacity(2));
    for label in ["a", "b", "c"] {
        dispatcher.execute(mark(label));
    }
    let actions: Vec<String> = dispatcher
        .recent_reports()
        .into_iter()
        .map(|r| r.origin.action)
        .collect();
    assert_eq!(actions, vec!["mark:b", "mark:c"]);
}

#[test]
fn reset_history_returns_and_clears() {
    let dispatcher = Dispatcher::new(quiet_config());
    dispatcher.execute(mark("one"));
    dispatcher.execute(mark("two"));
    let marker = dispatcher.snapshot().reset_marker();

    let drained = dispatcher.reset_history();

    assert_eq!(drained.len(), 2);
    let snapshot = dispatcher.snapshot();
    assert!(snapshot.history().is_empty());
    assert_ne!(snapshot.reset_marker(), marker);
    assert_eq!(trail(&dispatcher), vec!["one", "two"]);
}

#[test]
fn records_survive_a_reset_inside_the_transaction() {
    let dispatcher = Dispatcher::new(quiet_config());
    dispatcher.execute(set_counter("seed", CounterState::Counting { value: 0 }));
    let drained = Arc::new(AtomicUsize::new(0));

    let seen = drained.clone();
    let report = dispatcher.execute(Action::new("reset-between", move |txn| {
        txn.store::<Counter>(CounterState::Counting { value: 1 })?;
        seen.store(txn.reset_history().len(), Ordering::SeqCst);
        txn.store::<Counter>(CounterState::Done)?;
        Ok(())
    }));

    let kinds: Vec<_> = report.records().iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![MutationKind::Actualization, MutationKind::Transition]);
    assert_eq!(drained.load(Ordering::SeqCst), 2);
    assert_eq!(dispatcher.snapshot().history().len(), 1);
}

#[test]
fn reset_inside_a_rejected_body_is_rolled_back() {
    let dispatcher = Dispatcher::new(quiet_config());
    dispatcher.execute(mark("one"));
    let before = dispatcher.snapshot();

    let report = dispatcher.execute(Action::new("reset-then-fail", |txn| {
        txn.reset_history();
        Err(ActionError::precondition("changed my mind"))
    }));

    assert!(!report.is_processed());
    let after = dispatcher.snapshot();
    assert_eq!(after.reset_marker(), before.reset_marker());
    assert_eq!(after.history().len(), 1);
    assert_eq!(
        after.history().last().map(|r| r.seq),
        before.history().last().map(|r| r.seq)
    );
}

#[test]
fn working_copies_share_committed_history() {
    let dispatcher = Dispatcher::new(quiet_config());
    for value in 0..200 {
        dispatcher.execute(set_counter("tick", CounterState::Counting { value }));
    }

    let committed = dispatcher.snapshot();
    assert_eq!(committed.history().unsealed(), 0);
    assert_eq!(committed.history().len(), 200);

    let working = Storage::clone(&committed);
    for (old, new) in committed.history().iter().zip(working.history().iter()) {
        assert!(std::ptr::eq(old, new), "record {} was copied", old.seq);
    }
}

// =========================================================================
// Reentrancy
// =========================================================================

#[test]
#[should_panic(expected = "reentrant transaction")]
fn forcing_a_nested_transaction_is_a_fault() {
    let dispatcher = Dispatcher::new(quiet_config());
    let inner = dispatcher.clone();

    dispatcher.execute(Action::new("outer", move |_txn| {
        inner.execute(mark("inner"));
        Ok(())
    }));
}

struct NestedExecutor(Dispatcher);

impl Reactor for NestedExecutor {
    fn react(&self, _report: &AccessReport, _submitter: &Submitter) {
        self.0.execute(mark("from-reactor"));
    }
}

#[test]
fn reactor_may_drive_another_dispatcher() {
    let target = Dispatcher::new(quiet_config());
    let driver = Dispatcher::builder(quiet_config())
        .reactor(NestedExecutor(target.clone()))
        .build();

    driver.execute(mark("drive"));

    assert_eq!(trail(&target), vec!["from-reactor"]);
}

/// Reactor wired to its own dispatcher after construction.
struct SelfExecutor(Arc<Mutex<Option<Dispatcher>>>);

impl Reactor for SelfExecutor {
    fn react(&self, _report: &AccessReport, _submitter: &Submitter) {
        let own = self.0.lock().unwrap().clone();
        if let Some(dispatcher) = own {
            dispatcher.execute(mark("self"));
        }
    }
}

#[test]
#[should_panic(expected = "reentrant transaction")]
fn forcing_own_transaction_from_a_reactor_is_a_fault() {
    let slot = Arc::new(Mutex::new(None));
    let dispatcher = Dispatcher::builder(quiet_config())
        .reactor(SelfExecutor(slot.clone()))
        .build();
    *slot.lock().unwrap() = Some(dispatcher.clone());

    dispatcher.execute(mark("trigger"));
}

/// Runs a body that forces a nested transaction and swallows the fault.
fn trip_reentrancy_fault<F>(dispatcher: &Dispatcher, before_fault: F)
where
    F: FnOnce(&mut Transaction<'_>) + Send + 'static,
{
    let inner = dispatcher.clone();
    let faulted = panic::catch_unwind(AssertUnwindSafe(|| {
        dispatcher.execute(Action::new("outer", move |txn| {
            before_fault(txn);
            inner.execute(mark("nested"));
            Ok(())
        }))
    }));
    assert!(faulted.is_err());
}

#[test]
#[should_panic(expected = "halted")]
fn dispatcher_refuses_work_after_a_fault() {
    let dispatcher = Dispatcher::new(quiet_config());
    trip_reentrancy_fault(&dispatcher, |_| {});

    dispatcher.submit(mark("after"));
}

#[test]
fn submit_inside_body_is_deferred_not_nested() {
    let dispatcher = Dispatcher::new(quiet_config());
    let handle = dispatcher.clone();

    let report = dispatcher.execute(Action::new("outer", move |txn| {
        let receipt = handle.submit(mark("inner"));
        // Still queued: the body has not finished.
        assert_eq!(txn.fetch::<Journal>().ok(), None);
        assert!(receipt.ticket() > txn.ticket());
        Ok(())
    }));

    assert!(report.is_processed());
    assert_eq!(trail(&dispatcher), vec!["inner"]);
}

// =========================================================================
// Async continuation
// =========================================================================

#[tokio::test]
async fn receipt_settles_with_report() {
    let dispatcher = Dispatcher::new(quiet_config());

    let receipt = dispatcher.submit(require_x_absent());
    let report = receipt.settled().await.unwrap();

    assert!(report.is_processed());
    assert_eq!(report.records()[0].kind, MutationKind::Initialization);
}

#[tokio::test]
async fn async_continuation_resubmits() {
    let dispatcher = Dispatcher::new(quiet_config());
    let (tx, rx) = tokio::sync::oneshot::channel();

    let start = dispatcher.submit(Action::new("start-fetch", move |txn| {
        txn.store::<Counter>(CounterState::Counting { value: 0 })?;
        let submitter = txn.submitter();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let receipt = submitter.submit(set_counter("fetched", CounterState::Done));
            let _ = tx.send(receipt);
        });
        Ok(())
    }));

    let receipt = rx.await.unwrap().unwrap();
    let report = receipt.settled().await.unwrap();

    assert_eq!(report.records()[0].kind, MutationKind::Transition);
    assert_eq!(report.origin.caused_by, Some(start.ticket()));
    assert_eq!(dispatcher.fetch::<Counter>().unwrap(), CounterState::Done);
}

#[tokio::test]
async fn fault_settles_queued_receipts_as_unsettled() {
    let dispatcher = Dispatcher::new(quiet_config());
    let slot: Arc<Mutex<Option<Receipt>>> = Arc::default();

    let keep = slot.clone();
    trip_reentrancy_fault(&dispatcher, move |txn| {
        let receipt = txn.submit(mark("queued")).unwrap();
        *keep.lock().unwrap() = Some(receipt);
    });

    let receipt = slot.lock().unwrap().take().unwrap();
    let ticket = receipt.ticket();
    let settled = tokio::time::timeout(Duration::from_secs(2), receipt.settled())
        .await
        .expect("queued receipt resolves after the fault");
    assert!(matches!(settled, Err(SubmitError::Unsettled(t)) if t == ticket));
}

#[test]
fn submitter_outliving_dispatcher_reports_drop() {
    let dispatcher = Dispatcher::new(quiet_config());
    let submitter = dispatcher.submitter();
    drop(dispatcher);

    assert_eq!(
        submitter.submit(mark("late")).unwrap_err(),
        SubmitError::DispatcherDropped
    );
}
