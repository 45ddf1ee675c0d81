//! The transaction loop.
//!
//! Any thread may hand an action over. Whichever caller finds the executor
//! free becomes the drainer and runs queued actions one at a time until the
//! queue is empty; everyone else just enqueues and returns. Submissions made
//! while a transaction is running (from its body, a report hook or a reactor)
//! land at the back of the queue and run after the current one settles.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError, Weak};

use keel_storage::{Compartment, MutationRecord, Storage, StorageResult};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::action::Action;
use crate::config::EngineConfig;
use crate::fault::{ActiveScope, EngineFault};
use crate::report::{AccessReport, Origin, ReportLog, Ticket};
use crate::traits::Reactor;
use crate::transaction::Transaction;

type ReportHook = Box<dyn Fn(&AccessReport) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("dispatcher has been dropped")]
    DispatcherDropped,

    /// The dispatcher went away or halted before reporting on the ticket.
    #[error("ticket {0} was never settled")]
    Unsettled(Ticket),
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct DispatcherBuilder {
    config: EngineConfig,
    hooks: Vec<ReportHook>,
    reactors: Vec<Box<dyn Reactor>>,
}

impl DispatcherBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            hooks: Vec::new(),
            reactors: Vec::new(),
        }
    }

    /// Called with every report, processed or rejected, in ticket order.
    pub fn on_report(mut self, hook: impl Fn(&AccessReport) + Send + Sync + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    /// Evaluated after every committed transaction, in registration order.
    pub fn reactor(mut self, reactor: impl Reactor + 'static) -> Self {
        self.reactors.push(Box::new(reactor));
        self
    }

    pub fn build(self) -> Dispatcher {
        let shared = Shared {
            id: Uuid::new_v4(),
            reports: Mutex::new(ReportLog::new(self.config.report_log_capacity)),
            config: self.config,
            queue: Mutex::new(VecDeque::new()),
            executor: Mutex::new(()),
            committed: RwLock::new(Arc::new(Storage::new())),
            next_ticket: AtomicU64::new(1),
            hooks: self.hooks,
            reactors: self.reactors,
        };
        debug!(dispatcher = shared.config.name.as_str(), id = %shared.id, "Dispatcher created");
        Dispatcher {
            shared: Arc::new(shared),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Owns the canonical storage and serializes every change to it.
///
/// Cloning yields another handle to the same dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Dispatcher {
    pub fn new(config: EngineConfig) -> Self {
        DispatcherBuilder::new(config).build()
    }

    pub fn builder(config: EngineConfig) -> DispatcherBuilder {
        DispatcherBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Hand an action over. Returns once it is queued, or once the queue has
    /// been drained if this call ended up as the drainer.
    pub fn submit(&self, action: Action) -> Receipt {
        self.shared.submit(action, None)
    }

    /// A detachable submission capability, e.g. for async continuations.
    pub fn submitter(&self) -> Submitter {
        Submitter {
            shared: Arc::downgrade(&self.shared),
            caused_by: None,
        }
    }

    /// Run `action` (and anything queued ahead of it) to completion on the
    /// calling thread and return its report. Blocks while another thread is
    /// draining.
    ///
    /// # Panics
    ///
    /// With `EngineFault::ReentrantTransaction` when called from inside one of
    /// this dispatcher's transactions, report hooks or reactors.
    pub fn execute(&self, action: Action) -> AccessReport {
        let shared = &self.shared;
        if ActiveScope::is_active(shared.id) {
            shared.halt(EngineFault::ReentrantTransaction {
                dispatcher: shared.config.name.clone(),
                action: action.id().to_string(),
            });
        }

        let mut receipt = shared.enqueue(action, None);
        {
            let _executor = match shared.executor.lock() {
                Ok(guard) => guard,
                Err(_) => shared.poisoned(),
            };
            while let Some(queued) = shared.pop() {
                shared.process(queued);
            }
        }
        // Pick up anything enqueued by others while we held the executor.
        shared.drain();

        receipt.try_settled().unwrap_or_else(|| {
            shared.halt(EngineFault::LostReport {
                dispatcher: shared.config.name.clone(),
                ticket: receipt.ticket().value(),
            })
        })
    }

    /// The committed storage. Immutable; later commits publish a new one.
    pub fn snapshot(&self) -> Arc<Storage> {
        self.shared.committed()
    }

    /// Read `C` from the committed storage.
    pub fn fetch<C: Compartment>(&self) -> StorageResult<C::State> {
        self.shared.committed().fetch::<C>()
    }

    /// Number of actions waiting behind the one currently running.
    pub fn pending(&self) -> usize {
        self.shared.lock_queue().len()
    }

    /// Most recent reports, oldest first, bounded by `report_log_capacity`.
    pub fn recent_reports(&self) -> Vec<AccessReport> {
        self.shared.lock_reports().to_vec()
    }

    /// Snapshot-and-clear the committed history as its own transaction.
    pub fn reset_history(&self) -> Vec<MutationRecord> {
        let (tx, mut rx) = oneshot::channel();
        self.execute(Action::new("keel:reset-history", move |txn| {
            let _ = tx.send(txn.reset_history());
            Ok(())
        }));
        rx.try_recv().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Submitter / Receipt
// ---------------------------------------------------------------------------

/// Submission-only handle. Holds no strong reference to the dispatcher.
#[derive(Clone)]
pub struct Submitter {
    shared: Weak<Shared>,
    caused_by: Option<Ticket>,
}

impl Submitter {
    pub fn submit(&self, action: Action) -> Result<Receipt, SubmitError> {
        let shared = self.shared.upgrade().ok_or(SubmitError::DispatcherDropped)?;
        Ok(shared.submit(action, self.caused_by))
    }

    /// Ticket recorded as the cause of actions submitted through this handle.
    pub fn caused_by(&self) -> Option<Ticket> {
        self.caused_by
    }
}

/// Claim on the report of one submitted action.
#[derive(Debug)]
pub struct Receipt {
    ticket: Ticket,
    rx: oneshot::Receiver<AccessReport>,
}

impl Receipt {
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Wait for the action to settle.
    pub async fn settled(self) -> Result<AccessReport, SubmitError> {
        let ticket = self.ticket;
        self.rx.await.map_err(|_| SubmitError::Unsettled(ticket))
    }

    /// The report, if the action has settled already.
    pub fn try_settled(&mut self) -> Option<AccessReport> {
        self.rx.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// Shared state and the loop itself
// ---------------------------------------------------------------------------

struct Queued {
    ticket: Ticket,
    caused_by: Option<Ticket>,
    action: Action,
    reply: oneshot::Sender<AccessReport>,
}

struct Shared {
    id: Uuid,
    config: EngineConfig,
    queue: Mutex<VecDeque<Queued>>,
    /// Held by whoever is draining. Guards nothing but the right to run.
    executor: Mutex<()>,
    committed: RwLock<Arc<Storage>>,
    reports: Mutex<ReportLog>,
    next_ticket: AtomicU64,
    hooks: Vec<ReportHook>,
    reactors: Vec<Box<dyn Reactor>>,
}

impl Shared {
    fn submit(self: &Arc<Self>, action: Action, caused_by: Option<Ticket>) -> Receipt {
        let receipt = self.enqueue(action, caused_by);
        self.drain();
        receipt
    }

    fn enqueue(&self, action: Action, caused_by: Option<Ticket>) -> Receipt {
        let (reply, rx) = oneshot::channel();
        let mut queue = self.lock_queue();
        // Tickets are taken under the queue lock so ticket order is queue order.
        let ticket = Ticket::new(self.next_ticket.fetch_add(1, Ordering::SeqCst));
        debug!(
            dispatcher = self.config.name.as_str(),
            %ticket,
            action = action.id(),
            caused_by = ?caused_by,
            "Action queued"
        );
        queue.push_back(Queued {
            ticket,
            caused_by,
            action,
            reply,
        });
        if backlog_crossed(queue.len(), self.config.queue_warn_threshold) {
            warn!(
                dispatcher = self.config.name.as_str(),
                depth = queue.len(),
                threshold = self.config.queue_warn_threshold,
                "Dispatcher backlog above threshold"
            );
        }
        Receipt { ticket, rx }
    }

    /// Become the drainer if nobody is; otherwise leave the work to them.
    fn drain(self: &Arc<Self>) {
        loop {
            {
                let _executor = match self.executor.try_lock() {
                    Ok(guard) => guard,
                    Err(TryLockError::WouldBlock) => return,
                    Err(TryLockError::Poisoned(_)) => self.poisoned(),
                };
                while let Some(queued) = self.pop() {
                    self.process(queued);
                }
            }
            // Someone may have enqueued after our last pop but before we let
            // go of the executor; their try_lock failed, so the work is ours.
            if self.lock_queue().is_empty() {
                return;
            }
        }
    }

    fn pop(&self) -> Option<Queued> {
        self.lock_queue().pop_front()
    }

    fn process(self: &Arc<Self>, queued: Queued) {
        let Queued {
            ticket,
            caused_by,
            action,
            reply,
        } = queued;
        let (action_id, body) = action.into_parts();
        let _scope = ActiveScope::enter(self.id);

        let origin = Origin {
            dispatcher: self.config.name.clone(),
            action: action_id,
            ticket,
            caused_by,
        };
        let submitter = Submitter {
            shared: Arc::downgrade(self),
            caused_by: Some(ticket),
        };

        let canonical = self.committed();
        let mut working = Storage::clone(&canonical);
        let result = {
            let mut txn = Transaction::new(ticket, &mut working, submitter.clone());
            body(&mut txn).map(|()| txn.into_records())
        };

        let report = match result {
            Ok(records) => {
                working.seal_history();
                let committed = Arc::new(working);
                self.publish(committed.clone());
                info!(
                    dispatcher = self.config.name.as_str(),
                    %ticket,
                    action = origin.action.as_str(),
                    mutations = records.len(),
                    "Transaction committed"
                );
                AccessReport::processed(origin, records, committed)
            }
            Err(reason) => {
                warn!(
                    dispatcher = self.config.name.as_str(),
                    %ticket,
                    action = origin.action.as_str(),
                    code = reason.code(),
                    error = %reason,
                    "Transaction rejected"
                );
                AccessReport::rejected(origin, reason, canonical)
            }
        };

        self.emit(&report, reply);

        if report.is_processed() {
            for reactor in &self.reactors {
                reactor.react(&report, &submitter);
            }
        }
    }

    fn emit(&self, report: &AccessReport, reply: oneshot::Sender<AccessReport>) {
        for hook in &self.hooks {
            hook(report);
        }
        self.lock_reports().push(report.clone());
        // The caller may have dropped its receipt; the report still went out
        // through the hooks and the log.
        let _ = reply.send(report.clone());
    }

    fn committed(&self) -> Arc<Storage> {
        match self.committed.read() {
            Ok(storage) => storage.clone(),
            Err(_) => self.poisoned(),
        }
    }

    fn publish(&self, storage: Arc<Storage>) {
        match self.committed.write() {
            Ok(mut committed) => *committed = storage,
            Err(_) => self.poisoned(),
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Queued>> {
        match self.queue.lock() {
            Ok(queue) => queue,
            Err(poisoned) => {
                drop(poisoned);
                self.poisoned()
            }
        }
    }

    fn lock_reports(&self) -> MutexGuard<'_, ReportLog> {
        self.reports.lock().unwrap_or_else(|_| self.poisoned())
    }

    fn poisoned(&self) -> ! {
        self.halt(EngineFault::Poisoned {
            dispatcher: self.config.name.clone(),
        })
    }

    /// Abandon everything still queued, then raise `fault`. Dropping the
    /// queued reply senders settles their receipts as `Unsettled`.
    fn halt(&self, fault: EngineFault) -> ! {
        let abandoned = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *queue)
        };
        if !abandoned.is_empty() {
            warn!(
                dispatcher = self.config.name.as_str(),
                abandoned = abandoned.len(),
                "Queued actions abandoned"
            );
        }
        drop(abandoned);
        fault.raise()
    }
}

/// True only for the enqueue that pushes the backlog past `threshold`.
fn backlog_crossed(depth: usize, threshold: usize) -> bool {
    threshold.checked_add(1) == Some(depth)
}
