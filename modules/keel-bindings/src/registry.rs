use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use keel_engine::{AccessReport, Reactor, Submitter};
use keel_storage::{Compartment, Storage};
use tracing::debug;

use crate::observer::{Observer, ObserverRef};
use crate::pipeline::{Evaluation, Reaction};
use crate::subscription::Subscription;

/// Handle for cancelling a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(u64);

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "binding-{}", self.0)
    }
}

enum Body {
    Subscription(Subscription),
    Pipeline(Reaction),
}

struct Binding {
    id: BindingId,
    observer: ObserverRef,
    body: Body,
}

/// Registry of subscriptions and pipelines, evaluated as a `Reactor`.
///
/// Registrations and cancellations are staged and only applied by the prune
/// that opens each evaluation pass, so a callback may bind or unbind freely
/// without affecting the pass it runs in.
#[derive(Default)]
pub struct Bindings {
    next_id: AtomicU64,
    live: Mutex<Vec<Arc<Binding>>>,
    incoming: Mutex<Vec<Arc<Binding>>>,
    cancelled: Mutex<HashSet<BindingId>>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `update` with `project(storage)` after every commit where the
    /// projection yields a value.
    pub fn subscribe<T, P, U>(&self, observer: &Observer, project: P, update: U) -> BindingId
    where
        P: Fn(&Storage) -> Option<T> + Send + Sync + 'static,
        U: Fn(T) + Send + Sync + 'static,
    {
        self.register(observer, Body::Subscription(Subscription::new(project, update)))
    }

    /// Subscription to the current state of one compartment.
    pub fn watch<C, U>(&self, observer: &Observer, update: U) -> BindingId
    where
        C: Compartment,
        U: Fn(C::State) + Send + Sync + 'static,
    {
        self.subscribe(observer, |storage| storage.get::<C>().cloned(), update)
    }

    pub fn bind(&self, observer: &Observer, reaction: Reaction) -> BindingId {
        self.register(observer, Body::Pipeline(reaction))
    }

    /// Takes effect before the next evaluation pass.
    pub fn unbind(&self, id: BindingId) {
        lock(&self.cancelled).insert(id);
    }

    /// Bindings that would take part in the next pass.
    pub fn len(&self) -> usize {
        self.prune();
        lock(&self.live).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register(&self, observer: &Observer, body: Body) -> BindingId {
        let id = BindingId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        debug!(binding = %id, observer = observer.name(), "Binding registered");
        lock(&self.incoming).push(Arc::new(Binding {
            id,
            observer: observer.downgrade(),
            body,
        }));
        id
    }

    /// Absorb staged registrations, then drop cancelled bindings and those
    /// whose observer is gone.
    fn prune(&self) -> MutexGuard<'_, Vec<Arc<Binding>>> {
        let incoming = std::mem::take(&mut *lock(&self.incoming));
        let cancelled = std::mem::take(&mut *lock(&self.cancelled));

        let mut live = lock(&self.live);
        live.extend(incoming);
        live.retain(|binding| {
            if cancelled.contains(&binding.id) {
                debug!(binding = %binding.id, observer = binding.observer.name(), "Binding cancelled");
                false
            } else if !binding.observer.is_alive() {
                debug!(binding = %binding.id, observer = binding.observer.name(), "Observer gone, binding pruned");
                false
            } else {
                true
            }
        });
        live
    }
}

impl Reactor for Bindings {
    fn react(&self, report: &AccessReport, submitter: &Submitter) {
        // Callbacks run without any registry lock held.
        let pass: Vec<Arc<Binding>> = self.prune().clone();

        for binding in pass {
            if !binding.observer.is_alive() {
                continue;
            }
            match &binding.body {
                Body::Subscription(subscription) => {
                    if subscription.evaluate(&report.storage) {
                        debug!(binding = %binding.id, ticket = %report.ticket(), "Subscription updated");
                    }
                }
                Body::Pipeline(reaction) => match reaction.evaluate(report, submitter) {
                    Evaluation::NoMatch => {}
                    Evaluation::Aborted(abort) => {
                        debug!(
                            binding = %binding.id,
                            ticket = %report.ticket(),
                            step = abort.step,
                            kind = %abort.kind,
                            "Pipeline stopped"
                        );
                    }
                    Evaluation::Fired => {
                        debug!(binding = %binding.id, ticket = %report.ticket(), "Pipeline fired");
                    }
                },
            }
        }
    }
}

impl fmt::Debug for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bindings")
            .field("live", &lock(&self.live).len())
            .field("incoming", &lock(&self.incoming).len())
            .finish_non_exhaustive()
    }
}

// Callbacks never run under these locks, so a poisoned guard still holds a
// consistent list.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
