//! `When → given/guard → then` pipelines over mutation records.
//!
//! ```ignore
//! let reaction = When::compartment::<Auth>()
//!     .kind(MutationKind::Transition)
//!     .to_shape(AuthState::SIGNED_IN)
//!     .given(|trigger| trigger.latest::<Auth>().cloned())
//!     .guard(|auth, _| auth.is_verified())
//!     .then(|auth, submitter| {
//!         let _ = submitter.submit(load_profile(auth));
//!     });
//! bindings.bind(&observer, reaction);
//! ```

use std::fmt;

use keel_engine::{AccessReport, Submitter, Ticket};
use keel_storage::{Compartment, CompartmentKey, Discriminant, MutationKind, MutationRecord, Storage};
use serde::Serialize;

/// Kind of a pipeline step, exposed for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Extraction,
    Guard,
    Reaction,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Extraction => f.write_str("extraction"),
            StepKind::Guard => f.write_str("guard"),
            StepKind::Reaction => f.write_str("reaction"),
        }
    }
}

/// Where a pipeline run stopped without reacting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abort {
    pub step: usize,
    pub kind: StepKind,
}

// ---------------------------------------------------------------------------
// Record selection
// ---------------------------------------------------------------------------

/// Criteria a mutation record must meet. Unset criteria accept anything;
/// several kinds accept any one of them.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    key: Option<CompartmentKey>,
    kinds: Vec<MutationKind>,
    from: Option<Discriminant>,
    to: Option<Discriminant>,
}

impl RecordFilter {
    pub fn matches(&self, record: &MutationRecord) -> bool {
        if self.key.is_some_and(|key| key != record.key) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&record.kind) {
            return false;
        }
        if self.from.is_some() && self.from != record.prior_discriminant() {
            return false;
        }
        if self.to.is_some() && self.to != record.next_discriminant() {
            return false;
        }
        true
    }
}

/// The records of one committed transaction that matched a pipeline's
/// filter, in application order. Never empty.
#[derive(Debug, Clone)]
pub struct Trigger {
    ticket: Ticket,
    records: Vec<MutationRecord>,
}

impl Trigger {
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    pub fn records(&self) -> &[MutationRecord] {
        &self.records
    }

    pub fn first(&self) -> &MutationRecord {
        &self.records[0]
    }

    pub fn last(&self) -> &MutationRecord {
        &self.records[self.records.len() - 1]
    }

    /// Newest state of `C` among the matched records, if any left it present.
    pub fn latest<C: Compartment>(&self) -> Option<&C::State> {
        self.records.iter().rev().find_map(|record| record.next_as::<C>())
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Entry point of a pipeline: which records to react to.
#[derive(Debug, Clone, Default)]
pub struct When {
    filter: RecordFilter,
}

impl When {
    /// Every record of every committed transaction.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn compartment<C: Compartment>() -> Self {
        Self::key(C::KEY)
    }

    pub fn key(key: CompartmentKey) -> Self {
        Self {
            filter: RecordFilter {
                key: Some(key),
                ..RecordFilter::default()
            },
        }
    }

    pub fn kind(mut self, kind: MutationKind) -> Self {
        if !self.filter.kinds.contains(&kind) {
            self.filter.kinds.push(kind);
        }
        self
    }

    /// Prior value must have had this shape.
    pub fn from_shape(mut self, discriminant: Discriminant) -> Self {
        self.filter.from = Some(discriminant);
        self
    }

    /// Resulting value must have this shape.
    pub fn to_shape(mut self, discriminant: Discriminant) -> Self {
        self.filter.to = Some(discriminant);
        self
    }

    pub fn filter(&self) -> &RecordFilter {
        &self.filter
    }

    pub fn given<O, F>(self, step: F) -> Pipeline<O>
    where
        O: 'static,
        F: Fn(Trigger) -> Option<O> + Send + Sync + 'static,
    {
        self.start().given(step)
    }

    pub fn given_in<O, F>(self, step: F) -> Pipeline<O>
    where
        O: 'static,
        F: Fn(Trigger, &Storage) -> Option<O> + Send + Sync + 'static,
    {
        self.start().given_in(step)
    }

    pub fn guard<F>(self, predicate: F) -> Pipeline<Trigger>
    where
        F: Fn(&Trigger, &Storage) -> bool + Send + Sync + 'static,
    {
        self.start().guard(predicate)
    }

    pub fn then<F>(self, reaction: F) -> Reaction
    where
        F: Fn(Trigger, &Submitter) + Send + Sync + 'static,
    {
        self.start().then(reaction)
    }

    fn start(self) -> Pipeline<Trigger> {
        Pipeline {
            filter: self.filter,
            steps: Vec::new(),
            run: Box::new(|trigger, _| Ok(trigger)),
        }
    }
}

type Run<I> = Box<dyn Fn(Trigger, &Storage) -> Result<I, Abort> + Send + Sync>;

/// A pipeline under construction whose current intermediate value is `I`.
pub struct Pipeline<I> {
    filter: RecordFilter,
    steps: Vec<StepKind>,
    run: Run<I>,
}

impl<I: 'static> Pipeline<I> {
    /// Transform the intermediate value. `None` stops the run silently.
    pub fn given<O, F>(self, step: F) -> Pipeline<O>
    where
        O: 'static,
        F: Fn(I) -> Option<O> + Send + Sync + 'static,
    {
        self.given_in(move |value, _| step(value))
    }

    /// Like `given`, with read access to the committed storage.
    pub fn given_in<O, F>(self, step: F) -> Pipeline<O>
    where
        O: 'static,
        F: Fn(I, &Storage) -> Option<O> + Send + Sync + 'static,
    {
        let abort = Abort {
            step: self.steps.len(),
            kind: StepKind::Extraction,
        };
        let previous = self.run;
        let mut steps = self.steps;
        steps.push(StepKind::Extraction);

        Pipeline {
            filter: self.filter,
            steps,
            run: Box::new(move |trigger, storage| {
                let value = previous(trigger, storage)?;
                step(value, storage).ok_or(abort)
            }),
        }
    }

    /// Stop the run unless the predicate holds.
    pub fn guard<F>(self, predicate: F) -> Pipeline<I>
    where
        F: Fn(&I, &Storage) -> bool + Send + Sync + 'static,
    {
        let abort = Abort {
            step: self.steps.len(),
            kind: StepKind::Guard,
        };
        let previous = self.run;
        let mut steps = self.steps;
        steps.push(StepKind::Guard);

        Pipeline {
            filter: self.filter,
            steps,
            run: Box::new(move |trigger, storage| {
                let value = previous(trigger, storage)?;
                if predicate(&value, storage) {
                    Ok(value)
                } else {
                    Err(abort)
                }
            }),
        }
    }

    /// Finish the pipeline. The reaction gets the final value and a
    /// submitter for follow-up actions; it never touches storage directly.
    pub fn then<F>(self, reaction: F) -> Reaction
    where
        F: Fn(I, &Submitter) + Send + Sync + 'static,
    {
        let run = self.run;
        let mut steps = self.steps;
        steps.push(StepKind::Reaction);

        Reaction {
            filter: self.filter,
            steps,
            fire: Box::new(move |trigger, storage, submitter| {
                let value = run(trigger, storage)?;
                reaction(value, submitter);
                Ok(())
            }),
        }
    }

    pub fn steps(&self) -> &[StepKind] {
        &self.steps
    }
}

impl<I> fmt::Debug for Pipeline<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("filter", &self.filter)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

type Fire = Box<dyn Fn(Trigger, &Storage, &Submitter) -> Result<(), Abort> + Send + Sync>;

/// A complete pipeline, ready to be bound to an observer.
pub struct Reaction {
    filter: RecordFilter,
    steps: Vec<StepKind>,
    fire: Fire,
}

pub(crate) enum Evaluation {
    NoMatch,
    Aborted(Abort),
    Fired,
}

impl Reaction {
    pub fn steps(&self) -> &[StepKind] {
        &self.steps
    }

    pub fn filter(&self) -> &RecordFilter {
        &self.filter
    }

    /// Runs at most once per report, with every matching record.
    pub(crate) fn evaluate(&self, report: &AccessReport, submitter: &Submitter) -> Evaluation {
        let records: Vec<MutationRecord> = report
            .records()
            .iter()
            .filter(|record| self.filter.matches(record))
            .cloned()
            .collect();
        if records.is_empty() {
            return Evaluation::NoMatch;
        }

        let trigger = Trigger {
            ticket: report.ticket(),
            records,
        };
        match (self.fire)(trigger, &report.storage, submitter) {
            Ok(()) => Evaluation::Fired,
            Err(abort) => Evaluation::Aborted(abort),
        }
    }
}

impl fmt::Debug for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reaction")
            .field("filter", &self.filter)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}
