//! Core types for the storage layer.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable, process-wide identity of a compartment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CompartmentKey(&'static str);

impl CompartmentKey {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for CompartmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Shape identity of a state variant. Two values of the same compartment
/// with equal discriminants have the same concrete shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Discriminant(&'static str);

impl Discriminant {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Discriminant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// The data a compartment holds. Usually an enum whose variants are the
/// compartment's possible shapes.
pub trait State: fmt::Debug + Clone + Send + Sync + 'static {
    /// The discriminant of the variant currently held by `self`.
    fn discriminant(&self) -> Discriminant;
}

/// A named region of state. Implemented on a marker type:
///
/// ```ignore
/// struct Counter;
/// impl Compartment for Counter {
///     const KEY: CompartmentKey = CompartmentKey::new("counter");
///     type State = CounterState;
/// }
/// ```
pub trait Compartment: 'static {
    const KEY: CompartmentKey;
    type State: State;
}

// ---------------------------------------------------------------------------
// Stored values
// ---------------------------------------------------------------------------

trait ErasedState: fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T: State> ErasedState for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A state variant frozen together with its discriminant.
///
/// The discriminant is computed from the value at capture time and can never
/// be set independently, so the two cannot disagree.
#[derive(Clone)]
pub struct StateSnapshot {
    discriminant: Discriminant,
    value: Arc<dyn ErasedState>,
}

impl StateSnapshot {
    pub fn capture<S: State>(state: S) -> Self {
        Self {
            discriminant: state.discriminant(),
            value: Arc::new(state),
        }
    }

    pub fn discriminant(&self) -> Discriminant {
        self.discriminant
    }

    /// Typed view of the value. `None` when `S` is not the stored type.
    pub fn downcast<S: State>(&self) -> Option<&S> {
        self.value.as_any().downcast_ref::<S>()
    }
}

impl fmt::Debug for StateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSnapshot")
            .field("discriminant", &self.discriminant)
            .field("value", &self.value)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Mutation kinds
// ---------------------------------------------------------------------------

/// Classification of a single storage change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// absent → present
    Initialization,
    /// present → present, same discriminant
    Actualization,
    /// present → present, different discriminant
    Transition,
    /// present → absent
    Deinitialization,
    /// absent → absent, removal attempted anyway
    NothingToRemove,
}

impl MutationKind {
    /// Kind of a write of a value shaped `next` over whatever is held now.
    pub fn of_store(prior: Option<Discriminant>, next: Discriminant) -> Self {
        match prior {
            None => MutationKind::Initialization,
            Some(prior) if prior == next => MutationKind::Actualization,
            Some(_) => MutationKind::Transition,
        }
    }

    /// Kind of a removal given whatever is held now.
    pub fn of_remove(prior: Option<Discriminant>) -> Self {
        match prior {
            Some(_) => MutationKind::Deinitialization,
            None => MutationKind::NothingToRemove,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Initialization => "initialization",
            MutationKind::Actualization => "actualization",
            MutationKind::Transition => "transition",
            MutationKind::Deinitialization => "deinitialization",
            MutationKind::NothingToRemove => "nothing_to_remove",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a caller declares a write should turn out to be.
///
/// `Auto` accepts whatever the computed kind is. `Transition` and
/// `Deinitialization` may additionally pin the discriminant being left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpectedKind {
    #[default]
    Auto,
    Initialization,
    Actualization,
    Transition { from: Option<Discriminant> },
    Deinitialization { from: Option<Discriminant> },
    NothingToRemove,
}

impl ExpectedKind {
    pub fn transition_from(from: Discriminant) -> Self {
        ExpectedKind::Transition { from: Some(from) }
    }

    pub fn deinitialization_from(from: Discriminant) -> Self {
        ExpectedKind::Deinitialization { from: Some(from) }
    }

    /// Whether a computed `actual` kind leaving `prior` satisfies this expectation.
    pub fn admits(&self, actual: MutationKind, prior: Option<Discriminant>) -> bool {
        let from_matches = |from: &Option<Discriminant>| from.is_none() || *from == prior;
        match self {
            ExpectedKind::Auto => true,
            ExpectedKind::Initialization => actual == MutationKind::Initialization,
            ExpectedKind::Actualization => actual == MutationKind::Actualization,
            ExpectedKind::Transition { from } => {
                actual == MutationKind::Transition && from_matches(from)
            }
            ExpectedKind::Deinitialization { from } => {
                actual == MutationKind::Deinitialization && from_matches(from)
            }
            ExpectedKind::NothingToRemove => actual == MutationKind::NothingToRemove,
        }
    }
}

impl fmt::Display for ExpectedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedKind::Auto => f.write_str("any"),
            ExpectedKind::Initialization => f.write_str("initialization"),
            ExpectedKind::Actualization => f.write_str("actualization"),
            ExpectedKind::Transition { from: None } => f.write_str("transition"),
            ExpectedKind::Transition { from: Some(d) } => write!(f, "transition from {d}"),
            ExpectedKind::Deinitialization { from: None } => f.write_str("deinitialization"),
            ExpectedKind::Deinitialization { from: Some(d) } => {
                write!(f, "deinitialization from {d}")
            }
            ExpectedKind::NothingToRemove => f.write_str("nothing_to_remove"),
        }
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// One applied change, as kept in the storage history.
#[derive(Debug, Clone)]
pub struct MutationRecord {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub key: CompartmentKey,
    pub kind: MutationKind,
    pub prior: Option<StateSnapshot>,
    pub next: Option<StateSnapshot>,
}

impl MutationRecord {
    pub fn prior_discriminant(&self) -> Option<Discriminant> {
        self.prior.as_ref().map(StateSnapshot::discriminant)
    }

    pub fn next_discriminant(&self) -> Option<Discriminant> {
        self.next.as_ref().map(StateSnapshot::discriminant)
    }

    pub fn concerns<C: Compartment>(&self) -> bool {
        self.key == C::KEY
    }

    pub fn prior_as<C: Compartment>(&self) -> Option<&C::State> {
        if !self.concerns::<C>() {
            return None;
        }
        self.prior.as_ref()?.downcast::<C::State>()
    }

    pub fn next_as<C: Compartment>(&self) -> Option<&C::State> {
        if !self.concerns::<C>() {
            return None;
        }
        self.next.as_ref()?.downcast::<C::State>()
    }

    /// Value-free JSON view for logs and admin tooling.
    pub fn summary(&self) -> serde_json::Value {
        json!({
            "seq": self.seq,
            "ts": self.ts,
            "key": self.key,
            "kind": self.kind,
            "from": self.prior_discriminant(),
            "to": self.next_discriminant(),
        })
    }
}
