//! The authoritative compartment map plus its mutation history.
//!
//! Kinds are computed purely from (held, incoming) discriminants. A declared
//! expectation that disagrees with the computed kind rejects the operation
//! before anything is written, so a failed call never leaves a trace in either
//! the map or the history.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::history::History;
use crate::types::{
    Compartment, CompartmentKey, Discriminant, ExpectedKind, MutationKind, MutationRecord,
    StateSnapshot,
};

/// Compartment map with an append-only history.
///
/// Cloning is cheap: state values and sealed history segments are shared, and
/// only the unsealed history tail is copied. Writes to the clone are never
/// visible in the original.
#[derive(Debug, Clone)]
pub struct Storage {
    entries: BTreeMap<CompartmentKey, StateSnapshot>,
    history: History,
    next_seq: u64,
    reset_marker: Uuid,
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            history: History::new(),
            next_seq: 1,
            reset_marker: Uuid::new_v4(),
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Borrow the state of `C`, if present and of the declared type.
    pub fn get<C: Compartment>(&self) -> Option<&C::State> {
        self.entries.get(&C::KEY)?.downcast::<C::State>()
    }

    /// Current state of `C`, whatever its shape.
    pub fn fetch<C: Compartment>(&self) -> StorageResult<C::State> {
        let (_, state) = self.typed_entry::<C>()?;
        Ok(state.clone())
    }

    /// Current state of `C`, which must currently have shape `expected`.
    pub fn fetch_as<C: Compartment>(&self, expected: Discriminant) -> StorageResult<C::State> {
        let (snapshot, state) = self.typed_entry::<C>()?;
        if snapshot.discriminant() != expected {
            return Err(StorageError::ShapeMismatch {
                key: C::KEY,
                expected,
                actual: snapshot.discriminant(),
            });
        }
        Ok(state.clone())
    }

    pub fn contains<C: Compartment>(&self) -> bool {
        self.entries.contains_key(&C::KEY)
    }

    pub fn discriminant_of(&self, key: CompartmentKey) -> Option<Discriminant> {
        self.entries.get(&key).map(StateSnapshot::discriminant)
    }

    /// Keys of every populated compartment, in key order.
    pub fn keys(&self) -> impl Iterator<Item = CompartmentKey> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn typed_entry<C: Compartment>(&self) -> StorageResult<(&StateSnapshot, &C::State)> {
        let snapshot = self
            .entries
            .get(&C::KEY)
            .ok_or(StorageError::KeyNotFound { key: C::KEY })?;
        let state = snapshot
            .downcast::<C::State>()
            .ok_or(StorageError::KeyCollision { key: C::KEY })?;
        Ok((snapshot, state))
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Write `state` into `C`, accepting whatever kind the write turns out to be.
    pub fn store<C: Compartment>(&mut self, state: C::State) -> StorageResult<MutationRecord> {
        self.store_expecting::<C>(state, ExpectedKind::Auto)
    }

    /// Write `state` into `C` only if the computed kind satisfies `expected`.
    pub fn store_expecting<C: Compartment>(
        &mut self,
        state: C::State,
        expected: ExpectedKind,
    ) -> StorageResult<MutationRecord> {
        let prior = match self.entries.get(&C::KEY) {
            Some(held) if held.downcast::<C::State>().is_none() => {
                return Err(StorageError::KeyCollision { key: C::KEY });
            }
            held => held.map(StateSnapshot::discriminant),
        };

        let next = StateSnapshot::capture(state);
        let actual = MutationKind::of_store(prior, next.discriminant());
        if !expected.admits(actual, prior) {
            return Err(StorageError::SemanticMutation {
                key: C::KEY,
                expected,
                actual,
                from: prior,
            });
        }

        let replaced = self.entries.insert(C::KEY, next.clone());
        Ok(self.append(C::KEY, actual, replaced, Some(next)))
    }

    /// Remove the state of `C`.
    ///
    /// With `expected_prior` set, the held shape must match it. With `strict`
    /// unset, removing an absent compartment succeeds as `NothingToRemove`.
    pub fn remove<C: Compartment>(
        &mut self,
        expected_prior: Option<Discriminant>,
        strict: bool,
    ) -> StorageResult<MutationRecord> {
        self.remove_key(C::KEY, expected_prior, strict)
    }

    /// Untyped form of [`Storage::remove`].
    pub fn remove_key(
        &mut self,
        key: CompartmentKey,
        expected_prior: Option<Discriminant>,
        strict: bool,
    ) -> StorageResult<MutationRecord> {
        let Some(held) = self.entries.get(&key) else {
            if strict {
                return Err(StorageError::KeyNotFound { key });
            }
            return Ok(self.append(key, MutationKind::NothingToRemove, None, None));
        };

        if let Some(expected) = expected_prior {
            if held.discriminant() != expected {
                return Err(StorageError::ShapeMismatch {
                    key,
                    expected,
                    actual: held.discriminant(),
                });
            }
        }

        let removed = self.entries.remove(&key);
        Ok(self.append(key, MutationKind::Deinitialization, removed, None))
    }

    /// Non-strict removal of every populated compartment, in key order.
    pub fn remove_all(&mut self) -> Vec<MutationRecord> {
        let keys: Vec<CompartmentKey> = self.entries.keys().copied().collect();
        keys.into_iter()
            .filter_map(|key| self.remove_key(key, None, false).ok())
            .collect()
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// Every record since the last reset, in application order.
    pub fn history(&self) -> &History {
        &self.history
    }

    /// Share every record appended so far with future clones. Called on each
    /// commit so working copies never duplicate committed history.
    pub fn seal_history(&mut self) {
        self.history.seal();
    }

    /// Token that changes on every [`Storage::reset_history`]. Readers compare
    /// it with the value they saw last to detect truncation.
    pub fn reset_marker(&self) -> Uuid {
        self.reset_marker
    }

    /// Sequence position the next record will get. Never rewinds.
    pub fn next_sequence(&self) -> u64 {
        self.next_seq
    }

    /// Take the whole history and start a fresh one under a new marker.
    pub fn reset_history(&mut self) -> Vec<MutationRecord> {
        self.reset_marker = Uuid::new_v4();
        let drained = self.history.take();
        debug!(
            drained = drained.len(),
            marker = %self.reset_marker,
            "History reset"
        );
        drained
    }

    fn append(
        &mut self,
        key: CompartmentKey,
        kind: MutationKind,
        prior: Option<StateSnapshot>,
        next: Option<StateSnapshot>,
    ) -> MutationRecord {
        let record = MutationRecord {
            seq: self.next_seq,
            ts: Utc::now(),
            key,
            kind,
            prior,
            next,
        };
        self.next_seq += 1;

        debug!(
            seq = record.seq,
            key = key.as_str(),
            kind = kind.as_str(),
            from = ?record.prior_discriminant(),
            to = ?record.next_discriminant(),
            "Mutation applied"
        );

        self.history.push(record.clone());
        record
    }
}
