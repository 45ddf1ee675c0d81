//! The handle an action body works through.

use keel_storage::{
    Compartment, CompartmentKey, Discriminant, ExpectedKind, MutationRecord, Storage,
    StorageResult,
};

use crate::action::{Action, ActionError};
use crate::dispatcher::{Receipt, SubmitError, Submitter};
use crate::report::Ticket;

/// A running transaction: exclusive access to a private working copy of the
/// storage for the duration of one action body.
///
/// Records produced here become the transaction's result if the body returns
/// `Ok`. The copy is thrown away otherwise.
pub struct Transaction<'a> {
    ticket: Ticket,
    storage: &'a mut Storage,
    records: Vec<MutationRecord>,
    submitter: Submitter,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(ticket: Ticket, storage: &'a mut Storage, submitter: Submitter) -> Self {
        Self {
            ticket,
            storage,
            records: Vec::new(),
            submitter,
        }
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Read view of the working copy, including this transaction's own writes.
    pub fn storage(&self) -> &Storage {
        self.storage
    }

    /// Mutations applied so far by this transaction.
    pub fn records(&self) -> &[MutationRecord] {
        &self.records
    }

    pub fn get<C: Compartment>(&self) -> Option<&C::State> {
        self.storage.get::<C>()
    }

    pub fn fetch<C: Compartment>(&self) -> StorageResult<C::State> {
        self.storage.fetch::<C>()
    }

    pub fn fetch_as<C: Compartment>(&self, expected: Discriminant) -> StorageResult<C::State> {
        self.storage.fetch_as::<C>(expected)
    }

    pub fn contains<C: Compartment>(&self) -> bool {
        self.storage.contains::<C>()
    }

    pub fn store<C: Compartment>(&mut self, state: C::State) -> StorageResult<MutationRecord> {
        let record = self.storage.store::<C>(state)?;
        Ok(self.keep(record))
    }

    pub fn store_expecting<C: Compartment>(
        &mut self,
        state: C::State,
        expected: ExpectedKind,
    ) -> StorageResult<MutationRecord> {
        let record = self.storage.store_expecting::<C>(state, expected)?;
        Ok(self.keep(record))
    }

    pub fn remove<C: Compartment>(
        &mut self,
        expected_prior: Option<Discriminant>,
        strict: bool,
    ) -> StorageResult<MutationRecord> {
        let record = self.storage.remove::<C>(expected_prior, strict)?;
        Ok(self.keep(record))
    }

    pub fn remove_key(
        &mut self,
        key: CompartmentKey,
        expected_prior: Option<Discriminant>,
        strict: bool,
    ) -> StorageResult<MutationRecord> {
        let record = self.storage.remove_key(key, expected_prior, strict)?;
        Ok(self.keep(record))
    }

    pub fn remove_all(&mut self) -> Vec<MutationRecord> {
        let records = self.storage.remove_all();
        self.records.extend(records.iter().cloned());
        records
    }

    /// Snapshot-and-clear the history. Rolled back with everything else if
    /// the body fails. Records already produced by this transaction stay part
    /// of its result.
    pub fn reset_history(&mut self) -> Vec<MutationRecord> {
        self.storage.reset_history()
    }

    /// Fail the transaction with `reason` unless `holds`.
    pub fn precondition(&self, holds: bool, reason: impl Into<String>) -> Result<(), ActionError> {
        if holds {
            Ok(())
        } else {
            Err(ActionError::precondition(reason))
        }
    }

    /// Queue a follow-up. It runs after this transaction settles, whatever
    /// its outcome, and after everything already queued.
    pub fn submit(&self, action: Action) -> Result<Receipt, SubmitError> {
        self.submitter.submit(action)
    }

    /// Submission capability for asynchronous continuations started by the body.
    pub fn submitter(&self) -> Submitter {
        self.submitter.clone()
    }

    pub(crate) fn into_records(self) -> Vec<MutationRecord> {
        self.records
    }

    fn keep(&mut self, record: MutationRecord) -> MutationRecord {
        self.records.push(record.clone());
        record
    }
}
