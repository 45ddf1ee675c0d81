//! Access reports, one per transaction attempt.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_storage::{MutationRecord, Storage};
use serde::Serialize;
use serde_json::json;

use crate::action::ActionError;

/// Position of an action in its dispatcher's acceptance order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Ticket(u64);

impl Ticket {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where an attempt came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Origin {
    pub dispatcher: String,
    pub action: String,
    pub ticket: Ticket,
    /// Ticket of the transaction whose body or reaction submitted this one.
    pub caused_by: Option<Ticket>,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Processed(Vec<MutationRecord>),
    Rejected(ActionError),
}

/// The per-attempt record of what happened.
#[derive(Debug, Clone)]
pub struct AccessReport {
    pub ts: DateTime<Utc>,
    pub origin: Origin,
    pub outcome: Outcome,
    /// Committed storage after the attempt. Unchanged from before when rejected.
    pub storage: Arc<Storage>,
}

impl AccessReport {
    pub(crate) fn processed(
        origin: Origin,
        records: Vec<MutationRecord>,
        storage: Arc<Storage>,
    ) -> Self {
        Self {
            ts: Utc::now(),
            origin,
            outcome: Outcome::Processed(records),
            storage,
        }
    }

    pub(crate) fn rejected(origin: Origin, reason: ActionError, storage: Arc<Storage>) -> Self {
        Self {
            ts: Utc::now(),
            origin,
            outcome: Outcome::Rejected(reason),
            storage,
        }
    }

    pub fn ticket(&self) -> Ticket {
        self.origin.ticket
    }

    pub fn is_processed(&self) -> bool {
        matches!(self.outcome, Outcome::Processed(_))
    }

    /// Records of a processed attempt; empty when rejected.
    pub fn records(&self) -> &[MutationRecord] {
        match &self.outcome {
            Outcome::Processed(records) => records,
            Outcome::Rejected(_) => &[],
        }
    }

    pub fn rejection(&self) -> Option<&ActionError> {
        match &self.outcome {
            Outcome::Processed(_) => None,
            Outcome::Rejected(reason) => Some(reason),
        }
    }

    /// JSON view for logs and admin tooling. State values are left out.
    pub fn summary(&self) -> serde_json::Value {
        let outcome = match &self.outcome {
            Outcome::Processed(records) => json!({
                "status": "processed",
                "mutations": records.iter().map(MutationRecord::summary).collect::<Vec<_>>(),
            }),
            Outcome::Rejected(reason) => json!({
                "status": "rejected",
                "code": reason.code(),
                "reason": reason.to_string(),
            }),
        };
        json!({
            "ts": self.ts,
            "origin": self.origin,
            "outcome": outcome,
            "compartments": self.storage.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// ReportLog
// ---------------------------------------------------------------------------

/// Bounded log of the most recent reports. Capacity 0 keeps nothing.
#[derive(Debug)]
pub struct ReportLog {
    capacity: usize,
    reports: VecDeque<AccessReport>,
}

impl ReportLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            reports: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn push(&mut self, report: AccessReport) {
        if self.capacity == 0 {
            return;
        }
        if self.reports.len() == self.capacity {
            self.reports.pop_front();
        }
        self.reports.push_back(report);
    }

    /// Oldest first.
    pub fn to_vec(&self) -> Vec<AccessReport> {
        self.reports.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }
}
