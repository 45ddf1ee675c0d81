//! Core traits for the dispatcher.

use std::sync::Arc;

use crate::dispatcher::Submitter;
use crate::report::AccessReport;

/// Reacts to committed transactions. Never sees rejected ones.
///
/// Called synchronously on the dispatcher's executor after the report has been
/// emitted and before the next queued action starts. The submitter records the
/// committed ticket as the cause of anything submitted through it; submissions
/// run after the current pass settles.
pub trait Reactor: Send + Sync {
    fn react(&self, report: &AccessReport, submitter: &Submitter);
}

/// Lets callers keep a handle on a reactor (for registration or assertions)
/// while the dispatcher holds another.
impl<R: Reactor + ?Sized> Reactor for Arc<R> {
    fn react(&self, report: &AccessReport, submitter: &Submitter) {
        (**self).react(report, submitter)
    }
}
