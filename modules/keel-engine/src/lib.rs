//! Transaction dispatcher.
//!
//! Provides a serialized transaction loop: enqueue → copy storage → run body →
//! commit or discard → report → react. Every attempt produces exactly one
//! `AccessReport`; only committed attempts reach the reactors.
//!
//! Consumers describe changes as `Action`s (an id plus a body that works on a
//! `Transaction`) and observe them by implementing `Reactor` or by reading the
//! reports handed back through `Receipt`s and report hooks.

pub mod action;
pub mod config;
pub mod dispatcher;
pub mod fault;
pub mod report;
pub mod traits;
pub mod transaction;

pub use action::{Action, ActionError};
pub use config::{load_config, EngineConfig};
pub use dispatcher::{Dispatcher, DispatcherBuilder, Receipt, SubmitError, Submitter};
pub use fault::EngineFault;
pub use report::{AccessReport, Origin, Outcome, ReportLog, Ticket};
pub use traits::Reactor;
pub use transaction::Transaction;
