//! Reactions to committed transactions.
//!
//! Two shapes of binding, both owned by an `Observer` through a weak handle:
//!
//! - **subscriptions**: project the committed storage, call back with the
//!   projected value when there is one;
//! - **pipelines**: `When` selects mutation records, `given`/`guard` steps
//!   refine them, `then` reacts and may submit follow-up actions.
//!
//! `Bindings` implements `keel_engine::Reactor`; register it on a dispatcher
//! and every live binding is evaluated once per committed transaction.

pub mod observer;
pub mod pipeline;
pub mod registry;
mod subscription;

pub use observer::Observer;
pub use pipeline::{Abort, Pipeline, Reaction, RecordFilter, StepKind, Trigger, When};
pub use registry::{BindingId, Bindings};
