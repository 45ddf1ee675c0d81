//! Typed, multi-compartment state storage.
//!
//! Every compartment holds at most one state variant at a time. Each write or
//! removal is classified into a `MutationKind`, optionally checked against a
//! declared expectation, and appended to an ordered history.
//!
//! Storage itself is a plain value: it knows nothing about transactions or
//! observers. The engine crate owns one and hands out working copies.

pub mod error;
pub mod history;
pub mod store;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use history::History;
pub use store::Storage;
pub use types::{
    Compartment, CompartmentKey, Discriminant, ExpectedKind, MutationKind, MutationRecord, State,
    StateSnapshot,
};
