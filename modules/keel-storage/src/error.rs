use thiserror::Error;

use crate::types::{CompartmentKey, Discriminant, ExpectedKind, MutationKind};

/// Failures of a single storage operation. None of them leave a partial write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("compartment {key} holds no state")]
    KeyNotFound { key: CompartmentKey },

    #[error("compartment {key} holds {actual}, expected {expected}")]
    ShapeMismatch {
        key: CompartmentKey,
        expected: Discriminant,
        actual: Discriminant,
    },

    #[error("compartment {key}: declared {expected} but the write is {actual}")]
    SemanticMutation {
        key: CompartmentKey,
        expected: ExpectedKind,
        actual: MutationKind,
        /// Discriminant held before the rejected write, if any.
        from: Option<Discriminant>,
    },

    /// Two compartment types were declared with the same key.
    #[error("compartment {key} holds a value of a different compartment type")]
    KeyCollision { key: CompartmentKey },
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
