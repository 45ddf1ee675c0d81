use std::fmt;

use keel_storage::StorageError;
use thiserror::Error;

use crate::transaction::Transaction;

type ActionBody = Box<dyn FnOnce(&mut Transaction<'_>) -> Result<(), ActionError> + Send>;

/// A unit of work: a stable identity plus a body run against a working copy.
pub struct Action {
    id: String,
    body: ActionBody,
}

impl Action {
    pub fn new<F>(id: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<(), ActionError> + Send + 'static,
    {
        Self {
            id: id.into(),
            body: Box::new(body),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn into_parts(self) -> (String, ActionBody) {
        (self.id, self.body)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Why an action body gave up. Carried as the reason of a rejected report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Raised by the action's own business logic.
    #[error("precondition failed: {0}")]
    Precondition(String),
}

impl ActionError {
    pub fn precondition(reason: impl Into<String>) -> Self {
        ActionError::Precondition(reason.into())
    }

    /// Stable short name, used as a log field.
    pub fn code(&self) -> &'static str {
        match self {
            ActionError::Storage(StorageError::KeyNotFound { .. }) => "key_not_found",
            ActionError::Storage(StorageError::ShapeMismatch { .. }) => "shape_mismatch",
            ActionError::Storage(StorageError::SemanticMutation { .. }) => "semantic_mutation",
            ActionError::Storage(StorageError::KeyCollision { .. }) => "key_collision",
            ActionError::Precondition(_) => "precondition",
        }
    }
}
