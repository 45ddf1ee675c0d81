//! Non-recoverable faults.
//!
//! Unlike `ActionError`, a fault means the caller broke the dispatcher's
//! contract. It is logged and raised as a panic; nothing tries to continue.

use std::cell::RefCell;

use thiserror::Error;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineFault {
    #[error(
        "reentrant transaction: `{action}` was forced to run synchronously inside a running \
         transaction of dispatcher `{dispatcher}`"
    )]
    ReentrantTransaction { dispatcher: String, action: String },

    #[error("dispatcher `{dispatcher}` halted after an earlier fault")]
    Poisoned { dispatcher: String },

    #[error("dispatcher `{dispatcher}` settled the queue without reporting ticket {ticket}")]
    LostReport { dispatcher: String, ticket: u64 },
}

impl EngineFault {
    pub(crate) fn raise(self) -> ! {
        error!(fault = %self, "Non-recoverable dispatcher fault");
        panic!("{self}")
    }
}

thread_local! {
    static ACTIVE: RefCell<Vec<Uuid>> = const { RefCell::new(Vec::new()) };
}

/// Marks the current thread as executing inside a dispatcher's transaction
/// (body, report hooks and reactors) until dropped.
pub(crate) struct ActiveScope {
    dispatcher: Uuid,
}

impl ActiveScope {
    pub(crate) fn enter(dispatcher: Uuid) -> Self {
        ACTIVE.with(|active| active.borrow_mut().push(dispatcher));
        Self { dispatcher }
    }

    pub(crate) fn is_active(dispatcher: Uuid) -> bool {
        ACTIVE.with(|active| active.borrow().contains(&dispatcher))
    }
}

impl Drop for ActiveScope {
    fn drop(&mut self) {
        ACTIVE.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(pos) = active.iter().rposition(|id| *id == self.dispatcher) {
                active.remove(pos);
            }
        });
    }
}
