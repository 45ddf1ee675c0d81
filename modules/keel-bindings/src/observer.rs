use std::sync::{Arc, Weak};

use uuid::Uuid;

#[derive(Debug)]
struct ObserverInner {
    id: Uuid,
    name: String,
}

/// Lifetime anchor for bindings. Bindings only hold a weak reference: once
/// every clone of the observer is dropped, its bindings stop firing and are
/// pruned before the next evaluation pass.
#[derive(Debug, Clone)]
pub struct Observer {
    inner: Arc<ObserverInner>,
}

impl Observer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ObserverInner {
                id: Uuid::new_v4(),
                name: name.into(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn downgrade(&self) -> ObserverRef {
        ObserverRef {
            inner: Arc::downgrade(&self.inner),
            name: self.inner.name.clone(),
        }
    }
}

/// Non-owning handle kept by the registry.
#[derive(Debug, Clone)]
pub(crate) struct ObserverRef {
    inner: Weak<ObserverInner>,
    name: String,
}

impl ObserverRef {
    pub(crate) fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}
