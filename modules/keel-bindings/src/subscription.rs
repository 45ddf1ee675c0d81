use std::fmt;

use keel_storage::Storage;

type Update = Box<dyn Fn(&Storage) -> bool + Send + Sync>;

/// Projection of the committed storage paired with a callback. The callback
/// runs after every commit for which the projection yields a value.
pub(crate) struct Subscription {
    update: Update,
}

impl Subscription {
    pub(crate) fn new<T, P, U>(project: P, update: U) -> Self
    where
        P: Fn(&Storage) -> Option<T> + Send + Sync + 'static,
        U: Fn(T) + Send + Sync + 'static,
    {
        Self {
            update: Box::new(move |storage| match project(storage) {
                Some(value) => {
                    update(value);
                    true
                }
                None => false,
            }),
        }
    }

    /// Returns whether the callback ran.
    pub(crate) fn evaluate(&self, storage: &Storage) -> bool {
        (self.update)(storage)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
