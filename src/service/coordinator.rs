use parking_lot::ReentrantMutex;
use tracing::{error, warn};

use crate::errors::Result;
use crate::storage::Transactional;

/// Process-wide write lock for the command path.
///
/// Recursive so a command may call back into another command, or into a
/// service that shares the coordinator, without deadlocking.
#[derive(Default)]
pub struct TransactionCoordinator {
    lock: ReentrantMutex<()>,
}

impl TransactionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the coordinator lock.
    pub fn perform<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.lock.lock();
        f()
    }

    /// Runs `f` inside one storage transaction under the coordinator lock.
    /// Any error from `f` or from the commit cancels the transaction.
    pub fn transaction<S, T>(&self, storage: &S, f: impl FnOnce(&S) -> Result<T>) -> Result<T>
    where
        S: Transactional + ?Sized,
    {
        self.perform(|| {
            storage.begin_transaction()?;
            let value = match f(storage) {
                Ok(value) => value,
                Err(e) => {
                    cancel(storage);
                    return Err(e);
                }
            };
            if let Err(e) = storage.commit_transaction() {
                error!(error = %e, "commit failed");
                cancel(storage);
                return Err(e);
            }
            Ok(value)
        })
    }
}

fn cancel<S: Transactional + ?Sized>(storage: &S) {
    if let Err(e) = storage.cancel_transaction_if_needed() {
        warn!(error = %e, "failed to cancel transaction");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StorageError;
    use crate::storage::models::TagRecipe;
    use crate::storage::object_store::ObjectStore;
    use crate::storage::{ClipReader, ClipStorage};

    #[test]
    fn test_transaction_commits_on_success() {
        let coordinator = TransactionCoordinator::new();
        let store = ObjectStore::in_memory();
        let tag = coordinator
            .transaction(&store, |s| s.create_tag(&TagRecipe::named("a")))
            .unwrap();
        assert!(!store.is_in_transaction());
        assert_eq!(store.read_tag(tag.id).unwrap(), Some(tag));
    }

    #[test]
    fn test_transaction_cancels_on_error() {
        let coordinator = TransactionCoordinator::new();
        let store = ObjectStore::in_memory();
        let result: Result<()> = coordinator.transaction(&store, |s| {
            s.create_tag(&TagRecipe::named("a"))?;
            Err(StorageError::InvalidParameter("stop".into()))
        });
        assert!(result.is_err());
        assert!(!store.is_in_transaction());
        assert!(store.read_all_tags().unwrap().is_empty());
    }

    #[test]
    fn test_perform_is_reentrant() {
        let coordinator = TransactionCoordinator::new();
        let value = coordinator.perform(|| coordinator.perform(|| 7));
        assert_eq!(value, 7);
    }
}
