pub mod command;
pub mod coordinator;
pub mod integrity;
pub mod query;
pub mod search;
pub mod temporaries;

pub use command::ClipCommandService;
pub use coordinator::TransactionCoordinator;
pub use integrity::IntegrityValidationService;
pub use query::{ClipQueryService, ClipSearchQuery, LiveQuery};
pub use temporaries::TemporariesPersistService;

/// Told after a command committed changes to the records.
pub trait ChangeObserver: Send + Sync {
    fn records_did_change(&self);
}
