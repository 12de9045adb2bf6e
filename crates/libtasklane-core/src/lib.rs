pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod error;
pub mod metadata;
pub mod queue;
pub mod resolution;
pub mod store;
pub mod types;

pub use config::{load_config, save_config, BackendConfig, BackendKind, SyncConfig};
pub use conflict::ConflictStore;
pub use coordinator::SyncCoordinator;
pub use error::TasklaneError;
pub use metadata::SyncMetadata;
pub use queue::{OperationSink, SyncQueue};
pub use resolution::ResolutionPlan;
pub use store::{
    Database, DatabaseGuard, DatabaseSource, LocalIdIndex, LockedDatabase, SledTaskStore,
    StorageMaintenance, TaskStore,
};
pub use types::{
    ConflictStatus, LocalId, NewConflict, OperationType, ResolutionStrategy, SyncBaseline,
    SyncConflict, SyncOperation, Task, TaskFilter, TaskStatus,
};
