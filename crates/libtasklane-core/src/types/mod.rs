pub mod sync;
pub mod task;

pub use sync::{
    ConflictStatus, NewConflict, OperationType, ResolutionStrategy, SyncBaseline, SyncConflict,
    SyncOperation,
};
pub use task::{LocalId, Task, TaskFilter, TaskStatus};
