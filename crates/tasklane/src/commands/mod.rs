pub mod conflicts;
pub mod daemon;
pub mod sync;
pub mod task;
