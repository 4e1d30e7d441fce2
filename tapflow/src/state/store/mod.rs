pub mod base;
pub mod file;
pub mod memory;
pub mod postgres;
pub mod retrying;

pub use base::CheckpointStore;
pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;
pub use postgres::PostgresCheckpointStore;
pub use retrying::RetryingCheckpointStore;
