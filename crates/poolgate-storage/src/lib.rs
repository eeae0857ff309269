pub mod entities;
pub mod records;
pub mod seaorm;
pub mod snapshot;
pub mod storage;

pub use records::{ErrorRecord, UsageRecord};
pub use seaorm::SeaOrmStorage;
pub use snapshot::{AccountRow, ApiKeyRow, GroupRow, StorageSnapshot, UserRow};
pub use storage::{Storage, StorageError, StorageResult};
