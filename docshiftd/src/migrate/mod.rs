pub mod backoff;
pub mod cache;
pub mod conflict;
pub mod crawler;
pub mod engine;
pub mod error;
pub mod executor;
pub mod model;
pub mod paths;
pub mod planner;
pub mod retry;
pub mod throttle;
pub mod transfer;

pub use engine::{MigrationEngine, StartCopySummary};
pub use error::MigrationError;
pub use model::{
    AsyncStartCopy, BulkCopyBatch, ConflictPolicy, CopyBatch, CopyRequest, FileRecord,
    QueueMessage,
};
