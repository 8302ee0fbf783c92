pub mod types;
pub mod store;
pub mod redis;
pub mod config;

// Re-export commonly used types for convenience
pub use types::{
    GradeOutcome, GradingJob, GraderResult, HiddenTestSpec, JobStatus, StyleViolation, TestOutcome,
    TransitionError,
};
pub use store::{JobStore, MemoryJobStore, StoreError};
pub use redis::RedisJobStore;
pub use config::Config;
