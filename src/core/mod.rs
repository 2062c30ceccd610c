// Infrastructure shared by every component: errors, configuration, logging, cancellation

pub mod cancel;
pub mod config;
pub mod errors;
pub mod logging;

// Re-export commonly used types
pub use cancel::CancelToken;
pub use config::{
    ExecutionConfig, ExistingJobPolicy, JobsConfig, JobsConfigBuilder, QueueConfig,
    ServerDefaults, StorageConfig, WaitConfig,
};
pub use errors::{ErrorKind, JobError, Result};
pub use logging::init_logging;
