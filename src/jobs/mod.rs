pub mod archive;
pub mod job;
pub mod master;
pub mod model;
pub mod project;
pub mod registry;
pub mod runnable;
pub mod status;

pub use job::Job;
pub use model::{Failure, FailureReason, JobId, JobIdentity, RestartPolicy, RunMode, RunOptions, ServerConfig};
pub use project::Project;
pub use registry::JobTypeRegistry;
pub use runnable::{ExecutableJob, JobBody, Runnable, ScriptJob};
pub use status::JobStatus;
