use serde_json::{Map, Value};
use std::fmt;
use std::path::{Component, Path};
use std::sync::Arc;
use tracing::warn;

use crate::core::errors::{JobError, Result};
use crate::jobs::model::ServerConfig;

/// In-process job body: receives the job's `input` and returns its result
pub type JobFunction = dyn Fn(&Map<String, Value>) -> anyhow::Result<Value> + Send + Sync;

/// Reads results from a working directory after the external command exited
pub type OutputCollector = dyn Fn(&Path) -> anyhow::Result<Value> + Send + Sync;

/// A job that runs an external command inside its working directory
pub trait ExecutableJob: Send + Sync {
    /// Shell command, executed with `sh -c` in the working directory
    fn command(&self, server: &ServerConfig) -> Result<String>;

    /// Materialise the input as files in the working directory
    fn write_input(&self, input: &Map<String, Value>, working_directory: &Path) -> anyhow::Result<()> {
        write_input_files(input, working_directory)
    }

    /// Parse the results left in the working directory
    fn collect_output(&self, working_directory: &Path) -> anyhow::Result<Value>;
}

/// What a job type executes
#[derive(Clone)]
pub enum JobBody {
    Function(Arc<JobFunction>),
    Executable(Arc<dyn ExecutableJob>),
    /// Supervises children; its status is derived from theirs
    Master,
}

impl fmt::Debug for JobBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobBody::Function(_) => f.write_str("Function"),
            JobBody::Executable(_) => f.write_str("Executable"),
            JobBody::Master => f.write_str("Master"),
        }
    }
}

/// Everything the registry knows about a job type
#[derive(Debug, Clone)]
pub struct Runnable {
    pub body: JobBody,
    pub input_schema: Option<Value>,
    pub default_input: Map<String, Value>,
    pub version: String,
}

impl Runnable {
    fn with_body(body: JobBody) -> Self {
        Self {
            body,
            input_schema: None,
            default_input: Map::new(),
            version: "0.1.0".to_string(),
        }
    }

    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::with_body(JobBody::Function(Arc::new(f)))
    }

    pub fn executable(job: impl ExecutableJob + 'static) -> Self {
        Self::with_body(JobBody::Executable(Arc::new(job)))
    }

    pub fn master() -> Self {
        Self::with_body(JobBody::Master)
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    /// Default input; must be a JSON object
    pub fn with_default_input(mut self, input: Value) -> Self {
        if let Value::Object(map) = input {
            self.default_input = map;
        }
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn is_master(&self) -> bool {
        matches!(self.body, JobBody::Master)
    }

    /// Check `input` against the type's JSON schema, if it has one
    pub fn validate_input(&self, job_name: &str, input: &Map<String, Value>) -> Result<()> {
        let Some(schema) = &self.input_schema else {
            return Ok(());
        };
        let compiled_schema = jsonschema::validator_for(schema)
            .map_err(|e| JobError::configuration(format!("Failed to compile input schema: {}", e)))?;
        let instance = Value::Object(input.clone());
        if let Err(errors) = compiled_schema.validate(&instance) {
            warn!("Input validation failed for job {}: {}", job_name, errors);
            return Err(JobError::configuration(format!(
                "Invalid input for job {}: {}",
                job_name, errors
            )));
        }
        Ok(())
    }
}

/// External command defined by a template, with `{cores}`, `{threads}` and
/// `{gpus}` replaced from the job's server settings.
pub struct ScriptJob {
    command_template: String,
    collector: Option<Arc<OutputCollector>>,
}

impl ScriptJob {
    pub const DEFAULT_OUTPUT_FILE: &'static str = "output.json";

    pub fn new(command_template: impl Into<String>) -> Self {
        Self {
            command_template: command_template.into(),
            collector: None,
        }
    }

    pub fn with_collector<F>(mut self, collector: F) -> Self
    where
        F: Fn(&Path) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.collector = Some(Arc::new(collector));
        self
    }
}

impl ExecutableJob for ScriptJob {
    fn command(&self, server: &ServerConfig) -> Result<String> {
        if self.command_template.trim().is_empty() {
            return Err(JobError::configuration("executable job has an empty command"));
        }
        Ok(self
            .command_template
            .replace("{cores}", &server.cores.to_string())
            .replace("{threads}", &server.threads.to_string())
            .replace("{gpus}", &server.gpus.unwrap_or(0).to_string()))
    }

    fn collect_output(&self, working_directory: &Path) -> anyhow::Result<Value> {
        if let Some(collector) = &self.collector {
            return collector(working_directory);
        }
        let path = working_directory.join(Self::DEFAULT_OUTPUT_FILE);
        if !path.exists() {
            return Ok(Value::Object(Map::new()));
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Default `write_input`: `files_to_create` maps file names to contents,
/// `files_to_copy` maps file names to source paths. Other input keys are ignored.
pub fn write_input_files(input: &Map<String, Value>, working_directory: &Path) -> anyhow::Result<()> {
    if let Some(files) = input.get("files_to_create").and_then(Value::as_object) {
        for (file_name, content) in files {
            let target = working_directory.join(safe_relative(file_name)?);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let content = match content {
                Value::String(s) => s.clone(),
                Value::Array(lines) => lines
                    .iter()
                    .map(|l| l.as_str().map(str::to_string).unwrap_or_else(|| l.to_string()))
                    .collect::<Vec<_>>()
                    .concat(),
                other => other.to_string(),
            };
            std::fs::write(&target, content)?;
        }
    }
    if let Some(files) = input.get("files_to_copy").and_then(Value::as_object) {
        for (file_name, source) in files {
            let source = source
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("source of '{}' must be a path string", file_name))?;
            let target = working_directory.join(safe_relative(file_name)?);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(source, &target)
                .map_err(|e| anyhow::anyhow!("failed to copy {} to {}: {}", source, target.display(), e))?;
        }
    }
    Ok(())
}

fn safe_relative(file_name: &str) -> anyhow::Result<&Path> {
    let path = Path::new(file_name);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if file_name.is_empty() || escapes {
        anyhow::bail!("input file name '{}' must stay inside the working directory", file_name);
    }
    Ok(path)
}
