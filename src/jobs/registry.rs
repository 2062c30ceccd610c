use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use super::runnable::Runnable;
use crate::core::errors::{JobError, Result};

type Constructor = Arc<dyn Fn() -> Runnable + Send + Sync>;

struct Entry {
    module_path: String,
    class_name: String,
    constructor: Constructor,
    /// Built on first lookup
    resolved: OnceLock<Arc<Runnable>>,
}

/// Maps job type names to constructors.
///
/// Types are added by explicit `register` calls at startup; nothing joins the
/// registry implicitly. Constructors run lazily, on the first lookup of their
/// type, so registering a type costs nothing until a job of it is created or
/// reloaded.
#[derive(Clone, Default)]
pub struct JobTypeRegistry {
    entries: Arc<DashMap<String, Arc<Entry>>>,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `class_name`, defined in `module_path`.
    ///
    /// Registering the same module path twice is a no-op. A different module
    /// path under an existing name is a conflict unless `overwrite` is set.
    pub fn register<F>(&self, module_path: &str, class_name: &str, constructor: F, overwrite: bool) -> Result<()>
    where
        F: Fn() -> Runnable + Send + Sync + 'static,
    {
        if class_name.is_empty() || class_name.contains("::") {
            return Err(JobError::configuration(format!(
                "invalid job type name '{}'",
                class_name
            )));
        }
        let entry = Arc::new(Entry {
            module_path: module_path.to_string(),
            class_name: class_name.to_string(),
            constructor: Arc::new(constructor),
            resolved: OnceLock::new(),
        });

        match self.entries.entry(class_name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                if existing.get().module_path == module_path {
                    return Ok(());
                }
                if !overwrite {
                    return Err(JobError::conflict(format!(
                        "job type '{}' is already registered from '{}'",
                        class_name,
                        existing.get().module_path
                    )));
                }
                debug!(job_type = class_name, module_path, "Overwriting job type registration");
                existing.insert(entry);
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                debug!(job_type = class_name, module_path, "Registered job type");
                vacant.insert(entry);
            }
        }
        Ok(())
    }

    /// Remove a type, e.g. to keep an abstract base out of the creatable set
    pub fn unregister(&self, class_name: &str) -> bool {
        self.entries.remove(class_name).is_some()
    }

    /// Resolve a type by class name or by `module_path::ClassName`
    pub fn lookup(&self, name: &str) -> Result<Arc<Runnable>> {
        let class_name = name.rsplit("::").next().unwrap_or(name);
        let entry = self
            .entries
            .get(class_name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| JobError::not_found(format!("job type '{}' is not registered", name)))?;

        if name.contains("::") && entry.qualified_name() != name {
            return Err(JobError::not_found(format!(
                "job type '{}' is registered as '{}'",
                name,
                entry.qualified_name()
            )));
        }
        Ok(Arc::clone(
            entry.resolved.get_or_init(|| Arc::new((entry.constructor)())),
        ))
    }

    /// `module_path::ClassName` of a registered type
    pub fn qualified_name(&self, class_name: &str) -> Result<String> {
        self.entries
            .get(class_name)
            .map(|e| e.qualified_name())
            .ok_or_else(|| JobError::not_found(format!("job type '{}' is not registered", class_name)))
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.entries.contains_key(class_name)
    }

    /// Registered class names, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Entry {
    fn qualified_name(&self) -> String {
        if self.module_path.is_empty() {
            self.class_name.clone()
        } else {
            format!("{}::{}", self.module_path, self.class_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn adder() -> Runnable {
        Runnable::function(|input| {
            let a = input.get("a").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let b = input.get("b").and_then(|v| v.as_f64()).unwrap_or(0.0);
            Ok(json!(a + b))
        })
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = JobTypeRegistry::new();
        registry.register("sim::math", "Adder", adder, false).unwrap();
        assert!(registry.lookup("Adder").is_ok());
        assert!(registry.lookup("sim::math::Adder").is_ok());
        assert!(matches!(
            registry.lookup("other::Adder"),
            Err(JobError::NotFound(_))
        ));
        assert_eq!(registry.qualified_name("Adder").unwrap(), "sim::math::Adder");
    }

    #[test]
    fn test_conflicting_registration() {
        let registry = JobTypeRegistry::new();
        registry.register("sim::math", "Adder", adder, false).unwrap();
        // Same module again is fine
        registry.register("sim::math", "Adder", adder, false).unwrap();
        let err = registry.register("sim::other", "Adder", adder, false).unwrap_err();
        assert!(matches!(err, JobError::Conflict(_)));
        registry.register("sim::other", "Adder", adder, true).unwrap();
        assert_eq!(registry.qualified_name("Adder").unwrap(), "sim::other::Adder");
    }

    #[test]
    fn test_unknown_type_is_not_found() {
        let registry = JobTypeRegistry::new();
        assert!(matches!(registry.lookup("Missing"), Err(JobError::NotFound(_))));
    }

    #[test]
    fn test_unregister() {
        let registry = JobTypeRegistry::new();
        registry.register("sim", "Base", Runnable::master, false).unwrap();
        assert!(registry.unregister("Base"));
        assert!(!registry.unregister("Base"));
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_constructor_runs_lazily_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let registry = JobTypeRegistry::new();
        registry
            .register(
                "sim",
                "Counted",
                || {
                    CALLS.fetch_add(1, Ordering::SeqCst);
                    Runnable::master()
                },
                false,
            )
            .unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
        registry.lookup("Counted").unwrap();
        registry.lookup("Counted").unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
