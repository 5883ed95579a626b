use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::{GmlError, Result};
use crate::framework::{BuiltinFramework, Framework};

/// Maps framework ids to their descriptors.
///
/// Built once at startup and then shared read-only; lookups hand out borrows,
/// so consumers never mutate a registered descriptor.
#[derive(Default)]
pub struct FrameworkRegistry {
    frameworks: BTreeMap<String, Arc<dyn Framework>>,
}

impl FrameworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in frameworks.
    pub fn with_builtins(manifest_dir: Option<&Path>) -> Self {
        let mut registry = Self::new();
        for framework in BuiltinFramework::all(manifest_dir) {
            let id = framework.id().to_string();
            registry.frameworks.insert(id, Arc::new(framework));
        }
        registry
    }

    /// Register a framework under `id`. Fails if the id is taken.
    pub fn register(&mut self, id: impl Into<String>, framework: Arc<dyn Framework>) -> Result<()> {
        let id = id.into();
        if self.frameworks.contains_key(&id) {
            return Err(GmlError::DuplicateFramework(id));
        }
        debug!(framework = %id, "registered framework");
        self.frameworks.insert(id, framework);
        Ok(())
    }

    /// Register a framework under `id`, returning the descriptor it shadows.
    pub fn replace(
        &mut self,
        id: impl Into<String>,
        framework: Arc<dyn Framework>,
    ) -> Option<Arc<dyn Framework>> {
        let id = id.into();
        debug!(framework = %id, "replacing framework");
        self.frameworks.insert(id, framework)
    }

    pub fn lookup(&self, id: &str) -> Result<&dyn Framework> {
        self.frameworks
            .get(id)
            .map(|framework| framework.as_ref())
            .ok_or_else(|| GmlError::UnknownFramework(id.to_string()))
    }

    /// Registered ids in sorted order.
    pub fn list(&self) -> Vec<&str> {
        self.frameworks.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.frameworks.contains_key(id)
    }
}
