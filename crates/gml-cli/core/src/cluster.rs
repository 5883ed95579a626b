use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Serialize;
use serde_yaml::Value;

use crate::error::{GmlError, Result};

/// Identity of one cluster resource, enough to delete it again.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ResourceRef {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: Option<String>,
    ) -> Self {
        ResourceRef {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
            namespace,
        }
    }

    /// Read the identity of a manifest document from its `apiVersion`, `kind`
    /// and `metadata`.
    pub fn from_document(doc: &Value) -> Result<Self> {
        let field = |value: Option<&Value>, name: &str| -> Result<String> {
            value
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| GmlError::Manifest {
                    origin: describe(doc),
                    reason: format!("missing {}", name),
                })
        };

        let metadata = doc.get("metadata");
        Ok(ResourceRef {
            api_version: field(doc.get("apiVersion"), "apiVersion")?,
            kind: field(doc.get("kind"), "kind")?,
            name: field(metadata.and_then(|m| m.get("name")), "metadata.name")?,
            namespace: metadata
                .and_then(|m| m.get("namespace"))
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} (namespace {})", self.kind, self.name, ns),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

fn describe(doc: &Value) -> String {
    let kind = doc.get("kind").and_then(Value::as_str).unwrap_or("<no kind>");
    let name = doc
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("<no name>");
    format!("{}/{}", kind, name)
}

/// The cluster primitive the executor drives. Implementations own their
/// timeout policy; the executor treats each call as one blocking operation.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Submit one manifest document, returning the identity it was created under.
    /// Failures are reported as [`GmlError::Apply`].
    async fn apply(&self, document: &Value) -> Result<ResourceRef>;

    /// Remove a resource. Removing a resource that does not exist succeeds.
    /// Failures are reported as [`GmlError::Rollback`].
    async fn delete(&self, resource: &ResourceRef) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterOp {
    Apply(ResourceRef),
    Delete(ResourceRef),
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<ResourceRef, Value>,
    journal: Vec<ClusterOp>,
    fail_apply: HashSet<String>,
    fail_delete: HashSet<String>,
}

/// A cluster that lives in memory. Backs `--dry-run` and the test suite.
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<MemoryState>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every apply of a resource with this name fail.
    pub fn fail_apply_on(&self, name: impl Into<String>) {
        self.state().fail_apply.insert(name.into());
    }

    /// Make every delete of a resource with this name fail.
    pub fn fail_delete_on(&self, name: impl Into<String>) {
        self.state().fail_delete.insert(name.into());
    }

    /// Store a resource as if it already existed, without journaling it.
    pub fn seed(&self, document: Value) -> Result<ResourceRef> {
        let resource = ResourceRef::from_document(&document)?;
        self.state().objects.insert(resource.clone(), document);
        Ok(resource)
    }

    pub fn get(&self, resource: &ResourceRef) -> Option<Value> {
        self.state().objects.get(resource).cloned()
    }

    pub fn contains(&self, resource: &ResourceRef) -> bool {
        self.state().objects.contains_key(resource)
    }

    pub fn resources(&self) -> Vec<ResourceRef> {
        self.state().objects.keys().cloned().collect()
    }

    pub fn journal(&self) -> Vec<ClusterOp> {
        self.state().journal.clone()
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn apply(&self, document: &Value) -> Result<ResourceRef> {
        let resource = ResourceRef::from_document(document).map_err(|e| GmlError::Apply {
            resource: ResourceRef::new("", "", "", None),
            cause: e.to_string(),
        })?;

        let mut state = self.state();
        if state.fail_apply.contains(&resource.name) {
            return Err(GmlError::Apply {
                resource,
                cause: "rejected by cluster".to_string(),
            });
        }
        state.journal.push(ClusterOp::Apply(resource.clone()));
        state.objects.insert(resource.clone(), document.clone());
        Ok(resource)
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<()> {
        let mut state = self.state();
        if state.fail_delete.contains(&resource.name) {
            return Err(GmlError::Rollback {
                resource: resource.clone(),
                cause: "rejected by cluster".to_string(),
            });
        }
        state.journal.push(ClusterOp::Delete(resource.clone()));
        state.objects.remove(resource);
        Ok(())
    }
}
