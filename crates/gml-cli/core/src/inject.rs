use std::collections::BTreeMap;

use serde::Serialize;
use serde_yaml::{Mapping, Value};

use crate::error::{GmlError, Result};

pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// Kinds whose pod template carries containers.
const CONTAINER_KINDS: [&str; 2] = ["Job", "Deployment"];

/// Resources, image and environment to merge into every container.
/// `None` leaves whatever the manifest already says.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceSpec {
    pub gpu: Option<u32>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub image: Option<String>,
    pub extra_env: BTreeMap<String, String>,
    /// Entries from an explicit `resources` block, per section. Written after
    /// the shared quantities, so they win for the keys they name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

impl ResourceSpec {
    fn quantities(&self) -> Vec<(&'static str, String)> {
        let mut quantities = Vec::new();
        if let Some(gpu) = self.gpu {
            quantities.push((GPU_RESOURCE, gpu.to_string()));
        }
        if let Some(cpu) = &self.cpu {
            quantities.push(("cpu", cpu.clone()));
        }
        if let Some(memory) = &self.memory {
            quantities.push(("memory", memory.clone()));
        }
        quantities
    }

    pub fn is_empty(&self) -> bool {
        self.quantities().is_empty()
            && self.image.is_none()
            && self.extra_env.is_empty()
            && self.limits.is_empty()
            && self.requests.is_empty()
    }
}

/// Merge `spec` into every container of every Job and Deployment document.
/// Other documents come back unchanged.
pub fn inject(documents: &[Value], spec: &ResourceSpec) -> Result<Vec<Value>> {
    documents
        .iter()
        .map(|document| {
            let mut document = document.clone();
            inject_document(&mut document, spec)?;
            Ok(document)
        })
        .collect()
}

fn inject_document(document: &mut Value, spec: &ResourceSpec) -> Result<()> {
    let kind = match document.get("kind").and_then(Value::as_str) {
        Some(kind) if CONTAINER_KINDS.contains(&kind) => kind.to_string(),
        _ => return Ok(()),
    };
    let name = document
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("<unnamed>")
        .to_string();
    let malformed = |reason: &str| GmlError::ResourceInjection {
        kind: kind.clone(),
        name: name.clone(),
        reason: reason.to_string(),
    };

    let containers = containers_mut(document)
        .ok_or_else(|| malformed("pod template has no container list"))?;
    for container in containers.iter_mut() {
        let container = container
            .as_mapping_mut()
            .ok_or_else(|| malformed("container entry is not a mapping"))?;
        inject_container(container, spec);
    }
    Ok(())
}

fn containers_mut(document: &mut Value) -> Option<&mut Vec<Value>> {
    document
        .get_mut("spec")?
        .get_mut("template")?
        .get_mut("spec")?
        .get_mut("containers")?
        .as_sequence_mut()
}

fn inject_container(container: &mut Mapping, spec: &ResourceSpec) {
    if let Some(image) = &spec.image {
        container.insert(Value::from("image"), Value::from(image.as_str()));
    }

    let quantities = spec.quantities();
    if !quantities.is_empty() || !spec.limits.is_empty() || !spec.requests.is_empty() {
        let resources = child_mapping(container, "resources");
        for (section, entries) in [("limits", &spec.limits), ("requests", &spec.requests)] {
            if quantities.is_empty() && entries.is_empty() {
                continue;
            }
            let section = child_mapping(resources, section);
            let shared = quantities.iter().map(|(key, quantity)| (*key, quantity.as_str()));
            let own = entries.iter().map(|(key, quantity)| (key.as_str(), quantity.as_str()));
            for (key, quantity) in shared.chain(own) {
                section.insert(Value::from(key), Value::from(quantity));
            }
        }
    }

    if !spec.extra_env.is_empty() {
        let env = child_sequence(container, "env");
        for (name, value) in &spec.extra_env {
            upsert_env(env, name, value);
        }
    }
}

fn upsert_env(env: &mut Vec<Value>, name: &str, value: &str) {
    let existing = env
        .iter_mut()
        .filter_map(Value::as_mapping_mut)
        .find(|entry| entry.get("name").and_then(Value::as_str) == Some(name));

    match existing {
        Some(entry) => {
            entry.remove("valueFrom");
            entry.insert(Value::from("value"), Value::from(value));
        }
        None => {
            let mut entry = Mapping::new();
            entry.insert(Value::from("name"), Value::from(name));
            entry.insert(Value::from("value"), Value::from(value));
            env.push(Value::Mapping(entry));
        }
    }
}

/// Get the mapping under `key`, replacing a missing or non-mapping value
/// with an empty one.
pub(crate) fn child_mapping<'a>(parent: &'a mut Mapping, key: &str) -> &'a mut Mapping {
    if !matches!(parent.get(key), Some(Value::Mapping(_))) {
        parent.insert(Value::from(key), Value::Mapping(Mapping::new()));
    }
    match parent.get_mut(key) {
        Some(Value::Mapping(child)) => child,
        _ => unreachable!("mapping inserted above"),
    }
}

fn child_sequence<'a>(parent: &'a mut Mapping, key: &str) -> &'a mut Vec<Value> {
    if !matches!(parent.get(key), Some(Value::Sequence(_))) {
        parent.insert(Value::from(key), Value::Sequence(Vec::new()));
    }
    match parent.get_mut(key) {
        Some(Value::Sequence(child)) => child,
        _ => unreachable!("sequence inserted above"),
    }
}
