//! Frameworks declared in YAML files instead of compiled in.
//!
//! A descriptor names its manifests relative to its own directory:
//!
//! ```yaml
//! id: trl
//! default_image: ghcr.io/acme/trl:0.9
//! training_types:
//!   sft:
//!     config_map: cw-trl-train-sft-config
//!     job: cw-trl-train-sft
//!     required_fields: [model_name_or_path]
//!     resources: { gpu: 4 }
//!     manifests:
//!       - { name: trainer, role: job, path: trl/sft-job.yaml }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use tracing::info;

use crate::error::{GmlError, Result};
use crate::framework::{is_missing, Framework, NamingScheme, ResourceDefaults, TrainingType};
use crate::manifest::{ManifestRef, ManifestRole};
use crate::registry::FrameworkRegistry;

#[derive(Debug, Deserialize)]
struct Descriptor {
    id: String,
    default_image: String,
    training_types: BTreeMap<TrainingType, TrainingLayout>,
}

#[derive(Debug, Clone, Deserialize)]
struct TrainingLayout {
    config_map: String,
    job: String,
    #[serde(default)]
    required_fields: Vec<String>,
    #[serde(default)]
    resources: ResourceDefaults,
    manifests: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestEntry {
    name: String,
    role: ManifestRole,
    path: PathBuf,
}

/// A framework loaded from a descriptor file.
#[derive(Debug)]
pub struct DeclaredFramework {
    id: String,
    default_image: String,
    base_dir: PathBuf,
    layouts: BTreeMap<TrainingType, TrainingLayout>,
}

impl DeclaredFramework {
    pub fn load(path: &Path) -> Result<Self> {
        let plugin_error = |reason: String| GmlError::Plugin {
            path: path.to_path_buf(),
            reason,
        };

        let content = fs::read_to_string(path).map_err(|e| plugin_error(e.to_string()))?;
        let descriptor: Descriptor =
            serde_yaml::from_str(&content).map_err(|e| plugin_error(e.to_string()))?;

        if descriptor.training_types.is_empty() {
            return Err(plugin_error("no training types declared".to_string()));
        }
        for (training_type, layout) in &descriptor.training_types {
            if !layout.manifests.iter().any(|m| m.role == ManifestRole::Job) {
                return Err(plugin_error(format!("{} declares no job manifest", training_type)));
            }
        }

        Ok(DeclaredFramework {
            id: descriptor.id,
            default_image: descriptor.default_image,
            base_dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            layouts: descriptor.training_types,
        })
    }

    fn layout(&self, training_type: TrainingType) -> Result<&TrainingLayout> {
        self.layouts
            .get(&training_type)
            .ok_or_else(|| GmlError::UnsupportedTrainingType {
                framework: self.id.clone(),
                training_type: training_type.to_string(),
            })
    }
}

impl Framework for DeclaredFramework {
    fn id(&self) -> &str {
        &self.id
    }

    fn training_types(&self) -> Vec<TrainingType> {
        self.layouts.keys().copied().collect()
    }

    fn missing_fields(&self, config: &Mapping, training_type: TrainingType) -> Vec<String> {
        let Some(layout) = self.layouts.get(&training_type) else {
            return Vec::new();
        };
        layout
            .required_fields
            .iter()
            .filter(|field| match field.split_once('=') {
                Some((key, expected)) => {
                    config.get(key).and_then(Value::as_str) != Some(expected)
                }
                None => is_missing(config, field),
            })
            .cloned()
            .collect()
    }

    fn manifests(&self, training_type: TrainingType) -> Result<Vec<ManifestRef>> {
        Ok(self
            .layout(training_type)?
            .manifests
            .iter()
            .map(|m| ManifestRef::path(m.name.clone(), m.role, self.base_dir.join(&m.path)))
            .collect())
    }

    fn naming(&self, training_type: TrainingType) -> Result<NamingScheme> {
        let layout = self.layout(training_type)?;
        Ok(NamingScheme {
            config_map: layout.config_map.clone(),
            job: layout.job.clone(),
        })
    }

    fn default_image(&self) -> &str {
        &self.default_image
    }

    fn default_resources(&self, training_type: TrainingType) -> ResourceDefaults {
        self.layouts
            .get(&training_type)
            .map(|layout| layout.resources.clone())
            .unwrap_or_default()
    }
}

/// Load every `*.yaml`/`*.yml` descriptor in `dir`, sorted by file name.
/// A missing directory holds no plugins.
pub fn discover(dir: &Path) -> Result<Vec<DeclaredFramework>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(dir).map_err(|e| GmlError::Plugin {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    paths.sort();

    paths.iter().map(|path| DeclaredFramework::load(path)).collect()
}

/// Register every plugin found in `dir`, returning the ids added.
pub fn register_plugins(registry: &mut FrameworkRegistry, dir: &Path) -> Result<Vec<String>> {
    let mut added = Vec::new();
    for framework in discover(dir)? {
        let id = framework.id().to_string();
        registry.register(id.clone(), Arc::new(framework))?;
        info!(framework = %id, "loaded framework plugin");
        added.push(id);
    }
    Ok(added)
}
