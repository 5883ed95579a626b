use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::{GmlError, Result};
use crate::manifest::{ManifestRef, ManifestRole};

/// Config keys that describe the cluster rather than the training run.
/// They are stripped before the config is handed to the trainer.
pub const CLUSTER_FIELDS: [&str; 5] = ["image", "gpu", "cpu", "memory", "resources"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingType {
    /// Supervised fine-tuning: one ConfigMap and one Job.
    Sft,
    /// Multi-service GRPO pipeline: inference and reward services plus a trainer Job.
    Grpo,
}

impl TrainingType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TrainingType::Sft => "sft",
            TrainingType::Grpo => "grpo",
        }
    }

    pub const fn is_multi_service(&self) -> bool {
        matches!(self, TrainingType::Grpo)
    }
}

impl fmt::Display for TrainingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrainingType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sft" => Ok(TrainingType::Sft),
            "grpo" => Ok(TrainingType::Grpo),
            other => Err(format!("unknown training type '{}'", other)),
        }
    }
}

/// Names of the cluster resources a framework creates for one training type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingScheme {
    pub config_map: String,
    pub job: String,
}

/// Resource values a framework falls back to when neither the CLI nor the
/// config sets them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResourceDefaults {
    pub gpu: Option<u32>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

/// A training backend: how to validate its config, which manifests to
/// deploy and what to call the resulting resources.
pub trait Framework: Send + Sync {
    fn id(&self) -> &str;

    fn training_types(&self) -> Vec<TrainingType>;

    /// Every required field that `config` lacks. Empty means valid.
    fn missing_fields(&self, config: &Mapping, training_type: TrainingType) -> Vec<String>;

    fn validate(&self, config: &Mapping, training_type: TrainingType) -> bool {
        self.missing_fields(config, training_type).is_empty()
    }

    /// The config as the trainer should see it inside the ConfigMap.
    fn prepare_config(&self, config: &Mapping) -> Mapping {
        strip_cluster_fields(config)
    }

    fn manifests(&self, training_type: TrainingType) -> Result<Vec<ManifestRef>>;

    fn naming(&self, training_type: TrainingType) -> Result<NamingScheme>;

    fn default_image(&self) -> &str;

    fn default_resources(&self, _training_type: TrainingType) -> ResourceDefaults {
        ResourceDefaults::default()
    }
}

pub fn strip_cluster_fields(config: &Mapping) -> Mapping {
    config
        .iter()
        .filter(|(key, _)| {
            key.as_str()
                .map_or(true, |key| !CLUSTER_FIELDS.contains(&key))
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// True when `key` is absent or null.
pub fn is_missing(config: &Mapping, key: &str) -> bool {
    config.get(key).map_or(true, Value::is_null)
}

const DEFAULT_IMAGE: &str = "ghcr.io/tcapelle/triton_eval:1906";

struct EmbeddedManifest {
    name: &'static str,
    role: ManifestRole,
    path: &'static str,
    content: &'static str,
}

const AXOLOTL_SFT: &[EmbeddedManifest] = &[EmbeddedManifest {
    name: "trainer",
    role: ManifestRole::Job,
    path: "axolotl/sft_job.yaml",
    content: include_str!("../manifests/axolotl/sft_job.yaml"),
}];

const AXOLOTL_GRPO: &[EmbeddedManifest] = &[
    EmbeddedManifest {
        name: "vllm",
        role: ManifestRole::Service,
        path: "axolotl/grpo/vllm-deployment.yaml",
        content: include_str!("../manifests/axolotl/grpo/vllm-deployment.yaml"),
    },
    EmbeddedManifest {
        name: "rewards",
        role: ManifestRole::Service,
        path: "axolotl/grpo/rewards-deployment.yaml",
        content: include_str!("../manifests/axolotl/grpo/rewards-deployment.yaml"),
    },
    EmbeddedManifest {
        name: "trainer",
        role: ManifestRole::Job,
        path: "axolotl/grpo/training-job.yaml",
        content: include_str!("../manifests/axolotl/grpo/training-job.yaml"),
    },
];

const VERIFIERS_GRPO: &[EmbeddedManifest] = &[
    EmbeddedManifest {
        name: "vllm",
        role: ManifestRole::Service,
        path: "verifiers/vllm-deployment.yaml",
        content: include_str!("../manifests/verifiers/vllm-deployment.yaml"),
    },
    EmbeddedManifest {
        name: "rewards",
        role: ManifestRole::Service,
        path: "verifiers/rewards-deployment.yaml",
        content: include_str!("../manifests/verifiers/rewards-deployment.yaml"),
    },
    EmbeddedManifest {
        name: "trainer",
        role: ManifestRole::Job,
        path: "verifiers/training-job.yaml",
        content: include_str!("../manifests/verifiers/training-job.yaml"),
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Axolotl,
    Verifiers,
}

/// The frameworks that ship with gml. Manifests are embedded unless a
/// directory with the same layout is given.
#[derive(Debug, Clone)]
pub struct BuiltinFramework {
    variant: Builtin,
    manifest_dir: Option<PathBuf>,
}

impl BuiltinFramework {
    pub fn new(variant: Builtin, manifest_dir: Option<&Path>) -> Self {
        BuiltinFramework {
            variant,
            manifest_dir: manifest_dir.map(Path::to_path_buf),
        }
    }

    pub fn all(manifest_dir: Option<&Path>) -> Vec<BuiltinFramework> {
        vec![
            BuiltinFramework::new(Builtin::Axolotl, manifest_dir),
            BuiltinFramework::new(Builtin::Verifiers, manifest_dir),
        ]
    }

    fn unsupported(&self, training_type: TrainingType) -> GmlError {
        GmlError::UnsupportedTrainingType {
            framework: self.id().to_string(),
            training_type: training_type.to_string(),
        }
    }

    fn embedded(&self, training_type: TrainingType) -> Option<&'static [EmbeddedManifest]> {
        match (self.variant, training_type) {
            (Builtin::Axolotl, TrainingType::Sft) => Some(AXOLOTL_SFT),
            (Builtin::Axolotl, TrainingType::Grpo) => Some(AXOLOTL_GRPO),
            (Builtin::Verifiers, TrainingType::Grpo) => Some(VERIFIERS_GRPO),
            (Builtin::Verifiers, TrainingType::Sft) => None,
        }
    }
}

impl Framework for BuiltinFramework {
    fn id(&self) -> &str {
        match self.variant {
            Builtin::Axolotl => "axolotl",
            Builtin::Verifiers => "verifiers",
        }
    }

    fn training_types(&self) -> Vec<TrainingType> {
        match self.variant {
            Builtin::Axolotl => vec![TrainingType::Sft, TrainingType::Grpo],
            Builtin::Verifiers => vec![TrainingType::Grpo],
        }
    }

    fn missing_fields(&self, config: &Mapping, training_type: TrainingType) -> Vec<String> {
        let mut missing = Vec::new();
        if is_missing(config, "base_model") {
            missing.push("base_model".to_string());
        }
        if self.variant == Builtin::Axolotl
            && training_type == TrainingType::Grpo
            && config.get("rl").and_then(Value::as_str) != Some("grpo")
        {
            missing.push("rl=grpo".to_string());
        }
        missing
    }

    fn manifests(&self, training_type: TrainingType) -> Result<Vec<ManifestRef>> {
        let embedded = self
            .embedded(training_type)
            .ok_or_else(|| self.unsupported(training_type))?;

        Ok(embedded
            .iter()
            .map(|m| match &self.manifest_dir {
                Some(dir) => ManifestRef::path(m.name, m.role, dir.join(m.path)),
                None => ManifestRef::inline(m.name, m.role, m.content),
            })
            .collect())
    }

    fn naming(&self, training_type: TrainingType) -> Result<NamingScheme> {
        if self.embedded(training_type).is_none() {
            return Err(self.unsupported(training_type));
        }
        let job = format!("cw-{}-train-{}", self.id(), training_type);
        Ok(NamingScheme {
            config_map: format!("{}-config", job),
            job,
        })
    }

    fn default_image(&self) -> &str {
        DEFAULT_IMAGE
    }
}
