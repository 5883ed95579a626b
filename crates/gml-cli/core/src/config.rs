use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use crate::error::{GmlError, Result};
use crate::framework::{Framework, TrainingType};
use crate::inject::{child_mapping, ResourceSpec, GPU_RESOURCE};
use crate::registry::FrameworkRegistry;

/// One validated training run. Built once by [`ConfigResolver::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    pub framework: String,
    pub training_type: TrainingType,
    pub name: String,
    pub config: Mapping,
    pub pull_latest: bool,
}

/// What the caller asked for, before anything is resolved.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub framework: String,
    pub training_type: TrainingType,
    pub config_path: PathBuf,
    /// `key=value` pairs from the command line, dotted keys address nested maps.
    pub overrides: Vec<(String, String)>,
    pub pull_latest: bool,
    pub extra_env: BTreeMap<String, String>,
    /// Services-only runs deploy no trainer and skip field validation.
    pub skip_validation: bool,
}

impl JobRequest {
    pub fn new(
        framework: impl Into<String>,
        training_type: TrainingType,
        config_path: impl Into<PathBuf>,
    ) -> Self {
        JobRequest {
            framework: framework.into(),
            training_type,
            config_path: config_path.into(),
            overrides: Vec::new(),
            pull_latest: false,
            extra_env: BTreeMap::new(),
            skip_validation: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedJob {
    pub job: JobDescriptor,
    pub resources: ResourceSpec,
}

/// Turns a [`JobRequest`] into a job descriptor and resource spec.
pub struct ConfigResolver<'r> {
    registry: &'r FrameworkRegistry,
}

impl<'r> ConfigResolver<'r> {
    pub fn new(registry: &'r FrameworkRegistry) -> Self {
        ConfigResolver { registry }
    }

    pub fn resolve(&self, request: &JobRequest) -> Result<ResolvedJob> {
        let framework = self.registry.lookup(&request.framework)?;
        let naming = framework.naming(request.training_type)?;

        let config = load(&request.config_path)?;
        let config = apply_overrides(config, &request.overrides)?;
        for (key, value) in &request.overrides {
            info!(key = %key, value = %value, "override");
        }

        if request.skip_validation {
            debug!(framework = %framework.id(), "skipping config validation");
        } else {
            validate(&config, framework, request.training_type)?;
        }

        let mut resources =
            resolve_resources(&config, &request.overrides, framework, request.training_type)?;
        if request.pull_latest {
            resources
                .extra_env
                .insert("PULL_LATEST".to_string(), "true".to_string());
        }
        resources.extra_env.extend(request.extra_env.clone());

        Ok(ResolvedJob {
            job: JobDescriptor {
                framework: framework.id().to_string(),
                training_type: request.training_type,
                name: naming.job,
                config,
                pull_latest: request.pull_latest,
            },
            resources,
        })
    }
}

/// Read a training config. The top level must be a mapping.
pub fn load(path: &Path) -> Result<Mapping> {
    let load_error = |reason: String| GmlError::ConfigLoad {
        path: path.to_path_buf(),
        reason,
    };

    let content = fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
    match serde_yaml::from_str::<Value>(&content).map_err(|e| load_error(e.to_string()))? {
        Value::Mapping(config) => Ok(config),
        Value::Null => Err(load_error("config is empty".to_string())),
        _ => Err(load_error("expected a mapping at the top level".to_string())),
    }
}

/// Apply command line overrides. An override of an existing value takes that
/// value's type when the raw string allows it; a new key is stored as a string.
/// A dotted key may not pass through an existing non-mapping value.
pub fn apply_overrides(mut config: Mapping, overrides: &[(String, String)]) -> Result<Mapping> {
    for (key, raw) in overrides {
        set_path(&mut config, key, raw)?;
    }
    Ok(config)
}

fn set_path(config: &mut Mapping, key: &str, raw: &str) -> Result<()> {
    let segments: Vec<&str> = key.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return Ok(());
    };

    let mut current = config;
    for (depth, segment) in parents.iter().enumerate() {
        if let Some(existing) = current.get(*segment) {
            if !matches!(existing, Value::Mapping(_) | Value::Null) {
                return Err(GmlError::InvalidField {
                    field: key.to_string(),
                    value: raw.to_string(),
                    reason: format!("`{}` is not a mapping", segments[..=depth].join(".")),
                });
            }
        }
        current = child_mapping(current, segment);
    }
    let value = match current.get(*last) {
        Some(existing) => coerce_like(existing, raw),
        None => Value::String(raw.to_string()),
    };
    current.insert(Value::from(*last), value);
    Ok(())
}

fn coerce_like(existing: &Value, raw: &str) -> Value {
    let coerced = match existing {
        Value::Bool(_) => parse_bool(raw).map(Value::Bool),
        Value::Number(n) if n.is_f64() => raw.parse::<f64>().ok().map(Value::from),
        Value::Number(_) => raw.parse::<i64>().ok().map(Value::from),
        Value::String(_) => return Value::String(raw.to_string()),
        _ => None,
    };
    coerced.unwrap_or_else(|| infer(raw))
}

/// Try boolean, integer, then float before settling on a string.
fn infer(raw: &str) -> Value {
    if let Some(b) = parse_bool(raw) {
        Value::Bool(b)
    } else if let Ok(i) = raw.parse::<i64>() {
        Value::from(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        Value::from(f)
    } else {
        Value::String(raw.to_string())
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Check the config against the framework's required fields.
pub fn validate(config: &Mapping, framework: &dyn Framework, training_type: TrainingType) -> Result<()> {
    let missing_fields = framework.missing_fields(config, training_type);
    if missing_fields.is_empty() {
        return Ok(());
    }
    Err(GmlError::ConfigValidation {
        framework: framework.id().to_string(),
        training_type: training_type.to_string(),
        missing_fields,
    })
}

/// Work out gpu, cpu, memory and image independently. For each one the CLI
/// override wins, then the scalar config key, then the framework default.
/// An explicit `resources` block is carried per section on top of those, so
/// it beats the scalar keys for the entries it sets, and a CLI override
/// removes the block entry it replaces.
pub fn resolve_resources(
    config: &Mapping,
    overrides: &[(String, String)],
    framework: &dyn Framework,
    training_type: TrainingType,
) -> Result<ResourceSpec> {
    let defaults = framework.default_resources(training_type);
    let block = config.get("resources").and_then(Value::as_mapping);

    let override_for = |key: &str| {
        overrides
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };
    let from_config = |key: &str| config.get(key).and_then(scalar);

    let gpu = match override_for("gpu").or_else(|| from_config("gpu")) {
        Some(raw) => Some(parse_gpu("gpu", &raw)?),
        None => defaults.gpu,
    };
    let cpu = override_for("cpu").or_else(|| from_config("cpu")).or(defaults.cpu);
    let memory = override_for("memory")
        .or_else(|| from_config("memory"))
        .or(defaults.memory);
    let image = override_for("image")
        .or_else(|| from_config("image"))
        .unwrap_or_else(|| framework.default_image().to_string());

    let overridden: Vec<&str> = [("gpu", GPU_RESOURCE), ("cpu", "cpu"), ("memory", "memory")]
        .into_iter()
        .filter(|(key, _)| override_for(key).is_some())
        .map(|(_, block_key)| block_key)
        .collect();

    Ok(ResourceSpec {
        gpu,
        cpu,
        memory,
        image: Some(image),
        extra_env: BTreeMap::new(),
        limits: block_section(block, "limits", &overridden)?,
        requests: block_section(block, "requests", &overridden)?,
    })
}

/// One section of an explicit `{limits, requests}` block, without the
/// entries a CLI override already decides. Keys other than gpu, cpu and
/// memory pass through as written.
fn block_section(
    block: Option<&Mapping>,
    section: &str,
    overridden: &[&str],
) -> Result<BTreeMap<String, String>> {
    let mut entries = BTreeMap::new();
    let Some(quantities) = block
        .and_then(|block| block.get(section))
        .and_then(Value::as_mapping)
    else {
        return Ok(entries);
    };

    for (key, value) in quantities {
        let (Some(key), Some(value)) = (key.as_str(), scalar(value)) else {
            continue;
        };
        if overridden.contains(&key) {
            continue;
        }
        if key == GPU_RESOURCE {
            parse_gpu(&format!("resources.{}.{}", section, key), &value)?;
        }
        entries.insert(key.to_string(), value);
    }
    Ok(entries)
}

fn parse_gpu(field: &str, raw: &str) -> Result<u32> {
    raw.trim().parse::<u32>().map_err(|e| GmlError::InvalidField {
        field: field.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::{Builtin, BuiltinFramework};
    use std::io::Write;

    fn mapping(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn axolotl() -> BuiltinFramework {
        BuiltinFramework::new(Builtin::Axolotl, None)
    }

    fn config_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn load_keeps_key_order() {
        let file = config_file("zeta: 1\nalpha: 2\nbase_model: llama\n");
        let config = load(file.path()).unwrap();
        let keys: Vec<_> = config.keys().filter_map(Value::as_str).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "base_model"]);
    }

    #[test]
    fn load_reports_missing_and_malformed_files() {
        assert!(matches!(
            load(Path::new("/nonexistent/config.yaml")),
            Err(GmlError::ConfigLoad { .. })
        ));
        let broken = config_file("base_model: [llama\n");
        assert!(matches!(load(broken.path()), Err(GmlError::ConfigLoad { .. })));
        let list = config_file("- a\n- b\n");
        assert!(matches!(load(list.path()), Err(GmlError::ConfigLoad { .. })));
    }

    #[test]
    fn overrides_take_the_existing_type() {
        let config = mapping(
            "num_epochs: 3\nlearning_rate: 0.0001\nbf16: false\nbase_model: llama\noutput_dir: null\n",
        );
        let config = apply_overrides(
            config,
            &pairs(&[
                ("num_epochs", "5"),
                ("learning_rate", "0.0002"),
                ("bf16", "true"),
                ("base_model", "42"),
                ("output_dir", "7"),
            ]),
        )
        .unwrap();
        assert_eq!(config.get("num_epochs"), Some(&Value::from(5)));
        assert_eq!(config.get("learning_rate"), Some(&Value::from(0.0002)));
        assert_eq!(config.get("bf16"), Some(&Value::Bool(true)));
        assert_eq!(config.get("base_model"), Some(&Value::from("42")));
        assert_eq!(config.get("output_dir"), Some(&Value::from(7)));
    }

    #[test]
    fn unparseable_overrides_fall_back_to_inference() {
        let config = apply_overrides(
            mapping("num_epochs: 3\nbf16: false\n"),
            &pairs(&[("num_epochs", "0.5"), ("bf16", "auto")]),
        )
        .unwrap();
        assert_eq!(config.get("num_epochs"), Some(&Value::from(0.5)));
        assert_eq!(config.get("bf16"), Some(&Value::from("auto")));
    }

    #[test]
    fn new_keys_are_strings() {
        let config = apply_overrides(mapping("base_model: llama\n"), &pairs(&[("seed", "42")])).unwrap();
        assert_eq!(config.get("seed"), Some(&Value::from("42")));
        let keys: Vec<_> = config.keys().filter_map(Value::as_str).collect();
        assert_eq!(keys, vec!["base_model", "seed"]);
    }

    #[test]
    fn dotted_keys_create_nested_mappings() {
        let config = apply_overrides(
            mapping("resources:\n  limits:\n    cpu: 8\n"),
            &pairs(&[("resources.limits.cpu", "16"), ("resources.requests.memory", "64Gi")]),
        )
        .unwrap();
        let resources = config.get("resources").unwrap();
        assert_eq!(resources["limits"]["cpu"], Value::from(16));
        assert_eq!(resources["requests"]["memory"], Value::from("64Gi"));
    }

    #[test]
    fn dotted_keys_do_not_replace_scalars() {
        let err = apply_overrides(
            mapping("base_model: llama\n"),
            &pairs(&[("base_model.revision", "main")]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            GmlError::InvalidField { ref field, ref reason, .. }
                if field == "base_model.revision" && reason.contains("`base_model`")
        ));

        let config = apply_overrides(
            mapping("lora: null\n"),
            &pairs(&[("lora.r", "16")]),
        )
        .unwrap();
        assert_eq!(config.get("lora").unwrap()["r"], Value::from("16"));
    }

    #[test]
    fn validate_enumerates_missing_fields() {
        let err = validate(&mapping("lr: 1\n"), &axolotl(), TrainingType::Grpo).unwrap_err();
        match err {
            GmlError::ConfigValidation { missing_fields, framework, .. } => {
                assert_eq!(framework, "axolotl");
                assert_eq!(missing_fields, vec!["base_model", "rl=grpo"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(validate(&mapping("base_model: x\n"), &axolotl(), TrainingType::Sft).is_ok());
    }

    #[test]
    fn cli_override_beats_config() {
        let config = mapping("memory: 500Gi\n");
        let spec = resolve_resources(
            &config,
            &pairs(&[("memory", "800Gi")]),
            &axolotl(),
            TrainingType::Sft,
        )
        .unwrap();
        assert_eq!(spec.memory.as_deref(), Some("800Gi"));

        let spec = resolve_resources(&config, &[], &axolotl(), TrainingType::Sft).unwrap();
        assert_eq!(spec.memory.as_deref(), Some("500Gi"));

        let spec = resolve_resources(&Mapping::new(), &[], &axolotl(), TrainingType::Sft).unwrap();
        assert_eq!(spec.memory, None);
        assert_eq!(spec.gpu, None);
        assert_eq!(spec.image.as_deref(), Some(axolotl().default_image()));
    }

    #[test]
    fn resources_block_beats_scalar_keys() {
        let config = mapping(
            "gpu: 8\ncpu: 16\nresources:\n  limits:\n    nvidia.com/gpu: 4\n    memory: 2000Gi\n    ephemeral-storage: 200Gi\n  requests:\n    memory: 1800Gi\n",
        );
        let spec = resolve_resources(&config, &[], &axolotl(), TrainingType::Sft).unwrap();
        assert_eq!(spec.gpu, Some(8));
        assert_eq!(spec.cpu.as_deref(), Some("16"));
        assert_eq!(spec.memory, None);
        assert_eq!(
            spec.limits,
            BTreeMap::from([
                ("ephemeral-storage".to_string(), "200Gi".to_string()),
                ("memory".to_string(), "2000Gi".to_string()),
                (GPU_RESOURCE.to_string(), "4".to_string()),
            ])
        );
        assert_eq!(
            spec.requests,
            BTreeMap::from([("memory".to_string(), "1800Gi".to_string())])
        );

        let spec = resolve_resources(
            &config,
            &pairs(&[("gpu", "2"), ("memory", "900Gi")]),
            &axolotl(),
            TrainingType::Sft,
        )
        .unwrap();
        assert_eq!(spec.gpu, Some(2));
        assert_eq!(spec.memory.as_deref(), Some("900Gi"));
        assert_eq!(
            spec.limits,
            BTreeMap::from([("ephemeral-storage".to_string(), "200Gi".to_string())])
        );
        assert!(spec.requests.is_empty());
    }

    #[test]
    fn bad_gpu_in_resources_block_is_rejected() {
        let config = mapping("resources:\n  requests:\n    nvidia.com/gpu: lots\n");
        let err = resolve_resources(&config, &[], &axolotl(), TrainingType::Sft).unwrap_err();
        assert!(matches!(
            err,
            GmlError::InvalidField { ref field, .. } if field == "resources.requests.nvidia.com/gpu"
        ));
    }

    #[test]
    fn bad_gpu_values_are_rejected() {
        let err = resolve_resources(
            &Mapping::new(),
            &pairs(&[("gpu", "eight")]),
            &axolotl(),
            TrainingType::Sft,
        )
        .unwrap_err();
        assert!(matches!(err, GmlError::InvalidField { ref field, .. } if field == "gpu"));
    }

    #[test]
    fn resolve_builds_the_descriptor() {
        let file = config_file("base_model: llama\nrl: grpo\nimage: ghcr.io/acme/grpo:1\n");
        let registry = FrameworkRegistry::with_builtins(None);
        let mut request = JobRequest::new("axolotl", TrainingType::Grpo, file.path());
        request.overrides = pairs(&[("gpu", "4")]);
        request.pull_latest = true;

        let resolved = ConfigResolver::new(&registry).resolve(&request).unwrap();
        assert_eq!(resolved.job.name, "cw-axolotl-train-grpo");
        assert_eq!(resolved.job.config.get("gpu"), Some(&Value::from("4")));
        assert_eq!(resolved.resources.gpu, Some(4));
        assert_eq!(resolved.resources.image.as_deref(), Some("ghcr.io/acme/grpo:1"));
        assert_eq!(
            resolved.resources.extra_env.get("PULL_LATEST").map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn resolve_fails_fast_on_unknown_framework() {
        let registry = FrameworkRegistry::with_builtins(None);
        let request = JobRequest::new("trl", TrainingType::Sft, "/nonexistent.yaml");
        assert!(matches!(
            ConfigResolver::new(&registry).resolve(&request),
            Err(GmlError::UnknownFramework(_))
        ));
    }

    #[test]
    fn services_only_skips_validation() {
        let file = config_file("learning_rate: 0.1\n");
        let registry = FrameworkRegistry::with_builtins(None);
        let mut request = JobRequest::new("axolotl", TrainingType::Grpo, file.path());
        assert!(ConfigResolver::new(&registry).resolve(&request).is_err());

        request.skip_validation = true;
        assert!(ConfigResolver::new(&registry).resolve(&request).is_ok());
    }
}
