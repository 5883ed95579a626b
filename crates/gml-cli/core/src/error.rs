use std::path::PathBuf;

use crate::cluster::ResourceRef;

/// Errors raised while resolving, planning or executing a deployment.
#[derive(Debug, thiserror::Error)]
pub enum GmlError {
    #[error("failed to load config {path}: {reason}")]
    ConfigLoad { path: PathBuf, reason: String },

    #[error("config for {framework} ({training_type}) is missing required fields: {}", missing_fields.join(", "))]
    ConfigValidation {
        framework: String,
        training_type: String,
        missing_fields: Vec<String>,
    },

    #[error("invalid value '{value}' for {field}: {reason}")]
    InvalidField {
        field: String,
        value: String,
        reason: String,
    },

    #[error("unknown framework '{0}'")]
    UnknownFramework(String),

    #[error("framework '{0}' is already registered")]
    DuplicateFramework(String),

    #[error("framework '{framework}' does not support {training_type} training")]
    UnsupportedTrainingType {
        framework: String,
        training_type: String,
    },

    #[error("unknown service '{service}', expected one of: {}", available.join(", "))]
    UnknownService {
        service: String,
        available: Vec<String>,
    },

    #[error("invalid manifest {origin}: {reason}")]
    Manifest { origin: String, reason: String },

    #[error("cannot inject resources into {kind} '{name}': {reason}")]
    ResourceInjection {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("invalid deployment plan: {0}")]
    InvalidPlan(String),

    #[error("failed to apply {resource}: {cause}")]
    Apply { resource: ResourceRef, cause: String },

    #[error("failed to delete {resource}: {cause}")]
    Rollback { resource: ResourceRef, cause: String },

    #[error("failed to load framework plugin {path}: {reason}")]
    Plugin { path: PathBuf, reason: String },

    #[error("deployment cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, GmlError>;

impl GmlError {
    /// A short hint for fixing the error, shown under the error line.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            GmlError::ConfigLoad { .. } => {
                Some("Check that the config file exists and is valid YAML".to_string())
            }
            GmlError::ConfigValidation {
                framework,
                missing_fields,
                ..
            } => Some(format!(
                "Add {} to your config, {} requires {}",
                missing_fields.join(", "),
                framework,
                if missing_fields.len() == 1 { "it" } else { "them" }
            )),
            GmlError::InvalidField { field, .. } => {
                Some(format!("Pass a valid value for {}", field))
            }
            GmlError::UnknownFramework(_) => {
                Some("Run `gml frameworks` to list the available frameworks".to_string())
            }
            GmlError::DuplicateFramework(id) => Some(format!(
                "Remove or rename the plugin that declares '{}'",
                id
            )),
            GmlError::UnsupportedTrainingType { framework, .. } => Some(format!(
                "Verify that the {} framework is properly configured",
                framework
            )),
            GmlError::UnknownService { available, .. } => {
                Some(format!("Pick one of: {}", available.join(", ")))
            }
            GmlError::Manifest { .. } | GmlError::ResourceInjection { .. } => Some(
                "Check that every Job and Deployment manifest has a container list".to_string(),
            ),
            GmlError::Apply { .. } | GmlError::Rollback { .. } => Some(
                "Check cluster resources and verify kubectl access to the cluster".to_string(),
            ),
            GmlError::Plugin { .. } => {
                Some("Fix or remove the plugin file and try again".to_string())
            }
            GmlError::InvalidPlan(_) | GmlError::Cancelled => None,
        }
    }

    /// True when the error was raised before anything was sent to the cluster.
    pub fn is_pre_deployment(&self) -> bool {
        !matches!(
            self,
            GmlError::Apply { .. } | GmlError::Rollback { .. } | GmlError::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_field() {
        let err = GmlError::ConfigValidation {
            framework: "axolotl".to_string(),
            training_type: "grpo".to_string(),
            missing_fields: vec!["base_model".to_string(), "rl=grpo".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "config for axolotl (grpo) is missing required fields: base_model, rl=grpo"
        );
        let hint = err.suggestion().unwrap();
        assert!(hint.contains("base_model, rl=grpo"));
        assert!(hint.contains("axolotl"));
    }

    #[test]
    fn cluster_errors_are_not_pre_deployment() {
        let resource = ResourceRef::new("v1", "ConfigMap", "cfg", None);
        let apply = GmlError::Apply {
            resource: resource.clone(),
            cause: "forbidden".to_string(),
        };
        assert!(!apply.is_pre_deployment());
        assert!(GmlError::UnknownFramework("x".to_string()).is_pre_deployment());
        assert_eq!(apply.to_string(), "failed to apply ConfigMap/cfg: forbidden");
    }
}
