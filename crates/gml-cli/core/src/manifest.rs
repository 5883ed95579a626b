use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::{GmlError, Result};

/// Data key the training config is stored under inside its ConfigMap.
pub const CONFIG_MAP_KEY: &str = "config.yaml";

/// What a manifest contributes to a deployment, used to order plan stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestRole {
    Config,
    Service,
    Job,
}

impl fmt::Display for ManifestRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self {
            ManifestRole::Config => "config",
            ManifestRole::Service => "service",
            ManifestRole::Job => "job",
        };
        f.write_str(role)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    Path(PathBuf),
    Inline(String),
}

/// A multi-document manifest plus the role it plays in a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRef {
    /// Short name used in plans and for service restarts, e.g. `vllm`.
    pub name: String,
    pub role: ManifestRole,
    pub source: ManifestSource,
}

impl ManifestRef {
    pub fn path(name: impl Into<String>, role: ManifestRole, path: impl Into<PathBuf>) -> Self {
        ManifestRef {
            name: name.into(),
            role,
            source: ManifestSource::Path(path.into()),
        }
    }

    pub fn inline(name: impl Into<String>, role: ManifestRole, content: impl Into<String>) -> Self {
        ManifestRef {
            name: name.into(),
            role,
            source: ManifestSource::Inline(content.into()),
        }
    }

    pub fn origin(&self) -> String {
        match &self.source {
            ManifestSource::Path(path) => path.display().to_string(),
            ManifestSource::Inline(_) => format!("<{}>", self.name),
        }
    }

    /// Read and parse every document of the manifest.
    pub fn load(&self) -> Result<Vec<Value>> {
        match &self.source {
            ManifestSource::Path(path) => {
                let content = fs::read_to_string(path).map_err(|e| GmlError::Manifest {
                    origin: self.origin(),
                    reason: e.to_string(),
                })?;
                parse_documents(&content, &self.origin())
            }
            ManifestSource::Inline(content) => parse_documents(content, &self.origin()),
        }
    }
}

/// Parse a `---` separated YAML stream. Empty documents are skipped.
pub fn parse_documents(content: &str, origin: &str) -> Result<Vec<Value>> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = Value::deserialize(document).map_err(|e| GmlError::Manifest {
            origin: origin.to_string(),
            reason: e.to_string(),
        })?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}

/// Join documents back into one YAML stream.
pub fn render_documents(documents: &[Value]) -> Result<String> {
    let mut rendered = Vec::with_capacity(documents.len());
    for document in documents {
        let yaml = serde_yaml::to_string(document).map_err(|e| GmlError::Manifest {
            origin: "rendered manifest".to_string(),
            reason: e.to_string(),
        })?;
        rendered.push(yaml);
    }
    Ok(rendered.join("---\n"))
}

/// Build the ConfigMap that carries a training config into the cluster.
pub fn config_map(name: &str, config: &Mapping) -> Result<Value> {
    let to_manifest_error = |e: serde_yaml::Error| GmlError::Manifest {
        origin: format!("ConfigMap/{}", name),
        reason: e.to_string(),
    };

    let payload = serde_yaml::to_string(config).map_err(to_manifest_error)?;
    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(CONFIG_MAP_KEY.to_string(), payload)])),
        ..Default::default()
    };
    serde_yaml::to_value(&config_map).map_err(to_manifest_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TWO_DOCS: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: cw-vllm
---
---
apiVersion: v1
kind: Service
metadata:
  name: cw-vllm
";

    #[test]
    fn parses_multi_document_streams() {
        let docs = parse_documents(TWO_DOCS, "test").unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["kind"].as_str(), Some("Service"));
    }

    #[test]
    fn rejects_broken_yaml() {
        let err = parse_documents("kind: [unclosed", "broken.yaml").unwrap_err();
        assert!(matches!(err, GmlError::Manifest { ref origin, .. } if origin == "broken.yaml"));
    }

    #[test]
    fn loads_manifests_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TWO_DOCS.as_bytes()).unwrap();
        let manifest = ManifestRef::path("vllm", ManifestRole::Service, file.path());
        assert_eq!(manifest.load().unwrap().len(), 2);

        let missing = ManifestRef::path("vllm", ManifestRole::Service, "/nonexistent/vllm.yaml");
        assert!(missing.load().is_err());
    }

    #[test]
    fn rendered_documents_parse_back() {
        let docs = parse_documents(TWO_DOCS, "test").unwrap();
        let rendered = render_documents(&docs).unwrap();
        assert_eq!(parse_documents(&rendered, "rendered").unwrap(), docs);
    }

    #[test]
    fn config_map_embeds_the_config() {
        let config: Mapping = serde_yaml::from_str("base_model: llama\nnum_epochs: 3\n").unwrap();
        let doc = config_map("cw-axolotl-train-sft-config", &config).unwrap();

        assert_eq!(doc["apiVersion"].as_str(), Some("v1"));
        assert_eq!(doc["kind"].as_str(), Some("ConfigMap"));
        assert_eq!(
            doc["metadata"]["name"].as_str(),
            Some("cw-axolotl-train-sft-config")
        );
        let payload = doc["data"][CONFIG_MAP_KEY].as_str().unwrap();
        let round: Mapping = serde_yaml::from_str(payload).unwrap();
        assert_eq!(round, config);
    }
}
