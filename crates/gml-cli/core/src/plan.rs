use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_yaml::Value;
use uuid::Uuid;

use crate::cluster::ResourceRef;
use crate::error::{GmlError, Result};
use crate::manifest::ManifestRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitAction {
    /// Apply every document.
    Apply,
    /// Delete every document's resource, then apply them again.
    Replace,
}

/// One manifest applied as a whole. Its compensating action deletes every
/// resource the unit managed to create.
#[derive(Debug, Clone)]
pub struct ManifestUnit {
    pub name: String,
    pub role: ManifestRole,
    pub action: UnitAction,
    documents: Vec<Value>,
    identities: Vec<ResourceRef>,
}

impl ManifestUnit {
    pub fn apply(name: impl Into<String>, role: ManifestRole, documents: Vec<Value>) -> Result<Self> {
        Self::build(name.into(), role, UnitAction::Apply, documents)
    }

    pub fn replace(
        name: impl Into<String>,
        role: ManifestRole,
        documents: Vec<Value>,
    ) -> Result<Self> {
        Self::build(name.into(), role, UnitAction::Replace, documents)
    }

    fn build(name: String, role: ManifestRole, action: UnitAction, documents: Vec<Value>) -> Result<Self> {
        if documents.is_empty() {
            return Err(GmlError::InvalidPlan(format!("unit '{}' has no documents", name)));
        }
        let identities = documents
            .iter()
            .map(ResourceRef::from_document)
            .collect::<Result<Vec<_>>>()?;
        Ok(ManifestUnit {
            name,
            role,
            action,
            documents,
            identities,
        })
    }

    pub fn documents(&self) -> &[Value] {
        &self.documents
    }

    /// Resource identities as declared by the documents.
    pub fn identities(&self) -> &[ResourceRef] {
        &self.identities
    }
}

/// Units that may be applied concurrently.
#[derive(Debug, Clone)]
pub struct Stage {
    pub units: Vec<ManifestUnit>,
}

impl Stage {
    pub fn new(units: Vec<ManifestUnit>) -> Self {
        Stage { units }
    }
}

/// Stages run strictly in order. A plan never puts a job ahead of, or
/// beside, a service it depends on.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    stages: Vec<Stage>,
}

impl DeploymentPlan {
    pub fn new(stages: Vec<Stage>) -> Result<Self> {
        if stages.is_empty() {
            return Err(GmlError::InvalidPlan("plan has no stages".to_string()));
        }

        let mut names = HashSet::new();
        let mut highest_before: Option<ManifestRole> = None;
        for (index, stage) in stages.iter().enumerate() {
            let Some(lowest) = stage.units.iter().map(|u| u.role).min() else {
                return Err(GmlError::InvalidPlan(format!("stage {} is empty", index)));
            };
            if let Some(highest) = highest_before {
                if lowest < highest {
                    return Err(GmlError::InvalidPlan(format!(
                        "stage {} applies a {} unit after a {} unit",
                        index, lowest, highest
                    )));
                }
            }
            let roles: HashSet<_> = stage.units.iter().map(|u| u.role).collect();
            if roles.contains(&ManifestRole::Job) && roles.contains(&ManifestRole::Service) {
                return Err(GmlError::InvalidPlan(format!(
                    "stage {} applies a job alongside the services it depends on",
                    index
                )));
            }
            for unit in &stage.units {
                if !names.insert(unit.name.as_str()) {
                    return Err(GmlError::InvalidPlan(format!("duplicate unit '{}'", unit.name)));
                }
            }
            highest_before = stage.units.iter().map(|u| u.role).max().max(highest_before);
        }

        Ok(DeploymentPlan { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn units(&self) -> impl Iterator<Item = &ManifestUnit> {
        self.stages.iter().flat_map(|stage| stage.units.iter())
    }

    /// Every document in plan order, for `--dry-run` output.
    pub fn documents(&self) -> Vec<Value> {
        self.units()
            .flat_map(|unit| unit.documents().iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Applied,
    Failed,
    RolledBack,
    RollbackFailed,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Applied => "applied",
            UnitStatus::Failed => "failed",
            UnitStatus::RolledBack => "rolled back",
            UnitStatus::RollbackFailed => "rollback failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitOutcome {
    pub name: String,
    pub role: ManifestRole,
    pub stage: usize,
    pub status: UnitStatus,
    /// Resources this unit created during the run.
    pub resources: Vec<ResourceRef>,
    /// Live resources a replace deleted before re-applying. Rollback cannot
    /// bring these back.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub replaced: Vec<ResourceRef>,
}

/// What a teardown removed and what it could not.
#[derive(Debug, Default, Serialize)]
pub struct TeardownReport {
    pub deleted: Vec<ResourceRef>,
    #[serde(serialize_with = "error_messages")]
    pub failed: Vec<GmlError>,
}

impl TeardownReport {
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// What one execution did. Produced once by the executor.
#[derive(Debug, Serialize)]
pub struct DeploymentResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    /// Every resource created during the run, in order of creation,
    /// including those later rolled back.
    pub applied_resources: Vec<ResourceRef>,
    pub units: Vec<UnitOutcome>,
    #[serde(serialize_with = "error_message")]
    pub error: Option<GmlError>,
    #[serde(serialize_with = "error_messages")]
    pub rollback_errors: Vec<GmlError>,
}

impl DeploymentResult {
    pub fn unit(&self, name: &str) -> Option<&UnitOutcome> {
        self.units.iter().find(|unit| unit.name == name)
    }

    pub fn status(&self, name: &str) -> Option<UnitStatus> {
        self.unit(name).map(|unit| unit.status)
    }

    pub fn rolled_back(&self) -> bool {
        self.units
            .iter()
            .any(|unit| matches!(unit.status, UnitStatus::RolledBack | UnitStatus::RollbackFailed))
    }
}

fn error_message<S: Serializer>(error: &Option<GmlError>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(error) => serializer.serialize_some(&error.to_string()),
        None => serializer.serialize_none(),
    }
}

fn error_messages<S: Serializer>(errors: &[GmlError], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_seq(errors.iter().map(ToString::to_string))
}
