use tracing::{debug, info};

use crate::cluster::ResourceRef;
use crate::config::JobDescriptor;
use crate::error::{GmlError, Result};
use crate::framework::{Framework, TrainingType};
use crate::inject::{inject, ResourceSpec};
use crate::manifest::{config_map, ManifestRef, ManifestRole};
use crate::plan::{DeploymentPlan, ManifestUnit, Stage, UnitAction};

/// Unit name of the ConfigMap that carries the training config.
pub const CONFIG_UNIT: &str = "config";

/// The shape of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentStrategy {
    /// ConfigMap, then the job.
    SingleJob,
    /// ConfigMap, then every service at once, then the job.
    MultiService,
}

/// Which part of a strategy's plan to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanMode {
    Full,
    /// Stand up the ConfigMap and services without submitting the job.
    ServicesOnly,
    /// Delete and re-apply one named service, touching nothing else.
    RestartService(String),
}

impl DeploymentStrategy {
    pub fn for_training_type(training_type: TrainingType) -> Self {
        if training_type.is_multi_service() {
            DeploymentStrategy::MultiService
        } else {
            DeploymentStrategy::SingleJob
        }
    }

    pub fn plan(
        &self,
        job: &JobDescriptor,
        framework: &dyn Framework,
        resources: &ResourceSpec,
        mode: &PlanMode,
    ) -> Result<DeploymentPlan> {
        let training_type = job.training_type;
        match (self, mode) {
            (DeploymentStrategy::MultiService, PlanMode::RestartService(service)) => {
                return plan_restart(framework, training_type, service, resources);
            }
            (DeploymentStrategy::SingleJob, PlanMode::ServicesOnly | PlanMode::RestartService(_)) => {
                return Err(GmlError::InvalidPlan(format!(
                    "{} {} runs a single job and has no services",
                    framework.id(),
                    training_type
                )));
            }
            _ => {}
        }

        let naming = framework.naming(training_type)?;
        let prepared = framework.prepare_config(&job.config);
        let config_unit = ManifestUnit::apply(
            CONFIG_UNIT,
            ManifestRole::Config,
            vec![config_map(&naming.config_map, &prepared)?],
        )?;

        let mut services = Vec::new();
        let mut jobs = Vec::new();
        for manifest in framework.manifests(training_type)? {
            match manifest.role {
                ManifestRole::Service => services.push(manifest),
                ManifestRole::Job => jobs.push(manifest),
                ManifestRole::Config => {
                    return Err(GmlError::InvalidPlan(format!(
                        "manifest '{}' claims the config role, which the ConfigMap owns",
                        manifest.name
                    )));
                }
            }
        }
        if jobs.is_empty() {
            return Err(GmlError::InvalidPlan(format!(
                "{} declares no job manifest for {}",
                framework.id(),
                training_type
            )));
        }

        let mut stages = vec![Stage::new(vec![config_unit])];
        match self {
            DeploymentStrategy::SingleJob => {
                if !services.is_empty() {
                    return Err(GmlError::InvalidPlan(format!(
                        "{} {} declares services but runs as a single job",
                        framework.id(),
                        training_type
                    )));
                }
            }
            DeploymentStrategy::MultiService => {
                if services.is_empty() {
                    return Err(GmlError::InvalidPlan(format!(
                        "{} {} declares no services",
                        framework.id(),
                        training_type
                    )));
                }
                stages.push(Stage::new(injected_units(&services, resources, UnitAction::Apply)?));
            }
        }
        if *mode == PlanMode::Full {
            stages.push(Stage::new(injected_units(&jobs, resources, UnitAction::Apply)?));
        }

        info!(
            job = %job.name,
            framework = %framework.id(),
            stages = stages.len(),
            mode = ?mode,
            "planned deployment"
        );
        DeploymentPlan::new(stages)
    }
}

/// A one-unit plan that deletes and re-applies `service`.
pub fn plan_restart(
    framework: &dyn Framework,
    training_type: TrainingType,
    service: &str,
    resources: &ResourceSpec,
) -> Result<DeploymentPlan> {
    let services: Vec<ManifestRef> = framework
        .manifests(training_type)?
        .into_iter()
        .filter(|manifest| manifest.role == ManifestRole::Service)
        .collect();

    let Some(target) = services.iter().find(|manifest| manifest.name == service) else {
        return Err(GmlError::UnknownService {
            service: service.to_string(),
            available: services.iter().map(|m| m.name.clone()).collect(),
        });
    };

    debug!(service, framework = %framework.id(), "planning service restart");
    let units = injected_units(std::slice::from_ref(target), resources, UnitAction::Replace)?;
    DeploymentPlan::new(vec![Stage::new(units)])
}

/// Everything a full run of this framework creates, in the order to remove
/// it: the job, then the services, then the ConfigMap.
pub fn teardown_targets(
    framework: &dyn Framework,
    training_type: TrainingType,
) -> Result<Vec<ResourceRef>> {
    let naming = framework.naming(training_type)?;
    let manifests = framework.manifests(training_type)?;

    let mut targets = Vec::new();
    for role in [ManifestRole::Job, ManifestRole::Service] {
        for manifest in manifests.iter().rev().filter(|m| m.role == role) {
            for document in manifest.load()?.iter().rev() {
                targets.push(ResourceRef::from_document(document)?);
            }
        }
    }
    targets.push(ResourceRef::new("v1", "ConfigMap", naming.config_map, None));
    debug!(framework = %framework.id(), targets = targets.len(), "planned teardown");
    Ok(targets)
}

fn injected_units(
    manifests: &[ManifestRef],
    resources: &ResourceSpec,
    action: UnitAction,
) -> Result<Vec<ManifestUnit>> {
    manifests
        .iter()
        .map(|manifest| {
            let documents = inject(&manifest.load()?, resources)?;
            match action {
                UnitAction::Apply => ManifestUnit::apply(manifest.name.clone(), manifest.role, documents),
                UnitAction::Replace => {
                    ManifestUnit::replace(manifest.name.clone(), manifest.role, documents)
                }
            }
        })
        .collect()
}
