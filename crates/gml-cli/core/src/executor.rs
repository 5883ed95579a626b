use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, field, info, instrument, warn, Span};
use uuid::Uuid;

use crate::cluster::{ClusterClient, ResourceRef};
use crate::error::{GmlError, Result};
use crate::plan::{
    DeploymentPlan, DeploymentResult, ManifestUnit, TeardownReport, UnitAction, UnitOutcome,
    UnitStatus,
};

pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Runs plans against a cluster and undoes partial rollouts.
pub struct DeploymentExecutor {
    cluster: Arc<dyn ClusterClient>,
    max_parallel: usize,
}

/// What one unit did to the cluster.
#[derive(Default)]
struct UnitEffect {
    /// Live resources deleted by a replace before its apply.
    replaced: Vec<ResourceRef>,
    applied: Vec<ResourceRef>,
    error: Option<GmlError>,
}

struct UnitRun {
    index: usize,
    effect: UnitEffect,
}

impl DeploymentExecutor {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        DeploymentExecutor {
            cluster,
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    /// Cap on units applied at the same time within a stage.
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub async fn execute(&self, plan: DeploymentPlan) -> DeploymentResult {
        self.execute_with_cancel(plan, CancellationToken::new()).await
    }

    /// Run `plan` stage by stage. Cancellation is checked before each stage;
    /// a stage already dispatched finishes first, then everything applied so
    /// far is rolled back.
    #[instrument(skip_all, fields(run_id = tracing::field::Empty, stages = plan.stages().len()))]
    pub async fn execute_with_cancel(
        &self,
        plan: DeploymentPlan,
        cancel: CancellationToken,
    ) -> DeploymentResult {
        let run_id = Uuid::new_v4();
        Span::current().record("run_id", field::display(run_id));
        let started_at = Utc::now();

        let mut outcomes: Vec<UnitOutcome> = plan
            .stages()
            .iter()
            .enumerate()
            .flat_map(|(stage, s)| {
                s.units.iter().map(move |unit| UnitOutcome {
                    name: unit.name.clone(),
                    role: unit.role,
                    stage,
                    status: UnitStatus::Pending,
                    resources: Vec::new(),
                    replaced: Vec::new(),
                })
            })
            .collect();

        // Outcome indices in the order their stage resolved. Rollback walks it backwards.
        let mut ledger: Vec<usize> = Vec::new();
        let mut applied_resources = Vec::new();
        let mut failure: Option<GmlError> = None;
        let mut offset = 0;

        for (stage_index, stage) in plan.stages().iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(stage = stage_index, "deployment cancelled");
                failure = Some(GmlError::Cancelled);
                break;
            }

            info!(stage = stage_index, units = stage.units.len(), "applying stage");
            let cluster = &self.cluster;
            let runs: Vec<UnitRun> = stream::iter(stage.units.iter().enumerate())
                .map(|(i, unit)| async move {
                    UnitRun {
                        index: offset + i,
                        effect: apply_unit(cluster.as_ref(), unit).await,
                    }
                })
                .buffer_unordered(self.max_parallel)
                .collect()
                .await;

            for run in runs {
                let UnitEffect {
                    replaced,
                    applied,
                    error,
                } = run.effect;
                let outcome = &mut outcomes[run.index];
                applied_resources.extend(applied.iter().cloned());
                outcome.resources = applied;
                outcome.replaced = replaced;
                ledger.push(run.index);
                match error {
                    None => outcome.status = UnitStatus::Applied,
                    Some(err) => {
                        warn!(unit = %outcome.name, error = %err, "unit failed");
                        outcome.status = UnitStatus::Failed;
                        if failure.is_none() {
                            failure = Some(err);
                        }
                    }
                }
            }
            offset += stage.units.len();

            if failure.is_some() {
                break;
            }
        }

        let mut rollback_errors = Vec::new();
        if let Some(cause) = &failure {
            warn!(error = %cause, "rolling back deployment");
            rollback_errors = self.rollback(&ledger, &mut outcomes).await;
        }

        let finished_at = Utc::now();
        let success = failure.is_none();
        if success {
            info!(resources = applied_resources.len(), "deployment complete");
        }
        DeploymentResult {
            run_id,
            started_at,
            finished_at,
            success,
            applied_resources,
            units: outcomes,
            error: failure,
            rollback_errors,
        }
    }

    /// Delete `resources` in the given order. Every delete is attempted; a
    /// resource that is already gone counts as deleted.
    #[instrument(skip_all, fields(resources = resources.len()))]
    pub async fn teardown(&self, resources: &[ResourceRef]) -> TeardownReport {
        let mut report = TeardownReport::default();
        for resource in resources {
            match self.cluster.delete(resource).await {
                Ok(()) => {
                    info!(resource = %resource, "deleted");
                    report.deleted.push(resource.clone());
                }
                Err(err) => {
                    error!(resource = %resource, error = %err, "delete failed");
                    report.failed.push(into_rollback_error(err, resource));
                }
            }
        }
        report
    }

    /// Delete what the ledger recorded, latest first. A failed delete is
    /// recorded and the remaining deletes still run. Resources a replace
    /// deleted cannot be restored, so such units always end `RollbackFailed`.
    async fn rollback(&self, ledger: &[usize], outcomes: &mut [UnitOutcome]) -> Vec<GmlError> {
        let mut errors = Vec::new();
        for &index in ledger.iter().rev() {
            let outcome = &mut outcomes[index];
            let mut compensated = true;
            for resource in outcome.resources.iter().rev() {
                match self.cluster.delete(resource).await {
                    Ok(()) => info!(unit = %outcome.name, resource = %resource, "rolled back"),
                    Err(err) => {
                        error!(unit = %outcome.name, resource = %resource, error = %err, "rollback failed");
                        compensated = false;
                        errors.push(into_rollback_error(err, resource));
                    }
                }
            }
            for resource in &outcome.replaced {
                error!(unit = %outcome.name, resource = %resource, "deleted for restart and not restored");
                compensated = false;
                errors.push(GmlError::Rollback {
                    resource: resource.clone(),
                    cause: "deleted for restart and not restored".to_string(),
                });
            }
            outcome.status = if compensated {
                UnitStatus::RolledBack
            } else {
                UnitStatus::RollbackFailed
            };
        }
        errors
    }
}

/// Apply one unit's documents in order, stopping at the first failure.
async fn apply_unit(cluster: &dyn ClusterClient, unit: &ManifestUnit) -> UnitEffect {
    let mut effect = UnitEffect::default();
    if unit.action == UnitAction::Replace {
        if let Err(err) = remove_existing(cluster, unit, &mut effect.replaced).await {
            effect.error = Some(err);
            return effect;
        }
    }

    for document in unit.documents() {
        match cluster.apply(document).await {
            Ok(resource) => {
                info!(unit = %unit.name, resource = %resource, "applied");
                effect.applied.push(resource);
            }
            Err(err) => {
                effect.error = Some(err);
                return effect;
            }
        }
    }
    effect
}

/// Delete the unit's running resources, recording each one that went.
async fn remove_existing(
    cluster: &dyn ClusterClient,
    unit: &ManifestUnit,
    removed: &mut Vec<ResourceRef>,
) -> Result<()> {
    for resource in unit.identities() {
        cluster.delete(resource).await.map_err(|err| GmlError::Apply {
            resource: resource.clone(),
            cause: format!("could not remove the running copy: {}", err),
        })?;
        info!(unit = %unit.name, resource = %resource, "deleted for restart");
        removed.push(resource.clone());
    }
    Ok(())
}

fn into_rollback_error(err: GmlError, resource: &ResourceRef) -> GmlError {
    match err {
        GmlError::Rollback { .. } => err,
        other => GmlError::Rollback {
            resource: resource.clone(),
            cause: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterOp, MemoryCluster};
    use crate::manifest::ManifestRole;
    use crate::plan::Stage;
    use async_trait::async_trait;
    use serde_yaml::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Barrier;

    fn doc(kind: &str, name: &str) -> Value {
        serde_yaml::from_str(&format!(
            "apiVersion: v1\nkind: {}\nmetadata:\n  name: {}\n",
            kind, name
        ))
        .unwrap()
    }

    fn unit(name: &str, role: ManifestRole, docs: &[(&str, &str)]) -> ManifestUnit {
        ManifestUnit::apply(name, role, docs.iter().map(|(k, n)| doc(k, n)).collect()).unwrap()
    }

    fn sft_plan() -> DeploymentPlan {
        DeploymentPlan::new(vec![
            Stage::new(vec![unit("config", ManifestRole::Config, &[("ConfigMap", "cfg")])]),
            Stage::new(vec![unit("trainer", ManifestRole::Job, &[("Job", "train")])]),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn applies_every_stage_in_order() {
        let cluster = Arc::new(MemoryCluster::new());
        let result = DeploymentExecutor::new(cluster.clone()).execute(sft_plan()).await;

        assert!(result.success);
        assert!(result.error.is_none());
        let names: Vec<_> = result.applied_resources.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["cfg", "train"]);
        assert_eq!(result.status("trainer"), Some(UnitStatus::Applied));
        assert_eq!(cluster.resources().len(), 2);
    }

    #[tokio::test]
    async fn partially_applied_units_are_compensated() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.fail_apply_on("vllm-svc");
        let plan = DeploymentPlan::new(vec![Stage::new(vec![unit(
            "vllm",
            ManifestRole::Service,
            &[("Deployment", "vllm"), ("Service", "vllm-svc")],
        )])])
        .unwrap();

        let result = DeploymentExecutor::new(cluster.clone()).execute(plan).await;
        assert!(!result.success);
        assert_eq!(result.status("vllm"), Some(UnitStatus::RolledBack));
        assert_eq!(result.unit("vllm").unwrap().resources.len(), 1);
        assert!(cluster.resources().is_empty());
    }

    #[tokio::test]
    async fn replace_deletes_before_applying() {
        let cluster = Arc::new(MemoryCluster::new());
        let existing = cluster.seed(doc("Deployment", "vllm")).unwrap();
        let plan = DeploymentPlan::new(vec![Stage::new(vec![ManifestUnit::replace(
            "vllm",
            ManifestRole::Service,
            vec![doc("Deployment", "vllm")],
        )
        .unwrap()])])
        .unwrap();

        let result = DeploymentExecutor::new(cluster.clone()).execute(plan).await;
        assert!(result.success);
        assert_eq!(
            cluster.journal(),
            vec![ClusterOp::Delete(existing.clone()), ClusterOp::Apply(existing)]
        );
    }

    #[tokio::test]
    async fn cancelled_before_start_applies_nothing() {
        let cluster = Arc::new(MemoryCluster::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = DeploymentExecutor::new(cluster.clone())
            .execute_with_cancel(sft_plan(), cancel)
            .await;
        assert!(matches!(result.error, Some(GmlError::Cancelled)));
        assert!(cluster.journal().is_empty());
        assert_eq!(result.status("config"), Some(UnitStatus::Pending));
    }

    #[tokio::test]
    async fn failed_replace_reports_the_deleted_originals() {
        let cluster = Arc::new(MemoryCluster::new());
        let deployment = cluster.seed(doc("Deployment", "rewards")).unwrap();
        let service = cluster.seed(doc("Service", "rewards-svc")).unwrap();
        cluster.fail_apply_on("rewards");
        let plan = DeploymentPlan::new(vec![Stage::new(vec![ManifestUnit::replace(
            "rewards",
            ManifestRole::Service,
            vec![doc("Deployment", "rewards"), doc("Service", "rewards-svc")],
        )
        .unwrap()])])
        .unwrap();

        let result = DeploymentExecutor::new(cluster.clone()).execute(plan).await;
        assert!(!result.success);
        assert_eq!(result.status("rewards"), Some(UnitStatus::RollbackFailed));
        assert_eq!(
            result.unit("rewards").unwrap().replaced,
            vec![deployment.clone(), service.clone()]
        );
        let lost: Vec<_> = result
            .rollback_errors
            .iter()
            .map(|e| match e {
                GmlError::Rollback { resource, .. } => resource.clone(),
                other => panic!("unexpected error: {other}"),
            })
            .collect();
        assert_eq!(lost, vec![deployment, service]);
    }

    #[tokio::test]
    async fn replace_that_deleted_nothing_rolls_back_cleanly() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.seed(doc("Deployment", "vllm")).unwrap();
        cluster.fail_delete_on("vllm");
        let plan = DeploymentPlan::new(vec![Stage::new(vec![ManifestUnit::replace(
            "vllm",
            ManifestRole::Service,
            vec![doc("Deployment", "vllm")],
        )
        .unwrap()])])
        .unwrap();

        let result = DeploymentExecutor::new(cluster.clone()).execute(plan).await;
        assert!(matches!(result.error, Some(GmlError::Apply { .. })));
        assert_eq!(result.status("vllm"), Some(UnitStatus::RolledBack));
        assert!(result.rollback_errors.is_empty());
        assert_eq!(cluster.resources().len(), 1);
    }

    /// Tracks how many applies are in flight. With a barrier, every apply
    /// waits there until enough of them have arrived.
    struct Gate {
        inner: MemoryCluster,
        barrier: Option<Barrier>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gate {
        fn new(barrier: Option<Barrier>) -> Self {
            Gate {
                inner: MemoryCluster::new(),
                barrier,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ClusterClient for Gate {
        async fn apply(&self, document: &Value) -> Result<ResourceRef> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(barrier) = &self.barrier {
                barrier.wait().await;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.apply(document).await
        }

        async fn delete(&self, resource: &ResourceRef) -> Result<()> {
            self.inner.delete(resource).await
        }
    }

    fn service_stage(names: &[&str]) -> DeploymentPlan {
        DeploymentPlan::new(vec![Stage::new(
            names
                .iter()
                .map(|name| unit(name, ManifestRole::Service, &[("Deployment", *name)]))
                .collect(),
        )])
        .unwrap()
    }

    #[tokio::test]
    async fn units_in_a_stage_run_together() {
        let cluster = Arc::new(Gate::new(Some(Barrier::new(2))));
        let executor = DeploymentExecutor::new(cluster.clone());

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            executor.execute(service_stage(&["vllm", "rewards"])),
        )
        .await
        .expect("both services should be in flight at once");

        assert!(result.success);
        assert_eq!(cluster.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn max_parallel_caps_units_in_flight() {
        let cluster = Arc::new(Gate::new(None));
        let executor = DeploymentExecutor::new(cluster.clone()).with_max_parallel(1);

        let result = executor.execute(service_stage(&["vllm", "rewards", "judge"])).await;

        assert!(result.success);
        assert_eq!(cluster.peak.load(Ordering::SeqCst), 1);
        let order: Vec<_> = cluster
            .inner
            .journal()
            .into_iter()
            .map(|op| match op {
                ClusterOp::Apply(r) | ClusterOp::Delete(r) => r.name,
            })
            .collect();
        assert_eq!(order, vec!["vllm", "rewards", "judge"]);
    }

    #[test]
    fn max_parallel_is_at_least_one() {
        let executor = DeploymentExecutor::new(Arc::new(MemoryCluster::new())).with_max_parallel(0);
        assert_eq!(executor.max_parallel, 1);
    }
}
