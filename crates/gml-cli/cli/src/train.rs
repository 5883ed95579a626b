use std::collections::BTreeMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use gml_core::manifest::render_documents;
use gml_core::plugin::register_plugins;
use gml_core::{
    ClusterClient, ConfigResolver, DeploymentExecutor, DeploymentPlan, DeploymentStrategy,
    FrameworkRegistry, GmlError, JobRequest, MemoryCluster, PlanMode, TrainingType,
};
use gml_kube::KubeCluster;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Settings;
use crate::overrides::parse_overrides;
use crate::spinner::create_spinner;
use crate::summary::{print_result, OutputFormat};

pub struct TrainArgs {
    pub framework: String,
    pub training_type: TrainingType,
    pub config: PathBuf,
    pub pull_latest: bool,
    pub services_only: bool,
    pub dry_run: bool,
    pub env: Vec<(String, String)>,
    pub overrides: Vec<String>,
}

/// Built-in frameworks plus any plugins in the configured directory.
pub fn build_registry(settings: &Settings) -> Result<FrameworkRegistry, GmlError> {
    let mut registry = FrameworkRegistry::with_builtins(settings.manifest_dir().as_deref());
    let plugins = register_plugins(&mut registry, &settings.plugin_dir())?;
    debug!(?plugins, "framework registry ready");
    Ok(registry)
}

pub async fn handle_train(
    args: TrainArgs,
    settings: &Settings,
    output: OutputFormat,
    cancel: CancellationToken,
) -> Result<(), Box<dyn Error>> {
    let registry = build_registry(settings)?;

    let mut request = JobRequest::new(args.framework, args.training_type, args.config);
    request.overrides = parse_overrides(&args.overrides)?;
    request.pull_latest = args.pull_latest;
    request.extra_env = args.env.into_iter().collect::<BTreeMap<_, _>>();
    request.skip_validation = args.services_only;

    let resolved = ConfigResolver::new(&registry).resolve(&request)?;
    let framework = registry.lookup(&resolved.job.framework)?;
    let mode = if args.services_only {
        PlanMode::ServicesOnly
    } else {
        PlanMode::Full
    };
    let plan = DeploymentStrategy::for_training_type(args.training_type).plan(
        &resolved.job,
        framework,
        &resolved.resources,
        &mode,
    )?;

    let message = if args.services_only {
        format!("Deploying {} services...", resolved.job.framework)
    } else {
        format!("Deploying {}...", resolved.job.name)
    };
    deploy(plan, args.dry_run, settings, output, &message, cancel).await
}

/// The live cluster, or an empty in-memory one for a dry run.
pub async fn connect(
    dry_run: bool,
    settings: &Settings,
) -> Result<Arc<dyn ClusterClient>, Box<dyn Error>> {
    if dry_run {
        return Ok(Arc::new(MemoryCluster::new()));
    }
    let cluster =
        KubeCluster::connect(settings.namespace.as_deref(), settings.field_manager()).await?;
    info!(namespace = %cluster.namespace(), "connected to cluster");
    Ok(Arc::new(cluster))
}

/// Execute `plan` against the cluster, or against an in-memory one for a
/// dry run, and print the result.
pub async fn deploy(
    plan: DeploymentPlan,
    dry_run: bool,
    settings: &Settings,
    output: OutputFormat,
    message: &str,
    cancel: CancellationToken,
) -> Result<(), Box<dyn Error>> {
    if dry_run && output == OutputFormat::Table {
        print!("{}", render_documents(&plan.documents())?);
        println!("---");
    }
    let cluster = connect(dry_run, settings).await?;

    let spinner = create_spinner(message, output == OutputFormat::Json);
    let result = DeploymentExecutor::new(cluster)
        .with_max_parallel(settings.max_parallel())
        .execute_with_cancel(plan, cancel)
        .await;
    spinner.finish_and_clear();

    print_result(&result, output)?;
    match result.error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}
