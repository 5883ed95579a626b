use std::error::Error;

use gml_core::strategy::plan_restart;
use gml_core::{ResourceSpec, TrainingType};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::summary::OutputFormat;
use crate::train::{build_registry, deploy};

pub struct RestartArgs {
    pub framework: String,
    pub service: String,
    pub training_type: TrainingType,
    pub pull_latest: bool,
    pub dry_run: bool,
    pub env: Vec<(String, String)>,
}

/// Delete and re-apply one service from its manifest as shipped. Only the
/// environment is merged in.
pub async fn handle_restart(
    args: RestartArgs,
    settings: &Settings,
    output: OutputFormat,
    cancel: CancellationToken,
) -> Result<(), Box<dyn Error>> {
    let registry = build_registry(settings)?;
    let framework = registry.lookup(&args.framework)?;

    let mut resources = ResourceSpec::default();
    if args.pull_latest {
        resources
            .extra_env
            .insert("PULL_LATEST".to_string(), "true".to_string());
    }
    resources.extra_env.extend(args.env);

    let plan = plan_restart(framework, args.training_type, &args.service, &resources)?;
    let message = format!("Restarting {} {}...", args.framework, args.service);
    deploy(plan, args.dry_run, settings, output, &message, cancel).await
}
