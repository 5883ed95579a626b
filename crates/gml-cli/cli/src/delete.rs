use std::error::Error;

use gml_core::strategy::teardown_targets;
use gml_core::{DeploymentExecutor, TrainingType};

use crate::config::Settings;
use crate::spinner::create_spinner;
use crate::summary::{print_teardown, OutputFormat};
use crate::train::{build_registry, connect};

pub struct DeleteArgs {
    pub framework: String,
    pub training_type: TrainingType,
    pub dry_run: bool,
}

/// Remove the job, services and ConfigMap a run of this framework creates.
/// Resources that are already gone count as deleted.
pub async fn handle_delete(
    args: DeleteArgs,
    settings: &Settings,
    output: OutputFormat,
) -> Result<(), Box<dyn Error>> {
    let registry = build_registry(settings)?;
    let framework = registry.lookup(&args.framework)?;
    let targets = teardown_targets(framework, args.training_type)?;

    let cluster = connect(args.dry_run, settings).await?;
    let message = format!("Deleting {} {}...", args.framework, args.training_type);
    let spinner = create_spinner(&message, output == OutputFormat::Json);
    let report = DeploymentExecutor::new(cluster).teardown(&targets).await;
    spinner.finish_and_clear();

    print_teardown(&report, output)?;
    match report.failed.into_iter().next() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}
