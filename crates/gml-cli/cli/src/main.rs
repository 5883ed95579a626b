use std::error::Error;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use gml_core::{GmlError, TrainingType};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod config;
mod delete;
mod overrides;
mod restart;
mod spinner;
mod summary;
mod train;

use delete::DeleteArgs;
use restart::RestartArgs;
use summary::OutputFormat;
use train::TrainArgs;

#[derive(Parser, Debug)]
#[command(name = "gml")]
#[command(about = "GML - Deploy training runs to a Kubernetes cluster")]
struct Args {
    /// Log more (-v info, -vv debug). GML_LOG overrides this.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[arg(long, value_enum, default_value_t = OutputFormat::Table, global = true)]
    output: OutputFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy a training run
    Train {
        /// Framework id, e.g. axolotl
        framework: String,
        /// sft or grpo
        training_type: TrainingType,
        /// Training config (YAML)
        config: PathBuf,
        /// Have containers pull the latest code before starting
        #[arg(long)]
        pull_latest: bool,
        /// Deploy the ConfigMap and services without the training job
        #[arg(long)]
        services_only: bool,
        /// Print the manifests and run against an in-memory cluster
        #[arg(long)]
        dry_run: bool,
        /// Extra container environment
        #[arg(long = "env", value_name = "NAME=VALUE", value_parser = overrides::parse_env)]
        env: Vec<(String, String)>,
        /// Config overrides: --key value, --key=value or --flag
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "OVERRIDES")]
        overrides: Vec<String>,
    },
    /// Delete and re-create one service of a multi-service pipeline
    Restart {
        framework: String,
        /// Service name, e.g. vllm or rewards
        service: String,
        #[arg(long, default_value = "grpo")]
        training_type: TrainingType,
        #[arg(long)]
        pull_latest: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long = "env", value_name = "NAME=VALUE", value_parser = overrides::parse_env)]
        env: Vec<(String, String)>,
    },
    /// Delete the job, services and ConfigMap of a run
    Delete {
        framework: String,
        /// sft or grpo
        training_type: TrainingType,
        /// Report what would be deleted without touching the cluster
        #[arg(long)]
        dry_run: bool,
    },
    /// List the registered frameworks
    Frameworks,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env("GML_LOG").unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn report(e: &(dyn Error + 'static)) -> ! {
    eprintln!("Error: {}", e);
    if let Some(suggestion) = e.downcast_ref::<GmlError>().and_then(GmlError::suggestion) {
        eprintln!("💡 {}", suggestion);
    }
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, rolling back");
            interrupt.cancel();
        }
    });

    let settings = match config::parse_config() {
        Ok(settings) => settings,
        Err(e) => report(e.as_ref()),
    };

    let outcome = match args.command {
        Commands::Train {
            framework,
            training_type,
            config,
            pull_latest,
            services_only,
            dry_run,
            env,
            overrides,
        } => {
            let train_args = TrainArgs {
                framework,
                training_type,
                config,
                pull_latest,
                services_only,
                dry_run,
                env,
                overrides,
            };
            train::handle_train(train_args, &settings, args.output, cancel).await
        }
        Commands::Restart {
            framework,
            service,
            training_type,
            pull_latest,
            dry_run,
            env,
        } => {
            let restart_args = RestartArgs {
                framework,
                service,
                training_type,
                pull_latest,
                dry_run,
                env,
            };
            restart::handle_restart(restart_args, &settings, args.output, cancel).await
        }
        Commands::Delete {
            framework,
            training_type,
            dry_run,
        } => {
            let delete_args = DeleteArgs {
                framework,
                training_type,
                dry_run,
            };
            delete::handle_delete(delete_args, &settings, args.output).await
        }
        Commands::Frameworks => train::build_registry(&settings)
            .map_err(Into::into)
            .and_then(|registry| summary::print_frameworks(&registry)),
    };

    if let Err(e) = outcome {
        report(e.as_ref());
    }
}
