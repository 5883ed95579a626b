use clap::ValueEnum;
use colored_json::ToColoredJson;
use comfy_table::{Cell, Table};
use gml_core::{DeploymentResult, FrameworkRegistry, TeardownReport, UnitStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

pub fn print_result(
    result: &DeploymentResult,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(result)?;
            println!("{}", json.to_colored_json_auto()?);
        }
        OutputFormat::Table => print_table(result),
    }
    Ok(())
}

fn print_table(result: &DeploymentResult) {
    let mut table = Table::new();
    table.set_header(vec!["Unit", "Stage", "Role", "Status", "Resources"]);

    for unit in &result.units {
        let resources = if unit.resources.is_empty() {
            "-".to_string()
        } else {
            unit.resources
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n")
        };
        table.add_row(vec![
            Cell::new(&unit.name),
            Cell::new(unit.stage + 1),
            Cell::new(unit.role),
            Cell::new(status_label(unit.status)),
            Cell::new(resources),
        ]);
    }

    let started_at = result.started_at.format("%Y-%m-%d %H:%M:%S UTC");
    let elapsed = (result.finished_at - result.started_at).num_milliseconds() as f64 / 1000.0;
    println!("Run {} started {} ({:.1}s)", result.run_id, started_at, elapsed);
    println!("{}", table);

    if !result.rollback_errors.is_empty() {
        println!("\nRollback errors");
        for error in &result.rollback_errors {
            println!("  {}", error);
        }
    }
}

fn status_label(status: UnitStatus) -> String {
    match status {
        UnitStatus::Applied => "✅ applied".to_string(),
        UnitStatus::RollbackFailed => "❌ rollback failed".to_string(),
        other => other.as_str().to_string(),
    }
}

pub fn print_teardown(
    report: &TeardownReport,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    if format == OutputFormat::Json {
        let json = serde_json::to_string_pretty(report)?;
        println!("{}", json.to_colored_json_auto()?);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Resource", "Result"]);
    for resource in &report.deleted {
        table.add_row(vec![Cell::new(resource), Cell::new("🗑️ deleted")]);
    }
    for error in &report.failed {
        table.add_row(vec![Cell::new(error), Cell::new("❌ failed")]);
    }
    println!("{}", table);
    Ok(())
}

pub fn print_frameworks(registry: &FrameworkRegistry) -> Result<(), Box<dyn std::error::Error>> {
    let mut table = Table::new();
    table.set_header(vec!["Framework", "Training Types", "Default Image"]);

    for id in registry.list() {
        let framework = registry.lookup(id)?;
        let training_types = framework
            .training_types()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(vec![
            Cell::new(id),
            Cell::new(training_types),
            Cell::new(framework.default_image()),
        ]);
    }

    println!("{}", table);
    Ok(())
}
