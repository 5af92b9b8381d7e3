use super::{json_pretty, EXIT_SUCCESS};
use distmig_core::{stage_span, Pipeline, StageName, StageReport};
use distmig_schema::{parse_config_file, MigrationConfig};
use distmig_store::MigrationLayout;
use std::path::Path;

fn load_config(
    layout: &MigrationLayout,
    explicit: Option<&Path>,
) -> Result<MigrationConfig, String> {
    match explicit {
        Some(path) => parse_config_file(path),
        None => MigrationConfig::load(&layout.config_file()),
    }
    .map_err(|e| format!("configuration error: {e}"))
}

fn print_report(report: &StageReport) {
    let state = if report.skipped { "skipped" } else { "finished" };
    println!("stage {} {state}", report.stage);
    for mountpoint in &report.mounted {
        println!("  mounted {}", mountpoint.display());
    }
    for failure in &report.soft_failures {
        println!(
            "  warning: {} left mounted: {}",
            failure.mountpoint.display(),
            failure.reason
        );
    }
}

pub fn run(
    layout: &MigrationLayout,
    config: Option<&Path>,
    stage: StageName,
    json: bool,
) -> Result<u8, String> {
    let config = load_config(layout, config)?;
    let pipeline = Pipeline::system(layout.clone(), config, stage_span(stage));
    let report = pipeline.run_stage(stage).map_err(|e| e.to_string())?;

    if json {
        println!("{}", json_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(EXIT_SUCCESS)
}
