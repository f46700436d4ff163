//! Implementation of the `jake build` command.
//!
//! Loads the project file, declares its builds and runs them under the configured
//! load target.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use jake_lib::artifact::ArtifactRegistry;
use jake_lib::execute::{CompletedBuild, ExecuteConfig, RunReport, execute_builds};
use jake_lib::project::{PROJECT_FILE, Project};

use crate::output::{self, OutputFormat, format_duration, print_info, print_json, print_stat, print_success};

/// Execute the build command.
///
/// Prints a summary of the completed builds, or the whole run report with `--format json`.
pub fn cmd_build(root: &Path, config: ExecuteConfig, format: OutputFormat) -> Result<()> {
  let project = Project::load(root).with_context(|| format!("Failed to load {}", root.join(PROJECT_FILE).display()))?;

  let registry = ArtifactRegistry::new();
  project.declare(&registry).context("Failed to declare builds")?;

  if registry.build_count() == 0 && !format.is_json() {
    print_info(&format!("No builds declared in {}", PROJECT_FILE));
    return Ok(());
  }

  info!(builds = registry.build_count(), target_load = %config.target_load, "starting build");

  let rt = tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .max_blocking_threads(config.target_load.worker_threads())
    .build()
    .context("Failed to create async runtime")?;
  let report = rt.block_on(execute_builds(&registry, &config)).context("Build failed")?;

  if format.is_json() {
    print_json(&report)?;
  } else {
    print_report(&report);
  }

  Ok(())
}

fn print_report(report: &RunReport) {
  print_success(&format!(
    "Completed {} build(s) in {}",
    report.completed.len(),
    format_duration(report.elapsed)
  ));
  print_stat("Changed", &report.changed().to_string());
  print_stat("Unchanged", &(report.completed.len() - report.changed()).to_string());

  println!();
  for build in &report.completed {
    println!("  {} {}", symbol(build), describe(build));
  }
}

fn symbol(build: &CompletedBuild) -> &'static str {
  if build.changed {
    output::symbols::SUCCESS
  } else {
    output::symbols::UNCHANGED
  }
}

fn describe(build: &CompletedBuild) -> String {
  let mut line = format!("{} ({})", build.id, format_duration(build.duration));
  if !build.accomplishments.is_empty() {
    line.push_str(": ");
    line.push_str(&build.accomplishments.join(", "));
  }
  line
}
