//! Build execution.
//!
//! This module runs every build declared in an [`ArtifactRegistry`]:
//! - Critical-path ordering of ready builds
//! - Load-adaptive dispatch onto worker threads
//! - Verification of each build's artifact contract
//! - Aborting the whole run on the first failure
//!
//! A single task owns the build order. Workers report back over a channel, so all
//! scheduling decisions are made in one place.
//!
//! # Submodules
//!
//! - `executor` - The load-adaptive worker pool
//! - `load` - Target load and CPU load sampling
//! - `types` - Configuration, errors and the run report

mod executor;
mod load;
mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::artifact::{ArtifactError, ArtifactRegistry};
use crate::build::runner::{BuildCompletion, run_build};
use crate::build::{BuildId, BuildInfo, PublishError};
use crate::schedule::{BuildMeta, BuildOrder, CriticalPathOrder, NextBuild};

pub use executor::LoadAdaptiveExecutor;
pub use load::{CpuSampler, LoadTracker, ParseTargetLoadError, ProcessCpuSampler, TargetLoad, available_cpus};
pub use types::{CompletedBuild, ExecuteConfig, ExecuteError, RunReport};

/// Execute all builds declared in `registry`.
///
/// Returns once every build has completed, or with the first error. Builds still
/// running when an error is found are awaited before returning.
pub async fn execute_builds(registry: &ArtifactRegistry, config: &ExecuteConfig) -> Result<RunReport, ExecuteError> {
  execute_builds_with_sampler(registry, config, Arc::new(ProcessCpuSampler)).await
}

/// Like [`execute_builds`], measuring load with `sampler`.
pub async fn execute_builds_with_sampler(
  registry: &ArtifactRegistry,
  config: &ExecuteConfig,
  sampler: Arc<dyn CpuSampler>,
) -> Result<RunReport, ExecuteError> {
  let builds = registry.builds();
  let target = config.target_load.effective();
  info!(build_count = builds.len(), target_load = target, "starting build execution");

  let order = CriticalPathOrder::new(builds.iter().map(|info| BuildMeta {
    id: info.id().clone(),
    expected_duration: info.expected_duration().unwrap_or(config.default_build_duration),
    expected_load: info.expected_load(),
    dependencies: info.build_dependencies().iter().cloned().collect(),
  }))?;
  let infos: HashMap<BuildId, Arc<BuildInfo>> = builds.into_iter().map(|info| (info.id().clone(), info)).collect();

  let mut executor = LoadAdaptiveExecutor::start(target, sampler, config.sample_interval);
  let result = run(registry, &infos, order, &mut executor, config).await;
  executor.shutdown().await;

  match &result {
    Ok(report) => info!(
      completed = report.completed.len(),
      changed = report.changed(),
      elapsed_ms = report.elapsed.as_millis() as u64,
      "build execution complete"
    ),
    Err(err) => error!(error = %err, "build execution aborted"),
  }

  result
}

async fn run<O: BuildOrder<BuildId>>(
  registry: &ArtifactRegistry,
  infos: &HashMap<BuildId, Arc<BuildInfo>>,
  mut order: O,
  executor: &mut LoadAdaptiveExecutor,
  config: &ExecuteConfig,
) -> Result<RunReport, ExecuteError> {
  let run_start = Instant::now();
  let (completions_tx, mut completions) = mpsc::unbounded_channel::<BuildCompletion>();
  let mut report = RunReport::default();

  loop {
    match order.calculate_next_build() {
      NextBuild::Done => break,
      NextBuild::Ready(id) => {
        let info = infos.get(&id).ok_or_else(|| ExecuteError::UnknownBuild(id.clone()))?;
        if executor.admits(info.expected_load()) {
          order.report_active_build(&id)?;
          debug!(
            build = %id,
            load = executor.tracker().load(),
            artificial_load = executor.tracker().artificial_load(),
            "dispatching build"
          );

          let registry = registry.clone();
          let info = info.clone();
          let completions_tx = completions_tx.clone();
          executor.run_async(info.expected_load(), move || {
            // The receiver is gone only when the run has already been aborted.
            let _ = completions_tx.send(run_build(&registry, info));
          });
          continue;
        }
      }
      NextBuild::NotReady => {}
    }

    if let Ok(completion) = completions.try_recv() {
      complete_build(&mut order, completion, run_start, &mut report)?;
      continue;
    }

    // Wait for a completion or for the load to change.
    let completion = tokio::select! {
      Some(completion) = completions.recv() => Some(completion),
      _ = executor.load_changed() => None,
      _ = tokio::time::sleep(config.poll_interval) => None,
    };
    if let Some(completion) = completion {
      complete_build(&mut order, completion, run_start, &mut report)?;
    }
  }

  report.elapsed = run_start.elapsed();
  Ok(report)
}

/// Retire a finished build and check that it published exactly what it declared.
fn complete_build<O: BuildOrder<BuildId>>(
  order: &mut O,
  completion: BuildCompletion,
  run_start: Instant,
  report: &mut RunReport,
) -> Result<(), ExecuteError> {
  let id = completion.info.id().clone();
  order.report_completed_build(&id)?;

  if let Some(fault) = completion.fault {
    if let Some(message) = contract_violation(&fault) {
      return Err(ExecuteError::BadBuild { build: id, message });
    }
    error!(build = %id, error = %format!("{fault:#}"), "build failed");
    return Err(ExecuteError::BuildFailed { build: id, source: fault });
  }

  let declared = completion.info.production();
  let unpublished: Vec<String> = declared
    .difference(&completion.published)
    .map(ToString::to_string)
    .collect();
  if !unpublished.is_empty() {
    return Err(ExecuteError::BadBuild {
      build: id,
      message: format!("failed to publish: {}", unpublished.join(", ")),
    });
  }

  // The build context rejects such publications, so this only trips on a bug.
  let extraneous: Vec<String> = completion
    .published
    .difference(declared)
    .map(ToString::to_string)
    .collect();
  if !extraneous.is_empty() {
    return Err(ExecuteError::BadBuild {
      build: id,
      message: format!("published extraneous artifacts: {}", extraneous.join(", ")),
    });
  }

  let duration = completion.finished.saturating_duration_since(completion.started);
  info!(
    build = %id,
    elapsed_ms = duration.as_millis() as u64,
    changed = completion.changed,
    "build completed"
  );

  report.completed.push(CompletedBuild {
    id,
    started: completion.started.saturating_duration_since(run_start),
    finished: completion.finished.saturating_duration_since(run_start),
    duration,
    accomplishments: completion.accomplishments,
    changed: completion.changed,
    published: completion.published.into_iter().collect(),
  });

  Ok(())
}

/// Faults that mean the build broke its artifact contract rather than failed on its own.
fn contract_violation(fault: &anyhow::Error) -> Option<String> {
  if let Some(publish_error) = fault.downcast_ref::<PublishError>() {
    return Some(publish_error.to_string());
  }
  match fault.downcast_ref::<ArtifactError>() {
    Some(err @ ArtifactError::NotPublished(_)) => Some(format!("read before publication: {err}")),
    _ => None,
  }
}
