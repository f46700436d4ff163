//! Types for executing a declared build graph.
//!
//! This module defines the configuration, the error type and the report of a run.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::artifact::ArtifactId;
use crate::build::BuildId;
use crate::schedule::ScheduleError;

use super::load::TargetLoad;

/// Configuration for a run.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// How many CPUs to keep busy.
  pub target_load: TargetLoad,
  /// Time between two load samples.
  pub sample_interval: Duration,
  /// Longest time the run loop sleeps before re-checking admission.
  pub poll_interval: Duration,
  /// Duration assumed for builds declared without an expected duration.
  pub default_build_duration: Duration,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      target_load: TargetLoad::default(),
      sample_interval: Duration::from_millis(100),
      poll_interval: Duration::from_millis(50),
      default_build_duration: Duration::from_millis(100),
    }
  }
}

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum ExecuteError {
  /// The declared builds do not form a valid graph, or the scheduler was misused.
  #[error("scheduling failed: {0}")]
  Schedule(#[from] ScheduleError),

  /// The action of a build returned an error or panicked.
  #[error("build {build} failed")]
  BuildFailed {
    build: BuildId,
    #[source]
    source: anyhow::Error,
  },

  /// A build broke its artifact contract.
  #[error("bad build {build}: {message}")]
  BadBuild { build: BuildId, message: String },

  /// The scheduler handed out a build that was never declared.
  #[error("no such build: {0}")]
  UnknownBuild(BuildId),
}

impl ExecuteError {
  /// The build that caused the run to abort, if any.
  pub fn build(&self) -> Option<&BuildId> {
    match self {
      ExecuteError::BuildFailed { build, .. } | ExecuteError::BadBuild { build, .. } => Some(build),
      ExecuteError::UnknownBuild(build) => Some(build),
      ExecuteError::Schedule(_) => None,
    }
  }
}

/// One build that completed during a run.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedBuild {
  pub id: BuildId,
  /// When the action started, relative to the start of the run.
  pub started: Duration,
  /// When the action returned, relative to the start of the run.
  pub finished: Duration,
  pub duration: Duration,
  pub accomplishments: Vec<String>,
  pub changed: bool,
  pub published: Vec<ArtifactId>,
}

/// Result of a successful run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
  /// Builds in completion order.
  pub completed: Vec<CompletedBuild>,
  pub elapsed: Duration,
}

impl RunReport {
  pub fn get(&self, id: &BuildId) -> Option<&CompletedBuild> {
    self.completed.iter().find(|build| &build.id == id)
  }

  /// Number of builds that reported a changed outcome.
  pub fn changed(&self) -> usize {
    self.completed.iter().filter(|build| build.changed).count()
  }
}
