use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactId;

use super::context::BuildContext;

/// Unique key of a declared build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildId {
  namespace: String,
  name: String,
}

impl BuildId {
  pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      namespace: namespace.into(),
      name: name.into(),
    }
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

impl fmt::Display for BuildId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.namespace, self.name)
  }
}

/// The executable unit of a build.
///
/// `build` runs on a worker thread. It reads its dependencies through the artifacts it
/// captured at declaration time and publishes its production through `ctx`. Returning an
/// error aborts the whole run.
pub trait BuildAction: Send + Sync {
  /// Name of the build within its namespace.
  fn name(&self) -> String;

  fn build(&self, ctx: &BuildContext) -> anyhow::Result<()>;
}

/// A [`BuildAction`] backed by a closure. See [`from_fn`].
pub struct FnBuild<F> {
  name: String,
  f: F,
}

impl<F> BuildAction for FnBuild<F>
where
  F: Fn(&BuildContext) -> anyhow::Result<()> + Send + Sync,
{
  fn name(&self) -> String {
    self.name.clone()
  }

  fn build(&self, ctx: &BuildContext) -> anyhow::Result<()> {
    (self.f)(ctx)
  }
}

/// Adapt a closure into a named build action.
pub fn from_fn<F>(name: impl Into<String>, f: F) -> FnBuild<F>
where
  F: Fn(&BuildContext) -> anyhow::Result<()> + Send + Sync,
{
  FnBuild { name: name.into(), f }
}

/// A frozen build declaration.
///
/// Created once when its declaration is closed, immutable afterwards.
pub struct BuildInfo {
  id: BuildId,
  action: Arc<dyn BuildAction>,
  dependencies: BTreeSet<ArtifactId>,
  production: BTreeSet<ArtifactId>,
  build_dependencies: BTreeSet<BuildId>,
  expected_duration: Option<Duration>,
  expected_load: f32,
}

impl BuildInfo {
  pub(crate) fn new(
    id: BuildId,
    action: Arc<dyn BuildAction>,
    dependencies: BTreeSet<ArtifactId>,
    production: BTreeSet<ArtifactId>,
    build_dependencies: BTreeSet<BuildId>,
    expected_duration: Option<Duration>,
    expected_load: f32,
  ) -> Self {
    Self {
      id,
      action,
      dependencies,
      production,
      build_dependencies,
      expected_duration,
      expected_load,
    }
  }

  pub fn id(&self) -> &BuildId {
    &self.id
  }

  pub fn action(&self) -> &Arc<dyn BuildAction> {
    &self.action
  }

  /// Artifacts the build reads.
  pub fn dependencies(&self) -> &BTreeSet<ArtifactId> {
    &self.dependencies
  }

  /// Artifacts the build must publish, all of them and nothing else.
  pub fn production(&self) -> &BTreeSet<ArtifactId> {
    &self.production
  }

  /// Builds producing the artifacts in [`dependencies`](Self::dependencies).
  pub fn build_dependencies(&self) -> &BTreeSet<BuildId> {
    &self.build_dependencies
  }

  pub fn expected_duration(&self) -> Option<Duration> {
    self.expected_duration
  }

  pub fn expected_load(&self) -> f32 {
    self.expected_load
  }
}

impl fmt::Debug for BuildInfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BuildInfo")
      .field("id", &self.id)
      .field("dependencies", &self.dependencies)
      .field("production", &self.production)
      .field("build_dependencies", &self.build_dependencies)
      .field("expected_duration", &self.expected_duration)
      .field("expected_load", &self.expected_load)
      .finish_non_exhaustive()
  }
}
