//! What a running build sees.
//!
//! A [`BuildContext`] is handed to [`BuildAction::build`](super::BuildAction::build). It
//! names the build, offers a logger and elapsed time, and is the only way to publish the
//! build's production.

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{Span, debug, info, warn};

use crate::artifact::{Artifact, ArtifactError, ArtifactId, ArtifactRegistry, RegistryError};

use super::types::{BuildId, BuildInfo};

/// Errors raised when a build publishes an artifact.
///
/// All of them are contract violations of the publishing build.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
  #[error("{build} published {artifact} after it finished")]
  Finished { build: BuildId, artifact: ArtifactId },

  #[error("{build} cannot publish {artifact}: {source}")]
  Rejected {
    build: BuildId,
    artifact: ArtifactId,
    #[source]
    source: RegistryError,
  },

  #[error("{build} published {artifact} twice")]
  Twice { build: BuildId, artifact: ArtifactId },

  #[error("{build} failed to publish {artifact}: {source}")]
  Artifact {
    build: BuildId,
    artifact: ArtifactId,
    #[source]
    source: ArtifactError,
  },
}

impl PublishError {
  /// The build that attempted the publication.
  pub fn build(&self) -> &BuildId {
    match self {
      PublishError::Finished { build, .. }
      | PublishError::Rejected { build, .. }
      | PublishError::Twice { build, .. }
      | PublishError::Artifact { build, .. } => build,
    }
  }
}

#[derive(Default)]
struct PublishState {
  published: BTreeSet<ArtifactId>,
  accomplishments: Vec<String>,
  changed: bool,
  finished: bool,
}

/// What a build did, collected once its action returned.
#[derive(Debug, Clone, Default)]
pub(crate) struct BuildOutcome {
  pub published: BTreeSet<ArtifactId>,
  pub accomplishments: Vec<String>,
  pub changed: bool,
}

/// Build-scoped context passed to a running build action.
pub struct BuildContext {
  registry: ArtifactRegistry,
  info: Arc<BuildInfo>,
  started: Instant,
  span: Span,
  state: Mutex<PublishState>,
}

impl BuildContext {
  pub(crate) fn new(registry: ArtifactRegistry, info: Arc<BuildInfo>, span: Span) -> Self {
    Self {
      registry,
      info,
      started: Instant::now(),
      span,
      state: Mutex::new(PublishState::default()),
    }
  }

  pub fn id(&self) -> &BuildId {
    self.info.id()
  }

  pub fn namespace(&self) -> &str {
    self.info.id().namespace()
  }

  pub fn info(&self) -> &BuildInfo {
    &self.info
  }

  /// Logger writing into this build's span.
  pub fn log(&self) -> BuildLogger {
    BuildLogger {
      span: self.span.clone(),
    }
  }

  /// Time since the build started.
  pub fn elapsed(&self) -> Duration {
    self.started.elapsed()
  }

  pub(crate) fn started(&self) -> Instant {
    self.started
  }

  /// Start publishing `artifact`. Nothing happens until [`Publication::publish`].
  pub fn new_publication_of<T>(&self, artifact: &Artifact<T>) -> Publication<'_, T>
  where
    T: Any + Send + Sync,
  {
    Publication {
      ctx: self,
      artifact: artifact.clone(),
      message: None,
      changed: true,
    }
  }

  fn publish<T>(&self, artifact: &Artifact<T>, value: T, message: Option<String>, changed: bool) -> Result<(), PublishError>
  where
    T: Any + Send + Sync,
  {
    let build = self.id().clone();
    let id = artifact.id().clone();

    // Held across the checks so two threads of one build cannot both pass them.
    let mut state = self.lock();
    if state.finished {
      return Err(PublishError::Finished { build, artifact: id });
    }

    self
      .registry
      .verify_artifact_for_build(artifact.handle(), &build)
      .map_err(|source| PublishError::Rejected {
        build: build.clone(),
        artifact: id.clone(),
        source,
      })?;

    if state.published.contains(&id) {
      return Err(PublishError::Twice { build, artifact: id });
    }

    artifact.publish(value).map_err(|source| PublishError::Artifact {
      build: build.clone(),
      artifact: id.clone(),
      source,
    })?;

    state.published.insert(id.clone());
    state.changed |= changed;
    if let Some(message) = message {
      self.span.in_scope(|| info!(artifact = %id, "{}", message));
      state.accomplishments.push(message);
    } else {
      self.span.in_scope(|| debug!(artifact = %id, changed, "published"));
    }

    Ok(())
  }

  /// Close the context. Later publications fail with [`PublishError::Finished`].
  pub(crate) fn finish(&self) -> BuildOutcome {
    let mut state = self.lock();
    state.finished = true;
    BuildOutcome {
      published: state.published.clone(),
      accomplishments: state.accomplishments.clone(),
      // A build without production counts as changed.
      changed: state.published.is_empty() || state.changed,
    }
  }

  fn lock(&self) -> MutexGuard<'_, PublishState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl std::fmt::Debug for BuildContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("BuildContext")
      .field("build", self.id())
      .field("elapsed", &self.elapsed())
      .finish_non_exhaustive()
  }
}

/// A pending publication of one artifact.
#[must_use = "nothing is published until `publish` is called"]
pub struct Publication<'a, T> {
  ctx: &'a BuildContext,
  artifact: Artifact<T>,
  message: Option<String>,
  changed: bool,
}

impl<T: Any + Send + Sync> Publication<'_, T> {
  /// Report `message` as an accomplishment of the build.
  pub fn log(mut self, message: impl Into<String>) -> Self {
    self.message = Some(message.into());
    self
  }

  /// Like [`log`](Self::log), suffixed with the time the build has taken so far.
  pub fn log_with_duration(self, message: impl AsRef<str>) -> Self {
    let seconds = self.ctx.elapsed().as_secs_f64();
    self.log(format!("{} in {:.3} s", message.as_ref(), seconds))
  }

  /// Whether the published value differs from what an earlier run produced.
  pub fn has_changed(mut self, changed: bool) -> Self {
    self.changed = changed;
    self
  }

  pub fn publish(self, value: T) -> Result<(), PublishError> {
    self.ctx.publish(&self.artifact, value, self.message, self.changed)
  }
}

/// Emits log events inside the span of the running build.
#[derive(Debug, Clone)]
pub struct BuildLogger {
  span: Span,
}

impl BuildLogger {
  pub fn info(&self, message: &str) {
    self.span.in_scope(|| info!("{}", message));
  }

  pub fn debug(&self, message: &str) {
    self.span.in_scope(|| debug!("{}", message));
  }

  pub fn warn(&self, message: &str) {
    self.span.in_scope(|| warn!("{}", message));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::build::from_fn;
  use tracing_test::traced_test;

  struct Fixture {
    registry: ArtifactRegistry,
    info: Arc<BuildInfo>,
    jar: Artifact<String>,
    docs: Artifact<String>,
  }

  fn fixture() -> Fixture {
    let registry = ArtifactRegistry::new();

    let mut jar_build = registry.declare_new_build("core");
    let jar = jar_build.produces_artifact::<String>("jar").unwrap();
    jar_build.for_build(from_fn("jar", |_| Ok(()))).unwrap();
    let info = jar_build.close_info().unwrap();

    let mut docs_build = registry.declare_new_build("core");
    let docs = docs_build.produces_artifact::<String>("docs").unwrap();
    docs_build.for_build(from_fn("javadoc", |_| Ok(()))).unwrap();
    docs_build.close().unwrap();

    Fixture {
      registry,
      info,
      jar,
      docs,
    }
  }

  fn context(fixture: &Fixture) -> BuildContext {
    BuildContext::new(fixture.registry.clone(), fixture.info.clone(), Span::none())
  }

  #[test]
  fn publish_declared_artifact() {
    let fixture = fixture();
    let ctx = context(&fixture);

    ctx
      .new_publication_of(&fixture.jar)
      .log("packed core.jar")
      .publish("core.jar".to_string())
      .unwrap();

    assert_eq!(fixture.jar.get().unwrap().as_str(), "core.jar");
    let outcome = ctx.finish();
    assert_eq!(outcome.published.len(), 1);
    assert_eq!(outcome.accomplishments, vec!["packed core.jar".to_string()]);
    assert!(outcome.changed);
  }

  #[test]
  fn publishing_foreign_production_is_rejected() {
    let fixture = fixture();
    let ctx = context(&fixture);

    let err = ctx
      .new_publication_of(&fixture.docs)
      .publish("docs".to_string())
      .unwrap_err();

    assert!(matches!(err, PublishError::Rejected { .. }));
    assert_eq!(err.build(), &BuildId::new("core", "jar"));
    assert!(!fixture.docs.is_published());
  }

  #[test]
  fn publishing_twice_is_rejected() {
    let fixture = fixture();
    let ctx = context(&fixture);

    ctx.new_publication_of(&fixture.jar).publish("a".to_string()).unwrap();
    let err = ctx
      .new_publication_of(&fixture.jar)
      .publish("b".to_string())
      .unwrap_err();

    assert_eq!(
      err,
      PublishError::Twice {
        build: BuildId::new("core", "jar"),
        artifact: ArtifactId::new("core", "jar"),
      }
    );
    assert_eq!(fixture.jar.get().unwrap().as_str(), "a");
  }

  #[test]
  fn publishing_after_finish_is_rejected() {
    let fixture = fixture();
    let ctx = context(&fixture);
    ctx.finish();

    let err = ctx.new_publication_of(&fixture.jar).publish("late".to_string()).unwrap_err();
    assert!(matches!(err, PublishError::Finished { .. }));
  }

  #[test]
  fn unchanged_publications_report_unchanged() {
    let fixture = fixture();
    let ctx = context(&fixture);

    ctx
      .new_publication_of(&fixture.jar)
      .has_changed(false)
      .publish("same".to_string())
      .unwrap();

    assert!(!ctx.finish().changed);
  }

  #[test]
  fn log_with_duration_appends_seconds() {
    let fixture = fixture();
    let ctx = context(&fixture);

    ctx
      .new_publication_of(&fixture.jar)
      .log_with_duration("compiled 3 classes")
      .publish("x".to_string())
      .unwrap();

    let outcome = ctx.finish();
    let message = &outcome.accomplishments[0];
    assert!(message.starts_with("compiled 3 classes in "));
    assert!(message.ends_with(" s"));
  }

  #[test]
  #[traced_test]
  fn accomplishments_are_logged() {
    let fixture = fixture();
    let ctx = context(&fixture);

    ctx.log().info("packing");
    ctx
      .new_publication_of(&fixture.jar)
      .log("packed core.jar")
      .publish("core.jar".to_string())
      .unwrap();

    assert!(logs_contain("packing"));
    assert!(logs_contain("packed core.jar"));
  }
}
