//! The artifact registry.
//!
//! Holds every declared artifact and build of one run, enforces uniqueness of their ids,
//! and answers the ownership questions asked when a build declares or publishes.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::build::{BuildAction, BuildDeclaration, BuildId, BuildInfo};

use super::types::{Artifact, ArtifactError, ArtifactHandle, ArtifactId};

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Errors raised by the registry while declaring or verifying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
  #[error("duplicate artifact: {0}")]
  DuplicateArtifact(ArtifactId),

  #[error("duplicate build: {0}")]
  DuplicateBuild(BuildId),

  #[error("no such artifact: {0}")]
  UnknownArtifact(ArtifactId),

  #[error("no such build: {0}")]
  UnknownBuild(BuildId),

  #[error("not an artifact of this registry: {0}")]
  ForeignArtifact(ArtifactId),

  #[error("two artifacts with the same id: {0}")]
  ConflictingArtifact(ArtifactId),

  #[error("{artifact} is not an artifact of build {build}")]
  NotProducedBy { artifact: ArtifactId, build: BuildId },

  #[error("{build} depends on artifact {artifact} that no build produces")]
  UnproducedDependency { build: BuildId, artifact: ArtifactId },

  #[error(transparent)]
  Artifact(#[from] ArtifactError),
}

/// Everything a closed declaration hands to the registry.
pub(crate) struct BuildRequest {
  pub namespace: String,
  pub action: Arc<dyn BuildAction>,
  pub dependencies: Vec<ArtifactHandle>,
  pub production: Vec<ArtifactHandle>,
  pub expected_duration: Option<Duration>,
  pub expected_load: f32,
}

#[derive(Default)]
struct RegistryState {
  artifacts: HashMap<ArtifactId, ArtifactHandle>,
  builds: HashMap<BuildId, Arc<BuildInfo>>,
  /// Build ids in declaration order.
  declared: Vec<BuildId>,
}

struct RegistryInner {
  id: u64,
  state: Mutex<RegistryState>,
}

/// Registry of all artifacts and builds declared for one run.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct ArtifactRegistry {
  inner: Arc<RegistryInner>,
}

impl Default for ArtifactRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl ArtifactRegistry {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(RegistryInner {
        id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
        state: Mutex::new(RegistryState::default()),
      }),
    }
  }

  /// Open a declaration for a new build in `namespace`.
  pub fn declare_new_build(&self, namespace: impl Into<String>) -> BuildDeclaration {
    BuildDeclaration::new(self.clone(), namespace.into())
  }

  /// Register a new artifact with value type `T`.
  ///
  /// Fails if an artifact with the same namespace and name is already registered.
  pub fn new_artifact<T: Any + Send + Sync>(
    &self,
    namespace: impl Into<String>,
    name: impl Into<String>,
  ) -> Result<Artifact<T>, RegistryError> {
    let id = ArtifactId::new(namespace, name);
    let handle = ArtifactHandle::new::<T>(id.clone(), self.inner.id);

    let mut state = self.lock();
    if state.artifacts.contains_key(&id) {
      return Err(RegistryError::DuplicateArtifact(id));
    }
    state.artifacts.insert(id, handle.clone());

    Ok(Artifact::from_handle(handle))
  }

  /// Verify that `artifact` is the instance this registry created for its id.
  pub fn verify_artifact(&self, artifact: &ArtifactHandle) -> Result<(), RegistryError> {
    let state = self.lock();
    self.verify_owned(&state, artifact)
  }

  /// Verify that `artifact` is owned by this registry and declared as production of `build`.
  pub fn verify_artifact_for_build(&self, artifact: &ArtifactHandle, build: &BuildId) -> Result<(), RegistryError> {
    let state = self.lock();
    self.verify_owned(&state, artifact)?;

    let info = state
      .builds
      .get(build)
      .ok_or_else(|| RegistryError::UnknownBuild(build.clone()))?;

    if !info.production().contains(artifact.id()) {
      return Err(RegistryError::NotProducedBy {
        artifact: artifact.id().clone(),
        build: build.clone(),
      });
    }

    Ok(())
  }

  /// Freeze a closed declaration into a build.
  ///
  /// Either everything is registered or, on error, nothing is.
  pub(crate) fn add_build(&self, request: BuildRequest) -> Result<Arc<BuildInfo>, RegistryError> {
    let BuildRequest {
      namespace,
      action,
      dependencies,
      production,
      expected_duration,
      expected_load,
    } = request;
    let id = BuildId::new(namespace, action.name());

    let mut state = self.lock();

    let mut dependency_ids = BTreeSet::new();
    let mut build_dependencies = BTreeSet::new();
    for dependency in &dependencies {
      self.verify_owned(&state, dependency)?;
      let producer = dependency
        .producing_build()
        .ok_or_else(|| RegistryError::UnproducedDependency {
          build: id.clone(),
          artifact: dependency.id().clone(),
        })?;
      dependency_ids.insert(dependency.id().clone());
      build_dependencies.insert(producer.clone());
    }

    if state.builds.contains_key(&id) {
      return Err(RegistryError::DuplicateBuild(id));
    }

    for artifact in &production {
      self.verify_owned(&state, artifact)?;
      if let Some(producer) = artifact.producing_build() {
        return Err(ArtifactError::ProducerAlreadySet {
          artifact: artifact.id().clone(),
          producer: producer.clone(),
        }
        .into());
      }
    }

    let mut production_ids = BTreeSet::new();
    for artifact in &production {
      artifact.set_producer(id.clone())?;
      production_ids.insert(artifact.id().clone());
    }

    let info = Arc::new(BuildInfo::new(
      id.clone(),
      action,
      dependency_ids,
      production_ids,
      build_dependencies,
      expected_duration,
      expected_load,
    ));

    debug!(
      build = %id,
      dependencies = info.dependencies().len(),
      production = info.production().len(),
      "declared build"
    );

    state.builds.insert(id.clone(), info.clone());
    state.declared.push(id);

    Ok(info)
  }

  /// All builds, in declaration order.
  pub fn builds(&self) -> Vec<Arc<BuildInfo>> {
    let state = self.lock();
    state
      .declared
      .iter()
      .filter_map(|id| state.builds.get(id).cloned())
      .collect()
  }

  pub fn build(&self, id: &BuildId) -> Option<Arc<BuildInfo>> {
    self.lock().builds.get(id).cloned()
  }

  /// All artifacts, sorted by id.
  pub fn artifacts(&self) -> Vec<ArtifactHandle> {
    let mut artifacts: Vec<ArtifactHandle> = self.lock().artifacts.values().cloned().collect();
    artifacts.sort_by(|a, b| a.id().cmp(b.id()));
    artifacts
  }

  pub fn artifact(&self, id: &ArtifactId) -> Option<ArtifactHandle> {
    self.lock().artifacts.get(id).cloned()
  }

  pub fn build_count(&self) -> usize {
    self.lock().builds.len()
  }

  fn verify_owned(&self, state: &RegistryState, artifact: &ArtifactHandle) -> Result<(), RegistryError> {
    if artifact.registry() != self.inner.id {
      return Err(RegistryError::ForeignArtifact(artifact.id().clone()));
    }

    let ours = state
      .artifacts
      .get(artifact.id())
      .ok_or_else(|| RegistryError::UnknownArtifact(artifact.id().clone()))?;

    if !ours.ptr_eq(artifact) {
      return Err(RegistryError::ConflictingArtifact(artifact.id().clone()));
    }

    Ok(())
  }

  fn lock(&self) -> MutexGuard<'_, RegistryState> {
    // Every critical section leaves the maps consistent, so a poisoned lock is still usable.
    self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl std::fmt::Debug for ArtifactRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let state = self.lock();
    f.debug_struct("ArtifactRegistry")
      .field("id", &self.inner.id)
      .field("artifacts", &state.artifacts.len())
      .field("builds", &state.builds.len())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::build::from_fn;

  fn request(namespace: &str, name: &'static str, dependencies: Vec<ArtifactHandle>, production: Vec<ArtifactHandle>) -> BuildRequest {
    BuildRequest {
      namespace: namespace.to_string(),
      action: Arc::new(from_fn(name, |_| Ok(()))),
      dependencies,
      production,
      expected_duration: None,
      expected_load: 1.0,
    }
  }

  #[test]
  fn duplicate_artifact_fails() {
    let registry = ArtifactRegistry::new();
    registry.new_artifact::<String>("core", "jar").unwrap();

    let err = registry.new_artifact::<u32>("core", "jar").unwrap_err();
    assert_eq!(err, RegistryError::DuplicateArtifact(ArtifactId::new("core", "jar")));

    // Same name in another namespace is a different artifact.
    registry.new_artifact::<String>("util", "jar").unwrap();
  }

  #[test]
  fn verify_rejects_foreign_artifacts() {
    let ours = ArtifactRegistry::new();
    let theirs = ArtifactRegistry::new();
    let jar = theirs.new_artifact::<String>("core", "jar").unwrap();

    assert_eq!(
      ours.verify_artifact(jar.handle()).unwrap_err(),
      RegistryError::ForeignArtifact(ArtifactId::new("core", "jar"))
    );
    theirs.verify_artifact(jar.handle()).unwrap();
  }

  #[test]
  fn verify_rejects_impostor_with_same_id() {
    let registry = ArtifactRegistry::new();
    registry.new_artifact::<String>("core", "jar").unwrap();
    let impostor = ArtifactHandle::new::<String>(ArtifactId::new("core", "jar"), registry.inner.id);

    assert_eq!(
      registry.verify_artifact(&impostor).unwrap_err(),
      RegistryError::ConflictingArtifact(ArtifactId::new("core", "jar"))
    );
  }

  #[test]
  fn add_build_derives_build_dependencies() {
    let registry = ArtifactRegistry::new();
    let sources = registry.new_artifact::<()>("core", "sources").unwrap();
    let classes = registry.new_artifact::<()>("core", "classes").unwrap();

    let scan = registry
      .add_build(request("core", "scan", vec![], vec![sources.handle().clone()]))
      .unwrap();
    let compile = registry
      .add_build(request(
        "core",
        "compile",
        vec![sources.handle().clone()],
        vec![classes.handle().clone()],
      ))
      .unwrap();

    assert!(scan.build_dependencies().is_empty());
    assert_eq!(
      compile.build_dependencies().iter().collect::<Vec<_>>(),
      vec![&BuildId::new("core", "scan")]
    );
    assert_eq!(sources.handle().producing_build(), Some(&BuildId::new("core", "scan")));
    assert_eq!(
      registry.builds().iter().map(|info| info.id().clone()).collect::<Vec<_>>(),
      vec![BuildId::new("core", "scan"), BuildId::new("core", "compile")]
    );
  }

  #[test]
  fn duplicate_build_fails_without_claiming_production() {
    let registry = ArtifactRegistry::new();
    let first = registry.new_artifact::<()>("core", "first").unwrap();
    let second = registry.new_artifact::<()>("core", "second").unwrap();

    registry
      .add_build(request("core", "compile", vec![], vec![first.handle().clone()]))
      .unwrap();
    let err = registry
      .add_build(request("core", "compile", vec![], vec![second.handle().clone()]))
      .unwrap_err();

    assert_eq!(err, RegistryError::DuplicateBuild(BuildId::new("core", "compile")));
    assert!(second.handle().producing_build().is_none());
    assert_eq!(registry.build_count(), 1);
  }

  #[test]
  fn dependency_without_producer_fails() {
    let registry = ArtifactRegistry::new();
    let orphan = registry.new_artifact::<()>("core", "orphan").unwrap();

    let err = registry
      .add_build(request("core", "consume", vec![orphan.handle().clone()], vec![]))
      .unwrap_err();

    assert_eq!(
      err,
      RegistryError::UnproducedDependency {
        build: BuildId::new("core", "consume"),
        artifact: ArtifactId::new("core", "orphan"),
      }
    );
  }

  #[test]
  fn verify_for_build_checks_production() {
    let registry = ArtifactRegistry::new();
    let jar = registry.new_artifact::<()>("core", "jar").unwrap();
    let docs = registry.new_artifact::<()>("core", "docs").unwrap();
    registry
      .add_build(request("core", "jar", vec![], vec![jar.handle().clone()]))
      .unwrap();
    registry
      .add_build(request("core", "javadoc", vec![], vec![docs.handle().clone()]))
      .unwrap();

    let build = BuildId::new("core", "jar");
    registry.verify_artifact_for_build(jar.handle(), &build).unwrap();
    assert_eq!(
      registry.verify_artifact_for_build(docs.handle(), &build).unwrap_err(),
      RegistryError::NotProducedBy {
        artifact: ArtifactId::new("core", "docs"),
        build,
      }
    );
    assert_eq!(
      registry
        .verify_artifact_for_build(jar.handle(), &BuildId::new("core", "ghost"))
        .unwrap_err(),
      RegistryError::UnknownBuild(BuildId::new("core", "ghost"))
    );
  }
}
