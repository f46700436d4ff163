//! Declaring builds.
//!
//! A [`BuildDeclaration`] collects the dependencies, production and action of one build.
//! Closing it freezes everything into a [`BuildInfo`] registered with the
//! [`ArtifactRegistry`]; afterwards every mutation fails.
//!
//! Dependencies can only name artifacts whose producing build is already closed, so a
//! build can never depend on a build declared after it. This keeps the build graph
//! free of loops.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::artifact::{Artifact, ArtifactHandle, ArtifactRegistry, BuildRequest, RegistryError};

use super::types::{BuildAction, BuildId, BuildInfo};

/// Errors raised while declaring a build.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeclareError {
  #[error("cannot {operation}: declaration of build in namespace {namespace} is closed")]
  Closed {
    namespace: String,
    operation: &'static str,
  },

  #[error("build declared in namespace {namespace} has no action")]
  MissingAction { namespace: String },

  #[error(transparent)]
  Registry(#[from] RegistryError),
}

/// Declares builds for one namespace.
#[derive(Debug, Clone)]
pub struct Declarator {
  registry: ArtifactRegistry,
  namespace: String,
}

impl Declarator {
  pub fn new(registry: ArtifactRegistry, namespace: impl Into<String>) -> Self {
    Self {
      registry,
      namespace: namespace.into(),
    }
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub fn registry(&self) -> &ArtifactRegistry {
    &self.registry
  }

  pub fn declare_new_build(&self) -> BuildDeclaration {
    self.registry.declare_new_build(self.namespace.clone())
  }
}

/// Write-once builder for a single build.
pub struct BuildDeclaration {
  registry: ArtifactRegistry,
  namespace: String,
  dependencies: Vec<ArtifactHandle>,
  production: Vec<ArtifactHandle>,
  action: Option<Arc<dyn BuildAction>>,
  expected_duration: Option<Duration>,
  expected_load: f32,
  closed: bool,
}

impl BuildDeclaration {
  pub(crate) fn new(registry: ArtifactRegistry, namespace: String) -> Self {
    Self {
      registry,
      namespace,
      dependencies: Vec::new(),
      production: Vec::new(),
      action: None,
      expected_duration: None,
      expected_load: 1.0,
      closed: false,
    }
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  /// Declare that the build reads `artifact`.
  pub fn depends_on<T>(&mut self, artifact: &Artifact<T>) -> Result<&mut Self, DeclareError>
  where
    T: Any + Send + Sync,
  {
    self.ensure_open("add a dependency")?;
    if !self.dependencies.iter().any(|known| known.ptr_eq(artifact.handle())) {
      self.dependencies.push(artifact.handle().clone());
    }
    Ok(self)
  }

  /// Register a new artifact in this namespace that the build must publish.
  pub fn produces_artifact<T>(&mut self, name: impl Into<String>) -> Result<Artifact<T>, DeclareError>
  where
    T: Any + Send + Sync,
  {
    self.ensure_open("declare an artifact")?;
    let artifact = self.registry.new_artifact::<T>(self.namespace.clone(), name)?;
    self.production.push(artifact.handle().clone());
    Ok(artifact)
  }

  /// Set the action run for this build. The action's name becomes the build name.
  pub fn for_build(&mut self, action: impl BuildAction + 'static) -> Result<&mut Self, DeclareError> {
    self.for_shared_build(Arc::new(action))
  }

  pub fn for_shared_build(&mut self, action: Arc<dyn BuildAction>) -> Result<&mut Self, DeclareError> {
    self.ensure_open("set the action")?;
    self.action = Some(action);
    Ok(self)
  }

  /// Estimated wall time, used to rank builds on the critical path.
  pub fn expected_duration(&mut self, duration: Duration) -> Result<&mut Self, DeclareError> {
    self.ensure_open("set the expected duration")?;
    self.expected_duration = Some(duration);
    Ok(self)
  }

  /// Load the build puts on the machine while it runs, in CPUs. Defaults to 1.
  pub fn expected_load(&mut self, load: f32) -> Result<&mut Self, DeclareError> {
    self.ensure_open("set the expected load")?;
    self.expected_load = load.max(0.0);
    Ok(self)
  }

  /// Freeze the declaration and register the build.
  ///
  /// The declaration is closed even when registration fails.
  pub fn close(&mut self) -> Result<BuildId, DeclareError> {
    self.close_info().map(|info| info.id().clone())
  }

  pub(crate) fn close_info(&mut self) -> Result<Arc<BuildInfo>, DeclareError> {
    self.ensure_open("close")?;
    self.closed = true;

    let action = self.action.take().ok_or_else(|| DeclareError::MissingAction {
      namespace: self.namespace.clone(),
    })?;

    let info = self.registry.add_build(BuildRequest {
      namespace: self.namespace.clone(),
      action,
      dependencies: std::mem::take(&mut self.dependencies),
      production: std::mem::take(&mut self.production),
      expected_duration: self.expected_duration,
      expected_load: self.expected_load,
    })?;

    Ok(info)
  }

  fn ensure_open(&self, operation: &'static str) -> Result<(), DeclareError> {
    if self.closed {
      return Err(DeclareError::Closed {
        namespace: self.namespace.clone(),
        operation,
      });
    }
    Ok(())
  }
}
