use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::build::BuildId;

/// Unique key of an artifact across a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactId {
  namespace: String,
  name: String,
}

impl ArtifactId {
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

impl fmt::Display for ArtifactId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.namespace, self.name)
  }
}

/// Errors reading or publishing an artifact value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactError {
  #[error("artifact {0} has not been published")]
  NotPublished(ArtifactId),

  #[error("artifact {0} has already been published")]
  AlreadyPublished(ArtifactId),

  #[error("published value for artifact {artifact} has incompatible type {actual}: expected {expected}")]
  TypeMismatch {
    artifact: ArtifactId,
    expected: &'static str,
    actual: &'static str,
  },

  #[error("artifact {artifact} is already produced by {producer}")]
  ProducerAlreadySet { artifact: ArtifactId, producer: BuildId },
}

type Value = Arc<dyn Any + Send + Sync>;

/// Shared state of one artifact. Only the registry creates these.
struct ArtifactCell {
  id: ArtifactId,
  registry: u64,
  type_id: TypeId,
  type_name: &'static str,
  producer: OnceLock<BuildId>,
  value: OnceLock<Value>,
}

/// Type-erased handle to an artifact owned by a registry.
///
/// Clones refer to the same artifact; equality is by identity, never by structure.
#[derive(Clone)]
pub struct ArtifactHandle {
  cell: Arc<ArtifactCell>,
}

impl ArtifactHandle {
  pub(crate) fn new<T: Any + Send + Sync>(id: ArtifactId, registry: u64) -> Self {
    Self {
      cell: Arc::new(ArtifactCell {
        id,
        registry,
        type_id: TypeId::of::<T>(),
        type_name: std::any::type_name::<T>(),
        producer: OnceLock::new(),
        value: OnceLock::new(),
      }),
    }
  }

  pub fn id(&self) -> &ArtifactId {
    &self.cell.id
  }

  /// Name of the value type the artifact was declared with.
  pub fn value_type(&self) -> &'static str {
    self.cell.type_name
  }

  /// The build declared to produce this artifact, once that build is registered.
  pub fn producing_build(&self) -> Option<&BuildId> {
    self.cell.producer.get()
  }

  pub fn is_published(&self) -> bool {
    self.cell.value.get().is_some()
  }

  /// Whether both handles refer to the very same artifact instance.
  pub fn ptr_eq(&self, other: &ArtifactHandle) -> bool {
    Arc::ptr_eq(&self.cell, &other.cell)
  }

  pub(crate) fn registry(&self) -> u64 {
    self.cell.registry
  }

  pub(crate) fn set_producer(&self, build: BuildId) -> Result<(), ArtifactError> {
    self.cell.producer.set(build).map_err(|rejected| ArtifactError::ProducerAlreadySet {
      artifact: self.cell.id.clone(),
      producer: self.cell.producer.get().cloned().unwrap_or(rejected),
    })
  }

  /// Store the value. Succeeds exactly once per artifact.
  pub(crate) fn publish_value(&self, value: Value) -> Result<(), ArtifactError> {
    let actual = (*value).type_id();
    if actual != self.cell.type_id {
      return Err(ArtifactError::TypeMismatch {
        artifact: self.cell.id.clone(),
        expected: self.cell.type_name,
        actual: "<unknown>",
      });
    }

    self
      .cell
      .value
      .set(value)
      .map_err(|_| ArtifactError::AlreadyPublished(self.cell.id.clone()))
  }

  fn value(&self) -> Result<&Value, ArtifactError> {
    self
      .cell
      .value
      .get()
      .ok_or_else(|| ArtifactError::NotPublished(self.cell.id.clone()))
  }
}

impl PartialEq for ArtifactHandle {
  fn eq(&self, other: &Self) -> bool {
    self.ptr_eq(other)
  }
}

impl Eq for ArtifactHandle {}

impl fmt::Debug for ArtifactHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ArtifactHandle")
      .field("id", &self.cell.id)
      .field("type", &self.cell.type_name)
      .field("producer", &self.cell.producer.get())
      .field("published", &self.is_published())
      .finish()
  }
}

impl fmt::Display for ArtifactHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} of type {}", self.cell.id, self.cell.type_name)
  }
}

/// Typed handle to an artifact whose value is a `T`.
///
/// Obtained from a build declaration; the value becomes readable once the producing
/// build has published it.
pub struct Artifact<T> {
  handle: ArtifactHandle,
  _value: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> Artifact<T> {
  pub(crate) fn from_handle(handle: ArtifactHandle) -> Self {
    Self {
      handle,
      _value: PhantomData,
    }
  }

  pub fn id(&self) -> &ArtifactId {
    self.handle.id()
  }

  pub fn handle(&self) -> &ArtifactHandle {
    &self.handle
  }

  pub fn is_published(&self) -> bool {
    self.handle.is_published()
  }

  /// The published value.
  ///
  /// Fails with `NotPublished` until the producing build has published it.
  pub fn get(&self) -> Result<Arc<T>, ArtifactError> {
    let value = self.handle.value()?.clone();
    value.downcast::<T>().map_err(|_| ArtifactError::TypeMismatch {
      artifact: self.handle.id().clone(),
      expected: std::any::type_name::<T>(),
      actual: self.handle.value_type(),
    })
  }

  pub(crate) fn publish(&self, value: T) -> Result<(), ArtifactError> {
    self.handle.publish_value(Arc::new(value))
  }
}

impl<T> Clone for Artifact<T> {
  fn clone(&self) -> Self {
    Self {
      handle: self.handle.clone(),
      _value: PhantomData,
    }
  }
}

impl<T> fmt::Debug for Artifact<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("Artifact").field(&self.handle).finish()
  }
}

impl<T> fmt::Display for Artifact<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&self.handle, f)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn artifact<T: Any + Send + Sync>(name: &str) -> Artifact<T> {
    Artifact::from_handle(ArtifactHandle::new::<T>(ArtifactId::new("core", name), 0))
  }

  #[test]
  fn id_display_is_namespace_colon_name() {
    assert_eq!(ArtifactId::new("core", "classes").to_string(), "core:classes");
  }

  #[test]
  fn read_before_publish_fails() {
    let jar = artifact::<String>("jar");
    assert_eq!(
      jar.get().unwrap_err(),
      ArtifactError::NotPublished(ArtifactId::new("core", "jar"))
    );
    assert!(!jar.is_published());
  }

  #[test]
  fn publish_then_read_returns_value() {
    let jar = artifact::<String>("jar");
    jar.publish("target/core.jar".to_string()).unwrap();

    assert!(jar.is_published());
    assert_eq!(jar.get().unwrap().as_str(), "target/core.jar");
    // Clones see the same value.
    assert_eq!(jar.clone().get().unwrap().as_str(), "target/core.jar");
  }

  #[test]
  fn second_publish_fails_and_keeps_first_value() {
    let count = artifact::<u32>("count");
    count.publish(1).unwrap();

    assert_eq!(
      count.publish(2).unwrap_err(),
      ArtifactError::AlreadyPublished(ArtifactId::new("core", "count"))
    );
    assert_eq!(*count.get().unwrap(), 1);
  }

  #[test]
  fn incompatible_value_type_is_rejected() {
    let handle = ArtifactHandle::new::<String>(ArtifactId::new("core", "jar"), 0);
    let err = handle.publish_value(Arc::new(42_u32)).unwrap_err();

    assert!(matches!(err, ArtifactError::TypeMismatch { .. }));
    assert!(!handle.is_published());
  }

  #[test]
  fn unit_artifacts_mark_completion() {
    let done = artifact::<()>("done");
    done.publish(()).unwrap();
    assert!(done.get().is_ok());
  }

  #[test]
  fn producer_is_set_once() {
    let handle = ArtifactHandle::new::<()>(ArtifactId::new("core", "x"), 0);
    handle.set_producer(BuildId::new("core", "first")).unwrap();

    let err = handle.set_producer(BuildId::new("core", "second")).unwrap_err();
    assert_eq!(
      err,
      ArtifactError::ProducerAlreadySet {
        artifact: ArtifactId::new("core", "x"),
        producer: BuildId::new("core", "first"),
      }
    );
    assert_eq!(handle.producing_build(), Some(&BuildId::new("core", "first")));
  }

  #[test]
  fn handles_compare_by_identity() {
    let a = ArtifactHandle::new::<()>(ArtifactId::new("core", "x"), 0);
    let b = ArtifactHandle::new::<()>(ArtifactId::new("core", "x"), 0);

    assert_eq!(a, a.clone());
    assert_ne!(a, b);
  }
}
