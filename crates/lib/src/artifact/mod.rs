//! Artifacts and their registry.
//!
//! An artifact is a typed, write-once value produced by exactly one build. The
//! [`ArtifactRegistry`] creates and owns every artifact of a run and checks that builds
//! only touch artifacts it handed out.
//!
//! # Submodules
//!
//! - `types` - Artifact ids, typed and type-erased handles
//! - `registry` - The registry and its ownership checks

mod registry;
mod types;

pub(crate) use registry::BuildRequest;
pub use registry::{ArtifactRegistry, RegistryError};
pub use types::{Artifact, ArtifactError, ArtifactHandle, ArtifactId};
