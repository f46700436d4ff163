//! Build declaration and the build-side runtime.
//!
//! A build is a named unit of work with a fixed set of input artifacts (its dependencies)
//! and output artifacts (its production). Builds are declared up front through a
//! [`BuildDeclaration`], frozen into a [`BuildInfo`], and later run by the executor with
//! a [`BuildContext`] through which they publish their production.
//!
//! # Submodules
//!
//! - `types` - Build ids, frozen build info and the [`BuildAction`] trait
//! - `declare` - The write-once declaration builder
//! - `context` - The context a running build publishes through
//! - `runner` - Runs one build action and collects what it did

mod context;
mod declare;
pub(crate) mod runner;
mod types;

pub use context::{BuildContext, BuildLogger, PublishError, Publication};
pub use declare::{BuildDeclaration, DeclareError, Declarator};
pub use types::*;
