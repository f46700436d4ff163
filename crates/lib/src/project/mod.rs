//! Project files.
//!
//! A project is a directory holding a `jake.toml` that lists shell-command builds:
//!
//! ```toml
//! namespace = "core"
//!
//! [[build]]
//! name = "compile"
//! command = "make classes && echo target/classes"
//! produces = ["classes"]
//! expected_duration_ms = 2000
//!
//! [[build]]
//! namespace = "app"
//! name = "jar"
//! command = "jar cf app.jar -C $JAKE_DEP_CORE_CLASSES . && echo app.jar"
//! depends_on = ["core:classes"]
//! produces = ["jar"]
//! ```
//!
//! Builds are declared in file order, so a build can only depend on artifacts produced
//! by builds listed above it.
//!
//! # Submodules
//!
//! - [`cmd`] - The shell command build action

pub mod cmd;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::artifact::{Artifact, ArtifactId, ArtifactRegistry};
use crate::build::DeclareError;

pub use cmd::{CmdBuild, CmdError};

/// Name of the project file in the project root.
pub const PROJECT_FILE: &str = "jake.toml";

#[derive(Debug, Error)]
pub enum ProjectError {
  #[error("failed to read {path}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse {path}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },

  #[error("build {build} has no namespace and the project sets no default")]
  MissingNamespace { build: String },

  #[error("build {build} depends on {artifact}, which no earlier build produces")]
  UnknownArtifact { build: String, artifact: String },

  #[error("invalid declaration of build {build}")]
  Declare {
    build: String,
    #[source]
    source: DeclareError,
  },
}

/// One `[[build]]` table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildEntry {
  pub namespace: Option<String>,
  pub name: String,
  pub command: String,
  #[serde(default)]
  pub depends_on: Vec<String>,
  #[serde(default)]
  pub produces: Vec<String>,
  pub expected_duration_ms: Option<u64>,
  pub expected_load: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectFile {
  namespace: Option<String>,
  #[serde(default, rename = "build")]
  builds: Vec<BuildEntry>,
}

/// A parsed project file.
#[derive(Debug, Clone)]
pub struct Project {
  root: PathBuf,
  file: ProjectFile,
}

impl Project {
  /// Read `jake.toml` from `root`.
  pub fn load(root: &Path) -> Result<Self, ProjectError> {
    let path = root.join(PROJECT_FILE);
    let text = std::fs::read_to_string(&path).map_err(|source| ProjectError::Read {
      path: path.clone(),
      source,
    })?;
    let project = Self::parse(root, &text).map_err(|err| match err {
      ProjectError::Parse { source, .. } => ProjectError::Parse { path, source },
      other => other,
    })?;
    debug!(root = %root.display(), builds = project.builds().len(), "loaded project");
    Ok(project)
  }

  /// Parse project file contents for a project rooted at `root`.
  pub fn parse(root: &Path, text: &str) -> Result<Self, ProjectError> {
    let file: ProjectFile = toml::from_str(text).map_err(|source| ProjectError::Parse {
      path: PathBuf::from(PROJECT_FILE),
      source,
    })?;
    Ok(Self {
      root: root.to_path_buf(),
      file,
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn builds(&self) -> &[BuildEntry] {
    &self.file.builds
  }

  /// Declare every build of the project in `registry`, in file order.
  ///
  /// Returns the declared artifacts by id.
  pub fn declare(&self, registry: &ArtifactRegistry) -> Result<BTreeMap<ArtifactId, Artifact<String>>, ProjectError> {
    let mut artifacts: BTreeMap<ArtifactId, Artifact<String>> = BTreeMap::new();

    for entry in &self.file.builds {
      let namespace = entry
        .namespace
        .as_deref()
        .or(self.file.namespace.as_deref())
        .ok_or_else(|| ProjectError::MissingNamespace {
          build: entry.name.clone(),
        })?;
      let label = format!("{namespace}:{}", entry.name);
      let declare_error = |source| ProjectError::Declare {
        build: label.clone(),
        source,
      };

      let mut declaration = registry.declare_new_build(namespace);

      let mut dependencies = Vec::with_capacity(entry.depends_on.len());
      for reference in &entry.depends_on {
        let id = parse_reference(namespace, reference);
        let artifact = artifacts.get(&id).ok_or_else(|| ProjectError::UnknownArtifact {
          build: label.clone(),
          artifact: id.to_string(),
        })?;
        declaration.depends_on(artifact).map_err(declare_error)?;
        dependencies.push(artifact.clone());
      }

      let mut production = Vec::with_capacity(entry.produces.len());
      for name in &entry.produces {
        production.push(declaration.produces_artifact::<String>(name.as_str()).map_err(declare_error)?);
      }

      if let Some(ms) = entry.expected_duration_ms {
        declaration
          .expected_duration(Duration::from_millis(ms))
          .map_err(declare_error)?;
      }
      if let Some(load) = entry.expected_load {
        declaration.expected_load(load).map_err(declare_error)?;
      }

      declaration
        .for_build(CmdBuild::new(
          entry.name.clone(),
          entry.command.clone(),
          self.root.clone(),
          dependencies,
          production.clone(),
        ))
        .map_err(declare_error)?;
      declaration.close().map_err(declare_error)?;

      for artifact in production {
        artifacts.insert(artifact.id().clone(), artifact);
      }
    }

    info!(builds = self.file.builds.len(), artifacts = artifacts.len(), "declared project builds");
    Ok(artifacts)
  }
}

/// Resolve `ns:name`, or a bare `name` within `namespace`.
fn parse_reference(namespace: &str, reference: &str) -> ArtifactId {
  match reference.split_once(':') {
    Some((ns, name)) => ArtifactId::new(ns, name),
    None => ArtifactId::new(namespace, reference),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::artifact::RegistryError;
  use crate::build::BuildId;
  use tempfile::TempDir;

  const PROJECT: &str = r#"
namespace = "core"

[[build]]
name = "sources"
command = "echo src"
produces = ["sources"]

[[build]]
name = "compile"
command = "echo classes"
depends_on = ["sources"]
produces = ["classes"]
expected_duration_ms = 1500
expected_load = 2.0

[[build]]
namespace = "app"
name = "jar"
command = "echo app.jar"
depends_on = ["core:classes"]
produces = ["jar"]
"#;

  #[test]
  fn parses_and_declares_in_order() {
    let project = Project::parse(Path::new("."), PROJECT).unwrap();
    assert_eq!(project.builds().len(), 3);

    let registry = ArtifactRegistry::new();
    let artifacts = project.declare(&registry).unwrap();

    assert_eq!(artifacts.len(), 3);
    let compile = registry.build(&BuildId::new("core", "compile")).unwrap();
    assert_eq!(compile.expected_duration(), Some(Duration::from_millis(1500)));
    assert_eq!(compile.expected_load(), 2.0);
    let jar = registry.build(&BuildId::new("app", "jar")).unwrap();
    assert!(jar.build_dependencies().contains(&BuildId::new("core", "compile")));
  }

  #[test]
  fn forward_reference_is_rejected() {
    let text = r#"
[[build]]
namespace = "core"
name = "jar"
command = "true"
depends_on = ["classes"]

[[build]]
namespace = "core"
name = "compile"
command = "true"
produces = ["classes"]
"#;
    let project = Project::parse(Path::new("."), text).unwrap();
    let err = project.declare(&ArtifactRegistry::new()).unwrap_err();

    assert!(matches!(
      err,
      ProjectError::UnknownArtifact { ref build, ref artifact } if build == "core:jar" && artifact == "core:classes"
    ));
  }

  #[test]
  fn duplicate_build_is_rejected() {
    let text = r#"
namespace = "core"

[[build]]
name = "compile"
command = "true"

[[build]]
name = "compile"
command = "true"
"#;
    let project = Project::parse(Path::new("."), text).unwrap();
    let err = project.declare(&ArtifactRegistry::new()).unwrap_err();

    assert!(matches!(
      err,
      ProjectError::Declare {
        source: DeclareError::Registry(RegistryError::DuplicateBuild(_)),
        ..
      }
    ));
  }

  #[test]
  fn missing_namespace_is_rejected() {
    let text = r#"
[[build]]
name = "compile"
command = "true"
"#;
    let project = Project::parse(Path::new("."), text).unwrap();
    assert!(matches!(
      project.declare(&ArtifactRegistry::new()),
      Err(ProjectError::MissingNamespace { .. })
    ));
  }

  #[test]
  fn unknown_fields_fail_to_parse() {
    let text = r#"
[[build]]
name = "compile"
commmand = "true"
"#;
    assert!(matches!(
      Project::parse(Path::new("."), text),
      Err(ProjectError::Parse { .. })
    ));
  }

  #[test]
  fn load_reads_project_file() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join(PROJECT_FILE), PROJECT).unwrap();

    let project = Project::load(temp_dir.path()).unwrap();
    assert_eq!(project.root(), temp_dir.path());
    assert_eq!(project.builds()[2].name, "jar");

    let missing = TempDir::new().unwrap();
    assert!(matches!(Project::load(missing.path()), Err(ProjectError::Read { .. })));
  }

  #[cfg(unix)]
  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn command_builds_pass_values_downstream() {
    let temp_dir = TempDir::new().unwrap();
    let text = r#"
namespace = "core"

[[build]]
name = "version"
command = "echo 1.2.3"
produces = ["version"]

[[build]]
name = "banner"
command = "echo \"$JAKE_BUILD of $JAKE_NAMESPACE v$JAKE_DEP_CORE_VERSION\""
depends_on = ["version"]
produces = ["banner"]
"#;
    let project = Project::parse(temp_dir.path(), text).unwrap();
    let registry = ArtifactRegistry::new();
    let artifacts = project.declare(&registry).unwrap();

    let config = crate::execute::ExecuteConfig {
      target_load: crate::execute::TargetLoad::Absolute(2.0),
      ..Default::default()
    };
    crate::execute::execute_builds(&registry, &config).await.unwrap();

    let banner = &artifacts[&ArtifactId::new("core", "banner")];
    assert_eq!(banner.get().unwrap().as_str(), "banner of core v1.2.3");
  }

  #[cfg(unix)]
  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn command_builds_respect_target_load() {
    let temp_dir = TempDir::new().unwrap();
    // A second command running at the same time fails to take the lock.
    let command = "mkdir busy.lock || exit 9; sleep 0.15; rmdir busy.lock";
    let mut text = String::from("namespace = \"core\"\n");
    for name in ["a", "b", "c", "d"] {
      text.push_str(&format!("\n[[build]]\nname = \"{name}\"\ncommand = \"{command}\"\n"));
    }
    let project = Project::parse(temp_dir.path(), &text).unwrap();
    let registry = ArtifactRegistry::new();
    project.declare(&registry).unwrap();

    let config = crate::execute::ExecuteConfig {
      target_load: crate::execute::TargetLoad::Absolute(1.0),
      ..Default::default()
    };
    let report = crate::execute::execute_builds(&registry, &config).await.unwrap();
    assert_eq!(report.completed.len(), 4);
  }
}
