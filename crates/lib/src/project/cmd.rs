//! Shell command builds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{debug, warn};

use crate::artifact::Artifact;
use crate::build::{BuildAction, BuildContext};

/// Errors running a shell command.
#[derive(Debug, Error)]
pub enum CmdError {
  #[error("failed to spawn {shell} for: {cmd}")]
  Spawn {
    shell: String,
    cmd: String,
    #[source]
    source: std::io::Error,
  },

  #[error("command failed with exit code {code:?}: {cmd}")]
  Failed { cmd: String, code: Option<i32> },
}

/// A build that runs a shell command in the project root.
///
/// The command sees `JAKE_NAMESPACE`, `JAKE_BUILD` and one `JAKE_DEP_<NAMESPACE>_<NAME>`
/// variable per dependency holding that dependency's value. Its trimmed stdout becomes
/// the value of every artifact the build produces.
pub struct CmdBuild {
  name: String,
  command: String,
  root: PathBuf,
  dependencies: Vec<Artifact<String>>,
  production: Vec<Artifact<String>>,
}

impl CmdBuild {
  pub fn new(
    name: impl Into<String>,
    command: impl Into<String>,
    root: impl Into<PathBuf>,
    dependencies: Vec<Artifact<String>>,
    production: Vec<Artifact<String>>,
  ) -> Self {
    Self {
      name: name.into(),
      command: command.into(),
      root: root.into(),
      dependencies,
      production,
    }
  }
}

impl BuildAction for CmdBuild {
  fn name(&self) -> String {
    self.name.clone()
  }

  fn build(&self, ctx: &BuildContext) -> anyhow::Result<()> {
    let mut env = BTreeMap::new();
    env.insert("JAKE_NAMESPACE".to_string(), ctx.namespace().to_string());
    env.insert("JAKE_BUILD".to_string(), ctx.id().name().to_string());
    for dependency in &self.dependencies {
      let value = dependency.get()?;
      env.insert(
        dependency_variable(dependency.id().namespace(), dependency.id().name()),
        value.as_str().to_string(),
      );
    }

    let stdout = execute_cmd(&self.command, &env, &self.root)?;

    for artifact in &self.production {
      ctx
        .new_publication_of(artifact)
        .log_with_duration(format!("produced {}", artifact.id()))
        .publish(stdout.clone())?;
    }

    Ok(())
  }
}

/// Name of the variable carrying the value of dependency `namespace:name`.
pub fn dependency_variable(namespace: &str, name: &str) -> String {
  let sanitize = |part: &str| -> String {
    part
      .chars()
      .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
      .collect()
  };
  format!("JAKE_DEP_{}_{}", sanitize(namespace), sanitize(name))
}

/// Run `cmd` through the platform shell in `cwd` and return its trimmed stdout.
pub fn execute_cmd(cmd: &str, env: &BTreeMap<String, String>, cwd: &Path) -> Result<String, CmdError> {
  let (shell, shell_args) = shell();
  debug!(cmd = %cmd, shell, working_dir = ?cwd, "spawning process");

  let output = Command::new(shell)
    .args(shell_args)
    .arg(cmd)
    .current_dir(cwd)
    .envs(env)
    .output()
    .map_err(|source| CmdError::Spawn {
      shell: shell.to_string(),
      cmd: cmd.to_string(),
      source,
    })?;

  let stderr = String::from_utf8_lossy(&output.stderr);
  if !output.status.success() {
    if !stderr.trim().is_empty() {
      warn!(stderr = %stderr.trim(), "command stderr");
    }
    return Err(CmdError::Failed {
      cmd: cmd.to_string(),
      code: output.status.code(),
    });
  }

  if !stderr.trim().is_empty() {
    debug!(stderr = %stderr.trim(), "command stderr");
  }

  let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
  if !stdout.is_empty() {
    debug!(stdout = %stdout, "command output");
  }

  Ok(stdout)
}

#[cfg(unix)]
fn shell() -> (&'static str, &'static [&'static str]) {
  ("/bin/sh", &["-c"])
}

#[cfg(windows)]
fn shell() -> (&'static str, &'static [&'static str]) {
  ("cmd.exe", &["/C"])
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn runs_in_working_directory_with_env() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join("marker.txt"), "present").unwrap();

    let mut env = BTreeMap::new();
    env.insert("GREETING".to_string(), "hello".to_string());

    let out = execute_cmd("cat marker.txt; echo \" $GREETING\"", &env, temp_dir.path()).unwrap();
    assert_eq!(out, "present hello");
  }

  #[test]
  fn nonzero_exit_fails() {
    let temp_dir = TempDir::new().unwrap();
    let err = execute_cmd("exit 3", &BTreeMap::new(), temp_dir.path()).unwrap_err();
    assert!(matches!(err, CmdError::Failed { code: Some(3), .. }));
  }

  #[test]
  fn dependency_variables_are_sanitized() {
    assert_eq!(dependency_variable("core", "classes"), "JAKE_DEP_CORE_CLASSES");
    assert_eq!(dependency_variable("my-lib", "app.jar"), "JAKE_DEP_MY_LIB_APP_JAR");
  }
}
