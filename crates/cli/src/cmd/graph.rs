//! Implementation of the `jake graph` command.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use jake_lib::artifact::ArtifactRegistry;
use jake_lib::graphviz;
use jake_lib::project::{PROJECT_FILE, Project};

use crate::output::print_success;

/// Declare the project's builds and write them as a DOT digraph to `output`, or stdout.
pub fn cmd_graph(root: &Path, output: Option<&Path>) -> Result<()> {
  let project = Project::load(root).with_context(|| format!("Failed to load {}", root.join(PROJECT_FILE).display()))?;

  let registry = ArtifactRegistry::new();
  project.declare(&registry).context("Failed to declare builds")?;

  let dot = graphviz::render(&registry);

  match output {
    Some(path) => {
      fs::write(path, &dot).with_context(|| format!("Failed to write graph: {}", path.display()))?;
      print_success(&format!(
        "Wrote {} build(s) to {}",
        registry.build_count(),
        path.display()
      ));
    }
    None => print!("{dot}"),
  }

  Ok(())
}
