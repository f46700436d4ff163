//! Graphviz rendering of the declared build graph.
//!
//! Every namespace becomes a cluster holding its builds and artifacts. Edges run from
//! an artifact to the builds depending on it and from a build to the artifacts it
//! produces.

use std::collections::BTreeSet;
use std::fmt::Write;

use crate::artifact::{ArtifactId, ArtifactRegistry};
use crate::build::BuildId;

/// Render the builds and artifacts of `registry` as a DOT digraph.
pub fn render(registry: &ArtifactRegistry) -> String {
  let builds = registry.builds();
  let artifacts = registry.artifacts();

  let namespaces: BTreeSet<&str> = builds
    .iter()
    .map(|info| info.id().namespace())
    .chain(artifacts.iter().map(|artifact| artifact.id().namespace()))
    .collect();

  let mut dot = Dot::default();
  dot.line("digraph \"Build graph\" {");
  dot.indent += 1;

  for (index, namespace) in namespaces.iter().enumerate() {
    dot.line(&format!("subgraph cluster{index} {{"));
    dot.indent += 1;
    dot.line(&format!("label = {};", quote(namespace)));
    dot.line("color = blue;");

    dot.line("// Builds");
    let mut members: Vec<&BuildId> = builds
      .iter()
      .map(|info| info.id())
      .filter(|id| id.namespace() == *namespace)
      .collect();
    members.sort();
    for id in members {
      dot.line(&format!("{} [label = {}, shape = plaintext]", build_node(id), quote(id.name())));
    }

    dot.line("// Artifacts");
    for artifact in artifacts.iter().filter(|artifact| artifact.id().namespace() == *namespace) {
      dot.line(&format!(
        "{} [label = {}]",
        artifact_node(artifact.id()),
        quote(artifact.id().name())
      ));
    }

    dot.indent -= 1;
    dot.line("}");
  }

  for info in &builds {
    for dependency in info.dependencies() {
      dot.line(&format!("{} -> {}", artifact_node(dependency), build_node(info.id())));
    }
    for produced in info.production() {
      dot.line(&format!("{} -> {}", build_node(info.id()), artifact_node(produced)));
    }
  }

  dot.indent -= 1;
  dot.line("}");
  dot.out
}

#[derive(Default)]
struct Dot {
  out: String,
  indent: usize,
}

impl Dot {
  fn line(&mut self, text: &str) {
    let _ = writeln!(self.out, "{}{}", "  ".repeat(self.indent), text);
  }
}

// Builds and artifacts commonly share a name, so build nodes get their own prefix.
fn build_node(id: &BuildId) -> String {
  quote(&format!("build:{id}"))
}

fn artifact_node(id: &ArtifactId) -> String {
  quote(&id.to_string())
}

fn quote(text: &str) -> String {
  format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}
