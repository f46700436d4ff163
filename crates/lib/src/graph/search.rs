//! Depth-first traversal over a [`Graph`].
//!
//! The search colours a transformed copy of the graph, leaving the payloads of the
//! searched graph untouched. Traversal starts at the roots and follows dependencies.

use super::{Graph, GraphError, NodeId};

/// An event emitted while searching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit<'a, K> {
  /// First time the vertex is reached; none of its dependencies are finished yet.
  Start(&'a K),
  /// All dependencies of the vertex have been finished.
  End(&'a K),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
  White,
  Gray,
  Black,
}

/// Visit every vertex reachable from the roots of `graph`, dependencies first.
///
/// Returns `CycleDetected` when a vertex is reached again before it is finished, or
/// when some vertex cannot be reached from any root.
pub fn depth_first_search<'a, K, T, F>(graph: &'a Graph<K, T>, mut visitor: F) -> Result<(), GraphError>
where
  K: NodeId,
  F: FnMut(Visit<'a, K>),
{
  let mut colors = graph.transform(|_, _| Color::White);

  for root in graph.roots() {
    if colors.get(root) != Some(&Color::White) {
      continue;
    }

    set_color(&mut colors, root, Color::Gray);
    visitor(Visit::Start(root));
    let mut stack: Vec<(&'a K, Vec<&'a K>)> = vec![(root, graph.dependencies_of(root))];

    loop {
      let Some(top) = stack.last_mut() else {
        break;
      };
      let current = top.0;
      let next = top.1.pop();

      match next {
        Some(dependency) => match colors.get(dependency) {
          Some(Color::White) => {
            set_color(&mut colors, dependency, Color::Gray);
            visitor(Visit::Start(dependency));
            stack.push((dependency, graph.dependencies_of(dependency)));
          }
          Some(Color::Gray) => return Err(GraphError::CycleDetected(dependency.to_string())),
          _ => {}
        },
        None => {
          stack.pop();
          set_color(&mut colors, current, Color::Black);
          visitor(Visit::End(current));
        }
      }
    }
  }

  // In a loop-free graph every vertex hangs below some root.
  if let Some((unvisited, _)) = colors.iter().find(|(_, color)| **color != Color::Black) {
    return Err(GraphError::CycleDetected(unvisited.to_string()));
  }

  Ok(())
}

/// Ids of all vertices ordered so that each comes after all of its dependencies.
pub fn topological_order<K: NodeId, T>(graph: &Graph<K, T>) -> Result<Vec<&K>, GraphError> {
  let mut order = Vec::with_capacity(graph.len());
  depth_first_search(graph, |visit| {
    if let Visit::End(id) = visit {
      order.push(id);
    }
  })?;
  Ok(order)
}

fn set_color<K: NodeId>(colors: &mut Graph<K, Color>, id: &K, color: Color) {
  if let Some(slot) = colors.get_mut(id) {
    *slot = color;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn chain() -> Graph<&'static str, ()> {
    let mut graph = Graph::new();
    graph.add_vertex("a", (), []).unwrap();
    graph.add_vertex("b", (), ["a"]).unwrap();
    graph.add_vertex("c", (), ["b"]).unwrap();
    graph
  }

  fn position(order: &[&&str], id: &str) -> usize {
    order.iter().position(|candidate| **candidate == id).unwrap()
  }

  #[test]
  fn empty_graph_has_empty_order() {
    let graph: Graph<&str, ()> = Graph::new();
    assert!(topological_order(&graph).unwrap().is_empty());
  }

  #[test]
  fn chain_is_ordered_dependencies_first() {
    let graph = chain();
    let order = topological_order(&graph).unwrap();
    assert_eq!(order, vec![&"a", &"b", &"c"]);
  }

  #[test]
  fn diamond_is_ordered_and_visits_once() {
    let mut graph = Graph::new();
    graph.add_vertex("root", (), []).unwrap();
    graph.add_vertex("left", (), ["root"]).unwrap();
    graph.add_vertex("right", (), ["root"]).unwrap();
    graph.add_vertex("join", (), ["left", "right"]).unwrap();

    let mut starts = 0;
    depth_first_search(&graph, |visit| {
      if matches!(visit, Visit::Start(_)) {
        starts += 1;
      }
    })
    .unwrap();
    assert_eq!(starts, 4);

    let order = topological_order(&graph).unwrap();
    assert!(position(&order, "root") < position(&order, "left"));
    assert!(position(&order, "root") < position(&order, "right"));
    assert!(position(&order, "left") < position(&order, "join"));
    assert!(position(&order, "right") < position(&order, "join"));
  }

  #[test]
  fn start_precedes_end_for_each_vertex() {
    let graph = chain();
    let mut events = Vec::new();
    depth_first_search(&graph, |visit| events.push(visit)).unwrap();

    assert_eq!(events.first(), Some(&Visit::Start(&"c")));
    assert_eq!(events.last(), Some(&Visit::End(&"c")));
    assert_eq!(events.len(), 6);
  }

  #[test]
  fn search_leaves_source_payloads_untouched() {
    let mut graph: Graph<&str, u32> = Graph::new();
    graph.add_vertex("a", 7, []).unwrap();
    graph.add_vertex("b", 9, ["a"]).unwrap();

    topological_order(&graph).unwrap();

    assert_eq!(graph.get(&"a"), Some(&7));
    assert_eq!(graph.get(&"b"), Some(&9));
  }
}
