//! Generic dependency graph.
//!
//! A [`Graph`] holds payloads keyed by a comparable node id. Edges point from a
//! dependency to its dependee, so every vertex knows both the vertices it depends on
//! and the vertices depending on it. Removing a vertex unlinks it from both sides.
//!
//! Leaves (vertices without dependencies) and roots (vertices without dependees) are
//! derived by scanning the vertex set rather than tracked incrementally.
//!
//! # Submodules
//!
//! - [`search`] - Depth-first traversal and topological ordering

pub mod search;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use thiserror::Error;

pub use search::{Visit, depth_first_search, topological_order};

/// Identifies a vertex. Must be usable as a map key and printable in errors.
pub trait NodeId: Clone + Eq + Hash + fmt::Debug + fmt::Display {}

impl<T: Clone + Eq + Hash + fmt::Debug + fmt::Display> NodeId for T {}

/// A payload that knows its own id and the ids it depends on.
pub trait GraphNode {
  type Id: NodeId;

  fn id(&self) -> Self::Id;

  fn dependencies(&self) -> Vec<Self::Id>;
}

/// Errors raised while building or mutating a graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
  /// Two payloads share the same id.
  #[error("two nodes have equal id: {0}")]
  DuplicateId(String),

  /// A payload depends on an id that is not in the node set.
  #[error("node {node} has a dependency on {dependency} which is not in the node set")]
  UnknownDependency { node: String, dependency: String },

  /// The id is not a vertex of this graph.
  #[error("no such node: {0}")]
  NoSuchNode(String),

  /// The dependency relation contains a loop.
  #[error("dependency cycle detected at {0}")]
  CycleDetected(String),
}

/// A vertex: the id it is known by, plus its payload.
#[derive(Debug, Clone)]
struct Vertex<K, T> {
  id: K,
  payload: T,
}

/// A directed acyclic graph of payloads `T` keyed by `K`.
#[derive(Debug, Clone)]
pub struct Graph<K, T> {
  graph: StableDiGraph<Vertex<K, T>, ()>,
  indices: HashMap<K, NodeIndex>,
}

impl<K: NodeId, T> Default for Graph<K, T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<K: NodeId, T> Graph<K, T> {
  /// Create an empty graph.
  pub fn new() -> Self {
    Self {
      graph: StableDiGraph::new(),
      indices: HashMap::new(),
    }
  }

  /// Build a graph from payloads that describe their own id and dependencies.
  ///
  /// Fails fast when two payloads share an id, when a dependency id is not among the
  /// payloads, or when the dependencies form a loop.
  pub fn from_nodes<I>(nodes: I) -> Result<Self, GraphError>
  where
    I: IntoIterator<Item = T>,
    T: GraphNode<Id = K>,
  {
    Self::from_adapter(nodes, |node| node.id(), |node| node.dependencies())
  }

  /// Build a graph from payloads using explicit id and dependency extractors.
  pub fn from_adapter<I, F, G>(nodes: I, mut id_of: F, mut dependencies_of: G) -> Result<Self, GraphError>
  where
    I: IntoIterator<Item = T>,
    F: FnMut(&T) -> K,
    G: FnMut(&T) -> Vec<K>,
  {
    let mut graph = Self::new();
    let mut pending_edges = Vec::new();

    // First pass: one vertex per payload
    for payload in nodes {
      let id = id_of(&payload);
      if graph.indices.contains_key(&id) {
        return Err(GraphError::DuplicateId(id.to_string()));
      }
      let dependencies = dependencies_of(&payload);
      let idx = graph.graph.add_node(Vertex {
        id: id.clone(),
        payload,
      });
      graph.indices.insert(id.clone(), idx);
      pending_edges.push((id, dependencies));
    }

    // Second pass: edges from dependency to dependee
    for (id, dependencies) in pending_edges {
      let dependee = graph.indices[&id];
      let mut seen = HashSet::new();
      for dependency in dependencies {
        if !seen.insert(dependency.clone()) {
          continue;
        }
        let Some(&dependency_idx) = graph.indices.get(&dependency) else {
          return Err(GraphError::UnknownDependency {
            node: id.to_string(),
            dependency: dependency.to_string(),
          });
        };
        graph.graph.add_edge(dependency_idx, dependee, ());
      }
    }

    graph.verify_acyclic()?;

    Ok(graph)
  }

  /// Add a vertex depending on vertices already in the graph.
  ///
  /// Since every dependency must already be present, vertices added this way can
  /// never close a loop.
  pub fn add_vertex<I>(&mut self, id: K, payload: T, dependencies: I) -> Result<(), GraphError>
  where
    I: IntoIterator<Item = K>,
  {
    if self.indices.contains_key(&id) {
      return Err(GraphError::DuplicateId(id.to_string()));
    }

    let mut dependency_indices = Vec::new();
    for dependency in dependencies {
      let Some(&idx) = self.indices.get(&dependency) else {
        return Err(GraphError::UnknownDependency {
          node: id.to_string(),
          dependency: dependency.to_string(),
        });
      };
      if !dependency_indices.contains(&idx) {
        dependency_indices.push(idx);
      }
    }

    let idx = self.graph.add_node(Vertex {
      id: id.clone(),
      payload,
    });
    for dependency in dependency_indices {
      self.graph.add_edge(dependency, idx, ());
    }
    self.indices.insert(id, idx);

    Ok(())
  }

  /// Remove a vertex, unlinking it from all dependencies and dependees.
  ///
  /// Returns the payload of the removed vertex.
  pub fn remove(&mut self, id: &K) -> Result<T, GraphError> {
    let idx = self
      .indices
      .remove(id)
      .ok_or_else(|| GraphError::NoSuchNode(id.to_string()))?;

    // StableGraph drops every edge touching the node, on both endpoints.
    self
      .graph
      .remove_node(idx)
      .map(|vertex| vertex.payload)
      .ok_or_else(|| GraphError::NoSuchNode(id.to_string()))
  }

  /// Ids of vertices without dependees.
  pub fn roots(&self) -> Vec<&K> {
    self.ids_without(Direction::Outgoing)
  }

  /// Ids of vertices without dependencies.
  pub fn leaves(&self) -> Vec<&K> {
    self.ids_without(Direction::Incoming)
  }

  fn ids_without(&self, direction: Direction) -> Vec<&K> {
    self
      .graph
      .node_indices()
      .filter(|&idx| self.graph.neighbors_directed(idx, direction).next().is_none())
      .map(|idx| &self.graph[idx].id)
      .collect()
  }

  /// Ids of the direct dependencies of a vertex.
  pub fn dependencies_of(&self, id: &K) -> Vec<&K> {
    self.neighbors(id, Direction::Incoming)
  }

  /// Ids of the direct dependees of a vertex.
  pub fn dependees_of(&self, id: &K) -> Vec<&K> {
    self.neighbors(id, Direction::Outgoing)
  }

  fn neighbors(&self, id: &K, direction: Direction) -> Vec<&K> {
    let Some(&idx) = self.indices.get(id) else {
      return Vec::new();
    };

    self
      .graph
      .neighbors_directed(idx, direction)
      .map(|neighbor| &self.graph[neighbor].id)
      .collect()
  }

  /// Produce a structurally identical graph whose payloads are computed by `f`.
  ///
  /// The new graph shares no state with this one.
  pub fn transform<U, F>(&self, mut f: F) -> Graph<K, U>
  where
    F: FnMut(&K, &T) -> U,
  {
    let graph = self.graph.map(
      |_, vertex| Vertex {
        id: vertex.id.clone(),
        payload: f(&vertex.id, &vertex.payload),
      },
      |_, _| (),
    );

    Graph {
      graph,
      indices: self.indices.clone(),
    }
  }

  pub fn get(&self, id: &K) -> Option<&T> {
    self.indices.get(id).map(|&idx| &self.graph[idx].payload)
  }

  pub fn get_mut(&mut self, id: &K) -> Option<&mut T> {
    let idx = *self.indices.get(id)?;
    Some(&mut self.graph[idx].payload)
  }

  pub fn contains(&self, id: &K) -> bool {
    self.indices.contains_key(id)
  }

  /// Iterate over `(id, payload)` pairs in unspecified order.
  pub fn iter(&self) -> impl Iterator<Item = (&K, &T)> {
    self
      .graph
      .node_indices()
      .map(|idx| (&self.graph[idx].id, &self.graph[idx].payload))
  }

  pub fn len(&self) -> usize {
    self.indices.len()
  }

  pub fn is_empty(&self) -> bool {
    self.indices.is_empty()
  }

  fn verify_acyclic(&self) -> Result<(), GraphError> {
    toposort(&self.graph, None).map_err(|cycle| GraphError::CycleDetected(self.graph[cycle.node_id()].id.to_string()))?;
    Ok(())
  }
}
