//! Choosing which build to run next.
//!
//! A [`BuildOrder`] tracks the builds that have not completed yet. Builds whose
//! dependencies have all completed are *ready*; the order hands them out one at a time
//! and learns about dispatch and completion from the run loop.
//!
//! [`CriticalPathOrder`] estimates, for every build, the time needed to finish it and
//! its dependency chain, and prefers the ready build with the largest estimate.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::graph::{Graph, GraphError, GraphNode, NodeId, topological_order};

/// Keeps `min_time_seconds` strictly increasing along a chain of zero-duration builds.
const MIN_TIME_EPSILON: f64 = 0.001;

/// What the scheduler needs to know about a build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildMeta<K> {
  pub id: K,
  pub expected_duration: Duration,
  pub expected_load: f32,
  pub dependencies: Vec<K>,
}

impl<K: NodeId> GraphNode for BuildMeta<K> {
  type Id = K;

  fn id(&self) -> K {
    self.id.clone()
  }

  fn dependencies(&self) -> Vec<K> {
    self.dependencies.clone()
  }
}

/// Scheduling state of a build that has not completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
  Pending,
  Active,
}

impl fmt::Display for NodeState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      NodeState::Pending => write!(f, "pending"),
      NodeState::Active => write!(f, "active"),
    }
  }
}

/// A build plus its scheduling state.
#[derive(Debug, Clone)]
pub struct BuildNode<K> {
  meta: BuildMeta<K>,
  state: NodeState,
  min_time_seconds: f64,
}

impl<K> BuildNode<K> {
  pub fn meta(&self) -> &BuildMeta<K> {
    &self.meta
  }

  pub fn state(&self) -> NodeState {
    self.state
  }

  /// Estimated seconds to finish this build and everything it depends on.
  pub fn min_time_seconds(&self) -> f64 {
    self.min_time_seconds
  }
}

/// Answer of [`BuildOrder::calculate_next_build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextBuild<K> {
  /// Every build has completed.
  Done,
  /// This build may be dispatched.
  Ready(K),
  /// Builds remain, but none can start until an active build completes.
  NotReady,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
  #[error("no such build: {0}")]
  UnknownBuild(String),

  #[error("illegal state transition of {build}: {from} -> {to}")]
  IllegalTransition {
    build: String,
    from: NodeState,
    to: &'static str,
  },

  #[error(transparent)]
  Graph(#[from] GraphError),
}

/// Hands out ready builds and tracks their progress.
pub trait BuildOrder<K> {
  fn calculate_next_build(&self) -> NextBuild<K>;

  /// Mark a ready build as dispatched. It must be pending.
  fn report_active_build(&mut self, id: &K) -> Result<(), ScheduleError>;

  /// Forget a build that finished. It must be active.
  ///
  /// Builds that only waited on this one become ready.
  fn report_completed_build(&mut self, id: &K) -> Result<(), ScheduleError>;
}

/// Greedy longest-critical-path-first order.
///
/// Among the ready builds, the one with the largest `min_time_seconds` wins; ties go
/// to the smallest id.
#[derive(Debug, Clone)]
pub struct CriticalPathOrder<K> {
  graph: Graph<K, BuildNode<K>>,
}

impl<K: NodeId + Ord> CriticalPathOrder<K> {
  /// Fails if two builds share an id, a dependency is unknown, or the builds form a loop.
  pub fn new<I>(builds: I) -> Result<Self, ScheduleError>
  where
    I: IntoIterator<Item = BuildMeta<K>>,
  {
    let metas = Graph::from_nodes(builds)?;

    // Dependencies come first, so their estimates exist when a dependee needs them.
    let mut min_times: HashMap<K, f64> = HashMap::with_capacity(metas.len());
    for id in topological_order(&metas)? {
      let Some(meta) = metas.get(id) else {
        return Err(ScheduleError::UnknownBuild(id.to_string()));
      };
      let critical = metas
        .dependencies_of(id)
        .into_iter()
        .filter_map(|dependency| min_times.get(dependency).copied())
        .fold(0.0_f64, f64::max);
      let min_time = critical.max(MIN_TIME_EPSILON) + meta.expected_duration.as_secs_f64();
      min_times.insert(id.clone(), min_time);
    }

    let graph = metas.transform(|id, meta| BuildNode {
      meta: meta.clone(),
      state: NodeState::Pending,
      min_time_seconds: min_times.get(id).copied().unwrap_or(MIN_TIME_EPSILON),
    });

    Ok(Self { graph })
  }

  pub fn node(&self, id: &K) -> Option<&BuildNode<K>> {
    self.graph.get(id)
  }

  /// Number of builds not yet completed.
  pub fn len(&self) -> usize {
    self.graph.len()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.is_empty()
  }

  fn node_mut(&mut self, id: &K) -> Result<&mut BuildNode<K>, ScheduleError> {
    self
      .graph
      .get_mut(id)
      .ok_or_else(|| ScheduleError::UnknownBuild(id.to_string()))
  }
}

impl<K: NodeId + Ord> BuildOrder<K> for CriticalPathOrder<K> {
  fn calculate_next_build(&self) -> NextBuild<K> {
    if self.graph.is_empty() {
      return NextBuild::Done;
    }

    let best = self
      .graph
      .leaves()
      .into_iter()
      .filter_map(|id| self.graph.get(id).map(|node| (id, node)))
      .filter(|(_, node)| node.state == NodeState::Pending)
      .max_by(|(a_id, a), (b_id, b)| {
        a.min_time_seconds
          .total_cmp(&b.min_time_seconds)
          .then_with(|| b_id.cmp(a_id))
      });

    match best {
      Some((id, _)) => NextBuild::Ready(id.clone()),
      None => NextBuild::NotReady,
    }
  }

  fn report_active_build(&mut self, id: &K) -> Result<(), ScheduleError> {
    let node = self.node_mut(id)?;
    if node.state != NodeState::Pending {
      return Err(ScheduleError::IllegalTransition {
        build: id.to_string(),
        from: node.state,
        to: "active",
      });
    }
    node.state = NodeState::Active;
    Ok(())
  }

  fn report_completed_build(&mut self, id: &K) -> Result<(), ScheduleError> {
    let node = self.node_mut(id)?;
    if node.state != NodeState::Active {
      return Err(ScheduleError::IllegalTransition {
        build: id.to_string(),
        from: node.state,
        to: "completed",
      });
    }
    self.graph.remove(id)?;
    Ok(())
  }
}
