mod build;
mod graph;

pub use build::cmd_build;
pub use graph::cmd_graph;
