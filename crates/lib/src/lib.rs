//! jake-lib: Build orchestration engine
//!
//! This crate declares builds, orders them and runs them concurrently:
//! - `Artifact`: typed, write-once values produced by exactly one build
//! - `Build`: a unit of work with declared input and output artifacts
//! - `CriticalPathOrder`: picks the ready build on the longest remaining chain
//! - `LoadAdaptiveExecutor`: bounds concurrency by measured CPU load
//! - `execute_builds`: the run loop tying them together

pub mod artifact;
pub mod build;
pub mod execute;
pub mod graph;
pub mod graphviz;
pub mod project;
pub mod schedule;
