//! Running a single build on the current thread.

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use tracing::{debug, info_span};

use crate::artifact::{ArtifactId, ArtifactRegistry};

use super::context::BuildContext;
use super::types::BuildInfo;

/// Result of running one build action, successful or not.
#[derive(Debug)]
pub(crate) struct BuildCompletion {
  pub info: Arc<BuildInfo>,
  pub started: Instant,
  pub finished: Instant,
  pub published: BTreeSet<ArtifactId>,
  pub accomplishments: Vec<String>,
  pub changed: bool,
  /// Error returned by the action, or its panic.
  pub fault: Option<anyhow::Error>,
}

/// Run the action of `info` to completion. Never panics.
pub(crate) fn run_build(registry: &ArtifactRegistry, info: Arc<BuildInfo>) -> BuildCompletion {
  let span = info_span!("build", namespace = info.id().namespace(), build = info.id().name());
  let _entered = span.enter();

  let ctx = BuildContext::new(registry.clone(), info.clone(), span.clone());
  debug!("build started");

  let fault = match panic::catch_unwind(AssertUnwindSafe(|| info.action().build(&ctx))) {
    Ok(Ok(())) => None,
    Ok(Err(err)) => Some(err),
    Err(payload) => Some(anyhow!("build panicked: {}", panic_message(payload.as_ref()))),
  };

  let outcome = ctx.finish();
  let finished = Instant::now();
  debug!(
    elapsed_ms = (finished - ctx.started()).as_millis() as u64,
    published = outcome.published.len(),
    failed = fault.is_some(),
    "build finished"
  );

  BuildCompletion {
    info,
    started: ctx.started(),
    finished,
    published: outcome.published,
    accomplishments: outcome.accomplishments,
    changed: outcome.changed,
    fault,
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic payload".to_string()
  }
}
