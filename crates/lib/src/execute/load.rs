//! Measuring load.
//!
//! Load is the number of CPUs kept busy, estimated from the CPU time the process
//! consumed between two samples. Builds that were dispatched but whose CPU use cannot
//! be observed yet are accounted for as *artificial* load.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

/// Load values are kept as integer thousandths.
const MILLI: f32 = 1000.0;

/// How many CPUs the executor should try to keep busy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TargetLoad {
  /// A fixed number of CPUs.
  Absolute(f32),
  /// A multiple of the available hardware parallelism.
  PerCpu(f32),
}

impl Default for TargetLoad {
  fn default() -> Self {
    TargetLoad::PerCpu(1.0)
  }
}

impl TargetLoad {
  /// Interpret a single number: positive values are absolute, non-positive values are a
  /// (negated) multiple of the CPU count. Zero means one build per CPU.
  pub fn from_sentinel(value: f32) -> Self {
    if value > 0.0 {
      TargetLoad::Absolute(value)
    } else if value == 0.0 {
      TargetLoad::PerCpu(1.0)
    } else {
      TargetLoad::PerCpu(-value)
    }
  }

  /// The target for a machine with `cpus` CPUs.
  pub fn resolve(&self, cpus: usize) -> f32 {
    match *self {
      TargetLoad::Absolute(load) => load,
      TargetLoad::PerCpu(factor) => factor * cpus as f32,
    }
  }

  /// The target for this machine.
  pub fn effective(&self) -> f32 {
    self.resolve(available_cpus())
  }

  /// Worker threads needed to reach the target on this machine.
  pub fn worker_threads(&self) -> usize {
    (self.effective().round() as usize).max(1)
  }
}

impl fmt::Display for TargetLoad {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TargetLoad::Absolute(load) => write!(f, "{load}"),
      TargetLoad::PerCpu(factor) => write!(f, "x{factor}"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid load target '{0}': expected a number such as 4, -1 or x1.5")]
pub struct ParseTargetLoadError(String);

impl FromStr for TargetLoad {
  type Err = ParseTargetLoadError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let trimmed = s.trim();
    let invalid = || ParseTargetLoadError(s.to_string());

    if let Some(factor) = trimmed.strip_prefix('x') {
      let factor: f32 = factor.parse().map_err(|_| invalid())?;
      if !factor.is_finite() || factor <= 0.0 {
        return Err(invalid());
      }
      return Ok(TargetLoad::PerCpu(factor));
    }

    let value: f32 = trimmed.parse().map_err(|_| invalid())?;
    if !value.is_finite() {
      return Err(invalid());
    }
    Ok(TargetLoad::from_sentinel(value))
  }
}

/// Number of CPUs available to this process.
pub fn available_cpus() -> usize {
  std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Source of the total CPU time consumed by the process.
pub trait CpuSampler: Send + Sync {
  /// CPU time consumed so far. Must never decrease.
  fn cpu_time(&self) -> Duration;
}

/// Reads user plus system CPU time of the process and of its reaped child processes.
///
/// A child's CPU time is only reported once it has exited and been waited for, so
/// commands still running are invisible to this sampler. [`LoadTracker`] covers them
/// with the weight of the running builds.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessCpuSampler;

impl CpuSampler for ProcessCpuSampler {
  #[cfg(unix)]
  fn cpu_time(&self) -> Duration {
    rusage_cpu_time(libc::RUSAGE_SELF) + rusage_cpu_time(libc::RUSAGE_CHILDREN)
  }

  #[cfg(not(unix))]
  fn cpu_time(&self) -> Duration {
    Duration::ZERO
  }
}

#[cfg(unix)]
fn rusage_cpu_time(who: libc::c_int) -> Duration {
  let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
  // SAFETY: getrusage only writes into the provided struct.
  let rc = unsafe { libc::getrusage(who, usage.as_mut_ptr()) };
  if rc != 0 {
    return Duration::ZERO;
  }
  // SAFETY: zero-initialised and filled in by a successful getrusage.
  let usage = unsafe { usage.assume_init() };
  timeval_to_duration(usage.ru_utime) + timeval_to_duration(usage.ru_stime)
}

#[cfg(unix)]
fn timeval_to_duration(tv: libc::timeval) -> Duration {
  Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

struct LastSample {
  at: Instant,
  cpu: Duration,
}

/// Current, artificial and pending load of an executor.
///
/// The artificial load is raised the moment a build is dispatched. Once the build starts
/// running its weight moves to the pending counter, which the next sample folds back
/// into the artificial load, by which time the build shows up in the measured load.
///
/// Work the sampler cannot see, such as child processes that have not exited yet, never
/// shows up in the measured load. The total weight of started, unfinished builds is
/// therefore a floor for the measured load until those builds finish.
pub struct LoadTracker {
  sampler: Arc<dyn CpuSampler>,
  last: Mutex<LastSample>,
  load: AtomicI64,
  artificial: AtomicI64,
  pending: AtomicI64,
  running: AtomicI64,
}

impl LoadTracker {
  pub fn new(sampler: Arc<dyn CpuSampler>) -> Self {
    let cpu = sampler.cpu_time();
    Self {
      sampler,
      last: Mutex::new(LastSample { at: Instant::now(), cpu }),
      load: AtomicI64::new(0),
      artificial: AtomicI64::new(0),
      pending: AtomicI64::new(0),
      running: AtomicI64::new(0),
    }
  }

  /// Measured load as of the last sample.
  pub fn load(&self) -> f32 {
    from_milli(self.load.load(Ordering::Acquire))
  }

  /// Load of dispatched builds not yet visible in [`load`](Self::load).
  pub fn artificial_load(&self) -> f32 {
    from_milli(self.artificial.load(Ordering::Acquire))
  }

  /// Total weight of builds that started and have not finished.
  pub fn running_load(&self) -> f32 {
    from_milli(self.running.load(Ordering::Acquire))
  }

  /// Whether a build of `weight` fits below `target`, allowing half a CPU of slack.
  pub fn admits(&self, weight: f32, target: f32) -> bool {
    self.load().max(self.running_load()) + self.artificial_load() + weight < target + 0.5
  }

  /// Account for a build about to be dispatched.
  pub fn dispatched(&self, weight: f32) {
    self.artificial.fetch_add(to_milli(weight), Ordering::AcqRel);
  }

  /// Account for a dispatched build that started running.
  pub fn started(&self, weight: f32) {
    self.running.fetch_add(to_milli(weight), Ordering::AcqRel);
    self.pending.fetch_sub(to_milli(weight), Ordering::AcqRel);
  }

  /// Account for a started build that returned.
  pub fn finished(&self, weight: f32) {
    self.running.fetch_sub(to_milli(weight), Ordering::AcqRel);
  }

  /// Take a sample from the CPU sampler.
  pub fn sample(&self) {
    let cpu = self.sampler.cpu_time();
    let now = Instant::now();
    let (consumed, elapsed) = {
      let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
      let delta = (cpu.saturating_sub(last.cpu), now.saturating_duration_since(last.at));
      *last = LastSample { at: now, cpu };
      delta
    };
    self.record_sample(consumed, elapsed);
  }

  /// Record that `cpu` CPU time was consumed over `elapsed` wall time.
  pub fn record_sample(&self, cpu: Duration, elapsed: Duration) {
    let load = if elapsed.is_zero() {
      0.0
    } else {
      (cpu.as_secs_f64() / elapsed.as_secs_f64()) as f32
    };
    self.load.store(to_milli(load), Ordering::Release);

    let pending = self.pending.swap(0, Ordering::AcqRel);
    let artificial = self.artificial.fetch_add(pending, Ordering::AcqRel) + pending;

    trace!(load, artificial = from_milli(artificial), "load sampled");
  }
}

impl fmt::Debug for LoadTracker {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LoadTracker")
      .field("load", &self.load())
      .field("artificial", &self.artificial_load())
      .field("pending", &from_milli(self.pending.load(Ordering::Acquire)))
      .field("running", &self.running_load())
      .finish()
  }
}

fn to_milli(value: f32) -> i64 {
  (value * MILLI).round() as i64
}

fn from_milli(value: i64) -> f32 {
  value as f32 / MILLI
}
