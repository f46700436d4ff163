//! Worker pool bounded by measured load instead of a fixed thread count.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::load::{CpuSampler, LoadTracker};

/// How long shutdown waits for workers before warning and waiting again.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(1);

/// Runs blocking work on tokio's blocking pool, admitting new work only while the
/// sampled load stays below the target.
///
/// Must be started from within a tokio runtime.
pub struct LoadAdaptiveExecutor {
  target: f32,
  tracker: Arc<LoadTracker>,
  in_flight: Arc<AtomicUsize>,
  workers: JoinSet<()>,
  load_changed: Arc<Notify>,
  stop: watch::Sender<bool>,
  sampler_task: Option<JoinHandle<()>>,
}

impl LoadAdaptiveExecutor {
  /// Start sampling `sampler` every `interval`.
  pub fn start(target: f32, sampler: Arc<dyn CpuSampler>, interval: Duration) -> Self {
    let tracker = Arc::new(LoadTracker::new(sampler));
    let load_changed = Arc::new(Notify::new());
    let (stop, stop_rx) = watch::channel(false);

    let sampler_task = tokio::spawn(sample_loop(tracker.clone(), load_changed.clone(), interval, stop_rx));
    debug!(target_load = target, interval_ms = interval.as_millis() as u64, "load sampler started");

    Self {
      target,
      tracker,
      in_flight: Arc::new(AtomicUsize::new(0)),
      workers: JoinSet::new(),
      load_changed,
      stop,
      sampler_task: Some(sampler_task),
    }
  }

  pub fn target(&self) -> f32 {
    self.target
  }

  pub fn tracker(&self) -> &LoadTracker {
    &self.tracker
  }

  /// Number of dispatched units of work that have not returned yet.
  pub fn in_flight(&self) -> usize {
    self.in_flight.load(Ordering::Acquire)
  }

  /// Whether work of `weight` may be dispatched now.
  ///
  /// With nothing in flight, work is always admitted so an oversized build cannot stall
  /// the run.
  pub fn admits(&self, weight: f32) -> bool {
    self.in_flight() == 0 || self.tracker.admits(weight, self.target)
  }

  /// Dispatch `work` to a worker thread, counting `weight` as load right away.
  pub fn run_async<F>(&mut self, weight: f32, work: F)
  where
    F: FnOnce() + Send + 'static,
  {
    self.reap();
    self.tracker.dispatched(weight);
    self.in_flight.fetch_add(1, Ordering::AcqRel);

    let tracker = self.tracker.clone();
    let guard = InFlightGuard(self.in_flight.clone());
    self.workers.spawn_blocking(move || {
      let _guard = guard;
      tracker.started(weight);
      let _running = RunningGuard { tracker, weight };
      work();
    });
  }

  /// Resolves at the next load sample.
  pub async fn load_changed(&self) {
    self.load_changed.notified().await;
  }

  /// Stop sampling and wait for every dispatched unit of work to return.
  pub async fn shutdown(mut self) {
    let _ = self.stop.send(true);
    if let Some(task) = self.sampler_task.take()
      && let Err(err) = task.await
    {
      warn!(error = %err, "load sampler task failed");
    }

    loop {
      match tokio::time::timeout(SHUTDOWN_WAIT, drain(&mut self.workers)).await {
        Ok(()) => break,
        Err(_) => warn!(remaining = self.workers.len(), "workers still running, waiting"),
      }
    }

    debug!("executor shut down");
  }

  fn reap(&mut self) {
    while let Some(result) = self.workers.try_join_next() {
      if let Err(err) = result {
        warn!(error = %err, "worker task failed");
      }
    }
  }
}

impl std::fmt::Debug for LoadAdaptiveExecutor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LoadAdaptiveExecutor")
      .field("target", &self.target)
      .field("tracker", &self.tracker)
      .field("in_flight", &self.in_flight())
      .finish_non_exhaustive()
  }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::AcqRel);
  }
}

struct RunningGuard {
  tracker: Arc<LoadTracker>,
  weight: f32,
}

impl Drop for RunningGuard {
  fn drop(&mut self) {
    self.tracker.finished(self.weight);
  }
}

async fn sample_loop(
  tracker: Arc<LoadTracker>,
  load_changed: Arc<Notify>,
  interval: Duration,
  mut stop: watch::Receiver<bool>,
) {
  // The first sample covers a full interval.
  let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    tokio::select! {
      _ = ticker.tick() => {
        tracker.sample();
        load_changed.notify_waiters();
      }
      changed = stop.changed() => {
        if changed.is_err() || *stop.borrow() {
          break;
        }
      }
    }
  }
}

async fn drain(workers: &mut JoinSet<()>) {
  while let Some(result) = workers.join_next().await {
    if let Err(err) = result {
      warn!(error = %err, "worker task failed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::mpsc;

  struct IdleSampler;

  impl CpuSampler for IdleSampler {
    fn cpu_time(&self) -> Duration {
      Duration::ZERO
    }
  }

  fn executor(target: f32) -> LoadAdaptiveExecutor {
    LoadAdaptiveExecutor::start(target, Arc::new(IdleSampler), Duration::from_millis(10))
  }

  /// An executor that takes no sample during the test.
  async fn quiet_executor(target: f32) -> LoadAdaptiveExecutor {
    let executor = LoadAdaptiveExecutor::start(target, Arc::new(IdleSampler), Duration::from_secs(3600));
    tokio::time::sleep(Duration::from_millis(50)).await;
    executor
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn runs_work_and_shuts_down() {
    let mut executor = executor(2.0);
    let (tx, rx) = mpsc::channel();

    for i in 0..3 {
      let tx = tx.clone();
      executor.run_async(1.0, move || {
        tx.send(i).unwrap();
      });
    }
    executor.shutdown().await;

    let mut received: Vec<i32> = rx.try_iter().collect();
    received.sort();
    assert_eq!(received, vec![0, 1, 2]);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn dispatch_counts_as_load_until_sampled() {
    let mut executor = quiet_executor(1.0).await;
    assert!(executor.admits(1.0));

    let (release_tx, release_rx) = mpsc::channel::<()>();
    executor.run_async(1.0, move || {
      let _ = release_rx.recv();
    });

    // One build in flight and still counted as artificial load.
    assert!(!executor.admits(1.0));

    release_tx.send(()).unwrap();
    executor.shutdown().await;
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn running_work_blocks_admission_until_it_returns() {
    let mut executor = executor(1.0);
    let (release_tx, release_rx) = mpsc::channel::<()>();
    executor.run_async(1.0, move || {
      let _ = release_rx.recv();
    });

    // Several samples later the idle sampler still sees nothing.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(executor.tracker().artificial_load(), 0.0);
    assert_eq!(executor.tracker().running_load(), 1.0);
    assert!(!executor.admits(1.0));

    release_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
      while executor.in_flight() > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap();
    assert_eq!(executor.tracker().running_load(), 0.0);
    executor.shutdown().await;
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn first_sample_waits_a_full_interval() {
    struct CountingSampler(AtomicUsize);

    impl CpuSampler for CountingSampler {
      fn cpu_time(&self) -> Duration {
        self.0.fetch_add(1, Ordering::SeqCst);
        Duration::ZERO
      }
    }

    let sampler = Arc::new(CountingSampler(AtomicUsize::new(0)));
    let executor = LoadAdaptiveExecutor::start(1.0, sampler.clone(), Duration::from_secs(3600));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Only the baseline read taken when the tracker was created.
    assert_eq!(sampler.0.load(Ordering::SeqCst), 1);
    executor.shutdown().await;
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn oversized_work_is_admitted_when_idle() {
    let executor = executor(1.0);
    assert!(executor.admits(8.0));
    executor.shutdown().await;
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn sampler_signals_load_changes() {
    let executor = executor(1.0);
    tokio::time::timeout(Duration::from_secs(5), executor.load_changed())
      .await
      .unwrap();
    executor.shutdown().await;
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn panicking_work_does_not_leak_in_flight() {
    let mut executor = executor(4.0);
    executor.run_async(1.0, || panic!("boom"));

    tokio::time::timeout(Duration::from_secs(5), async {
      while executor.in_flight() > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap();
    executor.shutdown().await;
  }
}
