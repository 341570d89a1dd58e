// metrics.rs

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::Stage;

/// Boundaries inside a stage at which hooks fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Seed,
    Compute,
    AwaitTurn,
    Transfer,
    SinkWrite,
}

/// Emitted when a step finishes, successfully or not.
#[derive(Debug, Clone, Copy)]
pub struct StepEvent {
    pub stage: Stage,
    pub step: Step,
    pub iteration: u64,
    pub elapsed: Duration,
    /// Bytes moved by the step; zero when it failed or moves nothing.
    pub bytes: usize,
}

/// Timing hooks at stage boundaries.
///
/// Called from both pipeline threads, so implementations must be cheap and
/// thread-safe.
pub trait StageHook: Send + Sync {
    fn on_step_start(&self, _stage: Stage, _step: Step, _iteration: u64) {}

    fn on_step_end(&self, _event: &StepEvent) {}
}

/// Hook that ignores every event.
pub struct NoopHook;

impl StageHook for NoopHook {}

/// Accumulated counters for a run
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub bytes_written: AtomicU64,
    pub computes: AtomicU64,
    pub transfers: AtomicU64,
    pub sink_writes: AtomicU64,
    pub seed_nanos: AtomicU64,
    pub compute_nanos: AtomicU64,
    pub produce_wait_nanos: AtomicU64,
    pub drain_wait_nanos: AtomicU64,
    pub transfer_nanos: AtomicU64,
    pub sink_nanos: AtomicU64,
}

/// Plain copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub bytes_written: u64,
    pub computes: u64,
    pub transfers: u64,
    pub sink_writes: u64,
    pub seed_time: Duration,
    pub compute_time: Duration,
    pub produce_wait_time: Duration,
    pub drain_wait_time: Duration,
    pub transfer_time: Duration,
    pub sink_time: Duration,
}

fn nanos(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}

fn load_duration(counter: &AtomicU64) -> Duration {
    Duration::from_nanos(counter.load(Ordering::Relaxed))
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            computes: self.computes.load(Ordering::Relaxed),
            transfers: self.transfers.load(Ordering::Relaxed),
            sink_writes: self.sink_writes.load(Ordering::Relaxed),
            seed_time: load_duration(&self.seed_nanos),
            compute_time: load_duration(&self.compute_nanos),
            produce_wait_time: load_duration(&self.produce_wait_nanos),
            drain_wait_time: load_duration(&self.drain_wait_nanos),
            transfer_time: load_duration(&self.transfer_nanos),
            sink_time: load_duration(&self.sink_nanos),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.bytes_written,
            &self.computes,
            &self.transfers,
            &self.sink_writes,
            &self.seed_nanos,
            &self.compute_nanos,
            &self.produce_wait_nanos,
            &self.drain_wait_nanos,
            &self.transfer_nanos,
            &self.sink_nanos,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl StageHook for PipelineMetrics {
    fn on_step_end(&self, event: &StepEvent) {
        let elapsed = nanos(event.elapsed);
        match (event.stage, event.step) {
            (_, Step::Seed) => {
                self.seed_nanos.fetch_add(elapsed, Ordering::Relaxed);
            }
            (_, Step::Compute) => {
                self.compute_nanos.fetch_add(elapsed, Ordering::Relaxed);
                self.computes.fetch_add(1, Ordering::Relaxed);
            }
            (Stage::Produce, Step::AwaitTurn) => {
                self.produce_wait_nanos.fetch_add(elapsed, Ordering::Relaxed);
            }
            (Stage::Drain, Step::AwaitTurn) => {
                self.drain_wait_nanos.fetch_add(elapsed, Ordering::Relaxed);
            }
            (_, Step::Transfer) => {
                self.transfer_nanos.fetch_add(elapsed, Ordering::Relaxed);
                self.transfers.fetch_add(1, Ordering::Relaxed);
            }
            (_, Step::SinkWrite) => {
                self.sink_nanos.fetch_add(elapsed, Ordering::Relaxed);
                self.sink_writes.fetch_add(1, Ordering::Relaxed);
                self.bytes_written.fetch_add(event.bytes as u64, Ordering::Relaxed);
            }
        }
    }
}

/// Fans events out to the run's metrics and an optional user hook.
pub(crate) struct HookChain<'a> {
    pub(crate) metrics: &'a PipelineMetrics,
    pub(crate) user: Option<&'a dyn StageHook>,
}

impl StageHook for HookChain<'_> {
    fn on_step_start(&self, stage: Stage, step: Step, iteration: u64) {
        if let Some(user) = self.user {
            user.on_step_start(stage, step, iteration);
        }
    }

    fn on_step_end(&self, event: &StepEvent) {
        self.metrics.on_step_end(event);
        if let Some(user) = self.user {
            user.on_step_end(event);
        }
    }
}

/// Run `f` between start/end hook calls. `f` returns its result plus the
/// number of bytes it moved.
pub(crate) fn timed<R>(
    hook: &dyn StageHook,
    stage: Stage,
    step: Step,
    iteration: u64,
    f: impl FnOnce() -> (R, usize),
) -> R {
    hook.on_step_start(stage, step, iteration);
    let started = Instant::now();
    let (result, bytes) = f();
    hook.on_step_end(&StepEvent {
        stage,
        step,
        iteration,
        elapsed: started.elapsed(),
        bytes,
    });
    result
}
