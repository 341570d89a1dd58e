// pipeline.rs

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::buffer_set::BufferSet;
use crate::device::{ComputeOp, TransferOp};
use crate::error::{Fault, PipelineError, Stage};
use crate::handoff::{HandoffChannel, Role};
use crate::metrics::{HookChain, MetricsSnapshot, PipelineMetrics, StageHook};
use crate::sink::Sink;
use crate::stages::{DrainStage, ProduceStage};

pub const DEFAULT_NUM_RN: usize = 16_777_216;
pub const DEFAULT_NUM_ITER: u64 = 10_000;
pub const DEFAULT_ITEM_WIDTH: usize = 8;

const DRAIN_THREAD_NAME: &str = "pipeline-drain";

/// Configuration for one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Items produced per iteration
    pub num_rn: usize,
    /// Bytes per item
    pub item_width: usize,
    pub num_iter: u64,
    /// Fault a stage that waits longer than this for its peer
    pub handoff_timeout: Option<Duration>,
    /// Flush the sink after every iteration
    pub flush_each_write: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_rn: DEFAULT_NUM_RN,
            item_width: DEFAULT_ITEM_WIDTH,
            num_iter: DEFAULT_NUM_ITER,
            handoff_timeout: None,
            flush_each_write: false,
        }
    }
}

impl PipelineConfig {
    pub fn new(num_rn: usize, num_iter: u64) -> Self {
        Self {
            num_rn,
            num_iter,
            ..Self::default()
        }
    }

    pub fn with_item_width(mut self, item_width: usize) -> Self {
        self.item_width = item_width;
        self
    }

    pub fn with_handoff_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handoff_timeout = timeout;
        self
    }

    pub fn with_flush_each_write(mut self, enabled: bool) -> Self {
        self.flush_each_write = enabled;
        self
    }

    /// Size of one slot in bytes.
    pub fn buf_size(&self) -> Result<usize, PipelineError> {
        self.num_rn.checked_mul(self.item_width).ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "slot size {} x {} overflows usize",
                self.num_rn, self.item_width
            ))
        })
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.num_rn == 0 {
            return Err(PipelineError::InvalidConfig("num_rn must be greater than zero".into()));
        }
        if self.item_width == 0 {
            return Err(PipelineError::InvalidConfig("item_width must be greater than zero".into()));
        }
        if self.num_iter == 0 {
            return Err(PipelineError::InvalidConfig("num_iter must be greater than zero".into()));
        }
        if self.handoff_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(PipelineError::InvalidConfig("handoff_timeout must be non-zero".into()));
        }
        self.buf_size().map(|_| ())
    }
}

/// Outcome of a fault-free run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub iterations: u64,
    pub bytes_written: u64,
    pub elapsed: Duration,
    pub metrics: MetricsSnapshot,
}

/// Runs `num_iter` iterations of compute overlapped with drain.
///
/// The calling thread drives the produce stage; a dedicated worker thread
/// drives the drain stage. Both share one [`BufferSet`] and one
/// [`HandoffChannel`] that live only for the duration of [`run`](Self::run).
pub struct PipelineRunner<C: ComputeOp, T: TransferOp, S: Sink> {
    config: PipelineConfig,
    buf_size: usize,
    compute: C,
    transfer: T,
    sink: S,
    hook: Option<Arc<dyn StageHook>>,
    metrics: Arc<PipelineMetrics>,
}

impl<C: ComputeOp, T: TransferOp, S: Sink> PipelineRunner<C, T, S> {
    pub fn new(
        config: PipelineConfig,
        compute: C,
        transfer: T,
        sink: S,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let buf_size = config.buf_size()?;
        Ok(Self {
            config,
            buf_size,
            compute,
            transfer,
            sink,
            hook: None,
            metrics: Arc::new(PipelineMetrics::new()),
        })
    }

    /// Install a hook called at every stage boundary, alongside the built-in
    /// metrics.
    pub fn with_hook(mut self, hook: Arc<dyn StageHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Live metrics of the current (or last) run.
    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_parts(self) -> (C, T, S) {
        (self.compute, self.transfer, self.sink)
    }

    /// Run the pipeline to completion.
    ///
    /// On success every iteration has been written to the sink in order. On
    /// failure the sink holds exactly the iterations before the faulted one
    /// and the first recorded fault is returned.
    pub fn run(&mut self) -> Result<RunReport, Fault> {
        let started = Instant::now();
        let items = self.config.num_rn;
        let iterations = self.config.num_iter;
        self.metrics.reset();

        info!(
            "pipeline start: {} iterations of {} items ({} bytes per slot)",
            iterations, items, self.buf_size
        );

        let buffers = BufferSet::new(self.buf_size);
        let channel = HandoffChannel::new().with_timeout(self.config.handoff_timeout);
        let hooks = HookChain {
            metrics: &self.metrics,
            user: self.hook.as_deref(),
        };
        let (buffers, channel) = (&buffers, &channel);

        let mut produce =
            ProduceStage::new(buffers, channel, &mut self.compute, &hooks, items, iterations);
        match catch_unwind(AssertUnwindSafe(|| produce.seed())) {
            Ok(Ok(())) => debug!("seeded slot {:?}", buffers.previous().id()),
            Ok(Err(err)) => return Err(log_fault(&self.metrics, Fault::new(Stage::Produce, err))),
            Err(_) => {
                let err = PipelineError::Panicked(Stage::Produce);
                return Err(log_fault(&self.metrics, Fault::new(Stage::Produce, err)));
            }
        }

        let mut drain = DrainStage::new(
            buffers,
            channel,
            &mut self.transfer,
            &mut self.sink,
            &hooks,
            items,
            iterations,
        )
        .flush_each_write(self.config.flush_each_write);

        let outcome = thread::scope(|scope| -> Result<(u64, u64), Fault> {
            let worker = thread::Builder::new()
                .name(DRAIN_THREAD_NAME.into())
                .spawn_scoped(scope, move || match catch_unwind(AssertUnwindSafe(|| drain.run())) {
                    Ok(drained) => drained,
                    Err(_) => {
                        channel.record_fault(Role::Consumer, PipelineError::Panicked(Stage::Drain));
                        0
                    }
                })
                .map_err(|err| Fault::new(Stage::Drain, PipelineError::WorkerSpawn(err)))?;

            let handed_off = match catch_unwind(AssertUnwindSafe(|| produce.run())) {
                Ok(handed_off) => handed_off,
                Err(_) => {
                    channel.record_fault(Role::Producer, PipelineError::Panicked(Stage::Produce));
                    0
                }
            };

            // The worker is joined on every path, including produce faults.
            let drained = worker.join().unwrap_or_else(|_| {
                channel.record_fault(Role::Consumer, PipelineError::Panicked(Stage::Drain));
                0
            });
            Ok((handed_off, drained))
        });

        let (handed_off, drained) = match outcome {
            Ok(counts) => counts,
            Err(fault) => return Err(log_fault(&self.metrics, fault)),
        };

        if let Some(fault) = channel.take_fault() {
            return Err(log_fault(&self.metrics, fault));
        }

        let counters = channel.counters();
        if handed_off != iterations
            || drained != iterations
            || counters.produced != counters.drained
        {
            let err = PipelineError::ProtocolViolation(format!(
                "run ended with {} handed off, {} drained, counters {:?}",
                handed_off, drained, counters
            ));
            return Err(log_fault(&self.metrics, Fault::new(Stage::Drain, err)));
        }

        let metrics = self.metrics.snapshot();
        let report = RunReport {
            iterations,
            bytes_written: metrics.bytes_written,
            elapsed: started.elapsed(),
            metrics,
        };
        info!(
            "pipeline done: {} iterations, {} bytes in {:?}",
            report.iterations, report.bytes_written, report.elapsed
        );
        Ok(report)
    }

}

fn log_fault(metrics: &PipelineMetrics, fault: Fault) -> Fault {
    error!(
        "pipeline aborted after {} bytes: {}",
        metrics.snapshot().bytes_written,
        fault
    );
    fault
}

impl<C, T, S> PipelineRunner<C, T, S>
where
    C: ComputeOp + 'static,
    T: TransferOp + 'static,
    S: Sink + 'static,
{
    /// Run on tokio's blocking pool so async callers can await the result.
    pub async fn run_async(mut self) -> Result<RunReport, Fault> {
        tokio::task::spawn_blocking(move || self.run())
            .await
            .unwrap_or_else(|join_err| {
                error!("pipeline task failed: {}", join_err);
                Err(Fault::new(Stage::Produce, PipelineError::Panicked(Stage::Produce)))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HostTransfer, XorShiftCompute};
    use crate::error::{FaultKind, OpError};
    use crate::sink::MemorySink;

    /// Writes the iteration index into every byte.
    struct FillIteration {
        fail_at: Option<u64>,
        panic_at: Option<u64>,
    }

    impl FillIteration {
        fn new() -> Self {
            Self {
                fail_at: None,
                panic_at: None,
            }
        }
    }

    impl ComputeOp for FillIteration {
        fn compute(
            &mut self,
            iteration: u64,
            _source: &[u8],
            dest: &mut [u8],
            _items: usize,
        ) -> Result<(), OpError> {
            if self.panic_at == Some(iteration) {
                panic!("compute panic at {}", iteration);
            }
            if self.fail_at == Some(iteration) {
                return Err(OpError::Device("kernel launch failed".into()));
            }
            dest.fill(iteration as u8);
            Ok(())
        }
    }

    struct SlowTransfer {
        delay: Duration,
    }

    impl TransferOp for SlowTransfer {
        fn transfer(
            &mut self,
            iteration: u64,
            device: &[u8],
            host: &mut [u8],
            items: usize,
        ) -> Result<(), OpError> {
            if iteration == 0 {
                thread::sleep(self.delay);
            }
            HostTransfer.transfer(iteration, device, host, items)
        }
    }

    struct FailingSink {
        inner: MemorySink,
        fail_at_write: usize,
        writes: usize,
    }

    impl Sink for FailingSink {
        fn write(&mut self, bytes: &[u8]) -> Result<(), OpError> {
            if self.writes == self.fail_at_write {
                return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed").into());
            }
            self.writes += 1;
            self.inner.write(bytes)
        }
    }

    /// Compute op whose seeding always fails.
    struct SeedFails;

    impl ComputeOp for SeedFails {
        fn init(&mut self, _dest: &mut [u8], _items: usize) -> Result<(), OpError> {
            Err(OpError::Device("seed buffer unavailable".into()))
        }

        fn compute(
            &mut self,
            _iteration: u64,
            _source: &[u8],
            dest: &mut [u8],
            _items: usize,
        ) -> Result<(), OpError> {
            dest.fill(0xff);
            Ok(())
        }
    }

    /// Records the order of sink calls.
    #[derive(Clone, Default)]
    struct CallLog {
        calls: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    }

    impl Sink for CallLog {
        fn write(&mut self, _bytes: &[u8]) -> Result<(), OpError> {
            self.calls.lock().push("write");
            Ok(())
        }

        fn flush(&mut self) -> Result<(), OpError> {
            self.calls.lock().push("flush");
            Ok(())
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.num_rn, DEFAULT_NUM_RN);
        assert_eq!(config.num_iter, DEFAULT_NUM_ITER);
        assert_eq!(config.buf_size().unwrap(), DEFAULT_NUM_RN * 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_zero_values() {
        for config in [
            PipelineConfig::new(0, 1),
            PipelineConfig::new(1, 0),
            PipelineConfig::new(1, 1).with_item_width(0),
            PipelineConfig::new(1, 1).with_handoff_timeout(Some(Duration::ZERO)),
        ] {
            assert!(matches!(config.validate(), Err(PipelineError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_config_rejects_overflow() {
        let config = PipelineConfig::new(usize::MAX, 1).with_item_width(2);
        assert!(matches!(config.buf_size(), Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_runner_rejects_invalid_config() {
        let config = PipelineConfig::new(0, 1);
        let result =
            PipelineRunner::new(config, FillIteration::new(), HostTransfer, MemorySink::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_run_writes_every_iteration() {
        let sink = MemorySink::new();
        let config = PipelineConfig::new(4, 3).with_item_width(1);
        let mut runner =
            PipelineRunner::new(config, FillIteration::new(), HostTransfer, sink.clone()).unwrap();

        let report = runner.run().unwrap();
        assert_eq!(report.iterations, 3);
        assert_eq!(report.bytes_written, 12);
        assert_eq!(report.metrics.computes, 3);
        assert_eq!(report.metrics.sink_writes, 3);
        assert_eq!(sink.contents(), vec![0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn test_compute_fault_keeps_prefix() {
        let sink = MemorySink::new();
        let compute = FillIteration {
            fail_at: Some(2),
            panic_at: None,
        };
        let config = PipelineConfig::new(2, 5).with_item_width(1);
        let mut runner = PipelineRunner::new(config, compute, HostTransfer, sink.clone()).unwrap();

        let fault = runner.run().unwrap_err();
        assert_eq!(fault.stage, Stage::Produce);
        assert_eq!(fault.kind(), FaultKind::Compute);
        assert_eq!(fault.error.iteration(), Some(2));
        assert_eq!(sink.contents(), vec![0, 0, 1, 1]);
    }

    #[test]
    fn test_compute_panic_becomes_fault() {
        let sink = MemorySink::new();
        let compute = FillIteration {
            fail_at: None,
            panic_at: Some(1),
        };
        let config = PipelineConfig::new(2, 4).with_item_width(1);
        let mut runner = PipelineRunner::new(config, compute, HostTransfer, sink.clone()).unwrap();

        let fault = runner.run().unwrap_err();
        assert!(matches!(fault.error, PipelineError::Panicked(Stage::Produce)));
        assert_eq!(sink.contents(), vec![0, 0]);
    }

    #[test]
    fn test_sink_fault_reported_from_drain() {
        let memory = MemorySink::new();
        let sink = FailingSink {
            inner: memory.clone(),
            fail_at_write: 1,
            writes: 0,
        };
        let config = PipelineConfig::new(3, 4).with_item_width(1);
        let mut runner =
            PipelineRunner::new(config, FillIteration::new(), HostTransfer, sink).unwrap();

        let fault = runner.run().unwrap_err();
        assert_eq!(fault.stage, Stage::Drain);
        assert_eq!(fault.kind(), FaultKind::Sink);
        assert_eq!(fault.error.iteration(), Some(1));
        assert_eq!(memory.contents(), vec![0, 0, 0]);
    }

    #[test]
    fn test_handoff_timeout_faults_waiting_producer() {
        let sink = MemorySink::new();
        let config = PipelineConfig::new(2, 3)
            .with_item_width(1)
            .with_handoff_timeout(Some(Duration::from_millis(20)));
        let transfer = SlowTransfer {
            delay: Duration::from_millis(300),
        };
        let mut runner =
            PipelineRunner::new(config, FillIteration::new(), transfer, sink.clone()).unwrap();

        let fault = runner.run().unwrap_err();
        assert_eq!(fault.stage, Stage::Produce);
        assert!(matches!(fault.error, PipelineError::HandoffTimeout { iteration: 1, .. }));
        assert_eq!(sink.contents(), vec![0, 0]);
    }

    #[test]
    fn test_repeated_runs_are_identical() {
        let config = PipelineConfig::new(16, 4);
        let first = MemorySink::new();
        let second = MemorySink::new();

        PipelineRunner::new(config.clone(), XorShiftCompute::new(9), HostTransfer, first.clone())
            .unwrap()
            .run()
            .unwrap();
        PipelineRunner::new(config, XorShiftCompute::new(9), HostTransfer, second.clone())
            .unwrap()
            .run()
            .unwrap();

        assert_eq!(first.len(), 16 * 8 * 4);
        assert_eq!(first.contents(), second.contents());
    }

    #[test]
    fn test_seed_fault_writes_nothing() {
        let sink = MemorySink::new();
        let config = PipelineConfig::new(4, 3).with_item_width(1);
        let mut runner =
            PipelineRunner::new(config, SeedFails, HostTransfer, sink.clone()).unwrap();

        let fault = runner.run().unwrap_err();
        assert_eq!(fault.stage, Stage::Produce);
        assert_eq!(fault.kind(), FaultKind::Compute);
        assert_eq!(fault.error.iteration(), Some(0));
        assert!(sink.is_empty());
        assert_eq!(runner.metrics().snapshot().computes, 0);
    }

    #[test]
    fn test_flush_each_write() {
        let log = CallLog::default();
        let config = PipelineConfig::new(2, 3)
            .with_item_width(1)
            .with_flush_each_write(true);
        let mut runner =
            PipelineRunner::new(config, FillIteration::new(), HostTransfer, log.clone()).unwrap();

        runner.run().unwrap();
        assert_eq!(
            *log.calls.lock(),
            vec!["write", "flush", "write", "flush", "write", "flush", "flush"]
        );
    }

    #[test]
    fn test_flush_once_by_default() {
        let log = CallLog::default();
        let config = PipelineConfig::new(2, 3).with_item_width(1);
        let mut runner =
            PipelineRunner::new(config, FillIteration::new(), HostTransfer, log.clone()).unwrap();

        runner.run().unwrap();
        assert_eq!(*log.calls.lock(), vec!["write", "write", "write", "flush"]);
    }

    #[tokio::test]
    async fn test_run_async() {
        let sink = MemorySink::new();
        let config = PipelineConfig::new(8, 5).with_item_width(1);
        let runner =
            PipelineRunner::new(config, FillIteration::new(), HostTransfer, sink.clone()).unwrap();

        let report = runner.run_async().await.unwrap();
        assert_eq!(report.bytes_written, 40);
        assert_eq!(sink.len(), 40);
    }
}
