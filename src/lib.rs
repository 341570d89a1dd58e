//! Overlapped double-buffer pipeline library
//!
//! A produce stage fills one of two slots while a drain stage copies the
//! other slot to host memory and writes it to a sink. The two stages run on
//! separate threads and are coupled only through a bounded handoff channel.

pub mod buffer_set;
pub mod device;
pub mod error;
pub mod handoff;
pub mod metrics;
pub mod pipeline;
pub mod sink;
pub mod stages;
pub mod transport;

// Re-export main types for convenience
pub use buffer_set::{BufferSet, Owner, Slot, SlotId};
pub use device::{ComputeOp, HostTransfer, TransferOp, XorShiftCompute};
pub use error::{Fault, FaultKind, OpError, PipelineError, Stage};
pub use handoff::{Counters, HandoffChannel, Role, Turn};
pub use metrics::{MetricsSnapshot, NoopHook, PipelineMetrics, StageHook, Step, StepEvent};
pub use pipeline::{PipelineConfig, PipelineRunner, RunReport};
pub use sink::{MemorySink, Sink, TransportSink, WriterSink};
pub use stages::{DrainStage, ProduceStage};
pub use transport::{Transport, UdpTransport};
