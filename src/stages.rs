// stages.rs

//! The two halves of the pipeline.
//!
//! `ProduceStage` runs on the caller's thread and `DrainStage` on the
//! dedicated worker. They share a [`BufferSet`] and a [`HandoffChannel`] and
//! never touch a slot outside the role the channel grants them.

use log::{debug, trace};

use crate::buffer_set::{BufferSet, Owner};
use crate::device::{ComputeOp, TransferOp};
use crate::error::{PipelineError, Stage};
use crate::handoff::{HandoffChannel, Role, Turn};
use crate::metrics::{timed, StageHook, Step};
use crate::sink::Sink;

pub struct ProduceStage<'a, C: ComputeOp + ?Sized> {
    buffers: &'a BufferSet,
    channel: &'a HandoffChannel,
    compute: &'a mut C,
    hook: &'a dyn StageHook,
    items: usize,
    iterations: u64,
}

impl<'a, C: ComputeOp + ?Sized> ProduceStage<'a, C> {
    pub fn new(
        buffers: &'a BufferSet,
        channel: &'a HandoffChannel,
        compute: &'a mut C,
        hook: &'a dyn StageHook,
        items: usize,
        iterations: u64,
    ) -> Self {
        Self {
            buffers,
            channel,
            compute,
            hook,
            items,
            iterations,
        }
    }

    /// Fill the initial source slot. Must run before the drain worker starts.
    pub fn seed(&mut self) -> Result<(), PipelineError> {
        let slot = self.buffers.previous();
        let items = self.items;
        let compute = &mut *self.compute;
        timed(self.hook, Stage::Produce, Step::Seed, 0, || {
            let mut dest = slot.write();
            let len = dest.len();
            match compute.init(&mut dest, items) {
                Ok(()) => (Ok(()), len),
                Err(source) => (Err(PipelineError::Compute { iteration: 0, source }), 0),
            }
        })
    }

    /// Issue every iteration, stopping at the first fault. Returns how many
    /// iterations were handed to the consumer.
    pub fn run(&mut self) -> u64 {
        let mut handed_off = 0;
        for iteration in 0..self.iterations {
            if self.channel.is_faulted() {
                debug!("produce: fault observed before iteration {}", iteration);
                break;
            }

            if let Err(err) = self.issue(iteration) {
                self.channel.record_fault(Role::Producer, err);
                break;
            }

            let turn = timed(self.hook, Stage::Produce, Step::AwaitTurn, iteration, || {
                (self.channel.await_turn(Role::Producer, iteration), 0)
            });
            if turn == Turn::Aborted {
                break;
            }

            // Swap before signalling so the consumer wakes to the new labels.
            let handoff = self
                .buffers
                .swap()
                .and_then(|()| self.channel.signal(Role::Producer, iteration));
            if let Err(err) = handoff {
                self.channel.record_fault(Role::Producer, err);
                break;
            }

            trace!("produce: handed off iteration {}", iteration);
            handed_off += 1;
        }
        handed_off
    }

    fn issue(&mut self, iteration: u64) -> Result<(), PipelineError> {
        let source_slot = self.buffers.previous();
        let dest_slot = self.buffers.current();
        if dest_slot.owner() != Owner::Producer {
            return Err(PipelineError::ProtocolViolation(format!(
                "produce: slot {:?} is not owned by the producer",
                dest_slot.id()
            )));
        }

        let items = self.items;
        let compute = &mut *self.compute;
        timed(self.hook, Stage::Produce, Step::Compute, iteration, || {
            let source = source_slot.read();
            let mut dest = dest_slot.write();
            let len = dest.len();
            match compute.compute(iteration, &source, &mut dest, items) {
                Ok(()) => (Ok(()), len),
                Err(err) => (Err(PipelineError::Compute { iteration, source: err }), 0),
            }
        })
    }
}

pub struct DrainStage<'a, T: TransferOp + ?Sized, S: Sink + ?Sized> {
    buffers: &'a BufferSet,
    channel: &'a HandoffChannel,
    transfer: &'a mut T,
    sink: &'a mut S,
    hook: &'a dyn StageHook,
    host: Vec<u8>,
    items: usize,
    iterations: u64,
    flush_each_write: bool,
}

impl<'a, T: TransferOp + ?Sized, S: Sink + ?Sized> DrainStage<'a, T, S> {
    pub fn new(
        buffers: &'a BufferSet,
        channel: &'a HandoffChannel,
        transfer: &'a mut T,
        sink: &'a mut S,
        hook: &'a dyn StageHook,
        items: usize,
        iterations: u64,
    ) -> Self {
        Self {
            host: vec![0u8; buffers.slot_size()],
            buffers,
            channel,
            transfer,
            sink,
            hook,
            items,
            iterations,
            flush_each_write: false,
        }
    }

    /// Flush the sink after every iteration instead of once at the end.
    pub fn flush_each_write(mut self, enabled: bool) -> Self {
        self.flush_each_write = enabled;
        self
    }

    /// Drain iterations in order until all are written or a fault is seen.
    /// Returns how many iterations reached the sink.
    pub fn run(&mut self) -> u64 {
        let mut drained: u64 = 0;
        for iteration in 0..self.iterations {
            let turn = timed(self.hook, Stage::Drain, Step::AwaitTurn, iteration, || {
                (self.channel.await_turn(Role::Consumer, iteration), 0)
            });
            if turn == Turn::Aborted {
                debug!("drain: aborted before iteration {}", iteration);
                break;
            }

            if let Err(err) = self.drain(iteration) {
                self.channel.record_fault(Role::Consumer, err);
                break;
            }
            drained += 1;
        }

        if let Err(source) = self.sink.flush() {
            let iteration = drained.saturating_sub(1);
            self.channel
                .record_fault(Role::Consumer, PipelineError::Sink { iteration, source });
        }
        drained
    }

    fn drain(&mut self, iteration: u64) -> Result<(), PipelineError> {
        let slot = self.buffers.previous();
        if slot.owner() != Owner::Consumer {
            return Err(PipelineError::ProtocolViolation(format!(
                "drain: slot {:?} is not owned by the consumer",
                slot.id()
            )));
        }

        let items = self.items;
        let host = &mut self.host;
        let transfer = &mut *self.transfer;
        timed(self.hook, Stage::Drain, Step::Transfer, iteration, || {
            let device = slot.read();
            match transfer.transfer(iteration, &device, host, items) {
                Ok(()) => (Ok(()), host.len()),
                Err(source) => (Err(PipelineError::Transfer { iteration, source }), 0),
            }
        })?;

        let host = &self.host;
        let sink = &mut *self.sink;
        let flush = self.flush_each_write;
        timed(self.hook, Stage::Drain, Step::SinkWrite, iteration, || {
            let written = sink
                .write(host)
                .and_then(|()| if flush { sink.flush() } else { Ok(()) });
            match written {
                Ok(()) => (Ok(()), host.len()),
                Err(source) => (Err(PipelineError::Sink { iteration, source }), 0),
            }
        })?;

        self.channel.signal(Role::Consumer, iteration)?;
        trace!("drain: released iteration {}", iteration);
        Ok(())
    }
}
