// handoff.rs

//! Single-item handoff between the produce and drain stages.
//!
//! Each side owns one monotonically increasing counter guarded by its own
//! mutex/condvar pair. The producer may run at most `slack` iterations ahead
//! of the consumer:
//!
//! ```text
//! drained <= produced <= drained + slack
//! ```
//!
//! A shared [`FaultCell`] keeps the first error of the run. Recording a fault
//! wakes both condvars, so neither side can stay parked once the run is
//! doomed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};

use crate::error::{Fault, PipelineError, Stage};

/// Side of the handoff a caller acts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

impl Role {
    pub fn stage(self) -> Stage {
        match self {
            Role::Producer => Stage::Produce,
            Role::Consumer => Stage::Drain,
        }
    }
}

/// Outcome of [`HandoffChannel::await_turn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    Proceed,
    Aborted,
}

/// Point-in-time view of both counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub produced: u64,
    pub drained: u64,
}

impl Counters {
    pub fn within_slack(&self, slack: u64) -> bool {
        self.drained <= self.produced && self.produced <= self.drained + slack
    }
}

#[derive(Debug, Default)]
struct Counter {
    value: Mutex<u64>,
    cond: Condvar,
}

impl Counter {
    fn get(&self) -> u64 {
        *self.value.lock()
    }

    fn wake_all(&self) {
        // Taking the lock orders this wakeup after any waiter's fault check.
        let _guard = self.value.lock();
        self.cond.notify_all();
    }
}

/// Write-once holder for the first fault of a run.
#[derive(Debug, Default)]
pub struct FaultCell {
    set: AtomicBool,
    fault: Mutex<Option<Fault>>,
}

impl FaultCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `fault` unless one is already present. Returns whether this call
    /// won.
    pub fn record(&self, fault: Fault) -> bool {
        let mut slot = self.fault.lock();
        if slot.is_some() {
            debug!("discarding later fault: {}", fault);
            return false;
        }
        *slot = Some(fault);
        self.set.store(true, Ordering::Release);
        true
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    pub fn stage(&self) -> Option<Stage> {
        self.fault.lock().as_ref().map(|fault| fault.stage)
    }

    /// Remove the recorded fault. The cell stays marked as set.
    pub fn take(&self) -> Option<Fault> {
        self.fault.lock().take()
    }
}

pub struct HandoffChannel {
    produced: Counter,
    drained: Counter,
    fault: FaultCell,
    slack: u64,
    timeout: Option<Duration>,
}

impl Default for HandoffChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl HandoffChannel {
    /// Channel for a two-slot pipeline (slack of one iteration).
    pub fn new() -> Self {
        Self::with_slack(1)
    }

    /// Channel allowing the producer `slack` iterations of lead. A pipeline
    /// with `n` slots uses `n - 1`.
    pub fn with_slack(slack: u64) -> Self {
        Self {
            produced: Counter::default(),
            drained: Counter::default(),
            fault: FaultCell::new(),
            slack: slack.max(1),
            timeout: None,
        }
    }

    /// Fault a waiter with [`PipelineError::HandoffTimeout`] once it has been
    /// parked for longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn slack(&self) -> u64 {
        self.slack
    }

    /// Consistent snapshot of both counters.
    pub fn counters(&self) -> Counters {
        // Lock order is always produced, then drained.
        let produced = self.produced.value.lock();
        let drained = self.drained.value.lock();
        Counters {
            produced: *produced,
            drained: *drained,
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.fault.is_set()
    }

    pub fn fault_stage(&self) -> Option<Stage> {
        self.fault.stage()
    }

    pub fn take_fault(&self) -> Option<Fault> {
        self.fault.take()
    }

    /// Mark iteration `index` complete for `role` and wake the peer.
    ///
    /// Iterations must be signalled in order, and the new counter value must
    /// keep the slack invariant; otherwise the counter is left untouched and
    /// a protocol violation is returned.
    pub fn signal(&self, role: Role, index: u64) -> Result<(), PipelineError> {
        // The peer counter only grows, so a stale read can only make this
        // check stricter. Reading it before taking our own lock avoids
        // nesting the two mutexes.
        let (own, peer_value) = match role {
            Role::Producer => (&self.produced, self.drained.get()),
            Role::Consumer => (&self.drained, self.produced.get()),
        };

        let mut value = own.value.lock();
        if *value != index {
            return Err(PipelineError::ProtocolViolation(format!(
                "{:?} signalled iteration {} but counter is at {}",
                role, index, *value
            )));
        }

        let next = index + 1;
        let within = match role {
            Role::Producer => next <= peer_value.saturating_add(self.slack),
            Role::Consumer => next <= peer_value,
        };
        if !within {
            return Err(PipelineError::ProtocolViolation(format!(
                "{:?} signal for iteration {} breaks slack {} (peer at {})",
                role, index, self.slack, peer_value
            )));
        }

        *value = next;
        own.cond.notify_all();
        Ok(())
    }

    /// Block until `role` may proceed with iteration `index`.
    ///
    /// The producer waits for `drained >= index + 1 - slack`, the consumer for
    /// `produced >= index + 1`. A turn whose condition already holds is
    /// granted even after a fault; a caller that would have to park returns
    /// [`Turn::Aborted`] instead once a fault is recorded.
    pub fn await_turn(&self, role: Role, index: u64) -> Turn {
        let (peer, target) = match role {
            Role::Producer => (&self.drained, (index + 1).saturating_sub(self.slack)),
            Role::Consumer => (&self.produced, index + 1),
        };

        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut value = peer.value.lock();
        while *value < target {
            if self.fault.is_set() {
                debug!("{:?} aborting wait for iteration {}: fault recorded", role, index);
                return Turn::Aborted;
            }
            match deadline {
                Some(deadline) => {
                    let timed_out = peer.cond.wait_until(&mut value, deadline).timed_out();
                    if timed_out && *value < target && !self.fault.is_set() {
                        drop(value);
                        let timeout = self.timeout.unwrap_or_default();
                        warn!(
                            "{:?} timed out after {:?} waiting for iteration {}",
                            role, timeout, index
                        );
                        let err = PipelineError::HandoffTimeout {
                            iteration: index,
                            timeout,
                        };
                        self.record_fault(role, err);
                        return Turn::Aborted;
                    }
                }
                None => peer.cond.wait(&mut value),
            }
        }
        Turn::Proceed
    }

    /// Record `err` as the run's fault if none is set yet, then wake both
    /// sides. Returns whether this call's error was kept.
    pub fn record_fault(&self, role: Role, err: PipelineError) -> bool {
        let stage = role.stage();
        let won = self.fault.record(Fault::new(stage, err));
        if won {
            error!("{} stage recorded fault", stage);
        }
        self.produced.wake_all();
        self.drained.wake_all();
        won
    }
}
