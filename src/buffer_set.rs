// buffer_set.rs

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use crate::error::PipelineError;

/// Identity of one of the two physical slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    fn index(self) -> usize {
        match self {
            SlotId::A => 0,
            SlotId::B => 1,
        }
    }
}

/// Which stage currently holds a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Producer,
    Consumer,
}

impl Owner {
    fn as_u8(self) -> u8 {
        match self {
            Owner::Producer => 0,
            Owner::Consumer => 1,
        }
    }

    fn from_u8(value: u8) -> Self {
        if value == 0 {
            Owner::Producer
        } else {
            Owner::Consumer
        }
    }
}

/// One fixed-size buffer of the double-buffer set.
///
/// The byte storage sits behind a read/write lock so that the compute op can
/// read the previous slot as its source while the drain stage copies the same
/// slot out. The handoff protocol keeps writers and readers apart, so the lock
/// is never contended for writing.
#[derive(Debug)]
pub struct Slot {
    id: SlotId,
    owner: AtomicU8,
    size: usize,
    data: RwLock<Box<[u8]>>,
}

impl Slot {
    fn new(id: SlotId, size: usize) -> Self {
        Self {
            id,
            owner: AtomicU8::new(Owner::Producer.as_u8()),
            size,
            data: RwLock::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn owner(&self) -> Owner {
        Owner::from_u8(self.owner.load(Ordering::Acquire))
    }

    fn set_owner(&self, owner: Owner) {
        self.owner.store(owner.as_u8(), Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Shared view of the slot's bytes.
    pub fn read(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.data.read(), |data| &data[..])
    }

    /// Exclusive view of the slot's bytes. The slice length is fixed.
    pub fn write(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        RwLockWriteGuard::map(self.data.write(), |data| &mut data[..])
    }

    fn is_idle(&self) -> bool {
        self.data.try_write().is_some()
    }
}

/// Exactly two slots used round-robin by the pipeline.
///
/// `current` is the slot the producer writes next; `previous` is the slot
/// that was just produced and is awaiting (or undergoing) drain.
#[derive(Debug)]
pub struct BufferSet {
    slots: [Slot; 2],
    current: AtomicUsize,
}

impl BufferSet {
    pub fn new(slot_size: usize) -> Self {
        Self {
            slots: [Slot::new(SlotId::A, slot_size), Slot::new(SlotId::B, slot_size)],
            current: AtomicUsize::new(0),
        }
    }

    pub fn slot_size(&self) -> usize {
        self.slots[0].len()
    }

    pub fn slot(&self, id: SlotId) -> &Slot {
        &self.slots[id.index()]
    }

    pub fn current(&self) -> &Slot {
        &self.slots[self.current.load(Ordering::Acquire)]
    }

    pub fn previous(&self) -> &Slot {
        &self.slots[1 - self.current.load(Ordering::Acquire)]
    }

    /// Relabel the slots: the freshly produced slot becomes `previous` and is
    /// handed to the consumer, the other one returns to the producer.
    ///
    /// Only the produce stage may call this, and only once the consumer has
    /// released the slot that becomes `current`.
    pub fn swap(&self) -> Result<(), PipelineError> {
        let index = self.current.load(Ordering::Acquire);
        let produced = &self.slots[index];
        let reclaimed = &self.slots[1 - index];

        if !reclaimed.is_idle() {
            return Err(PipelineError::ProtocolViolation(format!(
                "slot {:?} still borrowed during swap",
                reclaimed.id()
            )));
        }

        produced.set_owner(Owner::Consumer);
        reclaimed.set_owner(Owner::Producer);
        self.current.store(1 - index, Ordering::Release);
        log::trace!("swap: current={:?} previous={:?}", reclaimed.id(), produced.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_exchanges_roles() {
        let buffers = BufferSet::new(16);
        let current = buffers.current().id();
        let previous = buffers.previous().id();
        assert_ne!(current, previous);

        buffers.swap().unwrap();
        assert_eq!(buffers.current().id(), previous);
        assert_eq!(buffers.previous().id(), current);

        buffers.swap().unwrap();
        assert_eq!(buffers.current().id(), current);
        assert_eq!(buffers.previous().id(), previous);
    }

    #[test]
    fn test_swap_moves_no_data() {
        let buffers = BufferSet::new(4);
        buffers.current().write().copy_from_slice(&[1, 2, 3, 4]);
        let ptr = buffers.current().read().as_ptr();

        buffers.swap().unwrap();

        let previous = buffers.previous().read();
        assert_eq!(previous.as_ptr(), ptr);
        assert_eq!(&previous[..], &[1, 2, 3, 4]);
        assert_eq!(&buffers.current().read()[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_swap_updates_owners() {
        let buffers = BufferSet::new(8);
        assert_eq!(buffers.current().owner(), Owner::Producer);

        buffers.swap().unwrap();
        assert_eq!(buffers.previous().owner(), Owner::Consumer);
        assert_eq!(buffers.current().owner(), Owner::Producer);
    }

    #[test]
    fn test_swap_rejects_borrowed_slot() {
        let buffers = BufferSet::new(8);
        let guard = buffers.previous().read();
        let result = buffers.swap();
        assert!(matches!(result, Err(PipelineError::ProtocolViolation(_))));
        drop(guard);
        assert!(buffers.swap().is_ok());
    }

    #[test]
    fn test_slot_size_is_fixed() {
        let buffers = BufferSet::new(32);
        assert_eq!(buffers.slot_size(), 32);
        assert_eq!(buffers.slot(SlotId::A).len(), 32);
        assert_eq!(buffers.slot(SlotId::B).write().len(), 32);
    }
}
