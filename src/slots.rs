//! The connection slot table.
//!
//! An indexable collection of optionally-empty ownership cells. Occupancy
//! changes (`assign`/`free`) are serialized by the table's single lock;
//! `get` takes only a brief shared read to clone out an `Arc` snapshot, so
//! a reader may still hold (and must tolerate) an occupant another thread
//! just freed. That staleness window is the price of never blocking the
//! hot loops on table mutation.

use crate::error::Error;

use parking_lot::RwLock;
use std::sync::Arc;

/// Indexable table of optionally-empty connection slots.
#[derive(Debug)]
pub struct SlotTable<C> {
    slots: RwLock<Vec<Option<Arc<C>>>>,
}

impl<C> SlotTable<C> {
    /// Creates a table with `capacity` empty slots.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots: RwLock::new(slots),
        }
    }

    /// Assigns `connection` to the first empty slot and returns its index.
    ///
    /// Fails with [`Error::SlotTableFull`] when no slot is empty; the caller
    /// must [`grow`](Self::grow) or reject.
    pub fn assign(&self, connection: Arc<C>) -> Result<usize, Error> {
        let mut slots = self.slots.write();
        match slots.iter().position(Option::is_none) {
            Some(index) => {
                slots[index] = Some(connection);
                Ok(index)
            }
            None => Err(Error::SlotTableFull {
                capacity: slots.len(),
            }),
        }
    }

    /// Snapshot load of a slot's occupant. No ownership transfer; `None`
    /// means "not currently present" and callers that depend on presence
    /// must re-`get`.
    pub fn get(&self, index: usize) -> Option<Arc<C>> {
        self.slots.read().get(index).and_then(Clone::clone)
    }

    /// Reclaims and empties a slot, returning the evicted occupant.
    pub fn free(&self, index: usize) -> Option<Arc<C>> {
        let mut slots = self.slots.write();
        slots.get_mut(index).and_then(Option::take)
    }

    /// First empty index, or `len()` when every slot is occupied. Not an
    /// error: the caller decides whether to grow the table.
    pub fn find_empty_slot(&self) -> usize {
        let slots = self.slots.read();
        slots
            .iter()
            .position(Option::is_none)
            .unwrap_or(slots.len())
    }

    /// Current slot count (occupied or not).
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Whether the table has no slots at all.
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Appends `additional` empty slots.
    pub fn grow(&self, additional: usize) {
        let mut slots = self.slots.write();
        let target = slots.len() + additional;
        slots.resize_with(target, || None);
    }

    /// Clones the current occupancy for one iteration pass. The snapshot is
    /// never persisted across cycles.
    pub fn snapshot(&self) -> Vec<Option<Arc<C>>> {
        self.slots.read().clone()
    }
}
