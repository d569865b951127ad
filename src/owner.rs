//! Owner slots: the back-references the zone clears when it evicts a block.

use std::sync::{Arc, Weak};

use spin::Mutex;

use crate::ptr::Ptr;

type SlotCell = Mutex<Option<Ptr>>;

/// A consumer-held cell that records where a zone allocation lives.
///
/// Purgeable allocations must be made with an owner slot. When the zone
/// evicts such a block to make room for another allocation, it sets the slot
/// back to `None`; a consumer must therefore re-check its slot before using a
/// purgeable allocation it has not touched recently.
///
/// The zone only keeps a weak reference, so dropping every clone of a slot
/// simply leaves the block without anyone to notify.
#[derive(Clone, Debug)]
pub struct OwnerSlot {
    cell: Arc<SlotCell>,
}

impl Default for OwnerSlot {
    fn default() -> Self {
        OwnerSlot::new()
    }
}

impl OwnerSlot {
    pub fn new() -> Self {
        OwnerSlot {
            cell: Arc::new(Mutex::new(None)),
        }
    }

    /// The allocation currently recorded in this slot.
    pub fn get(&self) -> Option<Ptr> {
        *self.cell.lock()
    }

    pub fn set(&self, ptr: Option<Ptr>) {
        *self.cell.lock() = ptr;
    }

    pub fn take(&self) -> Option<Ptr> {
        self.cell.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.get().is_none()
    }

    /// Whether both handles refer to the same slot.
    pub fn same_slot(&self, other: &OwnerSlot) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    pub(crate) fn downgrade(&self) -> Weak<SlotCell> {
        Arc::downgrade(&self.cell)
    }
}

/// Who owns a block.
///
/// This replaces guessing from the value of an owner pointer: a block is
/// either free, in use without an owner, or in use with a slot to clear.
#[derive(Debug)]
pub(crate) enum Owner {
    Free,
    Unowned,
    Slot(Weak<SlotCell>),
}

impl Default for Owner {
    fn default() -> Self {
        Owner::Free
    }
}

impl Owner {
    pub fn from_slot(slot: Option<&OwnerSlot>) -> Owner {
        match slot {
            Some(slot) => Owner::Slot(slot.downgrade()),
            None => Owner::Unowned,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, Owner::Free)
    }

    pub fn has_slot(&self) -> bool {
        matches!(self, Owner::Slot(_))
    }

    /// The slot, if it is still held by someone.
    pub fn slot(&self) -> Option<OwnerSlot> {
        match self {
            Owner::Slot(weak) => weak.upgrade().map(|cell| OwnerSlot { cell }),
            _ => None,
        }
    }

    /// Clear the owner's mark, telling it the block is gone.
    pub fn clear(&self) {
        if let Some(slot) = self.slot() {
            slot.set(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    #[test]
    fn test_owner_clear() {
        let slot = OwnerSlot::new();
        let owner = Owner::from_slot(Some(&slot));
        assert!(owner.has_slot());

        let fake = Ptr::new(0, crate::blocklist::BlockId::SENTINEL, 7);
        slot.set(Some(fake));
        assert_eq!(slot.get(), Some(fake));

        owner.clear();
        assert!(slot.is_empty());

        assert!(owner.slot().unwrap().same_slot(&slot));
        drop(slot);
        assert!(owner.slot().is_none());
        // Clearing a dropped slot is harmless.
        owner.clear();
    }

    #[test]
    fn test_take_empties_every_clone() {
        let slot = OwnerSlot::new();
        let other = slot.clone();
        let fake = Ptr::new(1, crate::blocklist::BlockId::SENTINEL, 3);
        slot.set(Some(fake));

        assert_eq!(other.take(), Some(fake));
        assert!(slot.is_empty());
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn test_unowned() {
        let owner = Owner::from_slot(None);
        assert!(!owner.has_slot());
        assert!(!owner.is_free());
        assert!(Owner::default().is_free());
    }
}
