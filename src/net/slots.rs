//! Fixed-capacity slot table with first-free allocation.
//!
//! The table never grows: running out of slots is reported to the caller,
//! who decides what exhaustion means. A slot is claimed in two steps
//! ([Slots::reserve], then [Slots::fill]) so that the slot is held while the
//! value is built outside any lock, and can be handed back with
//! [Slots::release] if building fails.

#[derive(Debug)]
enum Slot<T> {
    Free,
    Reserved,
    Occupied(T),
}

/// Fixed-capacity arena. Indices stay stable for the life of an occupant and
/// are reused after release, lowest index first.
#[derive(Debug)]
pub(crate) struct Slots<T> {
    slots: Box<[Slot<T>]>,
}

impl<T> Slots<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::Free).collect(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots (reserved ones excluded).
    pub(crate) fn len(&self) -> usize {
        self.iter().count()
    }

    /// Claims the lowest-index free slot.
    pub(crate) fn reserve(&mut self) -> Option<usize> {
        let idx = self.slots.iter().position(|s| matches!(s, Slot::Free))?;
        self.slots[idx] = Slot::Reserved;

        Some(idx)
    }

    /// Stores `value` in a slot previously returned by [Slots::reserve].
    pub(crate) fn fill(&mut self, idx: usize, value: T) {
        debug_assert!(matches!(self.slots[idx], Slot::Reserved));
        self.slots[idx] = Slot::Occupied(value);
    }

    /// Frees a slot, reserved or occupied, returning its occupant.
    pub(crate) fn release(&mut self, idx: usize) -> Option<T> {
        match std::mem::replace(self.slots.get_mut(idx)?, Slot::Free) {
            Slot::Occupied(value) => Some(value),
            Slot::Free | Slot::Reserved => None,
        }
    }

    pub(crate) fn get(&self, idx: usize) -> Option<&T> {
        match self.slots.get(idx)? {
            Slot::Occupied(value) => Some(value),
            Slot::Free | Slot::Reserved => None,
        }
    }

    pub(crate) fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        match self.slots.get_mut(idx)? {
            Slot::Occupied(value) => Some(value),
            Slot::Free | Slot::Reserved => None,
        }
    }

    /// Iterates over occupied slots in index order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots.iter().enumerate().filter_map(|(idx, s)| match s {
            Slot::Occupied(value) => Some((idx, value)),
            Slot::Free | Slot::Reserved => None,
        })
    }

    /// Index of the first occupant matching `pred`.
    pub(crate) fn position(&self, mut pred: impl FnMut(&T) -> bool) -> Option<usize> {
        self.iter().find(|(_, value)| pred(value)).map(|(idx, _)| idx)
    }
}
