//! Generational slot storage for [`crate::handle::CoroutineHandle`]s.
//!
//! Adapted from the slot-map pattern used for task registries elsewhere in
//! the workspace: a stable key survives in-place updates, and once a slot is
//! vacated its key can never silently alias a later occupant because the
//! generation counter moves forward.

use std::fmt;

/// Stable key identifying one [`crate::handle::CoroutineHandle`] for the
/// lifetime of its occupied slot. A `HandleId` captured before its slot is
/// reused will simply fail every lookup afterwards rather than pointing at
/// whatever was allocated into the reclaimed slot.
#[derive(Clone, Copy, Hash, PartialEq, Eq)]
pub struct HandleId {
    pub(crate) slot: usize,
    pub(crate) gen: usize,
}

impl fmt::Debug for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleId({}#{})", self.slot, self.gen)
    }
}

#[derive(Default)]
pub(crate) struct Slots<T> {
    items: Vec<(usize, Option<T>)>,
    free: Vec<HandleId>,
}

impl<T> Slots<T> {
    pub(crate) fn new() -> Self {
        Self {
            items: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, item: T) -> HandleId {
        let id = match self.free.pop() {
            Some(mut reused) => {
                reused.gen += 1;
                reused
            }
            None => HandleId {
                slot: self.items.len(),
                gen: 0,
            },
        };

        if self.items.len() == id.slot {
            self.items.push((id.gen, Some(item)));
        } else {
            self.items[id.slot] = (id.gen, Some(item));
        }

        id
    }

    pub(crate) fn get(&self, id: &HandleId) -> Option<&T> {
        self.items
            .get(id.slot)
            .filter(|(gen, value)| *gen == id.gen && value.is_some())
            .and_then(|(_, value)| value.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: &HandleId) -> Option<&mut T> {
        self.items
            .get_mut(id.slot)
            .filter(|(gen, value)| *gen == id.gen && value.is_some())
            .and_then(|(_, value)| value.as_mut())
    }

    pub(crate) fn has(&self, id: &HandleId) -> bool {
        self.get(id).is_some()
    }

    /// Removes the value at `id`, freeing the slot for reuse. Returns the
    /// removed value if the id was still valid.
    pub(crate) fn take(&mut self, id: &HandleId) -> Option<T> {
        let slot = self.items.get_mut(id.slot)?;
        if slot.0 != id.gen {
            return None;
        }
        let value = slot.1.take();
        if value.is_some() {
            self.free.push(*id);
        }
        value
    }

    /// Count of occupied slots (handles not yet removed).
    pub(crate) fn active_slots(&self) -> usize {
        self.items.len() - self.free.len()
    }

    /// All ids for currently-occupied slots, in slot order (not meaningful
    /// as traversal order — callers needing insertion order track it
    /// themselves, as `Scheduler` does via its `roots` and `children` lists).
    pub(crate) fn ids(&self) -> Vec<HandleId> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, (_, value))| value.is_some())
            .map(|(slot, (gen, _))| HandleId { slot, gen: *gen })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_round_trip() {
        let mut slots: Slots<&str> = Slots::new();
        let id = slots.insert("a");
        assert_eq!(slots.get(&id), Some(&"a"));
        assert_eq!(slots.active_slots(), 1);
    }

    #[test]
    fn take_frees_slot_and_invalidates_id() {
        let mut slots: Slots<&str> = Slots::new();
        let id = slots.insert("a");
        assert_eq!(slots.take(&id), Some("a"));
        assert_eq!(slots.get(&id), None);
        assert_eq!(slots.active_slots(), 0);
    }

    #[test]
    fn reused_slot_bumps_generation_and_orphans_old_id() {
        let mut slots: Slots<&str> = Slots::new();
        let first = slots.insert("a");
        slots.take(&first);
        let second = slots.insert("b");

        assert_eq!(second.slot, first.slot);
        assert_eq!(second.gen, first.gen + 1);
        assert_eq!(slots.get(&first), None);
        assert_eq!(slots.get(&second), Some(&"b"));
    }

    #[test]
    fn ids_lists_only_occupied_slots() {
        let mut slots: Slots<i32> = Slots::new();
        let a = slots.insert(1);
        let b = slots.insert(2);
        slots.take(&a);
        assert_eq!(slots.ids(), vec![b]);
    }
}
