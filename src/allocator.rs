use crate::core::layout::SlotId;
use std::collections::BTreeSet;

/// Free list of slot ids in `[0, capacity)`.
///
/// Not synchronised: the environment manager keeps it inside its state lock.
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    free: BTreeSet<SlotId>,
    capacity: usize,
}

impl SlotAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: (0..capacity).map(SlotId).collect(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lowest free id, or `None` when every slot is outstanding.
    pub fn acquire(&mut self) -> Option<SlotId> {
        self.free.pop_first()
    }

    /// Return an outstanding id.
    ///
    /// # Panics
    /// On an out-of-range id or one that is already free; both mean the
    /// caller lost track of slot ownership.
    pub fn release(&mut self, slot: SlotId) {
        assert!(
            slot.index() < self.capacity,
            "slot {slot} released outside capacity {}",
            self.capacity
        );
        assert!(self.free.insert(slot), "slot {slot} released twice");
    }

    pub fn is_free(&self, slot: SlotId) -> bool {
        self.free.contains(&slot)
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn outstanding(&self) -> usize {
        self.capacity - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_acquire_hands_out_lowest_first() {
        let mut allocator = SlotAllocator::new(3);
        assert_eq!(allocator.acquire(), Some(SlotId(0)));
        assert_eq!(allocator.acquire(), Some(SlotId(1)));
        allocator.release(SlotId(0));
        assert_eq!(allocator.acquire(), Some(SlotId(0)));
        assert_eq!(allocator.acquire(), Some(SlotId(2)));
        assert_eq!(allocator.acquire(), None);
        assert_eq!(allocator.outstanding(), 3);
    }

    #[test]
    fn test_zero_capacity_has_nothing_to_give() {
        let mut allocator = SlotAllocator::new(0);
        assert_eq!(allocator.acquire(), None);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn test_double_release_panics() {
        let mut allocator = SlotAllocator::new(2);
        let slot = allocator.acquire().unwrap();
        allocator.release(slot);
        allocator.release(slot);
    }

    #[test]
    #[should_panic(expected = "outside capacity")]
    fn test_out_of_range_release_panics() {
        let mut allocator = SlotAllocator::new(2);
        allocator.release(SlotId(2));
    }

    proptest! {
        #[test]
        fn prop_outstanding_ids_are_distinct_and_in_range(
            capacity in 0usize..16,
            ops in proptest::collection::vec(any::<bool>(), 0..64),
        ) {
            let mut allocator = SlotAllocator::new(capacity);
            let mut held: Vec<SlotId> = Vec::new();
            for acquire in ops {
                if acquire {
                    match allocator.acquire() {
                        Some(slot) => {
                            prop_assert!(slot.index() < capacity);
                            prop_assert!(!held.contains(&slot));
                            held.push(slot);
                        }
                        None => prop_assert_eq!(held.len(), capacity),
                    }
                } else if let Some(slot) = held.pop() {
                    allocator.release(slot);
                }
                prop_assert_eq!(allocator.outstanding(), held.len());
                for slot in &held {
                    prop_assert!(!allocator.is_free(*slot));
                }
            }
        }
    }
}
