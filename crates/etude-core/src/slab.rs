// src/slab.rs

/// Connection set of one worker. Indices stay stable while a connection
/// lives and are reused after it is freed, so callbacks capture the index
/// instead of a reference.
pub struct ConnectionSlab<T> {
    entries: Vec<Slot<T>>,
    head_free: Option<usize>,
    active_count: usize,
    capacity: usize,
}

enum Slot<T> {
    Occupied(T),
    Vacant { next: Option<usize> },
}

impl<T> ConnectionSlab<T> {
    /// Entries are allocated lazily, up to `capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity.min(1024)),
            head_free: None,
            active_count: 0,
            capacity,
        }
    }

    /// O(1) allocation. Returns `None` when the slab is full.
    #[inline]
    pub fn allocate(&mut self, value: T) -> Option<usize> {
        let idx = match self.head_free {
            Some(idx) => {
                let Slot::Vacant { next } = self.entries[idx] else {
                    return None;
                };
                self.head_free = next;
                self.entries[idx] = Slot::Occupied(value);
                idx
            }
            None if self.entries.len() < self.capacity => {
                self.entries.push(Slot::Occupied(value));
                self.entries.len() - 1
            }
            None => return None,
        };
        self.active_count += 1;
        Some(idx)
    }

    /// O(1) deallocation. Freeing a vacant or out-of-range index is a no-op.
    #[inline]
    pub fn free(&mut self, index: usize) -> Option<T> {
        let slot = self.entries.get_mut(index)?;
        if matches!(slot, Slot::Vacant { .. }) {
            return None;
        }
        let old = std::mem::replace(
            slot,
            Slot::Vacant {
                next: self.head_free,
            },
        );
        self.head_free = Some(index);
        self.active_count -= 1;
        match old {
            Slot::Occupied(value) => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&T> {
        match self.entries.get(index)? {
            Slot::Occupied(value) => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        match self.entries.get_mut(index)? {
            Slot::Occupied(value) => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    /// Indices of live entries, ascending.
    pub fn ids(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, Slot::Occupied(_)))
            .map(|(idx, _)| idx)
            .collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.active_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_operations() {
        let mut slab = ConnectionSlab::new(10);

        assert_eq!(slab.len(), 0);
        assert_eq!(slab.capacity(), 10);

        let idx1 = slab.allocate(100).unwrap();
        assert_eq!(idx1, 0);
        assert_eq!(slab.get(idx1), Some(&100));

        let idx2 = slab.allocate(101).unwrap();
        assert_eq!(idx2, 1);

        assert_eq!(slab.free(idx1), Some(100));
        assert_eq!(slab.len(), 1);
        assert_eq!(slab.get(idx1), None);

        // Index 0 went to the head of the free list.
        let idx3 = slab.allocate(102).unwrap();
        assert_eq!(idx3, 0);
        assert_eq!(slab.ids(), vec![0, 1]);
    }

    #[test]
    fn test_slab_double_free() {
        let mut slab = ConnectionSlab::new(4);
        let idx = slab.allocate("a").unwrap();
        assert_eq!(slab.free(idx), Some("a"));
        assert_eq!(slab.free(idx), None);
        assert_eq!(slab.free(99), None);
        assert!(slab.is_empty());
    }

    #[test]
    fn test_slab_full() {
        let mut slab = ConnectionSlab::new(2);
        assert!(slab.allocate(1).is_some());
        assert!(slab.allocate(2).is_some());
        assert!(slab.allocate(3).is_none());
        slab.free(0);
        assert_eq!(slab.allocate(4), Some(0));
    }
}
