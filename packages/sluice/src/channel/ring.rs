// ring buffer part of a channel.

use std::{
    mem::MaybeUninit,
    ptr::drop_in_place,
};


// storage capacity in elements upon first allocating.
pub(crate) const INITIAL_RING_CAP: usize = 8;


// growable ring buffer of `T`, used as the storage of bounded and unlimited channels.
//
// storage grows geometrically from INITIAL_RING_CAP. if a limit is set, storage never grows past
// it, and pushing while at the limit is a bug in the caller.
pub(crate) struct Ring<T> {
    // memory layout:
    //
    // - a "logical index" (front is 0) exists if it's in [0, len)
    // - a logical index N maps to the storage index (start + N) % storage.len()
    // - storage locations are assumed to be initialized iff a logical index maps to them
    start: usize,
    len: usize,
    // we don't need to use Option because we rely on stdlib to fake the heap allocation of ZSTs
    storage: Box<[MaybeUninit<T>]>,
    // maximum storage size in elements, if any.
    limit: Option<usize>,
}

impl<T> Ring<T> {
    // construct empty without allocating.
    pub(crate) fn new(limit: Option<usize>) -> Self {
        debug_assert!(limit != Some(0), "zero-limit ring (internal bug)");
        Ring {
            start: 0,
            len: 0,
            storage: Box::new_uninit_slice(0),
            limit,
        }
    }

    // elements in ring.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    // whether pushing would exceed the limit.
    pub(crate) fn is_full(&self) -> bool {
        self.limit.is_some_and(|n| self.len >= n)
    }

    // currently allocated capacity.
    pub(crate) fn allocated(&self) -> usize {
        self.storage.len()
    }

    // convert from logical index to storage index.
    fn storage_idx(&self, idx: usize) -> usize {
        debug_assert!(idx < self.len, "Ring index out of bounds (internal bug)");
        (self.start + idx) % self.storage.len()
    }

    // re-allocate storage at a larger size, moving elements to the front of the new storage.
    fn grow(&mut self) {
        let mut new_cap = (self.storage.len() * 2).max(INITIAL_RING_CAP);
        if let Some(limit) = self.limit {
            new_cap = new_cap.min(limit);
        }
        debug_assert!(new_cap > self.storage.len());
        let mut new_storage = Box::new_uninit_slice(new_cap);
        for i in 0..self.len {
            let idx = self.storage_idx(i);
            // safety: idx maps to an initialized location, which we treat as uninitialized after
            //         this loop by replacing the storage wholesale.
            new_storage[i].write(unsafe { self.storage[idx].as_ptr().read() });
        }
        // dropping a box of MaybeUninit doesn't drop the moved-out elements
        self.storage = new_storage;
        self.start = 0;
    }

    // push to back. panics if full.
    pub(crate) fn push(&mut self, elem: T) {
        assert!(!self.is_full(), "push into full Ring (internal bug)");
        if self.len == self.storage.len() {
            self.grow();
        }
        let idx = (self.start + self.len) % self.storage.len();
        self.storage[idx].write(elem);
        self.len += 1;
    }

    // pop from front.
    pub(crate) fn pop(&mut self) -> Option<T> {
        if self.len == 0 { return None; }
        let idx = self.storage_idx(0);
        // safety: idx maps to an initialized location, which is then unmapped
        let elem = unsafe { self.storage[idx].as_ptr().read() };
        self.start = (self.start + 1) % self.storage.len();
        self.len -= 1;
        Some(elem)
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // drop initialized elements
        for i in 0..self.len {
            let idx = self.storage_idx(i);
            unsafe { drop_in_place(self.storage[idx].as_mut_ptr()); }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rand_pcg::Pcg32;
    use std::{
        collections::VecDeque,
        rc::Rc,
    };

    fn new_rng() -> impl Rng {
        Pcg32::from_seed(0xdeadbeefdeadbeefdeadbeefdeadbeefu128.to_le_bytes())
    }

    fn equivalence_test(limit: Option<usize>) {
        let mut rng = new_rng();

        for _ in 0..20 {
            let mut queue_1 = VecDeque::<u32>::new();
            let mut queue_2 = Ring::<u32>::new(limit);
            for i in 0u32..5_000 {
                if rng.gen_ratio(52, 100) {
                    if queue_2.is_full() {
                        assert_eq!(Some(queue_1.len()), limit);
                        continue;
                    }
                    queue_1.push_back(i);
                    queue_2.push(i);
                } else {
                    assert_eq!(queue_2.pop(), queue_1.pop_front());
                }
                assert_eq!(queue_1.len(), queue_2.len());
                if let Some(limit) = limit {
                    assert!(queue_2.len() <= limit);
                    assert!(queue_2.allocated() <= limit);
                }
            }
            while let Some(elem) = queue_1.pop_front() {
                assert_eq!(queue_2.pop(), Some(elem));
            }
            assert_eq!(queue_2.pop(), None);
        }
    }

    #[test]
    fn unlimited_equivalence() {
        equivalence_test(None);
    }

    #[test]
    fn limited_equivalence() {
        for limit in [1, 2, 3, 7, 8, 9, 100] {
            equivalence_test(Some(limit));
        }
    }

    #[test]
    fn growth_is_geometric() {
        let mut ring = Ring::new(None);
        assert_eq!(ring.allocated(), 0);
        ring.push(0);
        assert_eq!(ring.allocated(), INITIAL_RING_CAP);
        for i in 1..=INITIAL_RING_CAP {
            ring.push(i);
        }
        assert_eq!(ring.allocated(), INITIAL_RING_CAP * 2);
        for i in 0..=INITIAL_RING_CAP {
            assert_eq!(ring.pop(), Some(i));
        }
    }

    #[test]
    fn growth_respects_limit() {
        let mut ring = Ring::new(Some(10));
        for i in 0..10 {
            ring.push(i);
        }
        assert!(ring.is_full());
        assert_eq!(ring.allocated(), 10);
    }

    #[test]
    fn drops_remaining_elems() {
        let elem = Rc::new(());
        let mut ring = Ring::new(None);
        for _ in 0..20 {
            ring.push(Rc::clone(&elem));
        }
        // leave start non-zero so the drop walks a wrapped range
        for _ in 0..5 {
            drop(ring.pop());
        }
        assert_eq!(Rc::strong_count(&elem), 16);
        drop(ring);
        assert_eq!(Rc::strong_count(&elem), 1);
    }

    #[test]
    fn zero_sized_elems() {
        let mut ring = Ring::new(Some(3));
        ring.push(());
        ring.push(());
        assert_eq!(ring.pop(), Some(()));
        ring.push(());
        ring.push(());
        assert!(ring.is_full());
        assert_eq!(ring.len(), 3);
    }
}
