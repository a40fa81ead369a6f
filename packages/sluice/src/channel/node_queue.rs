// linked waiter nodes part of channel.

use super::select::SelectBlock;
use std::{
    ptr::NonNull,
    sync::Arc,
    task::Waker,
};


// debug-only validity markers, to surface use-after-release of a node as a panic.
#[cfg(debug_assertions)]
const MARKER_LIVE: u32 = 0x5_1ce_11e;
#[cfg(debug_assertions)]
const MARKER_RELEASED: u32 = 0xdead_0de;


// intrusively linked FIFO queue of waiter nodes.
//
// the queue links nodes but never owns them: each node allocation is owned by the NodeHandle of
// the pending operation it represents. all access to a linked node's fields, by anyone, happens
// through a `&mut NodeQueue` obtained while holding the channel's lock.
pub(crate) struct NodeQueue<T> {
    // front and back of queue, unless queue is empty.
    front_back: Option<(NonNull<NodeAlloc<T>>, NonNull<NodeAlloc<T>>)>,
    // number of linked nodes.
    len: usize,
}

// handle to a node allocation. this handle owns the allocation:
//
// - while not linked, only the handle's owner references the allocation.
// - while linked, the allocation is also reachable from the queue, and may be unlinked and
//   resolved by whichever path wins the waiter. the handle's owner must hold the channel lock to
//   observe that.
// - the handle must only be dropped (deallocating) once the owner has observed it to be unlinked
//   under the lock.
pub(crate) struct NodeHandle<T> {
    ptr: NonNull<NodeAlloc<T>>,
}

// heap allocation for node.
struct NodeAlloc<T> {
    #[cfg(debug_assertions)]
    marker: u32,
    // next node towards back.
    to_back: Option<NonNull<NodeAlloc<T>>>,
    // next node towards front.
    to_front: Option<NonNull<NodeAlloc<T>>>,
    // whether currently linked into a queue.
    linked: bool,
    // the part other paths may read and write.
    waiter: Waiter<T>,
}

// the pending operation a node represents.
pub(crate) struct Waiter<T> {
    // waker of the parked unit, taken by whoever resolves the waiter.
    pub(crate) waker: Option<Waker>,
    // for a send waiter, the message until it is taken. for a recv waiter, the delivered message.
    pub(crate) slot: Option<T>,
    // transitions out of Waiting exactly once, by whoever wins the waiter.
    pub(crate) status: Status,
    // if this waiter is one clause of a select, the shared block and this clause's index.
    pub(crate) select: Option<(Arc<SelectBlock>, usize)>,
}

// resolution status of a waiter.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Status {
    // still parked.
    Waiting,
    // resolved by a counterpart transferring the message.
    Done,
    // resolved by the channel closing.
    Closed,
}

impl<T> Waiter<T> {
    // whether another party may resolve this waiter right now. for select waiters, this attempts
    // the atomic claim, and if it succeeds, the caller is obligated to resolve the waiter.
    //
    // `exclude` is a select block whose waiters must never match, because they belong to the
    // select the caller is acting on behalf of.
    fn try_claim(&self, exclude: Option<&SelectBlock>) -> bool {
        debug_assert_eq!(self.status, Status::Waiting);
        match &self.select {
            None => true,
            Some((block, idx)) => {
                if exclude.is_some_and(|ex| std::ptr::eq(ex, &**block)) {
                    return false;
                }
                block.claim(*idx)
            }
        }
    }

    // like try_claim, but without claiming.
    fn is_claimable(&self, exclude: Option<&SelectBlock>) -> bool {
        match &self.select {
            None => true,
            Some((block, _)) => {
                !exclude.is_some_and(|ex| std::ptr::eq(ex, &**block)) && !block.is_claimed()
            }
        }
    }

    // resolve this waiter and wake it. must only be called by the winner of the waiter.
    pub(crate) fn resolve(&mut self, status: Status) {
        debug_assert_eq!(self.status, Status::Waiting, "waiter resolved twice");
        debug_assert_ne!(status, Status::Waiting);
        self.status = status;
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

impl<T> NodeAlloc<T> {
    #[inline]
    fn check(&self) {
        #[cfg(debug_assertions)]
        assert_eq!(self.marker, MARKER_LIVE, "access to released waiter node");
    }
}

impl<T> NodeQueue<T> {
    // construct empty queue.
    pub(crate) fn new() -> Self {
        NodeQueue { front_back: None, len: 0 }
    }

    // number of linked nodes, including ones that can no longer be claimed.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    // link the node to the back of this queue.
    //
    // UB if the node is linked.
    pub(crate) unsafe fn push(&mut self, node: &mut NodeHandle<T>) {
        let alloc = node.ptr.as_mut();
        alloc.check();
        debug_assert!(!alloc.linked, "UB");
        debug_assert!(alloc.to_front.is_none());
        debug_assert!(alloc.to_back.is_none());

        alloc.linked = true;
        self.len += 1;
        if let &mut Some((_, ref mut back)) = &mut self.front_back {
            // node becomes new back, and new to_back of previous back
            let back_alloc = back.as_mut();
            debug_assert!(back_alloc.to_back.is_none());
            back_alloc.to_back = Some(node.ptr);
            alloc.to_front = Some(*back);
            *back = node.ptr;
        } else {
            // edge case: node becomes only node in queue
            self.front_back = Some((node.ptr, node.ptr));
        }
    }

    // unlink the node at the given pointer.
    //
    // UB if the node is not linked into this queue.
    unsafe fn unlink(&mut self, ptr: NonNull<NodeAlloc<T>>) {
        let alloc = &mut *ptr.as_ptr();
        alloc.check();
        debug_assert!(alloc.linked, "UB");

        alloc.linked = false;
        self.len -= 1;
        let to_front = alloc.to_front.take();
        let to_back = alloc.to_back.take();
        let (mut front, mut back) = self.front_back.expect("unlink from empty NodeQueue (UB)");
        if to_front.is_none() && to_back.is_none() {
            // edge case: node was only node in queue
            debug_assert!(front == ptr && back == ptr);
            self.front_back = None;
            return;
        }

        if let Some(mut to_front) = to_front {
            // node's to_back becomes new to_back of node's to_front
            debug_assert_eq!(to_front.as_ref().to_back, Some(ptr));
            to_front.as_mut().to_back = to_back;
        } else {
            // edge case: node was at the front of queue (but is not the back)
            debug_assert!(front == ptr);
            front = to_back.unwrap();
        }

        if let Some(mut to_back) = to_back {
            // node's to_front becomes new to_front of node's to_back
            debug_assert_eq!(to_back.as_ref().to_front, Some(ptr));
            to_back.as_mut().to_front = to_front;
        } else {
            // edge case: node was at the back of queue (but is not the front)
            debug_assert!(back == ptr);
            back = to_front.unwrap();
        }
        self.front_back = Some((front, back));
    }

    // unlink the node from this queue if it is still linked. returns whether it was linked.
    //
    // UB if the node is linked into a different queue.
    pub(crate) unsafe fn remove(&mut self, node: &mut NodeHandle<T>) -> bool {
        if node.ptr.as_ref().linked {
            self.unlink(node.ptr);
            true
        } else {
            false
        }
    }

    // borrow the node's waiter, which is only sound while holding the lock this queue lives in.
    //
    // UB if the node is linked into a different queue.
    pub(crate) unsafe fn waiter<'a>(&'a mut self, node: &'a mut NodeHandle<T>) -> &'a mut Waiter<T> {
        let alloc = node.ptr.as_mut();
        alloc.check();
        &mut alloc.waiter
    }

    // unlink and return the first waiter that can be claimed, discarding waiters belonging to
    // selects that were already won elsewhere. the caller must resolve the returned waiter.
    pub(crate) fn claim_front(&mut self, exclude: Option<&SelectBlock>) -> Option<&mut Waiter<T>> {
        unsafe {
            let mut next = self.front_back.map(|(front, _)| front);
            while let Some(curr) = next {
                let (claimed, inert) = {
                    let alloc = curr.as_ref();
                    alloc.check();
                    next = alloc.to_back;
                    let claimed = alloc.waiter.try_claim(exclude);
                    let inert = !claimed && alloc.waiter.select.as_ref()
                        .is_some_and(|(block, _)| {
                            !exclude.is_some_and(|ex| std::ptr::eq(ex, &**block))
                        });
                    (claimed, inert)
                };
                if claimed {
                    self.unlink(curr);
                    return Some(&mut (*curr.as_ptr()).waiter);
                }
                if inert {
                    // its select already won on a different clause. the select's owner will
                    // observe it unlinked and not touch anything else.
                    self.unlink(curr);
                }
            }
            None
        }
    }

    // whether claim_front would currently find a waiter.
    pub(crate) fn has_claimable(&self, exclude: Option<&SelectBlock>) -> bool {
        unsafe {
            let mut next = self.front_back.map(|(front, _)| front);
            while let Some(curr) = next {
                let alloc = curr.as_ref();
                alloc.check();
                if alloc.waiter.is_claimable(exclude) {
                    return true;
                }
                next = alloc.to_back;
            }
            false
        }
    }

    // unlink every node, resolving each claimable one as closed. this is the single disposal path
    // for waiters when a channel closes. returns the number of waiters resolved.
    pub(crate) fn drain_closed(&mut self) -> usize {
        let mut resolved = 0;
        while let Some(waiter) = self.claim_front(None) {
            waiter.resolve(Status::Closed);
            resolved += 1;
        }
        debug_assert!(self.front_back.is_none());
        resolved
    }
}

impl<T> NodeHandle<T> {
    // construct un-linked node allocation.
    pub(crate) fn new() -> Self {
        let alloc = Box::new(NodeAlloc {
            #[cfg(debug_assertions)]
            marker: MARKER_LIVE,
            to_back: None,
            to_front: None,
            linked: false,
            waiter: Waiter {
                waker: None,
                slot: None,
                status: Status::Waiting,
                select: None,
            },
        });
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(alloc)) };
        NodeHandle { ptr }
    }

    // reset an unlinked node so it can be reused. returns the slot contents.
    //
    // UB if the node is linked.
    pub(crate) unsafe fn reset(&mut self) -> Option<T> {
        let alloc = self.ptr.as_mut();
        alloc.check();
        debug_assert!(!alloc.linked, "UB");
        alloc.waiter.waker = None;
        alloc.waiter.status = Status::Waiting;
        alloc.waiter.select = None;
        alloc.waiter.slot.take()
    }
}

impl<T> Drop for NodeQueue<T> {
    fn drop(&mut self) {
        // every linked node belongs to a pending operation, which keeps the channel alive
        debug_assert!(self.front_back.is_none(), "NodeQueue dropped with linked nodes");
    }
}

impl<T> Drop for NodeHandle<T> {
    fn drop(&mut self) {
        unsafe {
            let alloc = self.ptr.as_mut();
            alloc.check();
            // freeing a linked node would leave a dangling pointer in its queue
            assert!(!alloc.linked, "waiter node dropped while linked");
            #[cfg(debug_assertions)]
            {
                alloc.marker = MARKER_RELEASED;
            }
            drop(Box::from_raw(self.ptr.as_ptr()));
        }
    }
}


unsafe impl<T: Send> Send for NodeHandle<T> {}
unsafe impl<T: Send> Sync for NodeHandle<T> {}

unsafe impl<T: Send> Send for NodeQueue<T> {}
unsafe impl<T: Send> Sync for NodeQueue<T> {}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering::SeqCst},
        task::Wake,
    };

    struct CountWake(AtomicUsize);

    impl Wake for CountWake {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, SeqCst);
        }
    }

    fn parked(queue: &mut NodeQueue<u32>, slot: Option<u32>) -> (NodeHandle<u32>, Arc<CountWake>) {
        let count = Arc::new(CountWake(AtomicUsize::new(0)));
        let mut node = NodeHandle::new();
        unsafe {
            let waiter = queue.waiter(&mut node);
            waiter.slot = slot;
            waiter.waker = Some(Waker::from(Arc::clone(&count)));
            queue.push(&mut node);
        }
        (node, count)
    }

    #[test]
    fn claims_in_fifo_order() {
        let mut queue = NodeQueue::new();
        let (mut a, _) = parked(&mut queue, Some(1));
        let (mut b, _) = parked(&mut queue, Some(2));
        let (mut c, _) = parked(&mut queue, Some(3));
        assert_eq!(queue.len(), 3);

        for expect in 1..=3 {
            let waiter = queue.claim_front(None).unwrap();
            assert_eq!(waiter.slot.take(), Some(expect));
            waiter.resolve(Status::Done);
        }
        assert!(queue.claim_front(None).is_none());
        assert_eq!(queue.len(), 0);
        unsafe {
            for node in [&mut a, &mut b, &mut c] {
                assert!(!queue.remove(node));
                assert_eq!(queue.waiter(node).status, Status::Done);
            }
        }
    }

    #[test]
    fn remove_from_middle() {
        let mut queue = NodeQueue::new();
        let (mut a, _) = parked(&mut queue, Some(1));
        let (mut b, _) = parked(&mut queue, Some(2));
        let (mut c, _) = parked(&mut queue, Some(3));
        unsafe {
            assert!(queue.remove(&mut b));
            assert!(!queue.remove(&mut b));
        }
        assert_eq!(queue.claim_front(None).unwrap().slot, Some(1));
        assert_eq!(queue.claim_front(None).unwrap().slot, Some(3));
        unsafe {
            assert!(!queue.remove(&mut a));
            assert!(!queue.remove(&mut c));
        }
    }

    #[test]
    fn drain_wakes_each_waiter_once() {
        let mut queue = NodeQueue::new();
        let mut nodes = Vec::new();
        for i in 0..5 {
            nodes.push(parked(&mut queue, Some(i)));
        }
        assert_eq!(queue.drain_closed(), 5);
        assert_eq!(queue.drain_closed(), 0);
        for (node, count) in &mut nodes {
            assert_eq!(count.0.load(SeqCst), 1);
            unsafe {
                let waiter = queue.waiter(node);
                assert_eq!(waiter.status, Status::Closed);
                assert!(waiter.waker.is_none());
            }
        }
    }

    #[test]
    fn skips_and_discards_claimed_select_waiters() {
        let block = Arc::new(SelectBlock::new());
        let mut queue = NodeQueue::new();
        let (mut a, count_a) = parked(&mut queue, Some(1));
        let (mut b, _) = parked(&mut queue, Some(2));
        unsafe {
            queue.waiter(&mut a).select = Some((Arc::clone(&block), 0));
        }
        // the select won on some other clause
        assert!(block.claim(1));
        assert!(queue.has_claimable(None));
        let waiter = queue.claim_front(None).unwrap();
        assert_eq!(waiter.slot, Some(2));
        waiter.resolve(Status::Done);
        // the inert waiter was unlinked but not resolved or woken
        assert_eq!(queue.len(), 0);
        assert_eq!(count_a.0.load(SeqCst), 0);
        unsafe {
            assert!(!queue.remove(&mut a));
            assert!(!queue.remove(&mut b));
            assert_eq!(queue.waiter(&mut a).status, Status::Waiting);
        }
    }

    #[test]
    fn excluded_select_waiters_are_skipped_but_kept() {
        let block = Arc::new(SelectBlock::new());
        let mut queue = NodeQueue::new();
        let (mut a, _) = parked(&mut queue, None);
        unsafe {
            queue.waiter(&mut a).select = Some((Arc::clone(&block), 0));
        }
        assert!(!queue.has_claimable(Some(&block)));
        assert!(queue.claim_front(Some(&block)).is_none());
        assert_eq!(queue.len(), 1);
        assert!(!block.is_claimed());
        unsafe {
            assert!(queue.remove(&mut a));
        }
    }

    #[test]
    #[should_panic(expected = "dropped while linked")]
    fn dropping_linked_node_panics() {
        let mut queue = NodeQueue::<u32>::new();
        let (node, _) = parked(&mut queue, None);
        // leak the queue so only the node's own check fires
        std::mem::forget(queue);
        drop(node);
    }
}
