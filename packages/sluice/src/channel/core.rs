// minimal safe API for the channel. the exposed API is a convenience wrapper around this.

use super::{
    ring::Ring,
    node_queue::{NodeQueue, NodeHandle, Status, Waiter},
    select::SelectBlock,
    kind::ChannelKind,
    polling::DropWakers,
};
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{
            Ordering::Relaxed,
            AtomicBool,
            AtomicU64,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
    task::{Poll, Context},
};


const NODE_POOL_SIZE: usize = 4;


// handle to a channel.
pub(crate) struct Channel<T>(Arc<Shared<T>>);

// channel shared state.
struct Shared<T> {
    // mutex around lockable state.
    lockable: Mutex<Lockable<T>>,
    // immutable after creation.
    kind: ChannelKind,
    // mirrors Lockable.closed, for reading without locking. only ever changes false -> true, and
    // only while locked.
    closed: AtomicBool,
    // monotonic operation counters.
    counters: Counters,
}

// monotonic counters of operation outcomes.
#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) sent: AtomicU64,
    pub(crate) received: AtomicU64,
    pub(crate) send_failed: AtomicU64,
    pub(crate) recv_failed: AtomicU64,
}

// channel lockable state.
struct Lockable<T> {
    // storage for buffered elements, shaped by the channel kind.
    storage: Storage<T>,
    // messages handed to a recv which was dropped before taking them. received ahead of storage.
    requeued: Ring<T>,
    // whether close has been called.
    closed: bool,
    // node queue for parked send operations.
    send_nodes: NodeQueue<T>,
    // node queue for parked recv operations.
    recv_nodes: NodeQueue<T>,
    // pool of spare unlinked node allocations.
    node_pool: [Option<NodeHandle<T>>; NODE_POOL_SIZE],
}

// per-kind element storage. a rendezvous channel has none: its handoff cell is the slot of the
// parked sender at the front of the send node queue.
enum Storage<T> {
    Rendezvous,
    Bounded(Ring<T>),
    Conflated(Option<T>),
    Unlimited(Ring<T>),
}

// why an operation stopped without transferring.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Halt {
    // the channel is closed (and, for recv, drained).
    Closed,
    // the operation could not complete without parking.
    WouldBlock,
    // the operation was withdrawn by its owner before being resolved.
    Withdrawn,
}

// which queue a node belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Side {
    Send,
    Recv,
}

impl<T> Storage<T> {
    fn new(kind: ChannelKind) -> Self {
        match kind {
            ChannelKind::Rendezvous => Storage::Rendezvous,
            ChannelKind::Bounded(n) => Storage::Bounded(Ring::new(Some(n))),
            ChannelKind::Conflated => Storage::Conflated(None),
            ChannelKind::Unlimited => Storage::Unlimited(Ring::new(None)),
        }
    }

    fn len(&self) -> usize {
        match self {
            Storage::Rendezvous => 0,
            Storage::Bounded(ring) | Storage::Unlimited(ring) => ring.len(),
            Storage::Conflated(slot) => slot.is_some() as usize,
        }
    }

    // whether a message could be buffered right now.
    fn has_space(&self) -> bool {
        match self {
            Storage::Rendezvous => false,
            Storage::Bounded(ring) => !ring.is_full(),
            Storage::Conflated(_) | Storage::Unlimited(_) => true,
        }
    }

    // buffer a message. caller must have checked has_space.
    fn push(&mut self, msg: T) {
        match self {
            Storage::Rendezvous => unreachable!("push into rendezvous storage (internal bug)"),
            Storage::Bounded(ring) | Storage::Unlimited(ring) => ring.push(msg),
            // the previous value, if any, is evicted in favor of the newest
            Storage::Conflated(slot) => *slot = Some(msg),
        }
    }

    fn pop(&mut self) -> Option<T> {
        match self {
            Storage::Rendezvous => None,
            Storage::Bounded(ring) | Storage::Unlimited(ring) => ring.pop(),
            Storage::Conflated(slot) => slot.take(),
        }
    }
}

impl<T> Channel<T> {
    // construct empty channel. the kind must already be validated.
    pub(crate) fn new(kind: ChannelKind) -> Self {
        Channel(Arc::new(Shared {
            lockable: Mutex::new(Lockable {
                storage: Storage::new(kind),
                requeued: Ring::new(None),
                closed: false,
                send_nodes: NodeQueue::new(),
                recv_nodes: NodeQueue::new(),
                node_pool: [None, None, None, None],
            }),
            kind,
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        }))
    }

    // clone another handle to the channel.
    pub(crate) fn clone(&self) -> Self {
        Channel(Arc::clone(&self.0))
    }

    // whether two handles refer to the same channel.
    pub(crate) fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn kind(&self) -> ChannelKind {
        self.0.kind
    }

    // atomic-read the closed flag.
    pub(crate) fn is_closed(&self) -> bool {
        self.0.closed.load(Relaxed)
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.0.counters
    }

    // lock the channel
    pub(crate) fn lock(&self) -> Lock<'_, T> {
        Lock {
            shared: &self.0,
            lock: self.0.lockable.lock().unwrap(),
        }
    }

    // construct a send future.
    pub(crate) fn send(&self, msg: T) -> Send<T> {
        Send { channel: self.clone(), state: Some(OpState::Fresh(msg)) }
    }

    // construct a recv future.
    pub(crate) fn recv(&self) -> Recv<T> {
        Recv { channel: self.clone(), state: Some(OpState::Fresh(())) }
    }
}

// lock on a channel.
pub(crate) struct Lock<'a, T> {
    shared: &'a Arc<Shared<T>>,
    lock: MutexGuard<'a, Lockable<T>>,
}

impl<'a, T> Lock<'a, T> {
    // number of buffered elements.
    pub(crate) fn len(&self) -> usize {
        self.lock.storage.len() + self.lock.requeued.len()
    }

    // number of parked (send, recv) operations, including inert select waiters.
    pub(crate) fn parked(&self) -> (usize, usize) {
        (self.lock.send_nodes.len(), self.lock.recv_nodes.len())
    }

    // close the channel, if not already closed, resolving every parked operation as closed.
    // buffered elements are kept for receivers. returns whether this call closed it.
    pub(crate) fn close(&mut self) -> bool {
        if self.lock.closed { return false; }
        self.lock.closed = true;
        self.shared.closed.store(true, Relaxed);
        let senders = self.lock.send_nodes.drain_closed();
        let receivers = self.lock.recv_nodes.drain_closed();
        trace!(senders, receivers, "resolved parked operations on close");
        true
    }

    // try to complete a send immediately. on failure, the message is handed back.
    pub(crate) fn try_send(&mut self, msg: T) -> Result<(), (T, Halt)> {
        let lockable = &mut *self.lock;
        if lockable.closed {
            return Err((msg, Halt::Closed));
        }
        if let Some(waiter) = lockable.recv_nodes.claim_front(None) {
            // direct hand-off to a parked receiver takes priority over buffering
            debug_assert!(waiter.slot.is_none());
            waiter.slot = Some(msg);
            waiter.resolve(Status::Done);
        } else if lockable.storage.has_space() {
            lockable.storage.push(msg);
        } else {
            return Err((msg, Halt::WouldBlock));
        }
        self.shared.counters.sent.fetch_add(1, Relaxed);
        Ok(())
    }

    // try to complete a recv immediately.
    pub(crate) fn try_recv(&mut self) -> Result<T, Halt> {
        let lockable = &mut *self.lock;
        let msg = if let Some(msg) = lockable.requeued.pop() {
            msg
        } else if let Some(msg) = lockable.storage.pop() {
            // a slot just freed up, so the longest-parked sender moves its message into it
            if let Some(waiter) = lockable.send_nodes.claim_front(None) {
                lockable.storage.push(take_sent(waiter));
                self.shared.counters.sent.fetch_add(1, Relaxed);
            }
            msg
        } else if let Some(waiter) = lockable.send_nodes.claim_front(None) {
            // rendezvous: consume the handoff cell of the front sender
            let msg = take_sent(waiter);
            self.shared.counters.sent.fetch_add(1, Relaxed);
            msg
        } else if lockable.closed {
            return Err(Halt::Closed);
        } else {
            return Err(Halt::WouldBlock);
        };
        self.shared.counters.received.fetch_add(1, Relaxed);
        Ok(msg)
    }

    // whether a send could complete (or fail as closed) right now without parking, ignoring
    // parked waiters of `exclude`.
    pub(crate) fn send_ready(&self, exclude: Option<&SelectBlock>) -> bool {
        self.lock.closed
            || self.lock.recv_nodes.has_claimable(exclude)
            || self.lock.storage.has_space()
    }

    // whether a recv could complete (or fail as closed) right now without parking, ignoring
    // parked waiters of `exclude`.
    pub(crate) fn recv_ready(&self, exclude: Option<&SelectBlock>) -> bool {
        self.lock.closed
            || self.len() > 0
            || self.lock.send_nodes.has_claimable(exclude)
    }

    // get an unlinked node, from the pool if possible.
    pub(crate) fn alloc_node(&mut self) -> NodeHandle<T> {
        self.lock.node_pool.iter_mut()
            .filter_map(|opt| opt.take())
            .next()
            .unwrap_or_else(NodeHandle::new)
    }

    // link a node into a queue. it must be unlinked, and for the send side its slot must hold
    // the message.
    pub(crate) fn park(&mut self, side: Side, node: &mut NodeHandle<T>) {
        debug_assert!(!self.lock.closed, "parking on closed channel (internal bug)");
        // safety: a node is only ever linked into the queue for the side it was parked on, and
        //         the type system ensures it belongs to this channel's node type. the node is
        //         unlinked because every path that gets a node from alloc_node or from release
        //         gets it unlinked.
        unsafe { self.queue(side).push(node); }
    }

    // borrow the waiter of a node parked on the given side.
    pub(crate) fn waiter<'b>(&'b mut self, side: Side, node: &'b mut NodeHandle<T>)
        -> &'b mut Waiter<T>
    {
        // safety: the node was parked on this side of this channel, and we hold the lock.
        unsafe { self.queue(side).waiter(node) }
    }

    // unlink a node if still linked, reset it, and return it to the pool. returns its status at
    // the time of release and its slot contents.
    pub(crate) fn release(&mut self, side: Side, mut node: NodeHandle<T>) -> (Status, Option<T>) {
        // safety: same as park.
        let (status, slot) = unsafe {
            let queue = self.queue(side);
            queue.remove(&mut node);
            let status = queue.waiter(&mut node).status;
            (status, node.reset())
        };
        if let Some(spare) = self.lock.node_pool.iter_mut().find(|opt| opt.is_none()) {
            *spare = Some(node);
        }
        (status, slot)
    }

    fn queue(&mut self, side: Side) -> &mut NodeQueue<T> {
        match side {
            Side::Send => &mut self.lock.send_nodes,
            Side::Recv => &mut self.lock.recv_nodes,
        }
    }
}

// take the message out of a claimed sender waiter and resolve it.
fn take_sent<T>(waiter: &mut Waiter<T>) -> T {
    let msg = waiter.slot.take().expect("parked sender without message (internal bug)");
    waiter.resolve(Status::Done);
    msg
}


// ==== futures ====


// state of an operation future which has not yet resolved or been withdrawn.
enum OpState<T, F> {
    // not yet attempted. holds the message for a send.
    Fresh(F),
    // parked on the channel.
    Parked(NodeHandle<T>),
}

// send future. internally locks the channel when withdrawn.
pub(crate) struct Send<T> {
    channel: Channel<T>,
    // none once resolved or withdrawn.
    state: Option<OpState<T, T>>,
}

impl<T> Send<T> {
    // poll the future.
    //
    // - resolves to ok upon the message being transferred or buffered.
    // - resolves to err with Halt::Closed and the message if the channel is or becomes closed.
    //
    // internally locks the channel. panics if already resolved or withdrawn.
    pub(crate) fn poll(&mut self, cx: &mut Context) -> Poll<Result<(), (T, Halt)>> {
        let state = self.state.take()
            .expect("send future polled after already resolved or withdrawn");
        let mut lock = self.channel.lock();
        match state {
            OpState::Fresh(msg) => match lock.try_send(msg) {
                Ok(()) => Poll::Ready(Ok(())),
                Err((msg, Halt::WouldBlock)) => {
                    // park with the message in the node's slot
                    let mut node = lock.alloc_node();
                    let waiter = lock.waiter(Side::Send, &mut node);
                    waiter.slot = Some(msg);
                    waiter.waker = Some(cx.waker().clone());
                    lock.park(Side::Send, &mut node);
                    drop(lock);
                    self.state = Some(OpState::Parked(node));
                    Poll::Pending
                }
                Err(e) => Poll::Ready(Err(e)),
            },
            OpState::Parked(mut node) => {
                let waiter = lock.waiter(Side::Send, &mut node);
                if waiter.status == Status::Waiting {
                    // refresh the waker
                    if !waiter.waker.as_ref().is_some_and(|w| w.will_wake(cx.waker())) {
                        waiter.waker = Some(cx.waker().clone());
                    }
                    drop(lock);
                    self.state = Some(OpState::Parked(node));
                    return Poll::Pending;
                }
                Poll::Ready(match lock.release(Side::Send, node) {
                    (Status::Done, _) => Ok(()),
                    (_, slot) => Err((
                        slot.expect("closed send waiter lost its message (internal bug)"),
                        Halt::Closed,
                    )),
                })
            }
        }
    }

    // try to complete without parking, if not yet polled. otherwise this is the same as polling
    // once and withdrawing if pending.
    pub(crate) fn try_now(&mut self) -> Option<Result<(), (T, Halt)>> {
        match self.state.take()? {
            OpState::Fresh(msg) => Some(self.channel.lock().try_send(msg)),
            state => {
                self.state = Some(state);
                self.withdraw().map(|r| r.map_err(|(msg, halt)| match halt {
                    Halt::Withdrawn => (msg, Halt::WouldBlock),
                    halt => (msg, halt),
                }))
            }
        }
    }

    // if not already resolved or withdrawn, withdraw the operation.
    //
    // if the operation was resolved by another party before we could withdraw it, it is reported
    // as such instead. internally locks the channel. never panics. guaranteed that all wakers
    // previously cloned when polling are dropped by the time `withdraw` returns.
    pub(crate) fn withdraw(&mut self) -> Option<Result<(), (T, Halt)>> {
        Some(match self.state.take()? {
            OpState::Fresh(msg) => Err((msg, Halt::Withdrawn)),
            OpState::Parked(node) => match self.channel.lock().release(Side::Send, node) {
                (Status::Done, _) => Ok(()),
                (status, slot) => {
                    let halt = match status {
                        Status::Closed => Halt::Closed,
                        _ => Halt::Withdrawn,
                    };
                    Err((slot.expect("send waiter lost its message (internal bug)"), halt))
                }
            },
        })
    }

    // whether already resolved or withdrawn.
    pub(crate) fn is_terminated(&self) -> bool {
        self.state.is_none()
    }

    // channel being sent on.
    pub(crate) fn channel(&self) -> &Channel<T> {
        &self.channel
    }
}

// the message is never pinned.
impl<T> Unpin for Send<T> {}

impl<T> Future for Send<T> {
    type Output = Result<(), (T, Halt)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        Send::poll(self.get_mut(), cx)
    }
}

// safety: wakers cloned into the node are only ever dropped or taken under the channel lock. both
//         resolving (via release) and withdrawing reset the node under the lock before returning,
//         and a counterpart that takes the waker wakes it before releasing the lock.
unsafe impl<T> DropWakers for Send<T> {
    type DropWakersOutput = Option<Result<(), (T, Halt)>>;

    fn drop_wakers(&mut self) -> Self::DropWakersOutput {
        self.withdraw()
    }
}

impl<T> Drop for Send<T> {
    fn drop(&mut self) {
        // a parked node must be unlinked under the lock before it can be freed
        drop(self.withdraw());
    }
}

// recv future. internally locks the channel when withdrawn.
pub(crate) struct Recv<T> {
    channel: Channel<T>,
    state: Option<OpState<T, ()>>,
}

impl<T> Recv<T> {
    // poll the future.
    //
    // - resolves to ok upon receiving a message.
    // - resolves to err with Halt::Closed if the channel is closed and drained.
    //
    // internally locks the channel. panics if already resolved or withdrawn.
    pub(crate) fn poll(&mut self, cx: &mut Context) -> Poll<Result<T, Halt>> {
        let state = self.state.take()
            .expect("recv future polled after already resolved or withdrawn");
        let mut lock = self.channel.lock();
        match state {
            OpState::Fresh(()) => match lock.try_recv() {
                Ok(msg) => Poll::Ready(Ok(msg)),
                Err(Halt::WouldBlock) => {
                    let mut node = lock.alloc_node();
                    lock.waiter(Side::Recv, &mut node).waker = Some(cx.waker().clone());
                    lock.park(Side::Recv, &mut node);
                    drop(lock);
                    self.state = Some(OpState::Parked(node));
                    Poll::Pending
                }
                Err(halt) => Poll::Ready(Err(halt)),
            },
            OpState::Parked(mut node) => {
                let waiter = lock.waiter(Side::Recv, &mut node);
                if waiter.status == Status::Waiting {
                    if !waiter.waker.as_ref().is_some_and(|w| w.will_wake(cx.waker())) {
                        waiter.waker = Some(cx.waker().clone());
                    }
                    drop(lock);
                    self.state = Some(OpState::Parked(node));
                    return Poll::Pending;
                }
                Poll::Ready(lock.release_recv(node))
            }
        }
    }

    // try to complete without parking, if not yet polled. otherwise this is the same as polling
    // once and withdrawing if pending.
    pub(crate) fn try_now(&mut self) -> Option<Result<T, Halt>> {
        match self.state.take()? {
            OpState::Fresh(()) => Some(self.channel.lock().try_recv()),
            state => {
                self.state = Some(state);
                self.withdraw().map(|r| r.map_err(|halt| match halt {
                    Halt::Withdrawn => Halt::WouldBlock,
                    halt => halt,
                }))
            }
        }
    }

    // if not already resolved or withdrawn, withdraw the operation.
    //
    // if a message was delivered before we could withdraw, it is returned rather than lost.
    // internally locks the channel. never panics. guaranteed that all wakers previously cloned
    // when polling are dropped by the time `withdraw` returns.
    pub(crate) fn withdraw(&mut self) -> Option<Result<T, Halt>> {
        Some(match self.state.take()? {
            OpState::Fresh(()) => Err(Halt::Withdrawn),
            OpState::Parked(node) => self.channel.lock().release_recv(node),
        })
    }

    // whether already resolved or withdrawn.
    pub(crate) fn is_terminated(&self) -> bool {
        self.state.is_none()
    }

    // channel being received from.
    pub(crate) fn channel(&self) -> &Channel<T> {
        &self.channel
    }
}

impl<'a, T> Lock<'a, T> {
    // release a parked recv node, taking its delivered message if any.
    fn release_recv(&mut self, node: NodeHandle<T>) -> Result<T, Halt> {
        match self.release(Side::Recv, node) {
            (Status::Done, slot) => {
                self.shared.counters.received.fetch_add(1, Relaxed);
                Ok(slot.expect("done recv waiter without message (internal bug)"))
            }
            (Status::Closed, _) => Err(Halt::Closed),
            (Status::Waiting, _) => Err(Halt::Withdrawn),
        }
    }

    // give back a message which was delivered to a recv that got dropped before taking it. it
    // goes to the next parked receiver if there is one, otherwise ahead of the buffer.
    fn requeue(&mut self, msg: T) {
        self.shared.counters.received.fetch_sub(1, Relaxed);
        let lockable = &mut *self.lock;
        if let Some(waiter) = lockable.recv_nodes.claim_front(None) {
            debug_assert!(waiter.slot.is_none());
            waiter.slot = Some(msg);
            waiter.resolve(Status::Done);
        } else if let Storage::Conflated(slot) = &mut lockable.storage {
            // a newer value already took its place
            if slot.is_none() {
                *slot = Some(msg);
            }
        } else {
            lockable.requeued.push(msg);
        }
        trace!("requeued message of dropped recv");
    }
}

impl<T> Unpin for Recv<T> {}

impl<T> Future for Recv<T> {
    type Output = Result<T, Halt>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        Recv::poll(self.get_mut(), cx)
    }
}

// safety: same as for Send.
unsafe impl<T> DropWakers for Recv<T> {
    type DropWakersOutput = Option<Result<T, Halt>>;

    fn drop_wakers(&mut self) -> Self::DropWakersOutput {
        self.withdraw()
    }
}

impl<T> Drop for Recv<T> {
    fn drop(&mut self) {
        if let Some(OpState::Parked(node)) = self.state.take() {
            let mut lock = self.channel.lock();
            if let Ok(msg) = lock.release_recv(node) {
                lock.requeue(msg);
            }
        }
    }
}
