//! Hierarchical cancellation tokens

use crate::{
    channel::Timeout,
    error::TimedOutError,
};
use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    future::Future,
    pin::Pin,
    sync::{
        atomic::{
            Ordering::{Acquire, AcqRel, Relaxed},
            AtomicBool,
            AtomicU64,
        },
        Arc,
        Condvar,
        Mutex,
        Weak,
    },
    task::{Context, Poll, Waker},
    time::Instant,
};


// source of token ids, used to identify a child in its parent's table.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);


/// One-way stop signal, which propagates to its descendants
///
/// A token starts out clear, and can be triggered exactly once. Triggering a token triggers every
/// live descendant token (created with [`child`](Self::child)) as well. Cloning produces another
/// handle to the same token.
///
/// Cancellable operations, such as [`Channel::recv_cancellable`](crate::Channel::recv_cancellable)
/// or [`RecvFut::cancel_on`](crate::future::RecvFut::cancel_on), give up with a cancelled error
/// once they observe their token triggered.
#[derive(Clone)]
pub struct CancelToken(Arc<Node>);

struct Node {
    id: u64,
    triggered: AtomicBool,
    // keeps ancestors alive for as long as a descendant may need to be reached through them.
    parent: Option<Arc<Node>>,
    state: Mutex<State>,
    // notified upon triggering, for blocking waits.
    cond: Condvar,
}

struct State {
    // live children. a child removes its own entry when dropped.
    children: HashMap<u64, Weak<Node>>,
    // wakers of async waits, woken upon triggering.
    wakers: HashMap<u64, Waker>,
    next_key: u64,
}

impl Node {
    fn new(parent: Option<Arc<Node>>, triggered: bool) -> Arc<Self> {
        Arc::new(Node {
            id: NEXT_ID.fetch_add(1, Relaxed),
            triggered: AtomicBool::new(triggered),
            parent,
            state: Mutex::new(State {
                children: HashMap::new(),
                wakers: HashMap::new(),
                next_key: 0,
            }),
            cond: Condvar::new(),
        })
    }

    // trigger this node and then its descendants, walking the tree with a worklist so that depth
    // costs heap rather than stack.
    fn trigger(&self) -> bool {
        let Some(mut pending) = self.fire() else {
            return false;
        };
        while let Some(node) = pending.pop() {
            if let Some(children) = node.fire() {
                pending.extend(children);
            }
        }
        true
    }

    // trigger just this node, if not already triggered, and take a snapshot of its live children.
    fn fire(&self) -> Option<Vec<Arc<Node>>> {
        if self.triggered.swap(true, AcqRel) {
            return None;
        }
        trace!(id = self.id, "cancel token triggered");
        let mut lock = self.state.lock().unwrap();
        for (_, waker) in lock.wakers.drain() {
            waker.wake();
        }
        self.cond.notify_all();
        Some(lock.children.drain()
            .filter_map(|(_, child)| child.upgrade())
            .collect())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // detach from parent. if we held the last reference to it, it's unlinked here too, and so
        // on up the chain, instead of through nested drops.
        let mut id = self.id;
        let mut parent = self.parent.take();
        while let Some(node) = parent {
            node.state.lock().unwrap().children.remove(&id);
            let Some(mut node) = Arc::into_inner(node) else {
                break;
            };
            id = node.id;
            parent = node.parent.take();
        }
    }
}

impl CancelToken {
    /// Create a new root token
    pub fn new() -> Self {
        CancelToken(Node::new(None, false))
    }

    /// Create a child token, which is triggered when this token is
    ///
    /// If this token is already triggered, the child is created already triggered.
    pub fn child(&self) -> Self {
        let mut lock = self.0.state.lock().unwrap();
        // checked under the lock so a concurrent trigger either sees the new child or is seen
        if self.0.triggered.load(Acquire) {
            return CancelToken(Node::new(None, true));
        }
        let node = Node::new(Some(Arc::clone(&self.0)), false);
        lock.children.insert(node.id, Arc::downgrade(&node));
        CancelToken(node)
    }

    /// Trigger this token and all its descendants
    ///
    /// Returns whether this call performed the transition. Triggering an already triggered token
    /// does nothing.
    pub fn trigger(&self) -> bool {
        self.0.trigger()
    }

    /// Whether this token has been triggered
    pub fn is_set(&self) -> bool {
        self.0.triggered.load(Acquire)
    }

    /// Block until this token is triggered or the timeout elapses
    pub fn wait(&self, timeout: impl Into<Timeout>) -> Result<(), TimedOutError> {
        let timeout = timeout.into();
        let mut lock = self.0.state.lock().unwrap();
        loop {
            if self.is_set() {
                return Ok(());
            }
            lock = match timeout {
                Timeout::Never => self.0.cond.wait(lock).unwrap(),
                Timeout::At(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        return Err(TimedOutError);
                    }
                    self.0.cond.wait_timeout(lock, deadline - now).unwrap().0
                }
                Timeout::NonBlocking => return Err(TimedOutError),
            };
        }
    }

    /// Future which resolves once this token is triggered
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            token: self.clone(),
            key: None,
        }
    }

    /// Number of live child tokens directly under this one
    pub fn children(&self) -> usize {
        self.0.state.lock().unwrap().children.len()
    }

    // register the waker to be woken upon triggering, or replace the waker previously registered
    // under key. the caller must re-check is_set afterwards.
    pub(crate) fn register(&self, key: &mut Option<u64>, waker: &Waker) {
        let mut lock = self.0.state.lock().unwrap();
        if self.is_set() {
            return;
        }
        let k = *key.get_or_insert_with(|| {
            let k = lock.next_key;
            lock.next_key += 1;
            k
        });
        match lock.wakers.get_mut(&k) {
            Some(old) if old.will_wake(waker) => (),
            _ => {
                lock.wakers.insert(k, waker.clone());
            }
        }
    }

    // remove a registration, if any.
    pub(crate) fn unregister(&self, key: &mut Option<u64>) {
        if let Some(k) = key.take() {
            self.0.state.lock().unwrap().wakers.remove(&k);
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

impl Debug for CancelToken {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("id", &self.0.id)
            .field("triggered", &self.is_set())
            .finish()
    }
}


/// Future returned by [`CancelToken::cancelled`]
pub struct Cancelled {
    token: CancelToken,
    key: Option<u64>,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        let this = self.get_mut();
        if this.token.is_set() {
            this.token.unregister(&mut this.key);
            return Poll::Ready(());
        }
        this.token.register(&mut this.key, cx.waker());
        if this.token.is_set() {
            this.token.unregister(&mut this.key);
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

impl Drop for Cancelled {
    fn drop(&mut self) {
        self.token.unregister(&mut self.key);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        thread,
        time::Duration,
    };

    #[test]
    fn trigger_propagates_to_descendants_once() {
        let root = CancelToken::new();
        let a = root.child();
        let b = root.child();
        let a1 = a.child();
        let a2 = a.child();
        let b1 = b.child();
        assert_eq!(root.children(), 2);

        assert!(a.trigger());
        assert!(a.is_set() && a1.is_set() && a2.is_set());
        assert!(!root.is_set() && !b.is_set() && !b1.is_set());

        assert!(root.trigger());
        assert!(!root.trigger());
        assert!(b.is_set() && b1.is_set());
        // a was already triggered, so this was its only transition
        assert!(!a.trigger());
    }

    #[test]
    fn child_of_triggered_is_triggered() {
        let root = CancelToken::new();
        root.trigger();
        let child = root.child();
        assert!(child.is_set());
        assert_eq!(root.children(), 0);
    }

    #[test]
    fn dropped_child_detaches() {
        let root = CancelToken::new();
        let child = root.child();
        let grandchild = child.child();
        assert_eq!(root.children(), 1);
        // the intermediate handle is gone, but the grandchild keeps it reachable
        drop(child);
        assert_eq!(root.children(), 1);
        root.trigger();
        assert!(grandchild.is_set());
        drop(grandchild);
        assert_eq!(root.children(), 0);
    }

    #[test]
    fn deep_chain_triggers_and_drops() {
        let root = CancelToken::new();
        let mut chain = vec![root.child()];
        for _ in 0..100_000 {
            let next = chain.last().unwrap().child();
            chain.push(next);
        }
        assert!(root.trigger());
        assert!(chain.iter().all(CancelToken::is_set));
        // handles drop front to back, so the last one releases the whole chain
        drop(chain);
        assert_eq!(root.children(), 0);
    }

    #[test]
    fn deep_chain_held_only_by_leaf() {
        let root = CancelToken::new();
        let mut leaf = root.child();
        for _ in 0..100_000 {
            leaf = leaf.child();
        }
        assert_eq!(root.children(), 1);
        drop(leaf);
        assert_eq!(root.children(), 0);
        assert!(root.trigger());
    }

    #[test]
    fn wait_times_out_or_wakes() {
        let token = CancelToken::new();
        assert_eq!(token.wait(Timeout::NonBlocking), Err(TimedOutError));
        assert_eq!(token.wait(Duration::from_millis(10)), Err(TimedOutError));

        let child = token.child();
        let token_2 = token.clone();
        let join = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            token_2.trigger();
        });
        assert_eq!(child.wait(Timeout::Never), Ok(()));
        join.join().unwrap();
    }

    #[test]
    fn cancelled_future() {
        let token = CancelToken::new();
        let token_2 = token.clone();
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async move {
            let waiter = tokio::spawn({
                let token = token.clone();
                async move { token.cancelled().await }
            });
            tokio::task::yield_now().await;
            token_2.trigger();
            waiter.await.unwrap();
        });
    }
}
