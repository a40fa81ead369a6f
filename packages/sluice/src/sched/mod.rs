//! Work-stealing M:N scheduler
//!
//! A [`Scheduler`] multiplexes many spawned futures ("units") over a fixed pool of worker threads.
//! Each worker owns a double-ended ready queue. It pops the hot end of its own queue, and when
//! that runs dry it pulls a batch from the shared injection queue, then tries stealing the cold
//! end of its peers' queues, and finally parks until woken. Units woken from a worker thread go
//! onto that worker's queue, and units woken from anywhere else go through the injection queue.

mod config;
mod error;
mod idle;
mod join;
mod unit;
mod worker;

pub use self::{
    config::{SchedulerConfig, StealOrder, DEFAULT_INJECTOR_BATCH, DEFAULT_LIFO_BUDGET},
    error::{JoinError, SchedulerError, SpawnError},
    join::JoinHandle,
};

use self::{
    idle::Idle,
    join::{result_channel, CloseOnDrop},
    unit::Unit,
};
use crossbeam_deque::{Injector, Stealer, Worker};
use dashmap::DashMap;
use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    pin::Pin,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            Ordering::{Acquire, Relaxed, Release},
        },
        Arc,
        Condvar,
        Mutex,
        OnceLock,
    },
    task::{Context, Poll},
    thread,
    time::{Duration, Instant},
};


// state shared between the scheduler, its handles, its workers, and its units.
pub(crate) struct Shared {
    config: SchedulerConfig,
    injector: Injector<Arc<Unit>>,
    stealers: Vec<Stealer<Arc<Unit>>>,
    idle: Idle,
    // every unit spawned and not yet finished.
    units: DashMap<u64, Arc<Unit>>,
    // number of entries in units, under a mutex so shutdown can wait for it to reach zero.
    live: Mutex<usize>,
    quiescent: Condvar,
    // set once the scheduler no longer accepts spawns.
    closed: AtomicBool,
    // set once workers should exit.
    stopping: AtomicBool,
    next_id: AtomicU64,
}

impl Shared {
    // enqueue a unit which was just made scheduled.
    pub(crate) fn schedule(self: &Arc<Self>, unit: Arc<Unit>) {
        let unit = worker::with_current(|local| match local {
            Some(local) if Arc::ptr_eq(&local.shared, self) => {
                local.queue.push(unit);
                None
            }
            _ => Some(unit),
        });
        match unit {
            Some(unit) => self.inject(unit),
            // a peer may steal it
            None => self.idle.notify_one(),
        }
    }

    // enqueue a unit at the tail of the injection queue.
    pub(crate) fn inject(&self, unit: Arc<Unit>) {
        self.injector.push(unit);
        self.idle.notify_one();
    }

    // whether any queue has units in it.
    fn has_work(&self) -> bool {
        !self.injector.is_empty() || self.stealers.iter().any(|stealer| !stealer.is_empty())
    }

    // forget a finished unit.
    pub(crate) fn retire(&self, id: u64) {
        if self.units.remove(&id).is_some() {
            let mut live = self.live.lock().unwrap();
            *live -= 1;
            if *live == 0 {
                self.quiescent.notify_all();
            }
        }
    }

    fn spawn<F>(self: &Arc<Self>, future: F) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.closed.load(Acquire) {
            return Err(SpawnError::ShutDown);
        }
        let id = self.next_id.fetch_add(1, Relaxed);
        let (tx, mut handle) = result_channel();
        handle.set_id(id);
        let guard = CloseOnDrop(tx.clone());
        let wrapped = async move {
            let _guard = guard;
            let output = future.await;
            // conflated, so this can only fail if the handle closed it, which it never does
            let _ = tx.try_send(output);
        };
        let unit = Unit::new(id, Box::pin(wrapped), Arc::downgrade(self));
        self.units.insert(id, Arc::clone(&unit));
        *self.live.lock().unwrap() += 1;
        self.schedule(unit);
        Ok(handle)
    }

    // wait until no units are live, or the deadline passes. returns whether quiescent.
    fn wait_quiescent(&self, deadline: Option<Instant>) -> bool {
        let mut live = self.live.lock().unwrap();
        while *live > 0 {
            live = match deadline {
                None => self.quiescent.wait(live).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        return false;
                    }
                    self.quiescent.wait_timeout(live, deadline - now).unwrap().0
                }
            };
        }
        true
    }

    // drop the futures of every unit still alive. only called once workers have stopped.
    fn abort_remaining(&self) -> usize {
        let units = self.units.iter().map(|entry| Arc::clone(entry.value())).collect::<Vec<_>>();
        let mut aborted = 0;
        for unit in units {
            // dropping a future may wake or retire others, so no map guards are held here
            if unit.abort() {
                aborted += 1;
            }
            self.retire(unit.id);
        }
        aborted
    }
}


/// Cloneable reference to a [`Scheduler`]
///
/// Can spawn units from any thread. A handle does not keep the worker threads running: once the
/// scheduler is shut down, spawning through a handle fails with [`SpawnError::ShutDown`].
#[derive(Clone)]
pub struct Handle(Arc<Shared>);

impl Handle {
    /// Handle to the scheduler whose worker is running the current thread
    ///
    /// Panics if not called from a worker thread, see [`try_current`](Self::try_current).
    pub fn current() -> Self {
        Self::try_current().expect("Handle::current called outside of a scheduler worker")
    }

    /// Handle to the scheduler whose worker is running the current thread, if any
    pub fn try_current() -> Option<Self> {
        worker::with_current(|local| local.map(|local| Handle(Arc::clone(&local.shared))))
    }

    /// Spawn a future as a unit on the scheduler
    ///
    /// If called from one of this scheduler's workers, the unit is pushed onto that worker's own
    /// queue. Otherwise it goes through the injection queue.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.0.spawn(future)
    }

    /// Number of units spawned and not yet finished
    pub fn live_units(&self) -> usize {
        *self.0.live.lock().unwrap()
    }

    /// Whether the scheduler has stopped accepting spawns
    pub fn is_shut_down(&self) -> bool {
        self.0.closed.load(Acquire)
    }

    /// Whether both handles refer to the same scheduler
    pub fn same_scheduler(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    // whether the current thread is one of this scheduler's workers.
    fn on_worker(&self) -> bool {
        worker::with_current(|local| local.is_some_and(|local| Arc::ptr_eq(&local.shared, &self.0)))
    }
}

impl Debug for Handle {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Handle")
            .field("workers", &self.0.stealers.len())
            .field("live_units", &self.live_units())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}


/// Pool of worker threads running spawned units
///
/// Created with [`new`](Self::new) or [`with_workers`](Self::with_workers), and shut down
/// explicitly with [`shutdown`](Self::shutdown) or [`shutdown_timeout`](Self::shutdown_timeout).
/// Dropping a scheduler which was not shut down stops it immediately, dropping whatever units are
/// still alive, whose join handles then report [`JoinError::Aborted`].
///
/// ```
/// # use sluice::{Scheduler, Channel, ChannelKind};
/// let sched = Scheduler::with_workers(2).unwrap();
/// let chan = Channel::new(ChannelKind::Rendezvous).unwrap();
/// let chan_2 = chan.clone();
/// let producer = sched.spawn(async move {
///     for i in 0..3 {
///         chan_2.send(i).await.unwrap();
///     }
/// }).unwrap();
/// let consumer = sched.spawn(async move {
///     let mut sum = 0;
///     for _ in 0..3 {
///         sum += chan.recv().await.unwrap();
///     }
///     sum
/// }).unwrap();
/// producer.join().unwrap();
/// assert_eq!(consumer.join(), Ok(3));
/// sched.shutdown();
/// ```
pub struct Scheduler {
    handle: Handle,
    threads: Vec<thread::JoinHandle<()>>,
}

impl Scheduler {
    /// Start a scheduler with the given configuration
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        if config.workers == 0 {
            return Err(SchedulerError::NoWorkers);
        }
        let queues = (0..config.workers).map(|_| Worker::new_lifo()).collect::<Vec<_>>();
        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers: queues.iter().map(Worker::stealer).collect(),
            idle: Idle::new(),
            units: DashMap::new(),
            live: Mutex::new(0),
            quiescent: Condvar::new(),
            closed: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            config,
        });
        let mut sched = Scheduler {
            handle: Handle(Arc::clone(&shared)),
            threads: Vec::new(),
        };
        for (index, queue) in queues.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", shared.config.thread_name, index))
                .spawn(move || worker::run(index, queue, shared));
            match spawned {
                Ok(thread) => sched.threads.push(thread),
                // sched is dropped on return, stopping the workers already started
                Err(e) => return Err(e.into()),
            }
        }
        debug!(workers = sched.threads.len(), "scheduler started");
        Ok(sched)
    }

    /// Start a scheduler with the given number of workers and default configuration otherwise
    pub fn with_workers(workers: usize) -> Result<Self, SchedulerError> {
        Self::new(SchedulerConfig::default().with_workers(workers))
    }

    /// Cloneable handle for spawning onto this scheduler
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Spawn a future as a unit, see [`Handle::spawn`]
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Number of units spawned and not yet finished
    pub fn live_units(&self) -> usize {
        self.handle.live_units()
    }

    /// Number of worker threads
    pub fn workers(&self) -> usize {
        self.handle.0.stealers.len()
    }

    /// Wait until every unit has finished, then stop and join the workers
    ///
    /// Units may keep spawning more units while this waits. Panics if called from one of this
    /// scheduler's own workers, as it would wait on itself.
    pub fn shutdown(mut self) {
        self.stop(None);
    }

    /// Like [`shutdown`](Self::shutdown), but gives up waiting after the timeout
    ///
    /// Units still alive then are dropped without running further. Returns how many were.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> usize {
        let deadline = Instant::now().checked_add(timeout);
        self.stop(Some(deadline.unwrap_or_else(Instant::now)))
    }

    // stop the workers, after waiting for quiescence until the deadline, if any.
    fn stop(&mut self, deadline: Option<Instant>) -> usize {
        if self.threads.is_empty() {
            return 0;
        }
        assert!(!self.handle.on_worker(), "scheduler shut down from its own worker");
        let shared = &self.handle.0;
        let quiescent = shared.wait_quiescent(deadline);
        shared.closed.store(true, Release);
        shared.stopping.store(true, Release);
        shared.idle.notify_all();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("scheduler worker thread panicked");
            }
        }
        let aborted = shared.abort_remaining();
        if !quiescent || aborted > 0 {
            warn!(aborted, "scheduler forced to shut down with units still alive");
        }
        debug!("scheduler shut down");
        aborted
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop(Some(Instant::now()));
    }
}

impl Debug for Scheduler {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.workers())
            .field("live_units", &self.live_units())
            .finish()
    }
}


// ==== default instance and free functions ====


// lazily created, and never shut down.
static DEFAULT: OnceLock<Option<Scheduler>> = OnceLock::new();

fn default_handle() -> Option<Handle> {
    DEFAULT
        .get_or_init(|| match Scheduler::new(SchedulerConfig::default()) {
            Ok(sched) => Some(sched),
            Err(e) => {
                error!(%e, "failed to start default scheduler");
                None
            }
        })
        .as_ref()
        .map(Scheduler::handle)
}

/// Spawn a future as a unit
///
/// Spawns onto the scheduler of the current worker thread if there is one, or else onto a default
/// scheduler with one worker per available CPU, which is started upon first use and lives for the
/// rest of the process.
pub fn spawn<F>(future: F) -> Result<JoinHandle<F::Output>, SpawnError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Handle::try_current()
        .or_else(default_handle)
        .ok_or(SpawnError::NoScheduler)?
        .spawn(future)
}

/// Future which yields control back to the scheduler once
///
/// The unit goes to the back of the injection queue, behind units submitted from outside.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`]
#[must_use = "futures do nothing unless polled"]
#[derive(Debug)]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{Channel, ChannelKind},
        time::sleep,
    };
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicUsize, Ordering::SeqCst},
    };

    #[test]
    fn rendezvous_between_units() -> anyhow::Result<()> {
        let sched = Scheduler::with_workers(4)?;
        let ch = Channel::new(ChannelKind::Rendezvous)?;
        let producer = sched.spawn({
            let ch = ch.clone();
            async move {
                let mut sent = 0;
                for i in 0..10 {
                    ch.send(i).await.unwrap();
                    sent += 1;
                }
                sent
            }
        })?;
        let consumer = sched.spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..10 {
                seen.push(ch.recv().await.unwrap());
            }
            seen
        })?;
        assert_eq!(producer.join()?, 10);
        let mut seen = consumer.join()?;
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        sched.shutdown();
        Ok(())
    }

    #[test]
    fn yielding_units_alternate_on_one_worker() -> anyhow::Result<()> {
        let sched = Scheduler::with_workers(1)?;
        let log = Arc::new(Mutex::new(Vec::new()));
        let parent = sched.spawn({
            let log = Arc::clone(&log);
            async move {
                // spawned from the worker, so both land on its local queue before either runs
                let children = ["a", "b"].map(|name| {
                    let log = Arc::clone(&log);
                    spawn(async move {
                        for _ in 0..3 {
                            log.lock().unwrap().push(name);
                            yield_now().await;
                        }
                    })
                    .unwrap()
                });
                children
            }
        })?;
        for child in parent.join()? {
            child.join()?;
        }
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 6);
        assert!(log.windows(2).all(|pair| pair[0] != pair[1]), "{:?}", *log);
        drop(log);
        sched.shutdown();
        Ok(())
    }

    #[test]
    fn panicking_unit_is_aborted() -> anyhow::Result<()> {
        let sched = Scheduler::with_workers(2)?;
        let handle = sched.spawn(async {
            panic!("unit failure");
        })?;
        assert_eq!(handle.join(), Err(JoinError::Aborted));
        // the worker survives
        assert_eq!(sched.spawn(async { 7 })?.join(), Ok(7));
        assert_eq!(sched.live_units(), 0);
        sched.shutdown();
        Ok(())
    }

    #[test]
    fn shutdown_waits_for_quiescence() -> anyhow::Result<()> {
        let sched = Scheduler::with_workers(2)?;
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..8 {
            let done = Arc::clone(&done);
            // detached
            drop(sched.spawn(async move {
                sleep(Duration::from_millis(5 * i)).await;
                done.fetch_add(1, SeqCst);
            })?);
        }
        let handle = sched.handle();
        sched.shutdown();
        assert_eq!(done.load(SeqCst), 8);
        assert!(handle.is_shut_down());
        assert!(matches!(handle.spawn(async {}), Err(SpawnError::ShutDown)));
        Ok(())
    }

    #[test]
    fn shutdown_timeout_drops_blocked_units() -> anyhow::Result<()> {
        let sched = Scheduler::with_workers(2)?;
        let ch = Channel::<u32>::new(ChannelKind::Rendezvous)?;
        let blocked = sched.spawn({
            let ch = ch.clone();
            async move { ch.recv().await }
        })?;
        while ch.core().lock().parked() != (0, 1) {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(sched.shutdown_timeout(Duration::from_millis(20)), 1);
        assert_eq!(blocked.join(), Err(JoinError::Aborted));
        // its parked recv was withdrawn when its future was dropped
        assert_eq!(ch.core().lock().parked(), (0, 0));
        Ok(())
    }

    #[test]
    fn many_units_across_workers() -> anyhow::Result<()> {
        for order in [StealOrder::Random, StealOrder::RoundRobin] {
            let config = SchedulerConfig::default()
                .with_workers(4)
                .with_steal_order(order)
                .with_lifo_budget(4)
                .with_injector_batch(2);
            let sched = Scheduler::new(config)?;
            let ch = Channel::new(ChannelKind::Bounded(8))?;
            let producers = (0..100u32)
                .map(|p| {
                    let ch = ch.clone();
                    sched.spawn(async move {
                        for i in 0..10 {
                            ch.send(p * 10 + i).await.unwrap();
                            if i % 3 == 0 {
                                yield_now().await;
                            }
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let consumer = sched.spawn({
                let ch = ch.clone();
                async move {
                    let mut seen = HashSet::new();
                    while let Ok(n) = ch.recv().await {
                        assert!(seen.insert(n));
                    }
                    seen.len()
                }
            })?;
            for producer in producers {
                producer.join()?;
            }
            ch.close();
            assert_eq!(consumer.join()?, 1000);
            assert_eq!(ch.stats().sent, 1000);
            sched.shutdown();
        }
        Ok(())
    }

    #[test]
    fn peer_steals_from_blocked_worker() -> anyhow::Result<()> {
        let sched = Scheduler::with_workers(2)?;
        let parent = sched.spawn(async {
            // lands on this worker's local queue, then this worker blocks, so only the peer can
            // run it by stealing
            let child = spawn(async { (thread::current().id(), 5) }).unwrap();
            let result = child.join_timeout(Duration::from_secs(10));
            (thread::current().id(), result)
        })?;
        let (parent_thread, result) = parent.join()?;
        let (child_thread, n) = result?;
        assert_eq!(n, 5);
        assert_ne!(parent_thread, child_thread);
        sched.shutdown();
        Ok(())
    }

    #[test]
    fn current_handle_inside_units() -> anyhow::Result<()> {
        assert!(Handle::try_current().is_none());
        let sched = Scheduler::with_workers(2)?;
        let outer = sched.handle();
        let same = sched.spawn(async move {
            let child = spawn(async { Handle::current() }).unwrap();
            let inner = child.await.unwrap();
            inner.same_scheduler(&outer) && Handle::current().same_scheduler(&outer)
        })?;
        assert_eq!(same.join(), Ok(true));
        sched.shutdown();
        Ok(())
    }

    #[test]
    fn zero_workers_rejected() {
        assert!(matches!(Scheduler::with_workers(0), Err(SchedulerError::NoWorkers)));
    }

    #[test]
    fn default_scheduler_runs_detached_spawns() {
        let handle = spawn(async { 40 + 2 }).unwrap();
        assert_eq!(handle.join_timeout(Duration::from_secs(10)), Ok(42));
    }
}
