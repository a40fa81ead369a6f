// suspendable units of work and their run-state machine.
//
// a unit's state moves like so:
//
//              wake                 popped by worker
//     IDLE ------------> SCHEDULED ------------------> RUNNING
//      ^                    ^                           |  |
//      |                    |     requeued at tail      |  | wake while running
//      |                    \------------------------------/
//      |                          (via NOTIFIED)        |
//      \------------------------------------------------/ pending
//
// and to DONE from RUNNING once the future completes or panics. only the worker running a unit
// writes RUNNING, IDLE, SCHEDULED-after-NOTIFIED, and DONE. other threads only ever CAS IDLE to
// SCHEDULED (and then enqueue through the scheduler) or RUNNING to NOTIFIED.

use super::Shared;
use std::{
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{
            AtomicU8,
            Ordering::{AcqRel, Acquire, Release},
        },
        Arc,
        Mutex,
        Weak,
    },
    task::{Context, Poll, Wake, Waker},
};


pub(crate) const IDLE: u8 = 0;
pub(crate) const SCHEDULED: u8 = 1;
pub(crate) const RUNNING: u8 = 2;
pub(crate) const NOTIFIED: u8 = 3;
pub(crate) const DONE: u8 = 4;

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

// a spawned future along with its run-state.
pub(crate) struct Unit {
    pub(crate) id: u64,
    state: AtomicU8,
    // none once completed, or once dropped by a forced shutdown. only locked by the worker
    // running the unit, or by shutdown once workers are stopped, so never contended.
    future: Mutex<Option<BoxFuture>>,
    scheduler: Weak<Shared>,
}

// what happened when a unit was run.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum RunOutcome {
    // returned pending and nobody woke it meanwhile.
    Parked,
    // woken while running, must be requeued.
    Requeue,
    // completed or panicked.
    Finished,
}

impl Unit {
    // construct in the scheduled state, as it is about to be enqueued.
    pub(crate) fn new(id: u64, future: BoxFuture, scheduler: Weak<Shared>) -> Arc<Self> {
        Arc::new(Unit {
            id,
            state: AtomicU8::new(SCHEDULED),
            future: Mutex::new(Some(future)),
            scheduler,
        })
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> u8 {
        self.state.load(Acquire)
    }

    // poll the future once. called only by the worker which popped this unit off a queue.
    pub(crate) fn run(self: &Arc<Self>) -> RunOutcome {
        let prev = self.state.swap(RUNNING, AcqRel);
        if prev == DONE {
            // aborted while queued
            self.state.store(DONE, Release);
            return RunOutcome::Finished;
        }
        assert_eq!(prev, SCHEDULED, "ran unit {} which was not scheduled (internal bug)", self.id);

        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        let mut lock = self.future.lock().unwrap();
        let future = lock.as_mut().expect("scheduled unit without future (internal bug)");
        match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => {
                drop(lock);
                match self.state.compare_exchange(RUNNING, IDLE, AcqRel, Acquire) {
                    Ok(_) => RunOutcome::Parked,
                    Err(state) => {
                        debug_assert_eq!(state, NOTIFIED);
                        self.state.store(SCHEDULED, Release);
                        RunOutcome::Requeue
                    }
                }
            }
            Ok(Poll::Ready(())) => {
                *lock = None;
                self.state.store(DONE, Release);
                RunOutcome::Finished
            }
            Err(_) => {
                error!(unit = self.id, "unit panicked");
                // dropping the future reports the abort to its join handle
                *lock = None;
                self.state.store(DONE, Release);
                RunOutcome::Finished
            }
        }
    }

    // drop the future without running it any further. returns whether it was still present.
    pub(crate) fn abort(&self) -> bool {
        let future = self.future.lock().unwrap().take();
        self.state.store(DONE, Release);
        future.is_some()
    }
}

impl Wake for Unit {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let mut state = self.state.load(Acquire);
        loop {
            let next = match state {
                IDLE => SCHEDULED,
                RUNNING => NOTIFIED,
                // already going to run again, or never will
                _ => return,
            };
            match self.state.compare_exchange_weak(state, next, AcqRel, Acquire) {
                Ok(_) => break,
                Err(actual) => state = actual,
            }
        }
        if state == IDLE {
            // we took it out of idle, so we are the ones to enqueue it
            if let Some(scheduler) = self.scheduler.upgrade() {
                scheduler.schedule(Arc::clone(self));
            }
        }
    }
}
