// internal future polling system for channel.
//
// design based on pollster crate, but with extensive modifications.

use super::error::{WouldBlockError, TimedOutError, CancelledError};
use crate::cancel::CancelToken;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Condvar,
        Mutex,
    },
    task::{Context, Poll, Waker, RawWaker, RawWakerVTable},
    time::{Duration, Instant},
    pin::Pin,
};


/// Default interval at which a blocked cancellable operation re-checks its [`CancelToken`]
///
/// A thread parked on a condition variable cannot be woken by the token directly, so the token
/// is polled at this cadence instead. Change it process-wide with [`set_cancel_poll_interval`].
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(5);

// current cadence in nanoseconds.
static POLL_INTERVAL_NANOS: AtomicU64 = AtomicU64::new(CANCEL_POLL_INTERVAL.as_nanos() as u64);

/// Set the interval at which blocked cancellable operations re-check their token
///
/// Applies process-wide to waits that start afterwards. Zero is treated as one microsecond.
pub fn set_cancel_poll_interval(interval: Duration) {
    let nanos = interval.as_nanos().clamp(1_000, u64::MAX as u128) as u64;
    POLL_INTERVAL_NANOS.store(nanos, Relaxed);
}

/// Current cancellation re-check interval, see [`set_cancel_poll_interval`]
pub fn cancel_poll_interval() -> Duration {
    Duration::from_nanos(POLL_INTERVAL_NANOS.load(Relaxed))
}


// `Future` with the ability to drop all wakers it previously cloned.
//
// - this future must guarantee that if a call to Future::poll either:
//
//   - returns Poll::Ready
//   - panics
//
//   then all wakers previously cloned from calls to poll have been dropped by the time the call
//   to poll returns (or returns via panic). otherwise, undefined behavior may occur.
//
// - this future must guarantee that if drop_wakers is called, then all wakers previously cloned
//   from calls to poll have been dropped by the time the call to drop_wakers returns (or returns
//   via panic). otherwise, undefined behavior may occur.
//
// it is expected that drop_wakers will be called only if the future has not yet resolved, and that
// the future will never again be polled after drop_wakers is called. the future may panic or
// exhibit bugs if this assumption is violated. however, the future must not trigger undefined
// behavior if this assumption is violated, including by violating the above requirements.
pub(crate) unsafe trait DropWakers: Future {
    type DropWakersOutput;

    fn drop_wakers(&mut self) -> Self::DropWakersOutput;
}

/// How long a blocking operation may wait
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Timeout {
    /// Wait until the operation completes
    Never,
    /// Give up at the given deadline
    At(Instant),
    /// Give up if the operation cannot complete without waiting
    NonBlocking,
}

impl Timeout {
    /// Deadline this timeout corresponds to, if any
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            &Timeout::At(deadline) => Some(deadline),
            _ => None,
        }
    }
}

/// A zero duration means [`Timeout::NonBlocking`]
impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            Timeout::NonBlocking
        } else {
            Instant::now().checked_add(duration).map(Timeout::At).unwrap_or(Timeout::Never)
        }
    }
}

impl From<Instant> for Timeout {
    fn from(deadline: Instant) -> Self {
        Timeout::At(deadline)
    }
}

// reason a wait stopped before the future resolved.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Interrupt {
    WouldBlock,
    TimedOut,
    Cancelled,
}

impl Interrupt {
    // convert into whichever public error type the operation reports.
    pub(crate) fn into_error<E>(self) -> E
    where
        E: From<WouldBlockError> + From<TimedOutError> + From<CancelledError>,
    {
        match self {
            Interrupt::WouldBlock => WouldBlockError.into(),
            Interrupt::TimedOut => TimedOutError.into(),
            Interrupt::Cancelled => CancelledError.into(),
        }
    }
}

// poll the future until it resolves, the timeout is reached, or the token is observed triggered.
// on interrupt, drop_wakers is called and its output returned alongside the reason.
pub(crate) fn poll<F>(
    fut: &mut F,
    timeout: Timeout,
    cancel: Option<&CancelToken>,
) -> Result<F::Output, (Interrupt, F::DropWakersOutput)>
where
    F: Future + DropWakers + Unpin,
{
    if cancel.is_some_and(|token| token.is_set()) {
        // observed before even trying
        return Err((Interrupt::Cancelled, fut.drop_wakers()));
    }
    unsafe {
        // our Waker's data pointer is just to this Signal local variable. the DropWakers unsafe
        // trait allows us to ensure all references to it are eliminated before we return.
        let signal = Signal {
            state: Mutex::new(State::Empty),
            cond: Condvar::new(),
        };

        // construct context and poll
        let data = &signal as *const Signal as *const ();
        let waker = Waker::from_raw(vtable_clone(data));
        let mut cx = Context::from_waker(&waker);
        // safety: poll_inner will call fut.poll, which may panic. however, fut unsafe-implements
        //         DropWakers, so it must drop any cloned wakers before panicking.
        let resolved = poll_inner(fut, &signal, &mut cx, timeout, cancel);

        // clean up before returning.
        // safety: drop_wakers may panic. however, DropWakers requires that if drop_wakers does
        //         exit via panic, it drops any cloned wakers before doing so, so there will be no
        //         dangling pointers to the signal local variable as unwinding occurs.
        let to_return = resolved.map_err(|interrupt| (interrupt, fut.drop_wakers()));
        // safety: fut unsafe-implements DropWakers, so:
        //
        // - if it returned Ready, it must have already dropped any cloned wakers.
        // - if it didn't return Ready, we called drop_wakers, in which case it must have already
        //   dropped any cloned wakers.
        //
        // therefore, at this point, there are no dangling pointers to the signal local variable,
        // so it can be dropped.
        drop(signal);

        // done
        to_return
    }
}

// poll future with context until resolves or is interrupted.
unsafe fn poll_inner<F>(
    fut: &mut F,
    signal: &Signal,
    cx: &mut Context,
    timeout: Timeout,
    cancel: Option<&CancelToken>,
) -> Result<F::Output, Interrupt>
where
    F: Future + DropWakers + Unpin,
{
    let interval = cancel_poll_interval();
    loop {
        // return if ready
        if let Poll::Ready(output) = Pin::new(&mut *fut).as_mut().poll(cx) {
            return Ok(output);
        }

        // otherwise, block until notification or interrupt
        let mut lock = signal.state.lock().unwrap();

        // if a notification is already present, skip to the next loop iteration so as to release
        // the lock and try polling again without blocking.
        if let &State::Notified = &*lock {
            *lock = State::Empty;
            continue;
        }

        // otherwise, actually block
        debug_assert!(matches!(&*lock, State::Empty));
        let deadline = match timeout {
            Timeout::Never => None,
            Timeout::At(deadline) => Some(deadline),
            Timeout::NonBlocking => return Err(Interrupt::WouldBlock),
        };
        *lock = State::Waiting;
        while let &State::Waiting = &*lock {
            let now = Instant::now();
            if deadline.is_some_and(|deadline| deadline <= now) {
                return Err(Interrupt::TimedOut);
            }
            // wake up at whichever comes first of the deadline and the next token check
            let wake_at = match (deadline, cancel) {
                (deadline, Some(_)) => Some(deadline.map_or(now + interval, |d| d.min(now + interval))),
                (deadline, None) => deadline,
            };
            lock = match wake_at {
                None => signal.cond.wait(lock).unwrap(),
                Some(wake_at) => signal.cond.wait_timeout(lock, wake_at - now).unwrap().0,
            };
            if cancel.is_some_and(|token| token.is_set()) {
                return Err(Interrupt::Cancelled);
            }
        }
        *lock = State::Empty;
    }
}

// synchronization signal state
enum State {
    Empty,
    Waiting,
    Notified,
}

// synchronization signal
struct Signal {
    state: Mutex<State>,
    cond: Condvar,
}


// ==== vtable ====

const VTABLE: &'static RawWakerVTable =
    &RawWakerVTable::new(vtable_clone, vtable_wake, vtable_wake, vtable_drop);

unsafe fn vtable_clone(data: *const ()) -> RawWaker {
    RawWaker::new(data, VTABLE)
}

unsafe fn vtable_wake(data: *const ()) {
    // notify signal
    let signal = &*(data as *const Signal);
    let mut lock = signal.state.lock().unwrap();
    match &*lock {
        &State::Notified => (),
        &State::Empty => {
            *lock = State::Notified;
        }
        &State::Waiting => {
            *lock = State::Empty;
            signal.cond.notify_one();
        }
    }
}

unsafe fn vtable_drop(_data: *const ()) {}
