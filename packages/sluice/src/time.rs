//! Timer driver backing sleeps and async deadlines
//!
//! A single timer thread is started lazily the first time a [`Sleep`] needs to wait. It holds an
//! ordered map of deadlines and wakes the registered waker of each one as it passes.

use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    sync::{Condvar, Mutex, OnceLock},
    task::{Context, Poll, Waker},
    thread,
    time::{Duration, Instant},
};


// the process-wide timer.
static TIMER: OnceLock<Timer> = OnceLock::new();

struct Timer {
    state: Mutex<TimerState>,
    // notified when a new earliest deadline is registered.
    cond: Condvar,
}

struct TimerState {
    // pending deadlines, earliest first, keyed by (deadline, registration id). a sleep removes
    // its own entry when dropped.
    entries: BTreeMap<(Instant, u64), Waker>,
    next_id: u64,
}

fn timer() -> &'static Timer {
    TIMER.get_or_init(|| {
        thread::Builder::new()
            .name("sluice-timer".into())
            .spawn(|| run(timer()))
            .expect("failed to spawn timer thread");
        debug!("timer thread started");
        Timer {
            state: Mutex::new(TimerState {
                entries: BTreeMap::new(),
                next_id: 0,
            }),
            cond: Condvar::new(),
        }
    })
}

// timer thread body.
fn run(timer: &Timer) {
    let mut expired = Vec::new();
    let mut lock = timer.state.lock().unwrap();
    loop {
        let now = Instant::now();
        while let Some(entry) = lock.entries.first_entry() {
            if entry.key().0 > now { break; }
            expired.push(entry.remove());
        }
        if !expired.is_empty() {
            // wake with the lock released
            drop(lock);
            for waker in expired.drain(..) {
                waker.wake();
            }
            lock = timer.state.lock().unwrap();
            continue;
        }
        lock = match lock.entries.first_key_value() {
            Some((&(deadline, _), _)) => timer.cond.wait_timeout(lock, deadline - now).unwrap().0,
            None => timer.cond.wait(lock).unwrap(),
        };
    }
}


/// Future which resolves once a deadline passes
///
/// Created with [`sleep`] or [`sleep_until`]. Dropping it before it resolves deregisters it from
/// the timer.
#[must_use = "futures do nothing unless polled"]
pub struct Sleep {
    deadline: Instant,
    // registration id with the timer, once registered.
    id: Option<u64>,
}

impl Sleep {
    fn new(deadline: Instant) -> Self {
        Sleep { deadline, id: None }
    }

    /// The deadline at which this resolves
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whether the deadline has passed
    pub fn is_elapsed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn deregister(&mut self) {
        if let Some(id) = self.id.take() {
            if let Some(timer) = TIMER.get() {
                timer.state.lock().unwrap().entries.remove(&(self.deadline, id));
            }
        }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        let this = self.get_mut();
        if this.is_elapsed() {
            this.deregister();
            return Poll::Ready(());
        }
        let timer = timer();
        let mut lock = timer.state.lock().unwrap();
        let id = match this.id {
            Some(id) => id,
            None => {
                let id = lock.next_id;
                lock.next_id += 1;
                let earliest = lock.entries.first_key_value()
                    .is_none_or(|(&(d, _), _)| this.deadline < d);
                lock.entries.insert((this.deadline, id), cx.waker().clone());
                if earliest {
                    timer.cond.notify_one();
                }
                this.id = Some(id);
                return Poll::Pending;
            }
        };
        match lock.entries.get_mut(&(this.deadline, id)) {
            Some(waker) if waker.will_wake(cx.waker()) => (),
            Some(waker) => *waker = cx.waker().clone(),
            // fired between the elapsed check and locking, so it's about to be elapsed
            None => cx.waker().wake_by_ref(),
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        self.deregister();
    }
}

/// Sleep for the given duration
pub fn sleep(duration: Duration) -> Sleep {
    // saturate rather than overflow for absurd durations
    let deadline = Instant::now().checked_add(duration)
        .unwrap_or_else(|| Instant::now() + Duration::from_secs(60 * 60 * 24 * 365 * 30));
    Sleep::new(deadline)
}

/// Sleep until the given deadline
pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep::new(deadline)
}
