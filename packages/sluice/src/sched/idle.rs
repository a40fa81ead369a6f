// parking of idle workers.
//
// a worker which found no work registers itself as a sleeper and re-checks for work while holding
// the lock before actually waiting. anyone who makes work available takes the lock after doing so
// and hands out a wake token if there is a sleeper without one. since both sides go through the
// same mutex, either the worker's re-check sees the new work or the notifier sees the sleeper.

use std::sync::{Condvar, Mutex};


pub(crate) struct Idle {
    state: Mutex<State>,
    cond: Condvar,
}

struct State {
    // workers currently waiting on the condvar.
    sleepers: usize,
    // wake-ups handed out but not yet consumed.
    tokens: usize,
}

impl Idle {
    pub(crate) fn new() -> Self {
        Idle {
            state: Mutex::new(State { sleepers: 0, tokens: 0 }),
            cond: Condvar::new(),
        }
    }

    // wake one sleeping worker, if there is one not already being woken.
    pub(crate) fn notify_one(&self) {
        let mut lock = self.state.lock().unwrap();
        if lock.sleepers > lock.tokens {
            lock.tokens += 1;
            self.cond.notify_one();
        }
    }

    // wake every sleeping worker, such as to observe shutdown.
    pub(crate) fn notify_all(&self) {
        let mut lock = self.state.lock().unwrap();
        lock.tokens = lock.sleepers;
        self.cond.notify_all();
    }

    // block until woken, unless `ready` (evaluated under the lock) says there's no need to.
    pub(crate) fn park(&self, ready: impl Fn() -> bool) {
        let mut lock = self.state.lock().unwrap();
        loop {
            if ready() {
                return;
            }
            lock.sleepers += 1;
            lock = self.cond.wait(lock).unwrap();
            lock.sleepers -= 1;
            if lock.tokens > 0 {
                lock.tokens -= 1;
                return;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn sleepers(&self) -> usize {
        self.state.lock().unwrap().sleepers
    }
}
