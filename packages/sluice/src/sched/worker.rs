// worker thread main loop.

use super::{
    config::StealOrder,
    unit::{RunOutcome, Unit},
    Shared,
};
use crossbeam_deque::{Steal, Worker};
use rand::Rng;
use rand::SeedableRng;
use rand_pcg::Pcg32;
use std::{
    cell::RefCell,
    rc::Rc,
    sync::{atomic::Ordering::Acquire, Arc},
};


thread_local! {
    // state of the worker running on this thread, if any.
    static CONTEXT: RefCell<Option<Rc<Local>>> = const { RefCell::new(None) };
}

// per-worker state reachable from units it runs.
pub(crate) struct Local {
    pub(crate) index: usize,
    pub(crate) queue: Worker<Arc<Unit>>,
    pub(crate) shared: Arc<Shared>,
}

// call the function with the current thread's worker, if this is a worker thread.
pub(crate) fn with_current<R>(f: impl FnOnce(Option<&Local>) -> R) -> R {
    CONTEXT.with(|context| {
        let context = context.borrow().clone();
        f(context.as_deref())
    })
}

// retry a steal operation until it doesn't need retrying.
fn retry<T>(mut op: impl FnMut() -> Steal<T>) -> Option<T> {
    loop {
        match op() {
            Steal::Success(item) => return Some(item),
            Steal::Empty => return None,
            Steal::Retry => (),
        }
    }
}

// state of the loop itself, which units don't need to see.
struct WorkerLoop {
    local: Rc<Local>,
    rng: Pcg32,
    // next victim for round-robin stealing.
    next_victim: usize,
    // consecutive pops from the local queue since the injection queue was last serviced.
    local_pops: usize,
}

// run the worker loop on the current thread until the scheduler stops.
pub(crate) fn run(index: usize, queue: Worker<Arc<Unit>>, shared: Arc<Shared>) {
    trace!(worker = index, "worker started");
    let local = Rc::new(Local { index, queue, shared });
    CONTEXT.with(|context| *context.borrow_mut() = Some(Rc::clone(&local)));
    let mut worker = WorkerLoop {
        rng: Pcg32::seed_from_u64(index as u64),
        next_victim: (index + 1) % local.shared.stealers.len(),
        local_pops: 0,
        local,
    };
    worker.run();
    CONTEXT.with(|context| *context.borrow_mut() = None);
    trace!(worker = index, "worker stopped");
}

impl WorkerLoop {
    fn run(&mut self) {
        let shared = Arc::clone(&self.local.shared);
        while !shared.stopping.load(Acquire) {
            match self.next_unit() {
                Some(unit) => self.run_unit(unit),
                None => shared.idle.park(|| shared.stopping.load(Acquire) || shared.has_work()),
            }
        }
    }

    // find the next unit to run, without blocking.
    fn next_unit(&mut self) -> Option<Arc<Unit>> {
        let shared = &self.local.shared;
        let queue = &self.local.queue;
        // service the injection queue whenever there's nothing local or the budget is spent
        if queue.is_empty() || self.local_pops >= shared.config.lifo_budget {
            self.local_pops = 0;
            let batch = shared.config.injector_batch;
            if let Some(unit) = retry(|| shared.injector.steal_batch_with_limit_and_pop(queue, batch)) {
                return Some(unit);
            }
        }
        if let Some(unit) = queue.pop() {
            self.local_pops += 1;
            return Some(unit);
        }
        self.steal()
    }

    // try to steal from each peer once, starting at a victim picked by the steal order.
    fn steal(&mut self) -> Option<Arc<Unit>> {
        let stealers = &self.local.shared.stealers;
        let n = stealers.len();
        if n <= 1 {
            return None;
        }
        let start = match self.local.shared.config.steal_order {
            StealOrder::Random => self.rng.gen_range(0..n),
            StealOrder::RoundRobin => {
                let start = self.next_victim;
                self.next_victim = (start + 1) % n;
                start
            }
        };
        (0..n)
            .map(|i| (start + i) % n)
            .filter(|&victim| victim != self.local.index)
            .find_map(|victim| retry(|| stealers[victim].steal()))
    }

    fn run_unit(&mut self, unit: Arc<Unit>) {
        let shared = &self.local.shared;
        match unit.run() {
            RunOutcome::Parked => (),
            // to the back of the line, behind everyone waiting in the injection queue
            RunOutcome::Requeue => shared.inject(unit),
            RunOutcome::Finished => shared.retire(unit.id),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_a_worker() {
        assert!(with_current(|local| local.is_none()));
    }

    #[test]
    fn retry_until_settled() {
        let mut attempts = 0;
        let result = retry(|| {
            attempts += 1;
            if attempts < 3 { Steal::Retry } else { Steal::Success(attempts) }
        });
        assert_eq!(result, Some(3));
        assert_eq!(retry(|| Steal::<u8>::Empty), None);
    }
}
