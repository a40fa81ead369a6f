// scheduler configuration.

use std::{
    num::NonZeroUsize,
    thread::available_parallelism,
};


/// Default number of consecutive local pops before a worker services the injection queue
pub const DEFAULT_LIFO_BUDGET: usize = 32;

/// Default maximum number of units moved from the injection queue to a local queue at once
pub const DEFAULT_INJECTOR_BATCH: usize = 16;


/// How an idle worker picks which peer to steal from first
///
/// Either way, a steal attempt scans every peer once before the worker gives up and parks.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum StealOrder {
    /// Start the scan at a uniformly random peer
    ///
    /// Each worker draws from its own PCG stream seeded with its index, so runs are reproducible
    /// for a given interleaving.
    #[default]
    Random,
    /// Start the scan one peer further along each time
    RoundRobin,
}

/// Configuration for a [`Scheduler`](crate::Scheduler)
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub(crate) workers: usize,
    pub(crate) lifo_budget: usize,
    pub(crate) injector_batch: usize,
    pub(crate) steal_order: StealOrder,
    pub(crate) thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            workers: available_parallelism().map(NonZeroUsize::get).unwrap_or(1),
            lifo_budget: DEFAULT_LIFO_BUDGET,
            injector_batch: DEFAULT_INJECTOR_BATCH,
            steal_order: StealOrder::default(),
            thread_name: "sluice-worker".into(),
        }
    }
}

impl SchedulerConfig {
    /// Set the number of worker threads
    ///
    /// Defaults to the available parallelism. Zero is rejected when the scheduler is created.
    pub fn set_workers(&mut self, workers: usize) -> &mut Self {
        self.workers = workers;
        self
    }

    /// Ownership-chaining version of [`set_workers`](Self::set_workers)
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the soft fairness budget
    ///
    /// After this many consecutive pops from its own queue, a worker pulls from the injection
    /// queue before popping locally again, so that units submitted from outside are not starved
    /// by units which keep waking each other. Values below 1 are treated as 1.
    pub fn set_lifo_budget(&mut self, lifo_budget: usize) -> &mut Self {
        self.lifo_budget = lifo_budget.max(1);
        self
    }

    /// Ownership-chaining version of [`set_lifo_budget`](Self::set_lifo_budget)
    pub fn with_lifo_budget(mut self, lifo_budget: usize) -> Self {
        self.set_lifo_budget(lifo_budget);
        self
    }

    /// Set how many units a worker moves from the injection queue to its own queue at once
    ///
    /// Values below 1 are treated as 1.
    pub fn set_injector_batch(&mut self, injector_batch: usize) -> &mut Self {
        self.injector_batch = injector_batch.max(1);
        self
    }

    /// Ownership-chaining version of [`set_injector_batch`](Self::set_injector_batch)
    pub fn with_injector_batch(mut self, injector_batch: usize) -> Self {
        self.set_injector_batch(injector_batch);
        self
    }

    /// Set how idle workers choose steal victims
    pub fn set_steal_order(&mut self, steal_order: StealOrder) -> &mut Self {
        self.steal_order = steal_order;
        self
    }

    /// Ownership-chaining version of [`set_steal_order`](Self::set_steal_order)
    pub fn with_steal_order(mut self, steal_order: StealOrder) -> Self {
        self.steal_order = steal_order;
        self
    }

    /// Set the name prefix of worker threads
    ///
    /// Worker `i` is named `"{thread_name}-{i}"`.
    pub fn set_thread_name(&mut self, thread_name: impl Into<String>) -> &mut Self {
        self.thread_name = thread_name.into();
        self
    }

    /// Ownership-chaining version of [`set_thread_name`](Self::set_thread_name)
    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    /// Number of worker threads
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Local pops a worker makes before checking the injection queue
    pub fn lifo_budget(&self) -> usize {
        self.lifo_budget
    }

    /// Most units a worker moves from the injection queue at once
    pub fn injector_batch(&self) -> usize {
        self.injector_batch
    }

    /// How a worker picks the first peer to steal from
    pub fn steal_order(&self) -> StealOrder {
        self.steal_order
    }

    /// Name prefix of worker threads
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_clamp() {
        let config = SchedulerConfig::default()
            .with_workers(3)
            .with_lifo_budget(0)
            .with_injector_batch(0)
            .with_steal_order(StealOrder::RoundRobin)
            .with_thread_name("pool");
        assert_eq!(config.workers(), 3);
        assert_eq!(config.lifo_budget(), 1);
        assert_eq!(config.injector_batch(), 1);
        assert_eq!(config.steal_order(), StealOrder::RoundRobin);
        assert_eq!(config.thread_name(), "pool");
        assert!(SchedulerConfig::default().workers() >= 1);
    }
}
