// scheduler error types.

use std::io;
use thiserror::Error;


/// Error creating a [`Scheduler`](crate::Scheduler)
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The configuration asked for zero worker threads
    #[error("scheduler needs at least one worker")]
    NoWorkers,
    /// A worker thread could not be spawned
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Error spawning a unit
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Error)]
pub enum SpawnError {
    /// The scheduler has been shut down
    #[error("scheduler is shut down")]
    ShutDown,
    /// Not on a worker thread, and the default scheduler could not be created
    #[error("no scheduler available")]
    NoScheduler,
}

/// Error joining a unit
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Error)]
pub enum JoinError {
    /// The unit panicked, or was dropped by a forced shutdown, before producing its output
    #[error("unit aborted before completing")]
    Aborted,
    /// The join timed out before the unit completed
    #[error("timed out waiting for unit")]
    TimedOut,
}
