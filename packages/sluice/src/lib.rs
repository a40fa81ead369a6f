//! Channels, select, cancellation, and a work-stealing scheduler
//!
//! - [`Channel`]: a message queue of one of four [`ChannelKind`]s (rendezvous, bounded,
//!   conflated, unlimited). Every operation is a future which can be awaited on any executor, or
//!   blocked on from a plain thread, with optional timeouts and [`CancelToken`]s.
//! - [`Select`]: wait on several send and receive clauses at once, completing exactly one.
//! - [`CancelToken`]: a tree of one-way stop signals.
//! - [`Scheduler`]: an M:N scheduler running spawned futures on a pool of worker threads.
//!
//! ```
//! use sluice::{Channel, ChannelKind, Scheduler};
//!
//! let sched = Scheduler::with_workers(2).unwrap();
//! let chan = Channel::new(ChannelKind::Bounded(4)).unwrap();
//! let chan_2 = chan.clone();
//! sched.spawn(async move {
//!     for i in 0..10 {
//!         chan_2.send(i).await.unwrap();
//!     }
//!     chan_2.close();
//! }).unwrap();
//! let mut total = 0;
//! while let Ok(i) = chan.recv().block() {
//!     total += i;
//! }
//! assert_eq!(total, 45);
//! sched.shutdown();
//! ```

#[macro_use]
extern crate tracing;

mod channel;
mod cancel;
mod sched;
mod time;

pub use crate::{
    channel::{
        Channel,
        ChannelKind,
        ChannelStats,
        Timeout,
        Select,
        ProbeOrder,
        MAX_BOUND,
        CANCEL_POLL_INTERVAL,
        set_cancel_poll_interval,
        cancel_poll_interval,
    },
    cancel::{CancelToken, Cancelled},
    sched::{
        Scheduler,
        SchedulerConfig,
        StealOrder,
        Handle,
        JoinHandle,
        YieldNow,
        spawn,
        yield_now,
        DEFAULT_LIFO_BUDGET,
        DEFAULT_INJECTOR_BATCH,
    },
    time::{Sleep, sleep, sleep_until},
};

/// Error types
pub mod error {
    pub use crate::channel::error::*;
    pub use crate::sched::{SchedulerError, SpawnError, JoinError};
}

/// Future types
pub mod future {
    pub use crate::channel::api::future::*;
}
