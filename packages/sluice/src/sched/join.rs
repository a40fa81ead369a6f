// join handles, built on a conflated channel.

use super::error::JoinError;
use crate::{
    channel::{Channel, ChannelKind},
    future::RecvFut,
};
use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};


// closes the result channel when the unit's future is dropped, whether it completed, panicked, or
// was aborted. a completed unit sent its output first, which survives the close.
pub(crate) struct CloseOnDrop<T>(pub(crate) Channel<T>);

impl<T> Drop for CloseOnDrop<T> {
    fn drop(&mut self) {
        self.0.close();
    }
}

// create the two ends of a unit's result.
pub(crate) fn result_channel<T>() -> (Channel<T>, JoinHandle<T>) {
    let channel = Channel::from_kind(ChannelKind::Conflated);
    (channel.clone(), JoinHandle { id: 0, result: channel, fut: None })
}

/// Handle to a spawned unit's output
///
/// Dropping it detaches the unit, which keeps running. It can be awaited from any executor, or
/// blocked on with [`join`](Self::join).
pub struct JoinHandle<T> {
    id: u64,
    result: Channel<T>,
    // created upon first poll.
    fut: Option<RecvFut<T>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    /// Id of the unit, unique within its scheduler
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the unit has finished, by completing, panicking, or being aborted
    pub fn is_finished(&self) -> bool {
        self.result.is_closed()
    }

    /// Block until the unit finishes and take its output
    pub fn join(self) -> Result<T, JoinError> {
        self.result.recv().block().map_err(|_| JoinError::Aborted)
    }

    /// Block until the unit finishes or the timeout elapses
    ///
    /// On timeout the handle remains usable.
    pub fn join_timeout(&self, timeout: Duration) -> Result<T, JoinError> {
        self.result.recv().block_timeout(timeout).map_err(|e| {
            if e.is_closed() { JoinError::Aborted } else { JoinError::TimedOut }
        })
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = &this.result;
        let fut = this.fut.get_or_insert_with(|| result.recv());
        if fut.is_terminated() {
            // already resolved, so the output was already taken
            return Poll::Ready(Err(JoinError::Aborted));
        }
        Pin::new(fut).poll(cx).map(|r| r.map_err(|_| JoinError::Aborted))
    }
}

impl<T> Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
