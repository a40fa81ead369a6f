// exposed API of channels

use self::future::*;
use super::{
    core::{self, Halt},
    error::*,
    kind::ChannelKind,
    polling::{Interrupt, Timeout},
};
use crate::{
    cancel::CancelToken,
    time::{Sleep, sleep_until},
};
use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    mem::size_of,
    pin::Pin,
    sync::atomic::Ordering::Relaxed,
    task::Context,
    time::Instant,
};


// ==== helper functions for adapting core API to exposed API ====


fn send_error<T>(channel: &core::Channel<T>, msg: T, cause: SendErrorCause) -> SendError<T> {
    channel.counters().send_failed.fetch_add(1, Relaxed);
    SendError { msg, cause }
}

fn recv_error<T>(channel: &core::Channel<T>, error: RecvError) -> RecvError {
    channel.counters().recv_failed.fetch_add(1, Relaxed);
    error
}

// convert a core send result into the exposed form.
fn map_send<T>(channel: &core::Channel<T>, result: Result<(), (T, Halt)>) -> Result<(), SendError<T>> {
    result.map_err(|(msg, halt)| {
        let cause = match halt {
            Halt::Closed => ClosedError.into(),
            Halt::WouldBlock | Halt::Withdrawn => WouldBlockError.into(),
        };
        send_error(channel, msg, cause)
    })
}

// convert the outcome of withdrawing an interrupted send. the send may have completed anyway.
fn map_send_interrupted<T>(
    channel: &core::Channel<T>,
    interrupt: Interrupt,
    withdrawn: Option<Result<(), (T, Halt)>>,
) -> Result<(), SendError<T>> {
    match withdrawn.expect("interrupted send was already terminated (internal bug)") {
        Ok(()) => Ok(()),
        Err((msg, Halt::Closed)) => Err(send_error(channel, msg, ClosedError.into())),
        Err((msg, _)) => Err(send_error(channel, msg, interrupt.into_error())),
    }
}

fn map_recv<T>(channel: &core::Channel<T>, result: Result<T, Halt>) -> Result<T, RecvError> {
    result.map_err(|halt| match halt {
        Halt::Closed => recv_error(channel, ClosedError.into()),
        Halt::WouldBlock | Halt::Withdrawn => recv_error(channel, WouldBlockError.into()),
    })
}

fn map_recv_interrupted<T>(
    channel: &core::Channel<T>,
    interrupt: Interrupt,
    withdrawn: Option<Result<T, Halt>>,
) -> Result<T, RecvError> {
    match withdrawn.expect("interrupted recv was already terminated (internal bug)") {
        Ok(msg) => Ok(msg),
        Err(Halt::Closed) => Err(recv_error(channel, ClosedError.into())),
        Err(_) => Err(recv_error(channel, interrupt.into_error())),
    }
}


// deadline and cancellation token attached to an awaited operation.
#[derive(Default)]
pub(crate) struct Interrupts {
    sleep: Option<Sleep>,
    cancel: Option<CancelToken>,
    // registration key with the cancel token.
    key: Option<u64>,
}

impl Interrupts {
    // keep whichever deadline is earliest.
    pub(crate) fn set_deadline(&mut self, deadline: Instant) {
        if self.sleep.as_ref().is_some_and(|sleep| sleep.deadline() <= deadline) {
            return;
        }
        self.sleep = Some(sleep_until(deadline));
    }

    pub(crate) fn set_cancel(&mut self, token: &CancelToken) {
        if let Some(old) = self.cancel.take() {
            old.unregister(&mut self.key);
        }
        self.cancel = Some(token.clone());
    }

    // check for an interrupt, registering the waker to be woken upon one.
    pub(crate) fn poll(&mut self, cx: &mut Context) -> Option<Interrupt> {
        if let Some(token) = &self.cancel {
            if token.is_set() {
                return Some(Interrupt::Cancelled);
            }
            token.register(&mut self.key, cx.waker());
            if token.is_set() {
                return Some(Interrupt::Cancelled);
            }
        }
        if let Some(sleep) = &mut self.sleep {
            if Pin::new(sleep).poll(cx).is_ready() {
                return Some(Interrupt::TimedOut);
            }
        }
        None
    }
}

impl Drop for Interrupts {
    fn drop(&mut self) {
        if let Some(token) = &self.cancel {
            token.unregister(&mut self.key);
        }
    }
}


// ==== the exposed API ====


/// Handle to a channel
///
/// A channel moves messages of type `T` from senders to receivers, first in first out. How many
/// messages it can hold is decided by its [`ChannelKind`]. Any handle can both send and receive;
/// cloning a handle is cheap and refers to the same channel.
///
/// Each operation comes as a future ([`send`](Self::send), [`recv`](Self::recv)), which can be
/// awaited or driven from a thread with its `block` family of methods, and as a convenience
/// method which blocks directly.
///
/// ```
/// # use sluice::{Channel, ChannelKind, error::RecvError};
/// let chan = Channel::new(ChannelKind::Bounded(2)).unwrap();
/// chan.try_send(11).unwrap();
/// chan.try_send(22).unwrap();
/// assert!(chan.try_send(33).is_err());
/// chan.close();
/// assert_eq!(chan.try_recv(), Ok(11));
/// assert_eq!(chan.try_recv(), Ok(22));
/// assert!(chan.try_recv().unwrap_err().is_closed());
/// ```
pub struct Channel<T>(core::Channel<T>);

/// Snapshot of a channel's operation counters
///
/// Counters only ever increase. Failed operations include ones which would have blocked, timed
/// out, were cancelled, or found the channel closed.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct ChannelStats {
    /// Messages successfully sent
    pub sent: u64,
    /// Messages successfully received
    pub received: u64,
    /// Send operations which failed
    pub send_failed: u64,
    /// Receive operations which failed
    pub recv_failed: u64,
}

impl<T> Channel<T> {
    /// Create a channel of the given kind
    ///
    /// Errors if the kind is not constructible, which is the case for a bound of zero (use
    /// [`ChannelKind::Rendezvous`]) or above [`MAX_BOUND`](crate::MAX_BOUND).
    pub fn new(kind: ChannelKind) -> Result<Self, UnsupportedError> {
        Ok(Self::from_kind(kind.validate()?))
    }

    // construct from an already validated kind.
    pub(crate) fn from_kind(kind: ChannelKind) -> Self {
        debug!(?kind, "channel created");
        Channel(core::Channel::new(kind))
    }

    pub(crate) fn core(&self) -> &core::Channel<T> {
        &self.0
    }

    /// Create a future to send a message on this channel
    ///
    /// See the API of [`SendFut`], as it is not only a future, but also provides additional
    /// methods, including the API for blocking on a send operation or trying to send immediately.
    pub fn send(&self, msg: T) -> SendFut<T> {
        SendFut {
            fut: self.0.send(msg),
            interrupts: Interrupts::default(),
        }
    }

    /// Create a future to receive a message from this channel
    ///
    /// See the API of [`RecvFut`], as it is not only a future, but also provides additional
    /// methods, including the API for blocking on a recv operation or trying to recv immediately.
    pub fn recv(&self) -> RecvFut<T> {
        RecvFut {
            fut: self.0.recv(),
            interrupts: Interrupts::default(),
        }
    }

    /// Send a message, blocking for at most the given timeout
    ///
    /// A zero duration converts to [`Timeout::NonBlocking`].
    pub fn send_timeout(&self, msg: T, timeout: impl Into<Timeout>) -> Result<(), SendError<T>> {
        self.send(msg).block_inner(timeout.into(), None)
    }

    /// Receive a message, blocking for at most the given timeout
    pub fn recv_timeout(&self, timeout: impl Into<Timeout>) -> Result<T, RecvError> {
        self.recv().block_inner(timeout.into(), None)
    }

    /// Send a message only if it can be done without blocking
    pub fn try_send(&self, msg: T) -> Result<(), SendError<T>> {
        self.send(msg).try_now()
    }

    /// Receive a message only if it can be done without blocking
    pub fn try_recv(&self) -> Result<T, RecvError> {
        self.recv().try_now()
    }

    /// Send a message, blocking until it is sent, the timeout elapses, or the token is triggered
    pub fn send_cancellable(
        &self,
        msg: T,
        timeout: impl Into<Timeout>,
        token: &CancelToken,
    ) -> Result<(), SendError<T>> {
        self.send(msg).block_inner(timeout.into(), Some(token))
    }

    /// Receive a message, blocking until one arrives, the timeout elapses, or the token is
    /// triggered
    pub fn recv_cancellable(
        &self,
        timeout: impl Into<Timeout>,
        token: &CancelToken,
    ) -> Result<T, RecvError> {
        self.recv().block_inner(timeout.into(), Some(token))
    }

    /// Close the channel
    ///
    /// Every pending operation on the channel fails with [`ClosedError`], as will any further
    /// send. Receiving still yields messages that were already buffered, and then fails with
    /// [`ClosedError`]. Returns whether this call closed the channel, as opposed to it already
    /// being closed.
    pub fn close(&self) -> bool {
        if self.0.is_closed() {
            return false;
        }
        let closed = self.0.lock().close();
        if closed {
            debug!(kind = ?self.0.kind(), "channel closed");
        }
        closed
    }

    /// Whether the channel has been closed
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    /// Number of buffered messages
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Whether no messages are buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered messages, or `None` if unlimited
    pub fn capacity(&self) -> Option<usize> {
        self.0.kind().capacity()
    }

    /// The kind this channel was created with
    pub fn kind(&self) -> ChannelKind {
        self.0.kind()
    }

    /// Size in bytes of one message
    pub fn element_size(&self) -> usize {
        size_of::<T>()
    }

    /// Current operation counters
    pub fn stats(&self) -> ChannelStats {
        let counters = self.0.counters();
        ChannelStats {
            sent: counters.sent.load(Relaxed),
            received: counters.received.load(Relaxed),
            send_failed: counters.send_failed.load(Relaxed),
            recv_failed: counters.recv_failed.load(Relaxed),
        }
    }

    /// Whether both handles refer to the same channel
    pub fn same_channel(&self, other: &Self) -> bool {
        self.0.same_channel(&other.0)
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel(self.0.clone())
    }
}

impl<T> Debug for Channel<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Channel")
            .field("kind", &self.0.kind())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}


// future types for channels.
pub(crate) mod future {
    use super::*;
    use crate::channel::polling::poll;
    use std::{
        task::Poll,
        time::Duration,
    };

    /// Future for sending into a [`Channel`]
    ///
    /// The message is not sent until this future resolves (a call to `poll` returns
    /// `Poll::Ready`). If this future has not yet resolved, the send operation may be aborted and
    /// its message retrieved by calling [`rescind`](Self::rescind). Dropping it aborts the send
    /// and drops the message.
    ///
    /// Ownership of the message never transfers on failure: every error hands it back in
    /// [`SendError::msg`].
    pub struct SendFut<T> {
        pub(super) fut: core::Send<T>,
        pub(super) interrupts: Interrupts,
    }

    impl<T> Future for SendFut<T> {
        type Output = Result<(), SendError<T>>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
            let this = self.get_mut();
            // for implementation of FusedFuture
            if this.is_terminated() {
                return Poll::Pending;
            }
            if let Some(interrupt) = this.interrupts.poll(cx) {
                let withdrawn = this.fut.withdraw();
                return Poll::Ready(map_send_interrupted(this.fut.channel(), interrupt, withdrawn));
            }
            this.fut.poll(cx).map(|result| map_send(this.fut.channel(), result))
        }
    }

    impl<T> SendFut<T> {
        pub(super) fn block_inner(
            &mut self,
            timeout: Timeout,
            cancel: Option<&CancelToken>,
        ) -> Result<(), SendError<T>> {
            assert!(!self.is_terminated(), "SendFut.block called after terminated");
            match poll(&mut self.fut, timeout, cancel) {
                Ok(result) => map_send(self.fut.channel(), result),
                Err((interrupt, withdrawn)) => {
                    map_send_interrupted(self.fut.channel(), interrupt, withdrawn)
                }
            }
        }

        /// If the message has not yet been sent, abort the send operation and take back the
        /// message
        ///
        /// Returns `None` if this future already resolved or rescinded, or if the message was
        /// sent before it could be rescinded.
        pub fn rescind(&mut self) -> Option<T> {
            match self.fut.withdraw()? {
                Ok(()) => None,
                Err((msg, _)) => Some(msg),
            }
        }

        /// Try to resolve this future immediately without blocking
        ///
        /// Calling this method counts as polling this future, and when this method returns, that
        /// counts as this future resolving. This method will panic if this future has already
        /// resolved or rescinded.
        pub fn try_now(&mut self) -> Result<(), SendError<T>> {
            assert!(!self.is_terminated(), "SendFut.try_now called after terminated");
            let result = self.fut.try_now()
                .expect("send future terminated while trying (internal bug)");
            map_send(self.fut.channel(), result)
        }

        /// Block until this future resolves
        ///
        /// Calling this method counts as polling this future, and when this method returns, that
        /// counts as this future resolving. This method will panic if this future has already
        /// resolved or rescinded.
        pub fn block(&mut self) -> Result<(), SendError<T>> {
            self.block_inner(Timeout::Never, None)
        }

        /// Block until this future resolves or a timeout elapses
        ///
        /// Same as [`block`](Self::block) otherwise. A zero duration does not block at all.
        pub fn block_timeout(&mut self, timeout: Duration) -> Result<(), SendError<T>> {
            self.block_inner(timeout.into(), None)
        }

        /// Block until this future resolves or the deadline is reached
        pub fn block_deadline(&mut self, deadline: Instant) -> Result<(), SendError<T>> {
            self.block_inner(Timeout::At(deadline), None)
        }

        /// Block until this future resolves, the timeout elapses, or the token is triggered
        ///
        /// The token is re-checked every [`cancel_poll_interval`](crate::cancel_poll_interval)
        /// while blocked.
        pub fn block_cancellable(
            &mut self,
            timeout: impl Into<Timeout>,
            token: &CancelToken,
        ) -> Result<(), SendError<T>> {
            self.block_inner(timeout.into(), Some(token))
        }

        /// When awaited, give up with [`TimedOutError`] at the deadline
        ///
        /// If called more than once, the earliest deadline governs.
        pub fn deadline(mut self, deadline: Instant) -> Self {
            self.interrupts.set_deadline(deadline);
            self
        }

        /// When awaited, give up with [`TimedOutError`] after the duration
        pub fn timeout(self, timeout: Duration) -> Self {
            self.deadline(Instant::now() + timeout)
        }

        /// When awaited, give up with [`CancelledError`] once the token is triggered
        pub fn cancel_on(mut self, token: &CancelToken) -> Self {
            self.interrupts.set_cancel(token);
            self
        }

        /// Whether this future has already resolved or rescinded
        pub fn is_terminated(&self) -> bool {
            self.fut.is_terminated()
        }
    }

    #[cfg(feature = "futures")]
    impl<T> futures::future::FusedFuture for SendFut<T> {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }


    /// Future for receiving from a [`Channel`]
    ///
    /// Once parked, a sender may hand a message directly to this future before it is polled
    /// again. If this future has not yet resolved, the receive operation may be aborted by calling
    /// [`abort`](Self::abort), which returns such a message if one was already handed over. If
    /// instead the future is dropped, that message is given back to the channel, to be taken by
    /// the next receiver ahead of anything buffered.
    pub struct RecvFut<T> {
        pub(super) fut: core::Recv<T>,
        pub(super) interrupts: Interrupts,
    }

    impl<T> Future for RecvFut<T> {
        type Output = Result<T, RecvError>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
            let this = self.get_mut();
            // for implementation of FusedFuture
            if this.is_terminated() {
                return Poll::Pending;
            }
            if let Some(interrupt) = this.interrupts.poll(cx) {
                let withdrawn = this.fut.withdraw();
                return Poll::Ready(map_recv_interrupted(this.fut.channel(), interrupt, withdrawn));
            }
            this.fut.poll(cx).map(|result| map_recv(this.fut.channel(), result))
        }
    }

    impl<T> RecvFut<T> {
        pub(super) fn block_inner(
            &mut self,
            timeout: Timeout,
            cancel: Option<&CancelToken>,
        ) -> Result<T, RecvError> {
            assert!(!self.is_terminated(), "RecvFut.block called after terminated");
            match poll(&mut self.fut, timeout, cancel) {
                Ok(result) => map_recv(self.fut.channel(), result),
                Err((interrupt, withdrawn)) => {
                    map_recv_interrupted(self.fut.channel(), interrupt, withdrawn)
                }
            }
        }

        /// Abort this receive operation
        ///
        /// If a message was delivered to this operation before it could be aborted, it is
        /// returned rather than lost. Does nothing if this future already resolved or aborted.
        /// This method never panics.
        pub fn abort(&mut self) -> Option<T> {
            self.fut.withdraw()?.ok()
        }

        /// Try to resolve this future immediately without blocking
        ///
        /// Calling this method counts as polling this future, and when this method returns, that
        /// counts as this future resolving. This method will panic if this future has already
        /// resolved or aborted.
        pub fn try_now(&mut self) -> Result<T, RecvError> {
            assert!(!self.is_terminated(), "RecvFut.try_now called after terminated");
            let result = self.fut.try_now()
                .expect("recv future terminated while trying (internal bug)");
            map_recv(self.fut.channel(), result)
        }

        /// Block until this future resolves
        ///
        /// Calling this method counts as polling this future, and when this method returns, that
        /// counts as this future resolving. This method will panic if this future has already
        /// resolved or aborted.
        pub fn block(&mut self) -> Result<T, RecvError> {
            self.block_inner(Timeout::Never, None)
        }

        /// Block until this future resolves or a timeout elapses
        ///
        /// Same as [`block`](Self::block) otherwise. A zero duration does not block at all.
        pub fn block_timeout(&mut self, timeout: Duration) -> Result<T, RecvError> {
            self.block_inner(timeout.into(), None)
        }

        /// Block until this future resolves or the deadline is reached
        pub fn block_deadline(&mut self, deadline: Instant) -> Result<T, RecvError> {
            self.block_inner(Timeout::At(deadline), None)
        }

        /// Block until this future resolves, the timeout elapses, or the token is triggered
        ///
        /// The token is re-checked every [`cancel_poll_interval`](crate::cancel_poll_interval)
        /// while blocked.
        pub fn block_cancellable(
            &mut self,
            timeout: impl Into<Timeout>,
            token: &CancelToken,
        ) -> Result<T, RecvError> {
            self.block_inner(timeout.into(), Some(token))
        }

        /// When awaited, give up with [`TimedOutError`] at the deadline
        ///
        /// If called more than once, the earliest deadline governs.
        pub fn deadline(mut self, deadline: Instant) -> Self {
            self.interrupts.set_deadline(deadline);
            self
        }

        /// When awaited, give up with [`TimedOutError`] after the duration
        pub fn timeout(self, timeout: Duration) -> Self {
            self.deadline(Instant::now() + timeout)
        }

        /// When awaited, give up with [`CancelledError`] once the token is triggered
        pub fn cancel_on(mut self, token: &CancelToken) -> Self {
            self.interrupts.set_cancel(token);
            self
        }

        /// Whether this future has already resolved or aborted
        pub fn is_terminated(&self) -> bool {
            self.fut.is_terminated()
        }
    }

    #[cfg(feature = "futures")]
    impl<T> futures::future::FusedFuture for RecvFut<T> {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }
}


// ==== tests ====


#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rand_pcg::Pcg32;
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicUsize, Ordering::SeqCst},
            Arc,
            Mutex,
        },
        thread,
        time::Duration,
    };

    fn chan<T>(kind: ChannelKind) -> Channel<T> {
        Channel::new(kind).unwrap()
    }

    #[test]
    fn rendezvous_producer_consumer() -> anyhow::Result<()> {
        let ch = chan(ChannelKind::Rendezvous);
        let ch_2 = ch.clone();
        let producer = thread::spawn(move || {
            let mut sent = 0;
            for i in 0..10 {
                ch_2.send(i).block().unwrap();
                sent += 1;
            }
            sent
        });
        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(ch.recv().block()?);
        }
        assert_eq!(producer.join().unwrap(), 10);
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert_eq!(ch.stats().sent, 10);
        assert_eq!(ch.stats().received, 10);
        Ok(())
    }

    #[test]
    fn bounded_would_block() {
        let ch = chan(ChannelKind::Bounded(2));
        ch.send_timeout(11, Timeout::Never).unwrap();
        ch.send_timeout(22, Timeout::Never).unwrap();
        let e = ch.send_timeout(33, Duration::ZERO).unwrap_err();
        assert_eq!(e.cause, WouldBlockError.into());
        assert_eq!(e.msg, 33);
        assert_eq!(ch.recv_timeout(Timeout::Never), Ok(11));
        assert_eq!(ch.recv_timeout(Timeout::Never), Ok(22));
        assert_eq!(ch.recv_timeout(Duration::ZERO), Err(WouldBlockError.into()));
        assert!(!ch.is_closed());
        let stats = ch.stats();
        assert_eq!((stats.sent, stats.received, stats.send_failed, stats.recv_failed), (2, 2, 1, 1));
    }

    #[test]
    fn buffered_value_survives_close() {
        let ch = chan(ChannelKind::Bounded(1));
        ch.send_timeout(7, Timeout::Never).unwrap();
        assert!(ch.close());
        assert!(!ch.close());
        let e = ch.send_timeout(99, Timeout::Never).unwrap_err();
        assert!(e.cause.is_closed());
        assert_eq!(e.into_msg(), 99);
        assert_eq!(ch.recv_timeout(Timeout::Never), Ok(7));
        assert_eq!(ch.recv_timeout(Timeout::Never), Err(ClosedError.into()));
    }

    // payload which counts how many times it is dropped.
    struct Payload {
        id: u64,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Payload {
        fn drop(&mut self) {
            self.drops.fetch_add(1, SeqCst);
        }
    }

    #[test]
    fn many_producers_many_consumers() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 2000;

        let ch = chan::<Box<Payload>>(ChannelKind::Rendezvous);
        let drops = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(HashSet::new()));

        let producers = (0..PRODUCERS)
            .map(|p| {
                let ch = ch.clone();
                let drops = Arc::clone(&drops);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let payload = Box::new(Payload { id: p * PER_PRODUCER + i, drops: Arc::clone(&drops) });
                        ch.send(payload).block().unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        let consumers = (0..4)
            .map(|_| {
                let ch = ch.clone();
                let seen = Arc::clone(&seen);
                thread::spawn(move || {
                    while let Ok(payload) = ch.recv().block() {
                        assert!(seen.lock().unwrap().insert(payload.id));
                        // consumer frees the payload
                        drop(payload);
                    }
                })
            })
            .collect::<Vec<_>>();

        for producer in producers {
            producer.join().unwrap();
        }
        ch.close();
        for consumer in consumers {
            consumer.join().unwrap();
        }

        let total = (PRODUCERS * PER_PRODUCER) as usize;
        let stats = ch.stats();
        assert_eq!(stats.sent, stats.received);
        assert_eq!(stats.sent as usize, total);
        assert_eq!(drops.load(SeqCst), total);
        assert_eq!(seen.lock().unwrap().len(), total);
    }

    #[test]
    fn conflated_keeps_only_newest() {
        let ch = chan(ChannelKind::Conflated);
        assert_eq!(ch.capacity(), Some(1));
        for i in 0..5 {
            ch.try_send(i).unwrap();
        }
        assert_eq!(ch.len(), 1);
        assert_eq!(ch.try_recv(), Ok(4));
        assert_eq!(ch.try_recv(), Err(WouldBlockError.into()));
    }

    #[test]
    fn unlimited_never_blocks() {
        let ch = chan(ChannelKind::Unlimited);
        assert_eq!(ch.capacity(), None);
        for i in 0..10_000 {
            ch.try_send(i).unwrap();
        }
        assert_eq!(ch.len(), 10_000);
        for i in 0..10_000 {
            assert_eq!(ch.try_recv(), Ok(i));
        }
    }

    #[test]
    fn unsupported_kinds() {
        assert_eq!(Channel::<u8>::new(ChannelKind::Bounded(0)).unwrap_err(), UnsupportedError);
        assert_eq!(chan::<u64>(ChannelKind::Rendezvous).element_size(), 8);
    }

    #[test]
    fn close_wakes_every_waiter_once() {
        let ch = chan::<u32>(ChannelKind::Rendezvous);
        let waiters = (0..6)
            .map(|i| {
                let ch = ch.clone();
                thread::spawn(move || {
                    if i % 2 == 0 {
                        ch.recv().block().map(drop).map_err(|e| e.is_closed())
                    } else {
                        ch.send(i).block().map_err(|e| e.cause.is_closed())
                    }
                })
            })
            .collect::<Vec<_>>();
        // let them park. senders and receivers may pair off with each other first
        thread::sleep(Duration::from_millis(50));
        ch.close();
        for waiter in waiters {
            match waiter.join().unwrap() {
                Ok(()) => (),
                Err(closed) => assert!(closed),
            }
        }
        assert_eq!(ch.core().lock().parked(), (0, 0));
    }

    #[test]
    fn timeout_returns_message() {
        let ch = chan(ChannelKind::Rendezvous);
        let start = Instant::now();
        let e = ch.send(5).block_timeout(Duration::from_millis(30)).unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(e.cause, TimedOutError.into());
        assert_eq!(e.msg, 5);
        // no waiter left behind
        assert_eq!(ch.core().lock().parked(), (0, 0));
        assert_eq!(ch.recv().block_timeout(Duration::from_millis(10)), Err(TimedOutError.into()));
    }

    #[test]
    fn cancellable_operations() {
        let ch = chan::<u32>(ChannelKind::Rendezvous);
        let token = CancelToken::new();
        let child = token.child();
        let token_2 = token.clone();
        let join = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            token_2.trigger();
        });
        assert_eq!(ch.recv_cancellable(Timeout::Never, &child), Err(CancelledError.into()));
        join.join().unwrap();
        // already triggered, so it fails without waiting
        let e = ch.send_cancellable(1, Timeout::Never, &child).unwrap_err();
        assert_eq!(e.cause, CancelledError.into());
        assert_eq!(ch.core().lock().parked(), (0, 0));
    }

    #[test]
    fn rescind_and_abort() {
        let ch = chan::<u32>(ChannelKind::Rendezvous);
        let mut send = ch.send(3);
        assert!(send.try_now().is_err());
        assert!(send.is_terminated());
        assert_eq!(send.rescind(), None);

        let mut send = ch.send(4);
        assert_eq!(send.rescind(), Some(4));
        let mut recv = ch.recv();
        assert_eq!(recv.abort(), None);
        assert!(recv.is_terminated());
    }

    #[test]
    fn dropped_recv_does_not_lose_message() {
        let ch = chan::<u32>(ChannelKind::Rendezvous);
        let mut cx = Context::from_waker(std::task::Waker::noop());
        let mut recv = Box::pin(ch.recv());
        assert!(recv.as_mut().poll(&mut cx).is_pending());
        // handed straight to the parked receiver
        ch.try_send(42).unwrap();
        drop(recv);
        assert_eq!(ch.len(), 1);
        assert_eq!(ch.try_recv(), Ok(42));
        let stats = ch.stats();
        assert_eq!((stats.sent, stats.received), (1, 1));
    }

    #[test]
    fn randomized_bounded_matches_model() {
        // single-threaded mix of non-blocking operations checked against a model queue
        let mut rng = Pcg32::from_seed(0xdeadbeefdeadbeefdeadbeefdeadbeefu128.to_le_bytes());
        for bound in [1, 2, 5, 16] {
            let ch = chan::<u32>(ChannelKind::Bounded(bound));
            let mut model = std::collections::VecDeque::new();
            for i in 0..5_000 {
                if rng.gen_bool(0.5) {
                    let result = ch.try_send(i);
                    if model.len() < bound {
                        assert!(result.is_ok());
                        model.push_back(i);
                    } else {
                        assert_eq!(result.unwrap_err().cause, WouldBlockError.into());
                    }
                } else {
                    match model.pop_front() {
                        Some(expect) => assert_eq!(ch.try_recv(), Ok(expect)),
                        None => assert_eq!(ch.try_recv(), Err(WouldBlockError.into())),
                    }
                }
                assert!(ch.len() <= bound);
                assert_eq!(ch.len(), model.len());
            }
        }
    }

    #[test]
    fn awaited_on_foreign_executor() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let ch = chan::<u32>(ChannelKind::Bounded(1));
        rt.block_on(async {
            let consumer = tokio::spawn({
                let ch = ch.clone();
                async move {
                    let mut sum = 0;
                    while let Ok(n) = ch.recv().await {
                        sum += n;
                    }
                    sum
                }
            });
            for i in 1..=100 {
                ch.send(i).await.unwrap();
            }
            ch.close();
            assert_eq!(consumer.await.unwrap(), 5050);

            let idle = chan::<u32>(ChannelKind::Rendezvous);
            let result = idle.recv().timeout(Duration::from_millis(20)).await;
            assert_eq!(result, Err(TimedOutError.into()));

            let token = CancelToken::new();
            let fut = idle.send(1).cancel_on(&token);
            token.trigger();
            let e = fut.await.unwrap_err();
            assert_eq!(e.cause, CancelledError.into());
            assert_eq!(e.msg, 1);
        });
    }
}
