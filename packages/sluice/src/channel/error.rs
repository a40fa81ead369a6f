// channel error types.

use std::{
    error::Error,
    fmt::{self, Debug, Display, Formatter},
};


// ==== base error types ====


/// Error for attempting an operation with no blocking, and the operation not being able to
/// complete immediately
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, thiserror::Error)]
#[error("operation would block")]
pub struct WouldBlockError;

/// Error for a bounded wait reaching its deadline without the operation completing
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, thiserror::Error)]
#[error("deadline elapsed")]
pub struct TimedOutError;

/// Error for a wait being interrupted by a triggered [`CancelToken`](crate::CancelToken)
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, thiserror::Error)]
#[error("operation cancelled")]
pub struct CancelledError;

/// Error for trying to use a channel which has been closed
///
/// For a send, this is returned as soon as the channel is closed. For a receive, it is returned
/// once the channel is closed _and_ no buffered messages remain.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, thiserror::Error)]
#[error("channel closed")]
pub struct ClosedError;

/// Error for requesting a mode or configuration the channel does not support
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, thiserror::Error)]
#[error("unsupported channel configuration")]
pub struct UnsupportedError;


// ==== compound error types ====


macro_rules! compound_from {
    ($compound:ident {$(
        $variant:ident($inner:ty),
    )*})=>{$(
        impl From<$inner> for $compound {
            fn from(inner: $inner) -> Self {
                Self::$variant(inner)
            }
        }
    )*};
}

/// Reason a message could not be sent
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, thiserror::Error)]
pub enum SendErrorCause {
    /// The operation could not complete without blocking
    #[error(transparent)]
    WouldBlock(WouldBlockError),
    /// The deadline elapsed first
    #[error(transparent)]
    TimedOut(TimedOutError),
    /// The cancellation token was triggered first
    #[error(transparent)]
    Cancelled(CancelledError),
    /// The channel is closed
    #[error(transparent)]
    Closed(ClosedError),
}

compound_from!(SendErrorCause {
    WouldBlock(WouldBlockError),
    TimedOut(TimedOutError),
    Cancelled(CancelledError),
    Closed(ClosedError),
});

impl SendErrorCause {
    /// Whether this is the terminal closed state
    pub fn is_closed(&self) -> bool {
        matches!(self, SendErrorCause::Closed(_))
    }
}

/// Error for trying to send into a channel
///
/// Ownership of the message never transfers on failure, so it is handed back here.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SendError<T, E = SendErrorCause> {
    /// The message that could not be sent
    pub msg: T,
    /// The reason the message could not be sent
    pub cause: E,
}

impl<T, E> SendError<T, E> {
    /// Take back the message, discarding the cause
    pub fn into_msg(self) -> T {
        self.msg
    }
}

// the message is deliberately left out so `T` needs no bounds.
impl<T, E: Debug> Debug for SendError<T, E> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("SendError")
            .field("cause", &self.cause)
            .finish_non_exhaustive()
    }
}

impl<T, E: Display> Display for SendError<T, E> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "failed to send: {}", self.cause)
    }
}

impl<T, E: Error + 'static> Error for SendError<T, E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.cause)
    }
}

/// Error for trying to receive from a channel
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, thiserror::Error)]
pub enum RecvError {
    /// The operation could not complete without blocking
    #[error(transparent)]
    WouldBlock(WouldBlockError),
    /// The deadline elapsed first
    #[error(transparent)]
    TimedOut(TimedOutError),
    /// The cancellation token was triggered first
    #[error(transparent)]
    Cancelled(CancelledError),
    /// The channel is closed and drained
    #[error(transparent)]
    Closed(ClosedError),
}

compound_from!(RecvError {
    WouldBlock(WouldBlockError),
    TimedOut(TimedOutError),
    Cancelled(CancelledError),
    Closed(ClosedError),
});

impl RecvError {
    /// Whether this is the terminal closed state
    pub fn is_closed(&self) -> bool {
        matches!(self, RecvError::Closed(_))
    }
}

/// Error for a [`Select`](crate::Select) that did not transfer a message
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, thiserror::Error)]
pub enum SelectError {
    /// No clause could complete without blocking
    #[error(transparent)]
    WouldBlock(WouldBlockError),
    /// The deadline elapsed first
    #[error(transparent)]
    TimedOut(TimedOutError),
    /// The cancellation token was triggered first
    #[error(transparent)]
    Cancelled(CancelledError),
    /// The clause at `index` won the race by observing its channel closed
    #[error("select clause {index} observed a closed channel")]
    Closed {
        /// Index of the clause, as returned when it was added
        index: usize,
    },
    /// The select has no clauses, so it could never complete
    #[error(transparent)]
    Unsupported(UnsupportedError),
}

compound_from!(SelectError {
    WouldBlock(WouldBlockError),
    TimedOut(TimedOutError),
    Cancelled(CancelledError),
    Unsupported(UnsupportedError),
});


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_error_debug_omits_message() {
        struct Opaque;
        let e = SendError { msg: Opaque, cause: SendErrorCause::from(ClosedError) };
        assert_eq!(format!("{:?}", e), "SendError { cause: Closed(ClosedError), .. }");
        assert_eq!(e.to_string(), "failed to send: channel closed");
    }

    #[test]
    fn select_closed_reports_index() {
        assert_eq!(
            SelectError::Closed { index: 3 }.to_string(),
            "select clause 3 observed a closed channel",
        );
        assert!(RecvError::from(ClosedError).is_closed());
        assert!(!RecvError::from(TimedOutError).is_closed());
    }
}
