// channel capacity models.

use super::error::UnsupportedError;


/// Largest bound accepted for a [`ChannelKind::Bounded`] channel
pub const MAX_BOUND: usize = 1 << 30;


/// Capacity model of a [`Channel`](crate::Channel)
///
/// The kind is fixed when the channel is created.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ChannelKind {
    /// No buffer: a send and a receive must meet directly, or one parks until the other arrives
    Rendezvous,
    /// Ring buffer holding up to the given number of messages
    ///
    /// Sends wait while the buffer is full. The bound must be in `1..=MAX_BOUND`.
    Bounded(usize),
    /// Single slot that always holds the most recently sent message
    ///
    /// Sending never waits: a new message replaces any message not yet received.
    Conflated,
    /// Ring buffer which grows on demand, so sending never waits
    Unlimited,
}

impl ChannelKind {
    // check that a channel of this kind can be constructed.
    pub(crate) fn validate(self) -> Result<Self, UnsupportedError> {
        match self {
            ChannelKind::Bounded(n) if n == 0 || n > MAX_BOUND => Err(UnsupportedError),
            kind => Ok(kind),
        }
    }

    /// Maximum number of buffered messages, or `None` if unlimited
    pub fn capacity(self) -> Option<usize> {
        match self {
            ChannelKind::Rendezvous => Some(0),
            ChannelKind::Bounded(n) => Some(n),
            ChannelKind::Conflated => Some(1),
            ChannelKind::Unlimited => None,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        assert_eq!(ChannelKind::Bounded(0).validate(), Err(UnsupportedError));
        assert_eq!(ChannelKind::Bounded(MAX_BOUND + 1).validate(), Err(UnsupportedError));
        assert_eq!(ChannelKind::Bounded(MAX_BOUND).validate(), Ok(ChannelKind::Bounded(MAX_BOUND)));
        assert_eq!(ChannelKind::Rendezvous.validate(), Ok(ChannelKind::Rendezvous));
        assert_eq!(ChannelKind::Unlimited.capacity(), None);
        assert_eq!(ChannelKind::Conflated.capacity(), Some(1));
    }
}
