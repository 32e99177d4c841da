//! Channel-layer error type.

use thiserror::Error;

/// Errors raised by channels, slots and the socket bootstrap.
///
/// The type is `Clone` because a single shutdown reason fans out to every
/// handler installed in the channel and to the bootstrap shutdown callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The slot was removed from its channel and can no longer be used.
    #[error("slot is no longer part of a channel")]
    SlotRemoved,

    /// The channel has started (or finished) shutting down.
    #[error("channel is shutting down")]
    ShuttingDown,

    /// The channel or slot topology does not permit the operation.
    #[error("invalid channel state: {0}")]
    InvalidState(&'static str),

    /// A socket-level failure, flattened so the error stays cloneable.
    #[error("socket error ({kind:?}): {message}")]
    Socket {
        kind: std::io::ErrorKind,
        message: String,
    },

    /// The channel was closed deliberately by an upper layer.
    #[error("channel closed")]
    Closed,

    /// An error raised above the channel layer, carried through shutdown.
    #[error("application error: {0}")]
    Application(&'static str),
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        ChannelError::Socket {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_flattens_to_socket() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = ChannelError::from(io);
        match err {
            ChannelError::Socket { kind, .. } => {
                assert_eq!(kind, std::io::ErrorKind::ConnectionRefused)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn socket_errors_compare_by_kind_and_message() {
        let a = ChannelError::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        let b = ChannelError::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert_eq!(a, b);
    }
}
