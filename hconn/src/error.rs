//! HTTP connection manager error types and channel-layer error mapping.

use hconn_chan::ChannelError;
use thiserror::Error;

/// Marker carried through channel shutdown when the user failed to react to
/// a callback that required configuration.
const REACTION_REQUIRED_MARKER: &str = "reaction-required";
/// Marker carried through channel shutdown when a server rejects a channel
/// because it is already shutting down.
const SERVER_CLOSED_MARKER: &str = "server-closed";

/// Errors surfaced at the connection manager boundary.
///
/// `Clone` + `PartialEq` so one error can fan out to several callbacks and
/// tests can assert on delivered values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HttpError {
    /// An option or argument failed validation at entry.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The operation is not legal in the object's current state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The negotiated protocol is not supported by this library.
    #[error("unsupported protocol")]
    UnsupportedProtocol,

    /// The connection (or its channel) has closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server is shutting down and rejects new connections.
    #[error("server is shutting down")]
    ServerClosed,

    /// The user failed to react to a callback that required configuration.
    #[error("caller reaction required")]
    ReactionRequired,

    /// Every legal stream id on this connection has been used.
    #[error("stream ids exhausted")]
    StreamIdsExhausted,

    /// A queried value has not been set yet.
    #[error("data not available")]
    DataNotAvailable,

    /// An index was outside the bounds of the addressed collection.
    #[error("invalid index")]
    InvalidIndex,

    /// A channel-layer failure with no more specific meaning at this layer.
    #[error(transparent)]
    Channel(ChannelError),

    /// A failure whose origin could not be determined.
    #[error("unknown error")]
    Unknown,
}

impl HttpError {
    /// Map this error into the channel-layer error space so it can ride a
    /// channel shutdown and be recovered on the far side.
    pub(crate) fn to_channel_error(&self) -> ChannelError {
        match self {
            HttpError::ConnectionClosed => ChannelError::Closed,
            HttpError::ReactionRequired => ChannelError::Application(REACTION_REQUIRED_MARKER),
            HttpError::ServerClosed => ChannelError::Application(SERVER_CLOSED_MARKER),
            HttpError::InvalidState(message) => ChannelError::Application(message),
            HttpError::Channel(inner) => inner.clone(),
            _ => ChannelError::Application("http error"),
        }
    }
}

impl From<ChannelError> for HttpError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Closed | ChannelError::ShuttingDown => HttpError::ConnectionClosed,
            ChannelError::Application(REACTION_REQUIRED_MARKER) => HttpError::ReactionRequired,
            ChannelError::Application(SERVER_CLOSED_MARKER) => HttpError::ServerClosed,
            other => HttpError::Channel(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_errors_round_trip_through_shutdown() {
        for err in [
            HttpError::ConnectionClosed,
            HttpError::ReactionRequired,
            HttpError::ServerClosed,
        ] {
            let recovered = HttpError::from(err.to_channel_error());
            assert_eq!(recovered, err);
        }
    }

    #[test]
    fn socket_errors_stay_channel_errors() {
        let err = ChannelError::Socket {
            kind: std::io::ErrorKind::ConnectionRefused,
            message: "refused".to_string(),
        };
        assert_eq!(HttpError::from(err.clone()), HttpError::Channel(err));
    }
}
