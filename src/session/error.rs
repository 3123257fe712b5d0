//! Errors of the session begin/end exchange.

use fe2o3_amqp_types::definitions;

/// Error beginning a session.
#[derive(Debug, thiserror::Error)]
pub enum BeginError {
    /// The connection engine is no longer running
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection is not in a state that can begin sessions
    #[error("Illegal connection state")]
    IllegalState,

    /// All channels the peer allows are in use
    #[error("Connection channel-max reached")]
    ChannelMaxReached,

    /// The peer ended the session while it was being established
    #[error("Session ended by the peer: {:?}", .error)]
    RemoteEnded {
        /// Error carried by the end performative, if any
        error: Option<definitions::Error>,
    },
}

/// Error ending a session.
#[derive(Debug, thiserror::Error)]
pub enum EndError {
    /// The connection engine is no longer running
    #[error("Connection closed")]
    ConnectionClosed,

    /// The session is not in a state that can be ended
    #[error("Illegal session state")]
    IllegalState,
}
