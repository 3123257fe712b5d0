//! Errors of connection establishment, shutdown, and the asynchronous
//! exception path.

use std::io;
use std::sync::Arc;

use fe2o3_amqp_types::definitions;

use crate::config::ConfigError;
use crate::transport::{self, NegotiationError};

/// Error opening a connection.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// IO error
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The remote URI does not parse
    #[error(transparent)]
    UrlError(#[from] url::ParseError),

    /// The factory configuration is unusable
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Only the `amqp` scheme is supported
    #[error(r#"Invalid scheme. Only "amqp" is supported."#)]
    InvalidScheme,

    /// Protocol-header or SASL negotiation failed
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    /// The transport failed during the open exchange
    #[error(transparent)]
    Transport(#[from] transport::Error),

    /// The peer answered the open exchange with something else
    #[error("Illegal connection state")]
    IllegalState,

    /// The peer closed the connection during the open exchange
    #[error("Remote peer closed the connection: {:?}", .error)]
    RemoteClosed {
        /// Error carried by the close performative, if any
        error: Option<definitions::Error>,
    },

    /// The configured connect timeout elapsed
    #[error("Connect timed out")]
    Timeout,
}

/// Error closing a connection.
#[derive(Debug, thiserror::Error)]
pub enum CloseError {
    /// The connection engine is no longer running
    #[error("Connection closed")]
    ConnectionClosed,

    /// The peer did not answer the close before the close timeout; the
    /// transport was torn down forcibly
    #[error("Close timed out; transport dropped")]
    Timeout,
}

/// Error removing a durable subscription.
#[derive(Debug, thiserror::Error)]
pub enum UnsubscribeError {
    /// The connection engine is no longer running
    #[error("Connection closed")]
    ConnectionClosed,

    /// The peer does not retain a subscription with that name
    #[error("Cannot remove a subscription that does not exist: {0:?}")]
    InvalidDestination(String),

    /// Another unsubscribe for the same name is in flight
    #[error("An unsubscribe for {0:?} is already in flight")]
    AlreadyInFlight(String),

    /// The peer refused the reattach with an error
    #[error("Unsubscribe refused: {:?}", .error)]
    Refused {
        /// Error carried by the peer's detach, if any
        error: Option<definitions::Error>,
    },
}

/// An asynchronous connection error without an owning request, delivered
/// to the registered exception listener.
#[derive(Debug, Clone)]
pub enum ConnectionException {
    /// The transport failed or disconnected
    Transport(String),

    /// No traffic was received within the idle-timeout window
    IdleTimeout,

    /// The peer closed the connection with an error
    RemoteClosed(Option<definitions::Error>),

    /// The peer ended a session with an error
    SessionFailed(Option<definitions::Error>),

    /// The peer detached a link with an error
    LinkFailed(Option<definitions::Error>),

    /// The peer violated the protocol
    ProtocolViolation(String),
}

impl std::fmt::Display for ConnectionException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport failure: {}", msg),
            Self::IdleTimeout => write!(f, "connection idle timeout"),
            Self::RemoteClosed(err) => write!(f, "connection closed by the peer: {:?}", err),
            Self::SessionFailed(err) => write!(f, "session ended by the peer: {:?}", err),
            Self::LinkFailed(err) => write!(f, "link detached by the peer: {:?}", err),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

/// Callback invoked on the engine task for asynchronous connection
/// errors.
pub type ExceptionListener = Arc<dyn Fn(&ConnectionException) + Send + Sync>;

/// Shared slot holding the registered exception listener; swapped
/// atomically from any thread.
pub(crate) type ExceptionListenerSlot = Arc<std::sync::Mutex<Option<ExceptionListener>>>;
