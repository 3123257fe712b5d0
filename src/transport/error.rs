use fe2o3_amqp_types::{primitives::Binary, sasl::SaslCode};

use crate::frames;

/// Error on the running transport.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error from the underlying stream
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// No frame was received within the idle timeout window
    #[error("Idle timeout")]
    IdleTimeoutElapsed,

    /// Frame failed to encode or decode
    #[error("Framing error")]
    FramingError,

    /// Peer sent a frame kind this client does not speak
    #[error("Not implemented")]
    NotImplemented,
}

impl From<frames::Error> for Error {
    fn from(err: frames::Error) -> Self {
        match err {
            frames::Error::Io(io) => Self::Io(io),
            frames::Error::NotImplemented => Self::NotImplemented,
            frames::Error::FramingError | frames::Error::DecodeError => Self::FramingError,
        }
    }
}

/// Error during protocol-header or SASL negotiation.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    /// IO error from the underlying stream
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The peer answered with a different protocol header
    #[error("Protocol header mismatch: {0:?}")]
    ProtocolHeaderMismatch([u8; 8]),

    /// The peer concluded SASL with a non-OK outcome
    #[error("SASL outcome code {:?}", .code)]
    SaslError {
        /// Outcome code sent by the peer
        code: SaslCode,
        /// Additional data carried by the outcome
        additional_data: Option<Binary>,
    },

    /// The profile could not answer the server (unsupported mechanism or
    /// an unexpected frame such as a challenge)
    #[error(transparent)]
    SaslProfile(#[from] crate::sasl_profile::Error),

    /// The peer closed the stream before negotiation finished
    #[error("Stream closed during negotiation")]
    StreamClosed,

    /// Frame failed to decode during negotiation
    #[error("Framing error")]
    FramingError,
}

impl From<frames::Error> for NegotiationError {
    fn from(err: frames::Error) -> Self {
        match err {
            frames::Error::Io(io) => Self::Io(io),
            _ => Self::FramingError,
        }
    }
}
