/// Error on encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error from the underlying stream
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The frame type byte identifies a frame kind this client does not
    /// speak
    #[error("Not implemented")]
    NotImplemented,

    /// Frame violates the framing rules (bad doff, truncated body)
    #[error("Framing error")]
    FramingError,

    /// Performative or section failed to encode or decode
    #[error("Decode error")]
    DecodeError,
}

impl From<serde_amqp::Error> for Error {
    fn from(err: serde_amqp::Error) -> Self {
        match err {
            serde_amqp::Error::Io(io) => Self::Io(io),
            _ => Self::DecodeError,
        }
    }
}
