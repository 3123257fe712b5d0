/// Error converting between application messages and wire sections.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Message sections failed to encode
    #[error("Message encode error: {0}")]
    Encode(#[source] serde_amqp::Error),

    /// Message sections failed to decode
    #[error("Message decode error: {0}")]
    Decode(#[source] serde_amqp::Error),

    /// The wire body does not match the flavour announced by the
    /// annotations or content-type
    #[error("Body section does not match the {flavour} flavour")]
    UnexpectedBody {
        /// The flavour the message was resolved to
        flavour: &'static str,
    },

    /// A map body carried a non-string key
    #[error("Map message key is not a string")]
    NonStringMapKey,
}
