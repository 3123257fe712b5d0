//! Errors of the sender and receiver links.

use fe2o3_amqp_types::definitions;

use crate::message::CodecError;

/// Error attaching a sender link.
#[derive(Debug, thiserror::Error)]
pub enum SenderAttachError {
    /// The connection engine is no longer running
    #[error("Connection closed")]
    ConnectionClosed,

    /// The session is not in a state that can attach links
    #[error("Illegal session state")]
    IllegalState,

    /// The peer refused the attach: it answered with a null target and
    /// closed the link
    #[error("Attach refused by the peer: {:?}", .error)]
    Refused {
        /// Error carried by the closing detach, if any
        error: Option<definitions::Error>,
    },
}

/// Error attaching a receiver link.
#[derive(Debug, thiserror::Error)]
pub enum ReceiverAttachError {
    /// The connection engine is no longer running
    #[error("Connection closed")]
    ConnectionClosed,

    /// The session is not in a state that can attach links
    #[error("Illegal session state")]
    IllegalState,

    /// The named durable subscription is held by an active consumer
    #[error("Durable subscription {0:?} is already in use")]
    SubscriptionInUse(String),

    /// The peer refused the attach: it answered with a null source and
    /// closed the link
    #[error("Attach refused by the peer: {:?}", .error)]
    Refused {
        /// Error carried by the closing detach, if any
        error: Option<definitions::Error>,
    },
}

/// Error of a send.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The connection engine is no longer running
    #[error("Connection closed")]
    ConnectionClosed,

    /// The message failed to encode
    #[error(transparent)]
    MessageCodec(#[from] CodecError),

    /// The link or its session is not open
    #[error("Illegal link state")]
    IllegalState,

    /// The peer rejected the delivery
    #[error("Delivery rejected: {:?}", .error)]
    Rejected {
        /// Condition and description reported by the peer
        error: Option<definitions::Error>,
    },

    /// The peer released the delivery without consuming it
    #[error("Delivery released")]
    Released,

    /// The peer modified the delivery instead of accepting it
    #[error("Delivery modified (delivery_failed: {delivery_failed}, undeliverable_here: {undeliverable_here})")]
    Modified {
        /// The peer considered the delivery attempt failed
        delivery_failed: bool,
        /// The peer asked not to redeliver to this receiver
        undeliverable_here: bool,
    },

    /// The link detached while the delivery was pending
    #[error("Link detached: {:?}", .error)]
    Detached {
        /// Error carried by the detach, if any
        error: Option<definitions::Error>,
    },

    /// The disposition range from the peer overlapped deliveries this
    /// session does not track
    #[error("Invalid disposition range from the peer")]
    InvalidDispositionRange,
}

/// Error of a receive.
#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    /// The connection engine is no longer running
    #[error("Connection closed")]
    ConnectionClosed,

    /// The link or its session is not open
    #[error("Illegal link state")]
    IllegalState,

    /// A receive is already in progress on this link
    #[error("A receive is already outstanding on this receiver")]
    AlreadyReceiving,

    /// An inbound delivery failed to decode
    #[error(transparent)]
    MessageCodec(#[from] CodecError),

    /// The link detached while the receive was pending
    #[error("Link detached: {:?}", .error)]
    Detached {
        /// Error carried by the detach, if any
        error: Option<definitions::Error>,
    },
}

/// Error detaching a link.
#[derive(Debug, thiserror::Error)]
pub enum DetachError {
    /// The connection engine is no longer running
    #[error("Connection closed")]
    ConnectionClosed,

    /// The link is not attached
    #[error("Illegal link state")]
    IllegalState,

    /// The peer answered the detach with an error
    #[error("Detached by the peer with an error: {:?}", .error)]
    RemoteError {
        /// Error carried by the peer's detach
        error: Option<definitions::Error>,
    },
}

/// Error emitting an acknowledgement disposition.
#[derive(Debug, thiserror::Error)]
pub enum DispositionError {
    /// The connection engine is no longer running
    #[error("Connection closed")]
    ConnectionClosed,

    /// The session is not open or does not track the delivery
    #[error("Illegal session state")]
    IllegalState,
}
