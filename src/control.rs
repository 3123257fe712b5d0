//! Commands posted by application handles onto the engine task.
//!
//! The command channel is the only path by which application threads
//! reach engine state; every command carries the completion handle its
//! caller awaits.

use fe2o3_amqp_types::definitions::{self, DeliveryNumber};

use crate::connection::{CloseError, UnsubscribeError};
use crate::link::endpoint::ReceiverAttached;
use crate::link::{
    DetachError, DispositionError, JmsDelivery, ReceiverAttachError, ReceiverOpts, RecvError,
    SendError, SenderAttachError, SenderOpts,
};
use crate::requests::AsyncRequest;
use crate::session::{AckMode, BeginError, EndError};
use crate::Payload;

pub(crate) type SessionId = usize;
pub(crate) type LinkId = usize;

/// Outcome requested for an acknowledged delivery.
#[derive(Debug, Clone, Copy)]
pub enum AckOutcome {
    /// Accept the delivery; it and all prior unacknowledged deliveries
    /// on the session are settled
    Accept,

    /// Release the delivery back to the peer
    Release,

    /// Reject the delivery
    Reject,

    /// Modify the delivery
    Modify {
        /// Count this attempt as failed (increments the delivery count)
        delivery_failed: bool,
        /// Ask the peer not to redeliver here
        undeliverable_here: bool,
    },
}

pub(crate) enum Command {
    Close {
        responder: AsyncRequest<(), CloseError>,
    },
    Begin {
        ack_mode: AckMode,
        responder: AsyncRequest<SessionId, BeginError>,
    },
    End {
        session: SessionId,
        responder: AsyncRequest<(), EndError>,
    },
    AttachSender {
        session: SessionId,
        opts: SenderOpts,
        responder: AsyncRequest<LinkId, SenderAttachError>,
    },
    AttachReceiver {
        session: SessionId,
        opts: ReceiverOpts,
        responder: AsyncRequest<ReceiverAttached, ReceiverAttachError>,
    },
    Detach {
        session: SessionId,
        link: LinkId,
        closed: bool,
        error: Option<definitions::Error>,
        responder: AsyncRequest<(), DetachError>,
    },
    Send {
        session: SessionId,
        link: LinkId,
        payload: Payload,
        settled: Option<bool>,
        responder: AsyncRequest<(), SendError>,
    },
    Receive {
        session: SessionId,
        link: LinkId,
        responder: AsyncRequest<JmsDelivery, RecvError>,
    },
    CancelReceive {
        session: SessionId,
        link: LinkId,
    },
    Acknowledge {
        session: SessionId,
        delivery_id: DeliveryNumber,
        outcome: AckOutcome,
        responder: AsyncRequest<(), DispositionError>,
    },
    Commit {
        session: SessionId,
        responder: AsyncRequest<(), DispositionError>,
    },
    Rollback {
        session: SessionId,
        responder: AsyncRequest<(), DispositionError>,
    },
    Unsubscribe {
        name: String,
        responder: AsyncRequest<(), UnsubscribeError>,
    },
}
