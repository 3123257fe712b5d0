//! Inbound deliveries and the future tracking an outbound one.

use std::future::Future;
use std::pin::Pin;
use std::task::Poll;

use fe2o3_amqp_types::definitions::DeliveryNumber;
use pin_project_lite::pin_project;
use tokio::sync::oneshot;

use crate::message::JmsMessage;

use super::SendError;

/// A message received on a [`Receiver`](crate::link::Receiver), together
/// with the identity needed to acknowledge it.
#[derive(Debug, Clone)]
pub struct JmsDelivery {
    /// The decoded message
    pub message: JmsMessage,

    pub(crate) delivery_id: DeliveryNumber,
    pub(crate) session: usize,
    /// Whether the peer sent the transfer pre-settled (no disposition is
    /// expected from us)
    pub(crate) settled: bool,
}

impl JmsDelivery {
    /// Session-scoped delivery id of this delivery.
    pub fn delivery_id(&self) -> DeliveryNumber {
        self.delivery_id
    }
}

pin_project! {
    /// Future resolving when the peer settles an outbound delivery (or
    /// immediately for pre-settled sends).
    #[derive(Debug)]
    pub struct DeliveryFut {
        #[pin]
        outcome: oneshot::Receiver<Result<(), SendError>>,
    }
}

impl DeliveryFut {
    pub(crate) fn new(outcome: oneshot::Receiver<Result<(), SendError>>) -> Self {
        Self { outcome }
    }
}

impl Future for DeliveryFut {
    type Output = Result<(), SendError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        self.project().outcome.poll(cx).map(|result| match result {
            Ok(outcome) => outcome,
            // The engine dropped the responder without completing it
            Err(_) => Err(SendError::ConnectionClosed),
        })
    }
}
