//! The receiver link application handle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::connection::SharedOpts;
use crate::control::{AckOutcome, Command, LinkId, SessionId};
use crate::requests::AsyncRequest;
use crate::session::AckMode;

use super::{DetachError, DispositionError, JmsDelivery, RecvError};

/// An attached receiver link.
///
/// Deliveries are handed out in the order the peer transferred them,
/// except for the optional local priority ordering of the buffered
/// prefetch window. Dropping the handle closes the link in the
/// background; durable subscriptions survive [`detach`](Self::detach)
/// and are removed with
/// [`ConnectionHandle::unsubscribe`](crate::connection::ConnectionHandle::unsubscribe).
#[derive(Debug)]
pub struct Receiver {
    commands: mpsc::Sender<Command>,
    session: SessionId,
    link: LinkId,
    resumed: bool,
    ack_mode: AckMode,
    opts: Arc<SharedOpts>,
    detached: bool,
}

impl Receiver {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        session: SessionId,
        link: LinkId,
        resumed: bool,
        ack_mode: AckMode,
        opts: Arc<SharedOpts>,
    ) -> Self {
        Self {
            commands,
            session,
            link,
            resumed,
            ack_mode,
            opts,
            detached: false,
        }
    }

    /// For durable subscriptions: whether the peer retained the
    /// subscription state this receiver attached to.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// Waits for the next delivery.
    ///
    /// In auto-acknowledge and dups-ok sessions the delivery is
    /// acknowledged as part of being handed out; in client-acknowledge
    /// and transacted sessions it stays unacknowledged until
    /// [`accept`](Self::accept) or the transaction outcome.
    pub async fn recv(&mut self) -> Result<JmsDelivery, RecvError> {
        let (responder, rx) = AsyncRequest::new();
        self.commands
            .send(Command::Receive {
                session: self.session,
                link: self.link,
                responder,
            })
            .await
            .map_err(|_| RecvError::ConnectionClosed)?;
        rx.await.map_err(|_| RecvError::ConnectionClosed)?
    }

    /// Waits for the next delivery, giving up after `timeout`.
    ///
    /// Returns `Ok(None)` on timeout.
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<JmsDelivery>, RecvError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_elapsed) => {
                // A delivery fulfilled between the timeout and this
                // cancellation is put back into the buffer by the engine
                let _ = self.commands.try_send(Command::CancelReceive {
                    session: self.session,
                    link: self.link,
                });
                Ok(None)
            }
        }
    }

    /// Accepts a delivery.
    ///
    /// In client-acknowledge sessions this also accepts every prior
    /// unacknowledged delivery on the session.
    pub async fn accept(&mut self, delivery: &JmsDelivery) -> Result<(), DispositionError> {
        self.acknowledge(delivery, AckOutcome::Accept).await
    }

    /// Emits the given outcome for a delivery.
    pub async fn acknowledge(
        &mut self,
        delivery: &JmsDelivery,
        outcome: AckOutcome,
    ) -> Result<(), DispositionError> {
        let (responder, rx) = AsyncRequest::new();
        self.commands
            .send(Command::Acknowledge {
                session: delivery.session,
                delivery_id: delivery.delivery_id,
                outcome,
                responder,
            })
            .await
            .map_err(|_| DispositionError::ConnectionClosed)?;
        if self.opts.force_async_acks {
            // Fire-and-forget: failures surface through the exception
            // listener
            drop(rx);
            return Ok(());
        }
        rx.await.map_err(|_| DispositionError::ConnectionClosed)?
    }

    /// The acknowledgement policy of the owning session.
    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// Detaches without closing: a durable subscription stays at the
    /// peer.
    pub async fn detach(mut self) -> Result<(), DetachError> {
        self.detach_inner(false).await
    }

    /// Closes the link. A non-durable source is removed at the peer.
    pub async fn close(mut self) -> Result<(), DetachError> {
        self.detach_inner(true).await
    }

    async fn detach_inner(&mut self, closed: bool) -> Result<(), DetachError> {
        self.detached = true;
        let (responder, rx) = AsyncRequest::new();
        self.commands
            .send(Command::Detach {
                session: self.session,
                link: self.link,
                closed,
                error: None,
                responder,
            })
            .await
            .map_err(|_| DetachError::ConnectionClosed)?;
        rx.await.map_err(|_| DetachError::ConnectionClosed)?
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if !self.detached {
            let _ = self.commands.try_send(Command::Detach {
                session: self.session,
                link: self.link,
                closed: true,
                error: None,
                responder: AsyncRequest::noop(),
            });
        }
    }
}
