//! The sender link application handle.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::connection::SharedOpts;
use crate::control::{Command, LinkId, SessionId};
use crate::message::{codec, JmsMessage};
use crate::requests::AsyncRequest;

use super::{DeliveryFut, DetachError, SendError};

/// An attached sender link.
///
/// Transfers are emitted in `send`-call order. Dropping the handle closes
/// the link in the background; use [`close`](Self::close) to observe the
/// outcome.
#[derive(Debug)]
pub struct Sender {
    commands: mpsc::Sender<Command>,
    session: SessionId,
    link: LinkId,
    opts: Arc<SharedOpts>,
    detached: bool,
}

impl Sender {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        session: SessionId,
        link: LinkId,
        opts: Arc<SharedOpts>,
    ) -> Self {
        Self {
            commands,
            session,
            link,
            opts,
            detached: false,
        }
    }

    /// Sends a message.
    ///
    /// By default this waits for the peer's disposition (or, on a
    /// pre-settled link, for the transfer to be emitted). With
    /// `forceAsyncSend` configured the call returns as soon as the
    /// transfer is queued and failures surface through the exception
    /// listener; `forceSyncSend` wins when both are set.
    pub async fn send(&mut self, message: JmsMessage) -> Result<(), SendError> {
        let fut = self.send_async(message).await?;
        if self.opts.force_async_send && !self.opts.force_sync_send {
            drop(fut);
            return Ok(());
        }
        fut.await
    }

    /// Sends a message, returning a future that resolves on settlement.
    pub async fn send_async(&mut self, message: JmsMessage) -> Result<DeliveryFut, SendError> {
        let payload = codec::encode(&message)?;
        let (responder, rx) = AsyncRequest::new();
        self.commands
            .send(Command::Send {
                session: self.session,
                link: self.link,
                payload,
                settled: None,
                responder,
            })
            .await
            .map_err(|_| SendError::ConnectionClosed)?;
        Ok(DeliveryFut::new(rx))
    }

    /// Detaches the link without closing it at the peer.
    pub async fn detach(mut self) -> Result<(), DetachError> {
        self.detach_inner(false).await
    }

    /// Closes the link.
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

impl Drop for Sender {
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
