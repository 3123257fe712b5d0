//! Sessions: acknowledgement scope and link container.
//!
//! A session owns a `begin`/`end` exchange with the peer, multiplexes its
//! links' transfers onto one channel, and applies the acknowledgement
//! policy chosen at creation.

use std::collections::{BTreeMap, VecDeque};

use fe2o3_amqp_types::definitions::{DeliveryNumber, TransferNumber};
use slab::Slab;
use tokio::sync::mpsc;

use crate::connection::SharedOpts;
use crate::control::{Command, LinkId, SessionId};
use crate::link::endpoint::LinkEndpoint;
use crate::link::{
    generated_link_name, Receiver, ReceiverAttachError, ReceiverOpts, SendError, Sender,
    SenderAttachError, SenderOpts,
};
use crate::requests::AsyncRequest;
use crate::resource::Lifecycle;

mod error;
pub use error::{BeginError, EndError};

pub(crate) const DEFAULT_WINDOW: u32 = 2048;

/// Acknowledgement policy of a session, chosen at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Deliveries are accepted and settled as they are handed to the
    /// application
    Auto,

    /// The application acknowledges explicitly; acknowledging a delivery
    /// acknowledges all prior unacknowledged deliveries on the session
    Client,

    /// Like [`Auto`](Self::Auto) but acknowledgements may be batched
    DupsOk,

    /// Acknowledgements are buffered until `commit`; `rollback` returns
    /// the deliveries to the peer
    Transacted,
}

/// Application handle of a session.
///
/// Dropping the handle ends the session in the background; use
/// [`end`](Self::end) to observe the outcome.
#[derive(Debug)]
pub struct SessionHandle {
    pub(crate) commands: mpsc::Sender<Command>,
    pub(crate) session: SessionId,
    pub(crate) ack_mode: AckMode,
    pub(crate) opts: std::sync::Arc<SharedOpts>,
    pub(crate) ended: bool,
}

impl SessionHandle {
    /// The acknowledgement policy this session runs.
    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// Attaches a sender link towards `opts.address`.
    pub async fn attach_sender(&mut self, opts: SenderOpts) -> Result<Sender, SenderAttachError> {
        let (responder, rx) = AsyncRequest::new();
        self.commands
            .send(Command::AttachSender {
                session: self.session,
                opts,
                responder,
            })
            .await
            .map_err(|_| SenderAttachError::ConnectionClosed)?;
        let link = rx
            .await
            .map_err(|_| SenderAttachError::ConnectionClosed)??;
        Ok(Sender::new(
            self.commands.clone(),
            self.session,
            link,
            self.opts.clone(),
        ))
    }

    /// Attaches a receiver link from `opts.address`.
    ///
    /// For durable subscriptions
    /// ([`ReceiverOpts::durable`]) the receiver resumes existing
    /// subscription state when the peer retained it.
    pub async fn attach_receiver(
        &mut self,
        opts: ReceiverOpts,
    ) -> Result<Receiver, ReceiverAttachError> {
        let (responder, rx) = AsyncRequest::new();
        self.commands
            .send(Command::AttachReceiver {
                session: self.session,
                opts,
                responder,
            })
            .await
            .map_err(|_| ReceiverAttachError::ConnectionClosed)?;
        let attached = rx
            .await
            .map_err(|_| ReceiverAttachError::ConnectionClosed)??;
        Ok(Receiver::new(
            self.commands.clone(),
            self.session,
            attached.link,
            attached.resumed,
            self.ack_mode,
            self.opts.clone(),
        ))
    }

    /// Flushes the buffered acknowledgements of a transacted session.
    pub async fn commit(&mut self) -> Result<(), crate::link::DispositionError> {
        let (responder, rx) = AsyncRequest::new();
        self.commands
            .send(Command::Commit {
                session: self.session,
                responder,
            })
            .await
            .map_err(|_| crate::link::DispositionError::ConnectionClosed)?;
        rx.await
            .map_err(|_| crate::link::DispositionError::ConnectionClosed)?
    }

    /// Returns the consumed-but-uncommitted deliveries of a transacted
    /// session to the peer.
    pub async fn rollback(&mut self) -> Result<(), crate::link::DispositionError> {
        let (responder, rx) = AsyncRequest::new();
        self.commands
            .send(Command::Rollback {
                session: self.session,
                responder,
            })
            .await
            .map_err(|_| crate::link::DispositionError::ConnectionClosed)?;
        rx.await
            .map_err(|_| crate::link::DispositionError::ConnectionClosed)?
    }

    /// Ends the session, closing its links first.
    pub async fn end(mut self) -> Result<(), EndError> {
        self.ended = true;
        let (responder, rx) = AsyncRequest::new();
        self.commands
            .send(Command::End {
                session: self.session,
                responder,
            })
            .await
            .map_err(|_| EndError::ConnectionClosed)?;
        rx.await.map_err(|_| EndError::ConnectionClosed)?
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if !self.ended {
            let _ = self.commands.try_send(Command::End {
                session: self.session,
                responder: AsyncRequest::noop(),
            });
        }
    }
}

/// A delivery handed to the application but not yet settled.
#[derive(Debug, Clone, Copy)]
pub(crate) struct UnackedDelivery {
    pub delivery_id: DeliveryNumber,
    /// delivery-count from the message header, consulted by the
    /// redelivery policy on rollback
    pub delivery_count: u32,
}

/// A tracked outbound delivery awaiting its disposition.
#[derive(Debug)]
pub(crate) struct PendingSend {
    pub link: LinkId,
    pub responder: AsyncRequest<(), SendError>,
}

/// Engine-side session state; owned and mutated only by the engine task.
#[derive(Debug)]
pub(crate) struct SessionInner {
    pub lifecycle: Lifecycle<SessionId, BeginError, EndError>,
    pub ack_mode: AckMode,
    pub outgoing_channel: u16,
    pub incoming_channel: Option<u16>,

    pub next_outgoing_id: TransferNumber,
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub next_incoming_id: TransferNumber,
    pub remote_incoming_window: u32,
    pub remote_outgoing_window: u32,

    pub links: Slab<LinkEndpoint>,
    /// Remote handle → local link
    pub input_handles: BTreeMap<u32, LinkId>,

    /// Source of outbound delivery tags, unique within the session
    pub tag_seq: u64,
    /// Outbound deliveries awaiting disposition, keyed by delivery-id
    pub in_flight: BTreeMap<DeliveryNumber, PendingSend>,
    /// Consumed deliveries not yet settled (client-ack, dups-ok
    /// batching, transacted buffering)
    pub unacked: VecDeque<UnackedDelivery>,

    /// The hidden session used for durable unsubscribes
    pub connection_session: bool,
}

impl SessionInner {
    pub fn new(ack_mode: AckMode, outgoing_channel: u16, connection_session: bool) -> Self {
        Self {
            lifecycle: Lifecycle::new(),
            ack_mode,
            outgoing_channel,
            incoming_channel: None,
            next_outgoing_id: 0,
            incoming_window: DEFAULT_WINDOW,
            outgoing_window: DEFAULT_WINDOW,
            next_incoming_id: 0,
            remote_incoming_window: 0,
            remote_outgoing_window: 0,
            links: Slab::new(),
            input_handles: BTreeMap::new(),
            tag_seq: 0,
            in_flight: BTreeMap::new(),
            unacked: VecDeque::new(),
            connection_session,
        }
    }

    /// Allocates the next outbound delivery id. Strictly monotonic
    /// within the session's begin/end epoch.
    pub fn next_delivery_id(&mut self) -> DeliveryNumber {
        let id = self.next_outgoing_id;
        self.next_outgoing_id = self.next_outgoing_id.wrapping_add(1);
        id
    }

    /// Allocates the next delivery tag.
    pub fn next_delivery_tag(&mut self) -> [u8; 8] {
        let tag = self.tag_seq.to_be_bytes();
        self.tag_seq += 1;
        tag
    }

    pub fn link_name_or_generated(&self, name: &Option<String>, role: &str) -> String {
        match name {
            Some(name) => name.clone(),
            None => generated_link_name(role),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AckMode, SessionInner};

    #[test]
    fn delivery_ids_are_strictly_monotonic() {
        let mut session = SessionInner::new(AckMode::Auto, 0, false);
        let ids: Vec<_> = (0..5).map(|_| session.next_delivery_id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn delivery_tags_are_unique() {
        let mut session = SessionInner::new(AckMode::Auto, 0, false);
        let first = session.next_delivery_tag();
        let second = session.next_delivery_tag();
        assert_ne!(first, second);
    }
}
