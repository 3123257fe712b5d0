//! The connection engine: one task owning every session and link.
//!
//! All protocol state is mutated here and only here. The event loop
//! multiplexes three sources: inbound frames from the transport,
//! commands from the application handles, and the heartbeat schedule.
//! Handlers are synchronous; the frames they produce are staged in an
//! outbox and flushed after each event, so no engine state is borrowed
//! across an await point.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use fe2o3_amqp_types::definitions::{
    self, AmqpError, DeliveryNumber, ErrorCondition, Handle, LinkError, ReceiverSettleMode, Role,
    SenderSettleMode,
};
use fe2o3_amqp_types::messaging::{
    Accepted, DeliveryState, Modified, Rejected, Released, Source, Target, TargetArchetype,
    TerminusDurability, TerminusExpiryPolicy,
};
use fe2o3_amqp_types::performatives::{
    Attach, Begin, Close, Detach, Disposition, End, Flow, Transfer,
};
use futures_util::{SinkExt, StreamExt};
use serde_bytes::ByteBuf;
use slab::Slab;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::control::{AckOutcome, Command, LinkId, SessionId};
use crate::frames::amqp::{Frame, FrameBody};
use crate::link::endpoint::{
    LinkEndpoint, QueuedSend, ReceiverAttached, ReceiverLink, SenderLink, UnsubscriberLink,
};
use crate::link::{
    DetachError, DispositionError, JmsDelivery, ReceiverAttachError, ReceiverOpts, RecvError,
    SendError, SenderAttachError, SenderOpts,
};
use crate::message::codec;
use crate::requests::AsyncRequest;
use crate::resource::{CloseDisposition, Lifecycle, RemoteClose};
use crate::session::{
    AckMode, BeginError, EndError, PendingSend, SessionInner, UnackedDelivery, DEFAULT_WINDOW,
};
use crate::transport::{self, Transport};
use crate::Payload;

use super::heartbeat::HeartBeat;
use super::{
    CloseError, ConnectionException, ExceptionListenerSlot, SharedOpts, UnsubscribeError,
};

/// How many dups-ok acknowledgements accumulate before a batched
/// disposition is flushed.
const DUPS_OK_BATCH: usize = 10;

#[derive(Debug)]
enum Running {
    Continue,
    Stop,
}

#[derive(Debug)]
enum EngineFailure {
    Transport(transport::Error),
    Disconnected,
    Protocol(String),
}

/// Session window counters snapshotted for flow emission.
#[derive(Debug, Clone, Copy)]
struct FlowNumbers {
    next_incoming_id: u32,
    incoming_window: u32,
    next_outgoing_id: u32,
    outgoing_window: u32,
}

fn flow_numbers(session: &SessionInner) -> FlowNumbers {
    FlowNumbers {
        next_incoming_id: session.next_incoming_id,
        incoming_window: session.incoming_window,
        next_outgoing_id: session.next_outgoing_id,
        outgoing_window: session.outgoing_window,
    }
}

pub(crate) struct ConnectionEngine<Io> {
    transport: Transport<Io>,
    commands: mpsc::Receiver<Command>,
    heartbeat: HeartBeat,
    listener: ExceptionListenerSlot,
    opts: Arc<SharedOpts>,

    lifecycle: Lifecycle<(), CloseError, CloseError>,
    channel_max: u16,
    sessions: Slab<SessionInner>,

    /// The hidden session owned by the connection for durable
    /// unsubscribes
    control_session: Option<SessionId>,
    /// Names with an unsubscribe in flight; shared with the request
    /// hooks that clear them on completion
    pending_unsubs: Arc<Mutex<HashSet<String>>>,
    /// Unsubscribes waiting for the control session to open
    queued_unsubs: Vec<(String, AsyncRequest<(), UnsubscribeError>)>,

    outbox: VecDeque<Frame>,
    commands_closed: bool,
    fatal_exception_fired: bool,
}

impl<Io> ConnectionEngine<Io>
where
    Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(
        transport: Transport<Io>,
        commands: mpsc::Receiver<Command>,
        heartbeat: HeartBeat,
        listener: ExceptionListenerSlot,
        opts: Arc<SharedOpts>,
        channel_max: u16,
    ) -> Self {
        // The open exchange already happened in the builder
        let mut lifecycle = Lifecycle::new();
        lifecycle.local_open(AsyncRequest::noop());
        if let Some(request) = lifecycle.on_remote_opened() {
            request.succeed(());
        }

        Self {
            transport,
            commands,
            heartbeat,
            listener,
            opts,
            lifecycle,
            channel_max,
            sessions: Slab::new(),
            control_session: None,
            pending_unsubs: Arc::new(Mutex::new(HashSet::new())),
            queued_unsubs: Vec::new(),
            outbox: VecDeque::new(),
            commands_closed: false,
            fatal_exception_fired: false,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.event_loop())
    }

    async fn event_loop(mut self) {
        debug!("connection engine started");
        loop {
            let result = tokio::select! {
                Some(()) = self.heartbeat.next() => self.on_heartbeat(),
                command = self.commands.recv(), if !self.commands_closed => match command {
                    Some(command) => self.on_command(command),
                    None => self.on_handles_dropped(),
                },
                frame = self.transport.next() => match frame {
                    Some(Ok(frame)) => self.on_incoming(frame),
                    Some(Err(err)) => Err(EngineFailure::Transport(err)),
                    None => Err(EngineFailure::Disconnected),
                },
            };

            let result = match result {
                Ok(running) => self.flush().await.map(|()| running),
                Err(failure) => Err(failure),
            };

            match result {
                Ok(Running::Continue) => {}
                Ok(Running::Stop) => {
                    let _ = self.flush().await;
                    break;
                }
                Err(failure) => {
                    self.fail_connection(failure);
                    break;
                }
            }
        }
        debug!("connection engine stopped");
    }

    async fn flush(&mut self) -> Result<(), EngineFailure> {
        while let Some(frame) = self.outbox.pop_front() {
            self.transport
                .send(frame)
                .await
                .map_err(EngineFailure::Transport)?;
        }
        Ok(())
    }

    /* ------------------------------ heartbeat ----------------------------- */

    fn on_heartbeat(&mut self) -> Result<Running, EngineFailure> {
        if self.lifecycle.state().is_terminal() {
            return Ok(Running::Stop);
        }
        trace!("emitting heartbeat frame");
        self.outbox.push_back(Frame::empty());
        Ok(Running::Continue)
    }

    /// Every application handle is gone: close the connection.
    fn on_handles_dropped(&mut self) -> Result<Running, EngineFailure> {
        self.commands_closed = true;
        self.on_command(Command::Close {
            responder: AsyncRequest::noop(),
        })
    }

    /* ------------------------------ commands ------------------------------ */

    fn on_command(&mut self, command: Command) -> Result<Running, EngineFailure> {
        match command {
            Command::Close { responder } => {
                if let CloseDisposition::Emit = self.lifecycle.local_close(responder) {
                    // Children are forcibly closed before the close
                    // performative goes out
                    self.fail_all_children(None);
                    self.outbox
                        .push_back(Frame::new(0, FrameBody::Close(Close { error: None })));
                }
            }
            Command::Begin {
                ack_mode,
                responder,
            } => {
                self.begin_session(ack_mode, false, responder);
            }
            Command::End { session, responder } => self.end_session(session, responder),
            Command::AttachSender {
                session,
                opts,
                responder,
            } => self.attach_sender(session, opts, responder),
            Command::AttachReceiver {
                session,
                opts,
                responder,
            } => self.attach_receiver(session, opts, responder),
            Command::Detach {
                session,
                link,
                closed,
                error,
                responder,
            } => self.detach_link(session, link, closed, error, responder),
            Command::Send {
                session,
                link,
                payload,
                settled,
                responder,
            } => self.send_on_link(session, link, payload, settled, responder),
            Command::Receive {
                session,
                link,
                responder,
            } => self.receive_on_link(session, link, responder),
            Command::CancelReceive { session, link } => {
                if let Some(LinkEndpoint::Receiver(receiver)) = self
                    .sessions
                    .get_mut(session)
                    .and_then(|s| s.links.get_mut(link))
                {
                    receiver.pending_receive = None;
                }
            }
            Command::Acknowledge {
                session,
                delivery_id,
                outcome,
                responder,
            } => self.acknowledge(session, delivery_id, outcome, responder),
            Command::Commit { session, responder } => self.commit(session, responder),
            Command::Rollback { session, responder } => self.rollback(session, responder),
            Command::Unsubscribe { name, responder } => self.unsubscribe(name, responder),
        }
        Ok(Running::Continue)
    }

    fn begin_session(
        &mut self,
        ack_mode: AckMode,
        connection_session: bool,
        responder: AsyncRequest<SessionId, BeginError>,
    ) -> Option<SessionId> {
        if !self.lifecycle.is_open() {
            responder.fail(BeginError::IllegalState);
            return None;
        }
        let entry = self.sessions.vacant_entry();
        let key = entry.key();
        if key > self.channel_max as usize {
            responder.fail(BeginError::ChannelMaxReached);
            return None;
        }
        let channel = key as u16;
        let mut session = SessionInner::new(ack_mode, channel, connection_session);
        session.lifecycle.local_open(responder);
        let begin = Begin {
            remote_channel: None,
            next_outgoing_id: session.next_outgoing_id,
            incoming_window: session.incoming_window,
            outgoing_window: session.outgoing_window,
            handle_max: Handle::default(),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        entry.insert(session);
        debug!(channel, "beginning session");
        self.outbox
            .push_back(Frame::new(channel, FrameBody::Begin(begin)));
        Some(key)
    }

    fn end_session(&mut self, session: SessionId, responder: AsyncRequest<(), EndError>) {
        let Some(inner) = self.sessions.get_mut(session) else {
            responder.fail(EndError::IllegalState);
            return;
        };
        fail_session_children(inner, None);
        if let CloseDisposition::Emit = inner.lifecycle.local_close(responder) {
            self.outbox.push_back(Frame::new(
                inner.outgoing_channel,
                FrameBody::End(End { error: None }),
            ));
        }
    }

    fn attach_sender(
        &mut self,
        session: SessionId,
        opts: SenderOpts,
        responder: AsyncRequest<LinkId, SenderAttachError>,
    ) {
        let Some(inner) = self.sessions.get_mut(session) else {
            responder.fail(SenderAttachError::IllegalState);
            return;
        };
        if !inner.lifecycle.is_open() {
            responder.fail(SenderAttachError::IllegalState);
            return;
        }
        let name = inner.link_name_or_generated(&opts.name, "sender");
        let address = opts.address.clone();
        let snd_settle_mode = match opts.presettled {
            true => SenderSettleMode::Settled,
            false => SenderSettleMode::Unsettled,
        };

        let entry = inner.links.vacant_entry();
        let link_id = entry.key();
        let mut link = SenderLink::new(name.clone(), opts);
        link.lifecycle.local_open(responder);
        entry.insert(LinkEndpoint::Sender(link));
        debug!(name = %name, address = %address, "attaching sender");

        let attach = Attach {
            name,
            handle: Handle(link_id as u32),
            role: Role::Sender,
            snd_settle_mode,
            rcv_settle_mode: ReceiverSettleMode::First,
            source: Some(Box::new(Source::builder().build())),
            target: Some(Box::new(TargetArchetype::Target(Target::builder().address(address).build()))),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: Some(0),
            max_message_size: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        self.outbox.push_back(Frame::new(
            inner.outgoing_channel,
            FrameBody::Attach(attach),
        ));
    }

    fn attach_receiver(
        &mut self,
        session: SessionId,
        opts: ReceiverOpts,
        responder: AsyncRequest<ReceiverAttached, ReceiverAttachError>,
    ) {
        let Some(inner) = self.sessions.get_mut(session) else {
            responder.fail(ReceiverAttachError::IllegalState);
            return;
        };
        if !inner.lifecycle.is_open() {
            responder.fail(ReceiverAttachError::IllegalState);
            return;
        }

        // A durable subscription is addressed by its name: that is the
        // identity the broker keys the subscription state on
        let name = match &opts.subscription {
            Some(subscription) => subscription.clone(),
            None => inner.link_name_or_generated(&opts.name, "receiver"),
        };
        let prefetch = opts.prefetch.unwrap_or(match opts.subscription {
            Some(_) => self.opts.prefetch.durable_topic_prefetch,
            None => self.opts.prefetch.queue_prefetch,
        });
        let source = match &opts.subscription {
            Some(_) => Source::builder()
                .address(opts.address.clone())
                .durable(TerminusDurability::UnsettledState)
                .expiry_policy(TerminusExpiryPolicy::Never)
                .build(),
            None => Source::builder().address(opts.address.clone()).build(),
        };

        let entry = inner.links.vacant_entry();
        let link_id = entry.key();
        let mut link = ReceiverLink::new(
            name.clone(),
            opts,
            prefetch,
            self.opts.local_message_priority,
        );
        link.lifecycle.local_open(responder);
        entry.insert(LinkEndpoint::Receiver(link));
        debug!(name = %name, prefetch, "attaching receiver");

        let attach = Attach {
            name,
            handle: Handle(link_id as u32),
            role: Role::Receiver,
            snd_settle_mode: SenderSettleMode::Unsettled,
            rcv_settle_mode: ReceiverSettleMode::First,
            source: Some(Box::new(source)),
            target: Some(Box::new(TargetArchetype::Target(Target::builder().build()))),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: None,
            max_message_size: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        self.outbox.push_back(Frame::new(
            inner.outgoing_channel,
            FrameBody::Attach(attach),
        ));
    }

    fn detach_link(
        &mut self,
        session: SessionId,
        link: LinkId,
        closed: bool,
        error: Option<definitions::Error>,
        responder: AsyncRequest<(), DetachError>,
    ) {
        let Some(inner) = self.sessions.get_mut(session) else {
            responder.fail(DetachError::IllegalState);
            return;
        };
        let channel = inner.outgoing_channel;
        let disposition = match inner.links.get_mut(link) {
            Some(LinkEndpoint::Sender(sender)) => sender.lifecycle.local_close(responder),
            Some(LinkEndpoint::Receiver(receiver)) => receiver.lifecycle.local_close(responder),
            _ => {
                responder.fail(DetachError::IllegalState);
                return;
            }
        };
        if let CloseDisposition::Emit = disposition {
            self.outbox.push_back(Frame::new(
                channel,
                FrameBody::Detach(Detach {
                    handle: Handle(link as u32),
                    closed,
                    error,
                }),
            ));
        }
    }

    fn send_on_link(
        &mut self,
        session: SessionId,
        link: LinkId,
        payload: Payload,
        settled: Option<bool>,
        responder: AsyncRequest<(), SendError>,
    ) {
        let Some(inner) = self.sessions.get_mut(session) else {
            responder.fail(SendError::IllegalState);
            return;
        };
        if !inner.lifecycle.is_open() {
            responder.fail(SendError::IllegalState);
            return;
        }
        let settled = {
            let Some(LinkEndpoint::Sender(sender)) = inner.links.get_mut(link) else {
                responder.fail(SendError::IllegalState);
                return;
            };
            if !sender.lifecycle.is_open() {
                responder.fail(SendError::IllegalState);
                return;
            }
            let settled = settled.unwrap_or(sender.opts.presettled);
            if sender.link_credit == 0 {
                // Credit starvation is a normal state: the send parks
                // until the peer grants more
                trace!(link, "sender out of credit, parking send");
                sender.queued.push_back(QueuedSend {
                    payload,
                    settled,
                    responder,
                });
                return;
            }
            settled
        };
        emit_transfer(&mut self.outbox, inner, link, payload, settled, responder);
    }

    fn receive_on_link(
        &mut self,
        session: SessionId,
        link: LinkId,
        responder: AsyncRequest<JmsDelivery, RecvError>,
    ) {
        let Some(inner) = self.sessions.get_mut(session) else {
            responder.fail(RecvError::IllegalState);
            return;
        };
        let numbers = flow_numbers(inner);
        let channel = inner.outgoing_channel;
        let ack_mode = inner.ack_mode;
        let SessionInner { links, unacked, .. } = inner;
        let Some(LinkEndpoint::Receiver(receiver)) = links.get_mut(link) else {
            responder.fail(RecvError::IllegalState);
            return;
        };
        if !receiver.lifecycle.is_open() {
            responder.fail(RecvError::IllegalState);
            return;
        }
        if receiver.pending_receive.is_some() {
            responder.fail(RecvError::AlreadyReceiving);
            return;
        }
        match receiver.pop() {
            Some(delivery) => dispatch_delivery(
                &mut self.outbox,
                channel,
                ack_mode,
                unacked,
                numbers,
                link,
                receiver,
                delivery,
                responder,
            ),
            None => receiver.pending_receive = Some(responder),
        }
    }

    fn acknowledge(
        &mut self,
        session: SessionId,
        delivery_id: DeliveryNumber,
        outcome: AckOutcome,
        responder: AsyncRequest<(), DispositionError>,
    ) {
        let Some(inner) = self.sessions.get_mut(session) else {
            responder.fail(DispositionError::IllegalState);
            return;
        };
        let channel = inner.outgoing_channel;
        match outcome {
            AckOutcome::Accept => {
                // Accepting acknowledges this delivery and every prior
                // unacknowledged one on the session
                let mut acknowledged = Vec::new();
                inner.unacked.retain(|entry| {
                    let covered = entry.delivery_id <= delivery_id;
                    if covered {
                        acknowledged.push(entry.delivery_id);
                    }
                    !covered
                });
                emit_settled_outcome(&mut self.outbox, channel, &acknowledged, accepted());
            }
            AckOutcome::Release => {
                inner
                    .unacked
                    .retain(|entry| entry.delivery_id != delivery_id);
                emit_settled_outcome(
                    &mut self.outbox,
                    channel,
                    &[delivery_id],
                    DeliveryState::Released(Released {}),
                );
            }
            AckOutcome::Reject => {
                inner
                    .unacked
                    .retain(|entry| entry.delivery_id != delivery_id);
                emit_settled_outcome(
                    &mut self.outbox,
                    channel,
                    &[delivery_id],
                    DeliveryState::Rejected(Rejected { error: None }),
                );
            }
            AckOutcome::Modify {
                delivery_failed,
                undeliverable_here,
            } => {
                inner
                    .unacked
                    .retain(|entry| entry.delivery_id != delivery_id);
                emit_settled_outcome(
                    &mut self.outbox,
                    channel,
                    &[delivery_id],
                    DeliveryState::Modified(Modified {
                        delivery_failed: Some(delivery_failed),
                        undeliverable_here: Some(undeliverable_here),
                        message_annotations: None,
                    }),
                );
            }
        }
        responder.succeed(());
    }

    fn commit(&mut self, session: SessionId, responder: AsyncRequest<(), DispositionError>) {
        let Some(inner) = self.sessions.get_mut(session) else {
            responder.fail(DispositionError::IllegalState);
            return;
        };
        let channel = inner.outgoing_channel;
        let ids: Vec<_> = inner.unacked.drain(..).map(|e| e.delivery_id).collect();
        emit_settled_outcome(&mut self.outbox, channel, &ids, accepted());
        responder.succeed(());
    }

    fn rollback(&mut self, session: SessionId, responder: AsyncRequest<(), DispositionError>) {
        let Some(inner) = self.sessions.get_mut(session) else {
            responder.fail(DispositionError::IllegalState);
            return;
        };
        let channel = inner.outgoing_channel;
        let max_redeliveries = self.opts.redelivery.max_redeliveries;
        let entries: Vec<_> = inner.unacked.drain(..).collect();
        for entry in entries {
            let exhausted =
                max_redeliveries >= 0 && i64::from(entry.delivery_count) >= max_redeliveries as i64;
            let state = match exhausted {
                // Past the redelivery limit the delivery is poisoned
                // rather than put back into rotation
                true => DeliveryState::Rejected(Rejected { error: None }),
                false => DeliveryState::Modified(Modified {
                    delivery_failed: Some(true),
                    undeliverable_here: Some(false),
                    message_annotations: None,
                }),
            };
            emit_settled_outcome(&mut self.outbox, channel, &[entry.delivery_id], state);
        }
        responder.succeed(());
    }

    fn unsubscribe(&mut self, name: String, responder: AsyncRequest<(), UnsubscribeError>) {
        {
            let mut pending = lock_unpoisoned(&self.pending_unsubs);
            if !pending.insert(name.clone()) {
                drop(pending);
                responder.fail(UnsubscribeError::AlreadyInFlight(name));
                return;
            }
        }
        // Completion through any path clears the in-flight marker
        let pending = self.pending_unsubs.clone();
        let marker = name.clone();
        let responder = responder.wrap(move || {
            lock_unpoisoned(&pending).remove(&marker);
        });

        let control = self
            .control_session
            .and_then(|id| self.sessions.get(id).map(|s| (id, s.lifecycle.is_open())));
        match control {
            Some((session, true)) => self.attach_unsubscriber(session, name, responder),
            Some((_, false)) => self.queued_unsubs.push((name, responder)),
            None => {
                // First unsubscribe on this connection: begin the hidden
                // connection session and queue behind its begin
                self.queued_unsubs.push((name, responder));
                self.control_session =
                    self.begin_session(AckMode::Auto, true, AsyncRequest::noop());
                if self.control_session.is_none() {
                    for (name, responder) in self.queued_unsubs.drain(..) {
                        debug!(subscription = %name, "connection session could not be begun");
                        responder.fail(UnsubscribeError::ConnectionClosed);
                    }
                }
            }
        }
    }

    fn attach_unsubscriber(
        &mut self,
        session: SessionId,
        name: String,
        responder: AsyncRequest<(), UnsubscribeError>,
    ) {
        let Some(inner) = self.sessions.get_mut(session) else {
            responder.fail(UnsubscribeError::ConnectionClosed);
            return;
        };
        debug!(subscription = %name, "attempting removal of durable subscription");
        let entry = inner.links.vacant_entry();
        let link_id = entry.key();
        entry.insert(LinkEndpoint::Unsubscriber(UnsubscriberLink {
            subscription: name.clone(),
            input_handle: None,
            found: false,
            responder: Some(responder),
        }));

        // Attaching with a null source asks the peer to recover the
        // subscription's link terminus; the answer tells whether it
        // exists
        let attach = Attach {
            name,
            handle: Handle(link_id as u32),
            role: Role::Receiver,
            snd_settle_mode: SenderSettleMode::Unsettled,
            rcv_settle_mode: ReceiverSettleMode::First,
            source: None,
            target: Some(Box::new(TargetArchetype::Target(Target::builder().build()))),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: None,
            max_message_size: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        self.outbox.push_back(Frame::new(
            inner.outgoing_channel,
            FrameBody::Attach(attach),
        ));
    }

    /* ------------------------------ incoming ------------------------------ */

    fn on_incoming(&mut self, frame: Frame) -> Result<Running, EngineFailure> {
        let Frame { channel, body } = frame;
        match body {
            FrameBody::Open(_) => Err(EngineFailure::Protocol(
                "open after the connection was established".to_string(),
            )),
            FrameBody::Begin(begin) => self.on_begin(channel, begin),
            FrameBody::Attach(attach) => self.on_attach(channel, attach),
            FrameBody::Flow(flow) => self.on_flow(channel, flow),
            FrameBody::Transfer {
                performative,
                payload,
            } => self.on_transfer(channel, performative, payload),
            FrameBody::Disposition(disposition) => self.on_disposition(channel, disposition),
            FrameBody::Detach(detach) => self.on_detach(channel, detach),
            FrameBody::End(end) => self.on_end(channel, end),
            FrameBody::Close(close) => self.on_close(close),
            FrameBody::Empty => Ok(Running::Continue),
        }
    }

    fn on_begin(&mut self, channel: u16, begin: Begin) -> Result<Running, EngineFailure> {
        let Some(outgoing_channel) = begin.remote_channel else {
            return Err(EngineFailure::Protocol(
                "peer-initiated session begin".to_string(),
            ));
        };
        let id = outgoing_channel as usize;
        let Some(session) = self.sessions.get_mut(id) else {
            return Err(EngineFailure::Protocol(format!(
                "begin answering unknown channel {}",
                outgoing_channel
            )));
        };
        session.incoming_channel = Some(channel);
        session.next_incoming_id = begin.next_outgoing_id;
        session.remote_incoming_window = begin.incoming_window;
        session.remote_outgoing_window = begin.outgoing_window;
        let connection_session = session.connection_session;
        if let Some(request) = session.lifecycle.on_remote_opened() {
            request.succeed(id);
        }
        debug!(channel, "session mapped");

        if connection_session {
            let queued = std::mem::take(&mut self.queued_unsubs);
            for (name, responder) in queued {
                self.attach_unsubscriber(id, name, responder);
            }
        }
        Ok(Running::Continue)
    }

    fn on_attach(&mut self, channel: u16, attach: Attach) -> Result<Running, EngineFailure> {
        let outbox = &mut self.outbox;
        let Some((_, session)) = find_session_mut(&mut self.sessions, channel) else {
            return Err(EngineFailure::Protocol(format!(
                "attach on unmapped channel {}",
                channel
            )));
        };
        let numbers = flow_numbers(session);
        let outgoing_channel = session.outgoing_channel;
        let SessionInner {
            links,
            input_handles,
            ..
        } = session;

        let link_id = links
            .iter()
            .find(|(_, link)| link.name() == attach.name && link.input_handle().is_none())
            .map(|(id, _)| id);
        let Some(link_id) = link_id else {
            return Err(EngineFailure::Protocol(format!(
                "attach answering unknown link {:?}",
                attach.name
            )));
        };
        let endpoint = &mut links[link_id];
        endpoint.set_input_handle(attach.handle.0);
        input_handles.insert(attach.handle.0, link_id);

        match endpoint {
            LinkEndpoint::Sender(sender) => match attach.target.is_some() {
                true => {
                    if let Some(request) = sender.lifecycle.on_remote_opened() {
                        request.succeed(link_id);
                    }
                    trace!(name = %sender.name, "sender attached");
                }
                false => {
                    // No terminus was created: the peer detaches next
                    // and the attach fails there
                    sender.lifecycle.expect_remote_close();
                }
            },
            LinkEndpoint::Receiver(receiver) => {
                let durable = receiver.opts.subscription.is_some();
                match (attach.source.is_some(), durable) {
                    (source_present @ true, _) | (source_present @ false, true) => {
                        // A null source answering a durable attach means
                        // the peer did not retain the subscription; the
                        // attach stands as a fresh subscription
                        receiver.resumed = source_present && durable;
                        if let Some(request) = receiver.lifecycle.on_remote_opened() {
                            request.succeed(ReceiverAttached {
                                link: link_id,
                                resumed: receiver.resumed,
                            });
                        }
                        // Grant the prefetch budget
                        receiver.credit = receiver.prefetch;
                        trace!(name = %receiver.name, credit = receiver.credit, "receiver attached");
                        push_link_flow(
                            outbox,
                            outgoing_channel,
                            numbers,
                            link_id as u32,
                            receiver.delivery_count,
                            receiver.credit,
                        );
                    }
                    (false, false) => {
                        receiver.lifecycle.expect_remote_close();
                    }
                }
            }
            LinkEndpoint::Unsubscriber(unsub) => {
                unsub.found = attach.source.is_some();
                trace!(
                    subscription = %unsub.subscription,
                    found = unsub.found,
                    "unsubscribe reattach answered"
                );
                // Detach with closed set deletes the recovered terminus;
                // when nothing was recovered it merely tears the link
                // down
                outbox.push_back(Frame::new(
                    outgoing_channel,
                    FrameBody::Detach(Detach {
                        handle: Handle(link_id as u32),
                        closed: true,
                        error: None,
                    }),
                ));
            }
        }
        Ok(Running::Continue)
    }

    fn on_flow(&mut self, channel: u16, flow: Flow) -> Result<Running, EngineFailure> {
        let outbox = &mut self.outbox;
        let Some((_, session)) = find_session_mut(&mut self.sessions, channel) else {
            return Err(EngineFailure::Protocol(format!(
                "flow on unmapped channel {}",
                channel
            )));
        };
        session.remote_incoming_window = flow.incoming_window;
        session.remote_outgoing_window = flow.outgoing_window;

        let Some(handle) = flow.handle else {
            return Ok(Running::Continue);
        };
        let Some(&link_id) = session.input_handles.get(&handle.0) else {
            return Err(EngineFailure::Protocol(format!(
                "flow for unattached handle {}",
                handle.0
            )));
        };

        let is_sender = {
            let numbers = flow_numbers(session);
            let outgoing_channel = session.outgoing_channel;
            match session.links.get_mut(link_id) {
                Some(LinkEndpoint::Sender(sender)) => {
                    // link-credit_snd := delivery-count_rcv
                    //                    + link-credit_rcv
                    //                    - delivery-count_snd
                    let delivery_count_rcv = flow.delivery_count.unwrap_or(0);
                    if let Some(link_credit_rcv) = flow.link_credit {
                        sender.link_credit = delivery_count_rcv
                            .wrapping_add(link_credit_rcv)
                            .wrapping_sub(sender.delivery_count);
                    }
                    trace!(
                        link = link_id,
                        credit = sender.link_credit,
                        "sender credit updated"
                    );
                    if flow.drain {
                        // Drain consumes all remaining credit and
                        // reports the advanced delivery-count back
                        sender.delivery_count =
                            sender.delivery_count.wrapping_add(sender.link_credit);
                        sender.link_credit = 0;
                        push_link_flow(
                            outbox,
                            outgoing_channel,
                            numbers,
                            link_id as u32,
                            sender.delivery_count,
                            0,
                        );
                    } else if flow.echo {
                        push_link_flow(
                            outbox,
                            outgoing_channel,
                            numbers,
                            link_id as u32,
                            sender.delivery_count,
                            sender.link_credit,
                        );
                    }
                    true
                }
                Some(LinkEndpoint::Receiver(receiver)) => {
                    if let Some(delivery_count) = flow.delivery_count {
                        receiver.delivery_count = delivery_count;
                    }
                    if flow.echo {
                        push_link_flow(
                            outbox,
                            outgoing_channel,
                            numbers,
                            link_id as u32,
                            receiver.delivery_count,
                            receiver.credit,
                        );
                    }
                    false
                }
                _ => false,
            }
        };
        if is_sender {
            drain_queued_sends(outbox, session, link_id);
        }
        Ok(Running::Continue)
    }

    fn on_transfer(
        &mut self,
        channel: u16,
        transfer: Transfer,
        payload: Payload,
    ) -> Result<Running, EngineFailure> {
        let outbox = &mut self.outbox;
        let Some((session_id, session)) = find_session_mut(&mut self.sessions, channel) else {
            return Err(EngineFailure::Protocol(format!(
                "transfer on unmapped channel {}",
                channel
            )));
        };
        session.next_incoming_id = session.next_incoming_id.wrapping_add(1);
        session.incoming_window = session.incoming_window.saturating_sub(1);

        // Replenish the session window lazily, like link credit
        if session.incoming_window < DEFAULT_WINDOW / 2 {
            session.incoming_window = DEFAULT_WINDOW;
            let flow = Flow {
                next_incoming_id: Some(session.next_incoming_id),
                incoming_window: session.incoming_window,
                next_outgoing_id: session.next_outgoing_id,
                outgoing_window: session.outgoing_window,
                handle: None,
                delivery_count: None,
                link_credit: None,
                available: None,
                drain: false,
                echo: false,
                properties: None,
            };
            outbox.push_back(Frame::new(session.outgoing_channel, FrameBody::Flow(flow)));
        }

        let Some(&link_id) = session.input_handles.get(&transfer.handle.0) else {
            return Err(EngineFailure::Protocol(format!(
                "transfer for unattached handle {}",
                transfer.handle.0
            )));
        };

        let numbers = flow_numbers(session);
        let outgoing_channel = session.outgoing_channel;
        let ack_mode = session.ack_mode;
        let SessionInner { links, unacked, .. } = session;
        let Some(LinkEndpoint::Receiver(receiver)) = links.get_mut(link_id) else {
            return Err(EngineFailure::Protocol(
                "transfer addressed to a non-receiver link".to_string(),
            ));
        };

        // Multi-frame deliveries are reassembled before decoding
        if transfer.aborted {
            receiver.partial = None;
            return Ok(Running::Continue);
        }
        let (first_transfer, payload) = match receiver.partial.take() {
            Some((first, mut buffer)) => {
                buffer.extend_from_slice(&payload);
                match transfer.more {
                    true => {
                        receiver.partial = Some((first, buffer));
                        return Ok(Running::Continue);
                    }
                    false => (first, buffer.freeze()),
                }
            }
            None => match transfer.more {
                true => {
                    receiver.partial = Some((transfer, payload.as_ref().into()));
                    return Ok(Running::Continue);
                }
                false => (transfer, payload),
            },
        };

        receiver.credit = receiver.credit.saturating_sub(1);
        receiver.delivery_count = receiver.delivery_count.wrapping_add(1);
        let delivery_id = first_transfer.delivery_id.unwrap_or_default();
        let settled = first_transfer.settled.unwrap_or(false);

        let message = match codec::decode(&payload) {
            Ok(message) => message,
            Err(err) => {
                error!(?err, "inbound delivery failed to decode");
                if let Some(responder) = receiver.pending_receive.take() {
                    responder.fail(RecvError::MessageCodec(err));
                }
                // The delivery cannot be dispatched; hand it back
                if !settled {
                    emit_settled_outcome(
                        outbox,
                        outgoing_channel,
                        &[delivery_id],
                        DeliveryState::Released(Released {}),
                    );
                }
                return Ok(Running::Continue);
            }
        };

        let delivery = JmsDelivery {
            message,
            delivery_id,
            session: session_id,
            settled,
        };

        match receiver.pending_receive.take() {
            Some(responder) => dispatch_delivery(
                outbox,
                outgoing_channel,
                ack_mode,
                unacked,
                numbers,
                link_id,
                receiver,
                delivery,
                responder,
            ),
            None => receiver.buffer(delivery),
        }
        Ok(Running::Continue)
    }

    fn on_disposition(
        &mut self,
        channel: u16,
        disposition: Disposition,
    ) -> Result<Running, EngineFailure> {
        // Dispositions from the peer acting as a sender merely echo our
        // own settlement
        if !matches!(disposition.role, Role::Receiver) {
            return Ok(Running::Continue);
        }
        let outbox = &mut self.outbox;
        let Some((_, session)) = find_session_mut(&mut self.sessions, channel) else {
            return Err(EngineFailure::Protocol(format!(
                "disposition on unmapped channel {}",
                channel
            )));
        };

        let first = disposition.first;
        let last = disposition.last.unwrap_or(first);
        if last < first {
            return Err(EngineFailure::Protocol(
                "disposition range with last < first".to_string(),
            ));
        }

        let present: Vec<DeliveryNumber> =
            session.in_flight.range(first..=last).map(|(id, _)| *id).collect();
        let range_len = u64::from(last - first) + 1;

        if present.is_empty() {
            // A re-delivered disposition for already-settled ids
            return Ok(Running::Continue);
        }
        if (present.len() as u64) < range_len {
            // Ranges are settled in full; a partial overlap with the
            // in-flight map fails closed
            fail_session_protocol_violation(outbox, session);
            notify_listener(
                &self.listener,
                &ConnectionException::ProtocolViolation(format!(
                    "disposition range {}..={} overlaps untracked deliveries",
                    first, last
                )),
            );
            return Ok(Running::Continue);
        }

        for id in &present {
            let Some(pending) = session.in_flight.remove(id) else {
                continue;
            };
            match &disposition.state {
                Some(DeliveryState::Received(_)) => {
                    // Not a terminal outcome; keep tracking
                    session.in_flight.insert(*id, pending);
                }
                Some(DeliveryState::Rejected(rejected)) => pending.responder.report(
                    Err(SendError::Rejected {
                        error: rejected.error.clone(),
                    }),
                    &self.listener,
                ),
                Some(DeliveryState::Released(_)) => pending
                    .responder
                    .report(Err(SendError::Released), &self.listener),
                Some(DeliveryState::Modified(modified)) => pending.responder.report(
                    Err(SendError::Modified {
                        delivery_failed: modified.delivery_failed.unwrap_or(false),
                        undeliverable_here: modified.undeliverable_here.unwrap_or(false),
                    }),
                    &self.listener,
                ),
                // accepted, or settled with no explicit outcome
                Some(DeliveryState::Accepted(_)) | None => pending.responder.succeed(()),
            }
        }

        // The peer expects us to settle second
        if !disposition.settled {
            outbox.push_back(Frame::new(
                session.outgoing_channel,
                FrameBody::Disposition(Disposition {
                    role: Role::Sender,
                    first,
                    last: disposition.last,
                    settled: true,
                    state: disposition.state.clone(),
                    batchable: false,
                }),
            ));
        }
        Ok(Running::Continue)
    }

    fn on_detach(&mut self, channel: u16, detach: Detach) -> Result<Running, EngineFailure> {
        let outbox = &mut self.outbox;
        let Some((_, session)) = find_session_mut(&mut self.sessions, channel) else {
            return Err(EngineFailure::Protocol(format!(
                "detach on unmapped channel {}",
                channel
            )));
        };
        let outgoing_channel = session.outgoing_channel;
        let Some(link_id) = session.input_handles.remove(&detach.handle.0) else {
            return Err(EngineFailure::Protocol(format!(
                "detach for unattached handle {}",
                detach.handle.0
            )));
        };
        let Some(endpoint) = session.links.try_remove(link_id) else {
            return Err(EngineFailure::Protocol(
                "detach for an unknown link".to_string(),
            ));
        };

        match endpoint {
            LinkEndpoint::Unsubscriber(mut unsub) => {
                if let Some(responder) = unsub.responder.take() {
                    match (&detach.error, unsub.found) {
                        (Some(error), _) => responder.fail(UnsubscribeError::Refused {
                            error: Some(error.clone()),
                        }),
                        (None, true) => responder.succeed(()),
                        (None, false) => responder
                            .fail(UnsubscribeError::InvalidDestination(unsub.subscription)),
                    }
                }
            }
            LinkEndpoint::Sender(mut sender) => {
                match sender.lifecycle.on_remote_closed() {
                    RemoteClose::Answered { pending_closes } => {
                        complete_detaches(pending_closes, &detach.error);
                    }
                    RemoteClose::Initiated { pending_open, .. } => {
                        if let Some(open) = pending_open {
                            open.fail(SenderAttachError::Refused {
                                error: detach.error.clone(),
                            });
                        } else if detach.error.is_some() {
                            notify_listener(
                                &self.listener,
                                &ConnectionException::LinkFailed(detach.error.clone()),
                            );
                        }
                        outbox.push_back(Frame::new(
                            outgoing_channel,
                            FrameBody::Detach(Detach {
                                handle: Handle(link_id as u32),
                                closed: true,
                                error: None,
                            }),
                        ));
                        sender.lifecycle.local_close_echoed();
                    }
                }
                // A pending send fails when its link closes
                for queued in sender.queued.drain(..) {
                    queued.responder.report(
                        Err(SendError::Detached {
                            error: detach.error.clone(),
                        }),
                        &self.listener,
                    );
                }
                fail_in_flight_for_link(session, link_id, &detach.error, &self.listener);
            }
            LinkEndpoint::Receiver(mut receiver) => {
                match receiver.lifecycle.on_remote_closed() {
                    RemoteClose::Answered { pending_closes } => {
                        complete_detaches(pending_closes, &detach.error);
                    }
                    RemoteClose::Initiated { pending_open, .. } => {
                        if let Some(open) = pending_open {
                            open.fail(receiver_attach_error(&receiver, &detach.error));
                        } else if detach.error.is_some() {
                            notify_listener(
                                &self.listener,
                                &ConnectionException::LinkFailed(detach.error.clone()),
                            );
                        }
                        outbox.push_back(Frame::new(
                            outgoing_channel,
                            FrameBody::Detach(Detach {
                                handle: Handle(link_id as u32),
                                closed: true,
                                error: None,
                            }),
                        ));
                        receiver.lifecycle.local_close_echoed();
                    }
                }
                if let Some(pending) = receiver.pending_receive.take() {
                    pending.fail(RecvError::Detached {
                        error: detach.error.clone(),
                    });
                }
            }
        }
        Ok(Running::Continue)
    }

    fn on_end(&mut self, channel: u16, end: End) -> Result<Running, EngineFailure> {
        let id = self
            .sessions
            .iter()
            .find(|(_, session)| session.incoming_channel == Some(channel))
            .map(|(id, _)| id);
        let Some(id) = id else {
            return Err(EngineFailure::Protocol(format!(
                "end on unmapped channel {}",
                channel
            )));
        };
        let Some(mut session) = self.sessions.try_remove(id) else {
            return Err(EngineFailure::Protocol("end for unknown session".to_string()));
        };
        if self.control_session == Some(id) {
            self.control_session = None;
            for (name, responder) in self.queued_unsubs.drain(..) {
                debug!(subscription = %name, "connection session ended during unsubscribe");
                responder.fail(UnsubscribeError::Refused {
                    error: end.error.clone(),
                });
            }
        }

        match session.lifecycle.on_remote_closed() {
            RemoteClose::Answered { pending_closes } => {
                for request in pending_closes {
                    request.succeed(());
                }
            }
            RemoteClose::Initiated { pending_open, .. } => {
                if let Some(open) = pending_open {
                    open.fail(BeginError::RemoteEnded {
                        error: end.error.clone(),
                    });
                }
                fail_session_children(&mut session, end.error.as_ref());
                self.outbox.push_back(Frame::new(
                    session.outgoing_channel,
                    FrameBody::End(End { error: None }),
                ));
                session.lifecycle.local_close_echoed();
                if end.error.is_some() {
                    self.fire_exception(&ConnectionException::SessionFailed(end.error));
                }
            }
        }
        Ok(Running::Continue)
    }

    fn on_close(&mut self, close: Close) -> Result<Running, EngineFailure> {
        match self.lifecycle.on_remote_closed() {
            RemoteClose::Answered { pending_closes } => {
                for request in pending_closes {
                    request.succeed(());
                }
            }
            RemoteClose::Initiated { .. } => {
                debug!(error = ?close.error, "connection closed by the peer");
                self.fail_all_children(close.error.as_ref());
                self.fire_fatal_exception(&ConnectionException::RemoteClosed(close.error));
                self.outbox
                    .push_back(Frame::new(0, FrameBody::Close(Close { error: None })));
                self.lifecycle.local_close_echoed();
            }
        }
        Ok(Running::Stop)
    }

    /* ------------------------------- teardown ----------------------------- */

    /// Forcibly closes every session and link, failing all of their
    /// pending requests.
    fn fail_all_children(&mut self, error: Option<&definitions::Error>) {
        self.control_session = None;
        for (_, mut session) in std::mem::take(&mut self.sessions) {
            fail_session_children(&mut session, error);
            let (pending_open, pending_closes) = session.lifecycle.fail();
            if let Some(open) = pending_open {
                open.fail(BeginError::IllegalState);
            }
            for close in pending_closes {
                // The session is gone either way
                close.succeed(());
            }
        }
        for (name, responder) in self.queued_unsubs.drain(..) {
            debug!(subscription = %name, "connection torn down during unsubscribe");
            responder.fail(UnsubscribeError::ConnectionClosed);
        }
    }

    fn fail_connection(&mut self, failure: EngineFailure) {
        error!(?failure, "connection failed");
        let exception = match failure {
            EngineFailure::Transport(transport::Error::IdleTimeoutElapsed) => {
                ConnectionException::IdleTimeout
            }
            EngineFailure::Transport(err) => ConnectionException::Transport(err.to_string()),
            EngineFailure::Disconnected => {
                ConnectionException::Transport("peer disconnected".to_string())
            }
            EngineFailure::Protocol(message) => ConnectionException::ProtocolViolation(message),
        };
        self.fail_all_children(None);
        let (_, pending_closes) = self.lifecycle.fail();
        for close in pending_closes {
            // The transport is going away, which is what close asked for
            close.succeed(());
        }
        self.fire_fatal_exception(&exception);
    }

    fn fire_exception(&self, exception: &ConnectionException) {
        notify_listener(&self.listener, exception);
    }

    /// A connection-fatal error reaches the listener exactly once.
    fn fire_fatal_exception(&mut self, exception: &ConnectionException) {
        if self.fatal_exception_fired {
            return;
        }
        self.fatal_exception_fired = true;
        self.fire_exception(exception);
    }
}

/* ------------------------------ free helpers ------------------------------ */

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn notify_listener(listener: &ExceptionListenerSlot, exception: &ConnectionException) {
    if let Some(listener) = lock_unpoisoned(listener).as_ref() {
        listener(exception);
    }
}

fn find_session_mut(
    sessions: &mut Slab<SessionInner>,
    incoming_channel: u16,
) -> Option<(SessionId, &mut SessionInner)> {
    let id = sessions
        .iter()
        .find(|(_, session)| session.incoming_channel == Some(incoming_channel))
        .map(|(id, _)| id)?;
    sessions.get_mut(id).map(|session| (id, session))
}

fn accepted() -> DeliveryState {
    DeliveryState::Accepted(Accepted {})
}

impl AsyncRequest<(), SendError> {
    /// Completes a send outcome; a failure nobody awaits anymore (an
    /// asynchronous send) is routed to the exception listener instead of
    /// being lost.
    fn report(self, outcome: Result<(), SendError>, listener: &ExceptionListenerSlot) {
        match outcome {
            Ok(()) => self.succeed(()),
            Err(error) => {
                if let Err(error) = self.try_fail(error) {
                    if let Some(listener) = lock_unpoisoned(listener).as_ref() {
                        listener(&ConnectionException::LinkFailed(Some(
                            definitions::Error {
                                condition: ErrorCondition::LinkError(LinkError::DetachForced),
                                description: Some(error.to_string()),
                                info: None,
                            },
                        )));
                    }
                }
            }
        }
    }
}

/// Emits the transfer for one delivery and tracks or completes it per
/// the settlement.
fn emit_transfer(
    outbox: &mut VecDeque<Frame>,
    session: &mut SessionInner,
    link_id: LinkId,
    payload: Payload,
    settled: bool,
    responder: AsyncRequest<(), SendError>,
) {
    let delivery_id = session.next_delivery_id();
    let tag = session.next_delivery_tag();
    let channel = session.outgoing_channel;
    {
        let Some(LinkEndpoint::Sender(sender)) = session.links.get_mut(link_id) else {
            responder.fail(SendError::IllegalState);
            return;
        };
        sender.link_credit = sender.link_credit.saturating_sub(1);
        sender.delivery_count = sender.delivery_count.wrapping_add(1);
    }
    session.remote_incoming_window = session.remote_incoming_window.saturating_sub(1);

    let transfer = Transfer {
        handle: Handle(link_id as u32),
        delivery_id: Some(delivery_id),
        delivery_tag: Some(ByteBuf::from(tag.to_vec())),
        message_format: Some(0),
        settled: Some(settled),
        more: false,
        rcv_settle_mode: None,
        state: None,
        resume: false,
        aborted: false,
        batchable: false,
    };
    trace!(link = link_id, delivery_id, settled, "emitting transfer");
    outbox.push_back(Frame::new(
        channel,
        FrameBody::Transfer {
            performative: transfer,
            payload,
        },
    ));

    match settled {
        // Settled at send time: no disposition will come
        true => responder.succeed(()),
        false => {
            session.in_flight.insert(
                delivery_id,
                PendingSend {
                    link: link_id,
                    responder,
                },
            );
        }
    }
}

/// Emits queued sends while the link has credit.
fn drain_queued_sends(outbox: &mut VecDeque<Frame>, session: &mut SessionInner, link_id: LinkId) {
    loop {
        let queued = {
            let Some(LinkEndpoint::Sender(sender)) = session.links.get_mut(link_id) else {
                return;
            };
            if sender.link_credit == 0 {
                return;
            }
            match sender.queued.pop_front() {
                Some(queued) => queued,
                None => return,
            }
        };
        emit_transfer(
            outbox,
            session,
            link_id,
            queued.payload,
            queued.settled,
            queued.responder,
        );
    }
}

/// Hands one delivery to a waiting receive and runs the post-dispatch
/// bookkeeping: acknowledgement policy and lazy credit replenishment.
#[allow(clippy::too_many_arguments)]
fn dispatch_delivery(
    outbox: &mut VecDeque<Frame>,
    channel: u16,
    ack_mode: AckMode,
    unacked: &mut VecDeque<UnackedDelivery>,
    numbers: FlowNumbers,
    link_id: LinkId,
    receiver: &mut ReceiverLink,
    delivery: JmsDelivery,
    responder: AsyncRequest<JmsDelivery, RecvError>,
) {
    let delivery_id = delivery.delivery_id;
    let delivery_count = delivery.message.delivery_count;
    let settled_by_peer = delivery.settled;

    if let Err(delivery) = responder.try_succeed(delivery) {
        // The caller timed out in the meantime; the delivery goes back
        // to the head of the window
        receiver.unbuffer(delivery);
        return;
    }

    if !settled_by_peer {
        match ack_mode {
            AckMode::Auto => {
                emit_settled_outcome(outbox, channel, &[delivery_id], accepted());
            }
            AckMode::DupsOk => {
                unacked.push_back(UnackedDelivery {
                    delivery_id,
                    delivery_count,
                });
                if unacked.len() >= DUPS_OK_BATCH {
                    let ids: Vec<_> = unacked.drain(..).map(|e| e.delivery_id).collect();
                    emit_settled_outcome(outbox, channel, &ids, accepted());
                }
            }
            AckMode::Client | AckMode::Transacted => {
                unacked.push_back(UnackedDelivery {
                    delivery_id,
                    delivery_count,
                });
            }
        }
    }

    if receiver.wants_replenish() {
        receiver.credit = receiver.replenish_target();
        trace!(link = link_id, credit = receiver.credit, "replenishing link credit");
        push_link_flow(
            outbox,
            channel,
            numbers,
            link_id as u32,
            receiver.delivery_count,
            receiver.credit,
        );
    }
}

/// Emits a settled disposition with the given outcome, coalescing
/// contiguous delivery-id runs.
fn emit_settled_outcome(
    outbox: &mut VecDeque<Frame>,
    channel: u16,
    ids: &[DeliveryNumber],
    state: DeliveryState,
) {
    if ids.is_empty() {
        return;
    }
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    let mut runs: Vec<(DeliveryNumber, DeliveryNumber)> = Vec::new();
    for id in sorted {
        match runs.last_mut() {
            Some((_, last)) if *last + 1 == id => *last = id,
            _ => runs.push((id, id)),
        }
    }
    for (first, last) in runs {
        outbox.push_back(Frame::new(
            channel,
            FrameBody::Disposition(Disposition {
                role: Role::Receiver,
                first,
                last: (last != first).then_some(last),
                settled: true,
                state: Some(state.clone()),
                batchable: false,
            }),
        ));
    }
}

fn push_link_flow(
    outbox: &mut VecDeque<Frame>,
    channel: u16,
    numbers: FlowNumbers,
    handle: u32,
    delivery_count: u32,
    link_credit: u32,
) {
    outbox.push_back(Frame::new(
        channel,
        FrameBody::Flow(Flow {
            next_incoming_id: Some(numbers.next_incoming_id),
            incoming_window: numbers.incoming_window,
            next_outgoing_id: numbers.next_outgoing_id,
            outgoing_window: numbers.outgoing_window,
            handle: Some(Handle(handle)),
            delivery_count: Some(delivery_count),
            link_credit: Some(link_credit),
            available: None,
            drain: false,
            echo: false,
            properties: None,
        }),
    ));
}

fn complete_detaches(
    pending_closes: Vec<AsyncRequest<(), DetachError>>,
    error: &Option<definitions::Error>,
) {
    for request in pending_closes {
        match error {
            Some(error) => request.fail(DetachError::RemoteError {
                error: Some(error.clone()),
            }),
            None => request.succeed(()),
        }
    }
}

fn receiver_attach_error(
    receiver: &ReceiverLink,
    error: &Option<definitions::Error>,
) -> ReceiverAttachError {
    let locked = error.as_ref().is_some_and(|err| {
        matches!(
            err.condition,
            ErrorCondition::AmqpError(AmqpError::ResourceLocked)
                | ErrorCondition::LinkError(LinkError::Stolen)
        )
    });
    match (locked, &receiver.opts.subscription) {
        (true, Some(subscription)) => {
            ReceiverAttachError::SubscriptionInUse(subscription.clone())
        }
        _ => ReceiverAttachError::Refused {
            error: error.clone(),
        },
    }
}

/// Fails the tracked sends of one link when it closes.
fn fail_in_flight_for_link(
    session: &mut SessionInner,
    link_id: LinkId,
    error: &Option<definitions::Error>,
    listener: &ExceptionListenerSlot,
) {
    let affected: Vec<_> = session
        .in_flight
        .iter()
        .filter(|(_, pending)| pending.link == link_id)
        .map(|(id, _)| *id)
        .collect();
    for id in affected {
        if let Some(pending) = session.in_flight.remove(&id) {
            pending.responder.report(
                Err(SendError::Detached {
                    error: error.clone(),
                }),
                listener,
            );
        }
    }
}

/// Fails everything pending on a session's links; used on forced
/// teardown and on remote end.
fn fail_session_children(session: &mut SessionInner, error: Option<&definitions::Error>) {
    for (_, endpoint) in std::mem::replace(&mut session.links, Slab::new()) {
        match endpoint {
            LinkEndpoint::Sender(mut sender) => {
                let (pending_open, pending_closes) = sender.lifecycle.fail();
                if let Some(open) = pending_open {
                    open.fail(SenderAttachError::Refused {
                        error: error.cloned(),
                    });
                }
                for close in pending_closes {
                    close.succeed(());
                }
                for queued in sender.queued.drain(..) {
                    queued.responder.fail(SendError::Detached {
                        error: error.cloned(),
                    });
                }
            }
            LinkEndpoint::Receiver(mut receiver) => {
                let (pending_open, pending_closes) = receiver.lifecycle.fail();
                if let Some(open) = pending_open {
                    open.fail(ReceiverAttachError::Refused {
                        error: error.cloned(),
                    });
                }
                for close in pending_closes {
                    close.succeed(());
                }
                if let Some(pending) = receiver.pending_receive.take() {
                    pending.fail(RecvError::Detached {
                        error: error.cloned(),
                    });
                }
            }
            LinkEndpoint::Unsubscriber(mut unsub) => {
                if let Some(responder) = unsub.responder.take() {
                    responder.fail(UnsubscribeError::Refused {
                        error: error.cloned(),
                    });
                }
            }
        }
    }
    session.input_handles.clear();
    let in_flight = std::mem::take(&mut session.in_flight);
    for (_, pending) in in_flight {
        pending.responder.fail(SendError::Detached {
            error: error.cloned(),
        });
    }
    session.unacked.clear();
}

/// Ends a session locally after the peer violated the disposition
/// rules: every tracked send fails and the end carries the violation.
fn fail_session_protocol_violation(outbox: &mut VecDeque<Frame>, session: &mut SessionInner) {
    let error = definitions::Error {
        condition: ErrorCondition::AmqpError(AmqpError::InvalidField),
        description: Some("disposition range overlaps untracked deliveries".to_string()),
        info: None,
    };
    let in_flight = std::mem::take(&mut session.in_flight);
    for (_, pending) in in_flight {
        pending.responder.fail(SendError::InvalidDispositionRange);
    }
    if let CloseDisposition::Emit = session.lifecycle.local_close(AsyncRequest::noop()) {
        outbox.push_back(Frame::new(
            session.outgoing_channel,
            FrameBody::End(End { error: Some(error) }),
        ));
    }
}
