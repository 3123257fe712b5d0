//! Engine-side link state machines.
//!
//! These structs are owned by the connection engine and mutated only on
//! its task. The application handles in [`sender`](super::sender) and
//! [`receiver`](super::receiver) reach them through commands.

use std::collections::VecDeque;

use bytes::BytesMut;
use fe2o3_amqp_types::definitions::SequenceNo;
use fe2o3_amqp_types::performatives::Transfer;

use crate::connection::UnsubscribeError;
use crate::requests::AsyncRequest;
use crate::resource::Lifecycle;
use crate::Payload;

use super::delivery::JmsDelivery;
use super::{
    DetachError, ReceiverAttachError, ReceiverOpts, RecvError, SendError, SenderAttachError,
    SenderOpts,
};

/// Result of a completed receiver attach.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReceiverAttached {
    pub link: usize,
    /// For durable subscriptions: whether the peer retained subscription
    /// state (non-null source on the attach answer)
    pub resumed: bool,
}

/// A send parked until the peer grants credit.
#[derive(Debug)]
pub(crate) struct QueuedSend {
    pub payload: Payload,
    pub settled: bool,
    pub responder: AsyncRequest<(), SendError>,
}

#[derive(Debug)]
pub(crate) struct SenderLink {
    pub name: String,
    pub opts: SenderOpts,
    pub lifecycle: Lifecycle<usize, SenderAttachError, DetachError>,
    pub input_handle: Option<u32>,
    /// Sequence number of the next delivery on this link
    pub delivery_count: SequenceNo,
    /// Credit granted by the peer; every transfer consumes one
    pub link_credit: u32,
    pub queued: VecDeque<QueuedSend>,
}

impl SenderLink {
    pub fn new(name: String, opts: SenderOpts) -> Self {
        Self {
            name,
            opts,
            lifecycle: Lifecycle::new(),
            input_handle: None,
            delivery_count: 0,
            link_credit: 0,
            queued: VecDeque::new(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct ReceiverLink {
    pub name: String,
    pub opts: ReceiverOpts,
    pub lifecycle: Lifecycle<ReceiverAttached, ReceiverAttachError, DetachError>,
    pub input_handle: Option<u32>,
    /// Resolved prefetch budget
    pub prefetch: u32,
    /// Credit currently outstanding at the peer
    pub credit: u32,
    /// Last known delivery-count of the sending endpoint
    pub delivery_count: SequenceNo,
    /// Reorder the buffered window by message priority
    pub local_priority: bool,
    /// Undispatched deliveries, bounded by the prefetch budget
    pub buffered: VecDeque<JmsDelivery>,
    /// The at-most-one receive awaiting a delivery
    pub pending_receive: Option<AsyncRequest<JmsDelivery, RecvError>>,
    /// Multi-frame transfer being reassembled
    pub partial: Option<(Transfer, BytesMut)>,
    pub resumed: bool,
}

impl ReceiverLink {
    pub fn new(name: String, opts: ReceiverOpts, prefetch: u32, local_priority: bool) -> Self {
        Self {
            name,
            opts,
            lifecycle: Lifecycle::new(),
            input_handle: None,
            prefetch,
            credit: 0,
            delivery_count: 0,
            local_priority,
            buffered: VecDeque::new(),
            pending_receive: None,
            partial: None,
            resumed: false,
        }
    }

    /// Buffers a delivery, keeping the window priority-ordered when local
    /// message priority is enabled (descending, FIFO within a priority).
    pub fn buffer(&mut self, delivery: JmsDelivery) {
        if !self.local_priority {
            self.buffered.push_back(delivery);
            return;
        }
        let priority = delivery.message.priority;
        let at = self
            .buffered
            .iter()
            .rposition(|queued| queued.message.priority >= priority)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.buffered.insert(at, delivery);
    }

    /// Puts a delivery back at the head of the buffer (a fulfilled
    /// receive whose caller timed out first).
    pub fn unbuffer(&mut self, delivery: JmsDelivery) {
        self.buffered.push_front(delivery);
    }

    pub fn pop(&mut self) -> Option<JmsDelivery> {
        self.buffered.pop_front()
    }

    /// Whether the credit ran down far enough to top back up.
    pub fn wants_replenish(&self) -> bool {
        self.credit <= self.prefetch / 2
    }

    /// New credit target: at equilibrium (empty buffer) exactly the
    /// prefetch budget, otherwise leaving room for what is buffered.
    pub fn replenish_target(&self) -> u32 {
        self.prefetch.saturating_sub(self.buffered.len() as u32)
    }
}

/// Hidden receiver used by the connection session to remove a durable
/// subscription: attach by subscription name with a null source, then
/// detach with `closed` set.
#[derive(Debug)]
pub(crate) struct UnsubscriberLink {
    pub subscription: String,
    pub input_handle: Option<u32>,
    /// Whether the peer's attach answer carried a source, i.e. the
    /// subscription exists
    pub found: bool,
    pub responder: Option<AsyncRequest<(), UnsubscribeError>>,
}

#[derive(Debug)]
pub(crate) enum LinkEndpoint {
    Sender(SenderLink),
    Receiver(ReceiverLink),
    Unsubscriber(UnsubscriberLink),
}

impl LinkEndpoint {
    pub fn name(&self) -> &str {
        match self {
            LinkEndpoint::Sender(link) => &link.name,
            LinkEndpoint::Receiver(link) => &link.name,
            LinkEndpoint::Unsubscriber(link) => &link.subscription,
        }
    }

    pub fn input_handle(&self) -> Option<u32> {
        match self {
            LinkEndpoint::Sender(link) => link.input_handle,
            LinkEndpoint::Receiver(link) => link.input_handle,
            LinkEndpoint::Unsubscriber(link) => link.input_handle,
        }
    }

    pub fn set_input_handle(&mut self, handle: u32) {
        match self {
            LinkEndpoint::Sender(link) => link.input_handle = Some(handle),
            LinkEndpoint::Receiver(link) => link.input_handle = Some(handle),
            LinkEndpoint::Unsubscriber(link) => link.input_handle = Some(handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ReceiverLink, ReceiverOpts};
    use crate::link::delivery::JmsDelivery;
    use crate::message::JmsMessage;

    fn delivery(priority: u8, marker: &str) -> JmsDelivery {
        JmsDelivery {
            message: JmsMessage::text(marker).priority(priority),
            delivery_id: 0,
            session: 0,
            settled: false,
        }
    }

    fn marker(delivery: &JmsDelivery) -> String {
        match &delivery.message.body {
            crate::message::JmsBody::Text(Some(text)) => text.clone(),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn fifo_without_local_priority() {
        let mut link = ReceiverLink::new("r".to_string(), ReceiverOpts::new("q"), 10, false);
        link.buffer(delivery(1, "a"));
        link.buffer(delivery(9, "b"));
        assert_eq!(marker(&link.pop().unwrap()), "a");
        assert_eq!(marker(&link.pop().unwrap()), "b");
    }

    #[test]
    fn priority_orders_buffered_window_with_fifo_tie_break() {
        let mut link = ReceiverLink::new("r".to_string(), ReceiverOpts::new("q"), 10, true);
        link.buffer(delivery(1, "low"));
        link.buffer(delivery(9, "high-1"));
        link.buffer(delivery(4, "mid"));
        link.buffer(delivery(9, "high-2"));

        assert_eq!(marker(&link.pop().unwrap()), "high-1");
        assert_eq!(marker(&link.pop().unwrap()), "high-2");
        assert_eq!(marker(&link.pop().unwrap()), "mid");
        assert_eq!(marker(&link.pop().unwrap()), "low");
    }

    #[test]
    fn replenish_threshold_and_target() {
        let mut link = ReceiverLink::new("r".to_string(), ReceiverOpts::new("q"), 10, false);
        link.credit = 6;
        assert!(!link.wants_replenish());
        link.credit = 5;
        assert!(link.wants_replenish());

        link.buffer(delivery(4, "x"));
        // One delivery still buffered: top up to prefetch minus the
        // buffered window
        assert_eq!(link.replenish_target(), 9);
        link.pop();
        assert_eq!(link.replenish_target(), 10);
    }
}
