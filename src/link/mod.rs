//! Sender and receiver links.
//!
//! A link is a unidirectional flow of messages between a session and a
//! node at the peer. [`Sender`] and [`Receiver`] are the application
//! handles; the engine-side state machines live in [`endpoint`] and are
//! driven by the connection engine.

use std::sync::atomic::{AtomicU64, Ordering};

mod delivery;
pub use delivery::{DeliveryFut, JmsDelivery};

pub use crate::control::AckOutcome;

mod error;
pub use error::{
    DetachError, DispositionError, ReceiverAttachError, RecvError, SendError, SenderAttachError,
};

pub(crate) mod endpoint;

mod receiver;
mod sender;
pub use receiver::Receiver;
pub use sender::Sender;

static LINK_NAME_SEQ: AtomicU64 = AtomicU64::new(0);

pub(crate) fn generated_link_name(role: &str) -> String {
    let seq = LINK_NAME_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("galena-{}-{}", role, seq)
}

/// Configuration of a sender link, immutable once attached.
#[derive(Debug, Clone)]
pub struct SenderOpts {
    /// Target address at the peer
    pub address: String,

    /// Link name; generated when absent
    pub name: Option<String>,

    /// Send deliveries pre-settled: no disposition is expected and sends
    /// complete as soon as the transfer is emitted
    pub presettled: bool,
}

impl SenderOpts {
    /// Sender towards the given target address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            presettled: false,
        }
    }

    /// Sets the link name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sends deliveries pre-settled.
    pub fn presettled(mut self) -> Self {
        self.presettled = true;
        self
    }
}

/// Configuration of a receiver link, immutable once attached.
#[derive(Debug, Clone)]
pub struct ReceiverOpts {
    /// Source address at the peer
    pub address: String,

    /// Link name; for durable subscriptions the subscription name is
    /// used instead
    pub name: Option<String>,

    /// Prefetch credit; falls back to the factory's prefetch policy
    pub prefetch: Option<u32>,

    /// Durable subscription name. Attaching with a name the peer already
    /// serves to an active consumer fails with
    /// [`ReceiverAttachError::SubscriptionInUse`].
    pub subscription: Option<String>,
}

impl ReceiverOpts {
    /// Receiver from the given source address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            prefetch: None,
            subscription: None,
        }
    }

    /// Sets the link name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Overrides the prefetch credit.
    pub fn prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    /// Makes this a durable subscription with the given name.
    ///
    /// Subscription names are unique per client-id at the broker; the
    /// subscription survives detach and is removed with
    /// [`ConnectionHandle::unsubscribe`](crate::connection::ConnectionHandle::unsubscribe).
    pub fn durable(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = Some(subscription.into());
        self
    }
}
