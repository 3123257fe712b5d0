//! The in-memory message model and its wire codec.
//!
//! A [`JmsMessage`] carries the transport header facets, the JMS-shaped
//! properties, application properties, and a [`JmsBody`], a tagged
//! variant over the supported body flavours. The codec in [`codec`]
//! bridges this model to AMQP message sections.

use bytes::Bytes;
use fe2o3_amqp_types::{
    definitions::Milliseconds,
    messaging::{annotations::Annotations, MessageId},
    primitives::{Binary, SimpleValue, Symbol, Timestamp, Value},
};
use serde_amqp::primitives::OrderedMap;

pub mod codec;

mod error;
pub use error::CodecError;

use crate::constants;

/// Body of a message, tagged by flavour.
///
/// Operations that are only defined for some flavours fail with a precise
/// [`CodecError`] at the codec boundary rather than silently coercing.
#[derive(Debug, Clone, PartialEq)]
pub enum JmsBody {
    /// No body
    Empty,

    /// Text body; `None` models a text message without content
    Text(Option<String>),

    /// Raw bytes body
    Bytes(Bytes),

    /// Map body with string keys
    Map(OrderedMap<String, Value>),

    /// Stream body, an ordered list of values
    Stream(Vec<Value>),

    /// Object body as an opaque serialized blob
    ObjectSerialized(Bytes),

    /// Object body as a native AMQP-typed value
    ObjectTyped(Value),
}

impl JmsBody {
    /// Body flavour code carried in the `x-opt-jms-msg-type` annotation.
    pub fn msg_type_code(&self) -> u8 {
        match self {
            JmsBody::Empty => constants::JMS_MESSAGE,
            JmsBody::ObjectSerialized(_) | JmsBody::ObjectTyped(_) => {
                constants::JMS_OBJECT_MESSAGE
            }
            JmsBody::Map(_) => constants::JMS_MAP_MESSAGE,
            JmsBody::Bytes(_) => constants::JMS_BYTES_MESSAGE,
            JmsBody::Stream(_) => constants::JMS_STREAM_MESSAGE,
            JmsBody::Text(_) => constants::JMS_TEXT_MESSAGE,
        }
    }
}

/// An application-level message.
///
/// Unless [`durable`](Self::durable) is explicitly cleared, outbound
/// messages are sent with the header durable bit set.
#[derive(Debug, Clone, PartialEq)]
pub struct JmsMessage {
    /// Header durable bit; `true` unless explicitly cleared
    pub durable: bool,

    /// Header priority
    pub priority: u8,

    /// Time to live in milliseconds
    pub ttl: Option<Milliseconds>,

    /// Header first-acquirer bit
    pub first_acquirer: bool,

    /// Header delivery-count; incremented by intermediaries, not by the
    /// application
    pub delivery_count: u32,

    /// properties.message-id
    pub message_id: Option<MessageId>,

    /// properties.user-id
    pub user_id: Option<Binary>,

    /// properties.to
    pub to: Option<String>,

    /// properties.subject
    pub subject: Option<String>,

    /// properties.reply-to
    pub reply_to: Option<String>,

    /// properties.correlation-id
    pub correlation_id: Option<MessageId>,

    /// properties.content-type as observed on receive; on send the codec
    /// derives the content type from the body flavour
    pub content_type: Option<Symbol>,

    /// properties.group-id
    pub group_id: Option<String>,

    /// properties.absolute-expiry-time
    pub absolute_expiry_time: Option<Timestamp>,

    /// properties.creation-time
    pub creation_time: Option<Timestamp>,

    /// Message annotations other than the codec-owned body flavour tag
    pub message_annotations: Annotations,

    /// Delivery annotations
    pub delivery_annotations: Annotations,

    /// application-properties
    pub application_properties: OrderedMap<String, SimpleValue>,

    /// The body
    pub body: JmsBody,
}

impl JmsMessage {
    fn with_body(body: JmsBody) -> Self {
        Self {
            durable: true,
            priority: constants::DEFAULT_PRIORITY,
            ttl: None,
            first_acquirer: false,
            delivery_count: 0,
            message_id: None,
            user_id: None,
            to: None,
            subject: None,
            reply_to: None,
            correlation_id: None,
            content_type: None,
            group_id: None,
            absolute_expiry_time: None,
            creation_time: None,
            message_annotations: Annotations::new(),
            delivery_annotations: Annotations::new(),
            application_properties: OrderedMap::new(),
            body,
        }
    }

    /// A message without a body.
    pub fn empty() -> Self {
        Self::with_body(JmsBody::Empty)
    }

    /// A text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self::with_body(JmsBody::Text(Some(text.into())))
    }

    /// A bytes message.
    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Self::with_body(JmsBody::Bytes(bytes.into()))
    }

    /// A map message.
    pub fn map(map: OrderedMap<String, Value>) -> Self {
        Self::with_body(JmsBody::Map(map))
    }

    /// A stream message.
    pub fn stream(values: Vec<Value>) -> Self {
        Self::with_body(JmsBody::Stream(values))
    }

    /// An object message whose body is the application's serialization of
    /// `value`, carried as an opaque blob.
    pub fn object(value: &impl serde::Serialize) -> Result<Self, CodecError> {
        let blob = serde_amqp::to_vec(value).map_err(CodecError::Encode)?;
        Ok(Self::object_bytes(blob))
    }

    /// An object message from an already-serialized opaque blob.
    pub fn object_bytes(blob: impl Into<Bytes>) -> Self {
        Self::with_body(JmsBody::ObjectSerialized(blob.into()))
    }

    /// An object message whose body is sent as a native AMQP-typed value.
    pub fn object_typed(value: impl Into<Value>) -> Self {
        Self::with_body(JmsBody::ObjectTyped(value.into()))
    }

    /// Replaces the body.
    pub fn body(mut self, body: JmsBody) -> Self {
        self.body = body;
        self
    }

    /// Clears or sets the header durable bit.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets the priority.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the time to live.
    pub fn ttl(mut self, ttl: Milliseconds) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets properties.message-id.
    pub fn message_id(mut self, id: impl Into<MessageId>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Sets properties.correlation-id.
    pub fn correlation_id(mut self, id: impl Into<MessageId>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Sets properties.to.
    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Sets properties.reply-to.
    pub fn reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Sets properties.subject.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Sets properties.group-id.
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Adds an application property.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<SimpleValue>) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }
}
