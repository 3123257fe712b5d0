//! Well-known symbols and values of the AMQP JMS mapping.
//!
//! These are pure data shared between the message codec and the link
//! engine. The values are fixed by the JMS-over-AMQP mapping and peers
//! match them byte for byte.

/// Message-annotations key carrying the body flavour of a message.
///
/// The value is an unsigned byte, one of the `JMS_*_MESSAGE` codes below.
pub const JMS_MSG_TYPE: &str = "x-opt-jms-msg-type";

/// `properties.content-type` set on messages whose body is an opaque
/// serialized object blob in a single `data` section.
pub const SERIALIZED_OBJECT_CONTENT_TYPE: &str = "application/x-java-serialized-object";

/// `properties.content-type` set on bytes-message bodies.
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";

/// Body flavour code of a message without a body.
pub const JMS_MESSAGE: u8 = 0;

/// Body flavour code of an object message (serialized or AMQP-typed).
pub const JMS_OBJECT_MESSAGE: u8 = 1;

/// Body flavour code of a map message.
pub const JMS_MAP_MESSAGE: u8 = 2;

/// Body flavour code of a bytes message.
pub const JMS_BYTES_MESSAGE: u8 = 3;

/// Body flavour code of a stream message.
pub const JMS_STREAM_MESSAGE: u8 = 4;

/// Body flavour code of a text message.
pub const JMS_TEXT_MESSAGE: u8 = 5;

/// Default priority of an outbound message whose priority was not set.
pub const DEFAULT_PRIORITY: u8 = 4;
