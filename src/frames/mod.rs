//! Frame-level codecs layered over length-delimited framing.
//!
//! The transport strips the 4-byte size prefix with
//! [`LengthDelimitedCodec`](tokio_util::codec::LengthDelimitedCodec); the
//! codecs here consume the remaining `doff`/type/channel header and the
//! performative body.

pub mod amqp;
pub mod sasl;

mod error;
pub use error::Error;

/// Type byte of an AMQP frame.
pub const FRAME_TYPE_AMQP: u8 = 0x00;

/// Type byte of a SASL frame.
pub const FRAME_TYPE_SASL: u8 = 0x01;
