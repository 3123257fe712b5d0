//! AMQP frame type and its encoder/decoder.

use bytes::{Buf, BufMut, BytesMut};
use fe2o3_amqp_types::performatives::{
    Attach, Begin, Close, Detach, Disposition, End, Flow, Open, Performative, Transfer,
};
use serde::{Deserialize, Serialize};
use serde_amqp::{de::Deserializer, read::IoReader};
use tokio_util::codec::{Decoder, Encoder};

use crate::Payload;

use super::{Error, FRAME_TYPE_AMQP};

/// An AMQP frame after the size prefix has been stripped: a channel number
/// and a performative body, plus the message payload for transfers.
#[derive(Debug)]
pub struct Frame {
    /// Channel the frame is addressed to
    pub channel: u16,

    /// Performative and, for transfers, the payload
    pub body: FrameBody,
}

impl Frame {
    /// Creates a frame on the given channel.
    pub fn new(channel: u16, body: FrameBody) -> Self {
        Self { channel, body }
    }

    /// The empty (heartbeat) frame.
    pub fn empty() -> Self {
        Self {
            channel: 0,
            body: FrameBody::Empty,
        }
    }
}

/// Body of an AMQP frame.
#[derive(Debug)]
pub enum FrameBody {
    /// Open performative
    Open(Open),
    /// Begin performative
    Begin(Begin),
    /// Attach performative
    Attach(Attach),
    /// Flow performative
    Flow(Flow),
    /// Transfer performative with the encoded message sections
    Transfer {
        /// The performative itself
        performative: Transfer,
        /// Encoded message sections following the performative
        payload: Payload,
    },
    /// Disposition performative
    Disposition(Disposition),
    /// Detach performative
    Detach(Detach),
    /// End performative
    End(End),
    /// Close performative
    Close(Close),
    /// An empty frame, used only as a heartbeat
    Empty,
}

/// Encoder/decoder between [`Frame`] and the bytes following the size
/// prefix.
#[derive(Debug)]
pub struct FrameCodec {}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        use serde_amqp::ser::Serializer;

        // The extended header is never used, so doff is always 2
        dst.put_u8(2);
        dst.put_u8(FRAME_TYPE_AMQP);
        dst.put_u16(item.channel);

        let mut serializer = Serializer::from(dst.writer());
        match item.body {
            FrameBody::Open(p) => p.serialize(&mut serializer)?,
            FrameBody::Begin(p) => p.serialize(&mut serializer)?,
            FrameBody::Attach(p) => p.serialize(&mut serializer)?,
            FrameBody::Flow(p) => p.serialize(&mut serializer)?,
            FrameBody::Transfer {
                performative,
                payload,
            } => {
                performative.serialize(&mut serializer)?;
                dst.put(payload);
            }
            FrameBody::Disposition(p) => p.serialize(&mut serializer)?,
            FrameBody::Detach(p) => p.serialize(&mut serializer)?,
            FrameBody::End(p) => p.serialize(&mut serializer)?,
            FrameBody::Close(p) => p.serialize(&mut serializer)?,
            FrameBody::Empty => {}
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Err(Error::FramingError);
        }
        let doff = src.get_u8();
        let ftype = src.get_u8();
        let channel = src.get_u16();

        if ftype != FRAME_TYPE_AMQP {
            return Err(Error::NotImplemented);
        }
        if doff != 2 {
            return Err(Error::FramingError);
        }

        if src.is_empty() {
            return Ok(Some(Frame {
                channel,
                body: FrameBody::Empty,
            }));
        }

        let reader = IoReader::new(src.reader());
        let mut deserializer = Deserializer::new(reader);
        let performative = Performative::deserialize(&mut deserializer)?;

        let body = match performative {
            Performative::Open(p) => FrameBody::Open(p),
            Performative::Begin(p) => FrameBody::Begin(p),
            Performative::Attach(p) => FrameBody::Attach(p),
            Performative::Flow(p) => FrameBody::Flow(p),
            Performative::Transfer(performative) => {
                // Whatever follows the performative is the message payload;
                // it is split out so the buffer can be released
                let payload = src.split().freeze();
                FrameBody::Transfer {
                    performative,
                    payload,
                }
            }
            Performative::Disposition(p) => FrameBody::Disposition(p),
            Performative::Detach(p) => FrameBody::Detach(p),
            Performative::End(p) => FrameBody::End(p),
            Performative::Close(p) => FrameBody::Close(p),
        };

        Ok(Some(Frame { channel, body }))
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use fe2o3_amqp_types::performatives::Open;
    use tokio_util::codec::{Decoder, Encoder};

    use super::{Frame, FrameBody, FrameCodec};

    #[test]
    fn open_round_trips_through_the_codec() {
        let open = Open {
            container_id: "client-1".into(),
            hostname: Some("localhost".into()),
            max_frame_size: 4096.into(),
            channel_max: 255.into(),
            idle_time_out: Some(30_000),
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };

        let mut dst = BytesMut::new();
        let mut codec = FrameCodec {};
        codec
            .encode(Frame::new(0, FrameBody::Open(open)), &mut dst)
            .unwrap();

        let frame = codec.decode(&mut dst).unwrap().unwrap();
        assert_eq!(frame.channel, 0);
        match frame.body {
            FrameBody::Open(open) => {
                assert_eq!(open.container_id, "client-1");
                assert_eq!(open.idle_time_out, Some(30_000));
            }
            other => panic!("expected Open, got {:?}", other),
        }
    }

    #[test]
    fn empty_frame_decodes_as_heartbeat() {
        let mut src = BytesMut::from(&[0x02, 0x00, 0x00, 0x00][..]);
        let frame = FrameCodec {}.decode(&mut src).unwrap().unwrap();
        assert!(matches!(frame.body, FrameBody::Empty));
    }
}
