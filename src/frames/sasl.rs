//! SASL frame type and its encoder/decoder.

use bytes::{Buf, BufMut, BytesMut};
use fe2o3_amqp_types::sasl::{SaslChallenge, SaslInit, SaslMechanisms, SaslOutcome, SaslResponse};
use serde::{
    de::{self, VariantAccess},
    ser, Deserialize, Serialize,
};
use serde_amqp::read::IoReader;
use tokio_util::codec::{Decoder, Encoder};

use super::{Error, FRAME_TYPE_SASL};

/// A frame of the SASL negotiation layer.
#[derive(Debug)]
pub enum Frame {
    /// sasl-mechanisms, announced by the server
    Mechanisms(SaslMechanisms),

    /// sasl-init, sent by the client
    Init(SaslInit),

    /// sasl-challenge from the server
    Challenge(SaslChallenge),

    /// sasl-response from the client
    Response(SaslResponse),

    /// sasl-outcome concluding the negotiation
    Outcome(SaslOutcome),
}

/// Encoder/decoder between [`Frame`] and the bytes following the size
/// prefix.
#[derive(Debug)]
pub struct FrameCodec {}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        use serde_amqp::ser::Serializer;

        dst.put_u8(2); // doff, extended header ignored
        dst.put_u8(FRAME_TYPE_SASL);
        dst.put_u16(0x0000); // bytes 6 and 7 are ignored

        let mut serializer = Serializer::from(dst.writer());
        item.serialize(&mut serializer)?;
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        use serde_amqp::de::Deserializer;

        if src.len() < 4 {
            return Err(Error::FramingError);
        }
        let doff = src.get_u8();
        let ftype = src.get_u8();
        let _ignored = src.get_u16();

        if ftype != FRAME_TYPE_SASL {
            return Err(Error::NotImplemented);
        }
        if doff != 2 {
            return Err(Error::FramingError);
        }

        let reader = IoReader::new(src.reader());
        let mut deserializer = Deserializer::new(reader);
        let frame = Frame::deserialize(&mut deserializer)?;
        Ok(Some(frame))
    }
}

impl ser::Serialize for Frame {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Frame::Mechanisms(value) => value.serialize(serializer),
            Frame::Init(value) => value.serialize(serializer),
            Frame::Challenge(value) => value.serialize(serializer),
            Frame::Response(value) => value.serialize(serializer),
            Frame::Outcome(value) => value.serialize(serializer),
        }
    }
}

enum Field {
    Mechanisms,
    Init,
    Challenge,
    Response,
    Outcome,
}

struct FieldVisitor {}

impl<'de> de::Visitor<'de> for FieldVisitor {
    type Value = Field;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("SASL frame body descriptor")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "amqp:sasl-mechanisms:list" => Ok(Field::Mechanisms),
            "amqp:sasl-init:list" => Ok(Field::Init),
            "amqp:sasl-challenge:list" => Ok(Field::Challenge),
            "amqp:sasl-response:list" => Ok(Field::Response),
            "amqp:sasl-outcome:list" => Ok(Field::Outcome),
            _ => Err(de::Error::custom("unknown SASL frame descriptor name")),
        }
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            0x40 => Ok(Field::Mechanisms),
            0x41 => Ok(Field::Init),
            0x42 => Ok(Field::Challenge),
            0x43 => Ok(Field::Response),
            0x44 => Ok(Field::Outcome),
            _ => Err(de::Error::custom("unknown SASL frame descriptor code")),
        }
    }
}

impl<'de> de::Deserialize<'de> for Field {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_identifier(FieldVisitor {})
    }
}

struct Visitor {}

impl<'de> de::Visitor<'de> for Visitor {
    type Value = Frame;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("SASL frame body")
    }

    fn visit_enum<A>(self, data: A) -> Result<Self::Value, A::Error>
    where
        A: de::EnumAccess<'de>,
    {
        let (field, variant) = data.variant()?;
        match field {
            Field::Mechanisms => variant.newtype_variant().map(Frame::Mechanisms),
            Field::Init => variant.newtype_variant().map(Frame::Init),
            Field::Challenge => variant.newtype_variant().map(Frame::Challenge),
            Field::Response => variant.newtype_variant().map(Frame::Response),
            Field::Outcome => variant.newtype_variant().map(Frame::Outcome),
        }
    }
}

impl<'de> de::Deserialize<'de> for Frame {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        const VARIANTS: &[&str] = &[
            "amqp:sasl-mechanisms:list",
            "amqp:sasl-init:list",
            "amqp:sasl-challenge:list",
            "amqp:sasl-response:list",
            "amqp:sasl-outcome:list",
        ];
        deserializer.deserialize_enum("sasl::Frame", VARIANTS, Visitor {})
    }
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp_types::{
        primitives::{Array, Symbol},
        sasl::SaslMechanisms,
    };
    use serde_amqp::{from_slice, to_vec};

    #[test]
    fn mechanisms_frame_body_round_trips() {
        let mechanisms = SaslMechanisms {
            sasl_server_mechanisms: Array(vec![Symbol::from("PLAIN")]),
        };
        let buf = to_vec(&mechanisms).unwrap();
        let frame: super::Frame = from_slice(&buf).unwrap();
        match frame {
            super::Frame::Mechanisms(m) => {
                assert!(m.sasl_server_mechanisms.0.contains(&Symbol::from("PLAIN")));
            }
            other => panic!("expected Mechanisms, got {:?}", other),
        }
    }
}
