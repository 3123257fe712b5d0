//! Conversion between [`JmsMessage`] and AMQP message sections.
//!
//! On send the codec owns the content-type and the body flavour
//! annotation: opaque object blobs travel in a `data` section tagged with
//! the reserved content-type symbol, AMQP-typed object bodies travel in
//! an `amqp-value` section without a content-type. On receive the flavour
//! is resolved from the annotation tag first, then the content-type, then
//! the section kind.

use bytes::{BufMut, Bytes, BytesMut};
use fe2o3_amqp_types::messaging::{
    annotations::{Annotations, OwnedKey},
    message::__private::{Deserializable, Serializable},
    AmqpSequence, AmqpValue, ApplicationProperties, Batch, Body, Data, DeliveryAnnotations,
    Header, Message, MessageAnnotations, Priority, Properties,
};
use fe2o3_amqp_types::primitives::{Binary, Symbol, Value};
use serde::Serialize;
use serde_amqp::primitives::OrderedMap;

use crate::constants::{
    JMS_BYTES_MESSAGE, JMS_MAP_MESSAGE, JMS_MESSAGE, JMS_MSG_TYPE, JMS_OBJECT_MESSAGE,
    JMS_STREAM_MESSAGE, JMS_TEXT_MESSAGE, OCTET_STREAM_CONTENT_TYPE,
    SERIALIZED_OBJECT_CONTENT_TYPE,
};
use crate::Payload;

use super::{CodecError, JmsBody, JmsMessage};

type AmqpMessage = Message<Body<Value>>;

/// Encodes a message into the payload bytes of a transfer frame.
pub fn encode(message: &JmsMessage) -> Result<Payload, CodecError> {
    let amqp = to_amqp(message)?;
    let mut payload = BytesMut::new();
    let mut serializer = serde_amqp::ser::Serializer::from((&mut payload).writer());
    Serializable(amqp)
        .serialize(&mut serializer)
        .map_err(CodecError::Encode)?;
    Ok(payload.freeze())
}

/// Decodes the payload bytes of a transfer frame into a message.
pub fn decode(payload: &[u8]) -> Result<JmsMessage, CodecError> {
    let Deserializable(amqp): Deserializable<AmqpMessage> =
        serde_amqp::from_reader(payload).map_err(CodecError::Decode)?;
    from_amqp(amqp)
}

fn content_type_for(body: &JmsBody) -> Option<Symbol> {
    match body {
        JmsBody::ObjectSerialized(_) => Some(Symbol::from(SERIALIZED_OBJECT_CONTENT_TYPE)),
        JmsBody::Bytes(_) => Some(Symbol::from(OCTET_STREAM_CONTENT_TYPE)),
        // AMQP-typed object bodies deliberately carry no content-type
        JmsBody::ObjectTyped(_)
        | JmsBody::Text(_)
        | JmsBody::Map(_)
        | JmsBody::Stream(_)
        | JmsBody::Empty => None,
    }
}

fn data_body(bytes: &Bytes) -> Body<Value> {
    Body::Data(Batch::new(vec![Data(Binary::from(bytes.to_vec()))]))
}

fn string_map_to_value(map: &OrderedMap<String, Value>) -> Value {
    let mut out = OrderedMap::new();
    for (key, value) in map {
        out.insert(Value::String(key.clone()), value.clone());
    }
    Value::Map(out)
}

fn value_to_string_map(value: Value) -> Result<OrderedMap<String, Value>, CodecError> {
    let map = match value {
        Value::Map(map) => map,
        _ => return Err(CodecError::UnexpectedBody { flavour: "map" }),
    };
    let mut out = OrderedMap::new();
    for (key, value) in map.into_iter() {
        match key {
            Value::String(key) => out.insert(key, value),
            Value::Symbol(key) => out.insert(key.0, value),
            _ => return Err(CodecError::NonStringMapKey),
        };
    }
    Ok(out)
}

/// Builds the wire-level message. Always stamps the header (durable bit
/// per the message) and the body flavour annotation.
pub(crate) fn to_amqp(message: &JmsMessage) -> Result<AmqpMessage, CodecError> {
    let header = Header {
        durable: message.durable,
        priority: Priority(message.priority),
        ttl: message.ttl,
        first_acquirer: message.first_acquirer,
        delivery_count: message.delivery_count,
    };

    let mut annotations = message.message_annotations.clone();
    annotations.insert(
        OwnedKey::from(JMS_MSG_TYPE),
        serde_amqp::to_value(&message.body.msg_type_code()).map_err(CodecError::Encode)?,
    );

    let properties = Properties {
        message_id: message.message_id.clone(),
        user_id: message.user_id.clone(),
        to: message.to.clone(),
        subject: message.subject.clone(),
        reply_to: message.reply_to.clone(),
        correlation_id: message.correlation_id.clone(),
        content_type: content_type_for(&message.body),
        content_encoding: None,
        absolute_expiry_time: message.absolute_expiry_time.clone(),
        creation_time: message.creation_time.clone(),
        group_id: message.group_id.clone(),
        group_sequence: None,
        reply_to_group_id: None,
    };

    let body = match &message.body {
        JmsBody::Empty => Body::Value(AmqpValue(Value::Null)),
        JmsBody::Text(text) => Body::Value(AmqpValue(match text {
            Some(text) => Value::String(text.clone()),
            None => Value::Null,
        })),
        JmsBody::Bytes(bytes) => data_body(bytes),
        JmsBody::Map(map) => Body::Value(AmqpValue(string_map_to_value(map))),
        JmsBody::Stream(values) => {
            Body::Sequence(Batch::new(vec![AmqpSequence(values.clone())]))
        }
        JmsBody::ObjectSerialized(blob) => data_body(blob),
        JmsBody::ObjectTyped(value) => Body::Value(AmqpValue(value.clone())),
    };

    Ok(Message {
        header: Some(header),
        delivery_annotations: match message.delivery_annotations == Annotations::new() {
            true => None,
            false => Some(DeliveryAnnotations(message.delivery_annotations.clone())),
        },
        message_annotations: Some(MessageAnnotations(annotations)),
        properties: Some(properties),
        application_properties: match message.application_properties == OrderedMap::new() {
            true => None,
            false => Some(ApplicationProperties(message.application_properties.clone())),
        },
        body,
        footer: None,
    })
}

fn annotation_code(annotations: &Annotations) -> Option<u8> {
    annotations
        .get(&OwnedKey::from(JMS_MSG_TYPE))
        .and_then(|value| serde_amqp::from_value(value.clone()).ok())
}

fn collect_data(batch: Batch<Data>) -> Bytes {
    let mut buf = BytesMut::new();
    for Data(bytes) in batch.into_iter() {
        buf.put_slice(&bytes);
    }
    buf.freeze()
}

fn collect_sequences(batch: Batch<AmqpSequence<Value>>) -> Vec<Value> {
    batch
        .into_iter()
        .flat_map(|AmqpSequence(values)| values)
        .collect()
}

/// Resolves the body flavour and rebuilds the application-level message.
pub(crate) fn from_amqp(amqp: AmqpMessage) -> Result<JmsMessage, CodecError> {
    let header = amqp.header.unwrap_or(Header {
        durable: false,
        priority: Priority(crate::constants::DEFAULT_PRIORITY),
        ttl: None,
        first_acquirer: false,
        delivery_count: 0,
    });
    let properties = amqp.properties.unwrap_or(Properties {
        message_id: None,
        user_id: None,
        to: None,
        subject: None,
        reply_to: None,
        correlation_id: None,
        content_type: None,
        content_encoding: None,
        absolute_expiry_time: None,
        creation_time: None,
        group_id: None,
        group_sequence: None,
        reply_to_group_id: None,
    });

    let mut annotations = amqp
        .message_annotations
        .map(|MessageAnnotations(a)| a)
        .unwrap_or_default();
    let code = annotation_code(&annotations);
    annotations.remove(&OwnedKey::from(JMS_MSG_TYPE));

    let content_type = properties.content_type.clone();
    let is_serialized_object = content_type
        .as_ref()
        .map(|ct| ct.0 == SERIALIZED_OBJECT_CONTENT_TYPE)
        .unwrap_or(false);

    let body = resolve_body(code, is_serialized_object, amqp.body)?;

    Ok(JmsMessage {
        durable: header.durable,
        priority: header.priority.0,
        ttl: header.ttl,
        first_acquirer: header.first_acquirer,
        delivery_count: header.delivery_count,
        message_id: properties.message_id,
        user_id: properties.user_id,
        to: properties.to,
        subject: properties.subject,
        reply_to: properties.reply_to,
        correlation_id: properties.correlation_id,
        content_type,
        group_id: properties.group_id,
        absolute_expiry_time: properties.absolute_expiry_time,
        creation_time: properties.creation_time,
        message_annotations: annotations,
        delivery_annotations: amqp
            .delivery_annotations
            .map(|DeliveryAnnotations(a)| a)
            .unwrap_or_default(),
        application_properties: amqp
            .application_properties
            .map(|ApplicationProperties(map)| map)
            .unwrap_or_default(),
        body,
    })
}

fn resolve_body(
    code: Option<u8>,
    is_serialized_object: bool,
    body: Body<Value>,
) -> Result<JmsBody, CodecError> {
    match code {
        Some(JMS_MESSAGE) => match body {
            Body::Value(AmqpValue(Value::Null)) | Body::Empty => Ok(JmsBody::Empty),
            _ => Err(CodecError::UnexpectedBody { flavour: "message" }),
        },
        Some(JMS_TEXT_MESSAGE) => match body {
            Body::Value(AmqpValue(Value::String(text))) => Ok(JmsBody::Text(Some(text))),
            Body::Value(AmqpValue(Value::Null)) | Body::Empty => Ok(JmsBody::Text(None)),
            _ => Err(CodecError::UnexpectedBody { flavour: "text" }),
        },
        Some(JMS_BYTES_MESSAGE) => match body {
            Body::Data(batch) => Ok(JmsBody::Bytes(collect_data(batch))),
            _ => Err(CodecError::UnexpectedBody { flavour: "bytes" }),
        },
        Some(JMS_MAP_MESSAGE) => match body {
            Body::Value(AmqpValue(value)) => Ok(JmsBody::Map(value_to_string_map(value)?)),
            _ => Err(CodecError::UnexpectedBody { flavour: "map" }),
        },
        Some(JMS_STREAM_MESSAGE) => match body {
            Body::Sequence(batch) => Ok(JmsBody::Stream(collect_sequences(batch))),
            Body::Value(AmqpValue(Value::List(values))) => Ok(JmsBody::Stream(values)),
            _ => Err(CodecError::UnexpectedBody { flavour: "stream" }),
        },
        Some(JMS_OBJECT_MESSAGE) => match body {
            Body::Data(batch) => Ok(JmsBody::ObjectSerialized(collect_data(batch))),
            Body::Value(AmqpValue(value)) => Ok(JmsBody::ObjectTyped(value)),
            Body::Sequence(batch) => {
                Ok(JmsBody::ObjectTyped(Value::List(collect_sequences(batch))))
            }
            Body::Empty => Err(CodecError::UnexpectedBody { flavour: "object" }),
        },
        // Unknown codes fall back to the untagged resolution
        Some(_) | None => match body {
            Body::Data(batch) => match is_serialized_object {
                true => Ok(JmsBody::ObjectSerialized(collect_data(batch))),
                false => Ok(JmsBody::Bytes(collect_data(batch))),
            },
            Body::Sequence(batch) => Ok(JmsBody::Stream(collect_sequences(batch))),
            Body::Value(AmqpValue(Value::Null)) | Body::Empty => Ok(JmsBody::Empty),
            Body::Value(AmqpValue(Value::String(text))) => Ok(JmsBody::Text(Some(text))),
            Body::Value(AmqpValue(value @ Value::Map(_))) => {
                Ok(JmsBody::Map(value_to_string_map(value)?))
            }
            Body::Value(AmqpValue(value)) => Ok(JmsBody::ObjectTyped(value)),
        },
    }
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp_types::messaging::message::__private::Deserializable;
    use fe2o3_amqp_types::messaging::{AmqpValue, Body, Message};
    use fe2o3_amqp_types::primitives::{Symbol, Value};
    use serde_amqp::primitives::OrderedMap;

    use super::{decode, encode, from_amqp, to_amqp};
    use crate::constants::{JMS_MSG_TYPE, SERIALIZED_OBJECT_CONTENT_TYPE};
    use crate::message::{JmsBody, JmsMessage};

    fn round_trip(message: JmsMessage) -> JmsMessage {
        decode(&encode(&message).unwrap()).unwrap()
    }

    #[test]
    fn serialized_object_gets_data_section_and_content_type() {
        let blob = serde_amqp::to_vec(&"myObjectString").unwrap();
        let amqp = to_amqp(&JmsMessage::object_bytes(blob.clone())).unwrap();

        assert!(amqp.header.as_ref().unwrap().durable);
        let content_type = amqp
            .properties
            .as_ref()
            .unwrap()
            .content_type
            .as_ref()
            .unwrap();
        assert_eq!(content_type.0, SERIALIZED_OBJECT_CONTENT_TYPE);
        match &amqp.body {
            Body::Data(batch) => {
                let data: Vec<_> = batch.iter().collect();
                assert_eq!(data.len(), 1);
                assert_eq!(&data[0].0[..], blob.as_slice());
            }
            other => panic!("expected data section, got {:?}", other),
        }
    }

    #[test]
    fn typed_object_gets_value_section_without_content_type() {
        let mut map = OrderedMap::new();
        map.insert(
            Value::String("key".to_string()),
            Value::String("myObjectString".to_string()),
        );
        let amqp = to_amqp(&JmsMessage::object_typed(Value::Map(map.clone()))).unwrap();

        assert_eq!(amqp.properties.as_ref().unwrap().content_type, None);
        match &amqp.body {
            Body::Value(AmqpValue(Value::Map(m))) => assert_eq!(m, &map),
            other => panic!("expected amqp-value map, got {:?}", other),
        }
    }

    #[test]
    fn msg_type_annotation_is_always_stamped() {
        use fe2o3_amqp_types::messaging::annotations::OwnedKey;

        let amqp = to_amqp(&JmsMessage::text("hello")).unwrap();
        let annotations = &amqp.message_annotations.as_ref().unwrap().0;
        assert_eq!(
            annotations.get(&OwnedKey::from(JMS_MSG_TYPE)),
            Some(&serde_amqp::to_value(&5u8).unwrap())
        );
    }

    #[test]
    fn annotation_dominates_section_kind_on_receive() {
        use fe2o3_amqp_types::messaging::annotations::{Annotations, OwnedKey};
        use fe2o3_amqp_types::messaging::MessageAnnotations;

        // An amqp-value map with the object tag decodes as a typed object,
        // not as a map message
        let mut map = OrderedMap::new();
        map.insert(
            Value::String("key".to_string()),
            Value::String("myObjectString".to_string()),
        );
        let mut annotations = Annotations::new();
        annotations.insert(
            OwnedKey::from(JMS_MSG_TYPE),
            serde_amqp::to_value(&1u8).unwrap(),
        );

        let amqp: Message<Body<Value>> = Message {
            header: None,
            delivery_annotations: None,
            message_annotations: Some(MessageAnnotations(annotations)),
            properties: None,
            application_properties: None,
            body: Body::Value(AmqpValue(Value::Map(map.clone()))),
            footer: None,
        };
        let message = from_amqp(amqp).unwrap();
        assert_eq!(message.body, JmsBody::ObjectTyped(Value::Map(map)));
    }

    #[test]
    fn untagged_data_with_reserved_content_type_is_a_serialized_object() {
        let blob = serde_amqp::to_vec(&"expectedContent").unwrap();
        let message = JmsMessage::object_bytes(blob.clone());
        let payload = encode(&message).unwrap();

        // Strip the annotation by decoding and re-resolving from the
        // content-type alone
        let Deserializable(mut amqp): Deserializable<Message<Body<Value>>> =
            serde_amqp::from_reader(&payload[..]).unwrap();
        amqp.message_annotations = None;
        let resolved = from_amqp(amqp).unwrap();
        assert_eq!(resolved.body, JmsBody::ObjectSerialized(blob.into()));
    }

    #[test]
    fn body_flavours_round_trip() {
        let mut map = OrderedMap::new();
        map.insert("speed".to_string(), Value::Int(42));

        assert_eq!(
            round_trip(JmsMessage::text("hello")).body,
            JmsBody::Text(Some("hello".to_string()))
        );
        assert_eq!(
            round_trip(JmsMessage::bytes(&b"\x01\x02"[..])).body,
            JmsBody::Bytes(bytes::Bytes::from_static(b"\x01\x02"))
        );
        assert_eq!(
            round_trip(JmsMessage::map(map.clone())).body,
            JmsBody::Map(map)
        );
        assert_eq!(
            round_trip(JmsMessage::stream(vec![Value::Bool(true), Value::Int(-3)])).body,
            JmsBody::Stream(vec![Value::Bool(true), Value::Int(-3)])
        );
        assert_eq!(round_trip(JmsMessage::empty()).body, JmsBody::Empty);
    }

    #[test]
    fn metadata_survives_the_bridge() {
        let message = JmsMessage::text("payload")
            .subject("orders")
            .to("orders-queue")
            .reply_to("replies")
            .group_id("g-1")
            .message_id("m-1".to_string())
            .correlation_id("c-1".to_string())
            .ttl(60_000)
            .priority(7)
            .property("attempt", 2i32);

        let decoded = round_trip(message.clone());
        assert_eq!(decoded, message);
        assert_eq!(
            decoded.content_type, None,
            "text bodies carry no content-type"
        );
    }

    #[test]
    fn text_flavour_with_data_section_is_rejected() {
        use fe2o3_amqp_types::messaging::annotations::{Annotations, OwnedKey};
        use fe2o3_amqp_types::messaging::{Batch, Data, MessageAnnotations};
        use fe2o3_amqp_types::primitives::Binary;

        let mut annotations = Annotations::new();
        annotations.insert(
            OwnedKey::from(JMS_MSG_TYPE),
            serde_amqp::to_value(&5u8).unwrap(),
        );
        let amqp: Message<Body<Value>> = Message {
            header: None,
            delivery_annotations: None,
            message_annotations: Some(MessageAnnotations(annotations)),
            properties: None,
            application_properties: None,
            body: Body::Data(Batch::new(vec![Data(Binary::from(vec![1, 2, 3]))])),
            footer: None,
        };
        assert!(from_amqp(amqp).is_err());
    }

    #[test]
    fn decode_rejects_symbolless_garbage() {
        assert!(decode(&[0xAB, 0xCD]).is_err());
    }

    #[test]
    fn received_content_type_is_surfaced() {
        let blob = vec![9u8; 4];
        let decoded = round_trip(JmsMessage::object_bytes(blob));
        assert_eq!(
            decoded.content_type,
            Some(Symbol::from(SERIALIZED_OBJECT_CONTENT_TYPE))
        );
    }
}
