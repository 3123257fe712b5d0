//! End-to-end protocol tests against a scripted peer.

mod common;

use std::time::Duration;

use fe2o3_amqp_types::definitions::Role;
use fe2o3_amqp_types::messaging::annotations::{Annotations, OwnedKey};
use fe2o3_amqp_types::messaging::{
    Accepted, AmqpValue, Body, DeliveryState, MessageAnnotations, Source,
};
use fe2o3_amqp_types::primitives::Value;
use serde_amqp::primitives::OrderedMap;

use galena::connection::{Connection, ConnectionHandle, UnsubscribeError};
use galena::frames::amqp::{Frame, FrameBody};
use galena::link::{ReceiverOpts, SenderOpts};
use galena::message::codec;
use galena::{AckMode, JmsBody, JmsMessage};

use common::{decode_sections, TestPeer};

const MSG_TYPE_KEY: &str = "x-opt-jms-msg-type";
const SERIALIZED_CONTENT_TYPE: &str = "application/x-java-serialized-object";

async fn connected() -> (ConnectionHandle, TestPeer) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let open = tokio::spawn(Connection::builder().open_with_stream(client_io));
    let peer = TestPeer::accept(server_io).await;
    let connection = open.await.unwrap().unwrap();
    (connection, peer)
}

#[tokio::test]
async fn open_and_close() {
    let (connection, mut peer) = connected().await;

    let closing = tokio::spawn(connection.close());
    peer.expect_close_and_answer().await;
    closing.await.unwrap().unwrap();
}

#[tokio::test]
async fn send_serialized_object_message() {
    let (mut connection, mut peer) = connected().await;

    let beginning = tokio::spawn(async move {
        let mut session = connection.begin_session(AckMode::Auto).await.unwrap();
        let sender = session
            .attach_sender(SenderOpts::new("myQueue"))
            .await
            .unwrap();
        (connection, session, sender)
    });
    let channel = peer.expect_begin().await;
    let (attach_channel, attach) = peer.expect_attach().await;
    assert_eq!(attach_channel, channel);
    assert!(matches!(attach.role, Role::Sender));
    assert!(attach.target.is_some());
    let handle = peer
        .answer_attach(channel, &attach, Some(Source::builder().build()))
        .await;
    peer.grant_credit(channel, handle, 100).await;
    let (_connection, _session, mut sender) = beginning.await.unwrap();

    let blob = serde_amqp::to_vec(&"myObjectString").unwrap();
    let expected = blob.clone();
    let sending = tokio::spawn(async move {
        sender
            .send(JmsMessage::object_bytes(blob))
            .await
            .map(|()| sender)
    });

    let (_, transfer, payload) = peer.expect_transfer().await;
    assert_eq!(transfer.delivery_id, Some(0));
    assert_eq!(transfer.settled, Some(false));

    let sections = decode_sections(&payload);
    assert!(sections.header.as_ref().unwrap().durable);
    let annotations = sections.message_annotations.as_ref().unwrap();
    assert_eq!(
        annotations.0.get(&OwnedKey::from(MSG_TYPE_KEY)),
        Some(&serde_amqp::to_value(&1u8).unwrap())
    );
    let content_type = sections
        .properties
        .as_ref()
        .unwrap()
        .content_type
        .as_ref()
        .unwrap();
    assert_eq!(content_type.0, SERIALIZED_CONTENT_TYPE);
    match &sections.body {
        Body::Data(batch) => {
            let data: Vec<_> = batch.iter().collect();
            assert_eq!(data.len(), 1);
            assert_eq!(&data[0].0[..], expected.as_slice());
        }
        other => panic!("expected a data section, got {:?}", other),
    }

    // Settle the delivery: the synchronous send returns
    peer.send_frame(Frame::new(
        channel,
        FrameBody::Disposition(fe2o3_amqp_types::performatives::Disposition {
            role: Role::Receiver,
            first: 0,
            last: None,
            settled: true,
            state: Some(DeliveryState::Accepted(Accepted {})),
            batchable: false,
        }),
    ))
    .await;
    sending.await.unwrap().unwrap();
}

#[tokio::test]
async fn send_typed_object_message() {
    let (mut connection, mut peer) = connected().await;

    let beginning = tokio::spawn(async move {
        let mut session = connection.begin_session(AckMode::Auto).await.unwrap();
        let sender = session
            .attach_sender(SenderOpts::new("myQueue"))
            .await
            .unwrap();
        (connection, session, sender)
    });
    let channel = peer.expect_begin().await;
    let (_, attach) = peer.expect_attach().await;
    let handle = peer
        .answer_attach(channel, &attach, Some(Source::builder().build()))
        .await;
    peer.grant_credit(channel, handle, 100).await;
    let (_connection, _session, mut sender) = beginning.await.unwrap();

    let mut map = OrderedMap::new();
    map.insert(
        Value::String("key".to_string()),
        Value::String("myObjectString".to_string()),
    );
    let body = Value::Map(map.clone());
    let sending =
        tokio::spawn(async move { sender.send(JmsMessage::object_typed(body)).await.map(|()| sender) });

    let (_, _, payload) = peer.expect_transfer().await;
    let sections = decode_sections(&payload);
    // Typed object bodies travel as a single amqp-value and carry no
    // content-type
    assert_eq!(sections.properties.as_ref().unwrap().content_type, None);
    match &sections.body {
        Body::Value(AmqpValue(Value::Map(sent))) => assert_eq!(sent, &map),
        other => panic!("expected an amqp-value map, got {:?}", other),
    }

    peer.send_frame(Frame::new(
        channel,
        FrameBody::Disposition(fe2o3_amqp_types::performatives::Disposition {
            role: Role::Receiver,
            first: 0,
            last: None,
            settled: true,
            state: Some(DeliveryState::Accepted(Accepted {})),
            batchable: false,
        }),
    ))
    .await;
    sending.await.unwrap().unwrap();
}

#[tokio::test]
async fn receive_serialized_object_message_and_auto_ack() {
    let (mut connection, mut peer) = connected().await;

    let beginning = tokio::spawn(async move {
        let mut session = connection.begin_session(AckMode::Auto).await.unwrap();
        let receiver = session
            .attach_receiver(ReceiverOpts::new("myQueue").prefetch(10))
            .await
            .unwrap();
        (connection, session, receiver)
    });
    let channel = peer.expect_begin().await;
    let (_, attach) = peer.expect_attach().await;
    assert!(matches!(attach.role, Role::Receiver));
    let handle = peer
        .answer_attach(channel, &attach, Some(Source::builder().address("myQueue").build()))
        .await;
    // The prefetch budget arrives as the initial flow
    let flow = peer.expect_link_flow().await;
    assert_eq!(flow.link_credit, Some(10));
    let (_connection, _session, mut receiver) = beginning.await.unwrap();

    let expected = serde_amqp::to_vec(&"expectedContent").unwrap();
    let inbound = codec::encode(&JmsMessage::object_bytes(expected.clone())).unwrap();
    peer.deliver(channel, handle, 0, inbound).await;

    let delivery = receiver
        .recv_timeout(Duration::from_secs(1))
        .await
        .unwrap()
        .expect("no delivery arrived");
    assert_eq!(
        delivery.message.body,
        JmsBody::ObjectSerialized(expected.into())
    );

    // Auto-acknowledge: an accepted, settled disposition follows the
    // dispatch
    let disposition = peer.expect_disposition().await;
    assert!(matches!(disposition.role, Role::Receiver));
    assert_eq!(disposition.first, 0);
    assert!(disposition.settled);
    assert!(matches!(
        disposition.state,
        Some(DeliveryState::Accepted(_))
    ));
}

#[tokio::test]
async fn receive_typed_object_message_by_annotation() {
    let (mut connection, mut peer) = connected().await;

    let beginning = tokio::spawn(async move {
        let mut session = connection.begin_session(AckMode::Auto).await.unwrap();
        let receiver = session
            .attach_receiver(ReceiverOpts::new("myQueue").prefetch(10))
            .await
            .unwrap();
        (connection, session, receiver)
    });
    let channel = peer.expect_begin().await;
    let (_, attach) = peer.expect_attach().await;
    let handle = peer
        .answer_attach(channel, &attach, Some(Source::builder().address("myQueue").build()))
        .await;
    peer.expect_link_flow().await;
    let (_connection, _session, mut receiver) = beginning.await.unwrap();

    // A bare amqp-value map tagged as an object message via the
    // annotation alone
    let mut map = OrderedMap::new();
    map.insert(
        Value::String("key".to_string()),
        Value::String("myObjectString".to_string()),
    );
    let mut annotations = Annotations::new();
    annotations.insert(
        OwnedKey::from(MSG_TYPE_KEY),
        serde_amqp::to_value(&1u8).unwrap(),
    );
    let message = fe2o3_amqp_types::messaging::Message {
        header: None,
        delivery_annotations: None,
        message_annotations: Some(MessageAnnotations(annotations)),
        properties: None,
        application_properties: None,
        body: Body::Value(AmqpValue(Value::Map(map.clone()))),
        footer: None,
    };
    let mut payload = Vec::new();
    {
        use fe2o3_amqp_types::messaging::message::__private::Serializable;
        use serde::Serialize;
        let mut serializer = serde_amqp::ser::Serializer::from(&mut payload);
        Serializable(message).serialize(&mut serializer).unwrap();
    }
    peer.deliver(channel, handle, 0, payload.into()).await;

    let delivery = receiver
        .recv_timeout(Duration::from_secs(1))
        .await
        .unwrap()
        .expect("no delivery arrived");
    assert_eq!(delivery.message.body, JmsBody::ObjectTyped(Value::Map(map)));
    peer.expect_disposition().await;
}

#[tokio::test]
async fn receive_then_resend_is_bit_identical() {
    let (mut connection, mut peer) = connected().await;

    let beginning = tokio::spawn(async move {
        let mut session = connection.begin_session(AckMode::Auto).await.unwrap();
        let receiver = session
            .attach_receiver(ReceiverOpts::new("myQueue").prefetch(10))
            .await
            .unwrap();
        (connection, session, receiver)
    });
    let channel = peer.expect_begin().await;
    let (_, attach) = peer.expect_attach().await;
    let receiver_handle = peer
        .answer_attach(channel, &attach, Some(Source::builder().address("myQueue").build()))
        .await;
    peer.expect_link_flow().await;
    let (_connection, mut session, mut receiver) = beginning.await.unwrap();

    let original = serde_amqp::to_vec(&"expectedContent").unwrap();
    let inbound = codec::encode(&JmsMessage::object_bytes(original.clone())).unwrap();
    peer.deliver(channel, receiver_handle, 0, inbound).await;

    let delivery = receiver
        .recv_timeout(Duration::from_secs(1))
        .await
        .unwrap()
        .expect("no delivery arrived");
    peer.expect_disposition().await;

    // Send the received message out on a new producer
    let attaching =
        tokio::spawn(async move { session.attach_sender(SenderOpts::new("myQueue")).await });
    let (_, attach) = peer.expect_attach().await;
    let sender_handle = peer
        .answer_attach(channel, &attach, Some(Source::builder().build()))
        .await;
    peer.grant_credit(channel, sender_handle, 100).await;
    let mut sender = attaching.await.unwrap().unwrap();

    let message = delivery.message.clone();
    let sending = tokio::spawn(async move { sender.send(message).await.map(|()| sender) });

    let (_, _, payload) = peer.expect_transfer().await;
    let sections = decode_sections(&payload);
    match &sections.body {
        Body::Data(batch) => {
            let data: Vec<_> = batch.iter().collect();
            assert_eq!(&data[0].0[..], original.as_slice());
        }
        other => panic!("expected a data section, got {:?}", other),
    }

    peer.send_frame(Frame::new(
        channel,
        FrameBody::Disposition(fe2o3_amqp_types::performatives::Disposition {
            role: Role::Receiver,
            first: 0,
            last: None,
            settled: true,
            state: Some(DeliveryState::Accepted(Accepted {})),
            batchable: false,
        }),
    ))
    .await;
    sending.await.unwrap().unwrap();
}

#[tokio::test]
async fn unsubscribe_of_missing_subscription_fails_and_clears() {
    let (mut connection, mut peer) = connected().await;

    let unsubscribing = tokio::spawn(async move {
        let outcome = connection.unsubscribe("mySubscription").await;
        (connection, outcome)
    });

    // The hidden connection session is begun on demand
    let channel = peer.expect_begin().await;
    let (_, attach) = peer.expect_attach().await;
    assert_eq!(attach.name, "mySubscription");
    assert!(attach.source.is_none(), "reattach must not propose a source");

    // The peer did not retain the subscription: null source, then the
    // expected closing detach exchange
    let handle = peer.answer_attach(channel, &attach, None).await;
    let (_, detach) = peer.expect_detach().await;
    assert!(detach.closed);
    peer.send_frame(Frame::new(
        channel,
        FrameBody::Detach(fe2o3_amqp_types::performatives::Detach {
            handle: fe2o3_amqp_types::definitions::Handle(handle),
            closed: true,
            error: None,
        }),
    ))
    .await;

    let (mut connection, outcome) = unsubscribing.await.unwrap();
    assert!(matches!(
        outcome,
        Err(UnsubscribeError::InvalidDestination(name)) if name == "mySubscription"
    ));

    // No lingering in-flight state: the same name can immediately be
    // tried again, this time against a retained subscription
    let unsubscribing = tokio::spawn(async move {
        let outcome = connection.unsubscribe("mySubscription").await;
        (connection, outcome)
    });
    let (_, attach) = peer.expect_attach().await;
    assert_eq!(attach.name, "mySubscription");
    let handle = peer
        .answer_attach(channel, &attach, Some(Source::builder().build()))
        .await;
    let (_, detach) = peer.expect_detach().await;
    assert!(detach.closed);
    peer.send_frame(Frame::new(
        channel,
        FrameBody::Detach(fe2o3_amqp_types::performatives::Detach {
            handle: fe2o3_amqp_types::definitions::Handle(handle),
            closed: true,
            error: None,
        }),
    ))
    .await;

    let (_connection, outcome) = unsubscribing.await.unwrap();
    outcome.unwrap();
}

#[tokio::test]
async fn durable_receiver_resumes_when_source_is_returned() {
    let (mut connection, mut peer) = connected().await;

    let beginning = tokio::spawn(async move {
        let mut session = connection.begin_session(AckMode::Auto).await.unwrap();
        let receiver = session
            .attach_receiver(ReceiverOpts::new("myTopic").durable("sub-1").prefetch(5))
            .await
            .unwrap();
        (connection, session, receiver)
    });
    let channel = peer.expect_begin().await;
    let (_, attach) = peer.expect_attach().await;
    // Durable subscriptions attach under their subscription name
    assert_eq!(attach.name, "sub-1");
    let _ = peer
        .answer_attach(channel, &attach, Some(Source::builder().address("myTopic").build()))
        .await;
    peer.expect_link_flow().await;

    let (_connection, _session, receiver) = beginning.await.unwrap();
    assert!(receiver.resumed());
}
