//! A scripted AMQP peer over an in-memory duplex stream.
//!
//! The peer speaks real frames through the same codecs as the client and
//! lets tests assert on exactly what reaches the wire.

use bytes::BytesMut;
use fe2o3_amqp_types::definitions::Handle;
use fe2o3_amqp_types::messaging::message::__private::Deserializable;
use fe2o3_amqp_types::messaging::{Body, Message, Source, Target};
use fe2o3_amqp_types::performatives::{
    Attach, Begin, Close, Detach, Disposition, Flow, Open, Transfer,
};
use fe2o3_amqp_types::primitives::Value;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};

use galena::frames::amqp::{Frame, FrameBody, FrameCodec};
use galena::Payload;

pub struct TestPeer {
    framed: Framed<DuplexStream, LengthDelimitedCodec>,
    next_handle: u32,
}

impl TestPeer {
    /// Performs the server side of the plain AMQP handshake: header
    /// exchange, then open/open.
    pub async fn accept(mut io: DuplexStream) -> Self {
        let mut header = [0u8; 8];
        io.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[..5], b"AMQP\x00", "expected a plain AMQP header");
        io.write_all(&header).await.unwrap();

        let framed = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(4)
            .length_adjustment(-4)
            .max_frame_length(1024 * 1024)
            .new_framed(io);
        let mut peer = Self {
            framed,
            next_handle: 0,
        };

        let open = match peer.next_frame().await.body {
            FrameBody::Open(open) => open,
            other => panic!("expected open, got {:?}", other),
        };
        assert!(!open.container_id.is_empty());

        peer.send_frame(Frame::new(
            0,
            FrameBody::Open(Open {
                container_id: "test-peer".to_string(),
                hostname: None,
                max_frame_size: open.max_frame_size,
                channel_max: open.channel_max,
                idle_time_out: None,
                outgoing_locales: None,
                incoming_locales: None,
                offered_capabilities: None,
                desired_capabilities: None,
                properties: None,
            }),
        ))
        .await;
        peer
    }

    pub async fn next_frame(&mut self) -> Frame {
        loop {
            let mut bytes = self
                .framed
                .next()
                .await
                .expect("peer stream closed")
                .expect("peer read failed");
            let frame = FrameCodec {}
                .decode(&mut bytes)
                .expect("peer frame decode failed")
                .expect("empty decode");
            // Heartbeats are not part of any script
            if !matches!(frame.body, FrameBody::Empty) {
                return frame;
            }
        }
    }

    pub async fn send_frame(&mut self, frame: Frame) {
        let mut bytes = BytesMut::new();
        FrameCodec {}.encode(frame, &mut bytes).unwrap();
        self.framed.send(bytes.freeze()).await.unwrap();
    }

    /// Answers a begin, mirroring the client's channel.
    pub async fn expect_begin(&mut self) -> u16 {
        let frame = self.next_frame().await;
        let begin = match frame.body {
            FrameBody::Begin(begin) => begin,
            other => panic!("expected begin, got {:?}", other),
        };
        assert_eq!(begin.remote_channel, None);
        let channel = frame.channel;
        self.send_frame(Frame::new(
            channel,
            FrameBody::Begin(Begin {
                remote_channel: Some(channel),
                next_outgoing_id: 0,
                incoming_window: 5000,
                outgoing_window: 5000,
                handle_max: Handle::default(),
                offered_capabilities: None,
                desired_capabilities: None,
                properties: None,
            }),
        ))
        .await;
        channel
    }

    pub async fn expect_attach(&mut self) -> (u16, Attach) {
        let frame = self.next_frame().await;
        match frame.body {
            FrameBody::Attach(attach) => (frame.channel, attach),
            other => panic!("expected attach, got {:?}", other),
        }
    }

    /// Echoes an attach back with the peer playing the opposite role.
    /// Returns the handle the peer assigned to its end of the link.
    pub async fn answer_attach(
        &mut self,
        channel: u16,
        attach: &Attach,
        source: Option<Source>,
    ) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        let role = match attach.role {
            fe2o3_amqp_types::definitions::Role::Sender => {
                fe2o3_amqp_types::definitions::Role::Receiver
            }
            fe2o3_amqp_types::definitions::Role::Receiver => {
                fe2o3_amqp_types::definitions::Role::Sender
            }
        };
        self.send_frame(Frame::new(
            channel,
            FrameBody::Attach(Attach {
                name: attach.name.clone(),
                handle: Handle(handle),
                role,
                snd_settle_mode: attach.snd_settle_mode.clone(),
                rcv_settle_mode: attach.rcv_settle_mode.clone(),
                source: source.map(Box::new),
                target: Some(Box::new(fe2o3_amqp_types::messaging::TargetArchetype::Target(
                    Target::builder().build(),
                ))),
                unsettled: None,
                incomplete_unsettled: false,
                initial_delivery_count: Some(0),
                max_message_size: None,
                offered_capabilities: None,
                desired_capabilities: None,
                properties: None,
            }),
        ))
        .await;
        handle
    }

    /// Grants `credit` to the client's sender link.
    pub async fn grant_credit(&mut self, channel: u16, handle: u32, credit: u32) {
        self.send_frame(Frame::new(
            channel,
            FrameBody::Flow(Flow {
                next_incoming_id: Some(0),
                incoming_window: 5000,
                next_outgoing_id: 0,
                outgoing_window: 5000,
                handle: Some(Handle(handle)),
                delivery_count: Some(0),
                link_credit: Some(credit),
                available: None,
                drain: false,
                echo: false,
                properties: None,
            }),
        ))
        .await;
    }

    pub async fn expect_transfer(&mut self) -> (u16, Transfer, Payload) {
        let frame = self.next_frame().await;
        match frame.body {
            FrameBody::Transfer {
                performative,
                payload,
            } => (frame.channel, performative, payload),
            other => panic!("expected transfer, got {:?}", other),
        }
    }

    /// Expects the client's flow granting link credit; returns it.
    pub async fn expect_link_flow(&mut self) -> Flow {
        let frame = self.next_frame().await;
        match frame.body {
            FrameBody::Flow(flow) => {
                assert!(flow.handle.is_some(), "expected a link-level flow");
                flow
            }
            other => panic!("expected flow, got {:?}", other),
        }
    }

    pub async fn expect_disposition(&mut self) -> Disposition {
        let frame = self.next_frame().await;
        match frame.body {
            FrameBody::Disposition(disposition) => disposition,
            other => panic!("expected disposition, got {:?}", other),
        }
    }

    pub async fn expect_detach(&mut self) -> (u16, Detach) {
        let frame = self.next_frame().await;
        match frame.body {
            FrameBody::Detach(detach) => (frame.channel, detach),
            other => panic!("expected detach, got {:?}", other),
        }
    }

    pub async fn expect_close_and_answer(&mut self) {
        let frame = self.next_frame().await;
        match frame.body {
            FrameBody::Close(_) => {}
            other => panic!("expected close, got {:?}", other),
        }
        self.send_frame(Frame::new(0, FrameBody::Close(Close { error: None })))
            .await;
    }

    /// Delivers one transfer to the client on the given peer handle.
    pub async fn deliver(&mut self, channel: u16, handle: u32, delivery_id: u32, payload: Payload) {
        self.send_frame(Frame::new(
            channel,
            FrameBody::Transfer {
                performative: Transfer {
                    handle: Handle(handle),
                    delivery_id: Some(delivery_id),
                    delivery_tag: Some(delivery_id.to_be_bytes().to_vec().into()),
                    message_format: Some(0),
                    settled: Some(false),
                    more: false,
                    rcv_settle_mode: None,
                    state: None,
                    resume: false,
                    aborted: false,
                    batchable: false,
                },
                payload,
            },
        ))
        .await;
    }
}

/// Decodes a transfer payload into wire-level message sections.
pub fn decode_sections(payload: &[u8]) -> Message<Body<Value>> {
    let Deserializable(message): Deserializable<Message<Body<Value>>> =
        serde_amqp::from_reader(payload).expect("payload decode failed");
    message
}
