//! Binds the frame codecs onto a duplex byte stream.
//!
//! Layering: `LengthDelimitedCodec` strips the 4-byte size prefix, the
//! frame codecs in [`crate::frames`] handle the rest. The transport also
//! carries the inbound idle-timeout watchdog, reset on every received
//! frame.

use std::{pin::Pin, task::Poll, time::Duration};

use bytes::{Bytes, BytesMut};
use futures_util::{Future, Sink, SinkExt, Stream, StreamExt};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, Sleep};
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};

use fe2o3_amqp_types::sasl::SaslCode;

use crate::frames::{amqp, sasl};
use crate::sasl_profile::SaslProfile;

mod error;
pub use error::{Error, NegotiationError};

pub mod protocol_header;
pub use protocol_header::ProtocolHeader;

fn length_delimited_codec(max_frame_size: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        // The size field counts itself
        .length_adjustment(-4)
        .max_frame_length(max_frame_size)
        .new_codec()
}

pin_project! {
    /// AMQP frame transport over a duplex byte stream.
    #[derive(Debug)]
    pub struct Transport<Io> {
        #[pin]
        framed: Framed<Io, LengthDelimitedCodec>,
        #[pin]
        idle_timeout: Option<IdleTimeout>,
    }
}

impl<Io> Transport<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// Binds the frame codec onto the stream.
    ///
    /// `idle_timeout` of zero (or `None`) disables the inbound watchdog.
    pub fn bind(io: Io, max_frame_size: usize, idle_timeout: Option<Duration>) -> Self {
        let framed = Framed::new(io, length_delimited_codec(max_frame_size));
        let idle_timeout = idle_timeout
            .filter(|duration| !duration.is_zero())
            .map(IdleTimeout::new);
        Self {
            framed,
            idle_timeout,
        }
    }

    /// Updates the maximum accepted frame size after negotiation.
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) -> &mut Self {
        self.framed.codec_mut().set_max_frame_length(max_frame_size);
        self
    }

    /// Arms (or disarms, with zero) the inbound idle-timeout watchdog.
    pub fn set_idle_timeout(&mut self, duration: Duration) -> &mut Self {
        self.idle_timeout = match duration.is_zero() {
            true => None,
            false => Some(IdleTimeout::new(duration)),
        };
        self
    }

    /// Exchanges protocol headers for the given layer.
    ///
    /// The local header is written first; a peer that answers with any
    /// other header fails the negotiation.
    pub async fn negotiate(
        io: &mut Io,
        proto_header: ProtocolHeader,
    ) -> Result<ProtocolHeader, NegotiationError> {
        let outbound: [u8; 8] = proto_header.into();
        io.write_all(&outbound).await?;
        io.flush().await?;

        let mut inbound = [0u8; 8];
        io.read_exact(&mut inbound).await?;
        let incoming = ProtocolHeader::try_from(inbound)
            .map_err(NegotiationError::ProtocolHeaderMismatch)?;
        if incoming != proto_header {
            return Err(NegotiationError::ProtocolHeaderMismatch(inbound));
        }
        Ok(incoming)
    }

    /// Runs the SASL security layer to completion and hands the stream
    /// back for the subsequent AMQP layer.
    pub async fn connect_sasl(
        mut io: Io,
        hostname: Option<&str>,
        profile: SaslProfile,
    ) -> Result<Io, NegotiationError> {
        Self::negotiate(&mut io, ProtocolHeader::sasl()).await?;

        let mut framed = Framed::new(
            &mut io,
            length_delimited_codec(fe2o3_amqp_types::definitions::MIN_MAX_FRAME_SIZE as usize),
        );

        let mechanisms = match recv_sasl_frame(&mut framed).await? {
            sasl::Frame::Mechanisms(mechanisms) => mechanisms,
            _ => return Err(NegotiationError::FramingError),
        };
        let init = profile.on_mechanisms(&mechanisms, hostname)?;
        send_sasl_frame(&mut framed, sasl::Frame::Init(init)).await?;

        match recv_sasl_frame(&mut framed).await? {
            sasl::Frame::Outcome(outcome) => match outcome.code {
                SaslCode::Ok => {}
                code => {
                    return Err(NegotiationError::SaslError {
                        code,
                        additional_data: outcome.additional_data,
                    })
                }
            },
            sasl::Frame::Challenge(_) => {
                return Err(NegotiationError::SaslProfile(
                    crate::sasl_profile::Error::UnexpectedFrame("challenge"),
                ))
            }
            _ => return Err(NegotiationError::FramingError),
        }

        drop(framed);
        Ok(io)
    }
}

async fn send_sasl_frame<Io>(
    framed: &mut Framed<&mut Io, LengthDelimitedCodec>,
    frame: sasl::Frame,
) -> Result<(), NegotiationError>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    let mut bytes = BytesMut::new();
    sasl::FrameCodec {}.encode(frame, &mut bytes)?;
    framed.send(bytes.freeze()).await?;
    Ok(())
}

async fn recv_sasl_frame<Io>(
    framed: &mut Framed<&mut Io, LengthDelimitedCodec>,
) -> Result<sasl::Frame, NegotiationError>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = framed
        .next()
        .await
        .ok_or(NegotiationError::StreamClosed)??;
    sasl::FrameCodec {}
        .decode(&mut buf)?
        .ok_or(NegotiationError::FramingError)
}

impl<Io> Sink<amqp::Frame> for Transport<Io>
where
    Io: AsyncWrite + Unpin,
{
    type Error = Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.project().framed.poll_ready(cx).map_err(Into::into)
    }

    fn start_send(self: Pin<&mut Self>, item: amqp::Frame) -> Result<(), Self::Error> {
        let mut bytes = BytesMut::new();
        amqp::FrameCodec {}.encode(item, &mut bytes)?;
        self.project()
            .framed
            .start_send(Bytes::from(bytes))
            .map_err(Into::into)
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.project().framed.poll_flush(cx).map_err(Into::into)
    }

    fn poll_close(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.project().framed.poll_close(cx).map_err(Into::into)
    }
}

impl<Io> Stream for Transport<Io>
where
    Io: AsyncRead + Unpin,
{
    type Item = Result<amqp::Frame, Error>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.framed.poll_next(cx) {
            Poll::Ready(next) => {
                // Any inbound traffic, including empty frames, feeds the
                // watchdog
                if let Some(mut delay) = this.idle_timeout.as_pin_mut() {
                    delay.reset();
                }
                match next {
                    Some(Ok(mut src)) => Poll::Ready(
                        amqp::FrameCodec {}
                            .decode(&mut src)
                            .map_err(Error::from)
                            .transpose(),
                    ),
                    Some(Err(err)) => Poll::Ready(Some(Err(err.into()))),
                    None => Poll::Ready(None),
                }
            }
            Poll::Pending => {
                if let Some(delay) = this.idle_timeout.as_pin_mut() {
                    if delay.poll(cx).is_ready() {
                        return Poll::Ready(Some(Err(Error::IdleTimeoutElapsed)));
                    }
                }
                Poll::Pending
            }
        }
    }
}

#[derive(Debug)]
struct IdleTimeout {
    delay: Pin<Box<Sleep>>,
    duration: Duration,
}

impl IdleTimeout {
    fn new(duration: Duration) -> Self {
        Self {
            delay: Box::pin(tokio::time::sleep(duration)),
            duration,
        }
    }

    fn reset(&mut self) {
        let next = Instant::now() + self.duration;
        self.delay.as_mut().reset(next);
    }
}

impl Future for IdleTimeout {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        self.delay.as_mut().poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio_test::io::Builder;

    use super::{protocol_header::ProtocolHeader, Transport};
    use crate::frames::amqp::{Frame, FrameBody};

    #[tokio::test]
    async fn header_exchange() {
        let mut mock = Builder::new()
            .write(b"AMQP")
            .write(&[0, 1, 0, 0])
            .read(b"AMQP")
            .read(&[0, 1, 0, 0])
            .build();
        Transport::negotiate(&mut mock, ProtocolHeader::amqp())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn mismatched_header_fails() {
        let mut mock = Builder::new()
            .write(b"AMQP")
            .write(&[0, 1, 0, 0])
            .read(b"AMQP")
            .read(&[3, 1, 0, 0]) // SASL announced where AMQP was expected
            .build();
        let result = Transport::negotiate(&mut mock, ProtocolHeader::amqp()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn empty_frame_on_the_wire() {
        let mock = Builder::new()
            .write(&[0x00, 0x00, 0x00, 0x08])
            .write(&[0x02, 0x00, 0x00, 0x00])
            .build();
        let mut transport = Transport::bind(mock, 512, None);
        transport.send(Frame::empty()).await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_frames_decode_as_empty() {
        let mock = Builder::new()
            .read(&[0x00, 0x00, 0x00, 0x08])
            .read(&[0x02, 0x00, 0x00, 0x00])
            .build();
        let mut transport = Transport::bind(mock, 512, None);
        let frame = transport.next().await.unwrap().unwrap();
        assert!(matches!(frame.body, FrameBody::Empty));
    }
}
