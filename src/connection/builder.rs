//! Connection establishment: transport negotiation, the open exchange,
//! and engine spawn.

use std::cmp::min;
use std::sync::Arc;
use std::time::Duration;

use fe2o3_amqp_types::definitions::MIN_MAX_FRAME_SIZE;
use fe2o3_amqp_types::performatives::Open;
use futures_util::{SinkExt, StreamExt};
use rand::{distributions::Alphanumeric, Rng};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use url::Url;

use crate::config::{ConfigError, ConnectionFactory, DEFAULT_IDLE_TIMEOUT};
use crate::frames::amqp::{Frame, FrameBody};
use crate::sasl_profile::SaslProfile;
use crate::transport::{ProtocolHeader, Transport};

use super::engine::ConnectionEngine;
use super::heartbeat::HeartBeat;
use super::{ConnectionHandle, ExceptionListenerSlot, OpenError, SharedOpts};

pub(crate) const DEFAULT_COMMAND_BUFFER: usize = 128;
pub(crate) const DEFAULT_MAX_FRAME_SIZE: u32 = 256 * 1024;

/// Builder of a connection.
///
/// Most callers go through
/// [`ConnectionFactory::connect`](crate::config::ConnectionFactory::connect);
/// [`open_with_stream`](Builder::open_with_stream) takes an established
/// duplex stream instead of dialing TCP.
#[derive(Debug)]
pub struct Builder<'a> {
    factory: Option<&'a ConnectionFactory>,
    container_id: Option<String>,
    max_frame_size: u32,
    idle_timeout: Duration,
}

fn generated_container_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("ID:{}", suffix)
}

impl<'a> Default for Builder<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Builder<'a> {
    /// Creates a builder with default settings.
    pub fn new() -> Self {
        Self {
            factory: None,
            container_id: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT),
        }
    }

    /// Applies a factory's configuration.
    pub fn factory(mut self, factory: &'a ConnectionFactory) -> Self {
        self.factory = factory.into();
        self
    }

    /// Overrides the container-id; the factory's client-id (or a
    /// generated id) is used otherwise.
    pub fn container_id(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    /// Overrides the maximum accepted frame size.
    pub fn max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = std::cmp::max(MIN_MAX_FRAME_SIZE as u32, max_frame_size);
        self
    }

    /// Overrides the local idle-timeout window: the connection fails
    /// when no frame arrives within it, and half of it is advertised to
    /// the peer.
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Dials the factory's remote URI and opens the connection, bounded
    /// by the configured connect timeout.
    pub async fn open(self) -> Result<ConnectionHandle, OpenError> {
        let factory = self.factory.ok_or(ConfigError::MissingUri)?;
        let uri = factory.remote_uri.as_deref().ok_or(ConfigError::MissingUri)?;
        let url = Url::parse(uri)?;
        if url.scheme() != "amqp" {
            return Err(OpenError::InvalidScheme);
        }

        let timeout = factory.connect_timeout_duration();
        let hostname = url.host_str().map(|h| h.to_string());
        let addrs = url.socket_addrs(|| Some(fe2o3_amqp_types::definitions::PORT))?;

        let open = async move {
            let stream = TcpStream::connect(&*addrs).await?;
            self.open_with_stream_inner(stream, hostname.as_deref()).await
        };
        match tokio::time::timeout(timeout, open).await {
            Ok(result) => result,
            Err(_elapsed) => Err(OpenError::Timeout),
        }
    }

    /// Opens the connection over an already-established stream.
    pub async fn open_with_stream<Io>(self, stream: Io) -> Result<ConnectionHandle, OpenError>
    where
        Io: AsyncRead + AsyncWrite + std::fmt::Debug + Send + Unpin + 'static,
    {
        self.open_with_stream_inner(stream, None).await
    }

    async fn open_with_stream_inner<Io>(
        self,
        stream: Io,
        hostname: Option<&str>,
    ) -> Result<ConnectionHandle, OpenError>
    where
        Io: AsyncRead + AsyncWrite + std::fmt::Debug + Send + Unpin + 'static,
    {
        let default_factory = ConnectionFactory::default();
        let factory = self.factory.unwrap_or(&default_factory);

        // SASL security layer, only when credentials are configured
        let mut stream = match &factory.username {
            Some(username) => {
                let profile =
                    SaslProfile::from_credentials(Some(username), factory.password.as_deref());
                Transport::connect_sasl(stream, hostname, profile).await?
            }
            None => stream,
        };

        Transport::negotiate(&mut stream, ProtocolHeader::amqp()).await?;
        let mut transport = Transport::bind(
            stream,
            self.max_frame_size as usize,
            Some(self.idle_timeout),
        );

        let container_id = self
            .container_id
            .or_else(|| factory.client_id.clone())
            .unwrap_or_else(generated_container_id);

        let idle_millis = self.idle_timeout.as_millis() as u32;
        let local_open = Open {
            container_id,
            hostname: hostname.map(Into::into),
            max_frame_size: self.max_frame_size.into(),
            channel_max: Default::default(),
            // Half the actual threshold, to spare the peer spurious
            // timeouts
            idle_time_out: Some(idle_millis / 2),
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        let channel_max = local_open.channel_max.0;

        transport
            .send(Frame::new(0, FrameBody::Open(local_open)))
            .await?;

        // Wait for the answering open; heartbeats cannot start yet and
        // anything else is a protocol violation
        let remote_open = loop {
            let frame = match transport.next().await {
                Some(frame) => frame?,
                None => return Err(OpenError::RemoteClosed { error: None }),
            };
            match frame.body {
                FrameBody::Open(open) => break open,
                FrameBody::Close(close) => {
                    return Err(OpenError::RemoteClosed { error: close.error })
                }
                FrameBody::Empty => continue,
                _ => return Err(OpenError::IllegalState),
            }
        };

        let max_frame_size = min(self.max_frame_size, remote_open.max_frame_size.0);
        transport.set_max_frame_size(max_frame_size as usize);

        // Keep the peer alive at half its advertised threshold
        let heartbeat = match remote_open.idle_time_out {
            Some(millis) if millis > 0 => {
                HeartBeat::new(Duration::from_millis(millis as u64 / 2))
            }
            _ => HeartBeat::never(),
        };

        let agreed_channel_max = min(channel_max, remote_open.channel_max.0);

        let opts = Arc::new(SharedOpts::from_factory(factory));
        let listener: ExceptionListenerSlot =
            Arc::new(std::sync::Mutex::new(factory.exception_listener.clone()));

        let (command_tx, command_rx) = mpsc::channel(DEFAULT_COMMAND_BUFFER);
        let engine = ConnectionEngine::new(
            transport,
            command_rx,
            heartbeat,
            listener.clone(),
            opts.clone(),
            agreed_channel_max,
        );

        Ok(ConnectionHandle {
            commands: command_tx,
            engine: engine.spawn(),
            listener,
            opts,
            closed: false,
        })
    }
}
