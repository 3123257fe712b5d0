//! The connection: handshake, engine task, and application handle.
//!
//! [`ConnectionHandle`] is the application's entry point after
//! [`ConnectionFactory::connect`](crate::config::ConnectionFactory::connect).
//! All protocol state lives on the engine task spawned at open; the
//! handle posts commands and awaits completions.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{ConnectionFactory, PrefetchPolicy, RedeliveryPolicy};
use crate::control::Command;
use crate::requests::AsyncRequest;
use crate::session::{AckMode, BeginError, SessionHandle};

pub mod builder;
pub use builder::Builder;

mod error;
pub use error::{
    CloseError, ConnectionException, ExceptionListener, OpenError, UnsubscribeError,
};
pub(crate) use error::ExceptionListenerSlot;

pub(crate) mod engine;
mod heartbeat;

/// Entry point for opening connections without a factory.
#[derive(Debug)]
pub struct Connection {}

impl Connection {
    /// Creates a connection builder.
    pub fn builder<'a>() -> Builder<'a> {
        Builder::new()
    }
}

/// Connection-wide behavior toggles shared by every handle, resolved
/// from the factory at open.
#[derive(Debug)]
pub(crate) struct SharedOpts {
    pub force_sync_send: bool,
    pub force_async_send: bool,
    pub force_async_acks: bool,
    pub local_message_priority: bool,
    pub prefetch: PrefetchPolicy,
    pub redelivery: RedeliveryPolicy,
    pub close_timeout: Duration,
}

impl SharedOpts {
    pub fn from_factory(factory: &ConnectionFactory) -> Self {
        Self {
            force_sync_send: factory.force_sync_send,
            force_async_send: factory.force_async_send,
            force_async_acks: factory.force_async_acks,
            local_message_priority: factory.local_message_priority,
            prefetch: factory.prefetch_policy.clone(),
            redelivery: factory.redelivery_policy.clone(),
            close_timeout: factory.close_timeout_duration(),
        }
    }
}

/// Application handle of an open connection.
///
/// Dropping the handle closes the connection in the background; use
/// [`close`](Self::close) to observe the outcome.
pub struct ConnectionHandle {
    pub(crate) commands: mpsc::Sender<Command>,
    pub(crate) engine: JoinHandle<()>,
    pub(crate) listener: ExceptionListenerSlot,
    pub(crate) opts: Arc<SharedOpts>,
    pub(crate) closed: bool,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Begins a session with the given acknowledgement policy.
    pub async fn begin_session(&mut self, ack_mode: AckMode) -> Result<SessionHandle, BeginError> {
        let (responder, rx) = AsyncRequest::new();
        self.commands
            .send(Command::Begin {
                ack_mode,
                responder,
            })
            .await
            .map_err(|_| BeginError::ConnectionClosed)?;
        let session = rx.await.map_err(|_| BeginError::ConnectionClosed)??;
        Ok(SessionHandle {
            commands: self.commands.clone(),
            session,
            ack_mode,
            opts: self.opts.clone(),
            ended: false,
        })
    }

    /// Removes a durable subscription at the broker.
    ///
    /// Only valid while no consumer holds the subscription. Fails with
    /// [`UnsubscribeError::InvalidDestination`] when the broker does not
    /// retain a subscription with that name.
    pub async fn unsubscribe(&mut self, name: impl Into<String>) -> Result<(), UnsubscribeError> {
        let (responder, rx) = AsyncRequest::new();
        self.commands
            .send(Command::Unsubscribe {
                name: name.into(),
                responder,
            })
            .await
            .map_err(|_| UnsubscribeError::ConnectionClosed)?;
        rx.await.map_err(|_| UnsubscribeError::ConnectionClosed)?
    }

    /// Registers (or, with `None`, clears) the listener invoked on the
    /// engine task for asynchronous connection errors.
    pub fn set_exception_listener(&self, listener: Option<ExceptionListener>) {
        *self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = listener;
    }

    /// Closes the connection: children are force-closed, the close
    /// performative is exchanged bounded by the configured close
    /// timeout, then the transport is dropped.
    ///
    /// On timeout the transport is torn down forcibly and
    /// [`CloseError::Timeout`] is returned.
    pub async fn close(mut self) -> Result<(), CloseError> {
        self.closed = true;
        let (responder, rx) = AsyncRequest::new();
        self.commands
            .send(Command::Close { responder })
            .await
            .map_err(|_| CloseError::ConnectionClosed)?;

        match tokio::time::timeout(self.opts.close_timeout, rx).await {
            Ok(result) => result.map_err(|_| CloseError::ConnectionClosed)?,
            Err(_elapsed) => {
                self.engine.abort();
                Err(CloseError::Timeout)
            }
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.commands.try_send(Command::Close {
                responder: AsyncRequest::noop(),
            });
        }
    }
}
