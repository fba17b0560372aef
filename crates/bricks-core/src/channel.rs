//! The channel contract shared by every transport.
//!
//! A channel is one-shot: it is opened at most once, carries messages in
//! both directions while open, and is unusable after `close`. Opening
//! returns a [`RemoteTerminated`] future that resolves exactly once with
//! the outcome of the remote side.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::Message;

/// Exchange of [`Message`]s with a remote worker.
///
/// Only one `send` and one `receive` may be in flight per channel.
/// Cancelling the token passed to [`Channel::open`] forces the channel
/// closed; there are no other timeouts. `receive` is cancel-safe and may be
/// wrapped in `tokio::time::timeout`. A stream-backed `send` dropped
/// mid-frame leaves the outbound side unusable and later sends fail with
/// [`Error::SendInterrupted`].
#[async_trait]
pub trait Channel: Send {
    /// Start the remote side and return a future for its termination.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyOpen`] or [`Error::Disposed`] if the channel was
    /// opened before, and [`Error::TransportStart`] if the remote could
    /// not be started. A failed open leaves the channel unopened.
    async fn open(&mut self, cancel: CancellationToken) -> Result<RemoteTerminated>;

    /// Tear the channel down, releasing every resource it owns.
    ///
    /// Fails with [`Error::NotOpen`] on a channel that was never opened;
    /// closing an already closed channel is a no-op.
    async fn close(&mut self) -> Result<()>;

    /// Send one message.
    async fn send(&mut self, message: Message) -> Result<()>;

    /// Wait for the next message from the remote.
    async fn receive(&mut self) -> Result<Message>;
}

/// Typed conveniences over [`Channel`].
#[async_trait]
pub trait ChannelExt: Channel {
    /// Send a message that carries only `command`.
    async fn send_command(&mut self, command: &str) -> Result<()> {
        self.send(Message::new(command)?).await
    }

    /// Send `payload` encoded as JSON under `command`.
    async fn send_payload<T>(&mut self, command: &str, payload: &T) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let message = Message::from_value(command, payload)?;
        self.send(message).await
    }

    /// Receive a message and require that it carries `command`.
    async fn receive_expecting(&mut self, command: &str) -> Result<Message> {
        let message = self.receive().await?;
        if message.command() != command {
            return Err(Error::ProtocolViolation {
                expected: command.to_string(),
                actual: message.command().to_string(),
            });
        }
        Ok(message)
    }

    /// Receive a message, decode its payload and require that it carries `command`.
    async fn receive_typed<T>(&mut self, command: &str) -> Result<T>
    where
        T: DeserializeOwned + Send,
    {
        let message = self.receive().await?;
        let value = message.decode::<T>()?;
        if message.command() != command {
            return Err(Error::ProtocolViolation {
                expected: command.to_string(),
                actual: message.command().to_string(),
            });
        }
        Ok(value)
    }
}

impl<C: Channel + ?Sized> ChannelExt for C {}

/// Identifier attached to a channel's log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    /// A fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Future resolved once the remote side of a channel has finished.
///
/// Resolves `Ok(())` when the remote ended gracefully, or with
/// [`Error::RemoteExit`], [`Error::RemoteKilled`], [`Error::Cancelled`]
/// or [`Error::RemoteFaulted`] otherwise. Dropping it does not affect
/// the channel.
#[must_use = "RemoteTerminated reports the remote's outcome"]
pub struct RemoteTerminated {
    rx: oneshot::Receiver<Result<()>>,
}

/// Producer half of [`RemoteTerminated`]. Consumed on resolution, so the
/// future can only ever be resolved once.
pub(crate) struct Termination {
    tx: oneshot::Sender<Result<()>>,
}

impl RemoteTerminated {
    pub(crate) fn pair() -> (Termination, RemoteTerminated) {
        let (tx, rx) = oneshot::channel();
        (Termination { tx }, RemoteTerminated { rx })
    }
}

impl Termination {
    pub(crate) fn resolve(self, outcome: Result<()>) {
        // The host may have dropped the future; nobody is left to tell.
        let _ = self.tx.send(outcome);
    }
}

impl Future for RemoteTerminated {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::RemoteFaulted(
                "remote monitor ended without reporting an outcome".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for RemoteTerminated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTerminated").finish_non_exhaustive()
    }
}

/// Lifecycle position of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unopened,
    Open,
    Closed,
}

impl ChannelState {
    /// Check that `open` is allowed and move to `Open`.
    pub(crate) fn begin_open(&mut self) -> Result<()> {
        match self {
            ChannelState::Unopened => {
                *self = ChannelState::Open;
                Ok(())
            }
            ChannelState::Open => Err(Error::AlreadyOpen),
            ChannelState::Closed => Err(Error::Disposed),
        }
    }

    /// Check that the channel may carry messages.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        match self {
            ChannelState::Open => Ok(()),
            ChannelState::Unopened => Err(Error::NotOpen),
            ChannelState::Closed => Err(Error::Disposed),
        }
    }

    /// Check that `open` would be allowed, without changing state.
    pub(crate) fn ensure_unopened(&self) -> Result<()> {
        match self {
            ChannelState::Unopened => Ok(()),
            ChannelState::Open => Err(Error::AlreadyOpen),
            ChannelState::Closed => Err(Error::Disposed),
        }
    }

    /// Move to `Closed`. Returns `false` if the channel was already closed.
    pub(crate) fn begin_close(&mut self) -> Result<bool> {
        match self {
            ChannelState::Unopened => Err(Error::NotOpen),
            ChannelState::Open => {
                *self = ChannelState::Closed;
                Ok(true)
            }
            ChannelState::Closed => Ok(false),
        }
    }
}
