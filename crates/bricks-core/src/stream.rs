//! Byte-stream transport.
//!
//! `StreamChannel` marshals messages across two already established byte
//! streams, one read and one written. Process transports wire the
//! streams in before opening; tests and embedders can hand any
//! `AsyncRead`/`AsyncWrite` pair to [`StreamChannel::new`].

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelId, ChannelState, RemoteTerminated};
use crate::error::{Error, Result};
use crate::frame::{FrameReader, write_frame};
use crate::message::Message;

/// Boxed inbound byte stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed outbound byte stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Channel over a pair of byte streams.
///
/// `receive` is cancel-safe: a partially read frame is kept and the next
/// `receive` resumes it, so wrapping it in `tokio::time::timeout` does not
/// desynchronize the stream. `send` is not; once a `send` future is
/// dropped mid-frame, later sends fail with [`Error::SendInterrupted`].
///
/// When opened on its own, the returned [`RemoteTerminated`] resolves
/// successfully on `close` and with [`Error::Cancelled`] if the open
/// token fires; there is no remote process to watch.
pub struct StreamChannel {
    id: ChannelId,
    state: ChannelState,
    reader: Option<BufReader<BoxedReader>>,
    frames: FrameReader,
    writer: Option<BoxedWriter>,
    /// Set while a frame is being written; still set if that write was dropped.
    writing: bool,
    /// The peer ended its outbound stream.
    peer_closed: bool,
    /// Fires on close, drop or cancellation of the open token.
    shutdown: Option<CancellationToken>,
}

impl StreamChannel {
    /// Wrap an inbound and an outbound stream.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let mut channel = Self::unwired(ChannelId::new());
        channel.attach(Box::new(reader), Box::new(writer));
        channel
    }

    /// A channel whose streams are attached later, at open time.
    pub(crate) fn unwired(id: ChannelId) -> Self {
        Self {
            id,
            state: ChannelState::Unopened,
            reader: None,
            frames: FrameReader::new(),
            writer: None,
            writing: false,
            peer_closed: false,
            shutdown: None,
        }
    }

    pub(crate) fn attach(&mut self, reader: BoxedReader, writer: BoxedWriter) {
        self.reader = Some(BufReader::new(reader));
        self.writer = Some(writer);
    }

    /// Identifier used in log events.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Whether a `receive` has seen the peer end its stream.
    pub(crate) fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    pub(crate) fn ensure_unopened(&self) -> Result<()> {
        self.state.ensure_unopened()
    }

    /// Move to `Open` and return the token that fires on shutdown.
    ///
    /// The token is a child of `cancel`, so cancelling the open token
    /// shuts the channel down too.
    pub(crate) fn activate(&mut self, cancel: &CancellationToken) -> Result<CancellationToken> {
        self.state.ensure_unopened()?;
        if self.reader.is_none() || self.writer.is_none() {
            return Err(Error::InvalidArgument(
                "stream channel opened before its streams were attached".to_string(),
            ));
        }
        self.state.begin_open()?;

        let shutdown = cancel.child_token();
        self.shutdown = Some(shutdown.clone());
        Ok(shutdown)
    }

    /// Close the channel and drop its streams.
    ///
    /// Returns `false` when the channel had already been closed.
    pub(crate) fn release(&mut self) -> Result<bool> {
        let first = self.state.begin_close()?;
        self.abandon();
        Ok(first)
    }

    /// Drop the streams and signal shutdown without lifecycle checks.
    fn abandon(&mut self) {
        if self.state == ChannelState::Open {
            self.state = ChannelState::Closed;
        }
        if let Some(shutdown) = &self.shutdown {
            shutdown.cancel();
        }
        self.reader = None;
        self.writer = None;
    }

    /// Shutdown token of an open channel, closing it if the token has fired.
    fn live_shutdown(&mut self) -> Result<CancellationToken> {
        self.state.ensure_open()?;
        let shutdown = self.shutdown.clone().ok_or(Error::NotOpen)?;
        if shutdown.is_cancelled() {
            tracing::debug!(channel = %self.id, "channel shut down, releasing streams");
            self.abandon();
            return Err(Error::Disposed);
        }
        Ok(shutdown)
    }
}

#[async_trait]
impl Channel for StreamChannel {
    async fn open(&mut self, cancel: CancellationToken) -> Result<RemoteTerminated> {
        let shutdown = self.activate(&cancel)?;
        let (termination, terminated) = RemoteTerminated::pair();
        let id = self.id;

        tokio::spawn(async move {
            shutdown.cancelled().await;
            if cancel.is_cancelled() {
                tracing::debug!(channel = %id, "stream channel cancelled");
                termination.resolve(Err(Error::Cancelled));
            } else {
                termination.resolve(Ok(()));
            }
        });

        Ok(terminated)
    }

    async fn close(&mut self) -> Result<()> {
        self.release()?;
        Ok(())
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        let shutdown = self.live_shutdown()?;
        if self.writing {
            return Err(Error::SendInterrupted);
        }
        let writer = self.writer.as_mut().ok_or(Error::Disposed)?;

        self.writing = true;
        let outcome = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            result = write_frame(writer, &message) => Some(result),
        };
        self.writing = false;

        match outcome {
            Some(result) => {
                if matches!(&result, Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe) {
                    self.peer_closed = true;
                }
                result
            }
            None => {
                self.abandon();
                Err(Error::Cancelled)
            }
        }
    }

    async fn receive(&mut self) -> Result<Message> {
        let shutdown = self.live_shutdown()?;
        let reader = self.reader.as_mut().ok_or(Error::Disposed)?;

        let outcome = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            result = self.frames.read(reader) => Some(result),
        };

        match outcome {
            Some(result) => {
                if matches!(result, Err(Error::ConnectionClosed)) {
                    self.peer_closed = true;
                }
                result
            }
            None => {
                self.abandon();
                Err(Error::Cancelled)
            }
        }
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        if let Some(shutdown) = &self.shutdown {
            shutdown.cancel();
        }
    }
}
