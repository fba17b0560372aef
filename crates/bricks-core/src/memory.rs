//! In-process transport.
//!
//! The worker body runs as a tokio task and talks to the host through two
//! unbounded single-producer/single-consumer queues. Used mostly in tests
//! and for workers that need no isolation.

use std::future::Future;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelId, ChannelState, RemoteTerminated};
use crate::error::{Error, Result};
use crate::message::Message;

/// Boxed worker body, as accepted by [`MemoryChannel::from_body`].
pub type WorkerBody =
    Box<dyn FnOnce(MemoryEndpoint, CancellationToken) -> BoxFuture<'static, Result<()>> + Send>;

/// Host side of an in-process channel.
pub struct MemoryChannel {
    id: ChannelId,
    state: ChannelState,
    body: Option<WorkerBody>,
    queues: Option<Queues>,
    shutdown: Option<CancellationToken>,
    monitor: Option<JoinHandle<()>>,
}

impl MemoryChannel {
    /// Create a channel that will run `worker` when opened.
    ///
    /// The worker receives its end of the queues and a token that fires
    /// when the host closes the channel or cancels the open token.
    pub fn new<F, Fut>(worker: F) -> Self
    where
        F: FnOnce(MemoryEndpoint, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let body: WorkerBody = Box::new(move |endpoint, token| Box::pin(worker(endpoint, token)));
        Self::with_body(body)
    }

    /// Create a channel from an optional boxed body, as produced by
    /// registries or configuration. A missing body is rejected here,
    /// not at open time.
    pub fn from_body(body: Option<WorkerBody>) -> Result<Self> {
        let body = body.ok_or_else(|| {
            Error::InvalidArgument("memory channel requires a worker body".to_string())
        })?;
        Ok(Self::with_body(body))
    }

    fn with_body(body: WorkerBody) -> Self {
        Self {
            id: ChannelId::new(),
            state: ChannelState::Unopened,
            body: Some(body),
            queues: None,
            shutdown: None,
            monitor: None,
        }
    }

    /// Identifier used in log events.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    fn live(&mut self) -> Result<(&mut Queues, CancellationToken)> {
        self.state.ensure_open()?;
        let shutdown = self.shutdown.clone().ok_or(Error::NotOpen)?;
        if shutdown.is_cancelled() {
            self.state = ChannelState::Closed;
            self.queues = None;
            return Err(Error::Disposed);
        }
        let queues = self.queues.as_mut().ok_or(Error::Disposed)?;
        Ok((queues, shutdown))
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn open(&mut self, cancel: CancellationToken) -> Result<RemoteTerminated> {
        self.state.ensure_unopened()?;
        let body = self.body.take().ok_or(Error::Disposed)?;
        self.state.begin_open()?;

        let (to_worker, worker_rx) = unbounded_channel();
        let (worker_tx, from_worker) = unbounded_channel();
        self.queues = Some(Queues {
            tx: to_worker,
            rx: from_worker,
        });

        let shutdown = cancel.child_token();
        self.shutdown = Some(shutdown.clone());

        let endpoint = MemoryEndpoint {
            state: ChannelState::Open,
            queues: Some(Queues {
                tx: worker_tx,
                rx: worker_rx,
            }),
            shutdown: shutdown.clone(),
        };

        let mut worker = tokio::spawn(body(endpoint, shutdown.clone()));
        let (termination, terminated) = RemoteTerminated::pair();
        let id = self.id;
        tracing::debug!(channel = %id, "memory worker started");

        self.monitor = Some(tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    worker.abort();
                    if cancel.is_cancelled() {
                        tracing::debug!(channel = %id, "memory worker cancelled");
                        Err(Error::Cancelled)
                    } else {
                        tracing::debug!(channel = %id, "memory worker stopped by close");
                        Err(Error::RemoteKilled)
                    }
                }
                joined = &mut worker => match joined {
                    Ok(result) => result,
                    Err(e) => Err(Error::RemoteFaulted(format!("worker task failed: {}", e))),
                },
            };
            termination.resolve(outcome);
        }));

        Ok(terminated)
    }

    async fn close(&mut self) -> Result<()> {
        if !self.state.begin_close()? {
            return Ok(());
        }

        if let Some(shutdown) = &self.shutdown {
            shutdown.cancel();
        }
        // Completes the host-to-worker queue, then releases the receiver.
        self.queues = None;

        if let Some(monitor) = self.monitor.take() {
            if let Err(e) = monitor.await {
                tracing::warn!(channel = %self.id, "memory monitor failed: {}", e);
            }
        }
        tracing::debug!(channel = %self.id, "memory channel closed");
        Ok(())
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        let (queues, _) = self.live()?;
        queues.send(message)
    }

    async fn receive(&mut self) -> Result<Message> {
        let (queues, shutdown) = self.live()?;
        let outcome = queues.receive(&shutdown).await;
        if matches!(outcome, Err(Error::Cancelled)) {
            self.state = ChannelState::Closed;
            self.queues = None;
        }
        outcome
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if let Some(shutdown) = &self.shutdown {
            shutdown.cancel();
        }
    }
}

/// Worker side of an in-process channel.
///
/// Handed to the worker body already open; `open` on it fails with
/// [`Error::AlreadyOpen`].
pub struct MemoryEndpoint {
    state: ChannelState,
    queues: Option<Queues>,
    shutdown: CancellationToken,
}

#[async_trait]
impl Channel for MemoryEndpoint {
    async fn open(&mut self, _cancel: CancellationToken) -> Result<RemoteTerminated> {
        self.state.ensure_unopened()?;
        Err(Error::AlreadyOpen)
    }

    async fn close(&mut self) -> Result<()> {
        self.state.begin_close()?;
        self.queues = None;
        Ok(())
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        self.state.ensure_open()?;
        self.queues.as_mut().ok_or(Error::Disposed)?.send(message)
    }

    async fn receive(&mut self) -> Result<Message> {
        self.state.ensure_open()?;
        let shutdown = self.shutdown.clone();
        self.queues
            .as_mut()
            .ok_or(Error::Disposed)?
            .receive(&shutdown)
            .await
    }
}

/// One direction out, one direction in.
struct Queues {
    tx: UnboundedSender<Message>,
    rx: UnboundedReceiver<Message>,
}

impl Queues {
    fn send(&self, message: Message) -> Result<()> {
        self.tx.send(message).map_err(|_| Error::ConnectionClosed)
    }

    async fn receive(&mut self, shutdown: &CancellationToken) -> Result<Message> {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(Error::Cancelled),
            message = self.rx.recv() => message.ok_or(Error::ConnectionClosed),
        }
    }
}
