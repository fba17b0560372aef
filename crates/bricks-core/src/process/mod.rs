//! Channels whose remote side is a child OS process.
//!
//! `ProcessChannel` launches the program from a [`ProcessSpec`], appends
//! the bootstrap tokens that let the child rebuild its end of the
//! transport, and watches the child in a background task:
//!
//! - exit code 0 resolves `RemoteTerminated` successfully
//! - a non-zero exit resolves it with the code and captured stderr
//! - `close` or cancellation kills the child and resolves it as a failure
//!
//! The byte streams come from a [`ProcessTransport`]: dedicated pipes
//! ([`AnonymousPipe`], Unix only) or the child's stdin/stdout
//! ([`StdInOut`]).

#[cfg(unix)]
pub(crate) mod pipe;
mod spec;
pub(crate) mod stdio;

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bootstrap;
use crate::channel::{Channel, ChannelId, ChannelState, RemoteTerminated, Termination};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::stream::{BoxedReader, BoxedWriter, StreamChannel};

#[cfg(unix)]
pub use pipe::AnonymousPipe;
pub use spec::ProcessSpec;
pub use stdio::StdInOut;

/// Most stderr text kept for a failed remote; older output is dropped.
pub const STDERR_CAPTURE_LIMIT: usize = 64 * 1024;

/// How long `close` waits for a remote that has ended its stream to exit.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// How long to wait for a dead child's stderr to drain.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How a process channel obtains its two byte streams.
pub trait ProcessTransport: Send + 'static {
    /// Discriminator passed to the child as `--ChannelType=<discriminator>`.
    const DISCRIMINATOR: &'static str;

    /// Configure the command before spawning and return the extra
    /// bootstrap tokens the child needs.
    fn prepare(&mut self, command: &mut Command) -> io::Result<Vec<String>>;

    /// Take the host ends of the streams from a freshly spawned child
    /// and release anything that belongs to the child.
    fn connect(&mut self, child: &mut Child) -> io::Result<(BoxedReader, BoxedWriter)>;

    /// Spawning failed; release whatever `prepare` created.
    fn abort(&mut self) {}
}

/// Process channel talking over dedicated inherited pipes.
#[cfg(unix)]
pub type AnonymousPipeProcessChannel = ProcessChannel<AnonymousPipe>;

/// Process channel talking over the child's stdin/stdout.
pub type StdInOutProcessChannel = ProcessChannel<StdInOut>;

/// Channel to a child process over transport `T`.
pub struct ProcessChannel<T: ProcessTransport> {
    spec: ProcessSpec,
    transport: T,
    stream: StreamChannel,
    monitor: Option<JoinHandle<()>>,
    pid: Option<u32>,
}

impl<T: ProcessTransport + Default> ProcessChannel<T> {
    /// Configure a channel; nothing is started until `open`.
    pub fn new(spec: ProcessSpec) -> Self {
        Self::with_transport(spec, T::default())
    }
}

impl<T: ProcessTransport> ProcessChannel<T> {
    /// Configure a channel with an explicitly constructed transport.
    pub fn with_transport(spec: ProcessSpec, transport: T) -> Self {
        Self {
            spec,
            transport,
            stream: StreamChannel::unwired(ChannelId::new()),
            monitor: None,
            pid: None,
        }
    }

    /// Identifier used in log events.
    pub fn id(&self) -> ChannelId {
        self.stream.id()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.stream.state()
    }

    /// Process ID of the child, once started.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The invocation this channel launches, before bootstrap tokens.
    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// Spawn the child and wire its streams. Errors here are synchronous
    /// start failures; the channel stays unopened.
    fn start(&mut self) -> Result<(Child, Option<ChildStderr>)> {
        let program = self.spec.get_program().to_path_buf();
        let start_error = |source: io::Error| Error::TransportStart {
            program: program.clone(),
            source,
        };

        let mut command = self.spec.command();
        command.arg(bootstrap::channel_type_arg(T::DISCRIMINATOR));
        let tokens = self.transport.prepare(&mut command).map_err(start_error)?;
        command.args(&tokens);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.transport.abort();
                return Err(start_error(e));
            }
        };

        let (reader, writer) = match self.transport.connect(&mut child) {
            Ok(streams) => streams,
            Err(e) => {
                let _ = child.start_kill();
                return Err(start_error(e));
            }
        };
        self.stream.attach(reader, writer);

        let stderr = child.stderr.take();
        Ok((child, stderr))
    }
}

#[async_trait]
impl<T: ProcessTransport> Channel for ProcessChannel<T> {
    async fn open(&mut self, cancel: CancellationToken) -> Result<RemoteTerminated> {
        self.stream.ensure_unopened()?;
        self.spec.validate()?;

        let (child, stderr) = self.start()?;
        let shutdown = self.stream.activate(&cancel)?;

        let id = self.id();
        self.pid = child.id();
        tracing::debug!(
            channel = %id,
            pid = ?self.pid,
            transport = T::DISCRIMINATOR,
            "started '{}'",
            self.spec.get_program().display()
        );

        let stderr = stderr.map(|stderr| capture_stderr(id, stderr));
        let (termination, terminated) = RemoteTerminated::pair();
        self.monitor = Some(tokio::spawn(watch(
            id,
            child,
            stderr,
            shutdown,
            cancel,
            termination,
        )));

        Ok(terminated)
    }

    async fn close(&mut self) -> Result<()> {
        // A remote that ended its stream is on its way out; let it exit
        // on its own so its real status is reported.
        if self.stream.state() == ChannelState::Open
            && self.stream.peer_closed()
            && let Some(monitor) = self.monitor.as_mut()
        {
            match tokio::time::timeout(EXIT_GRACE, monitor).await {
                Ok(joined) => {
                    self.monitor = None;
                    if let Err(e) = joined {
                        tracing::warn!(channel = %self.id(), "process monitor failed: {}", e);
                    }
                }
                Err(_) => {
                    tracing::debug!(channel = %self.id(), "remote closed its stream but kept running");
                }
            }
        }

        let first = self.stream.release()?;

        if let Some(monitor) = self.monitor.take() {
            if let Err(e) = monitor.await {
                tracing::warn!(channel = %self.id(), "process monitor failed: {}", e);
            }
        }
        if first {
            tracing::debug!(channel = %self.id(), "process channel closed");
        }
        Ok(())
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        self.stream.send(message).await
    }

    async fn receive(&mut self) -> Result<Message> {
        self.stream.receive().await
    }
}

/// Wait for the child to exit, or kill it when the channel shuts down.
async fn watch(
    id: ChannelId,
    mut child: Child,
    stderr: Option<JoinHandle<String>>,
    shutdown: CancellationToken,
    cancel: CancellationToken,
    termination: Termination,
) {
    let outcome = tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
            if let Err(e) = child.kill().await {
                tracing::warn!(channel = %id, "failed to kill remote: {}", e);
            }
            if let Some(stderr) = stderr {
                stderr.abort();
            }
            if cancel.is_cancelled() {
                tracing::debug!(channel = %id, "remote killed after cancellation");
                Err(Error::Cancelled)
            } else {
                tracing::debug!(channel = %id, "remote killed by close");
                Err(Error::RemoteKilled)
            }
        }
        status = child.wait() => match status {
            Ok(status) if status.success() => {
                tracing::debug!(channel = %id, "remote exited cleanly");
                Ok(())
            }
            Ok(status) => {
                let stderr = drain_stderr(stderr).await;
                tracing::debug!(channel = %id, code = ?status.code(), "remote exited with failure");
                Err(Error::RemoteExit {
                    code: status.code(),
                    stderr,
                })
            }
            Err(e) => Err(Error::RemoteFaulted(format!(
                "failed to wait for remote: {}",
                e
            ))),
        },
    };

    termination.resolve(outcome);
}

/// Forward the child's stderr to the log and keep its tail.
fn capture_stderr(id: ChannelId, stderr: ChildStderr) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut captured = String::new();
        let mut line = Vec::new();

        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    tracing::debug!(channel = %id, "remote: {}", text.trim_end());
                    captured.push_str(&text);
                    truncate_front(&mut captured, STDERR_CAPTURE_LIMIT);
                }
                Err(e) => {
                    tracing::debug!(channel = %id, "stopped reading remote stderr: {}", e);
                    break;
                }
            }
        }

        captured
    })
}

async fn drain_stderr(stderr: Option<JoinHandle<String>>) -> String {
    let Some(handle) = stderr else {
        return String::new();
    };
    match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, handle).await {
        Ok(Ok(text)) => text,
        _ => String::new(),
    }
}

/// Drop bytes from the front of `text` until it fits in `limit`.
fn truncate_front(text: &mut String, limit: usize) {
    if text.len() <= limit {
        return;
    }
    let mut cut = text.len() - limit;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text.drain(..cut);
}
