//! Error types for bricks-core.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for bricks-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a channel.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation requires an open channel, but `open` was never called.
    #[error("channel is not open")]
    NotOpen,

    /// `open` was called on a channel that is already open.
    #[error("channel is already open")]
    AlreadyOpen,

    /// Operation on a channel that has been closed.
    #[error("channel has been closed")]
    Disposed,

    /// The remote sent a different command than the one expected.
    #[error("protocol violation: expected command '{expected}', received '{actual}'")]
    ProtocolViolation { expected: String, actual: String },

    /// Bad constructor or configuration argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The OS could not create the remote process or its pipes.
    #[error("failed to start '{}': {source}", .program.display())]
    TransportStart {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The remote process exited with a non-zero status.
    #[error("remote exited with {}{}", describe_status(.code), describe_stderr(.stderr))]
    RemoteExit { code: Option<i32>, stderr: String },

    /// The remote was still running when the host closed the channel.
    #[error("remote was killed while still running")]
    RemoteKilled,

    /// The cancellation token passed to `open` fired.
    #[error("channel was cancelled")]
    Cancelled,

    /// The remote ended abnormally without an exit status (worker task panic, lost monitor).
    #[error("remote faulted: {0}")]
    RemoteFaulted(String),

    /// IO error on the underlying transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed its end of the transport.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A frame could not be decoded or had an unsupported layout.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// A previous `send` was dropped part way through a frame, so the
    /// outbound stream no longer starts on a frame boundary.
    #[error("a previous send was interrupted mid-frame; the outbound stream is unusable")]
    SendInterrupted,

    /// The bundled worker binary could not be located.
    #[error("could not find {binary}; searched {searched}")]
    WorkerNotFound { binary: String, searched: String },

    /// The worker could not reconstruct its transport from argv.
    #[error("bootstrap error: {0}")]
    Bootstrap(String),
}

fn describe_status(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

fn describe_stderr(stderr: &str) -> String {
    let stderr = stderr.trim_end();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr)
    }
}

/// Broad classes of [`Error`], used to decide who is at fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Misuse by the caller. Always synchronous, never retried.
    ContractViolation,
    /// The remote could not be started.
    TransportStart,
    /// The remote ended badly; surfaced through `RemoteTerminated`.
    RemoteFailure,
    /// Fault on the byte stream or queue while the channel was open.
    Transport,
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotOpen
            | Error::AlreadyOpen
            | Error::Disposed
            | Error::ProtocolViolation { .. }
            | Error::InvalidArgument(_) => ErrorKind::ContractViolation,
            Error::TransportStart { .. } | Error::WorkerNotFound { .. } => {
                ErrorKind::TransportStart
            }
            Error::RemoteExit { .. }
            | Error::RemoteKilled
            | Error::Cancelled
            | Error::RemoteFaulted(_) => ErrorKind::RemoteFailure,
            Error::Io(_)
            | Error::ConnectionClosed
            | Error::InvalidFrame(_)
            | Error::Serialization(_)
            | Error::Deserialization(_)
            | Error::SendInterrupted
            | Error::Bootstrap(_) => ErrorKind::Transport,
        }
    }

    /// Render the error together with a recovery hint, if one applies.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Error::NotOpen => Some("call open() before sending or receiving"),
            Error::Disposed => Some("channels are one-shot; create a new channel instead of reopening"),
            Error::TransportStart { .. } | Error::WorkerNotFound { .. } => {
                Some("check that the program exists and is executable, or set BRICKS_WORKER_PATH")
            }
            Error::RemoteExit { .. } => Some(
                "the message ends with the tail of the worker's stderr; run with RUST_LOG=debug to stream it as it is written",
            ),
            Error::SendInterrupted => {
                Some("do not put deadlines on send; cancel the channel's open token instead")
            }
            Error::Bootstrap(_) => {
                Some("workers must be launched by a host channel, which appends --ChannelType")
            }
            _ => None,
        };

        match hint {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }
}
