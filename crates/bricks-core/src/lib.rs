//! Channels for exchanging command-tagged messages with isolated workers.
//!
//! This crate provides:
//! - The [`Channel`] contract (open, close, send, receive) and typed helpers
//! - A length-prefixed, validated frame format for byte streams
//! - Transports: in-process tasks, child processes over inherited pipes or
//!   stdin/stdout, and containerized processes via `docker run`
//! - Worker-side bootstrap from command-line tokens

pub mod bootstrap;
pub mod channel;
pub mod docker;
pub mod error;
pub mod frame;
pub mod memory;
pub mod message;
pub mod paths;
pub mod process;
pub mod stream;

pub use bootstrap::ProcessClient;
pub use channel::{Channel, ChannelExt, ChannelId, ChannelState, RemoteTerminated};
pub use docker::{DockerChannel, DockerSpec};
pub use error::{Error, ErrorKind, Result};
pub use memory::{MemoryChannel, MemoryEndpoint, WorkerBody};
pub use message::Message;
#[cfg(unix)]
pub use process::{AnonymousPipe, AnonymousPipeProcessChannel};
pub use process::{ProcessChannel, ProcessSpec, ProcessTransport, StdInOut, StdInOutProcessChannel};
pub use stream::StreamChannel;

/// Cancellation token accepted by [`Channel::open`].
pub use tokio_util::sync::CancellationToken;
