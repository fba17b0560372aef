//! Bricks: command-tagged message channels to isolated workers.
//!
//! A host opens a [`Channel`] to a worker running as an in-process task,
//! a child process, or a container, then exchanges [`Message`]s with it.
//! The worker side is rebuilt from its command line with
//! [`bootstrap::from_env`].
//!
//! # Quick Start
//!
//! ```no_run
//! use bricks::prelude::*;
//!
//! # async fn run() -> bricks::Result<()> {
//! let worker = bricks::paths::find_worker_binary()?;
//! let mut channel = StdInOutProcessChannel::new(ProcessSpec::new(worker));
//! let terminated = channel.open(CancellationToken::new()).await?;
//!
//! channel.send_payload("echo", &bricks::protocol::Echo::new(1, "hello")).await?;
//! let reply: bricks::protocol::Echo = channel.receive_typed("echo").await?;
//! assert_eq!(reply.text, "hello");
//!
//! channel.send_command(bricks::protocol::TERMINATE).await?;
//! terminated.await?;
//! channel.close().await
//! # }
//! ```
//!
//! This crate re-exports `bricks-core` and adds the message vocabulary
//! spoken by the bundled `bricks` and `bricks-worker` binaries.

pub mod protocol;

pub use bricks_core::*;

/// Common imports for hosts and workers.
pub mod prelude {
    pub use bricks_core::{
        CancellationToken, Channel, ChannelExt, ChannelState, DockerChannel, DockerSpec, Error,
        MemoryChannel, MemoryEndpoint, Message, ProcessSpec, RemoteTerminated, Result,
        StdInOutProcessChannel,
    };
    #[cfg(unix)]
    pub use bricks_core::AnonymousPipeProcessChannel;
}
