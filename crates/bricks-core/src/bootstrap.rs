//! Worker-side reconstruction of a process transport.
//!
//! A host appends `--ChannelType=<discriminator>` and any
//! transport-specific tokens to the worker's command line. The worker
//! hands its argv to [`from_args`], which looks the discriminator up in a
//! closed registry and returns an unopened [`ProcessClient`]:
//!
//! ```no_run
//! use bricks_core::{CancellationToken, Channel, bootstrap};
//!
//! # async fn run() -> bricks_core::Result<()> {
//! let mut channel = bootstrap::from_env()?;
//! let _host_gone = channel.open(CancellationToken::new()).await?;
//! let message = channel.receive().await?;
//! channel.send(message).await?;
//! channel.close().await
//! # }
//! ```

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelId, ChannelState, RemoteTerminated};
use crate::error::{Error, Result};
use crate::message::Message;
#[cfg(unix)]
use crate::process::AnonymousPipe;
#[cfg(unix)]
use crate::process::pipe::PipeConnection;
use crate::process::{ProcessTransport, StdInOut, stdio};
use crate::stream::StreamChannel;

/// Token selecting the transport implementation.
pub const CHANNEL_TYPE_ARG: &str = "--ChannelType";

/// Pipe transport: descriptor the worker reads from.
pub const INPUT_CONNECTION_ARG: &str = "--InputConnection";

/// Pipe transport: descriptor the worker writes to.
pub const OUTPUT_CONNECTION_ARG: &str = "--OutputConnection";

/// Format the discriminator token for the child's command line.
pub fn channel_type_arg(discriminator: &str) -> String {
    format!("{}={}", CHANNEL_TYPE_ARG, discriminator)
}

/// Value of the first `name=value` token in `args`.
pub fn arg_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter().find_map(|arg| {
        arg.strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('='))
    })
}

/// How a worker reaches its host once bootstrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientEndpoint {
    #[cfg(unix)]
    AnonymousPipe(PipeConnection),
    StdInOut,
}

/// One known transport: its discriminator and the factory that builds
/// the worker side from the remaining arguments.
struct TransportEntry {
    discriminator: &'static str,
    client: fn(&[String]) -> Result<ClientEndpoint>,
}

#[cfg(unix)]
fn pipe_client(args: &[String]) -> Result<ClientEndpoint> {
    PipeConnection::from_args(args).map(ClientEndpoint::AnonymousPipe)
}

fn stdio_client(_args: &[String]) -> Result<ClientEndpoint> {
    Ok(ClientEndpoint::StdInOut)
}

#[cfg(unix)]
const REGISTRY: &[TransportEntry] = &[
    TransportEntry {
        discriminator: AnonymousPipe::DISCRIMINATOR,
        client: pipe_client,
    },
    TransportEntry {
        discriminator: StdInOut::DISCRIMINATOR,
        client: stdio_client,
    },
];

#[cfg(not(unix))]
const REGISTRY: &[TransportEntry] = &[TransportEntry {
    discriminator: StdInOut::DISCRIMINATOR,
    client: stdio_client,
}];

/// Discriminators this build can bootstrap.
pub fn known_transports() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|entry| entry.discriminator)
}

/// Build the worker side of the transport selected by `args`.
///
/// # Errors
///
/// [`Error::Bootstrap`] if the discriminator is missing or unknown, or
/// the transport's own tokens are missing or malformed.
pub fn from_args<I, S>(args: I) -> Result<ProcessClient>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let args: Vec<String> = args.into_iter().map(Into::into).collect();

    let discriminator = arg_value(&args, CHANNEL_TYPE_ARG)
        .ok_or_else(|| Error::Bootstrap(format!("missing {}=<discriminator>", CHANNEL_TYPE_ARG)))?;
    let entry = REGISTRY
        .iter()
        .find(|entry| entry.discriminator == discriminator)
        .ok_or_else(|| Error::Bootstrap(format!("unknown channel type '{}'", discriminator)))?;

    let endpoint = (entry.client)(&args)?;
    tracing::debug!(transport = entry.discriminator, "bootstrapped worker channel");

    Ok(ProcessClient {
        discriminator: entry.discriminator,
        endpoint: Some(endpoint),
        stream: StreamChannel::unwired(ChannelId::new()),
    })
}

/// Build the worker side of the transport from this process's own argv.
pub fn from_env() -> Result<ProcessClient> {
    from_args(std::env::args())
}

/// Worker end of a process channel.
///
/// `open` connects the inherited descriptors or standard streams. The
/// returned [`RemoteTerminated`] resolves successfully when the worker
/// closes the channel, and with [`Error::Cancelled`] if its token fires.
pub struct ProcessClient {
    discriminator: &'static str,
    endpoint: Option<ClientEndpoint>,
    stream: StreamChannel,
}

impl ProcessClient {
    /// Discriminator the host selected.
    pub fn discriminator(&self) -> &'static str {
        self.discriminator
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.stream.state()
    }
}

#[async_trait]
impl Channel for ProcessClient {
    async fn open(&mut self, cancel: CancellationToken) -> Result<RemoteTerminated> {
        self.stream.ensure_unopened()?;
        let endpoint = self
            .endpoint
            .take()
            .ok_or_else(|| Error::Bootstrap("transport was already consumed".to_string()))?;

        let (reader, writer) = match endpoint {
            #[cfg(unix)]
            ClientEndpoint::AnonymousPipe(connection) => connection.connect()?,
            ClientEndpoint::StdInOut => stdio::client_streams(),
        };
        self.stream.attach(reader, writer);
        self.stream.open(cancel).await
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.close().await
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        self.stream.send(message).await
    }

    async fn receive(&mut self) -> Result<Message> {
        self.stream.receive().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_value() {
        let args = vec![
            "worker".to_string(),
            "--ChannelTypeX=nope".to_string(),
            "--ChannelType=bricks::process::StdInOut".to_string(),
        ];
        assert_eq!(
            arg_value(&args, CHANNEL_TYPE_ARG),
            Some("bricks::process::StdInOut")
        );
        assert_eq!(arg_value(&args, INPUT_CONNECTION_ARG), None);
    }

    #[test]
    fn test_channel_type_arg_round_trips() {
        let token = channel_type_arg(StdInOut::DISCRIMINATOR);
        assert_eq!(
            arg_value(&[token], CHANNEL_TYPE_ARG),
            Some(StdInOut::DISCRIMINATOR)
        );
    }

    #[test]
    fn test_resolves_stdio() {
        let client = from_args(["worker", "--ChannelType=bricks::process::StdInOut"]).unwrap();
        assert_eq!(client.discriminator(), StdInOut::DISCRIMINATOR);
        assert_eq!(client.state(), ChannelState::Unopened);
    }

    #[cfg(unix)]
    #[test]
    fn test_resolves_pipe_with_connections() {
        let client = from_args([
            "worker",
            "--ChannelType=bricks::process::AnonymousPipe",
            "--InputConnection=10",
            "--OutputConnection=11",
        ])
        .unwrap();
        assert_eq!(client.discriminator(), AnonymousPipe::DISCRIMINATOR);
    }

    #[cfg(unix)]
    #[test]
    fn test_pipe_requires_connections() {
        assert!(matches!(
            from_args(["worker", "--ChannelType=bricks::process::AnonymousPipe"]),
            Err(Error::Bootstrap(_))
        ));
    }

    #[test]
    fn test_missing_or_unknown_discriminator() {
        assert!(matches!(from_args(["worker"]), Err(Error::Bootstrap(_))));
        assert!(matches!(
            from_args(["worker", "--ChannelType=System.IO.Pipes"]),
            Err(Error::Bootstrap(_))
        ));
    }

    #[test]
    fn test_registry_lists_stdio() {
        assert!(known_transports().any(|d| d == StdInOut::DISCRIMINATOR));
    }

    #[tokio::test]
    async fn test_client_lifecycle_before_open() {
        let mut client = from_args(["worker", "--ChannelType=bricks::process::StdInOut"]).unwrap();
        assert!(matches!(client.receive().await, Err(Error::NotOpen)));
        assert!(matches!(client.close().await, Err(Error::NotOpen)));
    }
}
