//! Workers inside a container.
//!
//! `DockerChannel` is a [`StdInOutProcessChannel`] whose program is
//! rewritten into a `docker run` invocation:
//!
//! ```text
//! docker run --rm -i --mount type=bind,source="<hostDir>",target=/mnt/bricks,readonly \
//!     -w /mnt/bricks <image> <program> <args>
//! ```
//!
//! Exit codes, stream wiring and teardown are those of the stdio channel.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelId, ChannelState, RemoteTerminated};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::process::{ProcessChannel, ProcessSpec, StdInOutProcessChannel};

/// Where the host directory appears inside the container.
pub const CONTAINER_MOUNT: &str = "/mnt/bricks";

/// Docker executable used unless overridden.
pub const DEFAULT_DOCKER_COMMAND: &str = "docker";

/// Configuration for a containerized worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerSpec {
    docker_command: PathBuf,
    image: String,
    host_directory: PathBuf,
    program: String,
    args: Vec<String>,
}

impl DockerSpec {
    /// Run `program` from `image`, with `host_directory` mounted read-only
    /// at [`CONTAINER_MOUNT`].
    pub fn new(
        image: impl Into<String>,
        host_directory: impl Into<PathBuf>,
        program: impl Into<String>,
    ) -> Self {
        Self {
            docker_command: PathBuf::from(DEFAULT_DOCKER_COMMAND),
            image: image.into(),
            host_directory: host_directory.into(),
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Use a different docker-compatible CLI (e.g. `podman`).
    pub fn docker_command(mut self, command: impl Into<PathBuf>) -> Self {
        self.docker_command = command.into();
        self
    }

    /// Append one argument for the program inside the container.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments for the program inside the container.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Image reference passed to `docker run`.
    pub fn get_image(&self) -> &str {
        &self.image
    }

    /// Host directory bind-mounted at [`CONTAINER_MOUNT`].
    pub fn get_host_directory(&self) -> &Path {
        &self.host_directory
    }

    /// Check the configuration without touching the filesystem.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if the image, host directory or program
    /// is empty, or the host directory is relative.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "docker image reference must not be empty".to_string(),
            ));
        }
        if self.host_directory.as_os_str().is_empty() {
            return Err(Error::InvalidArgument(
                "host directory must not be empty".to_string(),
            ));
        }
        if !self.host_directory.is_absolute() {
            return Err(Error::InvalidArgument(format!(
                "host directory must be absolute: {}",
                self.host_directory.display()
            )));
        }
        if self.program.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "program path must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The `--mount` value. Docker parses it as CSV, so a source path
    /// containing a comma or quote is CSV-quoted.
    fn mount_arg(&self) -> String {
        let source = format!("source={}", self.host_directory.display());
        let source = if source.contains([',', '"']) {
            format!("\"{}\"", source.replace('"', "\"\""))
        } else {
            source
        };
        format!("type=bind,{},target={},readonly", source, CONTAINER_MOUNT)
    }

    /// The rewritten process invocation.
    pub fn to_process_spec(&self) -> Result<ProcessSpec> {
        self.validate()?;
        Ok(ProcessSpec::new(&self.docker_command)
            .args(["run", "--rm", "-i", "--mount"])
            .arg(self.mount_arg())
            .args(["-w", CONTAINER_MOUNT])
            .arg(self.image.as_str())
            .arg(self.program.as_str())
            .args(self.args.iter().cloned()))
    }

    /// Human-readable command line, for logs.
    pub fn command_line(&self) -> String {
        let mut line = format!(
            "{} run --rm -i --mount type=bind,source=\"{}\",target={},readonly -w {} {} {}",
            self.docker_command.display(),
            self.host_directory.display(),
            CONTAINER_MOUNT,
            CONTAINER_MOUNT,
            self.image,
            self.program
        );
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Channel to a worker running in a container over its stdin/stdout.
pub struct DockerChannel {
    spec: DockerSpec,
    inner: StdInOutProcessChannel,
}

impl DockerChannel {
    /// Validate `spec` and prepare the channel. Nothing is spawned until `open`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] as for [`DockerSpec::validate`].
    pub fn new(spec: DockerSpec) -> Result<Self> {
        let process = spec.to_process_spec()?;
        Ok(Self {
            spec,
            inner: ProcessChannel::new(process),
        })
    }

    /// Identifier used in log events.
    pub fn id(&self) -> ChannelId {
        self.inner.id()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    /// The container configuration.
    pub fn spec(&self) -> &DockerSpec {
        &self.spec
    }

    /// The process invocation actually launched.
    pub fn process_spec(&self) -> &ProcessSpec {
        self.inner.spec()
    }
}

#[async_trait]
impl Channel for DockerChannel {
    async fn open(&mut self, cancel: CancellationToken) -> Result<RemoteTerminated> {
        tracing::debug!(channel = %self.id(), "launching container: {}", self.spec.command_line());
        self.inner.open(cancel).await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        self.inner.send(message).await
    }

    async fn receive(&mut self) -> Result<Message> {
        self.inner.receive().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrites_invocation() {
        let spec = DockerSpec::new("bricks/worker:1.0", "/srv/bricks", "/mnt/bricks/worker")
            .args(["--verbose"]);
        let process = spec.to_process_spec().unwrap();

        assert_eq!(process.get_program(), Path::new("docker"));
        assert_eq!(
            process.get_args(),
            [
                "run",
                "--rm",
                "-i",
                "--mount",
                "type=bind,source=/srv/bricks,target=/mnt/bricks,readonly",
                "-w",
                "/mnt/bricks",
                "bricks/worker:1.0",
                "/mnt/bricks/worker",
                "--verbose",
            ]
        );
    }

    #[test]
    fn test_command_line_display() {
        let spec = DockerSpec::new("img", "/srv/bricks", "worker")
            .docker_command("podman")
            .arg("x");
        assert_eq!(
            spec.command_line(),
            "podman run --rm -i --mount type=bind,source=\"/srv/bricks\",target=/mnt/bricks,readonly -w /mnt/bricks img worker x"
        );
    }

    #[test]
    fn test_mount_with_comma_is_quoted() {
        let spec = DockerSpec::new("img", "/srv/a,b", "worker");
        assert_eq!(
            spec.mount_arg(),
            "type=bind,\"source=/srv/a,b\",target=/mnt/bricks,readonly"
        );
    }

    #[test]
    fn test_validation() {
        let invalid = [
            DockerSpec::new("", "/srv", "worker"),
            DockerSpec::new("img", "", "worker"),
            DockerSpec::new("img", "relative/dir", "worker"),
            DockerSpec::new("img", "/srv", ""),
        ];
        for spec in invalid {
            assert!(matches!(
                DockerChannel::new(spec),
                Err(Error::InvalidArgument(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_missing_docker_fails_synchronously() {
        let spec = DockerSpec::new("img", "/srv", "worker")
            .docker_command("/nonexistent/docker");
        let mut channel = DockerChannel::new(spec).unwrap();
        assert!(matches!(
            channel.open(CancellationToken::new()).await,
            Err(Error::TransportStart { .. })
        ));
        assert_eq!(channel.state(), ChannelState::Unopened);
    }
}
