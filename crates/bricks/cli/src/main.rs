//! Bricks CLI - drive a worker over any transport.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use bricks::prelude::*;
use bricks::protocol::{ECHO, Echo, TERMINATE};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "bricks")]
#[command(about = "Exchange messages with isolated workers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a worker and echo messages through it
    Echo {
        /// Transport used to reach the worker
        #[arg(short, long, value_enum, default_value_t = Transport::default())]
        transport: Transport,

        /// Worker program (default: the bundled bricks-worker; inside the
        /// container for the docker transport)
        #[arg(long)]
        worker: Option<PathBuf>,

        /// Number of round trips
        #[arg(short = 'n', long, default_value = "3")]
        count: u32,

        /// Text carried by each message
        #[arg(long, default_value = "hello")]
        text: String,

        /// Container image (docker transport)
        #[arg(long, required_if_eq("transport", "docker"))]
        image: Option<String>,

        /// Host directory mounted read-only into the container
        #[arg(long, required_if_eq("transport", "docker"))]
        mount: Option<PathBuf>,

        /// Docker-compatible executable
        #[arg(long, default_value = bricks::docker::DEFAULT_DOCKER_COMMAND)]
        docker: PathBuf,
    },

    /// Round-trip a message through an in-process worker
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum Transport {
    /// Inherited anonymous pipes
    #[cfg_attr(unix, default)]
    Pipe,
    /// The worker's stdin and stdout
    #[cfg_attr(not(unix), default)]
    Stdio,
    /// stdin and stdout of `docker run`
    Docker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Helper to format bricks errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(bricks_err) = err.downcast_ref::<bricks::Error>() {
            anyhow::anyhow!("{}", bricks_err.with_hint())
        } else {
            err
        }
    };

    // Ctrl-C cancels the channel; the worker is torn down with it.
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Echo {
            transport,
            worker,
            count,
            text,
            image,
            mount,
            docker,
        } => {
            let channel = connect(transport, worker, image, mount, docker).map_err(format_error)?;
            echo(channel, cancel, count, &text)
                .await
                .map_err(format_error)
        }
        Commands::Ping => ping(cancel).await.map_err(format_error),
    }
}

/// Build the host side for `transport` without starting anything.
fn connect(
    transport: Transport,
    worker: Option<PathBuf>,
    image: Option<String>,
    mount: Option<PathBuf>,
    docker: PathBuf,
) -> anyhow::Result<Box<dyn Channel>> {
    let channel: Box<dyn Channel> = match transport {
        #[cfg(unix)]
        Transport::Pipe => {
            let worker = local_worker(worker)?;
            Box::new(AnonymousPipeProcessChannel::new(ProcessSpec::new(worker)))
        }
        #[cfg(not(unix))]
        Transport::Pipe => anyhow::bail!("the pipe transport is only available on Unix"),
        Transport::Stdio => {
            let worker = local_worker(worker)?;
            Box::new(StdInOutProcessChannel::new(ProcessSpec::new(worker)))
        }
        Transport::Docker => {
            let image = image.context("--image is required for the docker transport")?;
            let mount = mount.context("--mount is required for the docker transport")?;
            let mount = std::path::absolute(&mount)
                .with_context(|| format!("Invalid mount directory: {}", mount.display()))?;
            let program = worker.unwrap_or_else(|| {
                PathBuf::from(bricks::docker::CONTAINER_MOUNT).join("bricks-worker")
            });
            let spec = DockerSpec::new(image, mount, program.to_string_lossy())
                .docker_command(docker);
            tracing::info!("{}", spec.command_line());
            Box::new(DockerChannel::new(spec)?)
        }
    };
    Ok(channel)
}

fn local_worker(worker: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match worker {
        Some(path) => Ok(path),
        None => Ok(bricks::paths::find_worker_binary()?),
    }
}

async fn echo(
    mut channel: Box<dyn Channel>,
    cancel: CancellationToken,
    count: u32,
    text: &str,
) -> anyhow::Result<()> {
    let terminated = channel.open(cancel).await?;
    let started = Instant::now();

    let exchanged: anyhow::Result<()> = async {
        for seq in 1..=count {
            channel.send_payload(ECHO, &Echo::new(seq, text)).await?;
            let reply: Echo = channel.receive_typed(ECHO).await?;
            if reply.seq != seq {
                anyhow::bail!("reply {} arrived out of order, expected {}", reply.seq, seq);
            }
            println!("{}: {}", reply.seq, reply.text);
        }
        channel.send_command(TERMINATE).await?;
        Ok(())
    }
    .await;

    if let Err(e) = exchanged {
        let _ = channel.close().await;
        return Err(e);
    }

    terminated.await?;
    channel.close().await?;
    tracing::info!("{} round trips in {:.2?}", count, started.elapsed());
    Ok(())
}

async fn ping(cancel: CancellationToken) -> anyhow::Result<()> {
    let mut channel = MemoryChannel::new(|mut endpoint: MemoryEndpoint, _cancel| async move {
        endpoint.receive_expecting("ping").await?;
        endpoint.send(Message::new("pong")?).await?;
        endpoint.close().await
    });

    let started = Instant::now();
    let terminated = channel.open(cancel).await?;
    channel.send_command("ping").await?;
    let reply = channel.receive_expecting("pong").await?;
    terminated.await?;
    channel.close().await?;

    println!("{} in {:.2?}", reply.command(), started.elapsed());
    Ok(())
}
