//! Bricks worker process.
//!
//! Started by a host with `--ChannelType=<discriminator>` (plus any
//! transport tokens). Echoes every message back until told to stop.
//! Logs go to stderr; stdout may be the channel itself.

use bricks::protocol::{FAIL, TERMINATE};
use bricks::{CancellationToken, Channel, bootstrap};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The host controls verbosity through RUST_LOG in the worker's environment.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .init();

    let mut channel = bootstrap::from_env()?;
    // Resolves when this side closes, so nothing waits on it.
    let _closed = channel.open(CancellationToken::new()).await?;
    tracing::debug!(transport = channel.discriminator(), "worker ready");

    let result = serve(&mut channel).await;
    channel.close().await?;
    result
}

async fn serve(channel: &mut impl Channel) -> anyhow::Result<()> {
    loop {
        let message = channel.receive().await?;
        match message.command() {
            TERMINATE => {
                tracing::debug!("terminate requested");
                return Ok(());
            }
            FAIL => {
                let code: i32 = message.decode()?;
                tracing::error!("requested exit with code {}", code);
                std::process::exit(code);
            }
            _ => channel.send(message).await?,
        }
    }
}
