//! Host-side process channels driven against the real `bricks-worker`.

use std::path::PathBuf;
use std::time::Duration;

use bricks::prelude::*;
use bricks::protocol::{ECHO, Echo, FAIL, TERMINATE};

/// Upper bound for anything that should finish promptly.
const DEADLINE: Duration = Duration::from_secs(10);

fn worker() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_bricks-worker"))
}

type Make = fn(ProcessSpec) -> Box<dyn Channel>;

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(DEADLINE, future)
        .await
        .expect("operation did not finish in time")
}

async fn missing_program_fails_to_start(make: Make) {
    let mut channel = make(ProcessSpec::new("/nonexistent/bricks-worker"));
    let err = channel.open(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::TransportStart { .. }), "got {:?}", err);

    // A failed open leaves the channel unopened.
    assert!(matches!(channel.send_command("x").await, Err(Error::NotOpen)));
}

async fn operations_before_open_fail(make: Make) {
    let mut channel = make(ProcessSpec::new(worker()));
    assert!(matches!(channel.send_command("x").await, Err(Error::NotOpen)));
    assert!(matches!(channel.receive().await, Err(Error::NotOpen)));
    assert!(matches!(channel.close().await, Err(Error::NotOpen)));
}

async fn second_open_fails(make: Make) {
    let mut channel = make(ProcessSpec::new(worker()));
    let _terminated = channel.open(CancellationToken::new()).await.unwrap();
    assert!(matches!(
        channel.open(CancellationToken::new()).await,
        Err(Error::AlreadyOpen)
    ));
    within(channel.close()).await.unwrap();
}

async fn closed_channel_is_disposed(make: Make) {
    let mut channel = make(ProcessSpec::new(worker()));
    let _terminated = channel.open(CancellationToken::new()).await.unwrap();
    within(channel.close()).await.unwrap();

    assert!(matches!(channel.send_command("x").await, Err(Error::Disposed)));
    assert!(matches!(channel.receive().await, Err(Error::Disposed)));
    assert!(matches!(
        channel.open(CancellationToken::new()).await,
        Err(Error::Disposed)
    ));
    // Closing twice is a no-op.
    channel.close().await.unwrap();
}

async fn message_round_trips(make: Make) {
    let mut channel = make(ProcessSpec::new(worker()));
    let _terminated = channel.open(CancellationToken::new()).await.unwrap();

    channel
        .send(Message::from_value("text", "TestMessage").unwrap())
        .await
        .unwrap();
    let reply = within(channel.receive()).await.unwrap();
    assert_eq!(reply.command(), "text");
    assert_eq!(reply.decode::<String>().unwrap(), "TestMessage");

    channel.send_command("bare").await.unwrap();
    let reply = within(channel.receive_expecting("bare")).await.unwrap();
    assert_eq!(reply.payload(), None);

    channel.send_payload(ECHO, &Echo::new(1, "payload")).await.unwrap();
    let echoed: Echo = within(channel.receive_typed(ECHO)).await.unwrap();
    assert_eq!(echoed, Echo::new(1, "payload"));

    within(channel.close()).await.unwrap();
}

async fn close_kills_running_worker(make: Make) {
    let mut channel = make(ProcessSpec::new(worker()));
    let terminated = channel.open(CancellationToken::new()).await.unwrap();

    within(channel.close()).await.unwrap();
    let outcome = within(terminated).await;
    assert!(matches!(outcome, Err(Error::RemoteKilled)), "got {:?}", outcome);
}

async fn terminate_then_close_succeeds(make: Make) {
    let mut channel = make(ProcessSpec::new(worker()));
    let terminated = channel.open(CancellationToken::new()).await.unwrap();

    channel.send_command(TERMINATE).await.unwrap();
    within(terminated).await.unwrap();
    within(channel.close()).await.unwrap();
}

async fn close_after_worker_hangs_up_succeeds(make: Make) {
    let mut channel = make(ProcessSpec::new(worker()));
    let terminated = channel.open(CancellationToken::new()).await.unwrap();

    channel.send_command(TERMINATE).await.unwrap();
    assert!(matches!(
        within(channel.receive()).await,
        Err(Error::ConnectionClosed)
    ));
    within(channel.close()).await.unwrap();
    within(terminated).await.unwrap();
}

async fn cancellation_interrupts_receive(make: Make) {
    let mut channel = make(ProcessSpec::new(worker()));
    let cancel = CancellationToken::new();
    let terminated = channel.open(cancel.clone()).await.unwrap();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    // The worker never replies unprompted.
    assert!(matches!(
        within(channel.receive()).await,
        Err(Error::Cancelled)
    ));
    assert!(matches!(within(terminated).await, Err(Error::Cancelled)));
    assert!(matches!(channel.send_command("x").await, Err(Error::Disposed)));
    channel.close().await.unwrap();
}

async fn nonzero_exit_is_reported(make: Make) {
    let mut channel = make(ProcessSpec::new(worker()));
    let terminated = channel.open(CancellationToken::new()).await.unwrap();

    channel.send_payload(FAIL, &3).await.unwrap();
    match within(terminated).await {
        Err(Error::RemoteExit { code, stderr }) => {
            assert_eq!(code, Some(3));
            assert!(stderr.contains("requested exit with code 3"), "stderr: {}", stderr);
        }
        other => panic!("expected RemoteExit, got {:?}", other),
    }
    within(channel.close()).await.unwrap();
}

macro_rules! transport_tests {
    ($name:ident, $make:expr) => {
        mod $name {
            use super::*;

            fn make(spec: ProcessSpec) -> Box<dyn Channel> {
                ($make)(spec)
            }

            #[tokio::test]
            async fn test_operations_before_open_fail() {
                operations_before_open_fail(make).await;
            }

            #[tokio::test]
            async fn test_second_open_fails() {
                second_open_fails(make).await;
            }

            #[tokio::test]
            async fn test_closed_channel_is_disposed() {
                closed_channel_is_disposed(make).await;
            }

            #[tokio::test]
            async fn test_message_round_trips() {
                message_round_trips(make).await;
            }

            #[tokio::test]
            async fn test_close_kills_running_worker() {
                close_kills_running_worker(make).await;
            }

            #[tokio::test]
            async fn test_terminate_then_close_succeeds() {
                terminate_then_close_succeeds(make).await;
            }

            #[tokio::test]
            async fn test_close_after_worker_hangs_up_succeeds() {
                close_after_worker_hangs_up_succeeds(make).await;
            }

            #[tokio::test]
            async fn test_cancellation_interrupts_receive() {
                cancellation_interrupts_receive(make).await;
            }

            #[tokio::test]
            async fn test_nonzero_exit_is_reported() {
                nonzero_exit_is_reported(make).await;
            }
        }
    };
}

#[cfg(unix)]
fn pipe_channel(spec: ProcessSpec) -> Box<dyn Channel> {
    Box::new(AnonymousPipeProcessChannel::new(spec))
}

fn stdio_channel(spec: ProcessSpec) -> Box<dyn Channel> {
    Box::new(StdInOutProcessChannel::new(spec))
}

/// Stand-in for the docker CLI: drops the eight `run` arguments in front
/// of the program and runs it on the host.
#[cfg(unix)]
fn fake_docker() -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::OnceLock;

    static DIR: OnceLock<tempfile::TempDir> = OnceLock::new();
    let dir = DIR.get_or_init(|| {
        let dir = tempfile::tempdir().expect("Failed to create temp directory");
        let script = dir.path().join("docker");
        std::fs::write(&script, "#!/bin/sh\nshift 8\nexec \"$@\"\n")
            .expect("Failed to write fake docker");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("Failed to mark fake docker executable");
        // A process forked elsewhere while the script was open for writing
        // keeps it busy until it execs; run it once so later spawns can't hit that.
        const ETXTBSY: i32 = 26;
        for _ in 0..100 {
            match std::process::Command::new(&script)
                .args(["run", "--rm", "-i", "--mount", "m", "-w", "/mnt/bricks", "image", "true"])
                .status()
            {
                Err(e) if e.raw_os_error() == Some(ETXTBSY) => {
                    std::thread::sleep(Duration::from_millis(10))
                }
                _ => break,
            }
        }
        dir
    });
    dir.path().join("docker")
}

#[cfg(unix)]
fn docker_channel(spec: ProcessSpec) -> Box<dyn Channel> {
    let docker = DockerSpec::new(
        "bricks/worker:test",
        std::env::temp_dir(),
        spec.get_program().to_string_lossy(),
    )
    .docker_command(fake_docker())
    .args(spec.get_args().iter().cloned());
    Box::new(DockerChannel::new(docker).expect("valid docker spec"))
}

#[cfg(unix)]
transport_tests!(anonymous_pipe, pipe_channel);
transport_tests!(stdin_out, stdio_channel);
#[cfg(unix)]
transport_tests!(docker, docker_channel);

#[cfg(unix)]
#[tokio::test]
async fn test_pipe_missing_program_fails_to_start() {
    missing_program_fails_to_start(pipe_channel).await;
}

#[tokio::test]
async fn test_stdio_missing_program_fails_to_start() {
    missing_program_fails_to_start(stdio_channel).await;
}

#[tokio::test]
async fn test_docker_missing_command_fails_to_start() {
    let spec = DockerSpec::new("bricks/worker:test", std::env::temp_dir(), "bricks-worker")
        .docker_command("/nonexistent/docker");
    let mut channel = DockerChannel::new(spec).unwrap();
    let err = channel.open(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::TransportStart { .. }), "got {:?}", err);
    assert_eq!(channel.state(), ChannelState::Unopened);
}

#[cfg(unix)]
#[tokio::test]
async fn test_docker_runs_worker_inside_mount() {
    let spec = DockerSpec::new("bricks/worker:test", std::env::temp_dir(), worker().to_string_lossy())
        .docker_command(fake_docker());
    let mut channel = DockerChannel::new(spec).unwrap();
    assert_eq!(channel.process_spec().get_args()[0], "run");

    let terminated = channel.open(CancellationToken::new()).await.unwrap();
    channel.send_payload(ECHO, &Echo::new(1, "contained")).await.unwrap();
    let reply: Echo = within(channel.receive_typed(ECHO)).await.unwrap();
    assert_eq!(reply, Echo::new(1, "contained"));

    channel.send_command(TERMINATE).await.unwrap();
    within(terminated).await.unwrap();
    channel.close().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_pipe_delivers_messages_in_order() {
    let mut channel = AnonymousPipeProcessChannel::new(ProcessSpec::new(worker()));
    let terminated = channel.open(CancellationToken::new()).await.unwrap();

    for seq in 0..10 {
        channel
            .send_payload(ECHO, &Echo::new(seq, format!("message {}", seq)))
            .await
            .unwrap();
    }
    for seq in 0..10 {
        let reply: Echo = within(channel.receive_typed(ECHO)).await.unwrap();
        assert_eq!(reply, Echo::new(seq, format!("message {}", seq)));
    }

    channel.send_command(TERMINATE).await.unwrap();
    within(terminated).await.unwrap();
    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_environment_reaches_worker() {
    let dir = tempfile::tempdir().unwrap();
    let spec = ProcessSpec::new(worker())
        .current_dir(dir.path())
        .env("RUST_LOG", "debug");
    let mut channel = StdInOutProcessChannel::new(spec);
    let terminated = channel.open(CancellationToken::new()).await.unwrap();

    channel.send_payload(FAIL, &7).await.unwrap();
    match within(terminated).await {
        Err(Error::RemoteExit { code, stderr }) => {
            assert_eq!(code, Some(7));
            assert!(stderr.contains("worker ready"), "stderr: {}", stderr);
        }
        other => panic!("expected RemoteExit, got {:?}", other),
    }
    channel.close().await.unwrap();
}
