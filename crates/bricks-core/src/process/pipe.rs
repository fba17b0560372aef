//! Transport over dedicated anonymous pipes inherited by the child.
//!
//! The host creates two pipes and leaves the child's ends open across
//! `exec`; their descriptor numbers travel on the command line as
//! `--InputConnection=<fd>` (the child reads it) and
//! `--OutputConnection=<fd>` (the child writes it). Every other
//! descriptor stays close-on-exec, so the child's stdio is untouched.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tokio::net::unix::pipe;
use tokio::process::{Child, Command};

use super::ProcessTransport;
use crate::bootstrap::{self, INPUT_CONNECTION_ARG, OUTPUT_CONNECTION_ARG};
use crate::error::{Error, Result};
use crate::stream::{BoxedReader, BoxedWriter};

/// Host side of the pipe transport.
#[derive(Debug, Default)]
pub struct AnonymousPipe {
    pending: Option<PendingPipes>,
}

/// Both pipes between `prepare` and `connect`.
#[derive(Debug)]
struct PendingPipes {
    host_read: OwnedFd,
    host_write: OwnedFd,
    child_read: OwnedFd,
    child_write: OwnedFd,
}

impl ProcessTransport for AnonymousPipe {
    const DISCRIMINATOR: &'static str = "bricks::process::AnonymousPipe";

    fn prepare(&mut self, command: &mut Command) -> io::Result<Vec<String>> {
        let (child_read, host_write) = cloexec_pipe()?;
        let (host_read, child_write) = cloexec_pipe()?;

        let input = child_read.as_raw_fd();
        let output = child_write.as_raw_fd();

        // SAFETY: the hook runs between fork and exec and only calls fcntl,
        // which is async-signal-safe.
        unsafe {
            command.pre_exec(move || {
                set_cloexec(input, false)?;
                set_cloexec(output, false)
            });
        }

        self.pending = Some(PendingPipes {
            host_read,
            host_write,
            child_read,
            child_write,
        });

        Ok(vec![
            format!("{}={}", INPUT_CONNECTION_ARG, input),
            format!("{}={}", OUTPUT_CONNECTION_ARG, output),
        ])
    }

    fn connect(&mut self, _child: &mut Child) -> io::Result<(BoxedReader, BoxedWriter)> {
        let pipes = self
            .pending
            .take()
            .ok_or_else(|| io::Error::other("pipes were not prepared"))?;

        // The child holds its own copies now.
        drop(pipes.child_read);
        drop(pipes.child_write);

        let reader = pipe::Receiver::from_file(File::from(pipes.host_read))?;
        let writer = pipe::Sender::from_file(File::from(pipes.host_write))?;
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn abort(&mut self) {
        self.pending = None;
    }
}

/// Descriptors handed to a worker on its command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PipeConnection {
    input: RawFd,
    output: RawFd,
}

impl PipeConnection {
    /// Parse `--InputConnection` and `--OutputConnection` from argv.
    pub(crate) fn from_args(args: &[String]) -> Result<Self> {
        let input = parse_fd(args, INPUT_CONNECTION_ARG)?;
        let output = parse_fd(args, OUTPUT_CONNECTION_ARG)?;
        // Each descriptor is adopted, and later closed, exactly once.
        if input == output {
            return Err(Error::Bootstrap(format!(
                "{} and {} both name descriptor {}",
                INPUT_CONNECTION_ARG, OUTPUT_CONNECTION_ARG, input
            )));
        }
        Ok(Self { input, output })
    }

    /// Take ownership of the inherited descriptors and wrap them as streams.
    pub(crate) fn connect(self) -> Result<(BoxedReader, BoxedWriter)> {
        let input = adopt(self.input)?;
        let output = adopt(self.output)?;

        let reader = pipe::Receiver::from_file(File::from(input))?;
        let writer = pipe::Sender::from_file(File::from(output))?;
        Ok((Box::new(reader), Box::new(writer)))
    }
}

fn parse_fd(args: &[String], name: &str) -> Result<RawFd> {
    let value = bootstrap::arg_value(args, name)
        .ok_or_else(|| Error::Bootstrap(format!("missing {}=<fd>", name)))?;
    let fd: RawFd = value
        .parse()
        .map_err(|_| Error::Bootstrap(format!("{} is not a descriptor: '{}'", name, value)))?;
    // 0-2 are the process's own stdio and are never handed out.
    if fd < 3 {
        return Err(Error::Bootstrap(format!(
            "{} refers to a standard stream ({})",
            name, fd
        )));
    }
    Ok(fd)
}

/// Claim an inherited descriptor and stop it leaking into grandchildren.
fn adopt(fd: RawFd) -> Result<OwnedFd> {
    // SAFETY: F_GETFD only inspects the descriptor table.
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        return Err(Error::Bootstrap(format!("descriptor {} is not open", fd)));
    }
    // SAFETY: the descriptor is open and was passed to this process for its
    // exclusive use; nothing else in the process owns it.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    set_cloexec(owned.as_raw_fd(), true)?;
    Ok(owned)
}

/// Create a pipe whose ends are both close-on-exec. Returns (read, write).
fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        // SAFETY: fds is a valid two-element buffer.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        // SAFETY: fds is a valid two-element buffer.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }

    // SAFETY: the call above succeeded, so both descriptors are open and ours.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        set_cloexec(read.as_raw_fd(), true)?;
        set_cloexec(write.as_raw_fd(), true)?;
    }

    Ok((read, write))
}

fn set_cloexec(fd: RawFd, enabled: bool) -> io::Result<()> {
    // SAFETY: fcntl with F_GETFD/F_SETFD only touches descriptor flags.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        let flags = if enabled {
            flags | libc::FD_CLOEXEC
        } else {
            flags & !libc::FD_CLOEXEC
        };
        if libc::fcntl(fd, libc::F_SETFD, flags) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
