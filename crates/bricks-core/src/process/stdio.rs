//! Transport over the child's standard input and output.

use std::io;
use std::process::Stdio;

use tokio::process::{Child, Command};

use super::ProcessTransport;
use crate::stream::{BoxedReader, BoxedWriter};

/// Host writes to the child's stdin and reads its stdout.
///
/// The child must keep stdout free of anything but frames; log to stderr.
#[derive(Debug, Default)]
pub struct StdInOut;

impl ProcessTransport for StdInOut {
    const DISCRIMINATOR: &'static str = "bricks::process::StdInOut";

    fn prepare(&mut self, command: &mut Command) -> io::Result<Vec<String>> {
        command.stdin(Stdio::piped()).stdout(Stdio::piped());
        Ok(Vec::new())
    }

    fn connect(&mut self, child: &mut Child) -> io::Result<(BoxedReader, BoxedWriter)> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout was not captured"))?;
        Ok((Box::new(stdout), Box::new(stdin)))
    }
}

/// Worker side: the process's own stdin and stdout.
pub(crate) fn client_streams() -> (BoxedReader, BoxedWriter) {
    (Box::new(tokio::io::stdin()), Box::new(tokio::io::stdout()))
}
