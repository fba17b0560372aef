//! Process start configuration.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::error::{Error, Result};

/// What to launch for a process channel: program, arguments, working
/// directory and extra environment.
///
/// Pure configuration; nothing touches the OS until the channel opens.
///
/// ```
/// use bricks_core::process::ProcessSpec;
///
/// let spec = ProcessSpec::new("bricks-worker")
///     .arg("--quiet")
///     .current_dir("/tmp")
///     .env("RUST_LOG", "debug");
///
/// assert_eq!(spec.get_program().to_str(), Some("bricks-worker"));
/// assert_eq!(spec.get_args(), ["--quiet"]);
/// assert_eq!(spec.get_current_dir().and_then(|d| d.to_str()), Some("/tmp"));
/// assert_eq!(spec.get_envs().len(), 1);
/// assert!(spec.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    program: PathBuf,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessSpec {
    /// Run `program` with no arguments, in the host's working directory
    /// and environment.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run the process in `dir` instead of the host's working directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Set an environment variable for the process.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Program to launch.
    pub fn get_program(&self) -> &Path {
        &self.program
    }

    /// Arguments, not including the bootstrap tokens appended at open.
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Working directory override, if any.
    pub fn get_current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// Environment variables added on top of the host's.
    pub fn get_envs(&self) -> &[(OsString, OsString)] {
        &self.envs
    }

    /// Reject configurations that can never start.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if the program path is empty.
    pub fn validate(&self) -> Result<()> {
        if self.program.as_os_str().is_empty() {
            return Err(Error::InvalidArgument(
                "program path must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the command with stderr captured and kill-on-drop set.
    /// Transports configure stdin/stdout themselves.
    pub(crate) fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        command
    }
}
