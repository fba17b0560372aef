//! Locating the bundled worker binary.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Environment variable that overrides the worker location.
pub const WORKER_PATH_ENV: &str = "BRICKS_WORKER_PATH";

fn worker_name() -> &'static str {
    if cfg!(windows) {
        "bricks-worker.exe"
    } else {
        "bricks-worker"
    }
}

/// Find the `bricks-worker` binary.
///
/// Looks in the following order:
/// 1. `BRICKS_WORKER_PATH` environment variable
/// 2. Same directory as the current executable
/// 3. System PATH
/// 4. `target/debug` or `target/release` of this workspace (development)
///
/// # Errors
///
/// [`Error::WorkerNotFound`] if none of the locations holds the binary.
pub fn find_worker_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!("{} points at missing file {}", WORKER_PATH_ENV, path.display());
    }

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        let worker_path = exe_dir.join(worker_name());
        if worker_path.exists() {
            return Ok(worker_path);
        }
        // Test binaries live one level down, in target/<profile>/deps.
        if let Some(profile_dir) = exe_dir.parent() {
            let worker_path = profile_dir.join(worker_name());
            if worker_path.exists() {
                return Ok(worker_path);
            }
        }
    }

    if let Ok(path) = which::which(worker_name()) {
        return Ok(path);
    }

    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in ["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(worker_name());
            if path.exists() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::WorkerNotFound {
        binary: worker_name().to_string(),
        searched: format!(
            "{}, the executable's directory, PATH and target/{{debug,release}}",
            WORKER_PATH_ENV
        ),
    })
}
