//! Commands understood by `bricks-worker`.
//!
//! Any command other than [`TERMINATE`] and [`FAIL`] is sent straight
//! back, payload included.

use serde::{Deserialize, Serialize};

/// Ask the worker to close its channel and exit with status 0.
pub const TERMINATE: &str = "terminate";

/// Ask the worker to exit immediately with the JSON `i32` payload as its
/// exit status.
pub const FAIL: &str = "fail";

/// Command used by `bricks echo`.
pub const ECHO: &str = "echo";

/// Payload of an [`ECHO`] round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Echo {
    pub seq: u32,
    pub text: String,
}

impl Echo {
    pub fn new(seq: u32, text: impl Into<String>) -> Self {
        Self {
            seq,
            text: text.into(),
        }
    }
}
