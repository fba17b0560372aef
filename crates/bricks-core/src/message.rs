//! Command-tagged messages exchanged over a channel.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// A command string plus an optional serialized payload.
///
/// Messages are immutable once built. The command is never empty; the
/// payload is opaque to the channel and only interpreted by
/// [`Message::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    command: String,
    payload: Option<Vec<u8>>,
}

impl Message {
    /// Create a message that carries only a command.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if `command` is empty.
    pub fn new(command: impl Into<String>) -> Result<Self> {
        Self::build(command.into(), None)
    }

    /// Create a message carrying raw payload bytes.
    pub fn with_payload(command: impl Into<String>, payload: Vec<u8>) -> Result<Self> {
        Self::build(command.into(), Some(payload))
    }

    /// Create a message whose payload is `value` encoded as JSON.
    pub fn from_value<T: Serialize + ?Sized>(command: impl Into<String>, value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| Error::Serialization(format!("Failed to encode payload: {}", e)))?;
        Self::build(command.into(), Some(payload))
    }

    fn build(command: String, payload: Option<Vec<u8>>) -> Result<Self> {
        if command.is_empty() {
            return Err(Error::InvalidArgument(
                "message command must not be empty".to_string(),
            ));
        }
        Ok(Self { command, payload })
    }

    /// The command tag.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The raw payload, if any.
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Decode the payload as JSON into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self.payload.as_deref().ok_or_else(|| {
            Error::Deserialization(format!("message '{}' carries no payload", self.command))
        })?;
        serde_json::from_slice(payload).map_err(|e| {
            Error::Deserialization(format!(
                "Failed to decode payload of '{}': {}",
                self.command, e
            ))
        })
    }

    /// Split into command and payload.
    pub fn into_parts(self) -> (String, Option<Vec<u8>>) {
        (self.command, self.payload)
    }
}
