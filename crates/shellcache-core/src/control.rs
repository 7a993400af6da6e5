use serde::{Deserialize, Serialize};
use tracing::debug;

/// Out-of-band messages from application instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Activate the waiting generation without waiting for old instances to close
    SkipWaiting,
}

impl ControlMessage {
    /// Parse a message. Anything unrecognized is ignored.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        match serde_json::from_slice(bytes) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!(error = %e, "Ignoring unrecognized control message");
                None
            }
        }
    }
}
