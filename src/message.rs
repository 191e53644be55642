use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known message type tags.
///
/// The set is open: clients ignore tags they don't understand, so the hub
/// forwards any tag unchanged.
pub mod types {
    /// Informational output from the watcher (stdout, or benign stderr).
    pub const OUTPUT: &str = "tailwind-output";
    /// A stderr line that looks like a failure.
    pub const ERROR: &str = "tailwind-error";
    pub const STARTED: &str = "tailwind-started";
    pub const STOPPED: &str = "tailwind-stopped";
    /// Per-connection handshake carrying the output stylesheet name.
    pub const CSS_FILE: &str = "__CSS_FILE__";
}

/// Prefix the watcher prints once a rebuild finished. Clients treat an
/// output line starting with this as "stylesheet is ready".
pub const DONE_PREFIX: &str = "Done in";

/// A broadcast event, serialized as `{"type", "message", "timestamp"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    kind: String,
    message: String,
    timestamp: DateTime<Utc>,
}

impl Message {
    /// Build a message stamped with the current instant.
    pub fn now(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::at(kind, message, Utc::now())
    }

    pub fn at(kind: impl Into<String>, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            timestamp,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// True for an output line announcing a finished rebuild.
    pub fn is_rebuild_done(&self) -> bool {
        self.kind == types::OUTPUT && self.message.starts_with(DONE_PREFIX)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// The timestamp-less `{"type", "message"}` frame used for targeted sends.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub message: &'a str,
}

impl<'a> Envelope<'a> {
    pub fn new(kind: &'a str, message: &'a str) -> Self {
        Self { kind, message }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
