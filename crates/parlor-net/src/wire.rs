//! The `$`-tagged JSON message schema shared by broker and clients.
//!
//! The field `$` names the message kind. Unrecognized kinds decode to
//! [`WireError::UnknownKind`], which readers log and skip so old peers
//! tolerate newer brokers.

use serde::{Deserialize, Serialize};

/// Every message kind this build understands.
const KNOWN_KINDS: &[&str] = &[
    "get_time",
    "info_time",
    "post",
    "info_post",
    "load",
    "watch",
    "unwatch",
];

/// One wire message; the serde tag `$` is the kind discriminant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$", rename_all = "snake_case")]
pub enum Message {
    /// Client requests broker time.
    GetTime,
    /// Broker time at send.
    InfoTime {
        /// Broker wall clock in ms.
        time: i64,
    },
    /// Client publishes an event; the broker stamps `server_time` and
    /// assigns a dense index.
    Post {
        /// Target room.
        room: String,
        /// Originator's estimated server time in ms.
        time: i64,
        /// Opaque unique name, echoed back verbatim.
        name: String,
        /// Opaque application payload.
        data: serde_json::Value,
    },
    /// Echo, live delivery, or backfill — the same message serves all three.
    InfoPost {
        /// Room the post belongs to.
        room: String,
        /// Dense position in the room log.
        index: i64,
        /// Broker receive time in ms.
        server_time: i64,
        /// Originator's claimed time in ms.
        client_time: i64,
        /// The name the originator chose.
        name: String,
        /// Opaque application payload.
        data: serde_json::Value,
    },
    /// Request the backlog from `from` onward, streamed as `info_post`.
    Load {
        /// Room to read.
        room: String,
        /// First index wanted.
        from: u64,
    },
    /// Subscribe to future posts for a room.
    Watch {
        /// Room to watch.
        room: String,
    },
    /// Drop the subscription for a room.
    Unwatch {
        /// Room to stop watching.
        room: String,
    },
}

/// Errors from decoding a frame into a [`Message`].
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The frame is not a JSON object with the expected fields.
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame has no `$` kind field.
    #[error("message has no \"$\" kind")]
    MissingKind,

    /// The kind is not one this build understands; skippable.
    #[error("unknown message kind {0:?}")]
    UnknownKind(String),
}

impl WireError {
    /// `true` for errors a reader should log and skip rather than treat
    /// as a protocol failure.
    pub fn is_skippable(&self) -> bool {
        matches!(self, WireError::UnknownKind(_))
    }
}

/// Encodes a message as one JSON frame payload.
pub fn encode(message: &Message) -> Result<String, WireError> {
    Ok(serde_json::to_string(message)?)
}

/// Decodes one frame payload, distinguishing unknown kinds from malformed
/// known ones.
pub fn decode(raw: &str) -> Result<Message, WireError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let kind = value
        .get("$")
        .and_then(serde_json::Value::as_str)
        .ok_or(WireError::MissingKind)?
        .to_string();
    serde_json::from_value(value).map_err(|err| {
        if KNOWN_KINDS.contains(&kind.as_str()) {
            WireError::Json(err)
        } else {
            WireError::UnknownKind(kind)
        }
    })
}
