use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Server <-> Device Bridge Messages
// ============================================================================

/// Messages sent from the server to the device bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerToBridge {
    /// Open the device connection, resuming from saved credentials if given
    Open {
        owner_id: String,
        device_id: String,
        #[serde(default)]
        credentials: Option<serde_json::Value>,
    },

    /// Send a text message
    SendText {
        request_id: Uuid,
        to: String,
        text: String,
    },

    /// Send a file from local storage with an optional caption
    SendMedia {
        request_id: Uuid,
        to: String,
        path: String,
        #[serde(default)]
        file_name: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
        #[serde(default)]
        caption: Option<String>,
    },

    /// Ask whether a number is registered on the network
    CheckNumber { request_id: Uuid, to: String },

    /// Log the device out and close the connection
    Logout { request_id: Uuid },

    /// Heartbeat to keep connection alive
    Heartbeat,
}

/// Messages sent from the device bridge to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeToServer {
    /// A QR payload to be scanned by the phone
    Qr { payload: String },

    /// Pairing or resume completed
    Authenticated { identity: String },

    /// Updated credentials to persist
    Credentials { blob: serde_json::Value },

    /// Connection closed
    Disconnected { reason: CloseReason },

    /// Credentials rejected; the device must pair again
    AuthFailure { message: String },

    /// Reply to a request carrying a `request_id`
    Ack {
        request_id: Uuid,
        ok: bool,
        /// Set by `CheckNumber` replies when the bridge supports lookups
        #[serde(default)]
        exists: Option<bool>,
        #[serde(default)]
        error: Option<String>,
    },

    /// Heartbeat response
    Heartbeat,
}

/// Why a device connection closed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The user unlinked the device or we logged out explicitly
    LoggedOut,
    /// Network drop or server-side restart
    ConnectionLost,
    /// Another client took over the session
    Replaced,
    TimedOut,
    Other(String),
}

impl CloseReason {
    pub fn is_logout(&self) -> bool {
        matches!(self, CloseReason::LoggedOut)
    }
}
