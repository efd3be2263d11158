//! Device connection seam.
//!
//! A connector opens one long-lived connection per device and hands back a
//! handle for outbound operations plus a stream of lifecycle events.

use async_trait::async_trait;
use shared::{Attachment, CloseReason};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::session::SessionKey;

mod bridge;

pub use bridge::BridgeConnector;

/// Everything a connection can report about its own lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A QR payload to show the user
    Qr(String),
    Authenticated { identity: String },
    /// Fresh credentials to hand to the credential store
    CredentialsUpdated(serde_json::Value),
    Disconnected(CloseReason),
    /// Saved credentials were rejected
    AuthFailure(String),
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn send_text(&self, to: &str, text: &str) -> Result<(), TransportError>;

    /// Send a file with the attachment's caption
    async fn send_media(&self, to: &str, attachment: &Attachment) -> Result<(), TransportError>;

    /// `None` when the transport cannot look numbers up
    async fn is_registered(&self, to: &str) -> Result<Option<bool>, TransportError>;

    async fn logout(&self) -> Result<(), TransportError>;

    /// Tear the link down from our side. Safe to call more than once.
    fn close(&self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        key: &SessionKey,
        credentials: Option<serde_json::Value>,
    ) -> Result<(Arc<dyn Connection>, mpsc::Receiver<ConnectionEvent>), TransportError>;
}
