use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use shared::{Attachment, BridgeToServer, CloseReason, ServerToBridge};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use super::{Connection, ConnectionEvent, Connector};
use crate::error::TransportError;
use crate::session::SessionKey;

/// Reply to a correlated bridge request
#[derive(Debug)]
struct Ack {
    ok: bool,
    exists: Option<bool>,
    error: Option<String>,
}

type PendingAcks = Arc<DashMap<Uuid, oneshot::Sender<Ack>>>;

/// Opens device connections through the device bridge sidecar, one
/// WebSocket per device.
pub struct BridgeConnector {
    base_url: String,
    request_timeout: Duration,
}

impl BridgeConnector {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout,
        }
    }

    /// `{base}/devices/{owner}/{device}` with both ids percent-encoded
    fn device_url(&self, key: &SessionKey) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(["devices", key.owner_id.as_str(), key.device_id.as_str()]);
        Ok(url)
    }
}

#[async_trait]
impl Connector for BridgeConnector {
    async fn connect(
        &self,
        key: &SessionKey,
        credentials: Option<serde_json::Value>,
    ) -> Result<(Arc<dyn Connection>, mpsc::Receiver<ConnectionEvent>), TransportError> {
        let ws_url = self.device_url(key)?;
        tracing::debug!(session = %key, "Connecting to device bridge at {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str()).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let open = ServerToBridge::Open {
            owner_id: key.owner_id.clone(),
            device_id: key.device_id.clone(),
            credentials,
        };
        ws_sender
            .send(Message::Text(serde_json::to_string(&open)?))
            .await?;

        let (out_tx, mut out_rx) = mpsc::channel::<ServerToBridge>(32);
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(32);
        let pending: PendingAcks = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();

        // Task to forward outbound requests to the WebSocket
        let writer_key = key.clone();
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    msg = out_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(session = %writer_key, "Failed to encode bridge message: {}", e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            // Sends a close frame to the bridge
            let _ = ws_sender.close().await;
            tracing::debug!(session = %writer_key, "Bridge writer finished");
        });

        // Task to turn inbound frames into events and acks
        let reader_key = key.clone();
        let reader_pending = pending.clone();
        let heartbeat_tx = out_tx.clone();
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut reported_close = false;

            loop {
                let frame = tokio::select! {
                    _ = reader_cancel.cancelled() => {
                        // Closed by us, nobody is waiting for a disconnect
                        reported_close = true;
                        break;
                    }
                    frame = ws_receiver.next() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!(session = %reader_key, "Bridge socket error: {}", e);
                        break;
                    }
                };

                let parsed: BridgeToServer = match serde_json::from_str(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!(session = %reader_key, "Failed to parse bridge message: {}", e);
                        continue;
                    }
                };

                let event = match parsed {
                    BridgeToServer::Ack {
                        request_id,
                        ok,
                        exists,
                        error,
                    } => {
                        if let Some((_, waiter)) = reader_pending.remove(&request_id) {
                            let _ = waiter.send(Ack { ok, exists, error });
                        }
                        continue;
                    }
                    BridgeToServer::Heartbeat => {
                        let _ = heartbeat_tx.try_send(ServerToBridge::Heartbeat);
                        continue;
                    }
                    BridgeToServer::Qr { payload } => ConnectionEvent::Qr(payload),
                    BridgeToServer::Authenticated { identity } => {
                        ConnectionEvent::Authenticated { identity }
                    }
                    BridgeToServer::Credentials { blob } => ConnectionEvent::CredentialsUpdated(blob),
                    BridgeToServer::AuthFailure { message } => ConnectionEvent::AuthFailure(message),
                    BridgeToServer::Disconnected { reason } => {
                        reported_close = true;
                        ConnectionEvent::Disconnected(reason)
                    }
                };

                if event_tx.send(event).await.is_err() {
                    break;
                }
                if reported_close {
                    break;
                }
            }

            // Fail outstanding requests instead of leaving them to time out
            reader_pending.clear();
            // Stop the writer too when the bridge hung up first
            reader_cancel.cancel();

            if !reported_close {
                let _ = event_tx
                    .send(ConnectionEvent::Disconnected(CloseReason::ConnectionLost))
                    .await;
            }
            tracing::debug!(session = %reader_key, "Bridge reader finished");
        });

        let connection = BridgeConnection {
            out_tx,
            pending,
            request_timeout: self.request_timeout,
            cancel,
        };
        Ok((Arc::new(connection), event_rx))
    }
}

struct BridgeConnection {
    out_tx: mpsc::Sender<ServerToBridge>,
    pending: PendingAcks,
    request_timeout: Duration,
    cancel: CancellationToken,
}

impl Drop for BridgeConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl BridgeConnection {
    async fn request(&self, request_id: Uuid, msg: ServerToBridge) -> Result<Ack, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        if self.out_tx.send(msg).await.is_err() {
            self.pending.remove(&request_id);
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn request_ok(&self, request_id: Uuid, msg: ServerToBridge) -> Result<Ack, TransportError> {
        let ack = self.request(request_id, msg).await?;
        if ack.ok {
            Ok(ack)
        } else {
            Err(TransportError::Rejected(
                ack.error.unwrap_or_else(|| "request rejected by bridge".to_string()),
            ))
        }
    }
}

#[async_trait]
impl Connection for BridgeConnection {
    async fn send_text(&self, to: &str, text: &str) -> Result<(), TransportError> {
        let request_id = Uuid::new_v4();
        let msg = ServerToBridge::SendText {
            request_id,
            to: to.to_string(),
            text: text.to_string(),
        };
        self.request_ok(request_id, msg).await.map(|_| ())
    }

    async fn send_media(&self, to: &str, attachment: &Attachment) -> Result<(), TransportError> {
        let request_id = Uuid::new_v4();
        let msg = ServerToBridge::SendMedia {
            request_id,
            to: to.to_string(),
            path: attachment.path.clone(),
            file_name: attachment.file_name.clone(),
            mime_type: attachment.mime_type.clone(),
            caption: attachment.caption.clone(),
        };
        self.request_ok(request_id, msg).await.map(|_| ())
    }

    async fn is_registered(&self, to: &str) -> Result<Option<bool>, TransportError> {
        let request_id = Uuid::new_v4();
        let msg = ServerToBridge::CheckNumber {
            request_id,
            to: to.to_string(),
        };
        let ack = self.request_ok(request_id, msg).await?;
        Ok(ack.exists)
    }

    async fn logout(&self) -> Result<(), TransportError> {
        let request_id = Uuid::new_v4();
        self.request_ok(request_id, ServerToBridge::Logout { request_id })
            .await
            .map(|_| ())
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}
