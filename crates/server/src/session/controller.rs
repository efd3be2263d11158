use chrono::Utc;
use dashmap::DashSet;
use futures::future::{BoxFuture, FutureExt};
use shared::{CloseReason, ConnectionStatus, LifecycleState, StartSessionResponse};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{PendingQr, Session, SessionKey, SessionRegistry};
use crate::config::SessionConfig;
use crate::error::{SessionError, StoreError};
use crate::qr;
use crate::quota::QuotaGuard;
use crate::storage::CredentialStore;
use crate::store::DeviceStore;
use crate::transport::{ConnectionEvent, Connector};

const LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Drives device connections through their lifecycle.
///
/// Each open connection gets a driver task that feeds its events through
/// `handle_event`. Timers (QR expiry, credential purge, reconnect backoff)
/// run as their own tasks and re-check the registry before acting, so a
/// newer session for the same key is never touched by an older one's timer.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

struct Inner {
    config: SessionConfig,
    registry: SessionRegistry<Arc<Session>>,
    reconnecting: DashSet<SessionKey>,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialStore>,
    devices: Arc<dyn DeviceStore>,
    quota: QuotaGuard,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialStore>,
        devices: Arc<dyn DeviceStore>,
        quota: QuotaGuard,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: SessionRegistry::new(),
                reconnecting: DashSet::new(),
                connector,
                credentials,
                devices,
                quota,
            }),
        }
    }

    pub fn get(&self, owner_id: &str, device_id: &str) -> Option<Arc<Session>> {
        self.inner.registry.get(owner_id, device_id)
    }

    pub fn list(&self, owner_id: &str) -> Vec<String> {
        self.inner.registry.list(owner_id)
    }

    pub fn live_sessions(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn status(&self, owner_id: &str, device_id: &str) -> LifecycleState {
        if let Some(session) = self.get(owner_id, device_id) {
            return session.state();
        }
        if self.inner.reconnecting.contains(&SessionKey::new(owner_id, device_id)) {
            return LifecycleState::Disconnected { reconnecting: true };
        }
        LifecycleState::Unstarted
    }

    /// User-initiated pairing. Returns the first QR image if one arrives
    /// within the configured wait.
    pub async fn start(&self, owner_id: &str, device_id: &str) -> Result<StartSessionResponse, SessionError> {
        if let Some(existing) = self.get(owner_id, device_id) {
            tracing::debug!(owner_id, device_id, state = %existing.state(), "Session already exists");
            return Ok(StartSessionResponse {
                qr_image: existing.qr_image(),
                already_connected: true,
            });
        }

        let decision = self.inner.quota.can_add_device(owner_id, device_id).await?;
        if !decision.allowed {
            let reason = decision.reason.unwrap_or_else(|| "device not allowed".to_string());
            tracing::info!(owner_id, device_id, "Session start denied: {}", reason);
            return Err(SessionError::Denied(reason));
        }

        let key = SessionKey::new(owner_id, device_id);

        // Leftovers from an earlier pairing would make the bridge try to resume
        self.inner.credentials.delete_credential(&key).await?;

        let session = self.open(key.clone(), None, LifecycleState::AwaitingScan).await?;
        self.set_device_status(&key, ConnectionStatus::Pending, None).await;

        let mut qr_rx = session.subscribe_qr();
        let qr_image = match tokio::time::timeout(
            self.inner.config.qr_wait(),
            qr_rx.wait_for(|image| image.is_some()),
        )
        .await
        {
            Ok(Ok(image)) => (*image).clone(),
            _ => session.qr_image(),
        };

        if qr_image.is_none() {
            tracing::warn!(session = %key, "No QR code received yet");
        }

        Ok(StartSessionResponse {
            qr_image,
            already_connected: false,
        })
    }

    /// Reopen a previously paired device from its saved credentials
    pub async fn resume(&self, owner_id: &str, device_id: &str) -> Result<Arc<Session>, SessionError> {
        if let Some(existing) = self.get(owner_id, device_id) {
            return Ok(existing);
        }

        let key = SessionKey::new(owner_id, device_id);
        let credentials = self
            .inner
            .credentials
            .load_credential(&key)
            .await?
            .ok_or_else(|| SessionError::NoCredentials(key.to_string()))?;

        self.open(key, Some(credentials), LifecycleState::Unstarted).await
    }

    /// Tear a session down and delete its credentials. Safe to repeat.
    pub async fn destroy(&self, owner_id: &str, device_id: &str) -> Result<(), SessionError> {
        let key = SessionKey::new(owner_id, device_id);
        self.inner.reconnecting.remove(&key);

        match self.get(owner_id, device_id) {
            Some(session) => {
                tracing::info!(session = %key, "Destroying session");
                self.shutdown(&session, true).await;
            }
            None => tracing::debug!(session = %key, "No live session to destroy"),
        }

        self.inner.credentials.delete_credential(&key).await?;
        Ok(())
    }

    /// A usable session for dispatch, resuming it on demand and waiting for
    /// authentication up to the ready timeout
    pub async fn ensure_ready(&self, owner_id: &str, device_id: &str) -> Option<Arc<Session>> {
        let session = match self.get(owner_id, device_id) {
            Some(session) if session.is_usable() => return Some(session),
            Some(session) => session,
            None => match self.resume(owner_id, device_id).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::debug!(owner_id, device_id, "On-demand resume failed: {}", e);
                    return None;
                }
            },
        };

        let mut state = session.subscribe();
        let timed_out = tokio::time::timeout(
            self.inner.config.ready_timeout(),
            state.wait_for(|s| {
                s.is_authenticated() || matches!(s, LifecycleState::Disconnected { reconnecting: false })
            }),
        )
        .await
        .is_err();

        if timed_out {
            tracing::debug!(owner_id, device_id, "Session not ready in time");
        }
        session.is_usable().then_some(session)
    }

    /// Resume every device that was connected when the process last ran
    pub async fn restore_all(&self) -> Result<usize, StoreError> {
        let devices = self
            .inner
            .devices
            .devices_with_status(ConnectionStatus::Connected)
            .await?;

        let mut restored = 0;
        for device in devices {
            let key = SessionKey::new(&device.owner_id, &device.device_id);
            match self.resume(&device.owner_id, &device.device_id).await {
                Ok(_) => restored += 1,
                Err(SessionError::NoCredentials(_)) => {
                    tracing::info!(session = %key, "No saved credentials, marking device disconnected");
                    self.set_device_status(&key, ConnectionStatus::Disconnected, None).await;
                }
                Err(e) => tracing::warn!(session = %key, "Failed to restore session: {}", e),
            }
        }

        tracing::info!(restored, "Restored device sessions");
        Ok(restored)
    }

    async fn open(
        &self,
        key: SessionKey,
        credentials: Option<serde_json::Value>,
        initial: LifecycleState,
    ) -> Result<Arc<Session>, SessionError> {
        let (connection, events) = self.inner.connector.connect(&key, credentials).await?;
        let session = Arc::new(Session::new(key.clone(), connection, initial));

        if let Some(previous) = self
            .inner
            .registry
            .put(&key.owner_id, &key.device_id, session.clone())
        {
            tracing::warn!(session = %key, replaced = %previous.id(), "Replacing live session");
            previous.close();
            previous.clear_qr();
            if let Some(driver) = previous.take_driver() {
                driver.abort();
            }
            previous.connection().close();
        }

        let driver = tokio::spawn(self.clone().drive(session.clone(), events));
        session.set_driver(driver);

        tracing::info!(session = %key, id = %session.id(), state = %initial, "Opened device connection");
        Ok(session)
    }

    // Boxed because reconnects open new sessions from inside a driver
    fn drive(self, session: Arc<Session>, mut events: mpsc::Receiver<ConnectionEvent>) -> BoxFuture<'static, ()> {
        async move {
            while let Some(event) = events.recv().await {
                self.handle_event(&session, event).await;
                if session.is_closed() {
                    return;
                }
            }

            // Event stream ended without a close report
            self.on_disconnected(&session, CloseReason::ConnectionLost).await;
        }
        .boxed()
    }

    async fn handle_event(&self, session: &Arc<Session>, event: ConnectionEvent) {
        if session.is_closed() {
            return;
        }

        match event {
            ConnectionEvent::Qr(payload) => self.on_qr(session, payload),
            ConnectionEvent::Authenticated { identity } => self.on_authenticated(session, identity).await,
            ConnectionEvent::CredentialsUpdated(blob) => {
                if let Err(e) = self.inner.credentials.save_credential(session.key(), &blob).await {
                    tracing::warn!(session = %session.key(), "Failed to save credentials: {}", e);
                }
            }
            ConnectionEvent::Disconnected(reason) => self.on_disconnected(session, reason).await,
            ConnectionEvent::AuthFailure(message) => self.on_auth_failure(session, message).await,
        }
    }

    fn on_qr(&self, session: &Arc<Session>, payload: String) {
        if session.state().is_authenticated() {
            tracing::debug!(session = %session.key(), "Ignoring QR for authenticated session");
            return;
        }

        let image = match qr::render_data_url(&payload) {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(session = %session.key(), "Failed to render QR code: {}", e);
                None
            }
        };

        let pending = PendingQr {
            payload,
            image,
            issued_at: Utc::now(),
        };
        if !session.offer_qr(pending) {
            tracing::debug!(session = %session.key(), "QR already pending, ignoring refresh");
            return;
        }
        session.set_state(LifecycleState::AwaitingScan);

        let controller = self.clone();
        let key = session.key().clone();
        let session_id = session.id();
        let timeout = self.inner.config.qr_timeout();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            controller.expire_qr(&key, session_id).await;
        });
        session.set_qr_timer(timer);

        tracing::info!(
            session = %session.key(),
            timeout_secs = timeout.as_secs(),
            "QR code issued, waiting for scan"
        );
    }

    async fn expire_qr(&self, key: &SessionKey, session_id: Uuid) {
        let Some(session) = self.get(&key.owner_id, &key.device_id) else {
            return;
        };
        if session.id() != session_id {
            return;
        }

        // Detach our own handle so the teardown below does not cancel us
        drop(session.take_qr_timer());

        if session.state().is_authenticated() {
            tracing::debug!(session = %key, "Stale QR timeout after authentication");
            return;
        }

        tracing::info!(session = %key, "QR code not scanned in time, destroying session");
        self.shutdown(&session, true).await;
        if let Err(e) = self.inner.credentials.delete_credential(key).await {
            tracing::warn!(session = %key, "Failed to delete credentials: {}", e);
        }
    }

    async fn on_authenticated(&self, session: &Arc<Session>, identity: String) {
        let key = session.key();
        session.clear_qr();
        session.set_identity(identity.clone());
        session.set_state(LifecycleState::Authenticated);
        self.inner.reconnecting.remove(key);

        tracing::info!(session = %key, identity = %identity, "Device authenticated");

        self.set_device_status(key, ConnectionStatus::Connected, Some(Utc::now()))
            .await;
        if let Err(e) = self
            .inner
            .quota
            .register_device(&key.owner_id, &key.device_id)
            .await
        {
            tracing::warn!(session = %key, "Failed to record device against subscription: {}", e);
        }
    }

    async fn on_disconnected(&self, session: &Arc<Session>, reason: CloseReason) {
        if !session.close() {
            return;
        }

        let key = session.key().clone();
        let session_id = session.id();
        self.inner
            .registry
            .remove_if(&key.owner_id, &key.device_id, |s| s.id() == session_id);
        session.clear_qr();
        session.connection().close();

        tracing::info!(session = %key, ?reason, "Device connection closed");

        let has_credentials = if reason.is_logout() {
            false
        } else {
            match self.inner.credentials.load_credential(&key).await {
                Ok(credentials) => credentials.is_some(),
                Err(e) => {
                    tracing::warn!(session = %key, "Failed to read credentials: {}", e);
                    false
                }
            }
        };

        if has_credentials {
            session.set_state(LifecycleState::Disconnected { reconnecting: true });
            self.inner.reconnecting.insert(key.clone());
            let controller = self.clone();
            tokio::spawn(async move { controller.reconnect(key).await });
        } else {
            session.set_state(LifecycleState::Disconnected { reconnecting: false });
            self.set_device_status(&key, ConnectionStatus::Disconnected, None)
                .await;
            self.schedule_credential_purge(key);
        }
    }

    async fn on_auth_failure(&self, session: &Arc<Session>, message: String) {
        let key = session.key().clone();
        tracing::warn!(session = %key, "Authentication failed: {}", message);

        // Called from the driver task, which must not abort itself
        self.shutdown(session, false).await;
        if let Err(e) = self.inner.credentials.delete_credential(&key).await {
            tracing::warn!(session = %key, "Failed to delete credentials: {}", e);
        }
        self.set_device_status(&key, ConnectionStatus::AuthFailure, None)
            .await;
    }

    async fn reconnect(&self, key: SessionKey) {
        let max_attempts = self.inner.config.max_reconnect_attempts;

        for attempt in 1..=max_attempts {
            tokio::time::sleep(self.inner.config.reconnect_delay(attempt)).await;

            if !self.inner.reconnecting.contains(&key) {
                tracing::debug!(session = %key, "Reconnect cancelled");
                return;
            }
            if self.get(&key.owner_id, &key.device_id).is_some() {
                self.inner.reconnecting.remove(&key);
                return;
            }

            match self.resume(&key.owner_id, &key.device_id).await {
                Ok(_) => {
                    tracing::info!(session = %key, attempt, "Reconnected");
                    return;
                }
                Err(SessionError::NoCredentials(_)) => {
                    tracing::info!(session = %key, "Credentials gone, giving up reconnect");
                    break;
                }
                Err(e) => tracing::warn!(session = %key, attempt, max_attempts, "Reconnect failed: {}", e),
            }
        }

        self.inner.reconnecting.remove(&key);
        if self.get(&key.owner_id, &key.device_id).is_none() {
            self.set_device_status(&key, ConnectionStatus::Disconnected, None)
                .await;
        }
    }

    fn schedule_credential_purge(&self, key: SessionKey) {
        let controller = self.clone();
        let delay = self.inner.config.credential_purge_delay();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if controller.get(&key.owner_id, &key.device_id).is_some() {
                tracing::debug!(session = %key, "New session took over, keeping credentials");
                return;
            }
            match controller.inner.credentials.delete_credential(&key).await {
                Ok(()) => tracing::debug!(session = %key, "Purged credentials"),
                Err(e) => tracing::warn!(session = %key, "Failed to purge credentials: {}", e),
            }
        });
    }

    /// Close one session: unregister, cancel timers, log out, mark the device
    async fn shutdown(&self, session: &Arc<Session>, abort_driver: bool) {
        let key = session.key();
        let session_id = session.id();
        self.inner
            .registry
            .remove_if(&key.owner_id, &key.device_id, |s| s.id() == session_id);

        if !session.close() {
            return;
        }
        session.clear_qr();
        session.set_state(LifecycleState::Disconnected { reconnecting: false });

        match tokio::time::timeout(LOGOUT_TIMEOUT, session.connection().logout()).await {
            Ok(Ok(())) => tracing::debug!(session = %key, "Logged out"),
            Ok(Err(e)) => tracing::debug!(session = %key, "Logout failed: {}", e),
            Err(_) => tracing::debug!(session = %key, "Logout timed out"),
        }
        session.connection().close();

        if abort_driver {
            if let Some(driver) = session.take_driver() {
                driver.abort();
            }
        }

        self.set_device_status(key, ConnectionStatus::Disconnected, None)
            .await;
    }

    async fn set_device_status(
        &self,
        key: &SessionKey,
        status: ConnectionStatus,
        last_connected_at: Option<chrono::DateTime<Utc>>,
    ) {
        if let Err(e) = self
            .inner
            .devices
            .set_device_status(&key.owner_id, &key.device_id, status, last_connected_at)
            .await
        {
            tracing::warn!(session = %key, status = status.as_str(), "Failed to update device record: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SubscriptionStore;
    use crate::testing::{limited_plan, Harness};
    use std::sync::atomic::Ordering;

    fn key() -> SessionKey {
        SessionKey::new("u1", "d1")
    }

    #[tokio::test]
    async fn test_start_issues_qr_and_awaits_scan() {
        let h = Harness::new();
        h.subscribe("u1", limited_plan(10, 1, 30)).await;

        let response = h.sessions.start("u1", "d1").await.unwrap();
        assert!(!response.already_connected);
        let image = response.qr_image.unwrap();
        assert!(image.starts_with("data:image/svg+xml;base64,"));

        assert_eq!(h.sessions.status("u1", "d1"), LifecycleState::AwaitingScan);
        assert_eq!(h.store.device_status("u1", "d1"), Some(ConnectionStatus::Pending));
        assert_eq!(h.sessions.list("u1"), vec!["d1".to_string()]);

        let again = h.sessions.start("u1", "d1").await.unwrap();
        assert!(again.already_connected);
        assert_eq!(again.qr_image.as_deref(), Some(image.as_str()));
        assert_eq!(h.connector.connect_count(&key()), 1);
    }

    #[tokio::test]
    async fn test_start_purges_stale_credentials() {
        let h = Harness::new();
        h.subscribe("u1", limited_plan(10, 1, 30)).await;
        h.store.seed_credentials(&key());

        h.sessions.start("u1", "d1").await.unwrap();
        assert!(!h.store.has_credentials(&key()));
    }

    #[tokio::test]
    async fn test_start_respects_device_limit() {
        let h = Harness::new();
        h.subscribe("u1", limited_plan(10, 1, 30)).await;
        h.pair(&key()).await;

        let err = h.sessions.start("u1", "d2").await.unwrap_err();
        assert!(matches!(err, SessionError::Denied(ref r) if r == "Device limit reached"));
        assert!(h.sessions.get("u1", "d2").is_none());
    }

    #[tokio::test]
    async fn test_authentication_marks_device_connected() {
        let h = Harness::new();
        let sub = h.subscribe("u1", limited_plan(10, 2, 30)).await;
        h.pair(&key()).await;

        let session = h.sessions.get("u1", "d1").unwrap();
        assert_eq!(session.state(), LifecycleState::Authenticated);
        assert!(session.qr().is_none());
        assert_eq!(session.identity().as_deref(), Some("d1@s.whatsapp.net"));

        let device = h.store.device("u1", "d1").unwrap();
        assert_eq!(device.connection_status, ConnectionStatus::Connected);
        assert!(device.last_connected_at.is_some());

        let active = h.store.active_subscription("u1").await.unwrap().unwrap();
        assert_eq!(active.id, sub.id);
        assert_eq!(active.device_ids_consumed, vec!["d1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unscanned_qr_destroys_session() {
        let h = Harness::new();
        h.subscribe("u1", limited_plan(10, 1, 30)).await;
        h.sessions.start("u1", "d1").await.unwrap();
        assert!(h.sessions.get("u1", "d1").is_some());

        tokio::time::sleep(Duration::from_secs(61)).await;
        h.wait_until(|| h.sessions.get("u1", "d1").is_none()).await;

        assert_eq!(h.sessions.status("u1", "d1"), LifecycleState::Unstarted);
        assert_eq!(h.store.device_status("u1", "d1"), Some(ConnectionStatus::Disconnected));
        assert_eq!(h.connector.wire.logouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_qr_timeout_after_authentication_is_noop() {
        let h = Harness::new();
        h.subscribe("u1", limited_plan(10, 1, 30)).await;
        h.pair(&key()).await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        let session = h.sessions.get("u1", "d1").unwrap();
        assert!(session.is_usable());
    }

    #[tokio::test]
    async fn test_qr_refresh_is_ignored_while_one_is_pending() {
        let h = Harness::new();
        h.subscribe("u1", limited_plan(10, 1, 30)).await;
        h.sessions.start("u1", "d1").await.unwrap();
        let first = h.sessions.get("u1", "d1").unwrap().qr().unwrap();

        h.connector.emit(&key(), ConnectionEvent::Qr("rotated".into())).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let current = h.sessions.get("u1", "d1").unwrap().qr().unwrap();
        assert_eq!(current.payload, first.payload);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_swallows_logout_failure() {
        let h = Harness::new();
        h.subscribe("u1", limited_plan(10, 1, 30)).await;
        h.pair(&key()).await;
        h.connector.wire.logout_fails.store(true, Ordering::SeqCst);

        h.sessions.destroy("u1", "d1").await.unwrap();
        h.sessions.destroy("u1", "d1").await.unwrap();

        assert!(h.sessions.get("u1", "d1").is_none());
        assert!(h.sessions.list("u1").is_empty());
        assert!(!h.store.has_credentials(&key()));
        assert_eq!(h.connector.wire.logouts.load(Ordering::SeqCst), 1);
        // The link is dropped even though the logout failed
        assert_eq!(h.connector.wire.closes.load(Ordering::SeqCst), 1);

        // Never-started keys are fine too
        h.sessions.destroy("nobody", "nothing").await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_loss_reconnects_from_saved_credentials() {
        let h = Harness::new();
        h.subscribe("u1", limited_plan(10, 1, 30)).await;
        h.pair(&key()).await;
        let first = h.sessions.get("u1", "d1").unwrap();

        h.connector
            .emit(&key(), ConnectionEvent::Disconnected(CloseReason::ConnectionLost))
            .await;

        h.wait_until(|| {
            h.sessions
                .get("u1", "d1")
                .is_some_and(|s| s.id() != first.id() && s.is_usable())
        })
        .await;

        assert!(first.is_closed());
        assert_eq!(h.connector.connect_count(&key()), 2);
        assert!(h.store.has_credentials(&key()));
        assert_eq!(h.store.device_status("u1", "d1"), Some(ConnectionStatus::Connected));
    }

    #[tokio::test]
    async fn test_logout_purges_credentials_without_reconnect() {
        let h = Harness::new();
        h.subscribe("u1", limited_plan(10, 1, 30)).await;
        h.pair(&key()).await;

        h.connector
            .emit(&key(), ConnectionEvent::Disconnected(CloseReason::LoggedOut))
            .await;

        h.wait_until(|| !h.store.has_credentials(&key())).await;
        assert!(h.sessions.get("u1", "d1").is_none());
        assert_eq!(h.store.device_status("u1", "d1"), Some(ConnectionStatus::Disconnected));
        assert_eq!(h.connector.connect_count(&key()), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_tears_down_without_reconnect() {
        let h = Harness::new();
        h.subscribe("u1", limited_plan(10, 1, 30)).await;
        h.pair(&key()).await;

        h.connector
            .emit(&key(), ConnectionEvent::AuthFailure("bad credentials".into()))
            .await;

        h.wait_until(|| h.store.device_status("u1", "d1") == Some(ConnectionStatus::AuthFailure))
            .await;
        assert!(h.sessions.get("u1", "d1").is_none());
        assert!(!h.store.has_credentials(&key()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.connector.connect_count(&key()), 1);
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let h = Harness::new();
        h.subscribe("u1", limited_plan(10, 1, 30)).await;
        h.pair(&key()).await;
        h.connector.refuse.store(true, Ordering::SeqCst);

        h.connector
            .emit(&key(), ConnectionEvent::Disconnected(CloseReason::ConnectionLost))
            .await;
        h.wait_until(|| {
            h.sessions.status("u1", "d1") == LifecycleState::Disconnected { reconnecting: true }
        })
        .await;

        h.wait_until(|| h.store.device_status("u1", "d1") == Some(ConnectionStatus::Disconnected))
            .await;
        assert_eq!(h.sessions.status("u1", "d1"), LifecycleState::Unstarted);
    }

    #[tokio::test]
    async fn test_restore_all_resumes_connected_devices() {
        let h = Harness::new();
        let with_creds = SessionKey::new("u1", "d1");
        h.store.seed_credentials(&with_creds);
        h.store
            .set_device_status("u1", "d1", ConnectionStatus::Connected, Some(Utc::now()))
            .await
            .unwrap();
        h.store
            .set_device_status("u2", "d9", ConnectionStatus::Connected, None)
            .await
            .unwrap();

        assert_eq!(h.sessions.restore_all().await.unwrap(), 1);

        h.wait_until(|| h.sessions.get("u1", "d1").is_some_and(|s| s.is_usable()))
            .await;
        assert_eq!(h.store.device_status("u2", "d9"), Some(ConnectionStatus::Disconnected));
        assert!(h.sessions.get("u2", "d9").is_none());
    }

    #[tokio::test]
    async fn test_ensure_ready_resumes_on_demand() {
        let h = Harness::new();
        h.store.seed_credentials(&key());

        let session = h.sessions.ensure_ready("u1", "d1").await.unwrap();
        assert!(session.is_usable());

        // No credentials, nothing to resume
        assert!(h.sessions.ensure_ready("u1", "other").await.is_none());
    }

    #[tokio::test]
    async fn test_ensure_ready_times_out_on_unscanned_session() {
        let h = Harness::new();
        h.subscribe("u1", limited_plan(10, 1, 30)).await;
        h.sessions.start("u1", "d1").await.unwrap();

        assert!(h.sessions.ensure_ready("u1", "d1").await.is_none());
    }
}
