//! Device sessions: runtime state for one connection, the registry that
//! finds it, and the controller that drives its lifecycle.

use chrono::{DateTime, Utc};
use shared::LifecycleState;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::transport::Connection;

mod controller;
mod registry;

pub use controller::SessionController;
pub use registry::SessionRegistry;

/// Identifies a device session: one per (owner, device)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub owner_id: String,
    pub device_id: String,
}

impl SessionKey {
    pub fn new(owner_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            device_id: device_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner_id, self.device_id)
    }
}

/// QR code waiting to be scanned
#[derive(Debug, Clone)]
pub struct PendingQr {
    pub payload: String,
    /// Rendered data URL, absent if rendering failed
    pub image: Option<String>,
    pub issued_at: DateTime<Utc>,
}

#[derive(Default)]
struct SessionInner {
    qr: Option<PendingQr>,
    qr_timer: Option<JoinHandle<()>>,
    identity: Option<String>,
    driver: Option<JoinHandle<()>>,
}

/// One authenticated (or authenticating) device connection.
///
/// Owned by the controller; the registry only hands out lookups.
pub struct Session {
    id: Uuid,
    key: SessionKey,
    connection: Arc<dyn Connection>,
    state: watch::Sender<LifecycleState>,
    qr_image: watch::Sender<Option<String>>,
    closed: AtomicBool,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub(crate) fn new(key: SessionKey, connection: Arc<dyn Connection>, state: LifecycleState) -> Self {
        let (state, _) = watch::channel(state);
        let (qr_image, _) = watch::channel(None);
        Self {
            id: Uuid::new_v4(),
            key,
            connection,
            state,
            qr_image,
            closed: AtomicBool::new(false),
            inner: Mutex::new(SessionInner::default()),
        }
    }

    /// Distinguishes this connection from later ones for the same key
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn subscribe_qr(&self) -> watch::Receiver<Option<String>> {
        self.qr_image.subscribe()
    }

    /// Authenticated and not torn down
    pub fn is_usable(&self) -> bool {
        !self.is_closed() && self.state().is_authenticated()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn qr(&self) -> Option<PendingQr> {
        self.lock().qr.clone()
    }

    pub fn qr_image(&self) -> Option<String> {
        self.qr_image.borrow().clone()
    }

    pub fn identity(&self) -> Option<String> {
        self.lock().identity.clone()
    }

    pub(crate) fn set_state(&self, state: LifecycleState) {
        self.state.send_replace(state);
    }

    /// Returns true if this call closed the session
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Buffer a QR unless one is already pending
    pub(crate) fn offer_qr(&self, qr: PendingQr) -> bool {
        let mut inner = self.lock();
        if inner.qr.is_some() {
            return false;
        }
        self.qr_image.send_replace(qr.image.clone());
        inner.qr = Some(qr);
        true
    }

    pub(crate) fn set_qr_timer(&self, timer: JoinHandle<()>) {
        if let Some(old) = self.lock().qr_timer.replace(timer) {
            old.abort();
        }
    }

    /// Detach the QR timer without cancelling it
    pub(crate) fn take_qr_timer(&self) -> Option<JoinHandle<()>> {
        self.lock().qr_timer.take()
    }

    /// Drop the pending QR and cancel its timer
    pub(crate) fn clear_qr(&self) {
        let mut inner = self.lock();
        inner.qr = None;
        if let Some(timer) = inner.qr_timer.take() {
            timer.abort();
        }
        self.qr_image.send_replace(None);
    }

    pub(crate) fn set_identity(&self, identity: String) {
        self.lock().identity = Some(identity);
    }

    pub(crate) fn set_driver(&self, driver: JoinHandle<()>) {
        self.lock().driver = Some(driver);
    }

    pub(crate) fn take_driver(&self) -> Option<JoinHandle<()>> {
        self.lock().driver.take()
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        // Nothing panics while holding the lock, so poisoning is recoverable
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}
