//! In-memory fakes for the store, credential, and transport seams.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use shared::{
    Attachment, ConnectionStatus, DeviceRecord, MessageLog, MessageStatus, Plan, PlanType,
    Subscription, SubscriptionStatus,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{StoreError, TransportError};
use crate::quota::{MemoryQuotaCache, QuotaGuard};
use crate::session::{SessionController, SessionKey};
use crate::storage::CredentialStore;
use crate::store::{DeviceStore, MessageLogStore, StoreResult, SubscriptionStore};
use crate::transport::{Connection, ConnectionEvent, Connector};

pub fn limited_plan(limit: u64, device_limit: u32, duration_days: u32) -> Plan {
    Plan {
        id: Uuid::new_v4(),
        name: format!("Limited {}", limit),
        plan_type: PlanType::Limited,
        message_limit: Some(limit),
        device_limit,
        duration_days,
        price: 10.0,
        active: true,
    }
}

pub fn unlimited_plan(device_limit: u32, duration_days: u32) -> Plan {
    Plan {
        id: Uuid::new_v4(),
        name: "Unlimited".to_string(),
        plan_type: PlanType::Unlimited,
        message_limit: None,
        device_limit,
        duration_days,
        price: 50.0,
        active: true,
    }
}

/// Every store trait over plain maps
#[derive(Default)]
pub struct MemoryStore {
    devices: Mutex<HashMap<(String, String), DeviceRecord>>,
    plans: Mutex<HashMap<Uuid, Plan>>,
    subscriptions: Mutex<Vec<Subscription>>,
    logs: Mutex<Vec<MessageLog>>,
    credentials: Mutex<HashMap<SessionKey, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(&self, owner_id: &str, device_id: &str) -> Option<DeviceRecord> {
        self.devices
            .lock()
            .unwrap()
            .get(&(owner_id.to_string(), device_id.to_string()))
            .cloned()
    }

    pub fn device_status(&self, owner_id: &str, device_id: &str) -> Option<ConnectionStatus> {
        self.device(owner_id, device_id).map(|d| d.connection_status)
    }

    pub fn active_count(&self, owner_id: &str) -> usize {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.owner_id == owner_id && s.is_active)
            .count()
    }

    pub fn all_logs(&self) -> Vec<MessageLog> {
        self.logs.lock().unwrap().clone()
    }

    pub fn has_credentials(&self, key: &SessionKey) -> bool {
        self.credentials.lock().unwrap().contains_key(key)
    }

    pub fn seed_credentials(&self, key: &SessionKey) {
        self.credentials
            .lock()
            .unwrap()
            .insert(key.clone(), serde_json::json!({ "seed": key.to_string() }));
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn set_device_status(
        &self,
        owner_id: &str,
        device_id: &str,
        status: ConnectionStatus,
        last_connected_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut devices = self.devices.lock().unwrap();
        let record = devices
            .entry((owner_id.to_string(), device_id.to_string()))
            .or_insert_with(|| DeviceRecord {
                owner_id: owner_id.to_string(),
                device_id: device_id.to_string(),
                connection_status: status,
                last_connected_at: None,
            });
        record.connection_status = status;
        if last_connected_at.is_some() {
            record.last_connected_at = last_connected_at;
        }
        Ok(())
    }

    async fn devices_for_owner(&self, owner_id: &str) -> StoreResult<Vec<DeviceRecord>> {
        let mut out: Vec<DeviceRecord> = self
            .devices
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.owner_id == owner_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(out)
    }

    async fn devices_with_status(&self, status: ConnectionStatus) -> StoreResult<Vec<DeviceRecord>> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.connection_status == status)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn find_plan(&self, plan_id: Uuid) -> StoreResult<Option<Plan>> {
        Ok(self.plans.lock().unwrap().get(&plan_id).cloned())
    }

    async fn save_plan(&self, plan: &Plan) -> StoreResult<()> {
        self.plans.lock().unwrap().insert(plan.id, plan.clone());
        Ok(())
    }

    async fn active_subscription(&self, owner_id: &str) -> StoreResult<Option<Subscription>> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.owner_id == owner_id && s.is_active)
            .cloned())
    }

    async fn queued_subscriptions(&self, owner_id: &str) -> StoreResult<Vec<Subscription>> {
        let mut queued: Vec<Subscription> = self
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.owner_id == owner_id && s.status == SubscriptionStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by_key(|s| s.created_at);
        Ok(queued)
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> StoreResult<()> {
        self.subscriptions.lock().unwrap().push(subscription.clone());
        Ok(())
    }

    async fn update_subscription(&self, subscription: &Subscription) -> StoreResult<()> {
        let mut subs = self.subscriptions.lock().unwrap();
        let existing = subs
            .iter_mut()
            .find(|s| s.id == subscription.id)
            .ok_or_else(|| StoreError::NotFound(format!("subscription {}", subscription.id)))?;
        let devices = std::mem::take(&mut existing.device_ids_consumed);
        *existing = subscription.clone();
        existing.device_ids_consumed = devices;
        Ok(())
    }

    async fn increment_usage(&self, subscription_id: Uuid, by: u64) -> StoreResult<()> {
        let mut subs = self.subscriptions.lock().unwrap();
        let sub = subs
            .iter_mut()
            .find(|s| s.id == subscription_id)
            .ok_or_else(|| StoreError::NotFound(format!("subscription {}", subscription_id)))?;
        sub.used_message_count += by;
        Ok(())
    }

    async fn add_consumed_device(&self, subscription_id: Uuid, device_id: &str) -> StoreResult<()> {
        let mut subs = self.subscriptions.lock().unwrap();
        let sub = subs
            .iter_mut()
            .find(|s| s.id == subscription_id)
            .ok_or_else(|| StoreError::NotFound(format!("subscription {}", subscription_id)))?;
        if !sub.device_ids_consumed.iter().any(|d| d == device_id) {
            sub.device_ids_consumed.push(device_id.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl MessageLogStore for MemoryStore {
    async fn insert_log(&self, entry: &MessageLog) -> StoreResult<()> {
        self.logs.lock().unwrap().push(entry.clone());
        Ok(())
    }

    async fn update_log_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        error_message: Option<&str>,
        sent_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut logs = self.logs.lock().unwrap();
        let row = logs
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("message log {}", id)))?;
        row.status = status;
        row.error_message = error_message.map(str::to_string);
        row.sent_at = sent_at;
        Ok(())
    }

    async fn logs_for_owner(&self, owner_id: &str, limit: usize) -> StoreResult<Vec<MessageLog>> {
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|l| l.owner_id == owner_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn logs_for_job(&self, job_id: Uuid) -> StoreResult<Vec<MessageLog>> {
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.job_id == job_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn load_credential(&self, key: &SessionKey) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.credentials.lock().unwrap().get(key).cloned())
    }

    async fn save_credential(&self, key: &SessionKey, blob: &serde_json::Value) -> Result<(), StoreError> {
        self.credentials.lock().unwrap().insert(key.clone(), blob.clone());
        Ok(())
    }

    async fn delete_credential(&self, key: &SessionKey) -> Result<(), StoreError> {
        self.credentials.lock().unwrap().remove(key);
        Ok(())
    }
}

/// What a fake connection was asked to send
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Text { to: String, text: String },
    Media { to: String, path: String, caption: Option<String> },
}

impl Sent {
    pub fn to(&self) -> &str {
        match self {
            Sent::Text { to, .. } | Sent::Media { to, .. } => to,
        }
    }
}

/// State shared by every connection a `FakeConnector` hands out
#[derive(Default)]
pub struct FakeWire {
    pub sent: Mutex<Vec<Sent>>,
    /// Sends to these addresses fail
    pub failing: Mutex<HashSet<String>>,
    /// Lookups for these addresses report "not on the network"
    pub unregistered: Mutex<HashSet<String>>,
    /// Text sends to these addresses panic
    pub panicking: Mutex<HashSet<String>>,
    pub logouts: AtomicUsize,
    /// Make `logout` fail, to check it is swallowed
    pub logout_fails: AtomicBool,
    pub closes: AtomicUsize,
}

impl FakeWire {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_sends_to(&self, address: &str) {
        self.failing.lock().unwrap().insert(address.to_string());
    }

    pub fn mark_unregistered(&self, address: &str) {
        self.unregistered.lock().unwrap().insert(address.to_string());
    }

    pub fn panic_on_send_to(&self, address: &str) {
        self.panicking.lock().unwrap().insert(address.to_string());
    }

    pub fn recipients(&self) -> Vec<String> {
        self.sent().iter().map(|s| s.to().to_string()).collect()
    }
}

pub struct FakeConnection {
    wire: Arc<FakeWire>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn send_text(&self, to: &str, text: &str) -> Result<(), TransportError> {
        let explode = self.wire.panicking.lock().unwrap().contains(to);
        if explode {
            panic!("fake connection blew up sending to {}", to);
        }
        if self.wire.failing.lock().unwrap().contains(to) {
            return Err(TransportError::Rejected(format!("send to {} failed", to)));
        }
        self.wire.sent.lock().unwrap().push(Sent::Text {
            to: to.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_media(&self, to: &str, attachment: &Attachment) -> Result<(), TransportError> {
        if self.wire.failing.lock().unwrap().contains(to) {
            return Err(TransportError::Rejected(format!("send to {} failed", to)));
        }
        self.wire.sent.lock().unwrap().push(Sent::Media {
            to: to.to_string(),
            path: attachment.path.clone(),
            caption: attachment.caption.clone(),
        });
        Ok(())
    }

    async fn is_registered(&self, to: &str) -> Result<Option<bool>, TransportError> {
        Ok(Some(!self.wire.unregistered.lock().unwrap().contains(to)))
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.wire.logouts.fetch_add(1, Ordering::SeqCst);
        if self.wire.logout_fails.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn close(&self) {
        self.wire.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out fake connections and keeps each key's event sender so tests
/// can drive the lifecycle by hand.
pub struct FakeConnector {
    pub wire: Arc<FakeWire>,
    events: DashMap<SessionKey, mpsc::Sender<ConnectionEvent>>,
    connects: DashMap<SessionKey, usize>,
    /// Resumes with saved credentials authenticate immediately
    pub auto_authenticate: AtomicBool,
    /// Fresh starts emit a QR immediately
    pub auto_qr: AtomicBool,
    pub refuse: AtomicBool,
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self {
            wire: Arc::new(FakeWire::default()),
            events: DashMap::new(),
            connects: DashMap::new(),
            auto_authenticate: AtomicBool::new(true),
            auto_qr: AtomicBool::new(true),
            refuse: AtomicBool::new(false),
        }
    }
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_count(&self, key: &SessionKey) -> usize {
        self.connects.get(key).map(|c| *c).unwrap_or(0)
    }

    /// Push a lifecycle event into the latest connection for `key`
    pub async fn emit(&self, key: &SessionKey, event: ConnectionEvent) {
        let sender = self.events.get(key).map(|s| s.clone());
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        key: &SessionKey,
        credentials: Option<serde_json::Value>,
    ) -> Result<(Arc<dyn Connection>, mpsc::Receiver<ConnectionEvent>), TransportError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        *self.connects.entry(key.clone()).or_insert(0) += 1;

        let (tx, rx) = mpsc::channel(32);
        if credentials.is_some() && self.auto_authenticate.load(Ordering::SeqCst) {
            let _ = tx.try_send(ConnectionEvent::Authenticated {
                identity: format!("{}@s.whatsapp.net", key.device_id),
            });
        } else if credentials.is_none() && self.auto_qr.load(Ordering::SeqCst) {
            let _ = tx.try_send(ConnectionEvent::Qr(format!("qr-{}", key)));
        }
        self.events.insert(key.clone(), tx);

        let connection = FakeConnection {
            wire: self.wire.clone(),
        };
        Ok((Arc::new(connection), rx))
    }
}

/// Controller wired to in-memory collaborators
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub connector: Arc<FakeConnector>,
    pub quota: QuotaGuard,
    pub sessions: SessionController,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(fast_session_config())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let connector = Arc::new(FakeConnector::new());
        let quota = QuotaGuard::new(store.clone(), Arc::new(MemoryQuotaCache::new()));
        let sessions = SessionController::new(
            config,
            connector.clone(),
            store.clone(),
            store.clone(),
            quota.clone(),
        );
        Self {
            store,
            connector,
            quota,
            sessions,
        }
    }

    /// Give `owner_id` an active plan
    pub async fn subscribe(&self, owner_id: &str, plan: Plan) -> Subscription {
        self.store.save_plan(&plan).await.unwrap();
        self.quota.assign_plan(owner_id, plan.id).await.unwrap()
    }

    /// Drive `key` through pairing to an authenticated session
    pub async fn pair(&self, key: &SessionKey) {
        self.sessions.start(&key.owner_id, &key.device_id).await.unwrap();
        self.connector
            .emit(
                key,
                ConnectionEvent::CredentialsUpdated(serde_json::json!({ "paired": key.to_string() })),
            )
            .await;
        self.connector
            .emit(
                key,
                ConnectionEvent::Authenticated {
                    identity: format!("{}@s.whatsapp.net", key.device_id),
                },
            )
            .await;
        self.wait_until(|| {
            self.sessions
                .get(&key.owner_id, &key.device_id)
                .is_some_and(|s| s.is_usable())
        })
        .await;
    }

    /// Poll `cond` until it holds, yielding to spawned tasks in between
    pub async fn wait_until(&self, mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }
}

pub fn fast_session_config() -> SessionConfig {
    SessionConfig {
        qr_timeout_secs: 60,
        qr_wait_secs: 1,
        credential_purge_delay_ms: 20,
        max_reconnect_attempts: 3,
        reconnect_base_delay_ms: 10,
        ready_timeout_secs: 1,
    }
}
