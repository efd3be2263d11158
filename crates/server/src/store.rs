//! Document store interfaces.
//!
//! The core only reads and writes the pieces of the user document it owns:
//! device records, subscriptions with their plans, and the message log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{ConnectionStatus, DeviceRecord, MessageLog, MessageStatus, Plan, Subscription};
use uuid::Uuid;

use crate::error::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

/// Device records embedded in the user entity
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Upsert the device's connection status. `last_connected_at` is only
    /// overwritten when provided.
    async fn set_device_status(
        &self,
        owner_id: &str,
        device_id: &str,
        status: ConnectionStatus,
        last_connected_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    async fn devices_for_owner(&self, owner_id: &str) -> StoreResult<Vec<DeviceRecord>>;

    /// Devices across all owners with the given status (used for restore on boot)
    async fn devices_with_status(&self, status: ConnectionStatus) -> StoreResult<Vec<DeviceRecord>>;
}

/// Plans and the subscriptions embedded in the user entity
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_plan(&self, plan_id: Uuid) -> StoreResult<Option<Plan>>;

    async fn save_plan(&self, plan: &Plan) -> StoreResult<()>;

    /// The subscription with `is_active = true`, if any
    async fn active_subscription(&self, owner_id: &str) -> StoreResult<Option<Subscription>>;

    /// Queued subscriptions, oldest first
    async fn queued_subscriptions(&self, owner_id: &str) -> StoreResult<Vec<Subscription>>;

    async fn insert_subscription(&self, subscription: &Subscription) -> StoreResult<()>;

    /// Overwrite dates, counters, and status. Consumed devices are managed
    /// through `add_consumed_device`.
    async fn update_subscription(&self, subscription: &Subscription) -> StoreResult<()>;

    /// Atomically add `by` to the persisted message counter
    async fn increment_usage(&self, subscription_id: Uuid, by: u64) -> StoreResult<()>;

    async fn add_consumed_device(&self, subscription_id: Uuid, device_id: &str) -> StoreResult<()>;
}

/// Append-only delivery audit trail
#[async_trait]
pub trait MessageLogStore: Send + Sync {
    async fn insert_log(&self, entry: &MessageLog) -> StoreResult<()>;

    /// The only mutation allowed: moving a pre-created row to its final status
    async fn update_log_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        error_message: Option<&str>,
        sent_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Most recent first
    async fn logs_for_owner(&self, owner_id: &str, limit: usize) -> StoreResult<Vec<MessageLog>>;

    /// In insertion order
    async fn logs_for_job(&self, job_id: Uuid) -> StoreResult<Vec<MessageLog>>;
}
