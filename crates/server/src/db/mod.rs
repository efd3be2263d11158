use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use shared::{ConnectionStatus, DeviceRecord, MessageLog, MessageStatus, Plan, Subscription};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use uuid::Uuid;

use crate::store::{DeviceStore, MessageLogStore, StoreResult, SubscriptionStore};

mod models;

pub use models::*;

/// Fixed-width RFC3339 so stored timestamps sort lexicographically
pub(crate) fn fmt_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(path: &str) -> StoreResult<Self> {
        // Ensure the directory exists
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", path);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Private in-memory database; a single connection keeps every query on
    /// the same memory instance.
    pub async fn in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                owner_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                connection_status TEXT NOT NULL DEFAULT 'pending',
                last_connected_at TEXT,
                PRIMARY KEY (owner_id, device_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS plans (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                plan_type TEXT NOT NULL,
                message_limit INTEGER,
                device_limit INTEGER NOT NULL,
                duration_days INTEGER NOT NULL,
                price REAL NOT NULL DEFAULT 0,
                active BOOLEAN NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                plan_id TEXT NOT NULL REFERENCES plans(id),
                start_date TEXT,
                end_date TEXT,
                used_message_count INTEGER NOT NULL DEFAULT 0,
                is_active BOOLEAN NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscription_devices (
                subscription_id TEXT NOT NULL REFERENCES subscriptions(id),
                device_id TEXT NOT NULL,
                PRIMARY KEY (subscription_id, device_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_logs (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                recipient TEXT NOT NULL,
                text TEXT NOT NULL,
                attachments TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL,
                error_message TEXT,
                sent_at TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_message_logs_owner ON message_logs(owner_id, created_at)")
            .execute(&self.pool)
            .await?;

        tracing::info!("Database migrations completed");
        Ok(())
    }

    async fn consumed_devices(&self, subscription_id: &str) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT device_id FROM subscription_devices WHERE subscription_id = ? ORDER BY rowid ASC",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn hydrate(&self, row: SubscriptionRow) -> StoreResult<Subscription> {
        let devices = self.consumed_devices(&row.id).await?;
        row.into_subscription(devices)
    }
}

const SUBSCRIPTION_COLUMNS: &str =
    "id, owner_id, plan_id, start_date, end_date, used_message_count, is_active, status, created_at";

const MESSAGE_LOG_COLUMNS: &str =
    "id, job_id, owner_id, device_id, recipient, text, attachments, status, error_message, sent_at, created_at";

#[async_trait]
impl DeviceStore for Database {
    async fn set_device_status(
        &self,
        owner_id: &str,
        device_id: &str,
        status: ConnectionStatus,
        last_connected_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (owner_id, device_id, connection_status, last_connected_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(owner_id, device_id) DO UPDATE SET
                connection_status = excluded.connection_status,
                last_connected_at = COALESCE(excluded.last_connected_at, devices.last_connected_at)
            "#,
        )
        .bind(owner_id)
        .bind(device_id)
        .bind(status.as_str())
        .bind(last_connected_at.as_ref().map(fmt_time))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn devices_for_owner(&self, owner_id: &str) -> StoreResult<Vec<DeviceRecord>> {
        let rows = sqlx::query_as::<_, DeviceRow>(
            "SELECT owner_id, device_id, connection_status, last_connected_at FROM devices WHERE owner_id = ? ORDER BY device_id",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DeviceRecord::try_from).collect()
    }

    async fn devices_with_status(&self, status: ConnectionStatus) -> StoreResult<Vec<DeviceRecord>> {
        let rows = sqlx::query_as::<_, DeviceRow>(
            "SELECT owner_id, device_id, connection_status, last_connected_at FROM devices WHERE connection_status = ?",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DeviceRecord::try_from).collect()
    }
}

#[async_trait]
impl SubscriptionStore for Database {
    async fn find_plan(&self, plan_id: Uuid) -> StoreResult<Option<Plan>> {
        let row = sqlx::query_as::<_, PlanRow>(
            "SELECT id, name, plan_type, message_limit, device_limit, duration_days, price, active FROM plans WHERE id = ?",
        )
        .bind(plan_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Plan::try_from).transpose()
    }

    async fn save_plan(&self, plan: &Plan) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO plans (id, name, plan_type, message_limit, device_limit, duration_days, price, active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                plan_type = excluded.plan_type,
                message_limit = excluded.message_limit,
                device_limit = excluded.device_limit,
                duration_days = excluded.duration_days,
                price = excluded.price,
                active = excluded.active
            "#,
        )
        .bind(plan.id.to_string())
        .bind(&plan.name)
        .bind(plan.plan_type.as_str())
        .bind(plan.message_limit.map(|v| v as i64))
        .bind(i64::from(plan.device_limit))
        .bind(i64::from(plan.duration_days))
        .bind(plan.price)
        .bind(plan.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active_subscription(&self, owner_id: &str) -> StoreResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM subscriptions WHERE owner_id = ? AND is_active = 1 ORDER BY created_at ASC LIMIT 1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn queued_subscriptions(&self, owner_id: &str) -> StoreResult<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM subscriptions WHERE owner_id = ? AND is_active = 0 AND status = 'queued' ORDER BY created_at ASC, rowid ASC",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let mut subscriptions = Vec::with_capacity(rows.len());
        for row in rows {
            subscriptions.push(self.hydrate(row).await?);
        }
        Ok(subscriptions)
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO subscriptions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription.id.to_string())
        .bind(&subscription.owner_id)
        .bind(subscription.plan_id.to_string())
        .bind(subscription.start_date.as_ref().map(fmt_time))
        .bind(subscription.end_date.as_ref().map(fmt_time))
        .bind(subscription.used_message_count as i64)
        .bind(subscription.is_active)
        .bind(subscription.status.as_str())
        .bind(fmt_time(&subscription.created_at))
        .execute(&self.pool)
        .await?;

        for device_id in &subscription.device_ids_consumed {
            self.add_consumed_device(subscription.id, device_id).await?;
        }
        Ok(())
    }

    async fn update_subscription(&self, subscription: &Subscription) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                start_date = ?, end_date = ?, used_message_count = ?, is_active = ?, status = ?
            WHERE id = ?
            "#,
        )
        .bind(subscription.start_date.as_ref().map(fmt_time))
        .bind(subscription.end_date.as_ref().map(fmt_time))
        .bind(subscription.used_message_count as i64)
        .bind(subscription.is_active)
        .bind(subscription.status.as_str())
        .bind(subscription.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(crate::error::StoreError::NotFound(format!(
                "subscription {}",
                subscription.id
            )));
        }
        Ok(())
    }

    async fn increment_usage(&self, subscription_id: Uuid, by: u64) -> StoreResult<()> {
        sqlx::query("UPDATE subscriptions SET used_message_count = used_message_count + ? WHERE id = ?")
            .bind(by as i64)
            .bind(subscription_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_consumed_device(&self, subscription_id: Uuid, device_id: &str) -> StoreResult<()> {
        sqlx::query("INSERT OR IGNORE INTO subscription_devices (subscription_id, device_id) VALUES (?, ?)")
            .bind(subscription_id.to_string())
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageLogStore for Database {
    async fn insert_log(&self, entry: &MessageLog) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO message_logs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            MESSAGE_LOG_COLUMNS
        ))
        .bind(entry.id.to_string())
        .bind(entry.job_id.to_string())
        .bind(&entry.owner_id)
        .bind(&entry.device_id)
        .bind(&entry.recipient)
        .bind(&entry.text)
        .bind(serde_json::to_string(&entry.attachments)?)
        .bind(entry.status.as_str())
        .bind(&entry.error_message)
        .bind(entry.sent_at.as_ref().map(fmt_time))
        .bind(fmt_time(&entry.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_log_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        error_message: Option<&str>,
        sent_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE message_logs SET status = ?, error_message = ?, sent_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error_message)
            .bind(sent_at.as_ref().map(fmt_time))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn logs_for_owner(&self, owner_id: &str, limit: usize) -> StoreResult<Vec<MessageLog>> {
        let rows = sqlx::query_as::<_, MessageLogRow>(&format!(
            "SELECT {} FROM message_logs WHERE owner_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
            MESSAGE_LOG_COLUMNS
        ))
        .bind(owner_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MessageLog::try_from).collect()
    }

    async fn logs_for_job(&self, job_id: Uuid) -> StoreResult<Vec<MessageLog>> {
        let rows = sqlx::query_as::<_, MessageLogRow>(&format!(
            "SELECT {} FROM message_logs WHERE job_id = ? ORDER BY rowid ASC",
            MESSAGE_LOG_COLUMNS
        ))
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MessageLog::try_from).collect()
    }
}
