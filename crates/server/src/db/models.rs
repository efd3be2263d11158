use chrono::{DateTime, Utc};
use shared::{DeviceRecord, MessageLog, Plan, Subscription};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone, FromRow)]
pub struct DeviceRow {
    pub owner_id: String,
    pub device_id: String,
    pub connection_status: String,
    pub last_connected_at: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct PlanRow {
    pub id: String,
    pub name: String,
    pub plan_type: String,
    pub message_limit: Option<i64>,
    pub device_limit: i64,
    pub duration_days: i64,
    pub price: f64,
    pub active: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct SubscriptionRow {
    pub id: String,
    pub owner_id: String,
    pub plan_id: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub used_message_count: i64,
    pub is_active: bool,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct MessageLogRow {
    pub id: String,
    pub job_id: String,
    pub owner_id: String,
    pub device_id: String,
    pub recipient: String,
    pub text: String,
    pub attachments: String,
    pub status: String,
    pub error_message: Option<String>,
    pub sent_at: Option<String>,
    pub created_at: String,
}

pub(crate) fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|e| StoreError::Corrupt(format!("uuid {}: {}", value, e)))
}

pub(crate) fn parse_time(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {}: {}", value, e)))
}

fn parse_opt_time(value: Option<&str>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.map(parse_time).transpose()
}

impl TryFrom<DeviceRow> for DeviceRecord {
    type Error = StoreError;

    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        Ok(DeviceRecord {
            connection_status: row.connection_status.parse()?,
            last_connected_at: parse_opt_time(row.last_connected_at.as_deref())?,
            owner_id: row.owner_id,
            device_id: row.device_id,
        })
    }
}

impl TryFrom<PlanRow> for Plan {
    type Error = StoreError;

    fn try_from(row: PlanRow) -> Result<Self, Self::Error> {
        Ok(Plan {
            id: parse_uuid(&row.id)?,
            plan_type: row.plan_type.parse()?,
            message_limit: row.message_limit.map(|v| v.max(0) as u64),
            device_limit: row.device_limit.max(0) as u32,
            duration_days: row.duration_days.max(0) as u32,
            name: row.name,
            price: row.price,
            active: row.active,
        })
    }
}

impl SubscriptionRow {
    /// Combine with the consumed device ids, which live in their own table
    pub fn into_subscription(self, device_ids: Vec<String>) -> Result<Subscription, StoreError> {
        Ok(Subscription {
            id: parse_uuid(&self.id)?,
            plan_id: parse_uuid(&self.plan_id)?,
            start_date: parse_opt_time(self.start_date.as_deref())?,
            end_date: parse_opt_time(self.end_date.as_deref())?,
            used_message_count: self.used_message_count.max(0) as u64,
            device_ids_consumed: device_ids,
            is_active: self.is_active,
            status: self.status.parse()?,
            created_at: parse_time(&self.created_at)?,
            owner_id: self.owner_id,
        })
    }
}

impl TryFrom<MessageLogRow> for MessageLog {
    type Error = StoreError;

    fn try_from(row: MessageLogRow) -> Result<Self, Self::Error> {
        Ok(MessageLog {
            id: parse_uuid(&row.id)?,
            job_id: parse_uuid(&row.job_id)?,
            attachments: serde_json::from_str(&row.attachments)?,
            status: row.status.parse()?,
            sent_at: parse_opt_time(row.sent_at.as_deref())?,
            created_at: parse_time(&row.created_at)?,
            owner_id: row.owner_id,
            device_id: row.device_id,
            recipient: row.recipient,
            text: row.text,
            error_message: row.error_message,
        })
    }
}
