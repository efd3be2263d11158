use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// ============================================================================
// Devices
// ============================================================================

/// Persisted connection status of a registered device
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    AuthFailure,
    Pending,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::AuthFailure => "auth_failure",
            ConnectionStatus::Pending => "pending",
        }
    }
}

impl FromStr for ConnectionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(ConnectionStatus::Connected),
            "disconnected" => Ok(ConnectionStatus::Disconnected),
            "auth_failure" => Ok(ConnectionStatus::AuthFailure),
            "pending" => Ok(ConnectionStatus::Pending),
            other => Err(ParseEnumError::new("connection status", other)),
        }
    }
}

/// One entry per device a user has ever registered
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceRecord {
    pub owner_id: String,
    pub device_id: String,
    pub connection_status: ConnectionStatus,
    pub last_connected_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Plans and subscriptions
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Unlimited,
    Limited,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Unlimited => "unlimited",
            PlanType::Limited => "limited",
        }
    }
}

impl FromStr for PlanType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unlimited" => Ok(PlanType::Unlimited),
            "limited" => Ok(PlanType::Limited),
            other => Err(ParseEnumError::new("plan type", other)),
        }
    }
}

/// A message-quota plan. Edits only affect future assignments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub plan_type: PlanType,
    /// Only meaningful for `PlanType::Limited`
    pub message_limit: Option<u64>,
    pub device_limit: u32,
    pub duration_days: u32,
    pub price: f64,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Currently consuming quota
    Active,
    /// Waiting for the active subscription to be retired
    Queued,
    /// Retired because the end date passed
    Expired,
    /// Retired because a quota or device allowance ran out
    Exhausted,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Queued => "queued",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Exhausted => "exhausted",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "queued" => Ok(SubscriptionStatus::Queued),
            "expired" => Ok(SubscriptionStatus::Expired),
            "exhausted" => Ok(SubscriptionStatus::Exhausted),
            other => Err(ParseEnumError::new("subscription status", other)),
        }
    }
}

/// A user's instance of a plan. At most one per user has `is_active = true`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub id: Uuid,
    pub owner_id: String,
    pub plan_id: Uuid,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub used_message_count: u64,
    pub device_ids_consumed: Vec<String>,
    pub is_active: bool,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// A subscription that waits behind the active one, with no dates assigned
    pub fn queued(owner_id: impl Into<String>, plan_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            plan_id,
            start_date: None,
            end_date: None,
            used_message_count: 0,
            device_ids_consumed: Vec::new(),
            is_active: false,
            status: SubscriptionStatus::Queued,
            created_at: Utc::now(),
        }
    }

    /// Start the active window now and reset the usage counters
    pub fn activate(&mut self, duration_days: u32, now: DateTime<Utc>) {
        self.start_date = Some(now);
        self.end_date = Some(now + chrono::Duration::days(i64::from(duration_days)));
        self.used_message_count = 0;
        self.device_ids_consumed.clear();
        self.is_active = true;
        self.status = SubscriptionStatus::Active;
    }

    pub fn retire(&mut self, status: SubscriptionStatus) {
        self.is_active = false;
        self.status = status;
    }
}

// ============================================================================
// Dispatch
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchKind {
    Single,
    Bulk,
    Scheduled,
}

/// A file in local temporary storage to send after the text body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub path: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

/// Job descriptor accepted by `enqueue_dispatch`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchRequest {
    pub owner_id: String,
    pub device_id: String,
    pub kind: DispatchKind,
    pub recipients: Vec<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub per_recipient_delay_secs: u64,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Scheduled,
    Delivered,
    Error,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Scheduled => "scheduled",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Delivered | MessageStatus::Error)
    }
}

impl FromStr for MessageStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "scheduled" => Ok(MessageStatus::Scheduled),
            "delivered" => Ok(MessageStatus::Delivered),
            "error" => Ok(MessageStatus::Error),
            other => Err(ParseEnumError::new("message status", other)),
        }
    }
}

/// One row per (job, recipient) attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageLog {
    pub id: Uuid,
    pub job_id: Uuid,
    pub owner_id: String,
    pub device_id: String,
    pub recipient: String,
    pub text: String,
    pub attachments: Vec<String>,
    pub status: MessageStatus,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Session lifecycle
// ============================================================================

/// Lifecycle of one device connection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LifecycleState {
    Unstarted,
    AwaitingScan,
    Authenticated,
    Disconnected { reconnecting: bool },
}

impl LifecycleState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, LifecycleState::Authenticated)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Unstarted => write!(f, "unstarted"),
            LifecycleState::AwaitingScan => write!(f, "awaiting_scan"),
            LifecycleState::Authenticated => write!(f, "authenticated"),
            LifecycleState::Disconnected { reconnecting: true } => {
                write!(f, "disconnected (reconnecting)")
            }
            LifecycleState::Disconnected { reconnecting: false } => write!(f, "disconnected"),
        }
    }
}

// ============================================================================
// Boundary responses
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartSessionResponse {
    /// QR code as an image data URL, present while a scan is pending
    pub qr_image: Option<String>,
    pub already_connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionStatusResponse {
    pub owner_id: String,
    pub device_id: String,
    #[serde(flatten)]
    pub state: LifecycleState,
}

/// Structured allow/deny result with a human-readable reason
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl QuotaDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnqueueResponse {
    pub job_id: Uuid,
}
