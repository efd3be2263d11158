//! Subscription quota enforcement.
//!
//! Reads go to the per-user cache first and fall back to the store on a
//! miss or a cache failure. Increments use the cache's atomic counter and
//! are persisted to the store; promotions invalidate the cached snapshot so
//! the next read repopulates it.

use chrono::{DateTime, Utc};
use shared::{Plan, PlanType, QuotaDecision, Subscription, SubscriptionStatus};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::SubscriptionStore;

mod cache;

pub use cache::{cache_key, MemoryQuotaCache, QuotaCache, QuotaSnapshot};

pub const REASON_NO_SUBSCRIPTION: &str = "No active subscription";
pub const REASON_PLAN_EXPIRED: &str = "Plan expired";
pub const REASON_QUOTA_EXCEEDED: &str = "Message quota exceeded";
pub const REASON_DEVICE_LIMIT: &str = "Device limit reached";

#[derive(Clone)]
pub struct QuotaGuard {
    store: Arc<dyn SubscriptionStore>,
    cache: Arc<dyn QuotaCache>,
}

impl QuotaGuard {
    pub fn new(store: Arc<dyn SubscriptionStore>, cache: Arc<dyn QuotaCache>) -> Self {
        Self { store, cache }
    }

    /// Cache-first read of the user's active plan allowance
    pub async fn snapshot(&self, owner_id: &str) -> Result<Option<QuotaSnapshot>, StoreError> {
        match self.cache.get(owner_id).await {
            Ok(Some(snapshot)) => return Ok(Some(snapshot)),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(owner_id, "Quota cache read failed, using store: {}", e);
                return self.load_snapshot(owner_id).await;
            }
        }

        let Some(snapshot) = self.load_snapshot(owner_id).await? else {
            return Ok(None);
        };

        // Expire with the subscription so a stale snapshot heals itself
        if let Err(e) = self.cache.put(owner_id, snapshot.clone(), snapshot.end_date).await {
            tracing::warn!(owner_id, "Failed to populate quota cache: {}", e);
        }

        // Another loader may have won the race; prefer whatever is cached now
        match self.cache.get(owner_id).await {
            Ok(Some(cached)) => Ok(Some(cached)),
            _ => Ok(Some(snapshot)),
        }
    }

    async fn load_snapshot(&self, owner_id: &str) -> Result<Option<QuotaSnapshot>, StoreError> {
        let Some(subscription) = self.store.active_subscription(owner_id).await? else {
            return Ok(None);
        };
        let plan = self.plan_for(&subscription).await?;
        Ok(Some(QuotaSnapshot {
            subscription_id: subscription.id,
            plan_id: plan.id,
            plan_type: plan.plan_type,
            limit: plan.message_limit,
            used: subscription.used_message_count,
            device_limit: plan.device_limit,
            end_date: subscription.end_date,
        }))
    }

    async fn plan_for(&self, subscription: &Subscription) -> Result<Plan, StoreError> {
        self.store
            .find_plan(subscription.plan_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("plan {}", subscription.plan_id)))
    }

    /// Whether the user may send one more message right now
    pub async fn can_send(&self, owner_id: &str) -> Result<QuotaDecision, StoreError> {
        let snapshot = self.snapshot(owner_id).await?;
        Ok(evaluate(snapshot.as_ref(), Utc::now()))
    }

    /// `can_send`, retried once after promoting a queued plan if denied
    pub async fn check_quota(&self, owner_id: &str) -> Result<QuotaDecision, StoreError> {
        let decision = self.can_send(owner_id).await?;
        if decision.allowed {
            return Ok(decision);
        }

        if self.promote_next_plan_if_needed(owner_id).await? {
            return self.can_send(owner_id).await;
        }
        Ok(decision)
    }

    /// Count one delivered message against the active subscription
    pub async fn record_sent(&self, owner_id: &str) -> Result<(), StoreError> {
        let Some(snapshot) = self.snapshot(owner_id).await? else {
            tracing::warn!(owner_id, "Message sent without an active subscription");
            return Ok(());
        };

        match self.cache.incr_used(owner_id, 1).await {
            Ok(Some(used)) => tracing::trace!(owner_id, used, "Quota counter incremented"),
            Ok(None) => {}
            Err(e) => tracing::warn!(owner_id, "Quota cache increment failed: {}", e),
        }

        self.store.increment_usage(snapshot.subscription_id, 1).await
    }

    /// Registered devices always pass; new ones must fit the plan's limit
    pub async fn can_add_device(&self, owner_id: &str, device_id: &str) -> Result<QuotaDecision, StoreError> {
        let Some(subscription) = self.store.active_subscription(owner_id).await? else {
            return Ok(QuotaDecision::deny(REASON_NO_SUBSCRIPTION));
        };

        if subscription.device_ids_consumed.iter().any(|d| d == device_id) {
            return Ok(QuotaDecision::allow());
        }

        let plan = self.plan_for(&subscription).await?;
        if subscription.device_ids_consumed.len() >= plan.device_limit as usize {
            return Ok(QuotaDecision::deny(REASON_DEVICE_LIMIT));
        }
        Ok(QuotaDecision::allow())
    }

    /// Record the device against the active subscription
    pub async fn register_device(&self, owner_id: &str, device_id: &str) -> Result<(), StoreError> {
        let Some(subscription) = self.store.active_subscription(owner_id).await? else {
            return Ok(());
        };
        if subscription.device_ids_consumed.iter().any(|d| d == device_id) {
            return Ok(());
        }
        self.store.add_consumed_device(subscription.id, device_id).await
    }

    /// Retire the active subscription if it is expired or used up and a
    /// queued one exists, then activate the oldest queued one. Returns true
    /// if a subscription was activated.
    pub async fn promote_next_plan_if_needed(&self, owner_id: &str) -> Result<bool, StoreError> {
        let now = Utc::now();
        let active = self.store.active_subscription(owner_id).await?;
        let queued = self.store.queued_subscriptions(owner_id).await?;

        if let Some(mut current) = active {
            let plan = self.plan_for(&current).await?;
            let Some(status) = retirement_status(&current, &plan, now) else {
                return Ok(false);
            };

            // Spent or expired plans stay in place, and keep reporting why,
            // until something can replace them
            if queued.is_empty() {
                return Ok(false);
            }

            current.retire(status);
            self.store.update_subscription(&current).await?;
            tracing::info!(
                owner_id,
                subscription_id = %current.id,
                status = status.as_str(),
                "Retired subscription"
            );
        }

        let promoted = match queued.into_iter().next() {
            Some(mut next) => {
                let plan = self.plan_for(&next).await?;
                next.activate(plan.duration_days, now);
                self.store.update_subscription(&next).await?;
                tracing::info!(
                    owner_id,
                    subscription_id = %next.id,
                    plan_id = %plan.id,
                    "Activated queued subscription"
                );
                true
            }
            None => false,
        };

        self.invalidate(owner_id).await;
        Ok(promoted)
    }

    /// Create a subscription for `plan_id`: active if the user has none,
    /// queued behind the active one otherwise
    pub async fn assign_plan(&self, owner_id: &str, plan_id: Uuid) -> Result<Subscription, StoreError> {
        let plan = self
            .store
            .find_plan(plan_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("plan {}", plan_id)))?;

        let mut subscription = Subscription::queued(owner_id, plan.id);
        if self.store.active_subscription(owner_id).await?.is_none() {
            subscription.activate(plan.duration_days, Utc::now());
        }
        self.store.insert_subscription(&subscription).await?;
        self.invalidate(owner_id).await;

        tracing::info!(
            owner_id,
            subscription_id = %subscription.id,
            active = subscription.is_active,
            "Assigned plan {}",
            plan.name
        );
        Ok(subscription)
    }

    async fn invalidate(&self, owner_id: &str) {
        if let Err(e) = self.cache.invalidate(owner_id).await {
            tracing::warn!(owner_id, "Failed to invalidate quota cache: {}", e);
        }
    }
}

/// Decide a send against a snapshot
pub fn evaluate(snapshot: Option<&QuotaSnapshot>, now: DateTime<Utc>) -> QuotaDecision {
    let Some(snapshot) = snapshot else {
        return QuotaDecision::deny(REASON_NO_SUBSCRIPTION);
    };

    if snapshot.end_date.is_some_and(|end| now > end) {
        return QuotaDecision::deny(REASON_PLAN_EXPIRED);
    }

    if snapshot.plan_type == PlanType::Limited {
        let limit = snapshot.limit.unwrap_or(0);
        if snapshot.used >= limit {
            return QuotaDecision::deny(REASON_QUOTA_EXCEEDED);
        }
    }

    QuotaDecision::allow()
}

fn retirement_status(
    subscription: &Subscription,
    plan: &Plan,
    now: DateTime<Utc>,
) -> Option<SubscriptionStatus> {
    if subscription.end_date.is_some_and(|end| now > end) {
        return Some(SubscriptionStatus::Expired);
    }

    let quota_spent = plan.plan_type == PlanType::Limited
        && subscription.used_message_count >= plan.message_limit.unwrap_or(0);
    let devices_spent = subscription.device_ids_consumed.len() >= plan.device_limit as usize;

    if quota_spent || devices_spent {
        Some(SubscriptionStatus::Exhausted)
    } else {
        None
    }
}
