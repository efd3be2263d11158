use std::sync::Arc;

use crate::config::Config;
use crate::dispatch::{DispatchJob, Dispatcher};
use crate::queue::QueueWorker;
use crate::quota::{QuotaCache, QuotaGuard};
use crate::rate_limit::SendRateLimiter;
use crate::session::SessionController;
use crate::storage::CredentialStore;
use crate::store::{DeviceStore, MessageLogStore, SubscriptionStore};
use crate::transport::Connector;

/// External systems the core talks to
pub struct Collaborators {
    pub devices: Arc<dyn DeviceStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub logs: Arc<dyn MessageLogStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub cache: Arc<dyn QuotaCache>,
    pub connector: Arc<dyn Connector>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub sessions: SessionController,
    pub dispatcher: Dispatcher,
    pub quota: QuotaGuard,
    pub limiter: Arc<SendRateLimiter>,
    pub devices: Arc<dyn DeviceStore>,
    pub logs: Arc<dyn MessageLogStore>,
}

impl AppState {
    /// Wire the core together. The returned worker must be started for
    /// queued jobs to run.
    pub fn new(config: Config, parts: Collaborators) -> (Self, QueueWorker<DispatchJob>) {
        let quota = QuotaGuard::new(parts.subscriptions, parts.cache);
        let limiter = Arc::new(SendRateLimiter::new(&config.rate_limit));

        let sessions = SessionController::new(
            config.session.clone(),
            parts.connector,
            parts.credentials,
            parts.devices.clone(),
            quota.clone(),
        );

        let (dispatcher, worker) = Dispatcher::new(
            sessions.clone(),
            quota.clone(),
            limiter.clone(),
            parts.logs.clone(),
            &config.dispatch,
            config.storage.attachments_dir.clone(),
        );

        let state = Self {
            config,
            sessions,
            dispatcher,
            quota,
            limiter,
            devices: parts.devices,
            logs: parts.logs,
        };
        (state, worker)
    }
}
