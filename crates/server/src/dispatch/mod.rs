//! Outbound message dispatch.
//!
//! `enqueue_dispatch` validates a request, checks the sender's quota, and
//! hands the job to the queue. The queue worker calls back into
//! `Dispatcher::handle`, which resolves the device session, walks the
//! recipients in order, and writes one message log row per recipient.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use shared::{Attachment, DispatchKind, DispatchRequest, MessageLog, MessageStatus};
use std::panic::AssertUnwindSafe;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::queue::{AttemptContext, DeadLetter, EnqueueOptions, JobHandler, JobQueue, QueueWorker};
use crate::quota::QuotaGuard;
use crate::rate_limit::SendRateLimiter;
use crate::session::{Session, SessionController};
use crate::storage;
use crate::store::MessageLogStore;

mod recipient;

pub use recipient::normalize as normalize_recipient;

pub const CLIENT_UNAVAILABLE: &str = "client unavailable";
pub const JOB_PANICKED: &str = "dispatch job panicked";

/// A queued dispatch request
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub request: DispatchRequest,
    /// Log rows pre-created for a scheduled job, one per recipient in order
    pub scheduled_log_ids: Vec<Uuid>,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: SessionController,
    quota: QuotaGuard,
    limiter: Arc<SendRateLimiter>,
    logs: Arc<dyn MessageLogStore>,
    queue: JobQueue<DispatchJob>,
    options: EnqueueOptions,
    attachments_dir: PathBuf,
}

impl Dispatcher {
    /// Build the dispatcher and the queue worker that will feed it jobs
    pub fn new(
        sessions: SessionController,
        quota: QuotaGuard,
        limiter: Arc<SendRateLimiter>,
        logs: Arc<dyn MessageLogStore>,
        config: &DispatchConfig,
        attachments_dir: impl Into<PathBuf>,
    ) -> (Self, QueueWorker<DispatchJob>) {
        let (queue, worker) = JobQueue::new(config.worker_count());
        let dispatcher = Self {
            inner: Arc::new(Inner {
                sessions,
                quota,
                limiter,
                logs,
                queue,
                options: EnqueueOptions::from_config(config),
                attachments_dir: attachments_dir.into(),
            }),
        };
        (dispatcher, worker)
    }

    /// Start consuming jobs on the current runtime
    pub fn spawn_worker(&self, worker: QueueWorker<DispatchJob>) -> tokio::task::JoinHandle<()> {
        let handler: Arc<dyn JobHandler<DispatchJob>> = Arc::new(self.clone());
        tokio::spawn(worker.run(handler))
    }

    pub async fn enqueue_dispatch(&self, request: DispatchRequest) -> Result<Uuid, DispatchError> {
        self.validate(&request)?;

        let decision = self.inner.quota.check_quota(&request.owner_id).await?;
        if !decision.allowed {
            let reason = decision.reason.unwrap_or_else(|| "sending not allowed".to_string());
            tracing::info!(owner_id = %request.owner_id, "Dispatch rejected: {}", reason);
            return Err(DispatchError::QuotaDenied(reason));
        }

        let job_id = Uuid::new_v4();
        let mut options = self.inner.options.clone();
        let mut scheduled_log_ids = Vec::new();

        if let Some(at) = request.scheduled_at {
            for recipient in &request.recipients {
                let entry = log_entry(job_id, &request, recipient, MessageStatus::Scheduled, None, None);
                self.inner.logs.insert_log(&entry).await?;
                scheduled_log_ids.push(entry.id);
            }
            options = options.delayed_until(at);
        }

        tracing::info!(
            job_id = %job_id,
            owner_id = %request.owner_id,
            device_id = %request.device_id,
            kind = ?request.kind,
            recipients = request.recipients.len(),
            "Dispatch job enqueued"
        );

        let job = DispatchJob {
            request,
            scheduled_log_ids,
        };
        self.inner.queue.enqueue(job_id, job, options)?;
        Ok(job_id)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter<DispatchJob>> {
        self.inner.queue.dead_letters()
    }

    fn validate(&self, request: &DispatchRequest) -> Result<(), DispatchError> {
        let invalid = |msg: &str| Err(DispatchError::InvalidJob(msg.to_string()));

        if request.owner_id.trim().is_empty() {
            return invalid("owner id is required");
        }
        if request.device_id.trim().is_empty() {
            return invalid("device id is required");
        }
        if request.recipients.is_empty() {
            return invalid("at least one recipient is required");
        }
        if request.recipients.iter().any(|r| r.trim().is_empty()) {
            return invalid("recipients must not be blank");
        }
        if request.body.is_empty() && request.attachments.is_empty() {
            return invalid("a message body or attachment is required");
        }

        match request.kind {
            DispatchKind::Single if request.recipients.len() != 1 => {
                return invalid("a single message takes exactly one recipient");
            }
            DispatchKind::Scheduled if request.scheduled_at.is_none() => {
                return invalid("a scheduled message needs a scheduled time");
            }
            DispatchKind::Single | DispatchKind::Bulk if request.scheduled_at.is_some() => {
                return invalid("only scheduled messages take a scheduled time");
            }
            _ => {}
        }

        if let Some(attachment) = request
            .attachments
            .iter()
            .find(|a| !is_within(&self.inner.attachments_dir, Path::new(&a.path)))
        {
            return Err(DispatchError::InvalidJob(format!(
                "attachment {} is outside the upload directory",
                attachment.path
            )));
        }
        Ok(())
    }

    /// `recorded` counts recipients, in order, that already have their row
    async fn run_job(
        &self,
        job_id: Uuid,
        job: &DispatchJob,
        attempt: AttemptContext,
        recorded: &AtomicUsize,
    ) -> Result<(), DispatchError> {
        let request = &job.request;
        tracing::info!(
            job_id = %job_id,
            owner_id = %request.owner_id,
            device_id = %request.device_id,
            attempt = attempt.attempt,
            "Running dispatch job"
        );

        let Some(session) = self
            .inner
            .sessions
            .ensure_ready(&request.owner_id, &request.device_id)
            .await
        else {
            // Only the last attempt writes rows, so a job never logs a recipient twice
            if attempt.is_final() {
                self.record_remaining(job_id, job, recorded, CLIENT_UNAVAILABLE).await;
            }
            return Err(DispatchError::ClientUnavailable);
        };

        let delay = Duration::from_secs(request.per_recipient_delay_secs);
        let mut delivered = 0usize;

        for (index, recipient) in request.recipients.iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let outcome = self.deliver(&session, request, recipient).await;
            if outcome.is_ok() {
                delivered += 1;
            }
            self.record(job_id, job, index, recipient, outcome).await;
            recorded.store(index + 1, Ordering::SeqCst);
        }

        tracing::info!(
            job_id = %job_id,
            delivered,
            failed = request.recipients.len() - delivered,
            "Dispatch job finished"
        );
        Ok(())
    }

    /// Send to one recipient. The error is the reason stored in the log.
    async fn deliver(&self, session: &Session, request: &DispatchRequest, recipient: &str) -> Result<(), String> {
        if !session.is_usable() {
            return Err(CLIENT_UNAVAILABLE.to_string());
        }

        match self.inner.quota.check_quota(&request.owner_id).await {
            Ok(decision) if decision.allowed => {}
            Ok(decision) => {
                return Err(decision.reason.unwrap_or_else(|| "sending not allowed".to_string()));
            }
            Err(e) => return Err(format!("quota check failed: {}", e)),
        }

        let address =
            normalize_recipient(recipient).ok_or_else(|| format!("invalid recipient {}", recipient))?;

        self.inner
            .limiter
            .consume(&session.key().to_string(), &address)
            .await;

        let connection = session.connection();
        match connection.is_registered(&address).await {
            Ok(Some(false)) => return Err(format!("{} is not on WhatsApp", recipient)),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(recipient = %address, "Number lookup failed, sending anyway: {}", e);
            }
        }

        if !request.body.is_empty() {
            connection
                .send_text(&address, &request.body)
                .await
                .map_err(|e| e.to_string())?;
        }
        for attachment in &request.attachments {
            connection
                .send_media(&address, attachment)
                .await
                .map_err(|e| e.to_string())?;
        }

        if let Err(e) = self.inner.quota.record_sent(&request.owner_id).await {
            tracing::warn!(owner_id = %request.owner_id, "Failed to record sent message: {}", e);
        }
        Ok(())
    }

    async fn record(&self, job_id: Uuid, job: &DispatchJob, index: usize, recipient: &str, outcome: Result<(), String>) {
        let (status, error, sent_at) = match &outcome {
            Ok(()) => (MessageStatus::Delivered, None, Some(Utc::now())),
            Err(reason) => (MessageStatus::Error, Some(reason.as_str()), None),
        };

        let written = match job.scheduled_log_ids.get(index) {
            Some(log_id) => {
                self.inner
                    .logs
                    .update_log_status(*log_id, status, error, sent_at)
                    .await
            }
            None => {
                let entry = log_entry(job_id, &job.request, recipient, status, error, sent_at);
                self.inner.logs.insert_log(&entry).await
            }
        };

        if let Err(e) = written {
            tracing::error!(job_id = %job_id, recipient, "Failed to write message log: {}", e);
        }

        match error {
            None => tracing::debug!(job_id = %job_id, recipient, "Message delivered"),
            Some(reason) => tracing::warn!(job_id = %job_id, recipient, "Message failed: {}", reason),
        }
    }

    /// Fail every recipient from `recorded` onwards with `reason`
    async fn record_remaining(&self, job_id: Uuid, job: &DispatchJob, recorded: &AtomicUsize, reason: &str) {
        let from = recorded.load(Ordering::SeqCst);
        for (index, recipient) in job.request.recipients.iter().enumerate().skip(from) {
            self.record(job_id, job, index, recipient, Err(reason.to_string()))
                .await;
            recorded.store(index + 1, Ordering::SeqCst);
        }
    }

    async fn cleanup_attachments(&self, job: &DispatchJob) {
        for attachment in &job.request.attachments {
            let path = Path::new(&attachment.path);
            if !is_within(&self.inner.attachments_dir, path) {
                continue;
            }
            match storage::remove_temp_file(path).await {
                Ok(true) => tracing::debug!(path = %attachment.path, "Removed attachment"),
                Ok(false) => {}
                Err(e) => tracing::warn!(path = %attachment.path, "Failed to remove attachment: {}", e),
            }
        }
    }
}

#[async_trait]
impl JobHandler<DispatchJob> for Dispatcher {
    async fn handle(&self, job_id: Uuid, job: &DispatchJob, attempt: AttemptContext) -> Result<(), DispatchError> {
        let recorded = AtomicUsize::new(0);
        let result = match AssertUnwindSafe(self.run_job(job_id, job, attempt, &recorded))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(job_id = %job_id, "Dispatch job panicked");
                self.record_remaining(job_id, job, &recorded, JOB_PANICKED).await;
                Err(DispatchError::Internal(JOB_PANICKED.to_string()))
            }
        };

        // Attachments must survive until the last attempt that could use them
        let retrying = matches!(&result, Err(e) if e.is_retryable()) && !attempt.is_final();
        if !retrying {
            self.cleanup_attachments(job).await;
        }
        result
    }
}

fn log_entry(
    job_id: Uuid,
    request: &DispatchRequest,
    recipient: &str,
    status: MessageStatus,
    error_message: Option<&str>,
    sent_at: Option<DateTime<Utc>>,
) -> MessageLog {
    MessageLog {
        id: Uuid::new_v4(),
        job_id,
        owner_id: request.owner_id.clone(),
        device_id: request.device_id.clone(),
        recipient: recipient.to_string(),
        text: request.body.clone(),
        attachments: request.attachments.iter().map(attachment_name).collect(),
        status,
        error_message: error_message.map(str::to_string),
        sent_at,
        created_at: Utc::now(),
    }
}

fn attachment_name(attachment: &Attachment) -> String {
    attachment
        .file_name
        .clone()
        .unwrap_or_else(|| attachment.path.clone())
}

/// `path` lies under `dir` without climbing out through `..`
fn is_within(dir: &Path, path: &Path) -> bool {
    !path.components().any(|c| matches!(c, Component::ParentDir)) && path.starts_with(dir)
}
