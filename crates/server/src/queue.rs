//! In-process job queue with bounded concurrency, delayed delivery,
//! exponential-backoff retries, and a dead-letter list.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::error::DispatchError;

/// Exponential backoff between attempts: `base * 2^(attempt-1)`, capped at
/// `max`, plus up to 25% jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base.saturating_mul(multiplier).min(self.max);

        let jitter_range = delay.as_millis() as u64 / 4;
        if jitter_range == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_range))
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Hold the job until this time
    pub delay_until: Option<DateTime<Utc>>,
}

impl EnqueueOptions {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Backoff {
                base: Duration::from_millis(config.backoff_base_ms),
                max: Duration::from_millis(config.backoff_max_ms),
            },
            delay_until: None,
        }
    }

    pub fn delayed_until(mut self, at: DateTime<Utc>) -> Self {
        self.delay_until = Some(at);
        self
    }
}

/// Which attempt a handler is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptContext {
    pub attempt: u32,
    pub max_attempts: u32,
}

impl AttemptContext {
    /// No retry follows a failure of this attempt
    pub fn is_final(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[async_trait]
pub trait JobHandler<J>: Send + Sync {
    async fn handle(&self, job_id: Uuid, job: &J, attempt: AttemptContext) -> Result<(), DispatchError>;
}

/// A job that failed on its last allowed attempt
#[derive(Debug, Clone)]
pub struct DeadLetter<J> {
    pub job_id: Uuid,
    pub job: J,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

struct Envelope<J> {
    id: Uuid,
    job: J,
    options: EnqueueOptions,
    attempt: u32,
}

type DeadLetters<J> = Arc<Mutex<Vec<DeadLetter<J>>>>;

fn lock<J>(dead_letters: &DeadLetters<J>) -> MutexGuard<'_, Vec<DeadLetter<J>>> {
    dead_letters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Producer side of the queue
pub struct JobQueue<J> {
    tx: mpsc::UnboundedSender<Envelope<J>>,
    dead_letters: DeadLetters<J>,
}

impl<J> Clone for JobQueue<J> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            dead_letters: self.dead_letters.clone(),
        }
    }
}

impl<J: Send + 'static> JobQueue<J> {
    /// Create a queue and the worker that consumes it
    pub fn new(concurrency: usize) -> (Self, QueueWorker<J>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dead_letters = Arc::new(Mutex::new(Vec::new()));

        let worker = QueueWorker {
            rx,
            retry_tx: tx.downgrade(),
            concurrency: concurrency.max(1),
            dead_letters: dead_letters.clone(),
        };
        (Self { tx, dead_letters }, worker)
    }

    pub fn enqueue(&self, id: Uuid, job: J, options: EnqueueOptions) -> Result<(), DispatchError> {
        let delay = options
            .delay_until
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .filter(|delay| !delay.is_zero());

        let envelope = Envelope {
            id,
            job,
            options,
            attempt: 1,
        };

        match delay {
            Some(delay) => {
                if self.tx.is_closed() {
                    return Err(DispatchError::QueueClosed);
                }
                tracing::debug!(job_id = %id, delay_secs = delay.as_secs(), "Job delayed");
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if tx.send(envelope).is_err() {
                        tracing::warn!(job_id = %id, "Queue closed before delayed job was due");
                    }
                });
                Ok(())
            }
            None => self
                .tx
                .send(envelope)
                .map_err(|_| DispatchError::QueueClosed),
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter<J>>
    where
        J: Clone,
    {
        lock(&self.dead_letters).clone()
    }
}

/// Consumer side: runs jobs on a bounded pool
pub struct QueueWorker<J> {
    rx: mpsc::UnboundedReceiver<Envelope<J>>,
    retry_tx: mpsc::WeakUnboundedSender<Envelope<J>>,
    concurrency: usize,
    dead_letters: DeadLetters<J>,
}

impl<J: Send + Sync + 'static> QueueWorker<J> {
    /// Run until every producer handle is dropped
    pub async fn run(mut self, handler: Arc<dyn JobHandler<J>>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        tracing::info!(concurrency = self.concurrency, "Job queue worker started");

        while let Some(envelope) = self.rx.recv().await {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };

            let handler = handler.clone();
            let retry_tx = self.retry_tx.clone();
            let dead_letters = self.dead_letters.clone();
            tokio::spawn(async move {
                let _permit = permit;
                process(envelope, handler, retry_tx, dead_letters).await;
            });
        }

        tracing::info!("Job queue worker stopped");
    }
}

async fn process<J: Send + Sync + 'static>(
    envelope: Envelope<J>,
    handler: Arc<dyn JobHandler<J>>,
    retry_tx: mpsc::WeakUnboundedSender<Envelope<J>>,
    dead_letters: DeadLetters<J>,
) {
    let context = AttemptContext {
        attempt: envelope.attempt,
        max_attempts: envelope.options.max_attempts,
    };

    let error = match handler.handle(envelope.id, &envelope.job, context).await {
        Ok(()) => return,
        Err(e) => e,
    };

    if error.is_retryable() && !context.is_final() {
        let delay = envelope.options.backoff.delay_for_attempt(context.attempt);
        tracing::warn!(
            job_id = %envelope.id,
            attempt = context.attempt,
            max_attempts = context.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Job failed, retrying: {}",
            error
        );

        let next = Envelope {
            attempt: envelope.attempt + 1,
            ..envelope
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match retry_tx.upgrade() {
                Some(tx) => {
                    let _ = tx.send(next);
                }
                None => tracing::warn!(job_id = %next.id, "Queue closed, dropping retry"),
            }
        });
        return;
    }

    tracing::error!(
        job_id = %envelope.id,
        attempts = context.attempt,
        "Job failed permanently: {}",
        error
    );
    lock(&dead_letters).push(DeadLetter {
        job_id: envelope.id,
        job: envelope.job,
        attempts: context.attempt,
        error: error.to_string(),
        failed_at: Utc::now(),
    });
}
