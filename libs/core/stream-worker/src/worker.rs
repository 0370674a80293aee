//! The generic worker loop.
//!
//! Each iteration claims pending entries whose redelivery backoff has elapsed,
//! reads new entries, and runs them through the processor with bounded
//! concurrency. The whole batch is drained before limits and the shutdown
//! signal are checked again, so no message is abandoned mid-flight.

use crate::config::WorkerConfig;
use crate::consumer::{Delivery, MalformedEntry, StreamConsumer};
use crate::dlq::{DlqEntry, DlqManager};
use crate::error::StreamError;
use crate::event::StreamEvent;
use crate::limits::{LimitTracker, StopReason};
use crate::metrics::StreamMetrics;
use crate::registry::{JobOutcome, MessageKey, StreamJob, StreamProcessor};
use chrono::Utc;
use redis::aio::ConnectionManager;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const MAX_BACKOFF_SECS: u64 = 30;

/// What happens to an entry after its processor returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Ack,
    /// Left pending; claimed again once its backoff elapses
    Retry,
    DeadLetter,
}

fn disposition(result: &Result<JobOutcome, StreamError>) -> Disposition {
    match result {
        Ok(_) => Disposition::Ack,
        Err(e) if e.is_transient() => Disposition::Retry,
        Err(_) => Disposition::DeadLetter,
    }
}

struct Inner<J, P> {
    consumer: StreamConsumer,
    dlq: DlqManager,
    processor: Arc<P>,
    config: WorkerConfig,
    metrics: StreamMetrics,
    semaphore: Semaphore,
    in_flight: AtomicUsize,
    _job: PhantomData<fn() -> J>,
}

pub struct StreamWorker<J, P>
where
    J: StreamJob,
    P: StreamProcessor<J>,
{
    inner: Arc<Inner<J, P>>,
}

impl<J, P> StreamWorker<J, P>
where
    J: StreamJob + 'static,
    P: StreamProcessor<J> + 'static,
{
    pub fn new(redis: ConnectionManager, processor: P, config: WorkerConfig) -> Self {
        Self::with_arc_processor(redis, Arc::new(processor), config)
    }

    pub fn with_arc_processor(redis: ConnectionManager, processor: Arc<P>, config: WorkerConfig) -> Self {
        let dlq = DlqManager::new(redis.clone(), &config.stream_name, &config.dlq_stream);
        let metrics = StreamMetrics::new(&config.stream_name, processor.name());

        Self {
            inner: Arc::new(Inner {
                consumer: StreamConsumer::new(redis, config.clone()),
                dlq,
                processor,
                semaphore: Semaphore::new(config.max_concurrent_jobs),
                in_flight: AtomicUsize::new(0),
                metrics,
                config,
                _job: PhantomData,
            }),
        }
    }

    pub fn consumer(&self) -> &StreamConsumer {
        &self.inner.consumer
    }

    pub fn dlq(&self) -> &DlqManager {
        &self.inner.dlq
    }

    /// Run until shutdown is signalled or a stop limit is reached.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<StopReason, StreamError> {
        let config = &self.inner.config;
        let consumer = &self.inner.consumer;

        info!(
            consumer_id = %config.consumer_id,
            stream = %config.stream_name,
            group = %config.consumer_group,
            processor = %self.inner.processor.name(),
            batch_size = config.batch_size,
            max_concurrent_jobs = config.max_concurrent_jobs,
            blocking = consumer.is_blocking(),
            "Starting stream worker"
        );

        consumer.init_consumer_group().await?;

        let tracker = LimitTracker::new(config.limits.clone());
        let poll_interval = Duration::from_millis(config.poll_interval_ms);
        let claim_interval = Duration::from_millis(config.claim_interval_ms);
        let mut last_claim: Option<Instant> = None;
        let mut consecutive_errors: u32 = 0;

        let reason = loop {
            if *shutdown.borrow() {
                break StopReason::Shutdown;
            }
            if let Some(reason) = tracker.check() {
                break reason;
            }

            let budget = tracker
                .remaining_messages()
                .map_or(config.batch_size, |left| (left as usize).min(config.batch_size));

            let mut deliveries: Vec<Delivery<J>> = Vec::new();

            if last_claim.is_none_or(|at| at.elapsed() >= claim_interval) {
                match consumer.claim_due::<J>(budget).await {
                    Ok(claimed) => {
                        if !claimed.is_empty() {
                            self.inner.metrics.messages_claimed(claimed.len());
                        }
                        deliveries = claimed;
                    }
                    Err(e) => debug!(error = %e, "Failed to claim pending entries"),
                }
                last_claim = Some(Instant::now());
            }

            if deliveries.len() < budget {
                match consumer.read_new::<J>(budget - deliveries.len()).await {
                    Ok(fresh) => {
                        if consecutive_errors > 0 {
                            info!(consecutive_errors, "Stream connection recovered");
                            consecutive_errors = 0;
                        }
                        deliveries.extend(fresh);
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        self.handle_read_error(&e, consecutive_errors, &mut shutdown).await;
                    }
                }
            }

            if deliveries.is_empty() {
                if !consumer.is_blocking() {
                    wait_or_shutdown(&mut shutdown, poll_interval).await;
                }
                continue;
            }

            let handled = self.process_deliveries(deliveries).await;
            tracker.record(handled as u64);
        };

        info!(
            reason = %reason,
            handled = tracker.handled(),
            stream = %config.stream_name,
            "Stream worker stopped"
        );
        Ok(reason)
    }

    async fn handle_read_error(
        &self,
        e: &StreamError,
        consecutive_errors: u32,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        if e.is_nogroup_error() {
            warn!("Consumer group missing, recreating");
            if let Err(create_err) = self.inner.consumer.init_consumer_group().await {
                error!(error = %create_err, "Failed to recreate consumer group");
            }
        } else if e.is_connection_error() {
            let backoff_secs = 2u64.pow(consecutive_errors.min(5)).min(MAX_BACKOFF_SECS);
            warn!(
                error = %e,
                consecutive_errors,
                backoff_secs,
                "Redis connection error, backing off"
            );
            wait_or_shutdown(shutdown, Duration::from_secs(backoff_secs)).await;
        } else {
            error!(error = %e, "Failed to read from stream");
            wait_or_shutdown(shutdown, Duration::from_secs(1)).await;
        }
    }

    /// Handle a batch with at most `max_concurrent_jobs` in flight and wait for
    /// all of it. Returns how many deliveries were handled.
    async fn process_deliveries(&self, deliveries: Vec<Delivery<J>>) -> usize {
        let count = deliveries.len();
        let mut tasks = JoinSet::new();

        for delivery in deliveries {
            let inner = Arc::clone(&self.inner);
            tasks.spawn(async move {
                let _permit = inner.semaphore.acquire().await.ok();
                let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                inner.metrics.in_flight(now);

                inner.handle_delivery(delivery).await;

                let now = inner.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
                inner.metrics.in_flight(now);
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Delivery task panicked");
            }
        }

        count
    }
}

impl<J, P> Inner<J, P>
where
    J: StreamJob,
    P: StreamProcessor<J>,
{
    async fn handle_delivery(&self, delivery: Delivery<J>) {
        match delivery {
            Delivery::Malformed(entry) => self.handle_malformed(entry).await,
            Delivery::Job(event) => self.handle_job(event).await,
        }
    }

    async fn handle_malformed(&self, entry: MalformedEntry) {
        error!(
            stream_id = %entry.stream_id,
            reason = %entry.reason,
            "Dropping malformed stream entry"
        );
        self.metrics.job_failed("permanent");

        let payload = entry
            .fields
            .iter()
            .find(|(k, _)| k == MessageKey::Job.as_ref())
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| {
                let fields: serde_json::Map<String, serde_json::Value> = entry
                    .fields
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v.as_str())))
                    .collect();
                serde_json::Value::Object(fields).to_string()
            });

        let dlq_entry = DlqEntry {
            job_id: None,
            payload,
            error: entry.reason,
            original_stream_id: entry.stream_id.clone(),
            delivery_count: entry.delivery_count,
            failed_at: Utc::now(),
        };
        self.dead_letter(&entry.stream_id, &dlq_entry, "malformed").await;
    }

    async fn handle_job(&self, event: StreamEvent<J>) {
        let job_id = event.job_id();
        self.metrics.job_received(event.is_redelivery());

        if event.delivery_count > self.config.max_deliveries {
            warn!(
                job_id = %job_id,
                stream_id = %event.stream_id,
                deliveries = event.delivery_count,
                "Delivery limit exceeded"
            );
            let entry = self.dlq_entry(&event, "delivery limit exceeded".to_string());
            self.dead_letter(&event.stream_id, &entry, "max_deliveries").await;
            return;
        }

        debug!(job_id = %job_id, stream_id = %event.stream_id, "Processing job");
        let started = Instant::now();
        let result = self.processor.process(&event).await;

        match disposition(&result) {
            Disposition::Ack => {
                match result {
                    Ok(JobOutcome::Skipped(reason)) => {
                        debug!(job_id = %job_id, reason, "Job skipped");
                        self.metrics.job_skipped(reason);
                    }
                    _ => self.metrics.job_processed(started.elapsed()),
                }
                self.ack(&event.stream_id).await;
            }
            Disposition::Retry => {
                let error = result.err().map(|e| e.to_string()).unwrap_or_default();
                warn!(
                    job_id = %job_id,
                    stream_id = %event.stream_id,
                    deliveries = event.delivery_count,
                    retry_in_ms = self.config.redelivery_backoff_ms(event.delivery_count),
                    error = %error,
                    "Transient failure, leaving entry for redelivery"
                );
                self.metrics.job_failed("transient");
            }
            Disposition::DeadLetter => {
                let error = result.err().map(|e| e.to_string()).unwrap_or_default();
                error!(
                    job_id = %job_id,
                    stream_id = %event.stream_id,
                    error = %error,
                    "Permanent failure"
                );
                self.metrics.job_failed("permanent");
                let entry = self.dlq_entry(&event, error);
                self.dead_letter(&event.stream_id, &entry, "permanent").await;
            }
        }
    }

    fn dlq_entry(&self, event: &StreamEvent<J>, error: String) -> DlqEntry {
        DlqEntry {
            job_id: Some(event.job_id()),
            payload: serde_json::to_string(&event.job).unwrap_or_default(),
            error,
            original_stream_id: event.stream_id.clone(),
            delivery_count: event.delivery_count,
            failed_at: Utc::now(),
        }
    }

    /// Move to the DLQ, then ack. The entry stays pending if the DLQ write fails.
    async fn dead_letter(&self, stream_id: &str, entry: &DlqEntry, reason: &'static str) {
        match self.dlq.move_to_dlq(entry).await {
            Ok(_) => {
                self.metrics.job_dead_lettered(reason);
                self.ack(stream_id).await;
            }
            Err(e) => error!(
                stream_id = %stream_id,
                error = %e,
                "Failed to dead-letter entry, leaving it pending"
            ),
        }
    }

    async fn ack(&self, stream_id: &str) {
        if let Err(e) = self.consumer.ack(stream_id).await {
            error!(stream_id = %stream_id, error = %e, "Failed to acknowledge entry");
        }
    }
}

/// Sleep for `duration` unless shutdown is signalled first.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) {
    tokio::select! {
        changed = shutdown.changed() => {
            // Sender dropped: nothing will ever signal, so still honour the sleep
            if changed.is_err() {
                tokio::time::sleep(duration).await;
            }
        }
        _ = tokio::time::sleep(duration) => {}
    }
}
