//! Consume queued save events and run each through the pipeline.

use std::sync::Arc;
use std::time;

use save_common::health::HealthHandle;
use save_common::pgqueue::{PgQueue, RetryError, SaveJob};
use save_common::retry::RetryPolicy;
use save_common::store::Store;
use tokio::sync;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{PipelineError, WorkerError};
use crate::extract::Extractor;
use crate::finalizer::{FinalizeOutcome, Finalizer};
use crate::resolver::{PlaceLookup, Resolver};

/// How one save event came out of the pipeline.
#[derive(Debug, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// A new restaurant link was written for the user.
    Saved,
    /// The user had already saved this restaurant; the event completed
    /// with a benign note.
    Duplicate,
    /// The event had already reached a terminal status, likely a queue
    /// redelivery of finished work.
    AlreadyTerminal,
    /// No save event row exists for the queued id; the message is dropped.
    EventMissing,
}

/// The extract, resolve, finalize sequence over a single save event.
/// Every collaborator is injected, so tests can swap the place provider
/// or point the whole pipeline at a scratch database.
#[derive(Clone)]
pub struct Pipeline {
    store: Store,
    extractor: Extractor,
    resolver: Resolver,
    finalizer: Finalizer,
}

impl Pipeline {
    pub fn new(store: Store, places: Arc<dyn PlaceLookup>) -> Self {
        let resolver = Resolver::new(store.clone(), places);
        let finalizer = Finalizer::new(store.clone());

        Self {
            store,
            extractor: Extractor::default(),
            resolver,
            finalizer,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Advance one save event to a terminal status.
    ///
    /// Redeliveries are absorbed here: terminal events return without
    /// rework, and an event already in processing is picked up again from
    /// the start since every stage is idempotent.
    pub async fn process(&self, save_event_id: Uuid) -> Result<PipelineOutcome, PipelineError> {
        let Some(event) = self.store.get_save_event(save_event_id).await? else {
            error!("save event {} has no row, dropping message", save_event_id);
            return Ok(PipelineOutcome::EventMissing);
        };

        if event.status.is_terminal() {
            debug!("save event {} already {}, nothing to do", event.id, event.status);
            return Ok(PipelineOutcome::AlreadyTerminal);
        }

        let event = self.store.mark_processing(event.id).await?;

        let extraction = self
            .extractor
            .extract(event.raw_caption.as_deref(), &event.source_url);
        let restaurant = self.resolver.resolve(&extraction).await?;

        match self.finalizer.finalize(&event, &restaurant).await? {
            FinalizeOutcome::Linked(_) => Ok(PipelineOutcome::Saved),
            FinalizeOutcome::Duplicate => Ok(PipelineOutcome::Duplicate),
        }
    }
}

/// A worker to poll `PgQueue` and spawn tasks to process save events when a job becomes available.
pub struct SaveWorker<'p> {
    /// An identifier for this worker. Used to mark jobs we have consumed.
    name: String,
    /// The queue we will be dequeuing jobs from.
    queue: &'p PgQueue,
    /// The pipeline each dequeued save event is run through.
    pipeline: Pipeline,
    /// The interval for polling the queue.
    poll_interval: time::Duration,
    /// Maximum number of concurrent jobs being processed.
    max_concurrent_jobs: usize,
    /// The retry policy used to calculate retry intervals when a job fails with a retryable error.
    retry_policy: RetryPolicy,
    /// The liveness check handle, to call on a schedule to report healthy.
    liveness: HealthHandle,
}

impl<'p> SaveWorker<'p> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        queue: &'p PgQueue,
        pipeline: Pipeline,
        poll_interval: time::Duration,
        max_concurrent_jobs: usize,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            pipeline,
            poll_interval,
            max_concurrent_jobs,
            retry_policy,
            liveness,
        }
    }

    /// Wait until a job becomes available in our queue.
    async fn wait_for_job(&self) -> Result<SaveJob, WorkerError> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            if let Some(job) = self.queue.dequeue(&self.name).await? {
                return Ok(job);
            }
        }
    }

    /// Run this worker to continuously process any jobs that become available.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let semaphore = Arc::new(sync::Semaphore::new(self.max_concurrent_jobs));
        let report_semaphore_utilization = || {
            metrics::gauge!("save_worker_saturation_percent")
                .set(1f64 - semaphore.available_permits() as f64 / self.max_concurrent_jobs as f64);
        };

        loop {
            report_semaphore_utilization();
            let save_job = self.wait_for_job().await?;
            spawn_save_job_processing_task(
                self.pipeline.clone(),
                semaphore.clone(),
                self.retry_policy,
                save_job,
            )
            .await;
        }
    }
}

/// Spawn a Tokio task to process a save job once we successfully acquire a permit.
async fn spawn_save_job_processing_task(
    pipeline: Pipeline,
    semaphore: Arc<sync::Semaphore>,
    retry_policy: RetryPolicy,
    save_job: SaveJob,
) -> tokio::task::JoinHandle<Result<(), WorkerError>> {
    let permit = semaphore
        .acquire_owned()
        .await
        .expect("semaphore has been closed");

    let labels = [("queue", save_job.job.queue.clone())];

    metrics::counter!("save_jobs_total", &labels).increment(1);

    tokio::spawn(async move {
        let result = process_save_job(pipeline, save_job, &retry_policy).await;
        drop(permit);
        match result {
            Ok(_) => Ok(()),
            Err(error) => {
                error!("failed to process save job: {}", error);
                Err(error)
            }
        }
    })
}

/// Process a save job by transitioning it to its appropriate state after the pipeline ran.
///
/// Transient pipeline errors leave the save event untouched and retry the
/// queue job with backoff, until attempts run out and the event is marked
/// failed. Permanent pipeline errors mark the event failed immediately.
/// The new status of the save event is always written before the queue
/// job is closed, so a crash in between is redelivered and absorbed by
/// the terminal-status check rather than lost.
async fn process_save_job(
    pipeline: Pipeline,
    save_job: SaveJob,
    retry_policy: &RetryPolicy,
) -> Result<(), WorkerError> {
    let labels = [("queue", save_job.job.queue.clone())];
    let event_id = save_job.job.save_event_id;
    let attempt = save_job.job.attempt as u32;

    let now = tokio::time::Instant::now();

    let result = pipeline.process(event_id).await;

    let elapsed = now.elapsed().as_secs_f64();

    match result {
        Ok(outcome) => {
            debug!("save event {} finished as {:?}", event_id, outcome);
            save_job.complete().await?;

            metrics::counter!("save_jobs_completed", &labels).increment(1);
            metrics::histogram!("save_jobs_processing_duration_seconds", &labels).record(elapsed);

            Ok(())
        }
        Err(error) if error.is_transient() => {
            let retry_interval = retry_policy.retry_interval(attempt);

            match save_job.retry(&error.to_string(), retry_interval).await {
                Ok(_) => {
                    metrics::counter!("save_jobs_retried", &labels).increment(1);

                    Ok(())
                }
                Err(RetryError::RetryInvalidError(invalid)) => {
                    // Attempts exhausted. Surface the failure on the save
                    // event so its owner can see what happened.
                    if let Err(store_error) =
                        pipeline.store().fail_save_event(event_id, &error.to_string()).await
                    {
                        error!(
                            "could not record failure on save event {}: {}",
                            event_id, store_error
                        );
                    }
                    invalid.job.fail(&error.to_string()).await?;

                    metrics::counter!("save_jobs_failed", &labels).increment(1);

                    Ok(())
                }
                Err(RetryError::DatabaseError(job_error)) => Err(WorkerError::from(job_error)),
            }
        }
        Err(error) => {
            if let Err(store_error) =
                pipeline.store().fail_save_event(event_id, &error.to_string()).await
            {
                error!(
                    "could not record failure on save event {}: {}",
                    event_id, store_error
                );
            }
            save_job.fail(&error.to_string()).await?;

            metrics::counter!("save_jobs_failed", &labels).increment(1);

            Ok(())
        }
    }
}
