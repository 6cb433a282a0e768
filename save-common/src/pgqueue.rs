//! # PgQueue
//!
//! The at-least-once delivery queue between the save-event producer and the
//! worker, implemented on top of a PostgreSQL table. A message carries only
//! the save event id. Dequeueing holds the row inside an open transaction
//! (`FOR UPDATE SKIP LOCKED`), so a worker that dies without resolving its
//! job rolls the transaction back and the message becomes deliverable again.
use std::str::FromStr;
use std::time;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use thiserror::Error;
use uuid::Uuid;

/// Enumeration of parsing errors in PgQueue.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("{0} is not a valid JobStatus")]
    ParseJobStatusError(String),
}

/// Enumeration of database-related errors in PgQueue.
/// Errors that can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
}

/// An error that occurs when a job cannot be retried.
/// Returns the underlying job so that a client can fail it.
#[derive(Error, Debug)]
#[error("retry is an invalid state for this job: {error}")]
pub struct RetryInvalidError {
    pub job: Box<SaveJob>,
    pub error: String,
}

/// Enumeration of errors that can occur when retrying a job.
/// They are a separate enum as a failed retry returns the underlying job.
#[derive(Error, Debug)]
pub enum RetryError {
    #[error(transparent)]
    DatabaseError(#[from] DatabaseError),
    #[error(transparent)]
    RetryInvalidError(#[from] RetryInvalidError),
}

/// Enumeration of possible statuses for a queue job.
/// There is no running state: a dequeued job is hidden from other workers by
/// its open transaction, not by a status value.
#[derive(Debug, PartialEq, sqlx::Type)]
#[sqlx(type_name = "queue_job_status")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the queue to be picked up by a worker.
    Available,
    /// Successfully resolved by a worker.
    Completed,
    /// Unsuccessfully resolved by a worker, no attempts remaining.
    Failed,
}

/// Allow casting JobStatus from strings.
impl FromStr for JobStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(JobStatus::Available),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            invalid => Err(ParseError::ParseJobStatusError(invalid.to_owned())),
        }
    }
}

/// A job as dequeued from the save queue.
#[derive(sqlx::FromRow, Debug)]
pub struct Job {
    /// A unique id identifying a job.
    pub id: i64,
    /// The save event this message points at; the only payload.
    pub save_event_id: Uuid,
    /// The queue this job belongs to.
    pub queue: String,
    /// The current status of the job.
    pub status: JobStatus,
    /// A number corresponding to the current job attempt.
    pub attempt: i32,
    /// The current job's number of max attempts.
    pub max_attempts: i32,
    /// A vector of identifiers that have attempted this job.
    pub attempted_by: Vec<String>,
    /// Any errors logged against past attempts.
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Not eligible for delivery before this instant; retries push it forward.
    pub scheduled_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Return true if this job attempt is greater or equal to the maximum number of possible attempts.
    pub fn is_gte_max_attempts(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A new job to be enqueued into a `PgQueue`.
#[derive(Debug)]
pub struct NewSaveJob {
    pub save_event_id: Uuid,
    pub max_attempts: i32,
}

impl NewSaveJob {
    pub fn new(save_event_id: Uuid, max_attempts: i32) -> Self {
        Self {
            save_event_id,
            max_attempts,
        }
    }
}

/// State a job is transitioned to after successfully completing.
#[derive(Debug)]
pub struct CompletedJob {
    pub id: i64,
    pub queue: String,
}

/// State a job is transitioned to after it has been re-enqueued for retrying.
#[derive(Debug)]
pub struct RetriedJob {
    pub id: i64,
    pub queue: String,
}

/// State a job is transitioned to after exhausting all of its attempts.
#[derive(Debug)]
pub struct FailedJob {
    pub id: i64,
    pub queue: String,
    pub error: String,
}

/// A dequeued job and the open transaction hiding it from other workers.
/// Must be resolved through `complete`, `fail` or `retry`; dropping it
/// rolls the transaction back and makes the message deliverable again.
#[derive(Debug)]
pub struct SaveJob {
    pub job: Job,
    txn: Transaction<'static, Postgres>,
}

impl SaveJob {
    /// Consume the job to mark it completed and commit the delivery.
    pub async fn complete(mut self) -> Result<CompletedJob, DatabaseError> {
        let base_query = r#"
UPDATE
    save_queue
SET
    last_attempt_finished_at = NOW(),
    status = 'completed'::queue_job_status
WHERE
    id = $1
        "#;

        sqlx::query(base_query)
            .bind(self.job.id)
            .execute(&mut *self.txn)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        self.txn
            .commit()
            .await
            .map_err(|error| DatabaseError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })?;

        Ok(CompletedJob {
            id: self.job.id,
            queue: self.job.queue,
        })
    }

    /// Consume the job to mark it failed with `error` and commit.
    pub async fn fail(mut self, error: &str) -> Result<FailedJob, DatabaseError> {
        let base_query = r#"
UPDATE
    save_queue
SET
    last_attempt_finished_at = NOW(),
    status = 'failed'::queue_job_status,
    errors = array_append(errors, $2)
WHERE
    id = $1
        "#;

        sqlx::query(base_query)
            .bind(self.job.id)
            .bind(error)
            .execute(&mut *self.txn)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        self.txn
            .commit()
            .await
            .map_err(|error| DatabaseError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })?;

        Ok(FailedJob {
            id: self.job.id,
            queue: self.job.queue,
            error: error.to_owned(),
        })
    }

    /// Consume the job to schedule a redelivery after `retry_interval`.
    /// Refused when no attempts remain; the job is handed back so the
    /// caller can fail it instead.
    pub async fn retry(
        mut self,
        error: &str,
        retry_interval: time::Duration,
    ) -> Result<RetriedJob, RetryError> {
        if self.job.is_gte_max_attempts() {
            return Err(RetryError::from(RetryInvalidError {
                job: Box::new(self),
                error: "maximum attempts reached".to_owned(),
            }));
        }

        let base_query = r#"
UPDATE
    save_queue
SET
    last_attempt_finished_at = NOW(),
    status = 'available'::queue_job_status,
    scheduled_at = NOW() + make_interval(secs => $2),
    errors = array_append(errors, $3)
WHERE
    id = $1
        "#;

        sqlx::query(base_query)
            .bind(self.job.id)
            .bind(retry_interval.as_secs_f64())
            .bind(error)
            .execute(&mut *self.txn)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        self.txn
            .commit()
            .await
            .map_err(|error| DatabaseError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })?;

        Ok(RetriedJob {
            id: self.job.id,
            queue: self.job.queue,
        })
    }
}

/// A queue implemented on top of a PostgreSQL table.
#[derive(Clone)]
pub struct PgQueue {
    /// A name to identify this PgQueue as multiple may share a table.
    name: String,
    /// A connection pool used to connect to the PostgreSQL database.
    pool: PgPool,
}

pub type PgQueueResult<T> = std::result::Result<T, DatabaseError>;

impl PgQueue {
    /// Initialize a new PgQueue by connecting a pool to the database in `url`.
    pub async fn new(
        queue_name: &str,
        url: &str,
        max_connections: u32,
        app_name: &'static str,
    ) -> PgQueueResult<Self> {
        let name = queue_name.to_owned();
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| DatabaseError::PoolCreationError { error })?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self { name, pool })
    }

    /// Initialize a new PgQueue from a provided connection pool.
    pub fn new_from_pool(queue_name: &str, pool: PgPool) -> Self {
        let name = queue_name.to_owned();

        Self { name, pool }
    }

    /// Dequeue the next deliverable job, holding it in an open transaction.
    /// Concurrent dequeues skip locked rows, so a given message is delivered
    /// to exactly one worker at a time.
    pub async fn dequeue(&self, attempted_by: &str) -> PgQueueResult<Option<SaveJob>> {
        let mut txn = self
            .pool
            .begin()
            .await
            .map_err(|error| DatabaseError::ConnectionError { error })?;

        // For more details on FOR UPDATE SKIP LOCKED see:
        // 2ndquadrant.com/en/blog/what-is-select-skip-locked-for-in-postgresql-9-5.
        let base_query = r#"
WITH available_in_queue AS (
    SELECT
        id
    FROM
        save_queue
    WHERE
        status = 'available'
        AND scheduled_at <= NOW()
        AND queue = $1
    ORDER BY
        attempt,
        scheduled_at
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    save_queue
SET
    attempted_at = NOW(),
    attempt = attempt + 1,
    attempted_by = array_append(attempted_by, $2::text)
FROM
    available_in_queue
WHERE
    save_queue.id = available_in_queue.id
RETURNING
    save_queue.*
        "#;

        let query_result: Result<Option<Job>, sqlx::Error> = sqlx::query_as(base_query)
            .bind(&self.name)
            .bind(attempted_by)
            .fetch_optional(&mut *txn)
            .await;

        match query_result {
            Ok(Some(job)) => Ok(Some(SaveJob { job, txn })),
            // Transaction is rolled back on drop.
            Ok(None) | Err(sqlx::Error::RowNotFound) => Ok(None),
            Err(error) => Err(DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            }),
        }
    }

    /// Enqueue a `NewSaveJob` into this PgQueue.
    /// We take ownership of `NewSaveJob` to enforce a specific `NewSaveJob` is only enqueued once.
    pub async fn enqueue(&self, job: NewSaveJob) -> PgQueueResult<()> {
        let base_query = r#"
INSERT INTO save_queue
    (save_event_id, queue, status, attempt, max_attempts, created_at, scheduled_at)
VALUES
    ($1, $2, 'available'::queue_job_status, 0, $3, NOW(), NOW())
        "#;

        sqlx::query(base_query)
            .bind(job.save_event_id)
            .bind(&self.name)
            .bind(job.max_attempts)
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Use process id as a worker id for tests.
    fn worker_id() -> String {
        std::process::id().to_string()
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_can_enqueue_and_dequeue_job(db: PgPool) {
        let save_event_id = Uuid::now_v7();
        let worker_id = worker_id();

        let queue = PgQueue::new_from_pool("test_can_enqueue_and_dequeue_job", db);

        queue
            .enqueue(NewSaveJob::new(save_event_id, 3))
            .await
            .expect("failed to enqueue job");

        let save_job = queue
            .dequeue(&worker_id)
            .await
            .expect("failed to dequeue job")
            .expect("didn't find a job to dequeue");

        assert_eq!(save_job.job.save_event_id, save_event_id);
        assert_eq!(save_job.job.attempt, 1);
        assert!(save_job.job.attempted_by.contains(&worker_id));
        assert_eq!(save_job.job.max_attempts, 3);

        save_job.complete().await.expect("failed to complete job");

        // Nothing left to deliver.
        let empty = queue
            .dequeue(&worker_id)
            .await
            .expect("failed to dequeue job");
        assert!(empty.is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_dequeue_returns_none_on_no_jobs(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_dequeue_returns_none_on_no_jobs", db);

        let empty = queue
            .dequeue(&worker_id())
            .await
            .expect("failed to dequeue job");

        assert!(empty.is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_dropped_job_is_redelivered(db: PgPool) {
        let save_event_id = Uuid::now_v7();
        let worker_id = worker_id();
        let queue = PgQueue::new_from_pool("test_dropped_job_is_redelivered", db);

        queue
            .enqueue(NewSaveJob::new(save_event_id, 3))
            .await
            .expect("failed to enqueue job");

        // A worker picks the job up and dies without resolving it.
        let save_job = queue
            .dequeue(&worker_id)
            .await
            .expect("failed to dequeue job")
            .expect("didn't find a job to dequeue");
        drop(save_job);

        // The rollback makes the message deliverable again, attempt bumped.
        let redelivered = queue
            .dequeue(&worker_id)
            .await
            .expect("failed to dequeue job")
            .expect("dropped job should be redelivered");
        assert_eq!(redelivered.job.save_event_id, save_event_id);
        assert_eq!(redelivered.job.attempt, 2);

        redelivered.complete().await.expect("failed to complete job");
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_can_retry_job_with_remaining_attempts(db: PgPool) {
        let save_event_id = Uuid::now_v7();
        let worker_id = worker_id();
        let queue = PgQueue::new_from_pool("test_can_retry_job_with_remaining_attempts", db);

        queue
            .enqueue(NewSaveJob::new(save_event_id, 2))
            .await
            .expect("failed to enqueue job");

        let save_job = queue
            .dequeue(&worker_id)
            .await
            .expect("failed to dequeue job")
            .expect("didn't find a job to dequeue");

        save_job
            .retry("a very reasonable failure reason", time::Duration::ZERO)
            .await
            .expect("failed to retry job");

        let retried_job = queue
            .dequeue(&worker_id)
            .await
            .expect("failed to dequeue job")
            .expect("didn't find retried job to dequeue");

        assert_eq!(retried_job.job.save_event_id, save_event_id);
        assert_eq!(retried_job.job.attempt, 2);
        assert_eq!(retried_job.job.attempted_by.len(), 2);
        assert_eq!(
            retried_job.job.errors,
            vec!["a very reasonable failure reason".to_owned()]
        );

        retried_job.complete().await.expect("failed to complete job");
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_cannot_retry_job_without_remaining_attempts(db: PgPool) {
        let save_event_id = Uuid::now_v7();
        let worker_id = worker_id();
        let queue =
            PgQueue::new_from_pool("test_cannot_retry_job_without_remaining_attempts", db);

        queue
            .enqueue(NewSaveJob::new(save_event_id, 1))
            .await
            .expect("failed to enqueue job");

        let save_job = queue
            .dequeue(&worker_id)
            .await
            .expect("failed to dequeue job")
            .expect("didn't find a job to dequeue");

        let denied = save_job
            .retry("a very reasonable failure reason", time::Duration::ZERO)
            .await;

        // The job comes back so it can be failed instead.
        match denied {
            Err(RetryError::RetryInvalidError(invalid)) => {
                invalid.job.fail("gave up").await.expect("failed to fail job");
            }
            other => panic!("expected RetryInvalidError, got {other:?}"),
        }

        let empty = queue
            .dequeue(&worker_id)
            .await
            .expect("failed to dequeue job");
        assert!(empty.is_none());
    }
}
