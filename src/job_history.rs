use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::{AppResult, DatabaseError};
use crate::pipeline::JobOutcome;
use crate::status::{StatusEvent, StatusKind, StatusSink};

/// One finished print job. The caption printed on the card is not kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct JobRecord {
    pub id: String,
    pub created_at: String,
    pub finished_at: Option<String>,
    pub device_name: Option<String>,
    /// `completed` or the failure kind, e.g. `open_error`.
    pub outcome: String,
    pub failure_detail: Option<String>,
    pub driver_code: Option<i32>,
}

impl JobRecord {
    pub fn new(id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            created_at: created_at.to_rfc3339(),
            finished_at: None,
            device_name: None,
            outcome: "running".to_string(),
            failure_detail: None,
            driver_code: None,
        }
    }

    pub fn finish(&mut self, outcome: &JobOutcome, at: DateTime<Utc>) {
        self.finished_at = Some(at.to_rfc3339());
        match outcome {
            JobOutcome::Completed => {
                self.outcome = "completed".to_string();
                self.failure_detail = None;
                self.driver_code = None;
            }
            JobOutcome::Failed(reason) => {
                self.outcome = reason.kind().to_string();
                self.failure_detail = Some(reason.to_string());
                self.driver_code = reason.driver_code();
            }
        }
    }

    pub async fn save(&self, pool: &SqlitePool) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO print_job (
                id, created_at, finished_at, device_name,
                outcome, failure_detail, driver_code
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7
            )
            ON CONFLICT(id) DO UPDATE SET
                finished_at = excluded.finished_at,
                device_name = excluded.device_name,
                outcome = excluded.outcome,
                failure_detail = excluded.failure_detail,
                driver_code = excluded.driver_code
            "#,
        )
        .bind(&self.id)
        .bind(&self.created_at)
        .bind(&self.finished_at)
        .bind(&self.device_name)
        .bind(&self.outcome)
        .bind(&self.failure_detail)
        .bind(self.driver_code)
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::QueryFailed(format!("Failed to save print job: {}", e)))?;

        Ok(())
    }

    pub async fn load(id: &str, pool: &SqlitePool) -> AppResult<Option<Self>> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT
                id, created_at, finished_at, device_name,
                outcome, failure_detail, driver_code
            FROM print_job
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| DatabaseError::QueryFailed(format!("Failed to load print job: {}", e)))?;

        Ok(record)
    }

    /// Most recent jobs first.
    pub async fn recent(limit: u32, pool: &SqlitePool) -> AppResult<Vec<Self>> {
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT
                id, created_at, finished_at, device_name,
                outcome, failure_detail, driver_code
            FROM print_job
            ORDER BY created_at DESC
            LIMIT ?1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(pool)
        .await
        .map_err(|e| DatabaseError::QueryFailed(format!("Failed to list print jobs: {}", e)))?;

        Ok(records)
    }
}

/// Builds a `JobRecord` from a job's status events and hands it to a single
/// writer task once the job finishes.
pub struct HistoryRecorder {
    running: Mutex<HashMap<Uuid, JobRecord>>,
    finished: Mutex<Option<mpsc::UnboundedSender<JobRecord>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl HistoryRecorder {
    /// Starts the writer task on the current runtime.
    pub fn spawn(pool: SqlitePool) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<JobRecord>();
        let writer = tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                match record.save(&pool).await {
                    Ok(()) => info!("Print job {} saved to history", record.id),
                    Err(e) => error!("Failed to record print job {}: {}", record.id, e),
                }
            }
            debug!("History writer drained");
        });

        Self {
            running: Mutex::new(HashMap::new()),
            finished: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Stops accepting records and waits until every queued one is stored.
    pub async fn shutdown(&self) {
        drop(
            self.finished
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                error!("History writer task failed: {}", e);
            }
        }
    }
}

impl StatusSink for HistoryRecorder {
    fn report(&self, event: StatusEvent) {
        let finished = {
            let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            let record = running
                .entry(event.job_id)
                .or_insert_with(|| JobRecord::new(event.job_id, event.at));

            match &event.kind {
                StatusKind::DeviceSelected { name, .. } => {
                    record.device_name = Some(name.clone());
                    None
                }
                StatusKind::Finished { outcome } => {
                    record.finish(outcome, event.at);
                    running.remove(&event.job_id)
                }
                _ => None,
            }
        };

        let Some(record) = finished else {
            return;
        };
        debug!("Queueing print job {} as {}", record.id, record.outcome);

        let sender = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        let queued = match sender.as_ref() {
            Some(sender) => sender.send(record).map_err(|e| e.0),
            None => Err(record),
        };
        if let Err(record) = queued {
            warn!("History is closed, print job {} not recorded", record.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DriverError;
    use crate::pipeline::FailureReason;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn event(job_id: Uuid, seq: u64, kind: StatusKind) -> StatusEvent {
        StatusEvent {
            job_id,
            seq,
            at: Utc::now(),
            kind,
        }
    }

    #[tokio::test]
    async fn test_save_and_load_failed_job() {
        let pool = pool().await;
        let mut record = JobRecord::new(Uuid::new_v4(), Utc::now());
        record.device_name = Some("SMART-51".to_string());
        record.finish(
            &JobOutcome::Failed(FailureReason::OpenError(DriverError::OpenFailed(1))),
            Utc::now(),
        );
        record.save(&pool).await.unwrap();

        let loaded = JobRecord::load(&record.id, &pool).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.outcome, "open_error");
        assert_eq!(loaded.driver_code, Some(1));
    }

    #[tokio::test]
    async fn test_load_missing_job() {
        let pool = pool().await;
        assert!(JobRecord::load("nope", &pool).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recent_is_newest_first_and_limited() {
        let pool = pool().await;
        let base = Utc::now();
        for minutes in 0..3 {
            let mut record = JobRecord::new(
                Uuid::new_v4(),
                base + chrono::Duration::minutes(minutes),
            );
            record.finish(&JobOutcome::Completed, base);
            record.save(&pool).await.unwrap();
        }

        let recent = JobRecord::recent(2, &pool).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].created_at > recent[1].created_at);
    }

    #[tokio::test]
    async fn test_recorder_saves_on_finish() {
        let pool = pool().await;
        let recorder = HistoryRecorder::spawn(pool.clone());
        let job_id = Uuid::new_v4();

        recorder.report(event(
            job_id,
            0,
            StatusKind::DeviceSelected {
                name: "SMART-51".to_string(),
                description: "IDP SMART-51 Dual (USB001)".to_string(),
            },
        ));
        recorder.report(event(
            job_id,
            1,
            StatusKind::Finished {
                outcome: JobOutcome::Completed,
            },
        ));
        recorder.shutdown().await;

        let saved = JobRecord::load(&job_id.to_string(), &pool)
            .await
            .unwrap()
            .expect("job was not recorded");
        assert_eq!(saved.outcome, "completed");
        assert_eq!(saved.device_name.as_deref(), Some("SMART-51"));
        assert!(saved.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_recorder_skips_unfinished_jobs() {
        let pool = pool().await;
        let recorder = HistoryRecorder::spawn(pool.clone());
        let job_id = Uuid::new_v4();

        recorder.report(event(
            job_id,
            0,
            StatusKind::StepStarted {
                step: crate::status::Step::EnumerateDevices,
            },
        ));
        recorder.shutdown().await;

        assert!(JobRecord::load(&job_id.to_string(), &pool)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_every_queued_job() {
        let pool = pool().await;
        let recorder = HistoryRecorder::spawn(pool.clone());
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();

        for id in &ids {
            recorder.report(event(
                *id,
                0,
                StatusKind::Finished {
                    outcome: JobOutcome::Failed(FailureReason::Cancelled),
                },
            ));
        }
        recorder.shutdown().await;

        assert_eq!(JobRecord::recent(10, &pool).await.unwrap().len(), ids.len());
    }

    #[tokio::test]
    async fn test_finish_after_shutdown_is_dropped() {
        let pool = pool().await;
        let recorder = HistoryRecorder::spawn(pool.clone());
        recorder.shutdown().await;

        let job_id = Uuid::new_v4();
        recorder.report(event(
            job_id,
            0,
            StatusKind::Finished {
                outcome: JobOutcome::Completed,
            },
        ));
        assert!(JobRecord::load(&job_id.to_string(), &pool)
            .await
            .unwrap()
            .is_none());
    }
}
