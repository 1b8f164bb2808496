use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use uuid::Uuid;

use crate::context::{CancelHandle, OpContext};
use crate::error::{Error, ErrorKind, Result};
use crate::metrics::JOBS_TOTAL;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for JobError {
    fn from(err: &Error) -> Self {
        Self { kind: err.kind(), message: err.message().to_string() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Canceled,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Canceled => "canceled",
            JobStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub description: String,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub canceled: Option<DateTime<Utc>>,
    pub error: Option<JobError>,
}

impl Job {
    pub fn status(&self) -> JobStatus {
        match (self.started, self.completed) {
            (_, Some(_)) if self.canceled.is_some() => JobStatus::Canceled,
            (_, Some(_)) if self.error.is_some() => JobStatus::Error,
            (_, Some(_)) => JobStatus::Completed,
            (Some(_), None) => JobStatus::Running,
            (None, None) => JobStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub since: Option<DateTime<Utc>>,
}

struct JobEntry {
    job: Job,
    cancel: CancelHandle,
}

/// Фоновые задачи с ограничением числа одновременно выполняемых
#[derive(Clone)]
pub struct JobHandler {
    jobs: Arc<RwLock<HashMap<String, JobEntry>>>,
    semaphore: Arc<Semaphore>,
    max_age: Duration,
}

impl JobHandler {
    pub fn new(max_concurrent: usize, max_age: Duration) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            max_age,
        }
    }

    /// Регистрирует задачу и сразу возвращает ее ID
    pub async fn create<F, Fut>(&self, description: impl Into<String>, task: F) -> Result<String>
    where
        F: FnOnce(OpContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.purge(self.max_age).await;

        let id = Uuid::new_v4().to_string();
        let (ctx, cancel) = OpContext::with_cancel();
        let job = Job {
            id: id.clone(),
            description: description.into(),
            created: Utc::now(),
            started: None,
            completed: None,
            canceled: None,
            error: None,
        };
        debug!("job {} created: {}", id, job.description);
        self.jobs.write().await.insert(id.clone(), JobEntry { job, cancel });

        let jobs = self.jobs.clone();
        let semaphore = self.semaphore.clone();
        let job_id = id.clone();
        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let result = match ctx.check() {
                // отменена до запуска
                Err(err) => Err(Error::from(err)),
                Ok(()) => {
                    if let Some(entry) = jobs.write().await.get_mut(&job_id) {
                        entry.job.started = Some(Utc::now());
                    }
                    task(ctx).await
                }
            };
            let mut guard = jobs.write().await;
            if let Some(entry) = guard.get_mut(&job_id) {
                entry.job.completed = Some(Utc::now());
                if let Err(err) = &result {
                    warn!("job {} ({}) failed: {}", job_id, entry.job.description, err);
                    entry.job.error = Some(JobError::from(err));
                }
                JOBS_TOTAL.with_label_values(&[entry.job.status().as_str()]).inc();
            }
        });
        Ok(id)
    }

    pub async fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        let mut list: Vec<Job> = jobs
            .values()
            .map(|e| &e.job)
            .filter(|j| filter.status.map_or(true, |s| j.status() == s))
            .filter(|j| filter.since.map_or(true, |s| j.created >= s))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created.cmp(&b.created));
        list
    }

    pub async fn get(&self, id: &str) -> Result<Job> {
        self.jobs
            .read()
            .await
            .get(id)
            .map(|e| e.job.clone())
            .ok_or_else(|| Error::not_found(format!("job '{}' not found", id)))
    }

    pub async fn cancel(&self, id: &str) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("job '{}' not found", id)))?;
        if entry.job.completed.is_some() {
            return Err(Error::invalid_input(format!("job '{}' already completed", id)));
        }
        if entry.job.canceled.is_none() {
            entry.job.canceled = Some(Utc::now());
            entry.cancel.cancel();
            info!("job {} canceled", id);
        }
        Ok(())
    }

    /// Ждет завершения задачи, опрашивая ее состояние
    pub async fn wait(&self, id: &str, interval: Duration) -> Result<Job> {
        loop {
            let job = self.get(id).await?;
            if job.completed.is_some() {
                return Ok(job);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Удаляет завершенные задачи старше `max_age`
    pub async fn purge(&self, max_age: Duration) -> usize {
        let Ok(age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let Some(threshold) = Utc::now().checked_sub_signed(age) else {
            return 0;
        };
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, e| e.job.completed.map_or(true, |c| c >= threshold));
        let removed = before - jobs.len();
        if removed > 0 {
            debug!("purged {} job(s)", removed);
        }
        removed
    }
}
