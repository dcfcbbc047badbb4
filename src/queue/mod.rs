//! Durable priority job queue with retry and backoff.
//!
//! Every state transition is written to the [`JobStore`] before it takes effect in
//! memory, so reopening a store recovers a consistent queue.

use crate::{
    exec::{Language, UnsupportedLanguage},
    fuzz::FuzzJob,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::{
        mpsc::{channel, Receiver, Sender},
        Mutex,
    },
    time::Duration,
};
use thiserror::Error;

pub use store::{FileStore, JobStore, MemoryStore};

/// Job persistence backends.
pub mod store;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("job record: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("no such job: {0}")]
    NotFound(String),
    #[error("job {id} is {status:?}")]
    InvalidState { id: String, status: JobStatus },
    #[error("rejected job: {0}")]
    Invalid(#[from] ValidationError),
}

/// Malformed job submissions, rejected at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("priority {0} outside 1..=10")]
    Priority(u8),
    #[error("missing {0}")]
    Empty(&'static str),
    #[error("unsupported language: {0}")]
    Language(String),
    #[error("max iterations must be positive")]
    ZeroIterations,
    #[error("max attempts must be positive")]
    ZeroAttempts,
}

impl From<UnsupportedLanguage> for ValidationError {
    fn from(e: UnsupportedLanguage) -> Self {
        ValidationError::Language(e.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanJob {
    pub target_id: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub target_id: String,
    pub code: String,
    pub language: Language,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportJob {
    pub target_id: String,
    pub crash_hashes: Vec<String>,
    pub format: String,
}

/// Job kinds, each with its own payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum JobPayload {
    Scan(ScanJob),
    Analysis(AnalysisJob),
    Report(ReportJob),
    Fuzz(FuzzJob),
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::Scan(_) => "scan",
            JobPayload::Analysis(_) => "analysis",
            JobPayload::Report(_) => "report",
            JobPayload::Fuzz(_) => "fuzz",
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let target_id = match self {
            JobPayload::Scan(j) => {
                if j.target.trim().is_empty() {
                    return Err(ValidationError::Empty("scan target"));
                }
                &j.target_id
            }
            JobPayload::Analysis(j) => {
                if j.code.trim().is_empty() {
                    return Err(ValidationError::Empty("code"));
                }
                &j.target_id
            }
            JobPayload::Report(j) => &j.target_id,
            JobPayload::Fuzz(j) => return j.validate(),
        };
        if target_id.trim().is_empty() {
            return Err(ValidationError::Empty("target id"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub payload: JobPayload,
    pub priority: u8,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Insertion order, breaks priority ties.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a retried job may be dequeued again.
    pub available_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

/// Why a job attempt did not complete.
#[derive(Debug, Error)]
pub enum JobError {
    /// Worth another attempt.
    #[error("{0:#}")]
    Transient(anyhow::Error),
    /// Retrying cannot help.
    #[error("{0}")]
    Fatal(String),
    #[error("cancelled")]
    Cancelled,
}

/// Notifications pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum JobEvent {
    Progress {
        id: String,
        data: serde_json::Value,
    },
    Retrying {
        id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    Completed {
        id: String,
        result: serde_json::Value,
    },
    Failed {
        id: String,
        error: String,
    },
    Cancelled {
        id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(1000),
            cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay before the retry following failed attempt number `attempts`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(20);
        self.base
            .checked_mul(1 << shift)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    /// Pending jobs waiting out a retry delay, included in `pending`.
    pub delayed: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, PartialEq, Eq)]
struct Ready {
    priority: u8,
    seq: u64,
    id: String,
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Inner {
    jobs: FxHashMap<String, Job>,
    ready: BinaryHeap<Ready>,
    delayed: Vec<(DateTime<Utc>, String)>,
    cancel_requested: FxHashSet<String>,
    next_seq: u64,
}

impl Inner {
    fn push_ready(&mut self, job: &Job) {
        self.ready.push(Ready {
            priority: job.priority,
            seq: job.seq,
            id: job.id.clone(),
        });
    }

    fn schedule(&mut self, job: &Job) {
        match job.available_at {
            Some(at) if at > Utc::now() => self.delayed.push((at, job.id.clone())),
            _ => self.push_ready(job),
        }
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, id) = self.delayed.swap_remove(i);
                if let Some(job) = self.jobs.get(&id) {
                    let r = Ready {
                        priority: job.priority,
                        seq: job.seq,
                        id,
                    };
                    self.ready.push(r);
                }
            } else {
                i += 1;
            }
        }
    }

    fn job_mut(&mut self, id: &str) -> Result<&mut Job, QueueError> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }
}

/// Explicitly constructed queue, share it by reference or `Arc`.
pub struct JobQueue {
    inner: Mutex<Inner>,
    store: Box<dyn JobStore>,
    subscribers: Mutex<Vec<Sender<JobEvent>>>,
    policy: RetryPolicy,
}

impl JobQueue {
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            store: Box::new(MemoryStore::new()),
            subscribers: Mutex::new(Vec::new()),
            policy: RetryPolicy::default(),
        }
    }

    /// Opens a queue over `store`, recovering its jobs.
    ///
    /// Jobs left processing by a previous run go back to pending with their
    /// attempt count unchanged.
    pub fn open(store: Box<dyn JobStore>, policy: RetryPolicy) -> Result<Self, QueueError> {
        let mut inner = Inner::default();
        let mut jobs = store.load_all()?;
        jobs.sort_by_key(|j| j.seq);
        let mut recovered = 0;
        for mut job in jobs {
            inner.next_seq = inner.next_seq.max(job.seq + 1);
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Pending;
                job.started_at = None;
                store.save(&job)?;
                recovered += 1;
            }
            if job.status == JobStatus::Pending {
                inner.schedule(&job);
            }
            inner.jobs.insert(job.id.clone(), job);
        }
        if recovered != 0 {
            log::info!("queue: recovered {} interrupted jobs", recovered);
        }
        Ok(Self {
            inner: Mutex::new(inner),
            store,
            subscribers: Mutex::new(Vec::new()),
            policy,
        })
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn subscribe(&self) -> Receiver<JobEvent> {
        let (tx, rx) = channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    fn emit(&self, event: JobEvent) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|s| s.send(event.clone()).is_ok());
    }

    pub fn enqueue(&self, payload: JobPayload, priority: u8) -> Result<String, QueueError> {
        self.enqueue_with_attempts(payload, priority, self.policy.max_attempts)
    }

    /// Enqueues a fuzz job at the priority named in its options.
    pub fn submit(&self, job: FuzzJob) -> Result<String, QueueError> {
        let priority = job.options.priority;
        self.enqueue(JobPayload::Fuzz(job), priority)
    }

    pub fn enqueue_with_attempts(
        &self,
        payload: JobPayload,
        priority: u8,
        max_attempts: u32,
    ) -> Result<String, QueueError> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(ValidationError::Priority(priority).into());
        }
        if max_attempts == 0 {
            return Err(ValidationError::ZeroAttempts.into());
        }
        payload.validate()?;

        let mut inner = self.inner.lock().unwrap();
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            seq: inner.next_seq,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            available_at: None,
            error: None,
            result: None,
        };
        self.store.save(&job)?;
        inner.next_seq += 1;
        inner.push_ready(&job);
        let id = job.id.clone();
        log::debug!("queue: enqueued {} job {} (priority {})", job.payload.kind(), id, priority);
        inner.jobs.insert(id.clone(), job);
        Ok(id)
    }

    /// Takes the highest priority runnable job and marks it processing.
    pub fn dequeue(&self) -> Result<Option<Job>, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        inner.promote_due(Utc::now());
        while let Some(r) = inner.ready.pop() {
            // Entries of cancelled jobs are dropped lazily.
            let mut job = match inner.jobs.get(&r.id) {
                Some(j) if j.status == JobStatus::Pending => j.clone(),
                _ => continue,
            };
            job.status = JobStatus::Processing;
            job.started_at = Some(Utc::now());
            job.available_at = None;
            if let Err(e) = self.store.save(&job) {
                inner.ready.push(r);
                return Err(e);
            }
            inner.jobs.insert(job.id.clone(), job.clone());
            return Ok(Some(job));
        }
        Ok(None)
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        let inner = self.inner.lock().unwrap();
        inner.jobs.get(id).cloned()
    }

    /// Applies `f` to a processing job and persists it before committing.
    fn transition<F>(&self, id: &str, f: F) -> Result<Job, QueueError>
    where
        F: FnOnce(&mut Job),
    {
        let mut inner = self.inner.lock().unwrap();
        let cur = inner.job_mut(id)?;
        if cur.status != JobStatus::Processing {
            return Err(QueueError::InvalidState {
                id: id.to_string(),
                status: cur.status,
            });
        }
        let mut job = cur.clone();
        f(&mut job);
        self.store.save(&job)?;
        *cur = job.clone();
        if job.status.is_terminal() {
            inner.cancel_requested.remove(id);
        } else if job.status == JobStatus::Pending {
            inner.schedule(&job);
        }
        Ok(job)
    }

    pub fn complete(&self, id: &str, result: serde_json::Value) -> Result<(), QueueError> {
        let job = self.transition(id, |j| {
            j.status = JobStatus::Completed;
            j.completed_at = Some(Utc::now());
            j.error = None;
            j.result = Some(result);
        })?;
        self.emit(JobEvent::Completed {
            id: job.id,
            result: job.result.unwrap_or_default(),
        });
        Ok(())
    }

    /// Records a failed attempt. Transient failures are retried after a backoff
    /// while attempts remain, everything else is terminal.
    pub fn fail(&self, id: &str, err: &JobError) -> Result<JobStatus, QueueError> {
        let policy = self.policy;
        let msg = err.to_string();
        let mut delay = Duration::from_millis(0);
        let cancel = matches!(err, JobError::Cancelled) || self.is_cancelled(id);
        let job = self.transition(id, |j| {
            j.error = Some(msg.clone());
            if cancel {
                j.status = JobStatus::Cancelled;
                j.completed_at = Some(Utc::now());
                return;
            }
            j.attempts += 1;
            let retry = matches!(err, JobError::Transient(_)) && j.attempts < j.max_attempts;
            if retry {
                delay = policy.backoff(j.attempts);
                j.status = JobStatus::Pending;
                j.started_at = None;
                j.available_at = ChronoDuration::from_std(delay)
                    .ok()
                    .map(|d| Utc::now() + d);
            } else {
                j.status = JobStatus::Failed;
                j.completed_at = Some(Utc::now());
            }
        })?;

        let event = match job.status {
            JobStatus::Pending => {
                log::info!(
                    "queue: job {} attempt {}/{} failed, retrying in {:?}: {}",
                    job.id,
                    job.attempts,
                    job.max_attempts,
                    delay,
                    msg
                );
                JobEvent::Retrying {
                    id: job.id,
                    attempt: job.attempts,
                    delay_ms: delay.as_millis() as u64,
                    error: msg,
                }
            }
            JobStatus::Cancelled => JobEvent::Cancelled { id: job.id },
            _ => {
                log::warn!("queue: job {} failed after {} attempts: {}", job.id, job.attempts, msg);
                JobEvent::Failed {
                    id: job.id,
                    error: msg,
                }
            }
        };
        let status = job.status;
        self.emit(event);
        Ok(status)
    }

    pub fn report_progress(&self, id: &str, data: serde_json::Value) {
        self.emit(JobEvent::Progress {
            id: id.to_string(),
            data,
        });
    }

    /// Cancels a job: pending jobs leave the queue at once, processing jobs are
    /// flagged and stop after their current iteration. Returns `false` for
    /// unknown or finished jobs.
    pub fn cancel_job(&self, id: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let job = match inner.jobs.get(id) {
            Some(j) => j.clone(),
            None => return Ok(false),
        };
        match job.status {
            JobStatus::Pending => {
                let mut job = job;
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                self.store.save(&job)?;
                inner.delayed.retain(|(_, d)| d != id);
                inner.jobs.insert(id.to_string(), job);
                drop(inner);
                self.emit(JobEvent::Cancelled { id: id.to_string() });
                Ok(true)
            }
            JobStatus::Processing => {
                inner.cancel_requested.insert(id.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn is_cancelled(&self, id: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.cancel_requested.contains(id)
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        let mut s = QueueStats {
            delayed: inner.delayed.len(),
            ..QueueStats::default()
        };
        for j in inner.jobs.values() {
            match j.status {
                JobStatus::Pending => s.pending += 1,
                JobStatus::Processing => s.processing += 1,
                JobStatus::Completed => s.completed += 1,
                JobStatus::Failed => s.failed += 1,
                JobStatus::Cancelled => s.cancelled += 1,
            }
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn scan(target: &str) -> JobPayload {
        JobPayload::Scan(ScanJob {
            target_id: "t1".into(),
            target: target.into(),
        })
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(0),
            cap: Duration::from_millis(0),
        }
    }

    fn target(job: &Job) -> &str {
        match &job.payload {
            JobPayload::Scan(s) => &s.target,
            _ => unreachable!(),
        }
    }

    #[test]
    fn priority_then_fifo() {
        let q = JobQueue::in_memory();
        q.enqueue(scan("a"), 5).unwrap();
        q.enqueue(scan("b"), 9).unwrap();
        q.enqueue(scan("c"), 5).unwrap();
        q.enqueue(scan("d"), 1).unwrap();
        let order = std::iter::from_fn(|| q.dequeue().unwrap())
            .map(|j| target(&j).to_string())
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["b", "a", "c", "d"]);
    }

    #[test]
    fn validation_rejects() {
        let q = JobQueue::in_memory();
        assert!(matches!(
            q.enqueue(scan("a"), 0),
            Err(QueueError::Invalid(ValidationError::Priority(0)))
        ));
        assert!(matches!(
            q.enqueue(scan(" "), 5),
            Err(QueueError::Invalid(ValidationError::Empty(_)))
        ));
        assert!(q.dequeue().unwrap().is_none());
        assert_eq!(q.stats(), QueueStats::default());
    }

    #[test]
    fn retry_bound() {
        let q = JobQueue::open(Box::new(MemoryStore::new()), fast_policy()).unwrap();
        let events = q.subscribe();
        let id = q.enqueue(scan("a"), 5).unwrap();
        let mut runs = 0;
        while let Some(job) = q.dequeue().unwrap() {
            runs += 1;
            q.fail(&job.id, &JobError::Transient(anyhow::anyhow!("boom"))).unwrap();
        }
        assert_eq!(runs, 3);
        let job = q.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.error.as_deref(), Some("boom"));

        let events = events.try_iter().collect::<Vec<_>>();
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, JobEvent::Retrying { .. }))
                .count(),
            2
        );
        assert!(matches!(events.last(), Some(JobEvent::Failed { .. })));
    }

    #[test]
    fn fatal_errors_are_terminal() {
        let q = JobQueue::in_memory();
        let id = q.enqueue(scan("a"), 5).unwrap();
        let job = q.dequeue().unwrap().unwrap();
        let status = q.fail(&job.id, &JobError::Fatal("bad target".into())).unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(q.get_job(&id).unwrap().attempts, 1);
        assert!(q.dequeue().unwrap().is_none());
    }

    #[test]
    fn backoff_delays_retry() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base: Duration::from_secs(60),
            cap: Duration::from_secs(600),
        };
        let q = JobQueue::open(Box::new(MemoryStore::new()), policy).unwrap();
        q.enqueue(scan("a"), 5).unwrap();
        let job = q.dequeue().unwrap().unwrap();
        q.fail(&job.id, &JobError::Transient(anyhow::anyhow!("x"))).unwrap();
        assert!(q.dequeue().unwrap().is_none());
        let s = q.stats();
        assert_eq!((s.pending, s.delayed), (1, 1));

        assert_eq!(policy.backoff(1), Duration::from_secs(60));
        assert_eq!(policy.backoff(2), Duration::from_secs(120));
        assert_eq!(policy.backoff(30), Duration::from_secs(600));
    }

    #[test]
    fn complete_notifies() {
        let q = JobQueue::in_memory();
        let rx = q.subscribe();
        let id = q.enqueue(scan("a"), 5).unwrap();
        let job = q.dequeue().unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        q.complete(&job.id, serde_json::json!({"ok": true})).unwrap();
        let done = q.get_job(&id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(
            rx.try_recv().unwrap(),
            JobEvent::Completed {
                id,
                result: serde_json::json!({"ok": true})
            }
        );
        // Terminal jobs cannot transition again.
        assert!(matches!(
            q.complete(&job.id, serde_json::Value::Null),
            Err(QueueError::InvalidState { .. })
        ));
    }

    #[test]
    fn cancel_pending_and_processing() {
        let q = JobQueue::in_memory();
        let a = q.enqueue(scan("a"), 9).unwrap();
        let b = q.enqueue(scan("b"), 1).unwrap();
        let running = q.dequeue().unwrap().unwrap();
        assert_eq!(running.id, a);

        assert!(q.cancel_job(&b).unwrap());
        assert_eq!(q.get_job(&b).unwrap().status, JobStatus::Cancelled);
        assert!(q.dequeue().unwrap().is_none());

        assert!(q.cancel_job(&a).unwrap());
        assert!(q.is_cancelled(&a));
        q.fail(&a, &JobError::Cancelled).unwrap();
        assert_eq!(q.get_job(&a).unwrap().status, JobStatus::Cancelled);
        assert!(!q.is_cancelled(&a));
        assert!(!q.cancel_job(&a).unwrap());
        assert!(!q.cancel_job("missing").unwrap());
    }

    #[test]
    fn recovery_after_restart() {
        let dir = std::env::temp_dir().join(format!("sandfuzz-queue-{}", uuid::Uuid::new_v4()));
        let a;
        let b;
        let c;
        {
            let q = JobQueue::open(
                Box::new(FileStore::open(dir.clone()).unwrap()),
                fast_policy(),
            )
            .unwrap();
            a = q.enqueue(scan("a"), 5).unwrap();
            b = q.enqueue(scan("b"), 5).unwrap();
            c = q.enqueue(scan("c"), 5).unwrap();
            let job = q.dequeue().unwrap().unwrap();
            assert_eq!(job.id, a);
            let job = q.dequeue().unwrap().unwrap();
            q.complete(&job.id, serde_json::json!(1)).unwrap();
        }
        let q = JobQueue::open(Box::new(FileStore::open(dir.clone()).unwrap()), fast_policy())
            .unwrap();
        assert_eq!(q.get_job(&b).unwrap().status, JobStatus::Completed);
        let first = q.dequeue().unwrap().unwrap();
        assert_eq!(first.id, a);
        assert_eq!(first.attempts, 0);
        assert_eq!(q.dequeue().unwrap().unwrap().id, c);
        // New jobs keep FIFO order after recovered ones.
        let d = q.enqueue(scan("d"), 5).unwrap();
        assert!(q.get_job(&d).unwrap().seq > q.get_job(&c).unwrap().seq);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn job_round_trip() {
        let store = MemoryStore::new();
        let q = JobQueue::in_memory();
        let id = q.enqueue(scan("a"), 3).unwrap();
        let job = q.dequeue().unwrap().unwrap();
        store.save(&job).unwrap();
        let back = store.load_all().unwrap();
        assert_eq!(back, vec![job]);
        assert_eq!(back[0].id, id);
    }

    #[test]
    fn fuzz_job_survives_file_store() {
        let dir = std::env::temp_dir().join(format!("sandfuzz-store-{}", uuid::Uuid::new_v4()));
        let store = FileStore::open(dir.clone()).unwrap();
        let q = JobQueue::in_memory();
        let fuzz = FuzzJob::new(
            "t1",
            "print(eval(input()))",
            "python",
            vec!["admin".into(), "guest".into()],
            crate::fuzz::FuzzOptions {
                track_coverage: true,
                minimize_budget: 50,
                ..crate::fuzz::FuzzOptions::default()
            },
        )
        .unwrap();
        let id = q.enqueue(JobPayload::Fuzz(fuzz), 8).unwrap();
        let job = q.dequeue().unwrap().unwrap();
        store.save(&job).unwrap();
        std::fs::write(dir.join("broken.json"), b"{\"id\": 42").unwrap();

        let back = store.load_all().unwrap();
        assert_eq!(back, vec![job]);
        assert_eq!(back[0].id, id);
        assert!(!dir.join("broken.json").exists());
        assert!(store.quarantine_dir().join("broken.json").exists());
        // Quarantined records stay out on the next load.
        assert_eq!(store.load_all().unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn exclusive_dequeue() {
        let q = Arc::new(JobQueue::in_memory());
        for i in 0..100 {
            q.enqueue(scan(&i.to_string()), 5).unwrap();
        }
        let handles = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(j) = q.dequeue().unwrap() {
                        got.push(j.id);
                    }
                    got
                })
            })
            .collect::<Vec<_>>();
        let mut all = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect::<Vec<_>>();
        all.sort();
        let n = all.len();
        all.dedup();
        assert_eq!(n, 100);
        assert_eq!(all.len(), 100);
    }
}
