//! Bounded pool of OS worker threads consuming the job queue.

use crate::{
    queue::{Job, JobError, JobQueue},
    utils::StopToken,
    worker_log::set_worker_id,
};
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, sleep, JoinHandle},
    time::Duration,
};

/// Processes one dequeued job.
pub trait JobHandler: Send + Sync {
    fn handle(&self, job: &Job, ctx: &JobContext) -> Result<serde_json::Value, JobError>;
}

/// What a handler can observe and report while owning a job.
pub struct JobContext {
    job_id: String,
    queue: Option<Arc<JobQueue>>,
    stop: StopToken,
}

impl JobContext {
    pub fn new(job_id: String, queue: Arc<JobQueue>, stop: StopToken) -> Self {
        Self {
            job_id,
            queue: Some(queue),
            stop,
        }
    }

    /// Context of work that runs outside any queue, e.g. batch fuzzing.
    pub fn detached(job_id: String, stop: StopToken) -> Self {
        Self {
            job_id,
            queue: None,
            stop,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Whether the submitter asked to cancel this job.
    pub fn cancelled(&self) -> bool {
        self.queue
            .as_ref()
            .map_or(false, |q| q.is_cancelled(&self.job_id))
    }

    /// Whether the whole process is shutting down.
    pub fn stop_soon(&self) -> bool {
        self.stop.stop_soon()
    }

    pub fn progress(&self, data: serde_json::Value) {
        if let Some(q) = self.queue.as_ref() {
            q.report_progress(&self.job_id, data);
        }
    }
}

#[derive(Debug, Default)]
struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub workers: usize,
    /// Jobs in flight right now.
    pub active: usize,
    /// Hard cap on jobs in flight.
    pub max_concurrent: usize,
    /// Highest number of jobs ever in flight at once.
    pub peak: usize,
}

/// Read-only view of the pool counters, shareable with reporters.
#[derive(Debug, Clone)]
pub struct PoolGauge {
    workers: usize,
    gauge: Arc<Gauge>,
}

impl PoolGauge {
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers,
            active: self.gauge.active.load(Ordering::SeqCst),
            max_concurrent: self.workers,
            peak: self.gauge.peak.load(Ordering::SeqCst),
        }
    }
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stop: StopToken,
    gauge: PoolGauge,
}

impl WorkerPool {
    /// Spawns `workers` threads. Each owns at most one job at a time, so at most
    /// `workers` jobs are ever in flight. Idle workers sleep `poll` between dequeues.
    pub fn start(
        queue: Arc<JobQueue>,
        handler: Arc<dyn JobHandler>,
        workers: usize,
        poll: Duration,
        stop: StopToken,
    ) -> Self {
        let workers = workers.max(1);
        let gauge = Arc::new(Gauge::default());
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            let gauge = Arc::clone(&gauge);
            let stop = stop.clone();
            let h = thread::Builder::new()
                .name(format!("sandfuzz-worker-{}", id))
                .spawn(move || work_loop(id, queue, handler, gauge, poll, stop));
            match h {
                Ok(h) => handles.push(h),
                Err(e) => log::warn!("failed to spawn worker-{}: {}", id, e),
            }
        }
        log::info!("worker pool started: {} workers", handles.len());
        Self {
            gauge: PoolGauge {
                workers: handles.len(),
                gauge,
            },
            handles,
            stop,
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.gauge.stats()
    }

    pub fn gauge(&self) -> PoolGauge {
        self.gauge.clone()
    }

    /// Requests stop and waits for workers to finish their current iteration.
    pub fn shutdown(self) {
        self.stop.stop_req();
        self.join();
    }

    pub fn join(self) {
        for (i, h) in self.handles.into_iter().enumerate() {
            if h.join().is_err() {
                log::warn!("worker-{} exited abnormally", i);
            }
        }
    }
}

fn work_loop(
    id: usize,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    gauge: Arc<Gauge>,
    poll: Duration,
    stop: StopToken,
) {
    set_worker_id(id);
    worker_debug!("started");
    while !stop.stop_soon() {
        let job = match queue.dequeue() {
            Ok(Some(job)) => job,
            Ok(None) => {
                sleep(poll);
                continue;
            }
            Err(e) => {
                worker_warn!("dequeue failed: {}", e);
                sleep(poll);
                continue;
            }
        };
        worker_info!("processing {} job {} (attempt {})", job.payload.kind(), job.id, job.attempts + 1);

        let ctx = JobContext::new(job.id.clone(), Arc::clone(&queue), stop.clone());
        gauge.enter();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&job, &ctx)));
        gauge.leave();
        let outcome = outcome.unwrap_or_else(|p| {
            Err(JobError::Fatal(format!(
                "handler panicked: {}",
                panic_message(p.as_ref())
            )))
        });
        finish(&queue, &job, outcome, &stop);
    }
    worker_debug!("exited");
}

fn finish(queue: &JobQueue, job: &Job, outcome: Result<serde_json::Value, JobError>, stop: &StopToken) {
    let ret = match outcome {
        Ok(v) => {
            worker_info!("job {} completed", job.id);
            queue.complete(&job.id, v)
        }
        Err(e) if stop.stop_soon() && !matches!(e, JobError::Cancelled) => {
            // Left processing, the next open of a durable queue returns it to pending.
            worker_info!("job {} interrupted by shutdown: {}", job.id, e);
            Ok(())
        }
        Err(e) => {
            worker_warn!("job {} failed: {}", job.id, e);
            queue.fail(&job.id, &e).map(|_| ())
        }
    };
    if let Err(e) = ret {
        worker_warn!("failed to record outcome of job {}: {}", job.id, e);
    }
}

fn panic_message(p: &(dyn Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
