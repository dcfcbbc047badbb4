//! Sandfuzz: sandboxed fuzzing execution engine.

#[macro_use]
pub mod worker_log;
pub mod config;
pub mod corpus;
pub mod crash;
pub mod exec;
pub mod fuzz;
pub mod import;
pub mod monitor;
pub mod mutation;
pub mod queue;
pub mod utils;
pub mod worker;

use crate::{
    config::Config,
    crash::CrashTable,
    fuzz::{stats::Stats, FuzzEngine, FuzzJob},
    monitor::{JobControl, Monitor, MonitorServer},
    queue::{FileStore, Job, JobPayload, JobQueue, MemoryStore, QueueError, QueueStats},
    utils::StopToken,
    worker::{PoolStats, WorkerPool},
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    fs::create_dir_all,
    os::raw::c_int,
    sync::Arc,
    thread::{self, sleep},
    time::Duration,
};

/// Job submission stats: queue counters plus pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    #[serde(flatten)]
    pub queue: QueueStats,
    pub workers: usize,
    pub active: usize,
    pub max_concurrent: usize,
}

/// Queue, crash table, monitor and worker pool wired together.
///
/// Created with [`Engine::open`], started with [`Engine::start`] and torn down
/// with [`Engine::shutdown`].
pub struct Engine {
    config: Config,
    queue: Arc<JobQueue>,
    crashes: Arc<CrashTable>,
    monitor: Monitor,
    stats: Arc<Stats>,
    stop: StopToken,
    pool: Option<WorkerPool>,
    server: Option<MonitorServer>,
}

impl Engine {
    /// Checks `config` and opens persistent state, nothing runs yet.
    pub fn open(config: Config) -> anyhow::Result<Self> {
        config.check().context("config error")?;

        if let Some(dir) = config.state_dir.as_ref() {
            create_dir_all(dir)
                .with_context(|| format!("failed to create state dir {}", dir.display()))?;
        }
        let queue = match config.jobs_dir() {
            Some(dir) => {
                let store = FileStore::open(dir).context("failed to open job store")?;
                JobQueue::open(Box::new(store), config.retry_policy())
                    .context("failed to recover job queue")?
            }
            None => JobQueue::open(Box::new(MemoryStore::new()), config.retry_policy())?,
        };
        let crashes = match config.crash_table() {
            Some(path) => CrashTable::open(path).context("failed to load crash table")?,
            None => CrashTable::in_memory(),
        };
        if !crashes.is_empty() {
            log::info!(
                "crash clusters loaded: {} ({} crashes)",
                crashes.len(),
                crashes.total_crashes()
            );
        }
        let s = queue.stats();
        if s.pending != 0 {
            log::info!("pending jobs: {} ({} delayed)", s.pending, s.delayed);
        }

        let queue = Arc::new(queue);
        let control: Arc<dyn JobControl> = queue.clone();
        Ok(Self {
            config,
            monitor: Monitor::new().with_control(control),
            queue,
            crashes: Arc::new(crashes),
            stats: Arc::new(Stats::new()),
            stop: StopToken::new(),
            pool: None,
            server: None,
        })
    }

    /// Starts the monitor transport, the stats reporter and the worker pool.
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.pool.is_some() {
            anyhow::bail!("engine already started");
        }
        if let Some(addr) = self.config.monitor_addr.as_ref() {
            let server = MonitorServer::spawn(self.monitor.clone(), addr, self.config.monitor_tick)
                .context("failed to start monitor")?;
            self.server = Some(server);
        }

        let engine = FuzzEngine::new(
            Arc::new(self.config.sandbox_backend()),
            Arc::clone(&self.crashes),
            Arc::clone(&self.stats),
            self.config.engine_settings(),
        )
        .with_monitor(self.monitor.clone());
        let pool = WorkerPool::start(
            Arc::clone(&self.queue),
            Arc::new(engine),
            self.config.workers,
            self.config.poll_interval,
            self.stop.clone(),
        );

        let stats = Arc::clone(&self.stats);
        let gauge = pool.gauge();
        let stop = self.stop.clone();
        let period = self.config.stats_period;
        thread::Builder::new()
            .name("sandfuzz-stats".into())
            .spawn(move || stats.report(period, &stop, || gauge.stats().active))
            .context("failed to spawn stats reporter")?;
        self.pool = Some(pool);
        Ok(())
    }

    pub fn enqueue(&self, payload: JobPayload, priority: u8) -> Result<String, QueueError> {
        self.queue.enqueue(payload, priority)
    }

    /// Submits a fuzz job at the priority named in its options.
    pub fn submit(&self, job: FuzzJob) -> Result<String, QueueError> {
        self.queue.submit(job)
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.queue.get_job(id)
    }

    pub fn cancel_job(&self, id: &str) -> Result<bool, QueueError> {
        self.queue.cancel_job(id)
    }

    pub fn stats(&self) -> EngineStats {
        let pool = self
            .pool
            .as_ref()
            .map(|p| p.stats())
            .unwrap_or(PoolStats {
                max_concurrent: self.config.workers,
                ..PoolStats::default()
            });
        EngineStats {
            queue: self.queue.stats(),
            workers: pool.workers,
            active: pool.active,
            max_concurrent: pool.max_concurrent,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn crashes(&self) -> &Arc<CrashTable> {
        &self.crashes
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Stops workers after their current iteration, then the monitor, then saves crashes.
    pub fn shutdown(mut self) -> anyhow::Result<()> {
        self.stop.stop_req();
        if let Some(pool) = self.pool.take() {
            pool.join();
        }
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
        self.crashes.save().context("failed to save crash table")?;
        log::info!("all done");
        Ok(())
    }
}

/// Runs the engine until a termination signal arrives.
pub fn serve(config: Config) -> anyhow::Result<()> {
    let mut engine = Engine::open(config)?;
    setup_signal_handler(engine.stop_token()).context("failed to install signal handler")?;
    engine.start()?;
    let stop = engine.stop_token();
    while !stop.stop_soon() {
        sleep(Duration::from_millis(200));
    }
    log::info!("waiting for workers to exit...");
    engine.shutdown()
}

pub fn setup_signal_handler(stop: StopToken) -> anyhow::Result<()> {
    use signal_hook::consts::*;
    use signal_hook::iterator::exfiltrator::WithOrigin;
    use signal_hook::iterator::SignalsInfo;

    fn named_signal(sig: c_int) -> String {
        signal_hook::low_level::signal_name(sig)
            .map(|n| format!("{}({})", n, sig))
            .unwrap_or_else(|| sig.to_string())
    }

    let mut signals = SignalsInfo::<WithOrigin>::new(TERM_SIGNALS)?;
    thread::Builder::new()
        .name("sandfuzz-signal".into())
        .spawn(move || {
            if let Some(info) = signals.forever().next() {
                let from = if let Some(p) = info.process {
                    format!("(pid: {}, uid: {})", p.pid, p.uid)
                } else {
                    "unknown".to_string()
                };
                log::info!(
                    "{} recved, from: {}, cause: {:?}",
                    named_signal(info.signal),
                    from,
                    info.cause
                );
                stop.stop_req();
            }
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;

    fn local() -> Config {
        Config {
            backend: BackendKind::Process,
            monitor_addr: None,
            workers: 2,
            ..Config::default()
        }
    }

    #[test]
    fn stats_before_start() {
        let engine = Engine::open(local()).unwrap();
        let s = engine.stats();
        assert_eq!(s.workers, 0);
        assert_eq!(s.max_concurrent, 2);
        assert_eq!(s.queue.pending, 0);
    }

    #[test]
    fn submit_and_cancel() {
        let engine = Engine::open(local()).unwrap();
        let job = FuzzJob::new(
            "t",
            "echo hi",
            "shell",
            vec!["a".into()],
            fuzz::FuzzOptions {
                priority: 7,
                ..fuzz::FuzzOptions::default()
            },
        )
        .unwrap();
        let id = engine.submit(job).unwrap();
        let queued = engine.get_job(&id).unwrap();
        assert_eq!(queued.priority, 7);
        assert!(engine.cancel_job(&id).unwrap());
        assert!(!engine.cancel_job(&id).unwrap());
        assert_eq!(engine.stats().queue.cancelled, 1);
        engine.shutdown().unwrap();
    }

    #[test]
    fn monitor_clients_reach_the_queue() {
        let engine = Engine::open(local()).unwrap();
        let mut conn = engine.monitor().connect();
        let job = FuzzJob::new("t", "cat", "shell", vec![], fuzz::FuzzOptions::default()).unwrap();
        conn.handle(monitor::ClientMessage::Submit { job });
        let reply = conn.try_recv().unwrap();
        assert_eq!(reply.kind, monitor::MessageKind::Job);
        let id = reply.data["jobId"].as_str().unwrap().to_string();
        assert_eq!(engine.get_job(&id).unwrap().status, queue::JobStatus::Pending);

        conn.handle(monitor::ClientMessage::Cancel { job_id: id.clone() });
        assert_eq!(conn.try_recv().unwrap().data["cancelled"], true);
        assert_eq!(engine.stats().queue.cancelled, 1);
        drop(conn);
        engine.shutdown().unwrap();
    }

    #[test]
    fn stats_serialize_flat() {
        let s = EngineStats {
            workers: 4,
            max_concurrent: 4,
            ..EngineStats::default()
        };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["pending"], 0);
        assert_eq!(v["maxConcurrent"], 4);
    }

    #[test]
    fn state_survives_restart() {
        let dir = std::env::temp_dir().join(format!("sandfuzz-engine-{}", uuid::Uuid::new_v4()));
        let config = Config {
            state_dir: Some(dir.clone()),
            ..local()
        };
        let engine = Engine::open(config.clone()).unwrap();
        let job = FuzzJob::new("t", "cat", "sh", vec![], fuzz::FuzzOptions::default()).unwrap();
        let id = engine.submit(job).unwrap();
        engine.shutdown().unwrap();

        let engine = Engine::open(config).unwrap();
        assert_eq!(engine.get_job(&id).unwrap().status, queue::JobStatus::Pending);
        engine.shutdown().unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
