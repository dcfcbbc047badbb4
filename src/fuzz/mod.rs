//! Per-job fuzz loop, batch fuzzing and crash minimization.

use crate::{
    corpus::{Corpus, Seed, SeedSource},
    crash::{
        fingerprint, minimize::minimize, ClusterUpdate, Crash, CrashTable, MinimizationRecord,
        Severity,
    },
    exec::{ExecOptions, ExecutionResult, Language, Sandbox, SandboxProvider},
    monitor::{MetricsUpdate, Monitor},
    mutation::{mutate_with_strategy, RngType},
    queue::{Job, JobError, JobPayload, ReportJob, ValidationError, MAX_PRIORITY, MIN_PRIORITY},
    utils::StopToken,
    worker::{JobContext, JobHandler},
};
use anyhow::anyhow;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::{Duration, Instant},
};

pub mod feedback;
pub mod stats;

use feedback::Feedback;
use stats::Stats;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzOptions {
    /// Wall clock budget of the whole job.
    pub timeout_ms: u64,
    pub max_iterations: u64,
    pub priority: u8,
    pub track_coverage: bool,
    /// Candidate executions spent minimizing each new crash cluster, 0 disables.
    pub minimize_budget: u64,
    /// Per-execution limits.
    pub exec: ExecOptions,
}

impl Default for FuzzOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            max_iterations: 1000,
            priority: 5,
            track_coverage: false,
            minimize_budget: 0,
            exec: ExecOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuzzJob {
    pub target_id: String,
    pub code: String,
    pub language: Language,
    /// Seed corpus, in submission order.
    #[serde(default)]
    pub seeds: Vec<String>,
    #[serde(default)]
    pub options: FuzzOptions,
}

impl FuzzJob {
    pub fn new(
        target_id: &str,
        code: &str,
        language: &str,
        seeds: Vec<String>,
        options: FuzzOptions,
    ) -> Result<Self, ValidationError> {
        let job = Self {
            target_id: target_id.to_string(),
            code: code.to_string(),
            language: language.parse()?,
            seeds,
            options,
        };
        job.validate()?;
        Ok(job)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.target_id.trim().is_empty() {
            return Err(ValidationError::Empty("target id"));
        }
        if self.code.trim().is_empty() {
            return Err(ValidationError::Empty("code"));
        }
        if self.options.max_iterations == 0 {
            return Err(ValidationError::ZeroIterations);
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.options.priority) {
            return Err(ValidationError::Priority(self.options.priority));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxIterations,
    TimeBudget,
}

/// A crash cluster hit by one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHit {
    pub hash: String,
    pub signal: String,
    pub severity: Severity,
    /// Crashes of this job in the cluster.
    pub hits: u64,
    /// Cluster count over all jobs.
    pub total: u64,
    /// First seen by this job.
    pub new: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuzzReport {
    pub target_id: String,
    pub iterations: u64,
    pub executions: u64,
    pub total_crashes: u64,
    pub crashes: Vec<ClusterHit>,
    pub coverage: u64,
    pub corpus_size: usize,
    pub golden_seeds: usize,
    pub infra_failures: u64,
    pub elapsed_ms: u64,
    pub stop_reason: StopReason,
}

/// One crashing input of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCrash {
    pub input: String,
    pub hash: String,
    pub signal: String,
    pub result: ExecutionResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub crashes: Vec<BatchCrash>,
    pub total_executions: u64,
    /// Share of executions that did not crash.
    pub success_rate: f64,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Iterations between progress reports.
    pub progress_every: u64,
    pub corpus_cap: usize,
    /// Consecutive infrastructure failures that abort an attempt.
    pub max_infra_failures: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            progress_every: 100,
            corpus_cap: 256,
            max_infra_failures: 10,
        }
    }
}

pub struct FuzzEngine {
    provider: Arc<dyn SandboxProvider>,
    crashes: Arc<CrashTable>,
    stats: Arc<Stats>,
    monitor: Option<Monitor>,
    settings: EngineSettings,
}

impl FuzzEngine {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        crashes: Arc<CrashTable>,
        stats: Arc<Stats>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            provider,
            crashes,
            stats,
            monitor: None,
            settings,
        }
    }

    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn crashes(&self) -> &Arc<CrashTable> {
        &self.crashes
    }

    /// Runs `code` once on `input`, never fails.
    pub fn execute(
        &self,
        code: &str,
        language: Language,
        input: &[u8],
        opts: &ExecOptions,
    ) -> ExecutionResult {
        self.provider.sandbox(language).execute(code, input, opts)
    }

    /// Runs every input once, without queue or mutation.
    pub fn fuzz<T: AsRef<[u8]>>(
        &self,
        code: &str,
        language: Language,
        inputs: &[T],
        opts: &ExecOptions,
    ) -> BatchReport {
        let sandbox = self.provider.sandbox(language);
        let mut crashes = Vec::new();
        for input in inputs {
            let input: &[u8] = input.as_ref();
            let r = sandbox.execute(code, input, opts);
            self.stats.inc_exec_total();
            if !r.crashed {
                continue;
            }
            self.stats.inc_crashes();
            let crash = Crash::from_result(input, &r, BTreeSet::new());
            let signal = crash.signal.clone();
            let hash = if r.infra_failure {
                String::new()
            } else {
                self.crashes.record(fingerprint(&crash), crash).hash().to_string()
            };
            crashes.push(BatchCrash {
                input: String::from_utf8_lossy(input).into_owned(),
                hash,
                signal,
                result: r,
            });
        }
        self.stats.set_unique_crash(self.crashes.len() as u64);

        let total = inputs.len() as u64;
        let success_rate = if total == 0 {
            1.0
        } else {
            (total - crashes.len() as u64) as f64 / total as f64
        };
        BatchReport {
            crashes,
            total_executions: total,
            success_rate,
        }
    }

    /// Fuzzes `job` until its iteration or time budget runs out.
    ///
    /// `session` names the job on the monitor. A cancel request or shutdown is
    /// observed between iterations.
    pub fn run(&self, session: &str, job: &FuzzJob, ctx: &JobContext) -> Result<FuzzReport, JobError> {
        let sandbox = self.provider.sandbox(job.language);
        let mut opts = job.options.exec.clone();
        opts.collect_coverage |= job.options.track_coverage;
        let seeds = if job.seeds.is_empty() {
            vec![Vec::new()]
        } else {
            job.seeds.iter().map(|s| s.as_bytes().to_vec()).collect()
        };
        let mut state = JobState::new(
            self,
            session,
            Corpus::with_inputs(seeds, self.settings.corpus_cap),
        );

        worker_info!(
            "fuzzing {} ({}), {} seeds, {} iterations",
            job.target_id,
            job.language,
            state.corpus.len(),
            job.options.max_iterations
        );
        self.stats.inc_fuzzing();
        if let Some(m) = self.monitor.as_ref() {
            m.notify_event(session, json!({"status": "started", "targetId": job.target_id}));
        }
        let ret = self.fuzz_loop(&mut state, &*sandbox, job, &opts, ctx);
        self.stats.dec_fuzzing();
        self.stats.sub_corpus_size(state.reported_corpus as u64);

        if let Some(m) = self.monitor.as_ref() {
            m.update_metrics(session, &state.metrics());
            let status = match &ret {
                Ok(_) => "completed".to_string(),
                Err(e) => format!("stopped: {}", e),
            };
            m.notify_event(session, json!({"status": status, "crashes": state.total_crashes}));
            m.end_session(session);
        }

        if let Ok(report) = ret.as_ref() {
            if job.options.minimize_budget != 0 {
                for hit in report.crashes.iter().filter(|h| h.new) {
                    let budget = job.options.minimize_budget;
                    let ret = self.minimize_cluster(&hit.hash, &job.code, job.language, &opts, budget);
                    if let Err(e) = ret {
                        worker_warn!("minimizing {} failed: {}", hit.hash, e);
                    }
                }
            }
        }
        if let Err(e) = self.crashes.save() {
            worker_warn!("failed to save crash table: {}", e);
        }
        ret
    }

    fn fuzz_loop(
        &self,
        state: &mut JobState<'_>,
        sandbox: &dyn Sandbox,
        job: &FuzzJob,
        opts: &ExecOptions,
        ctx: &JobContext,
    ) -> Result<FuzzReport, JobError> {
        let budget = Duration::from_millis(job.options.timeout_ms);
        let mut rng = RngType::from_entropy();

        // Unmutated seeds first, later coverage is judged against theirs.
        if opts.collect_coverage {
            let seeds = state
                .corpus
                .seeds()
                .iter()
                .map(|s| (s.id.clone(), s.content.clone()))
                .collect::<Vec<_>>();
            for (id, content) in seeds {
                check_interrupt(ctx)?;
                let r = sandbox.execute(&job.code, &content, opts);
                state.observe(&content, &id, &r)?;
            }
            worker_debug!("baseline coverage: {}", state.feedback.len());
        }

        let mut stop_reason = StopReason::MaxIterations;
        let mut iterations = 0;
        while iterations < job.options.max_iterations {
            check_interrupt(ctx)?;
            if state.started.elapsed() >= budget {
                stop_reason = StopReason::TimeBudget;
                break;
            }

            let (seed_id, content) = match state.corpus.select(&mut rng) {
                Some(s) => (s.id.clone(), s.content.clone()),
                None => break,
            };
            let (strategy, input) = mutate_with_strategy(&content, iterations);
            let r = sandbox.execute(&job.code, &input, opts);
            if r.crashed {
                worker_debug!("iteration {} ({}) crashed: exit {}", iterations, strategy, r.exit_code);
            }
            state.observe(&input, &seed_id, &r)?;
            iterations += 1;

            if iterations % self.settings.progress_every.max(1) == 0 {
                ctx.progress(state.progress(iterations, job.options.max_iterations));
                if let Some(m) = self.monitor.as_ref() {
                    m.update_metrics(&state.session, &state.metrics());
                }
            }
        }

        Ok(state.report(job, iterations, stop_reason))
    }

    /// Shrinks the representative input of cluster `hash` while the crash keeps
    /// the same stack and signal, then stores it as the new representative.
    ///
    /// Returns `None` if the representative no longer reproduces.
    pub fn minimize_cluster(
        &self,
        hash: &str,
        code: &str,
        language: Language,
        opts: &ExecOptions,
        budget: u64,
    ) -> anyhow::Result<Option<MinimizationRecord>> {
        let cluster = self
            .crashes
            .get(hash)
            .ok_or_else(|| anyhow!("no crash cluster {}", hash))?;
        let sandbox = self.provider.sandbox(language);
        let reproduces = |input: &[u8]| -> Option<Crash> {
            let r = sandbox.execute(code, input, opts);
            if !r.crashed || r.infra_failure {
                return None;
            }
            let crash = Crash::from_result(input, &r, cluster.representative.new_coverage.clone());
            if fingerprint(&crash).same_shape(&cluster.fingerprint) {
                Some(crash)
            } else {
                None
            }
        };

        let original = cluster.representative.input.clone();
        if reproduces(&original).is_none() {
            log::info!("crash {} does not reproduce, not minimized", hash);
            return Ok(None);
        }
        let m = minimize(&original, budget, |c| reproduces(c).is_some());
        // The accepted candidate reproduced when tried, check it once more before keeping it.
        let crash = match reproduces(&m.input) {
            Some(c) => c,
            None => return Ok(None),
        };
        let record = MinimizationRecord::new(original.len(), m.input.len(), m.iterations);
        log::info!(
            "crash {} minimized: {} -> {} bytes in {} runs",
            hash,
            original.len(),
            m.input.len(),
            m.iterations
        );
        self.crashes.attach_minimization(hash, crash, record.clone());
        Ok(Some(record))
    }

    fn report_clusters(&self, job: &ReportJob) -> Result<serde_json::Value, JobError> {
        if !job.format.eq_ignore_ascii_case("json") {
            return Err(JobError::Fatal(format!("unsupported report format: {}", job.format)));
        }
        let mut clusters = Vec::new();
        let mut missing = Vec::new();
        if job.crash_hashes.is_empty() {
            clusters = self.crashes.clusters();
        } else {
            for h in job.crash_hashes.iter() {
                match self.crashes.get(h) {
                    Some(c) => clusters.push(c),
                    None => missing.push(h.clone()),
                }
            }
        }
        clusters.sort_by(|a, b| b.severity.cmp(&a.severity).then(b.count.cmp(&a.count)));
        Ok(json!({
            "targetId": job.target_id,
            "clusters": clusters,
            "missing": missing,
        }))
    }
}

fn check_interrupt(ctx: &JobContext) -> Result<(), JobError> {
    if ctx.cancelled() {
        return Err(JobError::Cancelled);
    }
    if ctx.stop_soon() {
        return Err(JobError::Transient(anyhow!("interrupted by shutdown")));
    }
    Ok(())
}

/// Mutable state of one job, owned by the worker running it.
struct JobState<'a> {
    engine: &'a FuzzEngine,
    session: String,
    corpus: Corpus,
    feedback: Feedback,
    /// Cluster hash to (hits, new).
    hits: BTreeMap<String, (u64, bool)>,
    executions: u64,
    total_crashes: u64,
    infra_failures: u64,
    consecutive_infra: u32,
    peak_memory: u64,
    reported_corpus: usize,
    started: Instant,
}

impl<'a> JobState<'a> {
    fn new(engine: &'a FuzzEngine, session: &str, corpus: Corpus) -> Self {
        engine.stats.add_corpus_size(corpus.len() as u64);
        Self {
            engine,
            session: session.to_string(),
            reported_corpus: corpus.len(),
            corpus,
            feedback: Feedback::new(),
            hits: BTreeMap::new(),
            executions: 0,
            total_crashes: 0,
            infra_failures: 0,
            consecutive_infra: 0,
            peak_memory: 0,
            started: Instant::now(),
        }
    }

    /// Folds one execution of `input`, derived from seed `seed_id`, into the job.
    fn observe(&mut self, input: &[u8], seed_id: &str, r: &ExecutionResult) -> Result<(), JobError> {
        let engine = self.engine;
        let stats = &engine.stats;
        self.executions += 1;
        stats.inc_exec_total();
        if r.infra_failure {
            self.infra_failures += 1;
            self.consecutive_infra += 1;
            stats.inc_infra_failures();
            if self.consecutive_infra >= engine.settings.max_infra_failures {
                return Err(JobError::Transient(anyhow!(
                    "sandbox unavailable after {} consecutive infrastructure failures: {}",
                    self.consecutive_infra,
                    r.error.as_deref().unwrap_or("unknown error")
                )));
            }
            return Ok(());
        }
        self.consecutive_infra = 0;
        self.peak_memory = self.peak_memory.max(r.memory_used_bytes);

        let new_cov = match r.coverage.as_ref() {
            Some(c) => self.feedback.check_new(c.iter().copied()),
            None => BTreeSet::new(),
        };
        if !new_cov.is_empty() {
            let seed = Seed::new(input.to_vec(), SeedSource::Mutated, Some(seed_id.to_string()));
            if let Some(id) = self.corpus.add(seed) {
                worker_debug!("seed {} from {}: {} new locations", id, seed_id, new_cov.len());
            }
            stats.set_max_cov(self.feedback.len() as u64);
            if let Some(m) = engine.monitor.as_ref() {
                m.notify_coverage_increase(
                    &self.session,
                    json!({
                        "newLocations": new_cov.len(),
                        "coverage": self.feedback.len(),
                        "parentId": seed_id,
                    }),
                );
            }
        }
        self.corpus
            .record_execution(seed_id, new_cov.len() as u64, r.crashed);
        self.sync_corpus_size();

        if r.crashed {
            self.record_crash(input, r, new_cov);
        }
        Ok(())
    }

    fn record_crash(&mut self, input: &[u8], r: &ExecutionResult, new_cov: BTreeSet<u32>) {
        let engine = self.engine;
        let crash = Crash::from_result(input, r, new_cov);
        let update = engine.crashes.record(fingerprint(&crash), crash);
        self.total_crashes += 1;
        engine.stats.inc_crashes();

        let hit = self
            .hits
            .entry(update.hash().to_string())
            .or_insert((0, false));
        hit.0 += 1;
        if let ClusterUpdate::New(c) = update {
            hit.1 = true;
            engine.stats.set_unique_crash(engine.crashes.len() as u64);
            worker_info!(
                "new crash {}: {} ({:?})",
                &c.fingerprint.hash[..12],
                c.fingerprint.signal,
                c.severity
            );
            if let Some(m) = engine.monitor.as_ref() {
                m.notify_crash(
                    &self.session,
                    json!({
                        "hash": c.fingerprint.hash,
                        "signal": c.fingerprint.signal,
                        "severity": c.severity,
                        "exploitability": c.exploitability,
                        "input": String::from_utf8_lossy(input),
                    }),
                );
            }
        }
    }

    fn sync_corpus_size(&mut self) {
        let stats = &self.engine.stats;
        let len = self.corpus.len();
        if len > self.reported_corpus {
            stats.add_corpus_size((len - self.reported_corpus) as u64);
        } else {
            stats.sub_corpus_size((self.reported_corpus - len) as u64);
        }
        self.reported_corpus = len;
    }

    fn exec_per_sec(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.executions as f64 / secs
        } else {
            0.0
        }
    }

    fn metrics(&self) -> MetricsUpdate {
        MetricsUpdate {
            exec_per_sec: Some(self.exec_per_sec()),
            coverage: Some(self.feedback.len() as u64),
            crashes: Some(self.total_crashes),
            corpus_size: Some(self.corpus.len() as u64),
            active_workers: Some(self.engine.stats.snapshot().fuzzing),
            memory_usage: Some(self.peak_memory),
        }
    }

    fn progress(&self, iterations: u64, max_iterations: u64) -> serde_json::Value {
        json!({
            "iterations": iterations,
            "maxIterations": max_iterations,
            "executions": self.executions,
            "crashes": self.total_crashes,
            "uniqueCrashes": self.hits.len(),
            "coverage": self.feedback.len(),
            "corpusSize": self.corpus.len(),
            "execPerSec": self.exec_per_sec(),
        })
    }

    fn report(&self, job: &FuzzJob, iterations: u64, stop_reason: StopReason) -> FuzzReport {
        let crashes = self
            .hits
            .iter()
            .filter_map(|(hash, &(hits, new))| {
                self.engine.crashes.get(hash).map(|c| ClusterHit {
                    hash: hash.clone(),
                    signal: c.fingerprint.signal,
                    severity: c.severity,
                    hits,
                    total: c.count,
                    new,
                })
            })
            .collect();
        FuzzReport {
            target_id: job.target_id.clone(),
            iterations,
            executions: self.executions,
            total_crashes: self.total_crashes,
            crashes,
            coverage: self.feedback.len() as u64,
            corpus_size: self.corpus.len(),
            golden_seeds: self.corpus.golden().count(),
            infra_failures: self.infra_failures,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            stop_reason,
        }
    }
}

impl JobHandler for FuzzEngine {
    fn handle(&self, job: &Job, ctx: &JobContext) -> Result<serde_json::Value, JobError> {
        match &job.payload {
            JobPayload::Fuzz(f) => {
                let report = self.run(&job.id, f, ctx)?;
                to_json(&report)
            }
            JobPayload::Analysis(a) => {
                let r = self.execute(&a.code, a.language, &[], &ExecOptions::default());
                if r.infra_failure {
                    return Err(JobError::Transient(anyhow!(
                        "{}",
                        r.error.unwrap_or_default()
                    )));
                }
                to_json(&r)
            }
            JobPayload::Report(r) => self.report_clusters(r),
            JobPayload::Scan(_) => Err(JobError::Fatal(
                "scan jobs are served by the external scanner".to_string(),
            )),
        }
    }
}

fn to_json<T: Serialize>(v: &T) -> Result<serde_json::Value, JobError> {
    serde_json::to_value(v).map_err(|e| JobError::Fatal(e.to_string()))
}

/// Runs a detached fuzz job, for callers outside the queue.
pub fn run_detached(engine: &FuzzEngine, job: &FuzzJob, stop: StopToken) -> Result<FuzzReport, JobError> {
    let id = uuid::Uuid::new_v4().to_string();
    let ctx = JobContext::detached(id.clone(), stop);
    engine.run(&id, job, &ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        exec::SandboxError,
        monitor::MessageKind,
        queue::{JobQueue, JobStatus, ScanJob},
        worker::WorkerPool,
    };
    use std::{
        sync::atomic::{AtomicU64, Ordering},
        thread::sleep,
    };

    type Script = dyn Fn(&[u8]) -> Result<ExecutionResult, SandboxError> + Send + Sync;

    struct Scripted {
        script: Box<Script>,
        calls: AtomicU64,
    }

    impl Sandbox for Scripted {
        fn language(&self) -> Language {
            Language::Python
        }

        fn try_execute(
            &self,
            _code: &str,
            input: &[u8],
            _opts: &ExecOptions,
        ) -> Result<ExecutionResult, SandboxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.script)(input)
        }
    }

    struct Provider(Arc<Scripted>);

    impl SandboxProvider for Provider {
        fn sandbox(&self, _language: Language) -> Arc<dyn Sandbox> {
            self.0.clone()
        }
    }

    const TRACEBACK: &str = "Traceback (most recent call last):
  File \"/sandbox/main.py\", line 1, in <module>
    print(eval(input()))
  File \"<string>\", line 1
SyntaxError: invalid syntax";

    /// Behaves like `print(eval(input()))` fed with shell metacharacters.
    fn eval_like(input: &[u8]) -> Result<ExecutionResult, SandboxError> {
        let s = String::from_utf8_lossy(input);
        if s.contains(";rm -rf") {
            return Ok(ExecutionResult {
                crashed: true,
                exit_code: 1,
                error: Some(TRACEBACK.to_string()),
                ..ExecutionResult::default()
            });
        }
        Ok(ExecutionResult {
            output: s.into_owned(),
            ..ExecutionResult::default()
        })
    }

    /// Reports every distinct byte value as a reached location.
    fn byte_coverage(input: &[u8]) -> Result<ExecutionResult, SandboxError> {
        let mut r = eval_like(input)?;
        r.coverage = Some(input.iter().map(|&b| b as u32).collect());
        Ok(r)
    }

    fn engine_with<F>(script: F) -> (FuzzEngine, Arc<Scripted>)
    where
        F: Fn(&[u8]) -> Result<ExecutionResult, SandboxError> + Send + Sync + 'static,
    {
        let sandbox = Arc::new(Scripted {
            script: Box::new(script),
            calls: AtomicU64::new(0),
        });
        let engine = FuzzEngine::new(
            Arc::new(Provider(Arc::clone(&sandbox))),
            Arc::new(CrashTable::in_memory()),
            Arc::new(Stats::new()),
            EngineSettings {
                progress_every: 5,
                ..EngineSettings::default()
            },
        );
        (engine, sandbox)
    }

    fn job(iterations: u64) -> FuzzJob {
        FuzzJob::new(
            "login-form",
            "print(eval(input()))",
            "python",
            vec!["admin".into(), "guest".into()],
            FuzzOptions {
                max_iterations: iterations,
                ..FuzzOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn eval_target_crashes_into_one_cluster() {
        let (engine, sandbox) = engine_with(eval_like);
        let report = run_detached(&engine, &job(10), StopToken::new()).unwrap();

        assert_eq!(report.iterations, 10);
        assert_eq!(report.executions, 10);
        assert_eq!(sandbox.calls.load(Ordering::SeqCst), 10);
        assert_eq!(report.stop_reason, StopReason::MaxIterations);
        assert!(report.total_crashes >= 1);
        assert_eq!(report.crashes.len(), 1);
        let hit = &report.crashes[0];
        assert_eq!(hit.signal, "SyntaxError");
        assert!(hit.new);
        assert_eq!(hit.hits, report.total_crashes);

        assert_eq!(engine.crashes().len(), 1);
        let cluster = engine.crashes().get(&hit.hash).unwrap();
        assert_eq!(cluster.count, report.total_crashes);
        assert!(String::from_utf8_lossy(&cluster.representative.input).contains(";rm -rf"));
    }

    #[test]
    fn coverage_grows_corpus_and_notifies() {
        let (engine, _) = engine_with(byte_coverage);
        let monitor = Monitor::new();
        let engine = engine.with_monitor(monitor.clone());
        let mut conn = monitor.connect();
        conn.handle(crate::monitor::ClientMessage::Subscribe {
            session_id: "s1".into(),
        });

        let mut job = job(20);
        job.options.track_coverage = true;
        let ctx = JobContext::detached("s1".into(), StopToken::new());
        let report = engine.run("s1", &job, &ctx).unwrap();

        // Two baseline runs of the unmutated seeds.
        assert_eq!(report.executions, 22);
        assert!(report.corpus_size > 2);
        let baseline = BTreeSet::from_iter("adminguest".bytes()).len() as u64;
        assert!(report.coverage > baseline);

        let mut kinds = Vec::new();
        while let Some(m) = conn.try_recv() {
            kinds.push(m.kind);
        }
        assert!(kinds.contains(&MessageKind::CoverageIncrease));
        assert!(kinds.contains(&MessageKind::Crash));
        assert_eq!(kinds.first(), Some(&MessageKind::Event));
        assert_eq!(kinds.last(), Some(&MessageKind::Event));
        assert!(monitor.metrics("s1").is_none());
    }

    #[test]
    fn infrastructure_failures_abort_the_attempt() {
        let (engine, sandbox) =
            engine_with(|_| Err(SandboxError::Runtime("daemon not running".into())));
        let err = run_detached(&engine, &job(100), StopToken::new()).unwrap_err();
        match err {
            JobError::Transient(e) => assert!(e.to_string().contains("daemon not running")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sandbox.calls.load(Ordering::SeqCst), 10);
        assert!(engine.crashes().is_empty());
    }

    #[test]
    fn time_budget_stops_the_loop() {
        let (engine, _) = engine_with(|i| {
            sleep(Duration::from_millis(5));
            eval_like(i)
        });
        let mut job = job(1000);
        job.options.timeout_ms = 1;
        let report = run_detached(&engine, &job, StopToken::new()).unwrap();
        assert_eq!(report.stop_reason, StopReason::TimeBudget);
        assert!(report.iterations < 1000);
    }

    #[test]
    fn cancel_and_shutdown_are_observed() {
        let (engine, sandbox) = engine_with(eval_like);
        let q = Arc::new(JobQueue::in_memory());
        let id = q.enqueue(JobPayload::Fuzz(job(10)), 5).unwrap();
        let dequeued = q.dequeue().unwrap().unwrap();
        assert!(q.cancel_job(&id).unwrap());
        let ctx = JobContext::new(id.clone(), Arc::clone(&q), StopToken::new());
        let err = engine.handle(&dequeued, &ctx).unwrap_err();
        assert!(matches!(err, JobError::Cancelled));
        assert_eq!(sandbox.calls.load(Ordering::SeqCst), 0);

        let stop = StopToken::new();
        stop.stop_req();
        let err = run_detached(&engine, &job(10), stop).unwrap_err();
        assert!(matches!(err, JobError::Transient(_)));
    }

    #[test]
    fn batch_fuzz_and_minimize() {
        let (engine, _) = engine_with(eval_like);
        let inputs = ["hello", "aaaa;rm -rfbbbb", "x;rm -rf"];
        let opts = ExecOptions::default();
        let batch = engine.fuzz("print(eval(input()))", Language::Python, &inputs, &opts);
        assert_eq!(batch.total_executions, 3);
        assert_eq!(batch.crashes.len(), 2);
        assert_eq!(batch.crashes[0].hash, batch.crashes[1].hash);
        assert!((batch.success_rate - 1.0 / 3.0).abs() < 1e-9);

        let hash = batch.crashes[0].hash.clone();
        let record = engine
            .minimize_cluster(&hash, "print(eval(input()))", Language::Python, &opts, 1000)
            .unwrap()
            .unwrap();
        assert_eq!(record.original_size, 15);
        assert_eq!(record.minimized_size, 7);
        let cluster = engine.crashes().get(&hash).unwrap();
        assert_eq!(cluster.representative.input, b";rm -rf");
        assert_eq!(cluster.minimization, Some(record));
        assert_eq!(cluster.count, 2);
    }

    #[test]
    fn minimize_skips_flaky_crashes() {
        let (engine, _) = engine_with(eval_like);
        let inputs = ["1;rm -rf"];
        let batch = engine.fuzz("code", Language::Python, &inputs, &ExecOptions::default());
        let hash = batch.crashes[0].hash.clone();
        // The same table, now behind a target that no longer crashes.
        let (fixed, _) = engine_with(|_| Ok(ExecutionResult::default()));
        let fixed = FuzzEngine {
            crashes: Arc::clone(engine.crashes()),
            ..fixed
        };
        let opts = ExecOptions::default();
        let ret = fixed
            .minimize_cluster(&hash, "code", Language::Python, &opts, 100)
            .unwrap();
        assert!(ret.is_none());
        assert!(fixed
            .minimize_cluster("missing", "code", Language::Python, &opts, 100)
            .is_err());
    }

    #[test]
    fn validation() {
        assert_eq!(
            FuzzJob::new("t", "code", "cobol", vec![], FuzzOptions::default()).unwrap_err(),
            ValidationError::Language("cobol".into())
        );
        let mut opts = FuzzOptions::default();
        opts.max_iterations = 0;
        assert_eq!(
            FuzzJob::new("t", "code", "py", vec![], opts).unwrap_err(),
            ValidationError::ZeroIterations
        );
        let mut opts = FuzzOptions::default();
        opts.priority = 11;
        assert_eq!(
            FuzzJob::new("t", "code", "py", vec![], opts).unwrap_err(),
            ValidationError::Priority(11)
        );
        assert_eq!(
            FuzzJob::new("t", " ", "py", vec![], FuzzOptions::default()).unwrap_err(),
            ValidationError::Empty("code")
        );
    }

    #[test]
    fn job_round_trip() {
        let job = job(42);
        let text = serde_json::to_string(&JobPayload::Fuzz(job.clone())).unwrap();
        let back: JobPayload = serde_json::from_str(&text).unwrap();
        assert_eq!(back, JobPayload::Fuzz(job));
    }

    #[test]
    fn queue_to_result_through_the_pool() {
        let (engine, _) = engine_with(eval_like);
        let engine = Arc::new(engine);
        let q = Arc::new(JobQueue::in_memory());
        let fuzz = q.enqueue(JobPayload::Fuzz(job(10)), 5).unwrap();
        let scan = q
            .enqueue(
                JobPayload::Scan(ScanJob {
                    target_id: "t".into(),
                    target: "https://example.test".into(),
                }),
                1,
            )
            .unwrap();
        let pool = WorkerPool::start(
            Arc::clone(&q),
            engine.clone(),
            2,
            Duration::from_millis(1),
            StopToken::new(),
        );
        let deadline = Instant::now() + Duration::from_secs(20);
        while q.stats().completed + q.stats().failed < 2 {
            assert!(Instant::now() < deadline);
            sleep(Duration::from_millis(5));
        }
        pool.shutdown();

        let done = q.get_job(&fuzz).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        let result = done.result.unwrap();
        assert_eq!(result["iterations"], 10);
        assert_eq!(result["crashes"][0]["signal"], "SyntaxError");
        assert_eq!(q.get_job(&scan).unwrap().status, JobStatus::Failed);

        let report = q
            .enqueue(
                JobPayload::Report(ReportJob {
                    target_id: "login-form".into(),
                    crash_hashes: vec![],
                    format: "json".into(),
                }),
                5,
            )
            .unwrap();
        let job = q.dequeue().unwrap().unwrap();
        assert_eq!(job.id, report);
        let ctx = JobContext::new(report, Arc::clone(&q), StopToken::new());
        let out = engine.handle(&job, &ctx).unwrap();
        assert_eq!(out["clusters"].as_array().unwrap().len(), 1);
    }
}
