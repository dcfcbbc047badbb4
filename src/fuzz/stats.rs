use crate::utils::StopToken;
use serde::{Deserialize, Serialize};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    thread::sleep,
    time::{Duration, Instant},
};

/// Process wide fuzzing counters.
#[derive(Debug, Default)]
pub struct Stats {
    fuzzing: AtomicU64,
    exec_total: AtomicU64,
    infra_failures: AtomicU64,
    crashes: AtomicU64,
    unique_crash: AtomicU64,
    corpus_size: AtomicU64,
    max_cov: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub fuzzing: u64,
    pub exec_total: u64,
    pub infra_failures: u64,
    pub crashes: u64,
    pub unique_crashes: u64,
    pub corpus_size: u64,
    pub max_coverage: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_fuzzing(&self) {
        self.fuzzing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_fuzzing(&self) {
        self.fuzzing.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_exec_total(&self) {
        self.exec_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_infra_failures(&self) {
        self.infra_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_crashes(&self) {
        self.crashes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_unique_crash(&self, n: u64) {
        self.unique_crash.store(n, Ordering::Relaxed);
    }

    pub fn add_corpus_size(&self, n: u64) {
        self.corpus_size.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sub_corpus_size(&self, n: u64) {
        self.corpus_size.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn set_max_cov(&self, n: u64) {
        self.max_cov.fetch_max(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            fuzzing: self.fuzzing.load(Ordering::Relaxed),
            exec_total: self.exec_total.load(Ordering::Relaxed),
            infra_failures: self.infra_failures.load(Ordering::Relaxed),
            crashes: self.crashes.load(Ordering::Relaxed),
            unique_crashes: self.unique_crash.load(Ordering::Relaxed),
            corpus_size: self.corpus_size.load(Ordering::Relaxed),
            max_coverage: self.max_cov.load(Ordering::Relaxed),
        }
    }

    /// Logs one summary line every `duration` until `stop` is requested.
    /// `active` reports the number of busy workers.
    pub fn report(&self, duration: Duration, stop: &StopToken, active: impl Fn() -> usize) {
        const STEP: Duration = Duration::from_millis(100);

        let mut last = Instant::now();
        let mut last_exec = 0;
        while !stop.stop_soon() {
            sleep(STEP);
            if last.elapsed() < duration {
                continue;
            }

            let s = self.snapshot();
            let secs = last.elapsed().as_secs_f64();
            let speed = (s.exec_total - last_exec) as f64 / secs;
            last = Instant::now();
            last_exec = s.exec_total;
            log::info!(
                "exec: {} ({:.1}/s), jobs/workers {}/{}, uniq/total crashes {}/{}, infra failures: {}, max cover {}, corpus: {}",
                s.exec_total,
                speed,
                s.fuzzing,
                active(),
                s.unique_crashes,
                s.crashes,
                s.infra_failures,
                s.max_coverage,
                s.corpus_size
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_tracks_counters() {
        let s = Stats::new();
        s.inc_fuzzing();
        s.inc_exec_total();
        s.inc_exec_total();
        s.inc_crashes();
        s.set_unique_crash(1);
        s.set_max_cov(7);
        s.set_max_cov(3);
        s.add_corpus_size(4);
        s.sub_corpus_size(1);
        s.dec_fuzzing();
        let snap = s.snapshot();
        assert_eq!(snap.fuzzing, 0);
        assert_eq!(snap.exec_total, 2);
        assert_eq!(snap.crashes, 1);
        assert_eq!(snap.unique_crashes, 1);
        assert_eq!(snap.max_coverage, 7);
        assert_eq!(snap.corpus_size, 3);
    }

    #[test]
    fn report_returns_on_stop() {
        let s = Stats::new();
        let stop = StopToken::new();
        stop.stop_req();
        s.report(Duration::from_secs(10), &stop, || 0);
    }
}
