//! Crash fingerprinting, severity classification and deduplication.

use crate::{
    exec::ExecutionResult,
    utils::{sha1_hex, write_atomic},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};
use thiserror::Error;

/// Input minimization.
pub mod minimize;
/// Stack normalization and signal extraction.
pub mod normalize;

pub use normalize::extract_signal;

#[derive(Debug, Error)]
pub enum CrashError {
    #[error("crash table io: {0}")]
    Io(#[from] io::Error),
    #[error("crash table format: {0}")]
    Json(#[from] serde_json::Error),
}

/// One observed crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crash {
    #[serde(with = "crate::utils::hex_bytes")]
    pub input: Vec<u8>,
    pub signal: String,
    pub error: String,
    /// Normalized frames, innermost first.
    pub stack: Vec<String>,
    /// Locations first reached by this crash.
    pub new_coverage: BTreeSet<u32>,
    pub exit_code: i32,
    pub found_at: DateTime<Utc>,
}

impl Crash {
    pub fn from_result(input: &[u8], r: &ExecutionResult, new_coverage: BTreeSet<u32>) -> Self {
        let error = r.error.clone().unwrap_or_default();
        Self {
            input: input.to_vec(),
            signal: extract_signal(r),
            stack: normalize::normalize_stack(&error),
            error,
            new_coverage,
            exit_code: r.exit_code,
            found_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hash: String,
    pub stack_hash: String,
    pub signal: String,
    pub coverage_hash: String,
}

impl Fingerprint {
    pub fn new(stack_hash: String, signal: String, coverage_hash: String) -> Self {
        let hash = sha1_hex(format!("{}|{}|{}", stack_hash, signal, coverage_hash).as_bytes());
        Self {
            hash,
            stack_hash,
            signal,
            coverage_hash,
        }
    }

    /// Same stack and signal, coverage may differ.
    pub fn same_shape(&self, other: &Fingerprint) -> bool {
        self.stack_hash == other.stack_hash && self.signal == other.signal
    }
}

/// Fingerprint of `crash`, independent of timing and of the exact input bytes.
pub fn fingerprint(crash: &Crash) -> Fingerprint {
    let stack_hash = sha1_hex(crash.stack.join("\n").as_bytes());
    let cov = crash
        .new_coverage
        .iter()
        .map(|l| l.to_string())
        .collect::<Vec<_>>()
        .join(",");
    Fingerprint::new(stack_hash, crash.signal.clone(), sha1_hex(cov.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

const HEAP_MARKERS: [&str; 5] = [
    "double free",
    "heap",
    "malloc",
    "corrupted",
    "free(): invalid",
];
/// Errors showing that input reached an evaluator or a shell.
const INJECTION_CLASSES: [&str; 4] = ["SyntaxError", "NameError", "ReferenceError", "EvalError"];
const RESOURCE_CLASSES: [&str; 5] = [
    "MemoryError",
    "RecursionError",
    "java.lang.OutOfMemoryError",
    "java.lang.StackOverflowError",
    "RangeError",
];

/// Fixed severity table, returns the severity and an exploitability score in 0..=100.
pub fn classify_severity(signal: &str, error: &str) -> (Severity, u8) {
    match signal {
        "SIGSEGV" | "SIGBUS" | "SIGILL" => (Severity::Critical, 90),
        "SIGABRT" if HEAP_MARKERS.iter().any(|m| error.contains(m)) => (Severity::Critical, 80),
        "TIMEOUT" | "SIGKILL" | "SIGXCPU" | "SIGXFSZ" => (Severity::Medium, 20),
        s if s.starts_with("SIG") => (Severity::High, 60),
        s if INJECTION_CLASSES.contains(&s) => (Severity::High, 50),
        s if RESOURCE_CLASSES.contains(&s) => (Severity::Medium, 20),
        s if s.starts_with("EXIT_") => (Severity::Low, 10),
        s if s.ends_with("SecurityException") || s.ends_with("AccessControlException") => {
            (Severity::High, 40)
        }
        _ => (Severity::Medium, 30),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinimizationRecord {
    pub original_size: usize,
    pub minimized_size: usize,
    pub reduction_percent: f64,
    pub iterations: u64,
}

impl MinimizationRecord {
    pub fn new(original_size: usize, minimized_size: usize, iterations: u64) -> Self {
        let reduction_percent = if original_size == 0 {
            0.0
        } else {
            original_size.saturating_sub(minimized_size) as f64 * 100.0 / original_size as f64
        };
        Self {
            original_size,
            minimized_size,
            reduction_percent,
            iterations,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashCluster {
    pub fingerprint: Fingerprint,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub representative: Crash,
    pub severity: Severity,
    pub exploitability: Option<u8>,
    pub minimization: Option<MinimizationRecord>,
}

impl CrashCluster {
    fn new(fingerprint: Fingerprint, crash: Crash) -> Self {
        let (severity, score) = classify_severity(&crash.signal, &crash.error);
        Self {
            fingerprint,
            count: 1,
            first_seen: crash.found_at,
            last_seen: crash.found_at,
            representative: crash,
            severity,
            exploitability: Some(score),
            minimization: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClusterUpdate {
    New(CrashCluster),
    Existing { hash: String, count: u64 },
}

impl ClusterUpdate {
    pub fn is_new(&self) -> bool {
        matches!(self, ClusterUpdate::New(_))
    }

    pub fn hash(&self) -> &str {
        match self {
            ClusterUpdate::New(c) => &c.fingerprint.hash,
            ClusterUpdate::Existing { hash, .. } => hash,
        }
    }
}

/// Cluster table shared by all workers, updates are serialized by one lock.
#[derive(Debug, Default)]
pub struct CrashTable {
    clusters: Mutex<BTreeMap<String, CrashCluster>>,
    path: Option<PathBuf>,
}

impl CrashTable {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Table persisted at `path`, loading the clusters already saved there.
    pub fn open(path: PathBuf) -> Result<Self, CrashError> {
        let clusters = match fs::read(&path) {
            Ok(data) => serde_json::from_slice::<Vec<CrashCluster>>(&data)?
                .into_iter()
                .map(|c| (c.fingerprint.hash.clone(), c))
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            clusters: Mutex::new(clusters),
            path: Some(path),
        })
    }

    pub fn record(&self, fp: Fingerprint, crash: Crash) -> ClusterUpdate {
        let mut clusters = self.clusters.lock().unwrap();
        if let Some(c) = clusters.get_mut(&fp.hash) {
            c.count += 1;
            if crash.found_at > c.last_seen {
                c.last_seen = crash.found_at;
            }
            return ClusterUpdate::Existing {
                hash: fp.hash,
                count: c.count,
            };
        }
        let cluster = CrashCluster::new(fp, crash);
        clusters.insert(cluster.fingerprint.hash.clone(), cluster.clone());
        ClusterUpdate::New(cluster)
    }

    /// Replaces the representative with a minimized crash of the same shape.
    pub fn attach_minimization(
        &self,
        hash: &str,
        minimized: Crash,
        record: MinimizationRecord,
    ) -> bool {
        let mut clusters = self.clusters.lock().unwrap();
        match clusters.get_mut(hash) {
            Some(c) => {
                c.representative = minimized;
                c.minimization = Some(record);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, hash: &str) -> Option<CrashCluster> {
        let clusters = self.clusters.lock().unwrap();
        clusters.get(hash).cloned()
    }

    pub fn clusters(&self) -> Vec<CrashCluster> {
        let clusters = self.clusters.lock().unwrap();
        clusters.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clusters.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_crashes(&self) -> u64 {
        let clusters = self.clusters.lock().unwrap();
        clusters.values().map(|c| c.count).sum()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Writes the table if it is persistent.
    pub fn save(&self) -> Result<(), CrashError> {
        let path = match self.path.as_ref() {
            Some(p) => p,
            None => return Ok(()),
        };
        let data = {
            let clusters = self.clusters.lock().unwrap();
            serde_json::to_vec_pretty(&clusters.values().collect::<Vec<_>>())?
        };
        write_atomic(path, &data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crash(input: &[u8], stack: &[&str], signal: &str) -> Crash {
        Crash {
            input: input.to_vec(),
            signal: signal.into(),
            error: format!("{}: boom", signal),
            stack: stack.iter().map(|s| s.to_string()).collect(),
            new_coverage: [3, 5].iter().copied().collect(),
            exit_code: 1,
            found_at: Utc::now(),
        }
    }

    #[test]
    fn identical_shapes_merge() {
        let table = CrashTable::in_memory();
        let a = crash(b"admin;rm -rf", &["File \"<string>\", line ?"], "SyntaxError");
        let b = crash(b"guest'", &["File \"<string>\", line ?"], "SyntaxError");
        let fa = fingerprint(&a);
        let fb = fingerprint(&b);
        assert_eq!(fa, fb);

        assert!(table.record(fa, a).is_new());
        match table.record(fb, b) {
            ClusterUpdate::Existing { count, .. } => assert_eq!(count, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(table.len(), 1);
        let c = &table.clusters()[0];
        assert_eq!(c.count, 2);
        assert!(c.last_seen >= c.first_seen);
        assert_eq!(c.representative.input, b"admin;rm -rf");
    }

    #[test]
    fn fingerprint_components() {
        let a = crash(b"x", &["f"], "SIGSEGV");
        let mut b = a.clone();
        b.new_coverage.insert(9);
        let (fa, fb) = (fingerprint(&a), fingerprint(&b));
        assert_ne!(fa.hash, fb.hash);
        assert!(fa.same_shape(&fb));
        let c = crash(b"x", &["g"], "SIGSEGV");
        assert!(!fa.same_shape(&fingerprint(&c)));
        assert_eq!(
            fa.hash,
            Fingerprint::new(fa.stack_hash.clone(), fa.signal.clone(), fa.coverage_hash.clone()).hash
        );
    }

    #[test]
    fn severity_table() {
        assert_eq!(classify_severity("SIGSEGV", "").0, Severity::Critical);
        assert_eq!(
            classify_severity("SIGABRT", "free(): double free detected").0,
            Severity::Critical
        );
        assert_eq!(classify_severity("SIGABRT", "assert failed").0, Severity::High);
        assert_eq!(classify_severity("SyntaxError", "").0, Severity::High);
        assert_eq!(classify_severity("TIMEOUT", "").0, Severity::Medium);
        assert_eq!(classify_severity("TypeError", "").0, Severity::Medium);
        assert_eq!(classify_severity("EXIT_2", "").0, Severity::Low);
        assert!(Severity::Critical > Severity::Low);
    }

    #[test]
    fn concurrent_records_do_not_lose_updates() {
        let table = std::sync::Arc::new(CrashTable::in_memory());
        let handles = (0..8)
            .map(|_| {
                let t = std::sync::Arc::clone(&table);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let c = crash(b"x", &["f"], "SIGSEGV");
                        t.record(fingerprint(&c), c);
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.len(), 1);
        assert_eq!(table.total_crashes(), 400);
    }

    #[test]
    fn persistence_round_trip() {
        let dir = std::env::temp_dir().join(format!("sandfuzz-crash-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("crashes.json");

        let table = CrashTable::open(path.clone()).unwrap();
        let c = crash(b"\x00\xffinput", &["a", "b"], "NameError");
        let fp = fingerprint(&c);
        let hash = fp.hash.clone();
        table.record(fp, c.clone());
        let mut small = c;
        small.input = b"in".to_vec();
        assert!(table.attach_minimization(&hash, small, MinimizationRecord::new(7, 2, 13)));
        table.save().unwrap();

        let back = CrashTable::open(path).unwrap();
        assert_eq!(back.clusters(), table.clusters());
        let m = back.get(&hash).unwrap().minimization.unwrap();
        assert_eq!(m.minimized_size, 2);
        assert!((m.reduction_percent - 500.0 / 7.0).abs() < 1e-9);
        fs::remove_dir_all(&dir).unwrap();
    }
}
