//! Sandboxed execution of untrusted programs.
//!
//! Every execution gets a fresh staging directory and a fresh isolation environment.
//! Infrastructure failures never escape [`Sandbox::execute`], they are folded into a
//! crashed [`ExecutionResult`] with exit code -1.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs::{self, File},
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;

pub use runtime::{Language, Limits, RuntimeProfile, UnsupportedLanguage};

/// Container runtime backend.
pub mod container;
/// Local process backend.
pub mod process;
/// Language runtime profiles.
pub mod runtime;

pub use container::ContainerSandbox;
pub use process::ProcessSandbox;

/// Options of one execution, unset limits fall back to the language defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecOptions {
    pub timeout_ms: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    pub cpu_shares: u64,
    pub network_disabled: bool,
    pub pid_limit: u32,
    pub collect_coverage: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            memory_limit_bytes: None,
            cpu_shares: 512,
            network_disabled: true,
            pid_limit: 64,
            collect_coverage: false,
        }
    }
}

/// Outcome of one execution. Fresh per call, never mutated after return.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Captured stdout.
    pub output: String,
    /// Stderr or failure description, set for crashed executions.
    pub error: Option<String>,
    pub exit_code: i32,
    pub crashed: bool,
    #[serde(default)]
    pub timed_out: bool,
    /// Terminating signal number, if the program was killed by one.
    #[serde(default)]
    pub term_signal: Option<i32>,
    /// The sandbox itself failed, the program may never have run.
    #[serde(default)]
    pub infra_failure: bool,
    /// Stdout or stderr was cut at the capture cap.
    #[serde(default)]
    pub output_truncated: bool,
    pub execution_time_ms: u64,
    pub memory_used_bytes: u64,
    pub coverage: Option<BTreeSet<u32>>,
}

impl ExecutionResult {
    pub fn infra_failure(err: &SandboxError, elapsed: Duration) -> Self {
        Self {
            error: Some(format!("sandbox infrastructure error: {}", err)),
            exit_code: -1,
            crashed: true,
            infra_failure: true,
            execution_time_ms: elapsed.as_millis() as u64,
            ..Self::default()
        }
    }
}

/// Failures of the isolation layer itself.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to stage program: {0}")]
    Stage(#[source] io::Error),
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("container runtime: {0}")]
    Runtime(String),
    #[error("failed to wait for sandbox: {0}")]
    Wait(#[source] io::Error),
}

/// Runs one untrusted program once.
pub trait Sandbox: Send + Sync {
    fn language(&self) -> Language;

    /// Backend specific execution, may fail with an infrastructure error.
    fn try_execute(
        &self,
        code: &str,
        input: &[u8],
        opts: &ExecOptions,
    ) -> Result<ExecutionResult, SandboxError>;

    /// Fail-closed execution: infrastructure errors become a crashed result.
    fn execute(&self, code: &str, input: &[u8], opts: &ExecOptions) -> ExecutionResult {
        let start = Instant::now();
        match self.try_execute(code, input, opts) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("{} sandbox: {}", self.language(), e);
                ExecutionResult::infra_failure(&e, start.elapsed())
            }
        }
    }
}

/// Hands out sandboxes per language.
pub trait SandboxProvider: Send + Sync {
    fn sandbox(&self, language: Language) -> Arc<dyn Sandbox>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Container { runtime: String },
    Process,
}

impl SandboxProvider for Backend {
    fn sandbox(&self, language: Language) -> Arc<dyn Sandbox> {
        match self {
            Backend::Container { runtime } => {
                Arc::new(ContainerSandbox::new(runtime.clone(), language))
            }
            Backend::Process => Arc::new(ProcessSandbox::new(language)),
        }
    }
}

/// What a backend observed about one finished (or killed) program.
#[derive(Debug, Default)]
pub(crate) struct RawRun {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Either stream hit the capture cap.
    pub truncated: bool,
    pub exit_code: Option<i32>,
    pub term_signal: Option<i32>,
    pub timed_out: bool,
    pub elapsed: Duration,
    pub memory_used_bytes: u64,
}

const CRASH_MARKERS: [&str; 3] = ["Exception", "Error", "Traceback"];

/// Turns a raw run into the public result: extracts coverage, decides `crashed`.
pub(crate) fn classify(raw: RawRun, limits: &Limits) -> ExecutionResult {
    let stderr = String::from_utf8_lossy(&raw.stderr);
    let (stderr, coverage) = split_coverage(&stderr, limits.coverage);
    let exit_code = match (raw.exit_code, raw.term_signal) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => -1,
    };

    let crashed = raw.timed_out
        || exit_code != 0
        || raw.term_signal.is_some()
        || CRASH_MARKERS.iter().any(|m| stderr.contains(m));
    let error = if raw.timed_out {
        let mut e = format!(
            "TIMEOUT: execution exceeded {} ms",
            limits.timeout.as_millis()
        );
        if !stderr.trim().is_empty() {
            e.push('\n');
            e.push_str(&stderr);
        }
        Some(e)
    } else if crashed {
        Some(stderr)
    } else {
        None
    };

    ExecutionResult {
        output: String::from_utf8_lossy(&raw.stdout).into_owned(),
        error,
        exit_code,
        crashed,
        timed_out: raw.timed_out,
        term_signal: raw.term_signal,
        infra_failure: false,
        output_truncated: raw.truncated,
        execution_time_ms: raw.elapsed.as_millis() as u64,
        memory_used_bytes: raw.memory_used_bytes,
        coverage,
    }
}

fn split_coverage(stderr: &str, enabled: bool) -> (String, Option<BTreeSet<u32>>) {
    let mut coverage = None;
    let mut rest = String::with_capacity(stderr.len());
    for line in stderr.split_inclusive('\n') {
        if let Some(locs) = line.trim_end().strip_prefix(runtime::COVERAGE_MARKER) {
            let set = coverage.get_or_insert_with(BTreeSet::new);
            set.extend(locs.split_whitespace().filter_map(|l| l.parse::<u32>().ok()));
        } else {
            rest.push_str(line);
        }
    }
    if enabled && coverage.is_none() {
        coverage = Some(BTreeSet::new());
    }
    let rest = rest.trim_end_matches('\n').to_string();
    (rest, if enabled { coverage } else { None })
}

/// Per-execution staging directory holding the program, support files and input.
/// Removed on drop, on success and error paths alike.
pub(crate) struct Staging {
    dir: PathBuf,
}

pub(crate) const INPUT_FILE: &str = "input";

impl Staging {
    pub fn new(
        profile: &RuntimeProfile,
        code: &str,
        input: &[u8],
        limits: &Limits,
    ) -> Result<Self, SandboxError> {
        let dir = std::env::temp_dir().join(format!("sandfuzz-{}", uuid::Uuid::new_v4()));
        fs::create_dir(&dir).map_err(SandboxError::Stage)?;
        // From here on the guard owns the directory.
        let staging = Staging { dir };
        staging.write(profile.entry, code.as_bytes())?;
        for (name, content) in profile.support_files(limits) {
            staging.write(name, content.as_bytes())?;
        }
        staging.write(INPUT_FILE, input)?;
        fs::set_permissions(&staging.dir, fs::Permissions::from_mode(0o755))
            .map_err(SandboxError::Stage)?;
        Ok(staging)
    }

    fn write(&self, name: &str, data: &[u8]) -> Result<(), SandboxError> {
        let f = self.dir.join(name);
        fs::write(&f, data).map_err(SandboxError::Stage)?;
        fs::set_permissions(&f, fs::Permissions::from_mode(0o444)).map_err(SandboxError::Stage)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn input(&self) -> Result<File, SandboxError> {
        File::open(self.dir.join(INPUT_FILE)).map_err(SandboxError::Stage)
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            log::warn!("failed to remove staging dir {}: {}", self.dir.display(), e);
        }
    }
}
