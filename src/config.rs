use crate::{
    exec::Backend,
    fuzz::EngineSettings,
    queue::RetryPolicy,
};
use serde::{Deserialize, Serialize};
use std::{
    env,
    fmt,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Container,
    Process,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" => Ok(BackendKind::Container),
            "process" => Ok(BackendKind::Process),
            other => Err(format!("unknown backend '{}', expected container or process", other)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Container => write!(f, "container"),
            BackendKind::Process => write!(f, "process"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendKind,
    /// Container runtime binary, e.g. docker or podman.
    pub container_runtime: String,
    /// Worker pool size, the cap on concurrent sandboxes.
    pub workers: usize,
    /// Queue and crash table persistence, in memory if unset.
    pub state_dir: Option<PathBuf>,
    /// Live monitor address, disabled if unset.
    pub monitor_addr: Option<String>,
    pub monitor_tick: Duration,
    /// Idle wait between dequeue attempts.
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub progress_every: u64,
    pub corpus_cap: usize,
    pub stats_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::Container,
            container_runtime: "docker".to_string(),
            workers: 4,
            state_dir: None,
            monitor_addr: Some("127.0.0.1:7878".to_string()),
            monitor_tick: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(250),
            max_attempts: 3,
            retry_base: Duration::from_millis(1000),
            retry_cap: Duration::from_secs(60),
            progress_every: 100,
            corpus_cap: 256,
            stats_period: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn check(&self) -> anyhow::Result<()> {
        if self.workers == 0 || self.workers > 256 {
            anyhow::bail!("workers must be in 1..=256, got {}", self.workers);
        }
        if self.backend == BackendKind::Container && find_in_path(&self.container_runtime).is_none() {
            anyhow::bail!(
                "container runtime '{}' not found in PATH",
                self.container_runtime
            );
        }
        if let Some(dir) = self.state_dir.as_ref() {
            if dir.exists() && !dir.is_dir() {
                anyhow::bail!("bad state dir: {}", dir.display());
            }
        }
        if let Some(addr) = self.monitor_addr.as_ref() {
            if addr.parse::<SocketAddr>().is_err() {
                anyhow::bail!("bad monitor address: {}", addr);
            }
        }
        if self.monitor_tick.is_zero() {
            anyhow::bail!("monitor tick must be positive");
        }
        if self.poll_interval.is_zero() || self.poll_interval > Duration::from_secs(10) {
            anyhow::bail!("poll interval must be in (0, 10s], got {:?}", self.poll_interval);
        }
        if self.max_attempts == 0 {
            anyhow::bail!("max attempts must be positive");
        }
        if self.retry_base > self.retry_cap {
            anyhow::bail!(
                "retry base {:?} exceeds retry cap {:?}",
                self.retry_base,
                self.retry_cap
            );
        }
        if self.progress_every == 0 {
            anyhow::bail!("progress period must be positive");
        }
        if self.corpus_cap == 0 {
            anyhow::bail!("corpus cap must be positive");
        }
        Ok(())
    }

    pub fn sandbox_backend(&self) -> Backend {
        match self.backend {
            BackendKind::Container => Backend::Container {
                runtime: self.container_runtime.clone(),
            },
            BackendKind::Process => Backend::Process,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base: self.retry_base,
            cap: self.retry_cap,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            progress_every: self.progress_every,
            corpus_cap: self.corpus_cap,
            ..EngineSettings::default()
        }
    }

    pub fn jobs_dir(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|d| d.join("jobs"))
    }

    pub fn crash_table(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|d| d.join("crashes.json"))
    }
}

fn find_in_path(bin: &str) -> Option<PathBuf> {
    let p = Path::new(bin);
    if p.components().count() > 1 {
        return p.is_file().then(|| p.to_path_buf());
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|d| d.join(bin))
        .find(|c| c.is_file())
}
