//! Runs programs in disposable containers through a docker compatible CLI.

use super::{
    classify, runtime::RuntimeProfile, ExecOptions, ExecutionResult, Language, Limits, RawRun,
    Sandbox, SandboxError, Staging,
};
use crate::utils::{io_bg::read_background, wait_timeout};
use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::{Duration, Instant},
};

const MOUNT_POINT: &str = "/sandbox";
const NOBODY: &str = "65534:65534";

pub struct ContainerSandbox {
    runtime: String,
    profile: &'static RuntimeProfile,
    language: Language,
}

impl ContainerSandbox {
    pub fn new(runtime: String, language: Language) -> Self {
        Self {
            runtime,
            profile: language.profile(),
            language,
        }
    }

    /// Arguments of the `create` call, the security policy lives here.
    fn create_args(&self, name: &str, staging: &Staging, limits: &Limits) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--interactive".into(),
            "--name".into(),
            name.into(),
        ];
        if limits.network_disabled {
            args.extend(["--network".into(), "none".into()]);
        }
        let mem = limits.memory_bytes.to_string();
        args.extend([
            "--memory".into(),
            mem.clone(),
            "--memory-swap".into(),
            mem,
            "--cpu-shares".into(),
            limits.cpu_shares.to_string(),
            "--pids-limit".into(),
            limits.pid_limit.to_string(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--read-only".into(),
            "--tmpfs".into(),
            "/tmp:rw,noexec,nosuid,size=64m".into(),
            "--user".into(),
            NOBODY.into(),
            "--workdir".into(),
            "/tmp".into(),
            "--volume".into(),
            format!("{}:{}:ro", staging.path().display(), MOUNT_POINT),
            self.profile.image.into(),
        ]);
        args.extend(self.profile.argv(MOUNT_POINT, limits));
        args
    }

    fn cli(&self, args: &[&str]) -> Result<String, SandboxError> {
        let out = Command::new(&self.runtime)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| SandboxError::Spawn {
                program: self.runtime.clone(),
                source: e,
            })?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
        } else {
            Err(SandboxError::Runtime(format!(
                "{} {}: {}",
                self.runtime,
                args[0],
                String::from_utf8_lossy(&out.stderr).trim()
            )))
        }
    }
}

/// Force-removes the container when dropped.
struct Removal<'a> {
    runtime: &'a str,
    name: &'a str,
}

impl Drop for Removal<'_> {
    fn drop(&mut self) {
        let r = Command::new(self.runtime)
            .args(["rm", "--force", self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if !matches!(r, Ok(s) if s.success()) {
            log::warn!("failed to remove container {}", self.name);
        }
    }
}

impl Sandbox for ContainerSandbox {
    fn language(&self) -> Language {
        self.language
    }

    fn try_execute(
        &self,
        code: &str,
        input: &[u8],
        opts: &ExecOptions,
    ) -> Result<ExecutionResult, SandboxError> {
        let limits = self.profile.limits(opts);
        let staging = Staging::new(self.profile, code, input, &limits)?;
        let name = format!("sandfuzz-{}", uuid::Uuid::new_v4().simple());

        let args = self.create_args(&name, &staging, &limits);
        let args = args.iter().map(String::as_str).collect::<Vec<_>>();
        let id = self.cli(&args)?;
        let _removal = Removal {
            runtime: &self.runtime,
            name: &name,
        };

        let start = Instant::now();
        let mut child = Command::new(&self.runtime)
            .args(["start", "--attach", "--interactive", name.as_str()])
            .stdin(staging.input()?)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SandboxError::Spawn {
                program: self.runtime.clone(),
                source: e,
            })?;
        let stdout = child.stdout.take().map(read_background);
        let stderr = child.stderr.take().map(read_background);

        let mut cgroup = None;
        let mut peak = 0;
        let status = wait_timeout(&mut child, limits.timeout, || {
            if cgroup.is_none() {
                cgroup = cgroup_memory_file(&id);
            }
            if let Some(f) = cgroup.as_ref() {
                peak = peak.max(read_u64(f));
            }
        })
        .map_err(SandboxError::Wait)?;
        let elapsed = start.elapsed();
        let timed_out = status.is_none();
        if timed_out {
            log::debug!("{}: killing {} after {:?}", self.language, name, limits.timeout);
            if let Err(e) = self.cli(&["kill", name.as_str()]) {
                log::debug!("{}", e);
            }
            let _ = child.kill();
            let _ = child.wait();
        }

        let grace = Duration::from_millis(500);
        let stdout = stdout.map(|h| h.wait_finish(grace)).unwrap_or_default();
        let stderr = stderr.map(|h| h.wait_finish(grace)).unwrap_or_default();

        let (exit_code, oom) = if timed_out {
            (None, false)
        } else {
            let state = self.cli(&[
                "inspect",
                "--format",
                "{{.State.ExitCode}} {{.State.OOMKilled}}",
                name.as_str(),
            ])?;
            parse_state(&state)
        };
        if oom {
            peak = limits.memory_bytes;
        }
        let term_signal = exit_code.filter(|c| *c > 128 && *c <= 128 + 64).map(|c| c - 128);
        let raw = RawRun {
            truncated: stdout.truncated || stderr.truncated,
            stdout: stdout.data,
            stderr: stderr.data,
            exit_code,
            term_signal,
            timed_out,
            elapsed,
            memory_used_bytes: peak,
        };
        Ok(classify(raw, &limits))
    }
}

fn parse_state(state: &str) -> (Option<i32>, bool) {
    let mut parts = state.split_whitespace();
    let code = parts.next().and_then(|c| c.parse().ok());
    let oom = parts.next() == Some("true");
    (code, oom)
}

/// Memory usage file of the container cgroup, v2 layouts first.
fn cgroup_memory_file(id: &str) -> Option<PathBuf> {
    [
        format!("/sys/fs/cgroup/system.slice/docker-{}.scope/memory.peak", id),
        format!("/sys/fs/cgroup/system.slice/docker-{}.scope/memory.current", id),
        format!("/sys/fs/cgroup/docker/{}/memory.current", id),
        format!("/sys/fs/cgroup/memory/docker/{}/memory.max_usage_in_bytes", id),
    ]
    .into_iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

fn read_u64(f: &Path) -> u64 {
    read_to_string(f)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}
