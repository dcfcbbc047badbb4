//! Runs the interpreter directly on the host in its own session.
//!
//! Only an address-space rlimit and process-group kill confine the program, there is no
//! filesystem or network isolation. Meant for local development and tests.

use super::{
    classify, runtime::RuntimeProfile, ExecOptions, ExecutionResult, Language, RawRun, Sandbox,
    SandboxError, Staging,
};
use crate::utils::{io_bg::read_background, wait_timeout};
use nix::{
    libc,
    sys::signal::{killpg, Signal},
    unistd::{setsid, Pid},
};
use std::{
    fs::read_to_string,
    io,
    os::unix::process::{CommandExt, ExitStatusExt},
    process::{Command, Stdio},
    sync::Once,
    time::{Duration, Instant},
};

const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

static UNCONFINED_WARNING: Once = Once::new();

pub struct ProcessSandbox {
    profile: &'static RuntimeProfile,
    language: Language,
}

impl ProcessSandbox {
    pub fn new(language: Language) -> Self {
        Self {
            profile: language.profile(),
            language,
        }
    }
}

impl Sandbox for ProcessSandbox {
    fn language(&self) -> Language {
        self.language
    }

    fn try_execute(
        &self,
        code: &str,
        input: &[u8],
        opts: &ExecOptions,
    ) -> Result<ExecutionResult, SandboxError> {
        UNCONFINED_WARNING.call_once(|| {
            log::warn!("process backend: programs run unconfined on the host, use the container backend for untrusted code")
        });

        let limits = self.profile.limits(opts);
        let staging = Staging::new(self.profile, code, input, &limits)?;
        let root = staging.path().to_string_lossy().into_owned();
        let argv = self.profile.argv(&root, &limits);
        let as_limit = if self.profile.limit_address_space {
            Some(limits.memory_bytes as libc::rlim_t)
        } else {
            None
        };

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(staging.path())
            .env_clear()
            .env("PATH", SAFE_PATH)
            .env("HOME", &root)
            .stdin(staging.input()?)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        unsafe {
            cmd.pre_exec(move || {
                setsid().map_err(|e| io::Error::from_raw_os_error(e as i32))?;
                if let Some(limit) = as_limit {
                    let rl = libc::rlimit {
                        rlim_cur: limit,
                        rlim_max: limit,
                    };
                    if libc::setrlimit(libc::RLIMIT_AS, &rl) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| SandboxError::Spawn {
            program: argv[0].clone(),
            source: e,
        })?;
        let pgid = Pid::from_raw(child.id() as i32);
        // Take the pipes right away so a chatty program never blocks on a full pipe.
        let stdout = child.stdout.take().map(read_background);
        let stderr = child.stderr.take().map(read_background);

        let mut peak = 0;
        let status = wait_timeout(&mut child, limits.timeout, || {
            peak = peak.max(peak_rss(pgid));
        });
        let elapsed = start.elapsed();
        let status = match status {
            Ok(s) => s,
            Err(e) => {
                kill_group(pgid);
                let _ = child.wait();
                return Err(SandboxError::Wait(e));
            }
        };
        // Kill the whole group: on timeout the program itself, otherwise leftover children.
        kill_group(pgid);
        let status = match status {
            Some(s) => Some(s),
            None => {
                log::debug!("{}: killed after {:?}", self.language, limits.timeout);
                let _ = child.wait();
                None
            }
        };

        let grace = Duration::from_millis(500);
        let stdout = stdout.map(|h| h.wait_finish(grace)).unwrap_or_default();
        let stderr = stderr.map(|h| h.wait_finish(grace)).unwrap_or_default();
        let raw = RawRun {
            truncated: stdout.truncated || stderr.truncated,
            stdout: stdout.data,
            stderr: stderr.data,
            exit_code: status.and_then(|s| s.code()),
            term_signal: status.and_then(|s| s.signal()),
            timed_out: status.is_none(),
            elapsed,
            memory_used_bytes: peak,
        };
        Ok(classify(raw, &limits))
    }
}

fn kill_group(pgid: Pid) {
    // ESRCH is expected when the group is already gone.
    let _ = killpg(pgid, Signal::SIGKILL);
}

/// Peak resident set size of `pid` in bytes, 0 when unavailable.
fn peak_rss(pid: Pid) -> u64 {
    read_to_string(format!("/proc/{}/status", pid))
        .ok()
        .and_then(|status| {
            status.lines().find_map(|l| {
                l.strip_prefix("VmHWM:")
                    .and_then(|v| v.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
            })
        })
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}
