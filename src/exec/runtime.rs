//! Per-language runtime profiles: container image, entry file, launch command and limits.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};
use thiserror::Error;

use super::ExecOptions;

/// Marker line emitted on stderr by the coverage shim, followed by reached line numbers.
pub const COVERAGE_MARKER: &str = "##sandfuzz-cov##";

pub const MB: u64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Java,
    Javascript,
    Shell,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::Python,
        Language::Java,
        Language::Javascript,
        Language::Shell,
    ];

    pub fn profile(self) -> &'static RuntimeProfile {
        match self {
            Language::Python => &PYTHON,
            Language::Java => &JAVA,
            Language::Javascript => &JAVASCRIPT,
            Language::Shell => &SHELL,
        }
    }

    pub fn name(self) -> &'static str {
        self.profile().name
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported language: {0}")]
pub struct UnsupportedLanguage(pub String);

impl FromStr for Language {
    type Err = UnsupportedLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "py" | "python3" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            "javascript" | "js" | "node" => Ok(Language::Javascript),
            "shell" | "sh" => Ok(Language::Shell),
            other => Err(UnsupportedLanguage(other.to_string())),
        }
    }
}

/// Static description of how one language runtime is launched.
#[derive(Debug)]
pub struct RuntimeProfile {
    pub name: &'static str,
    pub image: &'static str,
    /// Name of the staged program file.
    pub entry: &'static str,
    pub default_timeout_ms: u64,
    pub default_memory_bytes: u64,
    /// The runtime reserves large virtual mappings, so an address-space rlimit breaks it.
    pub limit_address_space: bool,
    pub supports_coverage: bool,
    /// In-process security policy file staged next to the program.
    pub policy: Option<(&'static str, &'static str)>,
}

/// Resolved limits of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    pub timeout: Duration,
    pub memory_bytes: u64,
    pub cpu_shares: u64,
    pub pid_limit: u32,
    pub network_disabled: bool,
    pub coverage: bool,
}

impl RuntimeProfile {
    pub fn limits(&self, opts: &ExecOptions) -> Limits {
        Limits {
            timeout: Duration::from_millis(opts.timeout_ms.unwrap_or(self.default_timeout_ms)),
            memory_bytes: opts
                .memory_limit_bytes
                .unwrap_or(self.default_memory_bytes),
            cpu_shares: opts.cpu_shares,
            pid_limit: opts.pid_limit,
            network_disabled: opts.network_disabled,
            coverage: opts.collect_coverage && self.supports_coverage,
        }
    }

    /// Command line launching the staged program, with staged files under `root`.
    pub fn argv(&self, root: &str, limits: &Limits) -> Vec<String> {
        let entry = format!("{}/{}", root, self.entry);
        match self.name {
            "python" if limits.coverage => vec![
                "python3".into(),
                "-I".into(),
                format!("{}/{}", root, PYTHON_COVERAGE_SHIM.0),
                entry,
            ],
            "python" => vec!["python3".into(), "-I".into(), entry],
            "java" => {
                let (policy, _) = self.policy.unwrap_or(JAVA_POLICY);
                vec![
                    "java".into(),
                    format!("-Xmx{}m", (limits.memory_bytes / MB / 2).max(32)),
                    "-Djava.security.manager".into(),
                    format!("-Djava.security.policy=={}/{}", root, policy),
                    entry,
                ]
            }
            "javascript" => vec!["node".into(), entry],
            _ => vec!["sh".into(), entry],
        }
    }

    /// Extra support files to stage next to the program.
    pub fn support_files(&self, limits: &Limits) -> Vec<(&'static str, &'static str)> {
        let mut files = Vec::new();
        if let Some(policy) = self.policy {
            files.push(policy);
        }
        if limits.coverage && self.name == "python" {
            files.push(PYTHON_COVERAGE_SHIM);
        }
        files
    }
}

pub static PYTHON: RuntimeProfile = RuntimeProfile {
    name: "python",
    image: "python:3.11-alpine",
    entry: "main.py",
    default_timeout_ms: 5000,
    default_memory_bytes: 512 * MB,
    limit_address_space: true,
    supports_coverage: true,
    policy: None,
};

// JVM startup dominates short runs, give it a longer default budget.
pub static JAVA: RuntimeProfile = RuntimeProfile {
    name: "java",
    image: "eclipse-temurin:17-jdk-alpine",
    entry: "Main.java",
    default_timeout_ms: 10000,
    default_memory_bytes: 1024 * MB,
    limit_address_space: false,
    supports_coverage: false,
    policy: Some(JAVA_POLICY),
};

pub static JAVASCRIPT: RuntimeProfile = RuntimeProfile {
    name: "javascript",
    image: "node:20-alpine",
    entry: "main.js",
    default_timeout_ms: 5000,
    default_memory_bytes: 512 * MB,
    limit_address_space: false,
    supports_coverage: false,
    policy: None,
};

pub static SHELL: RuntimeProfile = RuntimeProfile {
    name: "shell",
    image: "alpine:3.19",
    entry: "main.sh",
    default_timeout_ms: 5000,
    default_memory_bytes: 512 * MB,
    limit_address_space: true,
    supports_coverage: false,
    policy: None,
};

/// Deny-all grant for user code. The source launcher compiles in-process and needs the compiler module trusted.
const JAVA_POLICY: (&str, &str) = (
    "sandbox.policy",
    r#"grant codeBase "jrt:/jdk.compiler" {
    permission java.security.AllPermission;
};
grant {
    permission java.util.PropertyPermission "*", "read";
};
"#,
);

const PYTHON_COVERAGE_SHIM: (&str, &str) = (
    "sandfuzz_cov.py",
    r#"import atexit, os, runpy, sys
_target = os.path.abspath(sys.argv[1])
_lines = set()
def _trace(frame, event, arg):
    if os.path.abspath(frame.f_code.co_filename) != _target:
        return None
    if event == "line":
        _lines.add(frame.f_lineno)
    return _trace
def _dump():
    sys.settrace(None)
    sys.stderr.write("\n##sandfuzz-cov## " + " ".join(str(l) for l in sorted(_lines)) + "\n")
    sys.stderr.flush()
atexit.register(_dump)
sys.argv = sys.argv[1:]
sys.settrace(_trace)
runpy.run_path(_target, run_name="__main__")
"#,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_language() {
        assert_eq!("Python".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("js".parse::<Language>().unwrap(), Language::Javascript);
        let err = "cobol".parse::<Language>().unwrap_err();
        assert_eq!(err.to_string(), "unsupported language: cobol");
    }

    #[test]
    fn default_limits_depend_on_runtime() {
        let opts = ExecOptions::default();
        let py = Language::Python.profile().limits(&opts);
        let java = Language::Java.profile().limits(&opts);
        assert!(java.timeout > py.timeout);
        assert!(java.memory_bytes > py.memory_bytes);
        assert!(py.network_disabled);
    }

    #[test]
    fn coverage_only_where_supported() {
        let opts = ExecOptions {
            collect_coverage: true,
            ..ExecOptions::default()
        };
        let py = Language::Python.profile();
        let limits = py.limits(&opts);
        assert!(limits.coverage);
        let argv = py.argv("/sandbox", &limits);
        assert_eq!(argv[2], "/sandbox/sandfuzz_cov.py");
        assert!(py
            .support_files(&limits)
            .iter()
            .any(|(n, _)| *n == "sandfuzz_cov.py"));
        assert!(!Language::Javascript.profile().limits(&opts).coverage);
    }

    #[test]
    fn java_applies_policy() {
        let java = Language::Java.profile();
        let limits = java.limits(&ExecOptions::default());
        let argv = java.argv("/sandbox", &limits);
        assert!(argv.contains(&"-Djava.security.manager".to_string()));
        assert!(argv
            .iter()
            .any(|a| a == "-Djava.security.policy==/sandbox/sandbox.policy"));
        assert_eq!(java.support_files(&limits).len(), 1);
    }
}
