//! Stack trace normalization and crash signal extraction.
//!
//! Frames are reduced to their function/file shape: addresses, line and column
//! numbers and per-execution staging paths are dropped, consecutive identical
//! frames (recursion) collapse into one and only the innermost frames are kept.

use crate::exec::ExecutionResult;
use lazy_static::lazy_static;
use nix::sys::signal::Signal;
use regex::Regex;

/// Frames kept per stack, innermost first.
pub const MAX_FRAMES: usize = 8;

lazy_static! {
    static ref FRAME: Regex =
        Regex::new(r#"^\s*(?:File "|at |#\d+ )"#).unwrap();
    static ref HEX_ADDR: Regex = Regex::new(r"0x[0-9a-fA-F]+").unwrap();
    static ref STAGING_PATH: Regex =
        Regex::new(r"(?:/tmp|/var/tmp)?/sandfuzz-[0-9a-fA-F-]+/|/sandbox/").unwrap();
    static ref LINE_NO: Regex = Regex::new(r"line \d+").unwrap();
    static ref LINE_COL: Regex = Regex::new(r":\d+(?::\d+)?").unwrap();
    static ref OFFSET: Regex = Regex::new(r"\+\d+\b").unwrap();
    static ref ERROR_CLASS: Regex = Regex::new(
        r#"(?m)^(?:Exception in thread "[^"]*" |Uncaught )?([A-Za-z_][\w.$]*(?:Error|Exception|Exit|Interrupt))\b"#
    )
    .unwrap();
}

fn normalize_frame(line: &str) -> String {
    let f = STAGING_PATH.replace_all(line.trim(), "");
    let f = HEX_ADDR.replace_all(&f, "0x?");
    let f = LINE_NO.replace_all(&f, "line ?");
    let f = LINE_COL.replace_all(&f, ":?");
    OFFSET.replace_all(&f, "+?").into_owned()
}

/// Normalized frames of the stack trace found in `text`, innermost first.
pub fn normalize_stack(text: &str) -> Vec<String> {
    let mut frames = text
        .lines()
        .filter(|l| FRAME.is_match(l))
        .map(normalize_frame)
        .collect::<Vec<_>>();
    // Python prints the innermost frame last.
    if text.contains("Traceback (most recent call last)") {
        frames.reverse();
    }
    frames.dedup();
    frames.truncate(MAX_FRAMES);
    frames
}

/// Exception or error class named in `text`, e.g. `NameError` or `java.lang.NullPointerException`.
pub fn error_class(text: &str) -> Option<String> {
    let mut classes = ERROR_CLASS.captures_iter(text).map(|c| c[1].to_string());
    if text.contains("Traceback (most recent call last)") {
        // The raised exception closes the traceback.
        classes.last()
    } else {
        classes.next()
    }
}

pub fn signal_name(sig: i32) -> String {
    Signal::try_from(sig)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{}", sig))
}

/// Crash signal of an execution: `TIMEOUT`, `SIG<NAME>`, the error class or `EXIT_<code>`.
pub fn extract_signal(r: &ExecutionResult) -> String {
    if r.timed_out {
        return "TIMEOUT".to_string();
    }
    if let Some(sig) = r.term_signal {
        return signal_name(sig);
    }
    r.error
        .as_deref()
        .and_then(error_class)
        .unwrap_or_else(|| format!("EXIT_{}", r.exit_code))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PY: &str = r#"Traceback (most recent call last):
  File "/sandbox/main.py", line 2, in <module>
    eval(input())
  File "<string>", line 1
    ;rm -rf
    ^
SyntaxError: invalid syntax"#;

    #[test]
    fn python_traceback() {
        let frames = normalize_stack(PY);
        assert_eq!(
            frames,
            vec![
                r#"File "<string>", line ?"#.to_string(),
                r#"File "main.py", line ?, in <module>"#.to_string(),
            ]
        );
        assert_eq!(error_class(PY).as_deref(), Some("SyntaxError"));
    }

    #[test]
    fn line_numbers_do_not_matter() {
        let a = PY.replace("line 2", "line 40");
        assert_eq!(normalize_stack(PY), normalize_stack(&a));
        let b = PY.replace("/sandbox/", "/tmp/sandfuzz-0b1c2d3e-aaaa-bbbb-cccc-0123456789ab/");
        assert_eq!(normalize_stack(PY), normalize_stack(&b));
    }

    #[test]
    fn java_and_recursion() {
        let mut text = String::from(
            "Exception in thread \"main\" java.lang.StackOverflowError\n",
        );
        for i in 0..100 {
            text.push_str(&format!("\tat Main.recurse(Main.java:{})\n", 10 + i % 2));
        }
        text.push_str("\tat Main.main(Main.java:3)\n");
        let frames = normalize_stack(&text);
        assert_eq!(
            frames,
            vec![
                "at Main.recurse(Main.java:?)".to_string(),
                "at Main.main(Main.java:?)".to_string()
            ]
        );
        assert_eq!(
            error_class(&text).as_deref(),
            Some("java.lang.StackOverflowError")
        );
    }

    #[test]
    fn native_addresses() {
        let text = "#0 0x7ffd1234 in crash_me+12\n#1 0x55aa0000 in main\n";
        assert_eq!(
            normalize_stack(text),
            vec!["#0 0x? in crash_me+?".to_string(), "#1 0x? in main".to_string()]
        );
    }

    #[test]
    fn signals() {
        let mut r = ExecutionResult {
            crashed: true,
            exit_code: 3,
            error: Some("something bad".into()),
            ..ExecutionResult::default()
        };
        assert_eq!(extract_signal(&r), "EXIT_3");
        r.error = Some("TypeError: x is not a function\n    at f (/sandbox/main.js:1:7)".into());
        assert_eq!(extract_signal(&r), "TypeError");
        r.term_signal = Some(11);
        assert_eq!(extract_signal(&r), "SIGSEGV");
        r.timed_out = true;
        assert_eq!(extract_signal(&r), "TIMEOUT");
    }
}
