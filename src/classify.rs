//! Outcome classification: output comparison and verdict derivation.

use crate::model::{ExecutionOutcome, Limits, TestCase, Usage, Verdict};
use crate::sandbox::{RawExecution, Termination};

/// Normalizes program output for comparison
///
/// Line endings are unified to `\n`, trailing whitespace is stripped from
/// every line and trailing blank lines are dropped.
pub fn normalize(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<&str> = unified.split('\n').map(str::trim_end).collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// Compares actual against expected output after normalization
///
/// The comparison is exact and case-sensitive.
pub fn classify(raw_output: &str, expected: &str) -> Verdict {
    if normalize(raw_output) == normalize(expected) {
        Verdict::Passed
    } else {
        Verdict::WrongAnswer
    }
}

/// Maps one sandboxed execution of `case` to its outcome
///
/// Limit violations take precedence over the exit status; only a clean exit
/// within both limits reaches output comparison.
pub fn judge(case: &TestCase, limits: Limits, raw: RawExecution) -> ExecutionOutcome {
    let time_limit = limits.time_ms.0;
    let memory_limit = limits.memory_kb.0;
    let diagnostic_output: Vec<String> = raw.stderr.lines().map(str::to_owned).collect();

    let time_exceeded = raw.termination == Termination::TimedOut || raw.elapsed_ms >= time_limit;
    let over_time = || {
        (
            Verdict::TimeLimitExceeded,
            time_limit,
            Some(format!("Time limit of {time_limit} ms exceeded")),
        )
    };
    let over_memory = |elapsed_ms: u64| {
        (
            Verdict::MemoryLimitExceeded,
            elapsed_ms,
            Some(format!("Memory limit of {memory_limit} KB exceeded")),
        )
    };

    let (verdict, elapsed_ms, error_detail) = match raw.termination {
        Termination::MemoryExceeded => over_memory(raw.elapsed_ms.min(time_limit)),
        _ if time_exceeded => over_time(),
        _ if raw.peak_memory_kb >= memory_limit => over_memory(raw.elapsed_ms),
        Termination::TimedOut => over_time(),
        Termination::Exited(0) => (classify(&raw.stdout, &case.expected), raw.elapsed_ms, None),
        Termination::Exited(code) => (
            Verdict::RuntimeError,
            raw.elapsed_ms,
            Some(runtime_detail(&diagnostic_output, || {
                format!("Process exited with code {code}")
            })),
        ),
        Termination::Signaled(signal) => (
            Verdict::RuntimeError,
            raw.elapsed_ms,
            Some(runtime_detail(&diagnostic_output, || {
                format!("Process killed by signal {signal}")
            })),
        ),
        Termination::OutputExceeded => (
            Verdict::RuntimeError,
            raw.elapsed_ms,
            Some("Output limit exceeded".to_string()),
        ),
    };

    ExecutionOutcome {
        index: case.index,
        raw_output: raw.stdout,
        diagnostic_output,
        usage: Usage::Measured {
            elapsed_ms,
            peak_memory_kb: raw.peak_memory_kb,
        },
        verdict,
        error_detail,
    }
}

/// Diagnostic output when there is some, a description of the exit otherwise
fn runtime_detail(diagnostics: &[String], fallback: impl FnOnce() -> String) -> String {
    let text = diagnostics.join("\n");
    match text.trim() {
        "" => fallback(),
        _ => text,
    }
}
