use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{KiloBytes, Millis};
use crate::language::Toolchain;

/// One graded (input, expected output) pair
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub index: u32,
    pub input: Vec<String>,
    pub expected: String,
    #[serde(default)]
    pub is_sample: bool,
}

impl TestCase {
    /// The program's standard input: one line per input entry
    pub fn stdin(&self) -> String {
        let mut stdin = self.input.join("\n");
        if !stdin.is_empty() {
            stdin.push('\n');
        }
        stdin
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    pub time_ms: Millis,
    pub memory_kb: KiloBytes,
}

/// Request accepted by the intake, as sent by calling services
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    pub language: String,
    pub source: String,
    pub test_cases: Vec<TestCase>,
    pub limits: Limits,
}

/// A validated request, immutable once accepted
#[derive(Debug, Clone)]
pub struct Submission {
    pub toolchain: Toolchain,
    pub source: String,
    pub test_cases: Vec<TestCase>,
    pub limits: Limits,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Passed,
    WrongAnswer,
    RuntimeError,
    CompileError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    InternalError,
}

impl Verdict {
    pub fn label(self) -> &'static str {
        match self {
            Verdict::Passed => "Passed",
            Verdict::WrongAnswer => "Wrong Answer",
            Verdict::RuntimeError => "Runtime Error",
            Verdict::CompileError => "Compile Error",
            Verdict::TimeLimitExceeded => "Time Limit Exceeded",
            Verdict::MemoryLimitExceeded => "Memory Limit Exceeded",
            Verdict::InternalError => "Internal Error",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Resource usage of one test case
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    Measured { elapsed_ms: u64, peak_memory_kb: u64 },
    /// The program never ran for this case (compile failure, sandbox failure)
    NotExecuted,
}

impl Usage {
    pub fn elapsed_ms(self) -> u64 {
        match self {
            Usage::Measured { elapsed_ms, .. } => elapsed_ms,
            Usage::NotExecuted => 0,
        }
    }

    pub fn peak_memory_kb(self) -> u64 {
        match self {
            Usage::Measured { peak_memory_kb, .. } => peak_memory_kb,
            Usage::NotExecuted => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub index: u32,
    pub raw_output: String,
    pub diagnostic_output: Vec<String>,
    pub usage: Usage,
    pub verdict: Verdict,
    pub error_detail: Option<String>,
}

impl ExecutionOutcome {
    /// Outcome for a case whose program was never executed
    pub fn not_executed(index: u32, verdict: Verdict, error_detail: impl Into<String>) -> Self {
        Self {
            index,
            raw_output: String::new(),
            diagnostic_output: Vec::new(),
            usage: Usage::NotExecuted,
            verdict,
            error_detail: Some(error_detail.into()),
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Passed
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Passed,
    Failed,
}

/// Externally visible result of one test case
///
/// Hidden cases never carry their input, expected or actual output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicResult {
    pub index: u32,
    pub verdict: Verdict,
    pub passed: bool,
    pub is_sample: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    pub time: u64,
    pub memory: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub console_output: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunReport {
    #[serde(rename = "runId", skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Sandbox backend that executed the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(rename = "STATUS")]
    pub status: RunStatus,
    #[serde(rename = "avgTime")]
    pub avg_time_ms: f64,
    #[serde(rename = "avgMemory")]
    pub avg_memory_kb: f64,
    #[serde(rename = "failedCaseNo")]
    pub failed_case_count: u32,
    pub results: Vec<PublicResult>,
}

impl RunReport {
    /// Attaches the run identity once the run has finished
    pub fn stamp(&mut self, run_id: &str, driver: &str, timestamp: String) {
        self.run_id = Some(run_id.to_string());
        self.driver = Some(driver.to_string());
        self.timestamp = Some(timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdin_joins_lines() {
        let case = TestCase {
            index: 0,
            input: vec!["3".to_string(), "1 2 3".to_string()],
            expected: String::new(),
            is_sample: true,
        };
        assert_eq!(case.stdin(), "3\n1 2 3\n");

        let empty = TestCase {
            input: vec![],
            ..case
        };
        assert_eq!(empty.stdin(), "");
    }

    #[test]
    fn test_request_deserialization() {
        let json = r#"{
            "language": "python",
            "source": "print(input())",
            "testCases": [{ "index": 0, "input": ["1"], "expected": "1", "isSample": true }],
            "limits": { "timeMs": 1000, "memoryKb": 65536 }
        }"#;
        let request: RunRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.run_id, None);
        assert_eq!(request.limits.time_ms, Millis(1000));
        assert_eq!(request.limits.memory_kb, KiloBytes(65536));
        assert!(request.test_cases[0].is_sample);
    }

    #[test]
    fn test_verdict_serialization() {
        assert_eq!(
            serde_json::to_string(&Verdict::TimeLimitExceeded).unwrap(),
            r#""TIME_LIMIT_EXCEEDED""#
        );
        assert_eq!(serde_json::to_string(&RunStatus::Failed).unwrap(), r#""FAILED""#);
    }
}
