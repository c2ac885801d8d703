use std::collections::HashMap;

use crate::model::{
    ExecutionOutcome, PublicResult, RunReport, RunStatus, TestCase, Usage, Verdict,
};

/// Folds ordered per-case outcomes into one run report
///
/// Averages cover only the cases whose program actually ran. Hidden cases are
/// redacted: their input, expected and actual output never leave this
/// function, nor does any program-produced text about them.
pub fn aggregate(cases: &[TestCase], outcomes: &[ExecutionOutcome]) -> RunReport {
    let by_index: HashMap<u32, &TestCase> = cases.iter().map(|c| (c.index, c)).collect();

    let failed_case_count = outcomes.iter().filter(|o| !o.passed()).count() as u32;

    let measured: Vec<(u64, u64)> = outcomes
        .iter()
        .filter_map(|o| match o.usage {
            Usage::Measured {
                elapsed_ms,
                peak_memory_kb,
            } => Some((elapsed_ms, peak_memory_kb)),
            Usage::NotExecuted => None,
        })
        .collect();
    let (avg_time_ms, avg_memory_kb) = if measured.is_empty() {
        (0.0, 0.0)
    } else {
        let n = measured.len() as f64;
        let time: u64 = measured.iter().map(|(t, _)| t).sum();
        let memory: u64 = measured.iter().map(|(_, m)| m).sum();
        (time as f64 / n, memory as f64 / n)
    };

    let results = outcomes
        .iter()
        .map(|outcome| public_result(by_index.get(&outcome.index).copied(), outcome))
        .collect();

    RunReport {
        run_id: None,
        driver: None,
        timestamp: None,
        status: if failed_case_count > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Passed
        },
        avg_time_ms,
        avg_memory_kb,
        failed_case_count,
        results,
    }
}

fn public_result(case: Option<&TestCase>, outcome: &ExecutionOutcome) -> PublicResult {
    // An outcome without a known case is treated as hidden
    let is_sample = case.is_some_and(|c| c.is_sample);
    let time = outcome.usage.elapsed_ms();
    let memory = outcome.usage.peak_memory_kb();

    match case {
        Some(case) if is_sample => PublicResult {
            index: outcome.index,
            verdict: outcome.verdict,
            passed: outcome.passed(),
            is_sample,
            input: Some(case.input.clone()),
            output: Some(outcome.raw_output.clone()),
            expected: Some(case.expected.clone()),
            time,
            memory,
            error: outcome.error_detail.clone(),
            console_output: outcome.diagnostic_output.clone(),
        },
        _ => PublicResult {
            index: outcome.index,
            verdict: outcome.verdict,
            passed: outcome.passed(),
            is_sample,
            input: None,
            output: None,
            expected: None,
            time,
            memory,
            error: hidden_error(outcome),
            console_output: Vec::new(),
        },
    }
}

/// Compile diagnostics concern the submission, not the case, and stay visible
fn hidden_error(outcome: &ExecutionOutcome) -> Option<String> {
    match outcome.verdict {
        Verdict::Passed => None,
        Verdict::CompileError => outcome.error_detail.clone(),
        verdict => Some(verdict.label().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn case(index: u32, is_sample: bool) -> TestCase {
        TestCase {
            index,
            input: vec![format!("in{index}")],
            expected: format!("out{index}"),
            is_sample,
        }
    }

    fn executed(index: u32, verdict: Verdict, elapsed_ms: u64, peak_memory_kb: u64) -> ExecutionOutcome {
        ExecutionOutcome {
            index,
            raw_output: format!("actual{index}"),
            diagnostic_output: vec![format!("stderr{index}")],
            usage: Usage::Measured {
                elapsed_ms,
                peak_memory_kb,
            },
            verdict,
            error_detail: (verdict != Verdict::Passed).then(|| format!("detail{index}")),
        }
    }

    #[test]
    fn test_all_passed() {
        let cases = vec![case(0, true), case(1, false), case(2, false)];
        let outcomes = vec![
            executed(0, Verdict::Passed, 10, 1000),
            executed(1, Verdict::Passed, 20, 2000),
            executed(2, Verdict::Passed, 30, 3000),
        ];
        let report = aggregate(&cases, &outcomes);

        assert_eq!(report.status, RunStatus::Passed);
        assert_eq!(report.failed_case_count, 0);
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.avg_time_ms, 20.0);
        assert_eq!(report.avg_memory_kb, 2000.0);
        assert!(report.results.iter().all(|r| r.passed));
    }

    #[test]
    fn test_one_wrong_answer_fails_run() {
        let cases = vec![case(0, true), case(1, true), case(2, true)];
        let outcomes = vec![
            executed(0, Verdict::Passed, 10, 1000),
            executed(1, Verdict::WrongAnswer, 10, 1000),
            executed(2, Verdict::Passed, 10, 1000),
        ];
        let report = aggregate(&cases, &outcomes);

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failed_case_count, 1);
        let passed: Vec<bool> = report.results.iter().map(|r| r.passed).collect();
        assert_eq!(passed, vec![true, false, true]);
    }

    #[test]
    fn test_compile_error_excluded_from_averages() {
        let cases = vec![case(0, true), case(1, false)];
        let outcomes = vec![
            ExecutionOutcome::not_executed(0, Verdict::CompileError, "main.c:1: error"),
            ExecutionOutcome::not_executed(1, Verdict::CompileError, "main.c:1: error"),
        ];
        let report = aggregate(&cases, &outcomes);

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failed_case_count, 2);
        assert_eq!(report.avg_time_ms, 0.0);
        assert_eq!(report.avg_memory_kb, 0.0);
        for result in &report.results {
            assert!(!result.passed);
            assert_eq!(result.error.as_deref(), Some("main.c:1: error"));
            assert_eq!((result.time, result.memory), (0, 0));
        }
    }

    #[test]
    fn test_internal_errors_excluded_from_averages() {
        let cases = vec![case(0, true), case(1, true)];
        let outcomes = vec![
            executed(0, Verdict::Passed, 40, 4000),
            ExecutionOutcome::not_executed(1, Verdict::InternalError, "isolate --init failed"),
        ];
        let report = aggregate(&cases, &outcomes);

        assert_eq!(report.failed_case_count, 1);
        assert_eq!(report.avg_time_ms, 40.0);
        assert_eq!(report.avg_memory_kb, 4000.0);
    }

    #[test]
    fn test_hidden_cases_are_redacted() {
        let cases = vec![case(0, true), case(1, false)];
        let outcomes = vec![
            executed(0, Verdict::WrongAnswer, 10, 1000),
            executed(1, Verdict::RuntimeError, 10, 1000),
        ];
        let report = aggregate(&cases, &outcomes);

        let sample = &report.results[0];
        assert_eq!(sample.input, Some(vec!["in0".to_string()]));
        assert_eq!(sample.output.as_deref(), Some("actual0"));
        assert_eq!(sample.expected.as_deref(), Some("out0"));
        assert_eq!(sample.error.as_deref(), Some("detail0"));
        assert_eq!(sample.console_output, vec!["stderr0".to_string()]);

        let hidden = &report.results[1];
        assert_eq!(
            hidden,
            &PublicResult {
                index: 1,
                verdict: Verdict::RuntimeError,
                passed: false,
                is_sample: false,
                input: None,
                output: None,
                expected: None,
                time: 10,
                memory: 1000,
                error: Some("Runtime Error".to_string()),
                console_output: vec![],
            }
        );

        let json = serde_json::to_value(hidden).unwrap();
        assert!(json.get("input").is_none());
        assert!(json.get("expected").is_none());
        assert!(json.get("output").is_none());
    }
}
