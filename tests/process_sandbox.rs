#![cfg(target_os = "linux")]

use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use grader::config::{Config, KiloBytes, Millis, SandboxKind};
use grader::error::SubmitError;
use grader::intake::Intake;
use grader::model::{Limits, RunRequest, RunStatus, TestCase, Verdict};
use grader::pool::SlotPool;

const ADD: &str = r#"read a b
echo $((a + b))"#;

fn create_intake(slots: usize) -> (Arc<Intake>, TempDir) {
    create_intake_with(slots, |_| {})
}

fn create_intake_with(slots: usize, configure: impl FnOnce(&mut Config)) -> (Arc<Intake>, TempDir) {
    let work_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.engine.sandbox = SandboxKind::Process;
    config.engine.work_dir = Some(work_dir.path().to_path_buf());
    config.engine.concurrency_limit = slots;
    configure(&mut config);

    let intake = Intake::from_config(&config, SlotPool::new(slots)).unwrap();
    (Arc::new(intake), work_dir)
}

fn case(index: u32, input: &str, expected: &str, is_sample: bool) -> TestCase {
    TestCase {
        index,
        input: vec![input.to_string()],
        expected: expected.to_string(),
        is_sample,
    }
}

fn bash_request(source: &str, test_cases: Vec<TestCase>, time_ms: u64) -> RunRequest {
    RunRequest {
        run_id: None,
        language: "bash".to_string(),
        source: source.to_string(),
        test_cases,
        limits: Limits {
            time_ms: Millis(time_ms),
            memory_kb: KiloBytes(262_144),
        },
    }
}

fn verdicts(report: &grader::model::RunReport) -> Vec<Verdict> {
    report.results.iter().map(|r| r.verdict).collect()
}

/// Whether `pid` names a process that has not exited yet
fn is_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| !matches!(rest.trim_start().chars().next(), Some('Z' | 'X'))),
        Err(_) => false,
    }
}

async fn wait_until_gone(pid: u32) -> bool {
    for _ in 0..100 {
        if !is_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_all_cases_pass() {
    let (intake, _work_dir) = create_intake(2);
    let request = bash_request(
        ADD,
        vec![
            case(0, "1 2", "3", true),
            case(1, "5 5", "10", false),
            case(2, "-4 4", "0", false),
        ],
        2000,
    );

    let report = intake.submit(request).await.unwrap();

    assert_eq!(report.status, RunStatus::Passed);
    assert_eq!(report.failed_case_count, 0);
    assert_eq!(report.results.len(), 3);
    assert_eq!(report.results[0].output.as_deref(), Some("3\n"));
    assert!(report.results.iter().all(|r| r.memory > 0));
}

#[tokio::test]
async fn test_wrong_answer_and_runtime_error() {
    let (intake, _work_dir) = create_intake(2);
    let source = r#"read a b
if [ "$a" = "crash" ]; then
    echo "bad input" >&2
    exit 3
fi
echo $((a + b))"#;
    let request = bash_request(
        source,
        vec![
            case(0, "1 2", "3", true),
            case(1, "1 2", "4", true),
            case(2, "crash 0", "0", true),
        ],
        2000,
    );

    let report = intake.submit(request).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failed_case_count, 2);
    assert_eq!(
        verdicts(&report),
        vec![Verdict::Passed, Verdict::WrongAnswer, Verdict::RuntimeError]
    );
    assert_eq!(report.results[2].error.as_deref(), Some("bad input"));
    assert_eq!(report.results[2].console_output, vec!["bad input".to_string()]);
}

#[tokio::test]
async fn test_infinite_loop_does_not_affect_sibling() {
    let (intake, _work_dir) = create_intake(2);
    let source = r#"read n
if [ "$n" = "loop" ]; then
    while :; do :; done
fi
echo "$n""#;
    let request = bash_request(
        source,
        vec![case(0, "loop", "loop", true), case(1, "7", "7", true)],
        500,
    );

    let report = intake.submit(request).await.unwrap();

    assert_eq!(
        verdicts(&report),
        vec![Verdict::TimeLimitExceeded, Verdict::Passed]
    );
    assert_eq!(report.results[0].time, 500);
    assert!(!report.results[0].passed);
    assert!(report.results[1].time < 500);
}

#[tokio::test]
async fn test_compile_error_skips_every_case() {
    let (intake, _work_dir) = create_intake(2);
    let request = bash_request(
        "if then fi (",
        vec![case(0, "1 2", "3", true), case(1, "2 2", "4", false)],
        1000,
    );

    let report = intake.submit(request).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failed_case_count, 2);
    assert_eq!(
        verdicts(&report),
        vec![Verdict::CompileError, Verdict::CompileError]
    );
    assert_eq!(report.avg_time_ms, 0.0);
    assert_eq!(report.avg_memory_kb, 0.0);
    assert!(report.results[0].error.is_some());
    assert_eq!(report.results[0].error, report.results[1].error);
}

#[tokio::test]
async fn test_cancellation_kills_running_program() {
    let (intake, _work_dir) = create_intake(2);
    let mut request = bash_request(
        "sleep 30",
        vec![case(0, "", "", true), case(1, "", "", true)],
        10_000,
    );
    request.run_id = Some("slow".to_string());

    let running = tokio::spawn({
        let intake = intake.clone();
        async move { intake.submit(request).await }
    });
    // Let compilation finish and the sleeps start
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    assert!(intake.cancel("slow"));
    let result = running.await.unwrap();

    assert_eq!(
        result,
        Err(SubmitError::Cancelled {
            run_id: "slow".to_string()
        })
    );
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(intake.active_runs().is_empty());
}

#[tokio::test]
async fn test_cancelled_run_leaves_no_program_behind() {
    let (intake, work_dir) = create_intake(1);
    let pid_file = work_dir.path().join("program.pid");
    let source = format!("echo $$ > {}\nexec sleep 30", pid_file.display());
    let request = bash_request(&source, vec![case(0, "", "", true)], 10_000);

    let running = tokio::spawn({
        let intake = intake.clone();
        async move { intake.submit(request).await }
    });
    let mut pid = None;
    for _ in 0..500 {
        pid = std::fs::read_to_string(&pid_file)
            .ok()
            .and_then(|text| text.trim().parse::<u32>().ok());
        if pid.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let pid = pid.unwrap();
    assert!(is_alive(pid));

    assert_eq!(intake.cancel_all().len(), 1);
    assert!(matches!(
        running.await.unwrap(),
        Err(SubmitError::Cancelled { .. })
    ));
    // Gone by the time the run reports its cancellation
    assert!(!is_alive(pid));
}

#[tokio::test]
async fn test_escaped_descendant_does_not_hold_the_case() {
    let (intake, _work_dir) = create_intake(1);
    let source = "setsid sleep 6 &\necho $! >&2\nsleep 0.2\necho 1";
    let request = bash_request(source, vec![case(0, "", "1", true)], 500);

    let started = Instant::now();
    let report = intake.submit(request).await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(2500));
    assert_eq!(verdicts(&report), vec![Verdict::Passed]);
    let escaped: u32 = report.results[0].console_output[0].trim().parse().unwrap();
    assert!(wait_until_gone(escaped).await);
}

#[tokio::test]
async fn test_memory_hog_is_stopped() {
    let (intake, _work_dir) = create_intake(1);
    let source = r#"s=x
for i in $(seq 1 26); do s="$s$s"; done
echo ${#s}"#;
    let mut request = bash_request(source, vec![case(0, "", "67108864", true)], 5000);
    request.limits.memory_kb = KiloBytes(20_000);

    let report = intake.submit(request).await.unwrap();

    assert_eq!(verdicts(&report), vec![Verdict::MemoryLimitExceeded]);
    assert!(report.results[0].memory >= 20_000);
    assert_eq!(
        report.results[0].error.as_deref(),
        Some("Memory limit of 20000 KB exceeded")
    );
}

#[tokio::test]
async fn test_output_flood_is_cut_off() {
    let (intake, _work_dir) = create_intake_with(1, |config| {
        config.engine.max_output_kb = KiloBytes(64);
    });
    let request = bash_request("yes", vec![case(0, "", "y", true)], 5000);

    let started = Instant::now();
    let report = intake.submit(request).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(verdicts(&report), vec![Verdict::RuntimeError]);
    assert_eq!(
        report.results[0].error.as_deref(),
        Some("Output limit exceeded")
    );
    assert!(report.results[0].output.as_ref().unwrap().len() <= 64 * 1024);
}
