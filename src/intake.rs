//! Submission intake: request validation, run registry and cancellation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::aggregate::aggregate;
use crate::config::{Config, EngineConfig, KiloBytes, Millis};
use crate::create_timestamp;
use crate::error::{SubmitError, ValidationError};
use crate::language::{Language, Toolchains};
use crate::model::{RunReport, RunRequest, Submission};
use crate::pool::SlotPool;
use crate::runner::{Cancelled, TestCaseRunner};
use crate::sandbox::{SandboxSettings, create_sandbox_runner};
use crate::sink::{JsonDirSink, LogSink, ReportSink};

const MAX_RUN_ID_LEN: usize = 64;

/// Bounds a request must stay within
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub max_time: Millis,
    pub max_memory: KiloBytes,
    pub max_test_cases: usize,
    pub max_source_bytes: usize,
    pub concurrency_limit: usize,
}

impl From<&EngineConfig> for Policy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_time: config.max_time_ms,
            max_memory: config.max_memory_kb,
            max_test_cases: config.max_test_cases,
            max_source_bytes: config.max_source_bytes,
            concurrency_limit: config.concurrency_limit,
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

pub struct Intake {
    runner: TestCaseRunner,
    toolchains: Toolchains,
    policy: Policy,
    runs: Mutex<HashMap<String, CancellationToken>>,
    next_id: AtomicU64,
    sink: Arc<dyn ReportSink>,
}

impl Intake {
    pub fn new(
        runner: TestCaseRunner,
        toolchains: Toolchains,
        policy: Policy,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        Self {
            runner,
            toolchains,
            policy,
            runs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            sink,
        }
    }

    /// Builds the sandbox backend and report sink described by `config`
    ///
    /// `pool` is shared with any other intake of this process.
    pub fn from_config(config: &Config, pool: Arc<SlotPool>) -> anyhow::Result<Self> {
        let engine = &config.engine;
        let settings = SandboxSettings::from_config(engine);
        let sandbox = create_sandbox_runner(engine.sandbox, settings)?;
        let runner = TestCaseRunner::new(sandbox, pool, engine.sandbox_retries);

        let sink: Arc<dyn ReportSink> = match &engine.report_dir {
            Some(dir) => {
                log::info!("Run reports will be written to {}", dir.display());
                Arc::new(JsonDirSink::new(dir))
            }
            None => Arc::new(LogSink),
        };

        log::info!(
            "Intake ready: {} sandbox, {} slots, {} concurrent cases per run",
            runner.sandbox_name(),
            runner.pool().capacity(),
            engine.concurrency_limit
        );
        Ok(Self::new(
            runner,
            Toolchains::new(&config.languages),
            Policy::from(engine),
            sink,
        ))
    }

    pub fn languages(&self) -> Vec<Language> {
        self.toolchains.languages()
    }

    /// Ids of the runs currently in flight
    pub fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Signals the run with this id to stop; false when no such run is in flight
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.runs.lock().get(run_id) {
            Some(token) => {
                log::warn!("Cancelling run {run_id}");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Signals every run in flight to stop, returning their ids
    pub fn cancel_all(&self) -> Vec<String> {
        let ids = self.active_runs();
        for run_id in &ids {
            self.cancel(run_id);
        }
        ids
    }

    /// Checks a request against the language registry and the policy
    ///
    /// The request's `run_id` is not looked at here.
    pub fn validate(&self, request: RunRequest) -> Result<Submission, ValidationError> {
        let toolchain = request
            .language
            .parse::<Language>()
            .ok()
            .and_then(|language| self.toolchains.get(language))
            .ok_or_else(|| ValidationError::UnknownLanguage(request.language.clone()))?
            .clone();

        if request.source.trim().is_empty() {
            return Err(ValidationError::EmptySource);
        }
        if request.source.len() > self.policy.max_source_bytes {
            return Err(ValidationError::SourceTooLarge {
                size: request.source.len(),
                max: self.policy.max_source_bytes,
            });
        }

        if request.test_cases.is_empty() {
            return Err(ValidationError::NoTestCases);
        }
        if request.test_cases.len() > self.policy.max_test_cases {
            return Err(ValidationError::TooManyTestCases {
                count: request.test_cases.len(),
                max: self.policy.max_test_cases,
            });
        }
        let mut seen = HashSet::new();
        for case in &request.test_cases {
            if !seen.insert(case.index) {
                return Err(ValidationError::DuplicateIndex(case.index));
            }
            if case.input.iter().any(|line| line.contains(['\n', '\r'])) {
                return Err(ValidationError::MalformedTestCase {
                    index: case.index,
                    reason: "input lines must not contain line breaks",
                });
            }
            if case.input.iter().any(|line| line.contains('\0')) || case.expected.contains('\0') {
                return Err(ValidationError::MalformedTestCase {
                    index: case.index,
                    reason: "NUL bytes are not allowed",
                });
            }
        }

        let limits = request.limits;
        if limits.time_ms.0 == 0 || limits.memory_kb.0 == 0 {
            return Err(ValidationError::InvalidLimits);
        }
        if limits.time_ms > self.policy.max_time || limits.memory_kb > self.policy.max_memory {
            return Err(ValidationError::LimitsTooLarge {
                time: limits.time_ms,
                memory: limits.memory_kb,
                max_time: self.policy.max_time,
                max_memory: self.policy.max_memory,
            });
        }

        Ok(Submission {
            toolchain,
            source: request.source,
            test_cases: request.test_cases,
            limits,
        })
    }

    /// Grades a request and returns its report
    ///
    /// Dropping the returned future cancels the run.
    pub async fn submit(&self, mut request: RunRequest) -> Result<RunReport, SubmitError> {
        let requested_id = request.run_id.take();
        if let Some(id) = &requested_id {
            check_run_id(id)?;
        }
        let submission = Arc::new(self.validate(request)?);
        let registration = self.register(requested_id)?;
        let run_id = registration.run_id.clone();
        log::info!(
            "Run {run_id} accepted: {} with {} test cases",
            submission.toolchain.language,
            submission.test_cases.len()
        );

        let outcomes = match self
            .runner
            .run(
                Arc::clone(&submission),
                self.policy.concurrency_limit,
                &registration.token,
            )
            .await
        {
            Ok(outcomes) => outcomes,
            Err(Cancelled) => {
                log::warn!("Run {run_id} cancelled, partial results discarded");
                return Err(SubmitError::Cancelled { run_id });
            }
        };
        drop(registration);

        let mut report = aggregate(&submission.test_cases, &outcomes);
        report.stamp(&run_id, self.runner.sandbox_name(), create_timestamp());
        log::info!(
            "Run {run_id} finished with {} failed of {} cases",
            report.failed_case_count,
            report.results.len()
        );

        if let Err(e) = self.sink.deliver(&report).await {
            log::error!("Failed to hand over report of run {run_id}: {e:#}");
        }
        Ok(report)
    }

    fn register(&self, requested_id: Option<String>) -> Result<RunRegistration<'_>, ValidationError> {
        let mut runs = self.runs.lock();
        let run_id = match requested_id {
            Some(id) if runs.contains_key(&id) => return Err(ValidationError::RunIdInUse(id)),
            Some(id) => id,
            None => loop {
                let id = format!("run-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
                if !runs.contains_key(&id) {
                    break id;
                }
            },
        };

        let token = CancellationToken::new();
        runs.insert(run_id.clone(), token.clone());
        Ok(RunRegistration {
            intake: self,
            run_id,
            token,
        })
    }
}

/// Client-chosen ids end up in file names, so they are kept to a safe alphabet
fn check_run_id(id: &str) -> Result<(), ValidationError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_RUN_ID_LEN
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidRunId(id.to_string()))
    }
}

/// An in-flight run's registry entry, removed (and its run cancelled) on drop
struct RunRegistration<'a> {
    intake: &'a Intake,
    run_id: String,
    token: CancellationToken,
}

impl Drop for RunRegistration<'_> {
    fn drop(&mut self) {
        self.token.cancel();
        self.intake.runs.lock().remove(&self.run_id);
    }
}
