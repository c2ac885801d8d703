//! Test case runner: compiles a submission once and fans its cases out to
//! the sandbox with bounded concurrency.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::classify;
use crate::model::{ExecutionOutcome, Submission, TestCase, Verdict};
use crate::pool::SlotPool;
use crate::sandbox::{Artifact, CompileOutcome, SandboxError, SandboxRunner};

/// The run was cancelled before every case finished
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("run was cancelled")]
pub struct Cancelled;

/// Result of the compile step for a whole submission
enum Prepared {
    Ready(Arc<Artifact>),
    /// Every case gets the same verdict and detail without running
    Rejected(Verdict, String),
}

#[derive(Clone)]
pub struct TestCaseRunner {
    sandbox: Arc<dyn SandboxRunner>,
    pool: Arc<SlotPool>,
    retries: u32,
}

impl TestCaseRunner {
    /// `retries` is how many extra attempts a sandbox start failure gets
    pub fn new(sandbox: Arc<dyn SandboxRunner>, pool: Arc<SlotPool>, retries: u32) -> Self {
        Self {
            sandbox,
            pool,
            retries,
        }
    }

    pub fn sandbox_name(&self) -> &'static str {
        self.sandbox.name()
    }

    pub fn pool(&self) -> &Arc<SlotPool> {
        &self.pool
    }

    /// Runs every case of `submission`, returning one outcome per case ordered
    /// by index
    ///
    /// At most `concurrency_limit` cases of this run execute at once, further
    /// bounded by the free slots of the shared pool. A single case failing, for
    /// whatever reason, never prevents the others from being judged.
    pub async fn run(
        &self,
        submission: Arc<Submission>,
        concurrency_limit: usize,
        token: &CancellationToken,
    ) -> Result<Vec<ExecutionOutcome>, Cancelled> {
        let artifact = match self.prepare(&submission, token).await? {
            Prepared::Ready(artifact) => artifact,
            Prepared::Rejected(verdict, detail) => {
                log::info!(
                    "{} submission not executed: {}",
                    submission.toolchain.language,
                    verdict
                );
                let mut outcomes: Vec<_> = submission
                    .test_cases
                    .iter()
                    .map(|case| ExecutionOutcome::not_executed(case.index, verdict, detail.clone()))
                    .collect();
                outcomes.sort_by_key(|o| o.index);
                return Ok(outcomes);
            }
        };

        let semaphore = Arc::new(Semaphore::new(concurrency_limit.max(1)));
        let mut tasks = JoinSet::new();
        for position in 0..submission.test_cases.len() {
            let runner = self.clone();
            let submission = Arc::clone(&submission);
            let artifact = Arc::clone(&artifact);
            let semaphore = Arc::clone(&semaphore);
            let token = token.clone();
            tasks.spawn(async move {
                let case = &submission.test_cases[position];
                let _permit = tokio::select! {
                    _ = token.cancelled() => return Err(Cancelled),
                    permit = semaphore.acquire_owned() => permit.map_err(|_| Cancelled)?,
                };
                runner
                    .run_case(case, &submission, &artifact, &token)
                    .await
            });
        }

        let mut outcomes = Vec::with_capacity(submission.test_cases.len());
        loop {
            let joined = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                joined = tasks.join_next() => match joined {
                    Some(joined) => Some(joined),
                    None => break,
                },
            };
            match joined {
                Some(Ok(Ok(outcome))) => outcomes.push(outcome),
                Some(Err(e)) => log::error!("Test case task failed: {e}"),
                None | Some(Ok(Err(Cancelled))) => {
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    return Err(Cancelled);
                }
            }
        }

        fill_missing(&submission.test_cases, &mut outcomes);
        outcomes.sort_by_key(|o| o.index);
        Ok(outcomes)
    }

    async fn prepare(
        &self,
        submission: &Submission,
        token: &CancellationToken,
    ) -> Result<Prepared, Cancelled> {
        let sandbox = &self.sandbox;
        let compiled = self
            .with_retries("compile", token, move |slot| {
                sandbox.compile(&submission.toolchain, &submission.source, slot, token)
            })
            .await?;

        Ok(match compiled {
            Ok(CompileOutcome::Compiled(artifact)) => Prepared::Ready(Arc::new(artifact)),
            Ok(CompileOutcome::Failed { diagnostics }) => {
                Prepared::Rejected(Verdict::CompileError, diagnostics)
            }
            Err(detail) => Prepared::Rejected(Verdict::InternalError, detail),
        })
    }

    async fn run_case(
        &self,
        case: &TestCase,
        submission: &Submission,
        artifact: &Artifact,
        token: &CancellationToken,
    ) -> Result<ExecutionOutcome, Cancelled> {
        let sandbox = &self.sandbox;
        let stdin = case.stdin();
        let input = stdin.as_str();
        let limits = submission.limits;
        let executed = self
            .with_retries("execute", token, move |slot| {
                sandbox.execute(artifact, input, limits, slot, token)
            })
            .await?;

        let outcome = match executed {
            Ok(raw) => classify::judge(case, limits, raw),
            Err(detail) => ExecutionOutcome::not_executed(case.index, Verdict::InternalError, detail),
        };
        log::debug!("Test case {} finished: {}", case.index, outcome.verdict);
        Ok(outcome)
    }

    /// Runs `attempt` on a pooled slot, retrying sandbox start failures
    ///
    /// The inner `Err` is the description of the last failure once all
    /// attempts are used up.
    async fn with_retries<T, F, Fut>(
        &self,
        what: &str,
        token: &CancellationToken,
        mut attempt: F,
    ) -> Result<Result<T, String>, Cancelled>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, SandboxError>>,
    {
        let mut failures = 0;
        loop {
            let slot = tokio::select! {
                _ = token.cancelled() => return Err(Cancelled),
                slot = self.pool.acquire() => slot,
            };
            match attempt(slot.id()).await {
                Ok(value) => return Ok(Ok(value)),
                Err(SandboxError::Cancelled) => return Err(Cancelled),
                Err(SandboxError::Start(e)) if failures < self.retries => {
                    failures += 1;
                    log::warn!(
                        "Sandbox {what} failed in slot {} (attempt {failures}), retrying: {e:#}",
                        slot.id()
                    );
                }
                Err(SandboxError::Start(e)) => {
                    log::error!("Sandbox {what} failed in slot {}, giving up: {e:#}", slot.id());
                    return Ok(Err(format!("{e:#}")));
                }
            }
        }
    }
}

/// Gives every case that produced no outcome an internal error
fn fill_missing(cases: &[TestCase], outcomes: &mut Vec<ExecutionOutcome>) {
    let seen: HashSet<u32> = outcomes.iter().map(|o| o.index).collect();
    for case in cases.iter().filter(|c| !seen.contains(&c.index)) {
        outcomes.push(ExecutionOutcome::not_executed(
            case.index,
            Verdict::InternalError,
            "Test case execution aborted",
        ));
    }
}
