use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::language::Toolchain;
use crate::model::Limits;

use super::{Artifact, CompileOutcome, RawExecution, SandboxError};

/// Trait for different sandbox execution implementations
///
/// This trait abstracts compiling and running user code in different
/// environments, from full isolation with `isolate` to plain process
/// execution. Every call is independent: nothing carries over between test
/// cases except the read-only [`Artifact`].
///
/// `slot` is a number handed out by the [`crate::pool::SlotPool`]; no two
/// concurrent calls receive the same one. Implementations must tear down the
/// sandboxed program when `token` is cancelled or the returned future is
/// dropped.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compiles (or syntax-checks) the source once for the whole submission
    async fn compile(
        &self,
        toolchain: &Toolchain,
        source: &str,
        slot: usize,
        token: &CancellationToken,
    ) -> Result<CompileOutcome, SandboxError>;

    /// Runs the artifact against one input under the given limits
    async fn execute(
        &self,
        artifact: &Artifact,
        input: &str,
        limits: Limits,
        slot: usize,
        token: &CancellationToken,
    ) -> Result<RawExecution, SandboxError>;
}
