mod isolate_runner;
mod process_runner;
mod runner;

pub use isolate_runner::IsolateRunner;
pub use process_runner::ProcessRunner;
pub use runner::SandboxRunner;

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use tempfile::TempDir;
use thiserror::Error;

use crate::config::{EngineConfig, KiloBytes, Millis, SandboxKind};
use crate::language::Language;

/// Failure of the sandbox itself, as opposed to the program it runs
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("sandbox failed to start: {0:#}")]
    Start(anyhow::Error),
    #[error("execution was cancelled")]
    Cancelled,
}

/// How a sandboxed process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    /// Killed by the sandbox after the wall-clock or CPU limit
    TimedOut,
    /// Killed by the sandbox after crossing the memory ceiling
    MemoryExceeded,
    /// Killed by the sandbox after writing more than the output cap
    OutputExceeded,
}

/// Everything one sandboxed execution produced, before any judging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawExecution {
    pub stdout: String,
    pub stderr: String,
    pub elapsed_ms: u64,
    pub peak_memory_kb: u64,
    pub termination: Termination,
}

/// Compiled form of a submission, shared read-only by all of its test cases
///
/// The backing directory is removed when the artifact is dropped.
#[derive(Debug)]
pub struct Artifact {
    dir: TempDir,
    language: Language,
    run_command: Vec<String>,
}

impl Artifact {
    pub fn new(dir: TempDir, language: Language, run_command: Vec<String>) -> Self {
        Self {
            dir,
            language,
            run_command,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn run_command(&self) -> &[String] {
        &self.run_command
    }

    /// Copies the artifact's files into a fresh execution directory
    pub(crate) fn install_into(&self, target: &Path) -> Result<()> {
        copy_files(self.path(), target, &[])
    }
}

#[derive(Debug)]
pub enum CompileOutcome {
    Compiled(Artifact),
    Failed { diagnostics: String },
}

/// Settings shared by every sandbox backend
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub work_dir: PathBuf,
    pub compile_time: Millis,
    pub compile_memory: KiloBytes,
    pub max_output: KiloBytes,
    pub isolate_network: bool,
    pub isolate_binary: String,
    pub isolate_dirs: Vec<String>,
}

impl SandboxSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            work_dir: config.resolve_work_dir(),
            compile_time: config.compile_time_ms,
            compile_memory: config.compile_memory_kb,
            max_output: config.max_output_kb,
            isolate_network: config.process.isolate_network,
            isolate_binary: config.isolate.binary.clone(),
            isolate_dirs: config.isolate.dirs.clone(),
        }
    }

    pub(crate) fn max_output_bytes(&self) -> usize {
        usize::try_from(self.max_output.as_bytes()).unwrap_or(usize::MAX)
    }

    pub(crate) fn create_work_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.work_dir)?;
        Ok(())
    }

    pub(crate) fn scratch_dir(&self, prefix: &str) -> Result<TempDir> {
        Ok(tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.work_dir)?)
    }
}

/// Creates the sandbox backend selected by the configuration
///
/// `Auto` picks `isolate` when its binary answers `--version` and falls back
/// to plain process execution, which provides no kernel isolation.
pub fn create_sandbox_runner(
    kind: SandboxKind,
    settings: SandboxSettings,
) -> Result<Arc<dyn SandboxRunner>> {
    let kind = match kind {
        SandboxKind::Auto if isolate_available(&settings.isolate_binary) => SandboxKind::Isolate,
        SandboxKind::Auto => SandboxKind::Process,
        other => other,
    };

    match kind {
        SandboxKind::Isolate => {
            log::info!("Creating IsolateRunner (full isolation mode)");
            Ok(Arc::new(IsolateRunner::build(settings)?))
        }
        _ => {
            log::info!("Creating ProcessRunner (no isolation)");
            Ok(Arc::new(ProcessRunner::build(settings)?))
        }
    }
}

fn isolate_available(binary: &str) -> bool {
    std::process::Command::new(binary)
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Copies the regular files of `from` into `to`, skipping the names in `skip`
pub(crate) fn copy_files(from: &Path, to: &Path, skip: &[&str]) -> Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if skip.iter().any(|s| name.as_os_str() == *s) {
            continue;
        }
        fs::copy(entry.path(), to.join(&name))?;
    }
    Ok(())
}

/// Reads at most `cap` bytes of a file, lossily decoded
pub(crate) fn read_capped(path: &Path, cap: usize) -> Result<String> {
    let file = fs::File::open(path)?;
    let mut buf = Vec::new();
    file.take(cap as u64).read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Splits a program argument vector into program and arguments
pub(crate) fn split_command(command: &[String]) -> Result<(&String, &[String])> {
    match command.split_first() {
        Some(parts) => Ok(parts),
        None => bail!("Empty command"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_files_skips_names_and_directories() {
        let from = tempfile::tempdir().unwrap();
        let to = tempfile::tempdir().unwrap();
        fs::write(from.path().join("main"), "bin").unwrap();
        fs::write(from.path().join("compile.out"), "log").unwrap();
        fs::create_dir(from.path().join("nested")).unwrap();

        copy_files(from.path(), to.path(), &["compile.out"]).unwrap();

        assert!(to.path().join("main").exists());
        assert!(!to.path().join("compile.out").exists());
        assert!(!to.path().join("nested").exists());
    }

    #[test]
    fn test_read_capped_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        fs::write(&path, "0123456789").unwrap();
        assert_eq!(read_capped(&path, 4).unwrap(), "0123");
        assert_eq!(read_capped(&path, 100).unwrap(), "0123456789");
    }

    #[test]
    fn test_split_command() {
        let command = vec!["python3".to_string(), "main.py".to_string()];
        let (program, args) = split_command(&command).unwrap();
        assert_eq!(program, "python3");
        assert_eq!(args, ["main.py".to_string()]);
        assert!(split_command(&[]).is_err());
    }
}
