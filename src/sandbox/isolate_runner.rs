use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{KiloBytes, Millis};
use crate::language::{Language, Toolchain};
use crate::model::Limits;

use super::{
    Artifact, CompileOutcome, RawExecution, SandboxError, SandboxRunner, SandboxSettings,
    Termination, copy_files, read_capped,
};

// Sandbox configuration constants
const COMPILE_PROCESSES: u32 = 10;
const COMPILE_OPEN_FILES: u32 = 512;
const COMPILE_FILE_SIZE: u32 = 65536; // KB

const RUNTIME_PROCESSES: u32 = 4;
const JVM_PROCESSES: u32 = 64;
const RUNTIME_OPEN_FILES: u32 = 64;
const RUNTIME_FILE_SIZE: u32 = 16384; // KB

// Extra wall time before isolate kills a program, so overruns are measured
const WALL_TIME_SLACK: Millis = Millis(500);

// Meta directory permissions
const META_DIR_PERMISSIONS: u32 = 0o700;

const SANDBOX_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const COMPILE_OUTPUT_FILE: &str = "compile_output.txt";
const INPUT_FILE: &str = "input.txt";
const STDOUT_FILE: &str = "stdout.txt";
const STDERR_FILE: &str = "stderr.txt";

/// A sandbox backend that compiles and executes code using Linux `isolate`
///
/// Each slot maps to one isolate box. A box is initialised before and
/// cleaned up after every compile or execution, so nothing survives from one
/// test case to the next.
pub struct IsolateRunner {
    settings: SandboxSettings,
    /// Host directory for isolate meta files, outside any box
    meta_dir: PathBuf,
    /// One lock per box, held from `--init` until `--cleanup` has finished
    boxes: Mutex<HashMap<usize, Arc<tokio::sync::Mutex<()>>>>,
}

/// Parameters of one `isolate --run` invocation
struct IsolateRun<'a> {
    command: &'a [String],
    cpu_time: Millis,
    wall_time: Millis,
    memory: KiloBytes,
    processes: u32,
    open_files: u32,
    file_size_kb: u32,
    stdin: Option<&'static str>,
    stdout: &'static str,
    /// `None` merges stderr into stdout
    stderr: Option<&'static str>,
}

#[async_trait]
impl SandboxRunner for IsolateRunner {
    fn name(&self) -> &'static str {
        "isolate"
    }

    async fn compile(
        &self,
        toolchain: &Toolchain,
        source: &str,
        slot: usize,
        token: &CancellationToken,
    ) -> Result<CompileOutcome, SandboxError> {
        let source_text = format!("{source}\n");
        let Some(command) = toolchain.compile_command() else {
            let dir = self
                .settings
                .scratch_dir("artifact-")
                .map_err(SandboxError::Start)?;
            fs::write(dir.path().join(&toolchain.source_file), source_text)
                .map_err(|e| SandboxError::Start(e.into()))?;
            return Ok(CompileOutcome::Compiled(Artifact::new(
                dir,
                toolchain.language,
                toolchain.run_command(),
            )));
        };

        let sandbox = self.init_box(slot).await.map_err(SandboxError::Start)?;
        fs::write(sandbox.dir.join(&toolchain.source_file), source_text)
            .map_err(|e| SandboxError::Start(e.into()))?;

        let time = self.settings.compile_time;
        let meta = self
            .run_in_box(
                &sandbox,
                IsolateRun {
                    command: &command,
                    cpu_time: time,
                    wall_time: time,
                    memory: self.settings.compile_memory,
                    processes: COMPILE_PROCESSES,
                    open_files: COMPILE_OPEN_FILES,
                    file_size_kb: COMPILE_FILE_SIZE,
                    stdin: None,
                    stdout: COMPILE_OUTPUT_FILE,
                    stderr: None,
                },
                token,
            )
            .await?;

        let termination = meta
            .termination()
            .map_err(|message| SandboxError::Start(anyhow!(message)))?;
        let outcome = match termination {
            Termination::Exited(0) => {
                let dir = self
                    .settings
                    .scratch_dir("artifact-")
                    .map_err(SandboxError::Start)?;
                copy_files(&sandbox.dir, dir.path(), &[COMPILE_OUTPUT_FILE])
                    .map_err(SandboxError::Start)?;
                CompileOutcome::Compiled(Artifact::new(
                    dir,
                    toolchain.language,
                    toolchain.run_command(),
                ))
            }
            Termination::TimedOut => CompileOutcome::Failed {
                diagnostics: format!("Compilation exceeded the time limit of {} ms", time.0),
            },
            Termination::MemoryExceeded => CompileOutcome::Failed {
                diagnostics: format!(
                    "Compilation exceeded the memory limit of {} KB",
                    self.settings.compile_memory.0
                ),
            },
            other => {
                let output = read_capped(
                    &sandbox.dir.join(COMPILE_OUTPUT_FILE),
                    self.settings.max_output_bytes(),
                )
                .unwrap_or_default();
                let diagnostics = match output.trim_end() {
                    "" => format!("Compiler failed: {other:?}"),
                    text => text.to_string(),
                };
                CompileOutcome::Failed { diagnostics }
            }
        };
        sandbox.release().await;
        Ok(outcome)
    }

    async fn execute(
        &self,
        artifact: &Artifact,
        input: &str,
        limits: Limits,
        slot: usize,
        token: &CancellationToken,
    ) -> Result<RawExecution, SandboxError> {
        let sandbox = self.init_box(slot).await.map_err(SandboxError::Start)?;
        artifact
            .install_into(&sandbox.dir)
            .map_err(SandboxError::Start)?;
        fs::write(sandbox.dir.join(INPUT_FILE), input)
            .map_err(|e| SandboxError::Start(e.into()))?;

        let meta = self
            .run_in_box(
                &sandbox,
                IsolateRun {
                    command: artifact.run_command(),
                    cpu_time: limits.time_ms,
                    wall_time: Millis(limits.time_ms.0 + WALL_TIME_SLACK.0),
                    memory: limits.memory_kb,
                    processes: process_limit(artifact.language()),
                    open_files: RUNTIME_OPEN_FILES,
                    file_size_kb: RUNTIME_FILE_SIZE,
                    stdin: Some(INPUT_FILE),
                    stdout: STDOUT_FILE,
                    stderr: Some(STDERR_FILE),
                },
                token,
            )
            .await?;

        let termination = meta
            .termination()
            .map_err(|message| SandboxError::Start(anyhow!(message)))?;
        let cap = self.settings.max_output_bytes();

        let raw = RawExecution {
            stdout: read_capped(&sandbox.dir.join(STDOUT_FILE), cap).unwrap_or_default(),
            stderr: read_capped(&sandbox.dir.join(STDERR_FILE), cap).unwrap_or_default(),
            elapsed_ms: meta.time_wall_ms,
            peak_memory_kb: meta.peak_memory_kb(),
            termination,
        };
        sandbox.release().await;
        Ok(raw)
    }
}

impl IsolateRunner {
    pub fn build(settings: SandboxSettings) -> Result<Self> {
        settings.create_work_dir()?;
        let meta_dir = settings.work_dir.join("isolate-meta");
        fs::create_dir_all(&meta_dir)?;
        fs::set_permissions(&meta_dir, fs::Permissions::from_mode(META_DIR_PERMISSIONS))?;

        let version = Command::new(&settings.isolate_binary)
            .arg("--version")
            .output()
            .map_err(|e| anyhow!("Failed to spawn {} --version: {}", settings.isolate_binary, e))?;
        if !version.status.success() {
            bail!("{} --version exited with non-zero status", settings.isolate_binary);
        }

        log::info!("IsolateRunner initialized successfully");
        Ok(Self::new(settings, meta_dir))
    }

    fn new(settings: SandboxSettings, meta_dir: PathBuf) -> Self {
        Self {
            settings,
            meta_dir,
            boxes: Mutex::new(HashMap::new()),
        }
    }

    /// Initializes the box of a slot and returns a handle that cleans it up
    ///
    /// Waits until a previous cleanup of the same box has finished.
    async fn init_box(&self, slot: usize) -> Result<BoxHandle> {
        let lock = Arc::clone(self.boxes.lock().entry(slot).or_default());
        let claim = lock.lock_owned().await;

        let output = tokio::process::Command::new(&self.settings.isolate_binary)
            .arg("-b")
            .arg(slot.to_string())
            .arg("--cg")
            .arg("--init")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| anyhow!("Failed to spawn isolate --init: {}", e))?;

        // Clean up even when init half-succeeded
        let mut handle = BoxHandle {
            binary: self.settings.isolate_binary.clone(),
            id: slot,
            dir: PathBuf::new(),
            claim: Some(claim),
        };

        if !output.status.success() {
            bail!(
                "isolate --init exited with non-zero status; stderr={}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let root_dir_absolute = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if root_dir_absolute.is_empty() {
            bail!(
                "isolate --init produced empty stdout; stderr={}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        log::debug!("Isolate box {slot} initialized at {root_dir_absolute}");
        handle.dir = PathBuf::from(root_dir_absolute).join("box");
        Ok(handle)
    }

    /// Runs one command inside an initialized box and parses its meta file
    async fn run_in_box(
        &self,
        sandbox: &BoxHandle,
        run: IsolateRun<'_>,
        token: &CancellationToken,
    ) -> Result<Meta, SandboxError> {
        let meta_file = tempfile::Builder::new()
            .prefix(&format!("box{}-", sandbox.id))
            .suffix(".meta")
            .tempfile_in(&self.meta_dir)
            .map_err(|e| SandboxError::Start(e.into()))?;
        let args = self.isolate_args(sandbox.id, &run, meta_file.path());
        log::debug!("Running isolate {}", args.join(" "));

        let mut child = tokio::process::Command::new(&self.settings.isolate_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Start(anyhow!("Failed to spawn isolate --run: {e}")))?;

        tokio::select! {
            status = child.wait() => {
                status.map_err(|e| SandboxError::Start(anyhow!("Failed to wait for isolate: {e}")))?;
            }
            _ = token.cancelled() => {
                let _ = child.kill().await;
                log::debug!("Isolate box {} torn down after cancellation", sandbox.id);
                return Err(SandboxError::Cancelled);
            }
        }

        let content = fs::read_to_string(meta_file.path())
            .map_err(|e| SandboxError::Start(anyhow!("Failed to read meta file: {e}")))?;
        if content.trim().is_empty() {
            return Err(SandboxError::Start(anyhow!("isolate produced an empty meta file")));
        }
        Ok(Meta::parse(&content))
    }

    fn isolate_args(&self, id: usize, run: &IsolateRun<'_>, meta_path: &Path) -> Vec<String> {
        let mut args = vec![
            "-b".to_string(),
            id.to_string(),
            "--cg".to_string(),
            "--run".to_string(),
        ];
        for dir in &self.settings.isolate_dirs {
            args.push(format!("--dir={dir}"));
        }
        if Path::new("/etc/alternatives").exists() {
            args.push("--dir=/etc/alternatives".to_string());
        }
        args.extend([
            format!("--time={}", seconds(run.cpu_time)),
            format!("--wall-time={}", seconds(run.wall_time)),
            format!("--cg-mem={}", run.memory.0),
            format!("--processes={}", run.processes),
            format!("--open-files={}", run.open_files),
            format!("--fsize={}", run.file_size_kb),
            "-E".to_string(),
            SANDBOX_PATH.to_string(),
            "-E".to_string(),
            "HOME=/box".to_string(),
            "-M".to_string(),
            meta_path.display().to_string(),
        ]);
        if let Some(stdin) = run.stdin {
            args.extend(["-i".to_string(), stdin.to_string()]);
        }
        args.extend(["-o".to_string(), run.stdout.to_string()]);
        match run.stderr {
            Some(stderr) => args.extend(["-r".to_string(), stderr.to_string()]),
            None => args.push("--stderr-to-stdout".to_string()),
        }
        args.extend([
            "--silent".to_string(),
            "--".to_string(),
            "/bin/sh".to_string(),
            "-c".to_string(),
            shell_line(run.command),
        ]);
        args
    }
}

/// An initialized isolate box, cleaned up on drop
struct BoxHandle {
    binary: String,
    id: usize,
    dir: PathBuf,
    /// Released once `--cleanup` has run
    claim: Option<OwnedMutexGuard<()>>,
}

impl BoxHandle {
    /// Cleans the box up and waits for it
    async fn release(mut self) {
        if let Some(cleanup) = self.cleanup() {
            let _ = cleanup.await;
        }
    }

    /// Starts `isolate --cleanup` on a blocking thread
    ///
    /// The box stays claimed until the command has finished, even when nobody
    /// waits for it.
    fn cleanup(&mut self) -> Option<JoinHandle<()>> {
        let claim = self.claim.take()?;
        let binary = self.binary.clone();
        let id = self.id;
        let task = move || {
            let out = Command::new(&binary)
                .arg("-b")
                .arg(id.to_string())
                .arg("--cg")
                .arg("--cleanup")
                .stdin(Stdio::null())
                .output();

            if out.is_ok_and(|c| c.status.success()) {
                log::debug!("Isolate box {id} cleaned up");
            } else {
                log::error!("Isolate box {id} failed to clean up");
            }
            drop(claim);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn_blocking(task)),
            Err(_) => {
                task();
                None
            }
        }
    }
}

impl Drop for BoxHandle {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn process_limit(language: Language) -> u32 {
    match language {
        Language::Java => JVM_PROCESSES,
        _ => RUNTIME_PROCESSES,
    }
}

fn seconds(time: Millis) -> String {
    format!("{:.3}", time.0 as f64 / 1000.0)
}

/// Joins a command for `sh -c`, replacing the shell with the program
fn shell_line(command: &[String]) -> String {
    format!("exec {}", command.join(" "))
}

/// Contents of an isolate meta file
#[derive(Debug, Default, PartialEq)]
struct Meta {
    time_wall_ms: u64,
    cg_mem_kb: u64,
    max_rss_kb: u64,
    killed: bool,
    oom_killed: bool,
    exitcode: Option<i32>,
    exitsig: Option<i32>,
    status: Option<String>,
    message: Option<String>,
}

impl Meta {
    fn parse(content: &str) -> Self {
        let mut meta = Meta::default();
        for line in content.lines() {
            if let Some((key, value)) = line.split_once(':') {
                match key {
                    "time-wall" => {
                        if let Ok(secs) = value.parse::<f64>() {
                            meta.time_wall_ms = (secs * 1000.0).round() as u64;
                        }
                    }
                    "cg-mem" => meta.cg_mem_kb = value.parse().unwrap_or(0),
                    "max-rss" => meta.max_rss_kb = value.parse().unwrap_or(0),
                    "killed" => meta.killed = value == "1",
                    "cg-oom-killed" => meta.oom_killed = value == "1",
                    "exitcode" => meta.exitcode = value.parse().ok(),
                    "exitsig" => meta.exitsig = value.parse().ok(),
                    "status" => meta.status = Some(value.to_string()),
                    "message" => meta.message = Some(value.to_string()),
                    _ => {}
                }
            }
        }
        meta
    }

    fn peak_memory_kb(&self) -> u64 {
        self.cg_mem_kb.max(self.max_rss_kb)
    }

    /// How the program ended, or the sandbox's own failure message
    fn termination(&self) -> Result<Termination, String> {
        if self.status.as_deref() == Some("XX") {
            return Err(self
                .message
                .clone()
                .unwrap_or_else(|| "isolate internal error".to_string()));
        }
        if self.oom_killed {
            return Ok(Termination::MemoryExceeded);
        }
        if self.status.as_deref() == Some("TO") {
            return Ok(Termination::TimedOut);
        }
        if let Some(signal) = self.exitsig {
            return Ok(match signal {
                libc::SIGXFSZ => Termination::OutputExceeded,
                libc::SIGXCPU => Termination::TimedOut,
                signal => Termination::Signaled(signal),
            });
        }
        Ok(Termination::Exited(self.exitcode.unwrap_or(0)))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_meta_of_successful_run() {
        let meta = Meta::parse("time:0.012\ntime-wall:0.034\nmax-rss:2048\ncg-mem:3072\nexitcode:0\n");
        assert_eq!(
            meta,
            Meta {
                time_wall_ms: 34,
                cg_mem_kb: 3072,
                max_rss_kb: 2048,
                exitcode: Some(0),
                ..Meta::default()
            }
        );
        assert_eq!(meta.peak_memory_kb(), 3072);
        assert_eq!(meta.termination(), Ok(Termination::Exited(0)));
    }

    #[test]
    fn test_meta_terminations() {
        let timed_out = Meta::parse("time-wall:1.500\nkilled:1\nstatus:TO\nmessage:Time limit exceeded (wall clock)\n");
        assert_eq!(timed_out.termination(), Ok(Termination::TimedOut));

        let oom = Meta::parse("cg-oom-killed:1\nkilled:1\nstatus:SG\nexitsig:9\n");
        assert_eq!(oom.termination(), Ok(Termination::MemoryExceeded));

        let crashed = Meta::parse("status:SG\nexitsig:11\nmessage:Caught fatal signal 11\n");
        assert_eq!(crashed.termination(), Ok(Termination::Signaled(11)));

        let failed = Meta::parse("status:RE\nexitcode:2\n");
        assert_eq!(failed.termination(), Ok(Termination::Exited(2)));

        let broken = Meta::parse("status:XX\nmessage:Cannot run proxy\n");
        assert_eq!(broken.termination(), Err("Cannot run proxy".to_string()));
    }

    #[test]
    fn test_shell_line() {
        let command = vec!["python3".to_string(), "main.py".to_string()];
        assert_eq!(shell_line(&command), "exec python3 main.py");
    }

    /// Stand-in `isolate` whose `--init` and `--cleanup` take a while
    fn slow_isolate(dir: &Path) -> (SandboxSettings, PathBuf) {
        let root = dir.join("root");
        fs::create_dir_all(root.join("box")).unwrap();
        let log = dir.join("cleanups.log");
        let script = dir.join("isolate");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\nsleep 0.3\ncase \"$*\" in\n  *--init*) echo {} ;;\n  *--cleanup*) echo cleanup >> {} ;;\nesac\n",
                root.display(),
                log.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let mut settings = SandboxSettings::from_config(&crate::config::EngineConfig::default());
        settings.work_dir = dir.to_path_buf();
        settings.isolate_binary = script.display().to_string();
        (settings, log)
    }

    fn cleanups(log: &Path) -> usize {
        fs::read_to_string(log).map(|s| s.lines().count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_box_lifecycle_leaves_runtime_free() {
        let dir = tempfile::tempdir().unwrap();
        let (settings, log) = slow_isolate(dir.path());
        let runner = IsolateRunner::new(settings, dir.path().join("meta"));

        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ticker = tokio::spawn({
            let ticks = Arc::clone(&ticks);
            async move {
                loop {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    ticks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            }
        });

        let sandbox = runner.init_box(3).await.unwrap();
        assert_eq!(sandbox.dir, dir.path().join("root").join("box"));
        sandbox.release().await;
        ticker.abort();

        assert_eq!(cleanups(&log), 1);
        // Blocking calls on this single-threaded runtime would starve the ticker
        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) >= 20);
    }

    #[tokio::test]
    async fn test_dropped_box_is_cleaned_before_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let (settings, log) = slow_isolate(dir.path());
        let runner = IsolateRunner::new(settings, dir.path().join("meta"));

        drop(runner.init_box(0).await.unwrap());
        assert_eq!(cleanups(&log), 0);

        let again = runner.init_box(0).await.unwrap();
        assert_eq!(cleanups(&log), 1);
        again.release().await;
        assert_eq!(cleanups(&log), 2);
    }

    #[test]
    fn test_seconds_format() {
        assert_eq!(seconds(Millis(1500)), "1.500");
        assert_eq!(seconds(Millis(20)), "0.020");
    }
}
