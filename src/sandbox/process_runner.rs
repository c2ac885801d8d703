use std::fs;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::{KiloBytes, Millis};
use crate::language::Toolchain;
use crate::model::Limits;

use super::{
    Artifact, CompileOutcome, RawExecution, SandboxError, SandboxRunner, SandboxSettings,
    Termination, split_command,
};

const SANDBOX_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const MEMORY_POLL_INTERVAL: Duration = Duration::from_millis(10);
const READ_CHUNK: usize = 8192;
/// Wait for output pipes to close after the group is gone, before escalating
const DRAIN_GRACE: Duration = Duration::from_millis(250);

const COMPILE_OPEN_FILES: u64 = 512;
const COMPILE_FILE_SIZE: KiloBytes = KiloBytes(65536);

const RUNTIME_OPEN_FILES: u64 = 64;
const RUNTIME_FILE_SIZE: KiloBytes = KiloBytes(16384);

/// A runner that executes code as plain child processes
///
/// ProcessRunner gives every execution a fresh scratch directory, a cleared
/// environment, its own process group and rlimits, and enforces wall-clock
/// and memory ceilings with watchdogs. It has no filesystem isolation and
/// only optional network isolation, so it is meant for development and
/// trusted environments.
pub struct ProcessRunner {
    settings: SandboxSettings,
}

/// One process launch together with its ceilings
struct Launch<'a> {
    command: &'a [String],
    cwd: &'a Path,
    stdin: Vec<u8>,
    time: Millis,
    memory: KiloBytes,
    rlimits: Rlimits,
}

#[derive(Debug, Clone, Copy)]
struct Rlimits {
    cpu_seconds: u64,
    file_size_bytes: u64,
    open_files: u64,
}

impl Rlimits {
    fn for_compile(time: Millis) -> Self {
        Self {
            cpu_seconds: cpu_seconds(time),
            file_size_bytes: COMPILE_FILE_SIZE.as_bytes(),
            open_files: COMPILE_OPEN_FILES,
        }
    }

    fn for_runtime(time: Millis) -> Self {
        Self {
            cpu_seconds: cpu_seconds(time),
            file_size_bytes: RUNTIME_FILE_SIZE.as_bytes(),
            open_files: RUNTIME_OPEN_FILES,
        }
    }
}

/// CPU seconds granted for a wall-clock limit, rounded up
fn cpu_seconds(time: Millis) -> u64 {
    time.0.div_ceil(1000).max(1)
}

#[async_trait]
impl SandboxRunner for ProcessRunner {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn compile(
        &self,
        toolchain: &Toolchain,
        source: &str,
        slot: usize,
        token: &CancellationToken,
    ) -> Result<CompileOutcome, SandboxError> {
        let dir = self
            .settings
            .scratch_dir("artifact-")
            .map_err(SandboxError::Start)?;
        fs::write(
            dir.path().join(&toolchain.source_file),
            format!("{source}\n"),
        )
        .map_err(|e| SandboxError::Start(e.into()))?;

        let artifact = Artifact::new(dir, toolchain.language, toolchain.run_command());
        let Some(command) = toolchain.compile_command() else {
            return Ok(CompileOutcome::Compiled(artifact));
        };
        log::debug!(
            "ProcessRunner compiling {} in slot {slot}: {}",
            toolchain.language,
            command.join(" ")
        );

        let time = self.settings.compile_time;
        let raw = self
            .launch(
                Launch {
                    command: &command,
                    cwd: artifact.path(),
                    stdin: Vec::new(),
                    time,
                    memory: self.settings.compile_memory,
                    rlimits: Rlimits::for_compile(time),
                },
                token,
            )
            .await?;

        let outcome = match raw.termination {
            Termination::Exited(0) => CompileOutcome::Compiled(artifact),
            Termination::TimedOut => CompileOutcome::Failed {
                diagnostics: format!("Compilation exceeded the time limit of {} ms", time.0),
            },
            Termination::MemoryExceeded => CompileOutcome::Failed {
                diagnostics: format!(
                    "Compilation exceeded the memory limit of {} KB",
                    self.settings.compile_memory.0
                ),
            },
            _ => CompileOutcome::Failed {
                diagnostics: compile_diagnostics(&raw),
            },
        };
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
        let dir = self
            .settings
            .scratch_dir("exec-")
            .map_err(SandboxError::Start)?;
        artifact
            .install_into(dir.path())
            .map_err(SandboxError::Start)?;
        log::debug!(
            "ProcessRunner executing {} in slot {slot}",
            artifact.language()
        );

        self.launch(
            Launch {
                command: artifact.run_command(),
                cwd: dir.path(),
                stdin: input.as_bytes().to_vec(),
                time: limits.time_ms,
                memory: limits.memory_kb,
                rlimits: Rlimits::for_runtime(limits.time_ms),
            },
            token,
        )
        .await
    }
}

impl ProcessRunner {
    pub fn build(settings: SandboxSettings) -> anyhow::Result<Self> {
        settings.create_work_dir()?;

        log::info!(
            "ProcessRunner initialized with work dir {}",
            settings.work_dir.display()
        );
        log::warn!("ProcessRunner provides NO filesystem isolation - use only in trusted environments");

        Ok(Self { settings })
    }

    /// Spawns one process and supervises it until it ends or is killed
    async fn launch(
        &self,
        launch: Launch<'_>,
        token: &CancellationToken,
    ) -> Result<RawExecution, SandboxError> {
        let (program, args) = split_command(launch.command).map_err(SandboxError::Start)?;
        let program = resolve_program(program, launch.cwd);

        let mut cmd = Command::new(&program);
        cmd.args(args)
            .current_dir(launch.cwd)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", launch.cwd)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let rlimits = launch.rlimits;
        let isolate_network = self.settings.isolate_network;
        // SAFETY: the hook only issues async-signal-safe syscalls
        unsafe {
            cmd.pre_exec(move || prepare_child(rlimits, isolate_network));
        }

        let mut child = cmd.spawn().map_err(|e| {
            SandboxError::Start(anyhow!("Failed to spawn {}: {e}", program.display()))
        })?;
        let start = Instant::now();
        let group = ProcessGroup::new(child.id() as libc::pid_t);
        let pid = group.pgid;

        let overflow = Arc::new(AtomicBool::new(false));
        let cap = self.settings.max_output_bytes();
        let streams = match Streams::attach(&mut child, launch.stdin, cap, pid, &overflow) {
            Ok(streams) => streams,
            Err(e) => {
                group.kill();
                let _ = tokio::task::spawn_blocking(move || wait_for(pid)).await;
                return Err(SandboxError::Start(anyhow!(
                    "Failed to attach to the pipes of {pid}: {e}"
                )));
            }
        };

        let mut waiter = tokio::task::spawn_blocking(move || wait_for(pid));
        let deadline = tokio::time::sleep(Duration::from_millis(launch.time.0));
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(MEMORY_POLL_INTERVAL);
        let mut killed: Option<Termination> = None;
        let mut polled_peak_kb = 0;

        let waited = loop {
            tokio::select! {
                res = &mut waiter => break res,
                _ = token.cancelled() => {
                    group.kill();
                    let _ = (&mut waiter).await;
                    streams.drain(pid).await;
                    log::debug!("Process {pid} torn down after cancellation");
                    return Err(SandboxError::Cancelled);
                }
                _ = &mut deadline, if killed.is_none() => {
                    group.kill();
                    killed = Some(Termination::TimedOut);
                }
                _ = ticker.tick(), if killed.is_none() => {
                    if let Some(rss) = current_rss_kb(pid) {
                        polled_peak_kb = polled_peak_kb.max(rss);
                        if rss >= launch.memory.0 {
                            group.kill();
                            killed = Some(Termination::MemoryExceeded);
                        }
                    }
                }
            }
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let waited = match waited {
            Ok(Ok(waited)) => waited,
            Ok(Err(e)) => return Err(SandboxError::Start(anyhow!("wait4 on {pid} failed: {e}"))),
            Err(e) => return Err(SandboxError::Start(anyhow!("Waiter for {pid} failed: {e}"))),
        };
        // Reap stragglers the program forked into its group
        group.finish();
        let (stdout, stderr) = streams.drain(pid).await;

        let termination = match killed {
            Some(termination) => termination,
            None if overflow.load(Ordering::SeqCst) => Termination::OutputExceeded,
            None => decode_status(waited.status),
        };

        Ok(RawExecution {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            elapsed_ms,
            peak_memory_kb: waited.max_rss_kb.max(polled_peak_kb),
            termination,
        })
    }
}

/// The stdio pipes of one launch, pumped by async tasks
///
/// Dropping it stops the tasks and closes the pipes.
struct Streams {
    stdout: JoinHandle<Vec<u8>>,
    stderr: JoinHandle<Vec<u8>>,
    /// Inodes of the output pipes, to find processes still holding them
    inodes: Vec<u64>,
    stop: DropGuard,
}

impl Streams {
    fn attach(
        child: &mut Child,
        input: Vec<u8>,
        cap: usize,
        pgid: libc::pid_t,
        overflow: &Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let stop = CancellationToken::new();
        let mut inodes = Vec::new();

        let stdin = child.stdin.take().map(ChildStdin::from_std).transpose()?;
        let stdout = match child.stdout.take() {
            Some(pipe) => {
                inodes.push(pipe_inode(&pipe)?);
                Some(ChildStdout::from_std(pipe)?)
            }
            None => None,
        };
        let stderr = match child.stderr.take() {
            Some(pipe) => {
                inodes.push(pipe_inode(&pipe)?);
                Some(ChildStderr::from_std(pipe)?)
            }
            None => None,
        };

        tokio::spawn(feed(stdin, input, stop.clone()));
        Ok(Self {
            stdout: tokio::spawn(capture(stdout, cap, pgid, Arc::clone(overflow), stop.clone())),
            stderr: tokio::spawn(capture(stderr, cap, pgid, Arc::clone(overflow), stop.clone())),
            inodes,
            stop: stop.drop_guard(),
        })
    }

    /// Collects both output streams once their writers are gone
    ///
    /// Processes that left the group while holding an output pipe are killed
    /// after a grace period. Readers still open after a second one are stopped
    /// with what they have captured so far.
    async fn drain(self, pgid: libc::pid_t) -> (Vec<u8>, Vec<u8>) {
        let Self {
            stdout,
            stderr,
            inodes,
            stop,
        } = self;
        let stop = stop.disarm();
        let halt = stop.clone();

        let escalate = async move {
            tokio::time::sleep(DRAIN_GRACE).await;
            let swept = tokio::task::spawn_blocking(move || kill_pipe_holders(&inodes))
                .await
                .unwrap_or(0);
            if swept > 0 {
                log::warn!("Killed {swept} escaped processes of group {pgid}");
            }
            tokio::time::sleep(DRAIN_GRACE).await;
            log::warn!("Output pipes of group {pgid} still open, truncating capture");
            halt.cancel();
        };
        let joined = async { tokio::join!(stdout, stderr) };
        tokio::pin!(joined);

        let (stdout, stderr) = tokio::select! {
            joined = &mut joined => joined,
            _ = escalate => joined.await,
        };
        // Release an input writer stuck on a pipe nobody reads
        stop.cancel();
        (stdout.unwrap_or_default(), stderr.unwrap_or_default())
    }
}

/// Writes the whole input, then closes the pipe
async fn feed(pipe: Option<ChildStdin>, input: Vec<u8>, stop: CancellationToken) {
    let Some(mut pipe) = pipe else {
        return;
    };
    tokio::select! {
        // The program may exit without reading its input
        _ = pipe.write_all(&input) => {}
        _ = stop.cancelled() => {}
    }
}

/// Reads a pipe to its end, killing the group past `cap` bytes
async fn capture<R: AsyncRead + Unpin>(
    pipe: Option<R>,
    cap: usize,
    pgid: libc::pid_t,
    overflow: Arc<AtomicBool>,
    stop: CancellationToken,
) -> Vec<u8> {
    let mut captured = Vec::new();
    let Some(mut pipe) = pipe else {
        return captured;
    };
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let read = tokio::select! {
            read = pipe.read(&mut chunk) => read,
            _ = stop.cancelled() => break,
        };
        match read {
            Ok(0) => break,
            Ok(n) if captured.len() + n > cap => {
                let room = cap - captured.len();
                captured.extend_from_slice(&chunk[..room]);
                overflow.store(true, Ordering::SeqCst);
                kill_group(pgid);
                break;
            }
            Ok(n) => captured.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    captured
}

fn pipe_inode(pipe: &impl AsRawFd) -> io::Result<u64> {
    Ok(fs::metadata(format!("/proc/self/fd/{}", pipe.as_raw_fd()))?.ino())
}

/// Kills every other process holding one of the given pipes, returning how
/// many were signalled
///
/// Catches programs that escaped their process group with `setsid` but kept
/// stdout or stderr open.
fn kill_pipe_holders(inodes: &[u64]) -> usize {
    let targets: Vec<String> = inodes.iter().map(|ino| format!("pipe:[{ino}]")).collect();
    let own = std::process::id();
    let Ok(entries) = fs::read_dir("/proc") else {
        return 0;
    };

    let mut killed = 0;
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if pid == own {
            continue;
        }
        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        let holds_pipe = fds.flatten().any(|fd| {
            fs::read_link(fd.path())
                .is_ok_and(|link| targets.iter().any(|target| link.as_os_str() == target.as_str()))
        });
        if holds_pipe {
            // SAFETY: plain syscall on a pid read from procfs
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
            killed += 1;
        }
    }
    killed
}

/// Kills every process of a program's group on drop unless finished normally
struct ProcessGroup {
    pgid: libc::pid_t,
    armed: bool,
}

impl ProcessGroup {
    fn new(pgid: libc::pid_t) -> Self {
        Self { pgid, armed: true }
    }

    fn kill(&self) {
        kill_group(self.pgid);
    }

    fn finish(mut self) {
        self.kill();
        self.armed = false;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if self.armed {
            self.kill();
        }
    }
}

fn kill_group(pgid: libc::pid_t) {
    // SAFETY: plain syscall; a group that is already gone yields ESRCH
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

/// Runs in the forked child right before `exec`
fn prepare_child(rlimits: Rlimits, isolate_network: bool) -> io::Result<()> {
    // SAFETY: async-signal-safe syscalls only
    unsafe {
        if libc::setpgid(0, 0) != 0 {
            return Err(io::Error::last_os_error());
        }
        if isolate_network && libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET) != 0 {
            return Err(io::Error::last_os_error());
        }

        let table = [
            (libc::RLIMIT_CPU, rlimits.cpu_seconds, rlimits.cpu_seconds + 1),
            (libc::RLIMIT_FSIZE, rlimits.file_size_bytes, rlimits.file_size_bytes),
            (libc::RLIMIT_NOFILE, rlimits.open_files, rlimits.open_files),
            (libc::RLIMIT_CORE, 0, 0),
        ];
        for (resource, soft, hard) in table {
            let limit = libc::rlimit {
                rlim_cur: soft as libc::rlim_t,
                rlim_max: hard as libc::rlim_t,
            };
            if libc::setrlimit(resource, &limit) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

struct Waited {
    status: libc::c_int,
    max_rss_kb: u64,
}

/// Blocks until `pid` exits, collecting its rusage
fn wait_for(pid: libc::pid_t) -> io::Result<Waited> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain old data
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let ret = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if ret == pid {
            return Ok(Waited {
                status,
                // ru_maxrss is reported in kilobytes on Linux
                max_rss_kb: usage.ru_maxrss.max(0) as u64,
            });
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn decode_status(status: libc::c_int) -> Termination {
    if libc::WIFEXITED(status) {
        Termination::Exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        match libc::WTERMSIG(status) {
            libc::SIGXCPU => Termination::TimedOut,
            signal => Termination::Signaled(signal),
        }
    } else {
        Termination::Signaled(0)
    }
}

/// Resident set size of a live process, from procfs
fn current_rss_kb(pid: libc::pid_t) -> Option<u64> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|value| value.trim().trim_end_matches("kB").trim().parse().ok())
}

/// `./main` style programs live in the execution directory
fn resolve_program(program: &str, cwd: &Path) -> PathBuf {
    match program.strip_prefix("./") {
        Some(relative) => cwd.join(relative),
        None => PathBuf::from(program),
    }
}

fn compile_diagnostics(raw: &RawExecution) -> String {
    let mut diagnostics = raw.stdout.trim_end().to_string();
    let stderr = raw.stderr.trim_end();
    if !stderr.is_empty() {
        if !diagnostics.is_empty() {
            diagnostics.push('\n');
        }
        diagnostics.push_str(stderr);
    }
    if diagnostics.is_empty() {
        diagnostics = match raw.termination {
            Termination::Exited(code) => format!("Compiler exited with code {code}"),
            Termination::Signaled(signal) => format!("Compiler killed by signal {signal}"),
            _ => "Compiler failed".to_string(),
        };
    }
    diagnostics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_status() {
        assert_eq!(decode_status(0), Termination::Exited(0));
        assert_eq!(decode_status(3 << 8), Termination::Exited(3));
        assert_eq!(decode_status(libc::SIGSEGV), Termination::Signaled(libc::SIGSEGV));
        assert_eq!(decode_status(libc::SIGXCPU), Termination::TimedOut);
    }

    #[test]
    fn test_cpu_seconds_round_up() {
        assert_eq!(cpu_seconds(Millis(1)), 1);
        assert_eq!(cpu_seconds(Millis(1000)), 1);
        assert_eq!(cpu_seconds(Millis(1500)), 2);
    }

    #[test]
    fn test_resolve_program() {
        let cwd = Path::new("/tmp/exec-1");
        assert_eq!(resolve_program("./main", cwd), cwd.join("main"));
        assert_eq!(resolve_program("python3", cwd), PathBuf::from("python3"));
    }

    #[test]
    fn test_current_rss_of_self() {
        let rss = current_rss_kb(std::process::id() as libc::pid_t);
        assert!(rss.is_some_and(|kb| kb > 0));
    }

    #[test]
    fn test_compile_diagnostics_merge_streams() {
        let raw = RawExecution {
            stdout: "warning: unused\n".to_string(),
            stderr: "error: expected ';'\n".to_string(),
            elapsed_ms: 10,
            peak_memory_kb: 100,
            termination: Termination::Exited(1),
        };
        assert_eq!(
            compile_diagnostics(&raw),
            "warning: unused\nerror: expected ';'"
        );

        let silent = RawExecution {
            stdout: String::new(),
            stderr: String::new(),
            ..raw
        };
        assert_eq!(compile_diagnostics(&silent), "Compiler exited with code 1");
    }
}
