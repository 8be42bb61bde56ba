//! Bounded execution of external operations.
//!
//! Every long-running delegated operation (mount, commit, optimize,
//! packaging, dependency install) goes through an [`OperationRunner`]. The
//! [`BoundedRunner`] spawns the command in its own process group, drains its
//! output on reader threads and polls for exit until the deadline. On expiry
//! the whole group is killed and reaped before returning.

use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use crate::error::{BuildError, Result};
use crate::timestamp::deadline_after;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);
/// How long to wait for output readers once the process has exited.
const READER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommand {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ExternalCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
        }
    }

    /// Build from an argv vector; fails on an empty vector.
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| BuildError::Validation("empty command template".to_string()))?;
        Ok(Self::new(program.clone()).args(args.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExternalOperationResult {
    /// `None` when the process was killed (timeout or signal).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub elapsed: Duration,
    /// Process id, which is also the process group id.
    pub pid: u32,
}

impl ExternalOperationResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

pub trait OperationRunner: Send + Sync {
    fn run(&self, command: &ExternalCommand, timeout: Duration) -> Result<ExternalOperationResult>;

    /// Run and turn a timeout into [`BuildError::Timeout`] and a non-zero
    /// exit into [`BuildError::External`].
    fn run_checked(
        &self,
        command: &ExternalCommand,
        timeout: Duration,
    ) -> Result<ExternalOperationResult> {
        let result = self.run(command, timeout)?;
        if result.timed_out {
            return Err(BuildError::Timeout {
                operation: command.display(),
                timeout,
            });
        }
        if result.exit_code != Some(0) {
            return Err(BuildError::External {
                program: command.program.clone(),
                code: result.exit_code,
                stderr: tail(&result.stderr, 2048),
            });
        }
        Ok(result)
    }
}

#[derive(Debug, Clone)]
pub struct BoundedRunner {
    poll_interval: Duration,
}

impl Default for BoundedRunner {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl BoundedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }
}

impl OperationRunner for BoundedRunner {
    fn run(&self, command: &ExternalCommand, timeout: Duration) -> Result<ExternalOperationResult> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|err| spawn_error(&command.program, err))?;
        let pid = child.id();
        tracing::debug!(pid, command = %command.display(), "spawned external operation");

        let stdout_rx = child.stdout.take().map(spawn_reader);
        let stderr_rx = child.stderr.take().map(spawn_reader);

        let deadline = deadline_after(start, timeout);
        let mut timed_out = false;
        let status = loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|err| BuildError::io(format!("waiting for '{}'", command.program), err))?
            {
                break Some(status);
            }
            let now = Instant::now();
            if now >= deadline {
                timed_out = true;
                kill_process_tree(&mut child);
                // Reap the group leader so it does not linger as a zombie.
                let _ = child.wait();
                break None;
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        };

        let stdout = collect_output(stdout_rx);
        let stderr = collect_output(stderr_rx);
        let elapsed = start.elapsed();

        if timed_out {
            tracing::warn!(
                pid,
                command = %command.display(),
                timeout_secs = timeout.as_secs_f64(),
                "external operation timed out; process group killed"
            );
        }

        Ok(ExternalOperationResult {
            exit_code: status.and_then(|s| s.code()),
            stdout,
            stderr,
            timed_out,
            elapsed,
            pid,
        })
    }
}

fn spawn_error(program: &str, err: std::io::Error) -> BuildError {
    match err.kind() {
        std::io::ErrorKind::NotFound => {
            BuildError::MissingPrerequisite(format!("'{program}' not found on PATH"))
        }
        std::io::ErrorKind::PermissionDenied => {
            BuildError::PermissionDenied(format!("cannot execute '{program}'"))
        }
        _ => BuildError::io(format!("spawning '{program}'"), err),
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

/// A grandchild that escaped the process group can hold the pipe open; the
/// grace period keeps that from blocking the caller.
fn collect_output(rx: Option<Receiver<Vec<u8>>>) -> String {
    rx.and_then(|rx| rx.recv_timeout(READER_GRACE).ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[cfg(unix)]
fn kill_process_tree(child: &mut Child) {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: kill(2) with a negative pid signals the process group we
    // created for this child; it has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) {
    let _ = child.kill();
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.trim_end().to_string();
    }
    text.chars()
        .skip(count - max_chars)
        .collect::<String>()
        .trim_end()
        .to_string()
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ExternalCommand {
        ExternalCommand::new("sh").arg("-c").arg(script)
    }

    /// Members of process group `pgid` that are not zombies. Zombies are
    /// excluded because reaping orphans is up to whatever runs as init.
    fn live_group_members(pgid: u32) -> usize {
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return 0;
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
            .filter(|stat| {
                let Some(rest) = stat.rsplit_once(')').map(|(_, rest)| rest) else {
                    return false;
                };
                let fields: Vec<&str> = rest.split_whitespace().collect();
                fields.len() > 2 && fields[0] != "Z" && fields[2] == pgid.to_string()
            })
            .count()
    }

    #[test]
    fn captures_output_and_exit_code() {
        let runner = BoundedRunner::new();
        let result = runner
            .run(&sh("echo out; echo err >&2; exit 3"), Duration::from_secs(10))
            .unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert!(!result.timed_out);
        assert!(!result.success());
    }

    #[test]
    fn timeout_kills_the_whole_group() {
        let runner = BoundedRunner::new();
        let timeout = Duration::from_millis(300);
        let start = Instant::now();
        let result = runner
            .run(&sh("sleep 30 & sleep 30; wait"), timeout)
            .unwrap();
        let elapsed = start.elapsed();

        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert!(
            elapsed < timeout + Duration::from_secs(3),
            "returned after {elapsed:?}"
        );

        let settle = Instant::now();
        while live_group_members(result.pid) > 0 && settle.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(
            live_group_members(result.pid),
            0,
            "process group survived the timeout"
        );
    }

    #[test]
    fn run_checked_classifies_failures() {
        let runner = BoundedRunner::new();
        let err = runner
            .run_checked(&sh("exit 7"), Duration::from_secs(10))
            .unwrap_err();
        assert!(matches!(err, BuildError::External { code: Some(7), .. }));

        let err = runner
            .run_checked(&sh("sleep 5"), Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, BuildError::Timeout { .. }));
    }

    #[test]
    fn missing_program_is_a_missing_prerequisite() {
        let runner = BoundedRunner::new();
        let err = runner
            .run(
                &ExternalCommand::new("definitely_not_a_real_command_12345"),
                Duration::from_secs(1),
            )
            .unwrap_err();
        assert!(matches!(err, BuildError::MissingPrerequisite(_)));
    }

    #[test]
    fn from_argv_rejects_empty() {
        assert!(ExternalCommand::from_argv(&[]).is_err());
        let cmd = ExternalCommand::from_argv(&["tar".to_string(), "-x".to_string()]).unwrap();
        assert_eq!(cmd.display(), "tar -x");
    }
}
