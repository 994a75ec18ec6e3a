//! Process execution inside the sandbox root.
//!
//! Children are started in a fresh session with the sandbox root as their
//! working directory and an environment built only from what the caller
//! supplies (plus the host `PATH` when the caller gave none, so toolchains
//! stay resolvable).
//!
//! Captured stdout and stderr are drained together with `poll(2)`. Reading
//! one pipe to EOF before the other deadlocks as soon as the child fills the
//! second pipe's buffer and blocks on it.

use crate::error::{Result, SandboxError};
use crate::pipeline::Toolchain;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use tracing::{debug, trace, warn};

/// Maximum captured output per stream in bytes (1 MB).
/// Anything past this is read and discarded so the child never blocks.
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Return code reported when the child was terminated by a signal.
pub const SIGNALED_RETURN_CODE: i32 = -1;

const READ_CHUNK: usize = 4096;

/// Pipeline stage that produced an [`ExecutionResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Assembling the source.
    Compilation,
    /// Linking the object file.
    Linking,
    /// Running the produced binary.
    Execution,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compilation => write!(f, "compilation"),
            Self::Linking => write!(f, "linking"),
            Self::Execution => write!(f, "execution"),
        }
    }
}

/// Outcome of a single process invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Standard output (empty when not captured).
    pub stdout: String,
    /// Standard error (empty when not captured).
    pub stderr: String,
    /// Exit code, or -1 if the child was killed by a signal.
    pub return_code: i32,
    /// Pipeline stage, set only by `compile_and_run`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
}

impl ExecutionResult {
    /// True when the process exited with status 0.
    pub fn success(&self) -> bool {
        self.return_code == 0
    }

    pub(crate) fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }
}

/// Launches host commands confined to the sandbox root.
///
/// Holds no mutable state; concurrent calls each own their child and pipes.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    root: PathBuf,
    toolchain: Toolchain,
}

impl ProcessExecutor {
    /// Create an executor whose children run in `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            toolchain: Toolchain::default(),
        }
    }

    /// Replace the assembler/linker toolchain used by `compile_and_run`.
    pub fn with_toolchain(mut self, toolchain: Toolchain) -> Self {
        self.toolchain = toolchain;
        self
    }

    /// Working directory of every child.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    /// Run `command` with `args` and wait for it to exit.
    ///
    /// With `capture_output`, stdout and stderr are collected (each capped at
    /// [`MAX_OUTPUT_SIZE`]); otherwise the child inherits the caller's streams
    /// and the returned output fields are empty.
    ///
    /// # Errors
    /// [`SandboxError::Spawn`] if the program cannot be launched and
    /// [`SandboxError::Resource`] if its pipes or exit status cannot be collected.
    pub fn execute(
        &self,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        capture_output: bool,
    ) -> Result<ExecutionResult> {
        debug!(
            command = %command,
            argc = args.len(),
            capture_output,
            "executing command"
        );

        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(&self.root)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null());

        if !env.contains_key("PATH") {
            if let Some(host_path) = std::env::var_os("PATH") {
                cmd.env("PATH", host_path);
            }
        }

        if capture_output {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        // SAFETY: the closure runs between fork and exec and only calls
        // setsid(2), which is async-signal-safe.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|source| {
            warn!(command = %command, error = %source, "command launch failed");
            SandboxError::Spawn {
                command: command.to_string(),
                source,
            }
        })?;
        trace!(command = %command, pid = child.id(), "child started");

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => {
                let drained = drain_pipes(out, err);
                match drained {
                    Ok(output) => output,
                    Err(e) => {
                        // Reap the child before reporting so it does not linger.
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(SandboxError::Resource(format!(
                            "failed to read output of '{}': {}",
                            command, e
                        )));
                    }
                }
            }
            _ => (Vec::new(), Vec::new()),
        };

        let status = child.wait().map_err(|e| {
            SandboxError::Resource(format!("failed to wait for '{}': {}", command, e))
        })?;
        let return_code = return_code(status);

        let result = ExecutionResult {
            stdout: truncate_output(String::from_utf8_lossy(&stdout).into_owned(), stdout.len()),
            stderr: truncate_output(String::from_utf8_lossy(&stderr).into_owned(), stderr.len()),
            return_code,
            stage: None,
        };

        debug!(
            command = %command,
            return_code,
            stdout_len = result.stdout.len(),
            stderr_len = result.stderr.len(),
            "command completed"
        );
        trace!(stdout = %result.stdout, stderr = %result.stderr, "command output");
        Ok(result)
    }
}

/// Map an exit status to a return code, signals becoming the sentinel.
fn return_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => {
            debug!(signal = ?status.signal(), "child terminated by signal");
            SIGNALED_RETURN_CODE
        }
    }
}

/// Read both pipes to EOF, waiting on whichever becomes ready first.
fn drain_pipes(mut stdout: ChildStdout, mut stderr: ChildStderr) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();
    let mut out_open = true;
    let mut err_open = true;
    let mut chunk = [0u8; READ_CHUNK];

    while out_open || err_open {
        // poll(2) ignores negative descriptors, which retires a stream at EOF.
        let mut fds = [
            libc::pollfd {
                fd: if out_open { stdout.as_raw_fd() } else { -1 },
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: if err_open { stderr.as_raw_fd() } else { -1 },
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        // SAFETY: `fds` is a live array of two pollfd structs for the whole call.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }

        let ready = libc::POLLIN | libc::POLLHUP | libc::POLLERR;
        if out_open && fds[0].revents & ready != 0 {
            out_open = read_chunk(&mut stdout, &mut chunk, &mut out_buf)?;
        }
        if err_open && fds[1].revents & ready != 0 {
            err_open = read_chunk(&mut stderr, &mut chunk, &mut err_buf)?;
        }
    }

    Ok((out_buf, err_buf))
}

/// Read one chunk into `sink`. Returns false once the stream hits EOF.
fn read_chunk(reader: &mut impl Read, chunk: &mut [u8], sink: &mut Vec<u8>) -> io::Result<bool> {
    match reader.read(chunk) {
        Ok(0) => Ok(false),
        Ok(n) => {
            // Past the cap the bytes are dropped, one byte kept as overflow marker.
            let room = (MAX_OUTPUT_SIZE + 1).saturating_sub(sink.len());
            sink.extend_from_slice(&chunk[..n.min(room)]);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(true),
        Err(e) => Err(e),
    }
}

/// Truncate captured output to [`MAX_OUTPUT_SIZE`], preserving UTF-8 boundaries.
fn truncate_output(s: String, raw_len: usize) -> String {
    if raw_len <= MAX_OUTPUT_SIZE && s.len() <= MAX_OUTPUT_SIZE {
        return s;
    }
    let mut end = MAX_OUTPUT_SIZE.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_string();
    truncated.push_str("\n... [output truncated]");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> ProcessExecutor {
        ProcessExecutor::new(std::env::temp_dir())
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_execute_echo() {
        let result = executor()
            .execute("echo", &["hello".to_string()], &HashMap::new(), true)
            .unwrap();
        assert_eq!(result.return_code, 0);
        assert_eq!(result.stdout.trim(), "hello");
        assert!(result.stderr.is_empty());
        assert!(result.stage.is_none());
    }

    #[test]
    fn test_execute_exit_code_and_stderr() {
        let result = executor()
            .execute("sh", &sh("echo oops >&2; exit 42"), &HashMap::new(), true)
            .unwrap();
        assert_eq!(result.return_code, 42);
        assert!(result.stdout.is_empty());
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[test]
    fn test_signal_maps_to_sentinel() {
        let result = executor()
            .execute("sh", &sh("kill -9 $$"), &HashMap::new(), true)
            .unwrap();
        assert_eq!(result.return_code, SIGNALED_RETURN_CODE);
    }

    #[test]
    fn test_environment_is_sanitized() {
        std::env::set_var("KEEL_EXEC_TEST_LEAK", "leaked");
        let mut env = HashMap::new();
        env.insert("GREETING".to_string(), "hi".to_string());

        let result = executor()
            .execute(
                "sh",
                &sh("echo \"$GREETING:${KEEL_EXEC_TEST_LEAK:-unset}:${PATH:+path}\""),
                &env,
                true,
            )
            .unwrap();
        assert_eq!(result.stdout.trim(), "hi:unset:path");
    }

    #[test]
    fn test_caller_path_wins() {
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), "/custom/bin:/bin:/usr/bin".to_string());
        let result = executor()
            .execute("sh", &sh("echo $PATH"), &env, true)
            .unwrap();
        assert_eq!(result.stdout.trim(), "/custom/bin:/bin:/usr/bin");
    }

    #[test]
    fn test_runs_in_sandbox_root() {
        let root = std::fs::canonicalize(std::env::temp_dir()).unwrap();
        let result = ProcessExecutor::new(&root)
            .execute("sh", &sh("pwd"), &HashMap::new(), true)
            .unwrap();
        assert_eq!(result.stdout.trim(), root.to_string_lossy());
    }

    #[test]
    fn test_child_leads_new_session() {
        // Field 6 of /proc/<pid>/stat is the session id.
        let script = "awk '{ print ($6 == $1) ? \"leader\" : \"member\" }' /proc/$$/stat";
        let result = executor()
            .execute("sh", &sh(script), &HashMap::new(), true)
            .unwrap();
        assert_eq!(result.stdout.trim(), "leader");
    }

    #[test]
    fn test_both_pipes_full_does_not_deadlock() {
        // 256 KiB to each stream, well past the default 64 KiB pipe buffer.
        let script = "head -c 262144 /dev/zero | tr '\\0' 'o'; \
                      head -c 262144 /dev/zero | tr '\\0' 'e' >&2; \
                      head -c 262144 /dev/zero | tr '\\0' 'o'";
        let result = executor()
            .execute("sh", &sh(script), &HashMap::new(), true)
            .unwrap();
        assert_eq!(result.return_code, 0);
        assert_eq!(result.stdout.len(), 2 * 262144);
        assert_eq!(result.stderr.len(), 262144);
    }

    #[test]
    fn test_output_is_truncated() {
        let script = "head -c 2000000 /dev/zero | tr '\\0' 'x'";
        let result = executor()
            .execute("sh", &sh(script), &HashMap::new(), true)
            .unwrap();
        assert_eq!(result.return_code, 0);
        assert!(result.stdout.ends_with("... [output truncated]"));
        assert!(result.stdout.len() < 2_000_000);
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let err = executor()
            .execute("keel-definitely-not-a-program", &[], &HashMap::new(), true)
            .unwrap_err();
        assert!(matches!(err, SandboxError::Spawn { .. }));
    }

    #[test]
    fn test_uncaptured_returns_empty_output() {
        let result = executor()
            .execute("true", &[], &HashMap::new(), false)
            .unwrap();
        assert_eq!(result.return_code, 0);
        assert!(result.stdout.is_empty());
    }
}
