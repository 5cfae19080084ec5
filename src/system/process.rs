// src/system/process.rs

use crate::CancellationToken;
use crate::core::context::ContextIo;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::env;
use std::io::Read;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Shell '{0}' could not be executed: {1}")]
    CommandFailed(String, #[source] std::io::Error),
    #[error("Operation was cancelled by the user.")]
    Cancelled,
}

/// A script to run through a shell.
#[derive(Debug, Clone)]
pub struct ScriptRequest<'a> {
    pub shell: &'a Path,
    pub script: &'a str,
    pub env: Vec<(String, String)>,
    /// Put the shell in its own process group and signal the whole group
    /// on cancellation.
    pub own_process_group: bool,
}

/// Where the script's standard streams go.
#[derive(Debug)]
pub enum ScriptIo {
    /// The invocation's own streams; missing ones become `/dev/null`.
    Streams(ContextIo),
    /// Collect stdout and stderr in memory.
    Capture,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

fn stdio_from(stream: Option<UnixStream>) -> Stdio {
    stream.map_or_else(Stdio::null, |s| Stdio::from(OwnedFd::from(s)))
}

/// The shell convention: the exit code, or 128 plus the terminating signal.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

fn collect(pipe: Option<impl Read + Send + 'static>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            if let Err(e) = pipe.read_to_end(&mut buffer) {
                log::debug!("Reading script output failed: {}", e);
            }
            buffer
        })
    })
}

fn terminate(child: &mut Child, own_process_group: bool) {
    let id = child.id();
    let killed_group = own_process_group
        && i32::try_from(id)
            .map(|pid| killpg(Pid::from_raw(pid), Signal::SIGKILL).is_ok())
            .unwrap_or(false);
    if !killed_group {
        if let Err(e) = child.kill() {
            log::warn!("Failed to kill child process {}: {}", id, e);
        }
    }
    // Reap it so no zombie is left behind.
    child.wait().ok();
}

/// Runs a script through `shell -c`, waiting for it while watching the
/// cancellation token. On cancellation the process (or its group) is killed.
pub fn run_script(
    request: &ScriptRequest<'_>,
    io: ScriptIo,
    cancellation_token: &CancellationToken,
) -> Result<ScriptOutcome, ExecutionError> {
    if request.script.trim().is_empty() {
        return Ok(ScriptOutcome::default());
    }

    let mut command = Command::new(request.shell);
    command.arg("-c").arg(request.script).envs(request.env.iter().cloned());
    if request.own_process_group {
        command.process_group(0);
    }

    let capturing = matches!(io, ScriptIo::Capture);
    match io {
        ScriptIo::Streams(streams) => {
            command
                .stdin(stdio_from(streams.stdin))
                .stdout(stdio_from(streams.stdout))
                .stderr(stdio_from(streams.stderr));
        }
        ScriptIo::Capture => {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }
    }

    let shell_name = request.shell.display().to_string();
    let mut child = command
        .spawn()
        .map_err(|e| ExecutionError::CommandFailed(shell_name.clone(), e))?;
    // The command still holds the parent's copies of the streams.
    drop(command);

    let stdout = collect(child.stdout.take());
    let stderr = collect(child.stderr.take());

    // Non-blocking wait loop to allow for cancellation.
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if cancellation_token.load(Ordering::Relaxed) {
                    log::debug!(
                        "Cancellation requested, killing script process (PID: {})...",
                        child.id()
                    );
                    terminate(&mut child, request.own_process_group);
                    return Err(ExecutionError::Cancelled);
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(ExecutionError::CommandFailed(shell_name, e)),
        }
    };

    let join = |handle: Option<JoinHandle<Vec<u8>>>| {
        handle.and_then(|h| h.join().ok()).unwrap_or_default()
    };
    let outcome = ScriptOutcome {
        code: exit_code(status),
        stdout: join(stdout),
        stderr: join(stderr),
    };
    log::trace!(
        "Script finished with {} (captured: {})",
        outcome.code,
        capturing
    );
    Ok(outcome)
}

/// True if `shell` names an existing file, directly or through `PATH`.
pub fn shell_exists(shell: &Path) -> bool {
    if shell.components().count() > 1 {
        return shell.is_file();
    }
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|dir| dir.join(shell).is_file()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    fn request<'a>(script: &'a str) -> ScriptRequest<'a> {
        ScriptRequest {
            shell: Path::new("/bin/sh"),
            script,
            env: vec![("KSHELL_PARAM_name".to_string(), "world".to_string())],
            own_process_group: false,
        }
    }

    #[test]
    fn test_run_script_captures_output_and_env() {
        // Setup
        let token = Arc::new(AtomicBool::new(false));

        // Execute
        let outcome = run_script(
            &request("echo hello $KSHELL_PARAM_name; echo oops >&2; exit 3"),
            ScriptIo::Capture,
            &token,
        )
        .unwrap();

        // Assert
        assert_eq!(outcome.code, 3);
        assert_eq!(outcome.stdout, b"hello world\n");
        assert_eq!(outcome.stderr, b"oops\n");
    }

    #[test]
    fn test_run_script_writes_to_streams() {
        // Setup
        let (mut reader, writer) = UnixStream::pair().unwrap();
        let io = ContextIo {
            stdout: Some(writer),
            ..ContextIo::default()
        };
        let token = Arc::new(AtomicBool::new(false));

        // Execute
        let outcome = run_script(&request("printf streamed"), ScriptIo::Streams(io), &token).unwrap();

        // Assert
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(outcome.code, 0);
        assert_eq!(out, "streamed");
    }

    #[test]
    fn test_cancellation_kills_process_group() {
        // Setup
        let token = Arc::new(AtomicBool::new(false));
        let mut req = request("sleep 5; sleep 5");
        req.own_process_group = true;
        let flag = Arc::clone(&token);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            flag.store(true, Ordering::Relaxed);
        });

        // Execute
        let started = Instant::now();
        let result = run_script(&req, ScriptIo::Capture, &token);

        // Assert
        assert!(matches!(result, Err(ExecutionError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_empty_script_is_success() {
        let token = Arc::new(AtomicBool::new(false));
        let outcome = run_script(&request("  "), ScriptIo::Capture, &token).unwrap();
        assert_eq!(outcome.code, 0);
    }

    #[test]
    fn test_shell_exists() {
        assert!(shell_exists(Path::new("/bin/sh")));
        assert!(shell_exists(Path::new("sh")));
        assert!(!shell_exists(Path::new("/definitely/not/a/shell")));
    }
}
