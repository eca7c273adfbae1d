//! Deadline-bounded execution of external commands.
//!
//! Commands run in their own process group. On deadline the whole group is
//! SIGKILLed: `docker compose` spawns grandchildren that inherit our pipes,
//! and killing only the direct child would leave them holding the pipes
//! (and the container) forever.

use std::{process::Stdio, time::Duration};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, info};

use crate::ComposeError;

#[derive(Debug, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `program args...` with extra environment variables, capturing output.
pub async fn check_output(
    deadline: Duration,
    env: &[(String, String)],
    program: &str,
    args: &[&str],
) -> Result<CommandOutput, ComposeError> {
    check_output_with_stdin(deadline, env, program, args, None).await
}

/// Like [`check_output`], optionally feeding `stdin` to the child.
pub async fn check_output_with_stdin(
    deadline: Duration,
    env: &[(String, String)],
    program: &str,
    args: &[&str],
    stdin: Option<&[u8]>,
) -> Result<CommandOutput, ComposeError> {
    let command_line = format!("{program} {}", args.join(" "));
    debug!(command = %command_line, ?deadline, "executing command");

    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .process_group(0)
        .kill_on_drop(true);
    for (key, value) in env {
        command.env(key, value);
    }

    let mut child = command.spawn().map_err(|source| ComposeError::Spawn {
        command: command_line.clone(),
        source,
    })?;
    let pid = child.id();

    if let (Some(payload), Some(mut handle)) = (stdin, child.stdin.take()) {
        let payload = payload.to_vec();
        tokio::spawn(async move {
            let _ = handle.write_all(&payload).await;
            drop(handle);
        });
    }

    let waited = tokio::time::timeout(deadline, child.wait_with_output()).await;
    match waited {
        Ok(Ok(output)) => {
            let result = CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            if output.status.success() {
                Ok(result)
            } else {
                Err(ComposeError::Command {
                    command: command_line,
                    stderr: result.stderr.trim().to_owned(),
                    timed_out: false,
                })
            }
        }
        Ok(Err(source)) => Err(ComposeError::Spawn { command: command_line, source }),
        Err(_elapsed) => {
            if let Some(pid) = pid {
                // kill the group, not just the child, to take stuck
                // grandchildren down with it
                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
            Err(ComposeError::Command {
                command: command_line,
                stderr: String::new(),
                timed_out: true,
            })
        }
    }
}

/// Run a command and log its output at info level, as the original operator
/// would see it in the journal.
pub async fn execute_and_log(
    deadline: Duration,
    env: &[(String, String)],
    program: &str,
    args: &[&str],
) -> Result<(), ComposeError> {
    info!(command = program, ?args, "executing command");
    let output = check_output(deadline, env, program, args).await?;
    if !output.stdout.is_empty() {
        info!(command = program, stdout = %output.stdout.trim_end(), "command output");
    }
    if !output.stderr.is_empty() {
        info!(command = program, stderr = %output.stderr.trim_end(), "command output");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_env() {
        let output = check_output(
            Duration::from_secs(5),
            &[("HELMSMAN_TEST_VAR".to_owned(), "42".to_owned())],
            "sh",
            &["-c", "printf '%s' \"$HELMSMAN_TEST_VAR\""],
        )
        .await
        .unwrap();
        assert_eq!(output.stdout, "42");
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error_with_stderr() {
        let err = check_output(
            Duration::from_secs(5),
            &[],
            "sh",
            &["-c", "echo boom >&2; exit 3"],
        )
        .await
        .unwrap_err();
        match err {
            ComposeError::Command { stderr, timed_out, .. } => {
                assert_eq!(stderr, "boom");
                assert!(!timed_out);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn deadline_kills_the_process_group() {
        let start = std::time::Instant::now();
        let err = check_output(
            Duration::from_millis(200),
            &[],
            "sh",
            &["-c", "sleep 30"],
        )
        .await
        .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(5));
        match err {
            ComposeError::Command { timed_out, .. } => assert!(timed_out),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn stdin_is_forwarded() {
        let output = check_output_with_stdin(
            Duration::from_secs(5),
            &[],
            "cat",
            &[],
            Some(b"hello"),
        )
        .await
        .unwrap();
        assert_eq!(output.stdout, "hello");
    }
}
