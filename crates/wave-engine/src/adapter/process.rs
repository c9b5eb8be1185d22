//! Process-group spawn and graceful termination for adapter subprocesses.

use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

pub const TERMINATION_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Spawn `command` in its own process group so the whole subtree can be
/// signaled at once on cancellation.
pub fn spawn_in_process_group(
    command: &str,
    args: &[String],
    workspace_path: &Path,
    env: &std::collections::BTreeMap<String, String>,
) -> std::io::Result<Child> {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .current_dir(workspace_path)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    cmd.spawn()
}

/// Send SIGTERM to the process group, then SIGKILL after the grace period if
/// it hasn't exited. `pid` is the child's own pid, which is also its process
/// group id because it was spawned with `process_group(0)`.
pub async fn terminate_process_group(child: &mut Child, pid: u32) {
    // SAFETY: negative pid addresses the whole process group; pid came from
    // a `Child` we spawned with `process_group(0)`, so the group exists and
    // is ours to signal.
    unsafe {
        libc::kill(-(pid as i32), libc::SIGTERM);
    }
    let grace = tokio::time::sleep(TERMINATION_GRACE_PERIOD);
    tokio::select! {
        _ = child.wait() => {}
        () = grace => {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
            let _ = child.wait().await;
        }
    }
}

/// Read a child's stdout line-by-line, invoking `on_line` for each, until EOF
/// or the cancellation token fires (in which case the process group is
/// signaled and termination awaited).
pub async fn stream_stdout_until_done(
    mut child: Child,
    cancel: CancellationToken,
    mut on_line: impl FnMut(&str),
) -> std::io::Result<(std::process::ExitStatus, String)> {
    let pid = child.id().expect("child already reaped");
    let stdout = child.stdout.take().expect("stdout was piped");
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => on_line(&line),
                    None => break,
                }
            }
            () = cancel.cancelled() => {
                terminate_process_group(&mut child, pid).await;
                let status = child.wait().await?;
                return Ok((status, String::new()));
            }
        }
    }

    let status = child.wait().await?;
    let mut stderr = String::new();
    if let Some(mut stderr_handle) = child.stderr.take() {
        use tokio::io::AsyncReadExt;
        let _ = stderr_handle.read_to_string(&mut stderr).await;
    }
    Ok((status, stderr))
}
