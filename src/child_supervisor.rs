//! Child Supervisor: spawns the runner subprocess, streams its output into
//! the viewer log, and enforces inactivity/iteration deadlines with a
//! terminate-then-kill escalation.
//!
//! Structured concurrency, following the teacher's pattern of one task per
//! concern (`sandbox_service.rs` runs one task per stream): one task copies
//! stdout, one copies stderr, one watches `last-run.log` for growth, and the
//! caller's own loop races the child's exit against a cancel token and the
//! two deadlines.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{CoreError, CoreResult, TimeoutKind};
use crate::state_store::append_viewer_log;

/// The two independent deadlines a child's invocation is bounded by.
#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
    pub inactivity: Duration,
    pub iteration: Duration,
}

/// What happened to a spawned child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildOutcome {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub timed_out: Option<TimeoutKind>,
}

impl ChildOutcome {
    /// Whether the child exited successfully (code 0, no signal, no timeout).
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none() && self.timed_out.is_none()
    }
}

/// Spawn `args[0]` with `args[1..]`, inheriting `env` and running in `cwd`.
/// Stdin is closed immediately. Returns once the child exits, is
/// cooperatively cancelled via `cancel`, or exceeds a deadline.
pub async fn run_child(
    args: &[String],
    env: &std::collections::HashMap<String, String>,
    cwd: &Path,
    log_path: &Path,
    state_dir: &Path,
    deadlines: Deadlines,
    cancel: CancellationToken,
    config: &Config,
) -> CoreResult<ChildOutcome> {
    let program = args.first().ok_or_else(|| {
        CoreError::Other(anyhow::anyhow!("run_child called with an empty argv"))
    })?;

    let mut command = Command::new(program);
    command
        .args(&args[1..])
        .current_dir(cwd)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    append_viewer_log(log_path, &format!("[RUNNER] spawning: {}", args.join(" "))).await?;

    let mut child = command.spawn().map_err(|e| CoreError::Sandbox {
        op: format!("spawn {}", args.join(" ")),
        stdout: String::new(),
        stderr: e.to_string(),
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_task = stdout.map(|s| tokio::spawn(stream_to_log(s, log_path.to_path_buf(), "STDOUT")));
    let stderr_task = stderr.map(|s| tokio::spawn(stream_to_log(s, log_path.to_path_buf(), "STDERR")));

    let last_run_log = state_dir.join("last-run.log");
    let last_growth = Arc::new(Mutex::new(Instant::now()));
    let watcher_cancel = CancellationToken::new();
    let watcher_task = tokio::spawn(watch_inactivity(
        last_run_log,
        last_growth.clone(),
        Duration::from_millis(config.child.inactivity_poll_ms),
        watcher_cancel.clone(),
    ));

    let iteration_start = Instant::now();
    let poll_interval = Duration::from_millis(config.child.inactivity_poll_ms);
    let kill_grace = Duration::from_secs(config.child.kill_grace_secs);

    let (status, timed_out) = tokio::select! {
        res = child.wait() => {
            (res.map_err(CoreError::Io)?, None)
        }
        _ = cancel.cancelled() => {
            append_viewer_log(log_path, "[STOP] terminating child").await?;
            (terminate_then_kill(&mut child, kill_grace).await?, None)
        }
        kind = wait_for_deadline(last_growth.clone(), iteration_start, deadlines, poll_interval) => {
            append_viewer_log(log_path, &format!("[TIMEOUT] {kind}")).await?;
            (terminate_then_kill(&mut child, kill_grace).await?, Some(kind))
        }
    };

    watcher_cancel.cancel();
    let _ = watcher_task.await;
    if let Some(t) = stdout_task {
        let _ = t.await;
    }
    if let Some(t) = stderr_task {
        let _ = t.await;
    }

    let signal = unix_signal(&status);
    let exit_code = status.code().unwrap_or_else(|| 128 + signal.unwrap_or(0));

    append_viewer_log(
        log_path,
        &format!("[RUNNER] exited: code={exit_code:?} signal={signal:?} timed_out={timed_out:?}"),
    )
    .await?;

    Ok(ChildOutcome {
        exit_code,
        signal,
        timed_out,
    })
}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Send SIGTERM, wait up to `grace`, then escalate to SIGKILL.
async fn terminate_then_kill(child: &mut Child, grace: Duration) -> CoreResult<std::process::ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid is a valid process id owned by this `Child`; SIGTERM is
        // a request the process may ignore, never undefined behavior.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Ok(status.map_err(CoreError::Io)?),
        Err(_) => {
            warn!("child did not exit within grace window, sending SIGKILL");
            child.start_kill().map_err(CoreError::Io)?;
            child.wait().await.map_err(CoreError::Io)
        }
    }
}

/// Poll `last_run_log`'s size/mtime, resetting `last_growth` on observed
/// growth, until cancelled.
async fn watch_inactivity(
    last_run_log: PathBuf,
    last_growth: Arc<Mutex<Instant>>,
    poll: Duration,
    cancel: CancellationToken,
) {
    let mut last_len: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(poll) => {}
        }
        if let Ok(meta) = tokio::fs::metadata(&last_run_log).await {
            let len = meta.len();
            if len != last_len {
                last_len = len;
                *last_growth.lock() = Instant::now();
            }
        }
    }
}

/// Resolve once either deadline is exceeded, returning which one fired.
/// Inactivity is checked before iteration, matching "whichever fires first"
/// with a stable tie-break.
async fn wait_for_deadline(
    last_growth: Arc<Mutex<Instant>>,
    iteration_start: Instant,
    deadlines: Deadlines,
    poll: Duration,
) -> TimeoutKind {
    loop {
        tokio::time::sleep(poll).await;
        let inactive_for = last_growth.lock().elapsed();
        if inactive_for >= deadlines.inactivity {
            return TimeoutKind::Inactivity;
        }
        if iteration_start.elapsed() >= deadlines.iteration {
            return TimeoutKind::Iteration;
        }
    }
}

async fn stream_to_log<R: tokio::io::AsyncRead + Unpin>(reader: R, log_path: PathBuf, tag: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if append_viewer_log(&log_path, &format!("[{tag}] {line}")).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                info!(error = %e, "error reading child {tag} stream");
                break;
            }
        }
    }
}
