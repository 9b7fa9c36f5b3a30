//! Startup reconciliation.
//!
//! Runs once at boot, before traffic is admitted. Orphan children from a
//! previous engine process are identified by the `MAXQ_RUN_ID` marker in
//! their environment and signalled (SIGTERM, grace, SIGKILL). Afterwards
//! every non-terminal run, stage and step in the store is failed with
//! `server_restart`, so no phantom running state survives a crash.

use crate::error::EngineError;
use crate::registry::sys;
use chrono::Utc;
use maxq_store::{Store, TerminationReason};
use std::time::Duration;

/// What the reconciler did at boot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileSummary {
    /// Orphan processes signalled.
    pub processes_killed: usize,
    /// Runs transitioned to failed.
    pub runs_failed: usize,
}

/// Kills orphan children and fails phantom state.
///
/// # Errors
///
/// Propagates store failures; process-table scanning is best effort.
pub async fn reconcile_on_startup(
    store: &Store,
    grace: Duration,
) -> Result<ReconcileSummary, EngineError> {
    let processes_killed = kill_orphans(grace).await;

    let mut runs_failed = 0;
    let now = Utc::now();
    for run in store.runs().list_non_terminal().await? {
        store
            .runs()
            .terminate(run.id, TerminationReason::ServerRestart, now)
            .await?;
        store
            .stages()
            .terminate_by_run(run.id, TerminationReason::ServerRestart, now)
            .await?;
        store
            .steps()
            .terminate_by_run(run.id, TerminationReason::ServerRestart, now)
            .await?;
        tracing::info!(run_id = %run.id, "marked interrupted run as failed");
        runs_failed += 1;
    }

    if processes_killed > 0 || runs_failed > 0 {
        tracing::info!(processes_killed, runs_failed, "startup reconciliation finished");
    }

    Ok(ReconcileSummary {
        processes_killed,
        runs_failed,
    })
}

/// Signals every live process tagged with `MAXQ_RUN_ID`, excluding this
/// process and its own tree-root, waiting `grace` before SIGKILL.
async fn kill_orphans(grace: Duration) -> usize {
    let orphans = find_tagged_processes();
    if orphans.is_empty() {
        return 0;
    }

    for &pid in &orphans {
        tracing::warn!(pid, "terminating orphan child from a previous engine process");
        sys::terminate(pid);
    }

    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if !orphans.iter().any(|&pid| sys::alive(pid)) {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            for &pid in &orphans {
                if sys::alive(pid) {
                    sys::kill(pid);
                }
            }
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    orphans.len()
}

/// Scans the process table for children carrying `MAXQ_RUN_ID`.
#[cfg(target_os = "linux")]
fn find_tagged_processes() -> Vec<u32> {
    const MARKER: &[u8] = b"MAXQ_RUN_ID=";
    let own_pid = std::process::id();

    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut tagged = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if pid == own_pid {
            continue;
        }
        let Ok(environ) = std::fs::read(entry.path().join("environ")) else {
            continue;
        };
        if environ
            .split(|&b| b == 0)
            .any(|var| var.starts_with(MARKER))
        {
            tagged.push(pid);
        }
    }
    tagged
}

#[cfg(not(target_os = "linux"))]
fn find_tagged_processes() -> Vec<u32> {
    Vec::new()
}
