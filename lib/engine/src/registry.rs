//! Registry of live child processes.
//!
//! Each worker keeps a table of the children it spawned, keyed by
//! `(run_id, role, step_id?)`, so abort/pause can signal everything a run
//! owns. Registration must happen inside the supervisor's `on_spawn`
//! callback, which runs before the first await, so a child is observable
//! from the instant it exists.

use maxq_core::RunId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Whether a registered child is a flow script or a step script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    Flow,
    Step,
}

/// Registry key for one child process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessKey {
    pub run_id: RunId,
    pub role: ProcessRole,
    pub step_id: Option<String>,
}

impl ProcessKey {
    /// Key for a flow invocation of a run.
    #[must_use]
    pub fn flow(run_id: RunId) -> Self {
        Self {
            run_id,
            role: ProcessRole::Flow,
            step_id: None,
        }
    }

    /// Key for a step execution of a run.
    #[must_use]
    pub fn step(run_id: RunId, step_id: impl Into<String>) -> Self {
        Self {
            run_id,
            role: ProcessRole::Step,
            step_id: Some(step_id.into()),
        }
    }
}

/// Thread-safe table of live child pids.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<HashMap<ProcessKey, u32>>>,
}

impl ProcessRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a live child. An existing entry under the same key is
    /// replaced (a retry attempt reuses its step's key).
    pub fn register(&self, key: ProcessKey, pid: u32) {
        self.inner.lock().expect("registry poisoned").insert(key, pid);
    }

    /// Removes a child from the table.
    pub fn unregister(&self, key: &ProcessKey) {
        self.inner.lock().expect("registry poisoned").remove(key);
    }

    /// Number of live children currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry poisoned").len()
    }

    /// Returns true when no children are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pids currently registered for a run.
    #[must_use]
    pub fn pids_for_run(&self, run_id: RunId) -> Vec<u32> {
        self.inner
            .lock()
            .expect("registry poisoned")
            .iter()
            .filter(|(key, _)| key.run_id == run_id)
            .map(|(_, &pid)| pid)
            .collect()
    }

    /// Signals every process owned by a run: the polite signal first, then
    /// after up to `grace` the forceful signal to survivors.
    ///
    /// Returns the number of processes initially signalled.
    pub async fn kill_run(&self, run_id: RunId, grace: Duration) -> usize {
        let pids = self.pids_for_run(run_id);
        if pids.is_empty() {
            return 0;
        }

        for &pid in &pids {
            sys::terminate(pid);
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if !pids.iter().any(|&pid| sys::alive(pid)) {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                for &pid in &pids {
                    if sys::alive(pid) {
                        sys::kill(pid);
                    }
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        pids.len()
    }
}

/// Signal delivery, unix only. On other platforms the registry still
/// tracks children but cannot signal them.
#[cfg(unix)]
pub(crate) mod sys {
    /// Sends SIGTERM.
    pub fn terminate(pid: u32) {
        // Safety: kill with a valid signal number has no memory effects.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }

    /// Sends SIGKILL.
    pub fn kill(pid: u32) {
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
    }

    /// Probes liveness with signal 0.
    #[must_use]
    pub fn alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
}

#[cfg(not(unix))]
pub(crate) mod sys {
    pub fn terminate(_pid: u32) {}
    pub fn kill(_pid: u32) {}
    #[must_use]
    pub fn alive(_pid: u32) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let registry = ProcessRegistry::new();
        let run_id = RunId::new();

        registry.register(ProcessKey::flow(run_id), 100);
        registry.register(ProcessKey::step(run_id, "extract"), 101);
        assert_eq!(registry.len(), 2);

        let mut pids = registry.pids_for_run(run_id);
        pids.sort_unstable();
        assert_eq!(pids, vec![100, 101]);

        registry.unregister(&ProcessKey::flow(run_id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn runs_do_not_see_each_others_children() {
        let registry = ProcessRegistry::new();
        let run_a = RunId::new();
        let run_b = RunId::new();

        registry.register(ProcessKey::step(run_a, "a"), 200);
        registry.register(ProcessKey::step(run_b, "b"), 201);

        assert_eq!(registry.pids_for_run(run_a), vec![200]);
        assert_eq!(registry.pids_for_run(run_b), vec![201]);
    }

    #[test]
    fn reregistering_a_step_replaces_the_pid() {
        let registry = ProcessRegistry::new();
        let run_id = RunId::new();

        registry.register(ProcessKey::step(run_id, "a"), 300);
        registry.register(ProcessKey::step(run_id, "a"), 301);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.pids_for_run(run_id), vec![301]);
    }

    #[tokio::test]
    async fn kill_run_with_no_children_returns_zero() {
        let registry = ProcessRegistry::new();
        let killed = registry
            .kill_run(RunId::new(), Duration::from_millis(10))
            .await;
        assert_eq!(killed, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_run_terminates_a_sleeping_child() {
        let registry = ProcessRegistry::new();
        let run_id = RunId::new();

        let mut child = tokio::process::Command::new("/bin/sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        registry.register(ProcessKey::step(run_id, "sleepy"), pid);

        let killed = registry.kill_run(run_id, Duration::from_millis(500)).await;
        assert_eq!(killed, 1);

        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
