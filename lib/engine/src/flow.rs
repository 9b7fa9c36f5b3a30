//! Flow script execution.
//!
//! A flow is an executable `flow.sh` in `{flows_root}/{flow_name}`. The
//! engine enters it three ways — initially, after a stage completes, and
//! after a stage fails — differing only in the environment. The flow's
//! stdout is never parsed; its sole way of producing work is calling the
//! scheduling HTTP endpoint advertised through `MAXQ_API`.

use crate::process::{spawn_script, ProcessError, ProcessOutput, SpawnSpec};
use crate::registry::{ProcessKey, ProcessRegistry};
use async_trait::async_trait;
use maxq_core::RunId;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Which entry point of the flow is being invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowInvocation {
    /// First invocation after run creation.
    Initial,
    /// A non-final stage completed; the flow should schedule what's next.
    StageCompleted { stage: String },
    /// A stage failed; the flow may react before the run is failed.
    StageFailed { stage: String },
}

/// Abstraction over flow invocation, so the scheduler can be exercised
/// without real scripts.
#[async_trait]
pub trait FlowRunner: Send + Sync {
    /// Runs `flow.sh` for the given run and entry point.
    async fn run_flow(
        &self,
        run_id: RunId,
        flow_name: &str,
        invocation: FlowInvocation,
    ) -> Result<ProcessOutput, ProcessError>;
}

/// The production flow runner.
pub struct FlowExecutor {
    flows_root: PathBuf,
    api_base: String,
    max_capture_bytes: usize,
    registry: ProcessRegistry,
}

impl FlowExecutor {
    /// Creates a flow executor.
    #[must_use]
    pub fn new(
        flows_root: PathBuf,
        api_base: String,
        max_capture_bytes: usize,
        registry: ProcessRegistry,
    ) -> Self {
        Self {
            flows_root,
            api_base,
            max_capture_bytes,
            registry,
        }
    }

    /// Directory of a flow.
    #[must_use]
    pub fn flow_dir(&self, flow_name: &str) -> PathBuf {
        self.flows_root.join(flow_name)
    }

    /// Path of a flow's script.
    #[must_use]
    pub fn flow_script(&self, flow_name: &str) -> PathBuf {
        self.flow_dir(flow_name).join("flow.sh")
    }

    /// Base environment shared by flow and step children of a run.
    #[must_use]
    pub fn base_env(&self, run_id: RunId, flow_name: &str) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("MAXQ_RUN_ID".to_string(), run_id.to_string());
        env.insert("MAXQ_FLOW_NAME".to_string(), flow_name.to_string());
        env.insert("MAXQ_API".to_string(), self.api_base.clone());
        env
    }
}

#[async_trait]
impl FlowRunner for FlowExecutor {
    async fn run_flow(
        &self,
        run_id: RunId,
        flow_name: &str,
        invocation: FlowInvocation,
    ) -> Result<ProcessOutput, ProcessError> {
        let mut env = self.base_env(run_id, flow_name);
        match &invocation {
            FlowInvocation::Initial => {}
            FlowInvocation::StageCompleted { stage } => {
                env.insert("MAXQ_COMPLETED_STAGE".to_string(), stage.clone());
            }
            FlowInvocation::StageFailed { stage } => {
                env.insert("MAXQ_FAILED_STAGE".to_string(), stage.clone());
            }
        }

        let spec = SpawnSpec {
            script: self.flow_script(flow_name),
            cwd: self.flow_dir(flow_name),
            env,
            max_capture_bytes: self.max_capture_bytes,
        };

        let key = ProcessKey::flow(run_id);
        let registry = self.registry.clone();
        let register_key = key.clone();
        let result = spawn_script(&spec, move |pid| registry.register(register_key, pid)).await;
        self.registry.unregister(&key);

        result
    }
}

#[derive(Debug, Default, Deserialize)]
struct FlowManifest {
    #[serde(default)]
    title: Option<String>,
}

/// Reads the optional `flow.yaml` of a flow and returns its `title`.
///
/// A missing file or missing key yields `None`; a malformed manifest is
/// logged at warn and ignored.
#[must_use]
pub fn read_flow_title(flows_root: &Path, flow_name: &str) -> Option<String> {
    let path = flows_root.join(flow_name).join("flow.yaml");
    let raw = std::fs::read_to_string(&path).ok()?;
    match serde_yaml::from_str::<FlowManifest>(&raw) {
        Ok(manifest) => manifest.title,
        Err(e) => {
            tracing::warn!(flow_name, error = %e, "ignoring malformed flow.yaml");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_flow(root: &Path, name: &str, body: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("flow.sh");
        let mut file = std::fs::File::create(&script).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        write!(file, "{body}").unwrap();
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    fn executor(root: &Path) -> FlowExecutor {
        FlowExecutor::new(
            root.to_path_buf(),
            "http://127.0.0.1:5003/api/v1".to_string(),
            8192,
            ProcessRegistry::new(),
        )
    }

    #[tokio::test]
    async fn initial_invocation_gets_base_env() {
        let root = tempfile::tempdir().unwrap();
        write_flow(
            root.path(),
            "greet",
            "echo \"$MAXQ_RUN_ID $MAXQ_FLOW_NAME $MAXQ_API\"\n",
        );

        let run_id = RunId::new();
        let output = executor(root.path())
            .run_flow(run_id, "greet", FlowInvocation::Initial)
            .await
            .unwrap();

        assert_eq!(output.exit_code, 0);
        assert_eq!(
            output.stdout.trim(),
            format!("{run_id} greet http://127.0.0.1:5003/api/v1")
        );
    }

    #[tokio::test]
    async fn callbacks_carry_the_stage_variable() {
        let root = tempfile::tempdir().unwrap();
        write_flow(
            root.path(),
            "greet",
            "echo \"completed=$MAXQ_COMPLETED_STAGE failed=$MAXQ_FAILED_STAGE\"\n",
        );

        let executor = executor(root.path());
        let run_id = RunId::new();

        let completed = executor
            .run_flow(
                run_id,
                "greet",
                FlowInvocation::StageCompleted {
                    stage: "build".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(completed.stdout.trim(), "completed=build failed=");

        let failed = executor
            .run_flow(
                run_id,
                "greet",
                FlowInvocation::StageFailed {
                    stage: "build".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.stdout.trim(), "completed= failed=build");
    }

    #[tokio::test]
    async fn missing_flow_script_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let err = executor(root.path())
            .run_flow(RunId::new(), "ghost", FlowInvocation::Initial)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::ScriptNotFound { .. }));
    }

    #[tokio::test]
    async fn flow_child_is_unregistered_after_exit() {
        let root = tempfile::tempdir().unwrap();
        write_flow(root.path(), "greet", "exit 0\n");

        let registry = ProcessRegistry::new();
        let executor = FlowExecutor::new(
            root.path().to_path_buf(),
            "http://127.0.0.1:5003/api/v1".to_string(),
            8192,
            registry.clone(),
        );

        executor
            .run_flow(RunId::new(), "greet", FlowInvocation::Initial)
            .await
            .unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn flow_title_read_from_manifest() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("greet");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("flow.yaml"), "title: Greeting pipeline\n").unwrap();

        assert_eq!(
            read_flow_title(root.path(), "greet").as_deref(),
            Some("Greeting pipeline")
        );
    }

    #[test]
    fn missing_manifest_or_title_is_none() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("greet");
        std::fs::create_dir_all(&dir).unwrap();

        assert!(read_flow_title(root.path(), "greet").is_none());

        std::fs::write(dir.join("flow.yaml"), "owner: someone\n").unwrap();
        assert!(read_flow_title(root.path(), "greet").is_none());
    }

    #[test]
    fn malformed_manifest_is_ignored() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("greet");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("flow.yaml"), ": not yaml [\n").unwrap();

        assert!(read_flow_title(root.path(), "greet").is_none());
    }
}
