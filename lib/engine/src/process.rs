//! Child process supervision.
//!
//! Spawns flow and step scripts with a sanitised environment, captures
//! bounded stdout/stderr, and reports the exit code and wall-clock
//! duration. The caller observes the child the instant it exists through
//! the synchronous `on_spawn` callback, before the first await point, so
//! the process registry can never miss a live child.

use maxq_core::validate_env_key;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Marker appended to a capture buffer that hit its byte limit.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Errors from spawning or supervising a child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The script path does not exist or is not a regular file.
    ScriptNotFound { path: PathBuf },
    /// The script exists but is not executable.
    ScriptNotExecutable { path: PathBuf },
    /// An environment key failed validation.
    InvalidEnvKey { key: String },
    /// The OS refused the spawn.
    SpawnFailed { path: PathBuf, message: String },
    /// I/O failure while supervising the child.
    WaitFailed { message: String },
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScriptNotFound { path } => {
                write!(f, "script not found: {}", path.display())
            }
            Self::ScriptNotExecutable { path } => {
                write!(f, "script is not executable: {}", path.display())
            }
            Self::InvalidEnvKey { key } => {
                write!(f, "invalid env key '{key}': must match [A-Z_][A-Z0-9_]*")
            }
            Self::SpawnFailed { path, message } => {
                write!(f, "failed to spawn {}: {message}", path.display())
            }
            Self::WaitFailed { message } => write!(f, "failed waiting on child: {message}"),
        }
    }
}

impl std::error::Error for ProcessError {}

/// What to spawn and how to capture it.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Absolute path of the script to execute.
    pub script: PathBuf,
    /// Working directory for the child.
    pub cwd: PathBuf,
    /// Extra environment applied over the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Per-stream capture limit in bytes.
    pub max_capture_bytes: usize,
}

/// Result of a supervised child process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Exit code; signal-induced exits map to `128 + signal`.
    pub exit_code: i32,
    /// Captured stdout, possibly truncated.
    pub stdout: String,
    /// Captured stderr, possibly truncated.
    pub stderr: String,
    /// Wall-clock duration from just before spawn to just after exit.
    pub duration_ms: i64,
}

impl ProcessOutput {
    /// Returns true when the child exited zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Reads a stream to EOF, keeping at most `max_bytes` and marking overflow.
///
/// The stream is always drained fully so a chatty child never deadlocks on
/// a full pipe buffer; bytes past the limit are discarded.
async fn capture_stream<R: AsyncRead + Unpin>(mut reader: R, max_bytes: usize) -> String {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buffer.len() < max_bytes {
                    let take = n.min(max_bytes - buffer.len());
                    buffer.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }

    let mut text = String::from_utf8_lossy(&buffer).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

fn preflight(script: &Path) -> Result<(), ProcessError> {
    let metadata = std::fs::metadata(script).map_err(|_| ProcessError::ScriptNotFound {
        path: script.to_path_buf(),
    })?;
    if !metadata.is_file() {
        return Err(ProcessError::ScriptNotFound {
            path: script.to_path_buf(),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(ProcessError::ScriptNotExecutable {
                path: script.to_path_buf(),
            });
        }
    }

    Ok(())
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Spawns a script and supervises it to completion.
///
/// `on_spawn` is invoked synchronously with the child's pid the moment the
/// child exists, before any await point.
///
/// # Errors
///
/// Fails fast when the script is missing or not executable, when an env
/// key is invalid, or when the OS refuses the spawn. A non-zero exit is
/// not an error; it is reported through [`ProcessOutput::exit_code`].
pub async fn spawn_script(
    spec: &SpawnSpec,
    on_spawn: impl FnOnce(u32),
) -> Result<ProcessOutput, ProcessError> {
    preflight(&spec.script)?;

    for key in spec.env.keys() {
        validate_env_key(key).map_err(|_| ProcessError::InvalidEnvKey { key: key.clone() })?;
    }

    let mut command = Command::new(&spec.script);
    command
        .current_dir(&spec.cwd)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let started = Instant::now();
    let mut child = command.spawn().map_err(|e| ProcessError::SpawnFailed {
        path: spec.script.clone(),
        message: e.to_string(),
    })?;

    if let Some(pid) = child.id() {
        on_spawn(pid);
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let max = spec.max_capture_bytes;

    let stdout_task = async move {
        match stdout {
            Some(reader) => capture_stream(reader, max).await,
            None => String::new(),
        }
    };
    let stderr_task = async move {
        match stderr {
            Some(reader) => capture_stream(reader, max).await,
            None => String::new(),
        }
    };

    // Both streams drain concurrently with the wait so neither pipe can
    // fill up and wedge the child.
    let (stdout, stderr, status) = tokio::join!(stdout_task, stderr_task, child.wait());
    let status = status.map_err(|e| ProcessError::WaitFailed {
        message: e.to_string(),
    })?;

    let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

    Ok(ProcessOutput {
        exit_code: exit_code_of(status),
        stdout,
        stderr,
        duration_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        write!(file, "{body}").unwrap();
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn spec(script: PathBuf, cwd: PathBuf) -> SpawnSpec {
        SpawnSpec {
            script,
            cwd,
            env: BTreeMap::new(),
            max_capture_bytes: 8192,
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "ok.sh", "echo hi\nexit 0\n");

        let output = spawn_script(&spec(script, dir.path().to_path_buf()), |_| {})
            .await
            .unwrap();

        assert_eq!(output.exit_code, 0);
        assert!(output.success());
        assert_eq!(output.stdout, "hi\n");
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn reports_nonzero_exit_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "bad.sh", "echo oops >&2\nexit 3\n");

        let output = spawn_script(&spec(script, dir.path().to_path_buf()), |_| {})
            .await
            .unwrap();

        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
        assert_eq!(output.stderr, "oops\n");
    }

    #[tokio::test]
    async fn truncates_oversized_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "noisy.sh",
            "i=0\nwhile [ $i -lt 100 ]; do echo 0123456789012345678901234567890123456789; i=$((i+1)); done\n",
        );

        let mut spec = spec(script, dir.path().to_path_buf());
        spec.max_capture_bytes = 256;

        let output = spawn_script(&spec, |_| {}).await.unwrap();
        assert!(output.stdout.contains("output truncated"));
        assert!(output.stdout.len() <= 256 + TRUNCATION_MARKER.len());
    }

    #[tokio::test]
    async fn small_output_is_not_marked_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "short.sh", "echo brief\n");

        let output = spawn_script(&spec(script, dir.path().to_path_buf()), |_| {})
            .await
            .unwrap();
        assert!(!output.stdout.contains("output truncated"));
    }

    #[tokio::test]
    async fn missing_script_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let err = spawn_script(
            &spec(dir.path().join("ghost.sh"), dir.path().to_path_buf()),
            |_| {},
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ProcessError::ScriptNotFound { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_executable_script_fails_fast() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "plain.sh", "echo hi\n");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = spawn_script(&spec(script, dir.path().to_path_buf()), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::ScriptNotExecutable { .. }));
    }

    #[tokio::test]
    async fn invalid_env_key_aborts_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "ok.sh", "exit 0\n");

        let mut spec = spec(script, dir.path().to_path_buf());
        spec.env.insert("lower-case".to_string(), "x".to_string());

        let err = spawn_script(&spec, |_| {}).await.unwrap_err();
        assert_eq!(
            err,
            ProcessError::InvalidEnvKey {
                key: "lower-case".to_string()
            }
        );
    }

    #[tokio::test]
    async fn env_values_reach_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "env.sh", "echo \"$MAXQ_PROBE\"\n");

        let mut spec = spec(script, dir.path().to_path_buf());
        spec.env
            .insert("MAXQ_PROBE".to_string(), "probe-value".to_string());

        let output = spawn_script(&spec, |_| {}).await.unwrap();
        assert_eq!(output.stdout, "probe-value\n");
    }

    #[tokio::test]
    async fn on_spawn_sees_the_pid_before_completion() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "ok.sh", "exit 0\n");

        let mut seen = None;
        let output = spawn_script(&spec(script, dir.path().to_path_buf()), |pid| {
            seen = Some(pid);
        })
        .await
        .unwrap();

        assert!(seen.is_some());
        assert_eq!(output.exit_code, 0);
    }

    #[tokio::test]
    async fn duration_covers_the_child_lifetime() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "slow.sh", "sleep 0.2\n");

        let output = spawn_script(&spec(script, dir.path().to_path_buf()), |_| {})
            .await
            .unwrap();
        assert!(output.duration_ms >= 150, "duration was {}", output.duration_ms);
    }
}
