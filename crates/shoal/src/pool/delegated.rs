//! Delegated pool: each task runs as an external process
//!
//! The task payload is written to the child's stdin as JSON. Stdout is the
//! result: parsed as JSON when possible, otherwise kept as a string. A
//! non-zero exit fails the task with the child's stderr.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::{PoolBackend, PoolRuntime};
use crate::error::{OrchestratorError, Result};
use crate::types::{Task, TaskId, TaskResult};

/// Program launched once per task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatedConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl DelegatedConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    /// Split a whitespace-separated command line into program and args
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program).with_args(parts))
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(OrchestratorError::Config(
                "delegated pool program must not be empty".into(),
            ));
        }
        Ok(())
    }
}

pub struct DelegatedPool {
    runtime: PoolRuntime,
    config: DelegatedConfig,
    running: Mutex<HashMap<TaskId, CancellationToken>>,
}

impl DelegatedPool {
    pub fn new(runtime: PoolRuntime, config: DelegatedConfig) -> Self {
        Self {
            runtime,
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    async fn run_process(&self, task: &Task) -> Result<serde_json::Value> {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        let input = serde_json::to_vec(&task.payload)?;
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A child that exits without reading its input is not an error
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OrchestratorError::BackendExecution {
                pool_id: self.runtime.pool_id().clone(),
                task_id: task.id,
                message: format!(
                    "{} exited with {}: {}",
                    self.config.program,
                    output.status,
                    stderr.trim()
                ),
            });
        }
        Ok(parse_output(&output.stdout))
    }
}

/// JSON when stdout parses as JSON, `null` when empty, a string otherwise
fn parse_output(stdout: &[u8]) -> serde_json::Value {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string()))
}

/// Unregisters the cancellation token when the execution ends
struct Registration<'a> {
    running: &'a Mutex<HashMap<TaskId, CancellationToken>>,
    task_id: TaskId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(&self.task_id);
    }
}

#[async_trait]
impl PoolBackend for DelegatedPool {
    fn runtime(&self) -> &PoolRuntime {
        &self.runtime
    }

    #[instrument(skip(self, task), fields(pool_id = %self.runtime.pool_id(), task_id = %task.id))]
    async fn execute(&self, task: Task) -> Result<TaskResult> {
        let lease = self.runtime.checkout(task.id)?;
        let token = CancellationToken::new();
        self.running.lock().insert(task.id, token.clone());
        let _registration = Registration {
            running: &self.running,
            task_id: task.id,
        };
        let started = Instant::now();

        // Losing the race drops the child, and kill_on_drop reaps it
        let outcome = tokio::select! {
            outcome = self.run_process(&task) => outcome,
            _ = token.cancelled() => Err(OrchestratorError::BackendExecution {
                pool_id: self.runtime.pool_id().clone(),
                task_id: task.id,
                message: "task cancelled".into(),
            }),
        };

        let output = match outcome {
            Ok(output) => output,
            Err(e) => {
                lease.complete();
                return Err(e);
            }
        };

        let result = TaskResult {
            task_id: task.id,
            pool_id: self.runtime.pool_id().clone(),
            worker_id: lease.worker_id(),
            output,
            duration: started.elapsed(),
            completed_at: Utc::now(),
        };
        self.runtime.record_result(result.clone());
        lease.complete();
        Ok(result)
    }

    async fn cancel(&self, task_id: TaskId) {
        if let Some(token) = self.running.lock().get(&task_id) {
            debug!(pool_id = %self.runtime.pool_id(), task_id = %task_id, "Killing delegated process");
            token.cancel();
        }
    }

    async fn close(&self) -> Result<()> {
        self.runtime.close()?;
        for token in self.running.lock().values() {
            token.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::OrchestratorMetrics;
    use crate::pool::{spawn_pool, PoolSpec};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn sh(script: &str) -> DelegatedConfig {
        DelegatedConfig::new("sh").with_args(["-c", script])
    }

    fn pool(config: DelegatedConfig) -> Arc<dyn PoolBackend> {
        spawn_pool(
            PoolSpec::delegated("procs", 2, config),
            Arc::new(OrchestratorMetrics::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_from_command_line() {
        let config = DelegatedConfig::from_command_line("python3 -m worker --fast").unwrap();
        assert_eq!(config.program, "python3");
        assert_eq!(config.args, vec!["-m", "worker", "--fast"]);
        assert!(DelegatedConfig::from_command_line("   ").is_none());
    }

    #[test]
    fn test_parse_output() {
        assert_eq!(parse_output(b"{\"a\":1}\n"), json!({"a": 1}));
        assert_eq!(parse_output(b"  \n"), serde_json::Value::Null);
        assert_eq!(parse_output(b"plain text\n"), json!("plain text"));
    }

    #[tokio::test]
    async fn test_payload_round_trips_through_child() {
        let pool = pool(DelegatedConfig::new("cat"));
        let result = pool
            .execute(Task::new(json!({"prompt": "hi", "n": 3})))
            .await
            .unwrap();
        assert_eq!(result.output, json!({"prompt": "hi", "n": 3}));
        assert_eq!(pool.collect_results().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let pool = pool(sh("echo 'model not loaded' >&2; exit 3"));
        let err = pool.execute(Task::new(json!({}))).await.unwrap_err();
        match err {
            OrchestratorError::BackendExecution { message, .. } => {
                assert!(message.contains("model not loaded"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(pool.status().await.unwrap().pending_results, 0);
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let pool = pool(DelegatedConfig::new("/nonexistent/shoal-worker"));
        let err = pool.execute(Task::new(json!({}))).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Io(_)));
        assert_eq!(pool.status().await.unwrap().idle_workers, 2);
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let pool = pool(sh("sleep 30"));
        let task = Task::new(json!({}));
        let task_id = task.id;
        let execution = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.execute(task).await })
        };
        while pool.runtime().status().busy_workers == 0 {
            tokio::task::yield_now().await;
        }
        pool.cancel(task_id).await;

        let result = tokio::time::timeout(Duration::from_secs(5), execution)
            .await
            .expect("cancel should end the execution")
            .unwrap();
        assert!(result.unwrap_err().to_string().contains("cancelled"));
    }
}
