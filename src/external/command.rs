//! Base command execution abstraction
//!
//! Provides the foundational trait for executing external commands, enabling
//! dependency injection for testing, plus the bounded worker pool every
//! backend invocation is routed through.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::observability::BackendMetrics;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    /// Stdout and stderr joined, for diagnostics and marker scanning
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.stdout.trim().to_string(),
            (true, false) => self.stderr.trim().to_string(),
            (false, false) => format!("{}\n{}", self.stdout.trim(), self.stderr.trim()),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum CommandError {
    #[error("Command execution failed: {message}")]
    ExecutionFailed { message: String },
    #[error("Command not found: {command}")]
    CommandNotFound { command: String },
    #[error("Command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("IO error: {message}")]
    Io { message: String },
}

/// Trait for executing external commands
///
/// This abstraction allows the rest of the codebase to execute commands
/// without directly depending on a process API, enabling testing
/// with mock implementations.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError>;
}

/// Real implementation using `tokio::process::Command`
pub struct ProcessCommandExecutor;

#[async_trait]
impl CommandExecutor for ProcessCommandExecutor {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CommandError::CommandNotFound {
                        command: program.to_string(),
                    }
                } else {
                    CommandError::Io { message: e.to_string() }
                }
            })?;

        Ok(CommandOutput {
            status_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Worker pool in front of another executor.
///
/// At most `max_concurrent` commands run at once; each one is cut off after
/// `timeout`.
pub struct BoundedExecutor {
    inner: Arc<dyn CommandExecutor>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    metrics: Arc<BackendMetrics>,
}

impl BoundedExecutor {
    pub fn new(
        inner: Arc<dyn CommandExecutor>,
        max_concurrent: usize,
        timeout: Duration,
        metrics: Arc<BackendMetrics>,
    ) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
            metrics,
        }
    }

    /// Permits currently free in the pool
    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl CommandExecutor for BoundedExecutor {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CommandError::ExecutionFailed {
                message: "backend worker pool is closed".to_string(),
            })?;

        self.metrics.record_command();
        debug!(program = %program, args = ?args, "Running backend command");

        match tokio::time::timeout(self.timeout, self.inner.execute(program, args)).await {
            Ok(Ok(output)) => {
                if !output.success() {
                    self.metrics.record_failure();
                }
                Ok(output)
            }
            Ok(Err(e)) => {
                self.metrics.record_failure();
                Err(e)
            }
            Err(_) => {
                self.metrics.record_timeout();
                let timeout_ms = self.timeout.as_millis() as u64;
                warn!(program = %program, args = ?args, timeout_ms, "Backend command timed out");
                Err(CommandError::Timeout { timeout_ms })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Sleeps for a fixed time and tracks how many calls overlap
    struct SlowExecutor {
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowExecutor {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CommandExecutor for SlowExecutor {
        async fn execute(&self, _program: &str, _args: &[&str]) -> Result<CommandOutput, CommandError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(CommandOutput {
                status_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_process_command_executor_success() {
        let executor = ProcessCommandExecutor;
        let result = executor.execute("echo", &["hello"]).await;

        assert!(result.is_ok());
        let output = result.unwrap();
        assert!(output.success());
        assert!(output.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_process_command_executor_command_not_found() {
        let executor = ProcessCommandExecutor;
        let result = executor.execute("nonexistent_command_xyz", &[]).await;

        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), CommandError::CommandNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_executor_caps_concurrency() {
        let slow = Arc::new(SlowExecutor::new(Duration::from_millis(50)));
        let metrics = Arc::new(BackendMetrics::new());
        let pool = Arc::new(BoundedExecutor::new(
            slow.clone(),
            2,
            Duration::from_secs(5),
            metrics.clone(),
        ));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.execute("git", &["status"]).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(slow.peak.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.get_stats().commands, 6);
        assert_eq!(pool.available_workers(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_executor_times_out_slow_commands() {
        let slow = Arc::new(SlowExecutor::new(Duration::from_secs(10)));
        let metrics = Arc::new(BackendMetrics::new());
        let pool = BoundedExecutor::new(slow, 1, Duration::from_millis(100), metrics.clone());

        let result = pool.execute("git", &["merge", "x"]).await;

        assert!(matches!(result, Err(CommandError::Timeout { timeout_ms: 100 })));
        assert_eq!(metrics.get_stats().timeouts, 1);
        // The permit is released once the timed-out call is dropped
        assert_eq!(pool.available_workers(), 1);
    }

    #[test]
    fn combined_output_joins_both_streams() {
        let output = CommandOutput {
            status_code: 1,
            stdout: "CONFLICT (content): Merge conflict in a.txt\n".to_string(),
            stderr: "error: merge failed\n".to_string(),
        };
        assert_eq!(
            output.combined(),
            "CONFLICT (content): Merge conflict in a.txt\nerror: merge failed"
        );
    }
}
