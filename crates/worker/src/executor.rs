//! Job executors.
//!
//! An [`Executor`] turns a job's opaque payload into output bytes. The
//! default [`RunnerExecutor`] hands the payload to an external runner
//! program on stdin and collects its stdout.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use spark_core::job::JobHandle;

/// Longest stderr excerpt carried in a failure message.
const MAX_STDERR_EXCERPT: usize = 2048;

/// Runs one job payload to completion.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(&self, job: &JobHandle) -> Result<Vec<u8>, ExecutionError>;
}

/// Why an execution did not produce output.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The job ran and reported failure.
    #[error("{0}")]
    Failed(String),

    /// The execution itself died (killed, lost its process, ...).
    #[error("crashed: {0}")]
    Crashed(String),
}

/// Executes jobs by spawning the configured runner command.
///
/// The child receives the payload on stdin and `SPARK_JOB_ID` in its
/// environment. Exit status 0 is success and stdout becomes the job
/// output; a non-zero status is a job failure; death by signal is a
/// crash. The child is killed if the execution is aborted.
#[derive(Debug, Clone)]
pub struct RunnerExecutor {
    program: String,
    args: Vec<String>,
}

impl RunnerExecutor {
    /// Build from a command line; the first element is the program.
    ///
    /// Returns `None` for an empty command.
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl Executor for RunnerExecutor {
    async fn execute(&self, job: &JobHandle) -> Result<Vec<u8>, ExecutionError> {
        tracing::debug!(job_id = %job.job_id, program = %self.program, "Spawning runner");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("SPARK_JOB_ID", job.job_id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecutionError::Failed(format!("failed to spawn runner '{}': {e}", self.program))
            })?;

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A runner that ignores its input may close stdin early.
                if let Err(e) = stdin.write_all(&job.payload).await {
                    tracing::debug!(job_id = %job.job_id, error = %e, "Runner did not read payload");
                }
            }
        };

        // Feed stdin while draining stdout so large payloads cannot deadlock.
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output =
            output.map_err(|e| ExecutionError::Crashed(format!("lost runner process: {e}")))?;

        match output.status.code() {
            Some(0) => Ok(output.stdout),
            Some(code) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(ExecutionError::Failed(format!(
                    "runner exited with status {code}: {}",
                    excerpt(stderr.trim())
                )))
            }
            None => Err(ExecutionError::Crashed(
                "runner was terminated by a signal".to_string(),
            )),
        }
    }
}

/// Keep the tail of long stderr output; the end usually names the error.
fn excerpt(text: &str) -> &str {
    if text.len() <= MAX_STDERR_EXCERPT {
        return text;
    }
    let mut start = text.len() - MAX_STDERR_EXCERPT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
