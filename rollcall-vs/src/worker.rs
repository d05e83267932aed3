//! Biometric worker client
//!
//! Wraps one call to the out-of-process matcher. Every call:
//!
//! 1. Stages the sample as `sample-<uuid>.img` in the staging directory
//! 2. Runs `<program> <args...> <mode> <staged path> <subject id>`
//! 3. Reads the result document from the first non-empty stdout line
//! 4. Removes the staged sample, whichever way the call ended
//!
//! The worker is bounded in time (killed on deadline) and in memory (stdout
//! lines and the retained stderr tail have a byte cap). No retries happen
//! here; whether to resubmit is the caller's decision.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What the worker is asked to do with the sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Store the sample as the subject's template
    Enroll,
    /// Match the sample against stored templates
    Verify,
}

impl WorkerMode {
    pub fn as_arg(&self) -> &'static str {
        match self {
            WorkerMode::Enroll => "enroll",
            WorkerMode::Verify => "verify",
        }
    }
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

/// Logical result of one worker run
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// Verify mode: the sample matched `identity`
    Matched { identity: String, confidence: f64 },
    /// Verify mode: the worker ran fine and found no match
    NotMatched { reason: String },
    /// Enroll mode: template stored
    Enrolled { message: String },
    /// The call failed before a logical outcome existed
    WorkerError { detail: String },
}

impl WorkerOutcome {
    /// Short tag for logging
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerOutcome::Matched { .. } => "matched",
            WorkerOutcome::NotMatched { .. } => "not_matched",
            WorkerOutcome::Enrolled { .. } => "enrolled",
            WorkerOutcome::WorkerError { .. } => "worker_error",
        }
    }
}

impl From<&WorkerFailure> for WorkerOutcome {
    fn from(failure: &WorkerFailure) -> Self {
        WorkerOutcome::WorkerError {
            detail: failure.to_string(),
        }
    }
}

/// Why a worker call produced no usable outcome
///
/// Every variant means "verification could not be attempted"; none of them is
/// a biometric rejection.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WorkerFailure {
    /// The sample could not be staged or cleaned up
    #[error("Sample artifact I/O failed: {0}")]
    ArtifactIo(String),

    /// The worker process could not be started
    #[error("Worker could not be launched: {0}")]
    ProcessLaunch(String),

    /// The worker exited unsuccessfully or was killed on deadline
    #[error("Worker failed (exit code {exit_code:?}): {detail}")]
    ProcessFailed {
        exit_code: Option<i32>,
        detail: String,
    },

    /// Output was not a result document
    #[error("Worker output is not a valid result: {raw}")]
    ResultParse { raw: String },

    /// The worker ran but set `success: false`
    #[error("Worker reported failure: {message}")]
    WorkerReported { message: String },
}

/// Anything that can run the biometric matcher
#[async_trait]
pub trait BiometricWorker: Send + Sync {
    async fn invoke(
        &self,
        sample: &[u8],
        subject_id: &str,
        mode: WorkerMode,
    ) -> Result<WorkerOutcome, WorkerFailure>;
}

/// Resolved settings for [`ProcessWorker`]
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub staging_dir: PathBuf,
    pub max_output_bytes: usize,
    pub max_stderr_bytes: usize,
}

impl WorkerConfig {
    /// Defaults for everything except the command line and staging directory
    pub fn new(program: impl Into<String>, args: Vec<String>, staging_dir: PathBuf) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(30),
            staging_dir,
            max_output_bytes: 64 * 1024,
            max_stderr_bytes: 16 * 1024,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Result document the worker prints on stdout
#[derive(Debug, Deserialize)]
struct WorkerReply {
    success: bool,
    #[serde(default)]
    student_id: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    message: Option<String>,
}

/// Runs the worker as a child process per call
pub struct ProcessWorker {
    config: WorkerConfig,
}

impl ProcessWorker {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    async fn run(
        &self,
        staged: &Path,
        subject_id: &str,
        mode: WorkerMode,
    ) -> Result<WorkerOutcome, WorkerFailure> {
        let started = Instant::now();
        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .arg(mode.as_arg())
            .arg(staged)
            .arg(subject_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The coordinator runs invoke on a detached task; a drop here
            // means the deadline path or runtime shutdown
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                WorkerFailure::ProcessLaunch(format!("{}: {}", self.config.program, e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerFailure::ProcessLaunch("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| WorkerFailure::ProcessLaunch("stderr not captured".to_string()))?;

        let stderr_task = tokio::spawn(read_tail(stderr, self.config.max_stderr_bytes));

        let max_output = self.config.max_output_bytes;
        let work = async {
            let line = read_result_line(stdout, max_output).await;
            let status = child.wait().await;
            (line, status)
        };
        let waited = tokio::time::timeout(self.config.timeout, work).await;

        let (line, status) = match waited {
            Ok(done) => done,
            Err(_) => {
                warn!(
                    %mode,
                    subject_id = %subject_id,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Worker exceeded deadline, killing"
                );
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill worker");
                }
                stderr_task.abort();
                return Err(WorkerFailure::ProcessFailed {
                    exit_code: None,
                    detail: format!(
                        "timed out after {} ms",
                        self.config.timeout.as_millis()
                    ),
                });
            }
        };

        let stderr_tail = stderr_task.await.unwrap_or_default();
        let status = status.map_err(|e| WorkerFailure::ProcessFailed {
            exit_code: None,
            detail: format!("waiting for worker: {}", e),
        })?;

        debug!(
            %mode,
            subject_id = %subject_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            exit_code = ?status.code(),
            "Worker exited"
        );

        interpret(mode, status, line, stderr_tail)
    }
}

#[async_trait]
impl BiometricWorker for ProcessWorker {
    async fn invoke(
        &self,
        sample: &[u8],
        subject_id: &str,
        mode: WorkerMode,
    ) -> Result<WorkerOutcome, WorkerFailure> {
        let staged = StagedSample::write(&self.config.staging_dir, sample).await?;
        let result = self.run(staged.path(), subject_id, mode).await;

        match (staged.remove().await, result) {
            (Ok(()), result) => result,
            (Err(cleanup), Ok(_)) => Err(cleanup),
            (Err(cleanup), Err(original)) => {
                warn!(error = %cleanup, "Staged sample cleanup failed after worker error");
                Err(original)
            }
        }
    }
}

/// Turn exit status and the result line into an outcome
fn interpret(
    mode: WorkerMode,
    status: ExitStatus,
    line: Result<Option<String>, WorkerFailure>,
    stderr_tail: String,
) -> Result<WorkerOutcome, WorkerFailure> {
    let reply = match line {
        Ok(Some(line)) => serde_json::from_str::<WorkerReply>(&line).map_err(|_| {
            WorkerFailure::ResultParse {
                raw: truncate(&line, 256),
            }
        }),
        Ok(None) => Err(WorkerFailure::ResultParse { raw: String::new() }),
        Err(failure) => Err(failure),
    };

    if !status.success() {
        let detail = reply
            .as_ref()
            .ok()
            .and_then(|r| r.message.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| stderr_tail.trim().to_string());
        return Err(WorkerFailure::ProcessFailed {
            exit_code: status.code(),
            detail,
        });
    }

    let reply = reply?;
    if !reply.success {
        return Err(WorkerFailure::WorkerReported {
            message: reply
                .message
                .unwrap_or_else(|| "worker reported failure".to_string()),
        });
    }

    let outcome = match mode {
        WorkerMode::Enroll => WorkerOutcome::Enrolled {
            message: reply.message.unwrap_or_default(),
        },
        WorkerMode::Verify => match reply.student_id.filter(|id| !id.is_empty()) {
            Some(identity) => WorkerOutcome::Matched {
                identity,
                confidence: reply.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
            },
            None => WorkerOutcome::NotMatched {
                reason: reply
                    .message
                    .unwrap_or_else(|| "no matching template".to_string()),
            },
        },
    };

    info!(%mode, outcome = outcome.kind(), "Worker finished");
    Ok(outcome)
}

/// First non-empty stdout line. Remaining output is drained so the worker
/// never blocks on a full pipe.
async fn read_result_line<R>(reader: R, max_len: usize) -> Result<Option<String>, WorkerFailure>
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(max_len));
    let mut result: Option<Result<String, WorkerFailure>> = None;

    while let Some(next) = lines.next().await {
        match next {
            Ok(line) => {
                if result.is_none() && !line.trim().is_empty() {
                    result = Some(Ok(line));
                }
            }
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                if result.is_none() {
                    result = Some(Err(WorkerFailure::ResultParse {
                        raw: format!("result line exceeds {} bytes", max_len),
                    }));
                }
            }
            Err(LinesCodecError::Io(e)) => {
                let failure = if e.kind() == std::io::ErrorKind::InvalidData {
                    WorkerFailure::ResultParse {
                        raw: "output is not valid UTF-8".to_string(),
                    }
                } else {
                    WorkerFailure::ProcessFailed {
                        exit_code: None,
                        detail: format!("reading worker output: {}", e),
                    }
                };
                return Err(result.and_then(Result::err).unwrap_or(failure));
            }
        }
    }

    // The framed stream stops after a codec error; keep the pipe empty anyway
    let _ = tokio::io::copy(&mut lines.into_inner(), &mut tokio::io::sink()).await;

    result.transpose()
}

/// Keep only the last `max_len` bytes of a stream
async fn read_tail<R>(mut reader: R, max_len: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > max_len {
                    let excess = tail.len() - max_len;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

/// Transient copy of a sample on disk
///
/// Removed by [`StagedSample::remove`] on the normal path and by `Drop` when
/// the call is abandoned mid-flight.
struct StagedSample {
    path: PathBuf,
    removed: bool,
}

impl StagedSample {
    async fn write(staging_dir: &Path, sample: &[u8]) -> Result<Self, WorkerFailure> {
        tokio::fs::create_dir_all(staging_dir).await.map_err(|e| {
            WorkerFailure::ArtifactIo(format!(
                "creating staging directory {}: {}",
                staging_dir.display(),
                e
            ))
        })?;

        let staged = Self {
            path: staging_dir.join(format!("sample-{}.img", Uuid::new_v4())),
            removed: false,
        };

        // A partial file is removed by Drop on the error path
        tokio::fs::write(&staged.path, sample).await.map_err(|e| {
            WorkerFailure::ArtifactIo(format!("writing {}: {}", staged.path.display(), e))
        })?;

        Ok(staged)
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn remove(mut self) -> Result<(), WorkerFailure> {
        self.removed = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkerFailure::ArtifactIo(format!(
                "removing {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

impl Drop for StagedSample {
    fn drop(&mut self) {
        if !self.removed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove staged sample");
                }
            }
        }
    }
}
