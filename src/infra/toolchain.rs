//! Supervision of the external `tectonic` toolchain.
//!
//! One invocation per job, no retries. Success requires both a zero exit
//! status and the PDF on disk; every failure leaves a non-empty log file
//! behind so the caller always has something to show.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use metrics::{counter, histogram};
use thiserror::Error;
use tokio::{
    fs,
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    task::JoinHandle,
};
use tracing::{error, info, warn};

use crate::domain::{
    error::DomainError,
    jobs::{CompilationResult, JobPaths},
};

const SOURCE: &str = "infra::toolchain";
const PIPE_GRACE: Duration = Duration::from_secs(2);

pub const COMPILE_TOTAL_METRIC: &str = "latex_compile_total";
pub const COMPILE_DURATION_METRIC: &str = "latex_compile_duration_ms";

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("source file not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error(transparent)]
    InvalidSource(#[from] DomainError),
    #[error("toolchain `{}` is not installed", program.display())]
    ToolchainMissing {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to run toolchain: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to inspect compilation output: {0}")]
    Io(#[source] io::Error),
}

/// Runs the toolchain against staged sources.
#[derive(Debug, Clone)]
pub struct CompilerInvoker {
    program: PathBuf,
    timeout: Duration,
}

impl CompilerInvoker {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Compile `source` into a PDF next to it.
    ///
    /// Dropping the returned future kills the child process.
    pub async fn compile(&self, source: &Path) -> Result<CompilationResult, InvokeError> {
        let started_at = Instant::now();

        if !fs::try_exists(source).await.unwrap_or(false) {
            error!(
                target = SOURCE,
                op = "toolchain::compile",
                result = "not_found",
                path = %source.display(),
                "Source file is missing or unreadable"
            );
            return Err(InvokeError::NotFound {
                path: source.to_path_buf(),
            });
        }

        let source = fs::canonicalize(source).await.map_err(InvokeError::Io)?;
        let paths = JobPaths::from_source(&source)?;

        let mut child = self
            .command(&paths)
            .spawn()
            .map_err(|err| self.spawn_error(err, started_at))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let (status, timed_out) = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => (Some(status), false),
            Ok(Err(err)) => return Err(self.spawn_error(err, started_at)),
            Err(_) => {
                if let Err(err) = child.kill().await {
                    warn!(
                        target = SOURCE,
                        op = "toolchain::compile",
                        path = %source.display(),
                        error = %err,
                        "Failed to kill timed-out toolchain process"
                    );
                }
                (None, true)
            }
        };

        let stdout = collect(stdout).await;
        let stderr = collect(stderr).await;
        let exit_code = status.and_then(|status| status.code());
        let exited_cleanly = status.is_some_and(|status| status.success());
        let artifact = paths.artifact();
        let artifact_exists = fs::try_exists(&artifact).await.unwrap_or(false);
        let stderr_text = String::from_utf8_lossy(&stderr).into_owned();
        let elapsed_ms = started_at.elapsed().as_millis() as u64;

        if exited_cleanly && artifact_exists {
            info!(
                target = SOURCE,
                op = "toolchain::compile",
                result = "succeeded",
                elapsed_ms,
                path = %artifact.display(),
                "Compilation successful"
            );
            record_outcome("succeeded", elapsed_ms);
            return Ok(CompilationResult {
                artifact_path: artifact,
                succeeded: true,
                exit_code,
                stderr: stderr_text,
                timed_out: false,
            });
        }

        if exited_cleanly {
            warn!(
                target = SOURCE,
                op = "toolchain::compile",
                path = %source.display(),
                "Toolchain exited cleanly without producing a PDF"
            );
        }

        let outcome = if timed_out { "timed_out" } else { "failed" };
        error!(
            target = SOURCE,
            op = "toolchain::compile",
            result = outcome,
            elapsed_ms,
            exit_code = exit_code.map(i64::from).unwrap_or(-1),
            path = %source.display(),
            "Compilation failed"
        );
        if !stderr_text.is_empty() {
            warn!(
                target = SOURCE,
                op = "toolchain::compile",
                stderr = %stderr_text,
                "Toolchain stderr"
            );
        }

        let log = paths.log();
        if timed_out || !has_content(&log).await {
            let limit = timed_out.then_some(self.timeout);
            let content = synthesize_log(&stderr, &stdout, exit_code, limit);
            fs::write(&log, content).await.map_err(InvokeError::Io)?;
        }

        record_outcome(outcome, elapsed_ms);
        Ok(CompilationResult {
            artifact_path: log,
            succeeded: false,
            exit_code,
            stderr: stderr_text,
            timed_out,
        })
    }

    /// `tectonic -X compile --keep-logs --outdir <work dir> <source>`
    fn command(&self, paths: &JobPaths) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-X")
            .arg("compile")
            .arg("--keep-logs")
            .arg("--outdir")
            .arg(paths.work_dir())
            .arg(paths.source())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn spawn_error(&self, err: io::Error, started_at: Instant) -> InvokeError {
        warn!(
            target = SOURCE,
            op = "toolchain::compile",
            result = "error",
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            error_code = "spawn_toolchain",
            program = %self.program.display(),
            error = %err,
            "Exception running toolchain"
        );
        record_outcome("invocation_error", started_at.elapsed().as_millis() as u64);
        if err.kind() == ErrorKind::NotFound {
            InvokeError::ToolchainMissing {
                program: self.program.clone(),
                source: err,
            }
        } else {
            InvokeError::Spawn(err)
        }
    }
}

fn drain<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            // Partial output is still worth keeping when the pipe errors.
            let _ = pipe.read_to_end(&mut buffer).await;
        }
        buffer
    })
}

async fn collect(handle: JoinHandle<Vec<u8>>) -> Vec<u8> {
    match tokio::time::timeout(PIPE_GRACE, handle).await {
        Ok(Ok(buffer)) => buffer,
        Ok(Err(_)) | Err(_) => Vec::new(),
    }
}

async fn has_content(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

fn synthesize_log(
    stderr: &[u8],
    stdout: &[u8],
    exit_code: Option<i32>,
    timed_out_after: Option<Duration>,
) -> Vec<u8> {
    let mut content = Vec::with_capacity(stderr.len() + stdout.len() + 64);
    if let Some(limit) = timed_out_after {
        content.extend_from_slice(
            format!("compilation timed out after {} seconds\n", limit.as_secs()).as_bytes(),
        );
    }
    content.extend_from_slice(stderr);
    content.extend_from_slice(stdout);
    if content.is_empty() {
        let status = exit_code.map_or_else(|| "unknown".to_string(), |code| code.to_string());
        content.extend_from_slice(
            format!("toolchain exited with status {status} without producing output\n").as_bytes(),
        );
    }
    content
}

fn record_outcome(outcome: &'static str, elapsed_ms: u64) {
    counter!(COMPILE_TOTAL_METRIC, "outcome" => outcome).increment(1);
    histogram!(COMPILE_DURATION_METRIC).record(elapsed_ms as f64);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const FAKE_TECTONIC: &str = concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/fake-tectonic.sh"
    );

    fn fake_toolchain() -> PathBuf {
        std::fs::set_permissions(FAKE_TECTONIC, std::fs::Permissions::from_mode(0o755))
            .expect("set perms");
        PathBuf::from(FAKE_TECTONIC)
    }

    fn write_source(dir: &Path, base: &str, content: &str) -> PathBuf {
        let work = dir.join("work");
        std::fs::create_dir_all(&work).expect("work dir");
        let path = work.join(format!("{base}.tex"));
        std::fs::write(&path, content).expect("write source");
        path
    }

    fn invoker() -> CompilerInvoker {
        CompilerInvoker::new(fake_toolchain(), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn valid_document_produces_pdf() {
        let dir = TempDir::new().expect("temp dir");
        let source = write_source(
            dir.path(),
            "hello",
            "\\documentclass{article}\\begin{document}Hello\\end{document}",
        );

        let result = invoker().compile(&source).await.expect("compiled");

        assert!(result.succeeded);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(
            result.artifact_path.extension().and_then(|e| e.to_str()),
            Some("pdf")
        );
        let size = std::fs::metadata(&result.artifact_path).expect("pdf").len();
        assert!(size > 0);
    }

    #[tokio::test]
    async fn command_line_matches_toolchain_contract() {
        let dir = TempDir::new().expect("temp dir");
        let source = write_source(
            dir.path(),
            "contract",
            "\\documentclass{article}\\begin{document}x\\end{document}",
        );
        let work = std::fs::canonicalize(source.parent().unwrap()).expect("canonical");

        invoker().compile(&source).await.expect("compiled");

        let args = std::fs::read_to_string(dir.path().join("args.log")).expect("args");
        assert_eq!(
            args.trim_end(),
            format!(
                "-X compile --keep-logs --outdir {} {}",
                work.display(),
                work.join("contract.tex").display()
            )
        );
    }

    #[tokio::test]
    async fn broken_document_yields_synthesized_log() {
        let dir = TempDir::new().expect("temp dir");
        let source = write_source(dir.path(), "broken", "\\documentclass{article}\\begin{document");

        let result = invoker().compile(&source).await.expect("ran");

        assert!(!result.succeeded);
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(
            result.artifact_path.extension().and_then(|e| e.to_str()),
            Some("log")
        );
        let log = std::fs::read_to_string(&result.artifact_path).expect("log");
        assert!(log.starts_with("error: broken.tex: Emergency stop"), "{log}");
        assert!(log.contains("note: See the log for details"), "{log}");
        assert!(result.stderr.contains("Emergency stop"));
    }

    #[tokio::test]
    async fn toolchain_log_is_kept_when_present() {
        let dir = TempDir::new().expect("temp dir");
        let source = write_source(dir.path(), "logged", "LOG_FAIL");

        let result = invoker().compile(&source).await.expect("ran");

        assert!(!result.succeeded);
        let log = std::fs::read_to_string(&result.artifact_path).expect("log");
        assert_eq!(log, "! Undefined control sequence.\n");
    }

    #[tokio::test]
    async fn silent_failure_still_gets_a_non_empty_log() {
        let dir = TempDir::new().expect("temp dir");
        let source = write_source(dir.path(), "silent", "SILENT_FAIL");

        let result = invoker().compile(&source).await.expect("ran");

        assert!(!result.succeeded);
        let log = std::fs::read_to_string(&result.artifact_path).expect("log");
        assert_eq!(
            log,
            "toolchain exited with status 1 without producing output\n"
        );
    }

    #[tokio::test]
    async fn zero_exit_without_pdf_is_a_failure() {
        let dir = TempDir::new().expect("temp dir");
        let source = write_source(dir.path(), "nopdf", "NO_PDF");

        let result = invoker().compile(&source).await.expect("ran");

        assert!(!result.succeeded);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.artifact_path.ends_with("nopdf.log"));
        assert!(std::fs::metadata(&result.artifact_path).unwrap().len() > 0);
    }

    #[tokio::test]
    async fn hung_toolchain_is_killed_after_timeout() {
        let dir = TempDir::new().expect("temp dir");
        let source = write_source(dir.path(), "hang", "HANG");
        let invoker = CompilerInvoker::new(fake_toolchain(), Duration::from_secs(1));

        let started = Instant::now();
        let result = invoker.compile(&source).await.expect("ran");

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!result.succeeded);
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        let log = std::fs::read_to_string(&result.artifact_path).expect("log");
        assert!(log.starts_with("compilation timed out after 1 seconds"), "{log}");
    }

    #[tokio::test]
    async fn missing_source_fails_without_spawning() {
        let dir = TempDir::new().expect("temp dir");
        let missing = dir.path().join("work/missing.tex");

        let err = invoker()
            .compile(&missing)
            .await
            .expect_err("missing source");

        assert!(matches!(err, InvokeError::NotFound { .. }));
        assert!(!dir.path().join("args.log").exists());
    }

    #[tokio::test]
    async fn ambiguous_source_name_is_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let source = write_source(dir.path(), "report.final", "x");

        let err = invoker()
            .compile(&source)
            .await
            .expect_err("invalid name");

        assert!(matches!(err, InvokeError::InvalidSource(_)));
        assert!(!dir.path().join("args.log").exists());
    }

    #[tokio::test]
    async fn missing_toolchain_is_an_invocation_error() {
        let dir = TempDir::new().expect("temp dir");
        let source = write_source(dir.path(), "doc", "x");
        let invoker = CompilerInvoker::new(
            dir.path().join("no-such-tectonic"),
            Duration::from_secs(5),
        );

        let err = invoker.compile(&source).await.expect_err("missing binary");

        assert!(matches!(err, InvokeError::ToolchainMissing { .. }));
    }

    #[test]
    fn outcomes_are_counted() {
        use metrics_util::debugging::{DebugValue, DebuggingRecorder};

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        metrics::with_local_recorder(&recorder, || {
            record_outcome("failed", 12);
            record_outcome("failed", 30);
        });

        let counted = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find_map(|(key, _, _, value)| {
                (key.key().name() == COMPILE_TOTAL_METRIC).then_some(value)
            });
        assert!(matches!(counted, Some(DebugValue::Counter(2))));
    }
}
