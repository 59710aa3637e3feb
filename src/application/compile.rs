//! The compilation pipeline: stage, compile, and hand back a cleanup guard.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    config::CompilerSettings,
    domain::{
        error::DomainError,
        jobs::{CompilationJob, CompilationResult, JobPaths, JobStatus},
    },
    infra::{
        cleanup::CleanupGuard,
        toolchain::{CompilerInvoker, InvokeError},
        workspace::{SourceStager, StageError},
    },
};

const SOURCE: &str = "application::compile";
/// Upload base names always start with a hex job id, so this one never collides.
const HEALTH_CHECK_BASE_NAME: &str = "health_check";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to stage source: {0}")]
    Stage(#[from] StageError),
    #[error(transparent)]
    Invoke(#[from] InvokeError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// A finished job whose files are still on disk.
///
/// The files are swept when `cleanup` is dropped, so keep it alive until the
/// artifact has been read or streamed out.
#[derive(Debug)]
pub struct CompiledJob {
    pub job: CompilationJob,
    pub result: CompilationResult,
    pub cleanup: CleanupGuard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "ok",
            HealthStatus::Error => "error",
        }
    }
}

pub struct CompilationService {
    stager: SourceStager,
    invoker: CompilerInvoker,
    health_check_source: PathBuf,
    health_check_lock: Mutex<()>,
}

impl CompilationService {
    pub fn new(
        stager: SourceStager,
        invoker: CompilerInvoker,
        health_check_source: impl Into<PathBuf>,
    ) -> Self {
        Self {
            stager,
            invoker,
            health_check_source: health_check_source.into(),
            health_check_lock: Mutex::new(()),
        }
    }

    /// Build the pipeline from settings, creating the working directory.
    pub fn from_settings(settings: &CompilerSettings) -> Result<Self, std::io::Error> {
        let stager = SourceStager::new(&settings.work_dir)?;
        let invoker = CompilerInvoker::new(settings.program.clone(), settings.timeout);
        Ok(Self::new(
            stager,
            invoker,
            settings.health_check_source.clone(),
        ))
    }

    pub fn work_dir(&self) -> &Path {
        self.stager.work_dir()
    }

    pub async fn compile_bytes(
        &self,
        content: Bytes,
        suggested_name: Option<&str>,
    ) -> Result<CompiledJob, PipelineError> {
        let staged = self.stager.stage(content, suggested_name).await?;
        self.run(CompilationJob::staged(staged.id, staged.paths)).await
    }

    pub async fn compile_stream<S>(
        &self,
        suggested_name: Option<&str>,
        stream: S,
    ) -> Result<CompiledJob, PipelineError>
    where
        S: Stream<Item = Result<Bytes, StageError>>,
    {
        let staged = self.stager.stage_stream(suggested_name, stream).await?;
        self.run(CompilationJob::staged(staged.id, staged.paths)).await
    }

    async fn run(&self, mut job: CompilationJob) -> Result<CompiledJob, PipelineError> {
        // From here on every exit path, including cancellation, sweeps the job.
        let cleanup = CleanupGuard::new(job.paths().clone(), true);

        job.transition(JobStatus::Running)?;
        cleanup.toolchain_started();
        let outcome = self.invoker.compile(&job.source_path()).await;
        cleanup.toolchain_finished();

        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                job.transition(JobStatus::Failed)?;
                warn!(
                    target = SOURCE,
                    op = "compile::run",
                    job_id = %job.id(),
                    status = job.status().as_str(),
                    error = %err,
                    "Compilation job aborted"
                );
                return Err(err.into());
            }
        };

        let status = if result.succeeded {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
        job.transition(status)?;

        info!(
            target = SOURCE,
            op = "compile::run",
            job_id = %job.id(),
            status = job.status().as_str(),
            exit_code = result.exit_code.map(i64::from).unwrap_or(-1),
            timed_out = result.timed_out,
            artifact = %result.artifact_path.display(),
            "Compilation job finished"
        );

        Ok(CompiledJob {
            job,
            result,
            cleanup,
        })
    }

    /// Compile the fixed health-check document and report whether it worked.
    ///
    /// The document is copied into the working directory under a reserved
    /// base name, so its own directory is only ever read. Checks share that
    /// name and therefore run one at a time.
    pub async fn check_toolchain(&self) -> HealthStatus {
        let _serialized = self.health_check_lock.lock().await;

        let paths = match JobPaths::new(self.work_dir(), HEALTH_CHECK_BASE_NAME) {
            Ok(paths) => paths,
            Err(err) => {
                warn!(
                    target = SOURCE,
                    op = "compile::check_toolchain",
                    error = %err,
                    "Health-check job paths are invalid"
                );
                return HealthStatus::Error;
            }
        };
        let cleanup = CleanupGuard::new(paths.clone(), true);

        if let Err(err) = tokio::fs::copy(&self.health_check_source, paths.source()).await {
            warn!(
                target = SOURCE,
                op = "compile::check_toolchain",
                path = %self.health_check_source.display(),
                error = %err,
                "Health-check source is unreadable"
            );
            cleanup.sweep_now().await;
            return HealthStatus::Error;
        }

        cleanup.toolchain_started();
        let outcome = self.invoker.compile(&paths.source()).await;
        cleanup.toolchain_finished();

        let status = match outcome {
            Ok(result) if result.succeeded => HealthStatus::Ok,
            Ok(result) => {
                warn!(
                    target = SOURCE,
                    op = "compile::check_toolchain",
                    program = %self.invoker.program().display(),
                    exit_code = result.exit_code.map(i64::from).unwrap_or(-1),
                    timed_out = result.timed_out,
                    "Health-check document failed to compile"
                );
                HealthStatus::Error
            }
            Err(err) => {
                warn!(
                    target = SOURCE,
                    op = "compile::check_toolchain",
                    program = %self.invoker.program().display(),
                    error = %err,
                    "Health check could not run the toolchain"
                );
                HealthStatus::Error
            }
        };

        cleanup.sweep_now().await;
        status
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;

    const FAKE_TECTONIC: &str = concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/fake-tectonic.sh"
    );
    const HELLO: &str = "\\documentclass{article}\\begin{document}Hello\\end{document}";

    fn service(dir: &Path) -> CompilationService {
        std::fs::set_permissions(FAKE_TECTONIC, std::fs::Permissions::from_mode(0o755))
            .expect("set perms");

        let assets = dir.join("assets");
        std::fs::create_dir_all(&assets).expect("assets dir");
        std::fs::write(assets.join("health_check.tex"), HELLO).expect("health source");

        CompilationService::new(
            SourceStager::new(dir.join("uploads")).expect("stager"),
            CompilerInvoker::new(FAKE_TECTONIC, Duration::from_secs(10)),
            assets.join("health_check.tex"),
        )
    }

    fn remaining_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).expect("read dir").count()
    }

    #[tokio::test]
    async fn successful_job_keeps_files_until_guard_drops() {
        let dir = TempDir::new().expect("temp dir");
        let service = service(dir.path());

        let compiled = service
            .compile_bytes(Bytes::from_static(HELLO.as_bytes()), Some("hello.tex"))
            .await
            .expect("compiled");

        assert!(compiled.result.succeeded);
        assert_eq!(compiled.job.status(), JobStatus::Succeeded);
        assert!(compiled.result.artifact_path.exists());
        assert!(compiled.job.source_path().exists());

        compiled.cleanup.sweep_now().await.expect("swept");
        assert_eq!(remaining_files(service.work_dir()), 0);
    }

    #[tokio::test]
    async fn failed_job_returns_log() {
        let dir = TempDir::new().expect("temp dir");
        let service = service(dir.path());

        let compiled = service
            .compile_bytes(
                Bytes::from_static(b"\\documentclass{article}\\begin{document"),
                None,
            )
            .await
            .expect("ran");

        assert!(!compiled.result.succeeded);
        assert_eq!(compiled.job.status(), JobStatus::Failed);
        assert!(std::fs::metadata(&compiled.result.artifact_path).unwrap().len() > 0);
    }

    #[tokio::test]
    async fn invocation_error_still_cleans_up() {
        let dir = TempDir::new().expect("temp dir");
        let service = CompilationService::new(
            SourceStager::new(dir.path().join("uploads")).expect("stager"),
            CompilerInvoker::new(dir.path().join("missing"), Duration::from_secs(5)),
            dir.path().join("health_check.tex"),
        );

        let err = service
            .compile_bytes(Bytes::from_static(HELLO.as_bytes()), None)
            .await
            .expect_err("toolchain missing");
        assert!(matches!(
            err,
            PipelineError::Invoke(InvokeError::ToolchainMissing { .. })
        ));

        // The guard hands the sweep to the blocking pool when dropped.
        for _ in 0..50 {
            if remaining_files(service.work_dir()) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(remaining_files(service.work_dir()), 0);
    }

    #[tokio::test]
    async fn concurrent_jobs_do_not_interfere() {
        let dir = TempDir::new().expect("temp dir");
        let service = service(dir.path());

        let (a, b) = tokio::join!(
            service.compile_bytes(Bytes::from_static(HELLO.as_bytes()), Some("main.tex")),
            service.compile_bytes(Bytes::from_static(HELLO.as_bytes()), Some("main.tex")),
        );
        let a = a.expect("job a");
        let b = b.expect("job b");
        assert_ne!(a.job.paths().base_name(), b.job.paths().base_name());

        b.cleanup.sweep_now().await.expect("swept b");
        assert!(a.result.artifact_path.exists());
        assert!(a.job.source_path().exists());
        assert!(!b.result.artifact_path.exists());
    }

    #[cfg(target_os = "linux")]
    fn process_is_gone(pid: &str) -> bool {
        // A killed child may linger as a zombie until the runtime reaps it.
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn cancelled_job_kills_toolchain_and_cleans_up() {
        let dir = TempDir::new().expect("temp dir");
        let service = service(dir.path());

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            service.compile_bytes(Bytes::from_static(b"HANG"), Some("hang.tex")),
        )
        .await;
        assert!(outcome.is_err(), "hanging job should still be running");

        // The fake toolchain records its pid beside the work dir before sleeping.
        let pid = std::fs::read_to_string(dir.path().join("hang.pid")).expect("pid file");
        let pid = pid.trim();

        for _ in 0..100 {
            if remaining_files(service.work_dir()) == 0 && process_is_gone(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "{} file(s) left, toolchain gone: {}",
            remaining_files(service.work_dir()),
            process_is_gone(pid)
        );
    }

    #[tokio::test]
    async fn health_check_leaves_its_source_directory_alone() {
        let dir = TempDir::new().expect("temp dir");
        let service = service(dir.path());

        assert_eq!(service.check_toolchain().await, HealthStatus::Ok);

        let assets = dir.path().join("assets");
        assert_eq!(remaining_files(&assets), 1);
        assert_eq!(
            std::fs::read_to_string(assets.join("health_check.tex")).expect("source"),
            HELLO
        );
        assert_eq!(remaining_files(service.work_dir()), 0);
    }

    #[tokio::test]
    async fn health_check_works_with_read_only_source_directory() {
        let dir = TempDir::new().expect("temp dir");
        let service = service(dir.path());
        let assets = dir.path().join("assets");
        std::fs::set_permissions(&assets, std::fs::Permissions::from_mode(0o555))
            .expect("read-only assets");

        let status = service.check_toolchain().await;
        std::fs::set_permissions(&assets, std::fs::Permissions::from_mode(0o755))
            .expect("restore perms");

        assert_eq!(status, HealthStatus::Ok);
        assert_eq!(remaining_files(&assets), 1);
        assert_eq!(remaining_files(service.work_dir()), 0);
    }

    #[tokio::test]
    async fn health_check_reports_missing_source() {
        let dir = TempDir::new().expect("temp dir");
        let service = CompilationService::new(
            SourceStager::new(dir.path().join("uploads")).expect("stager"),
            CompilerInvoker::new(FAKE_TECTONIC, Duration::from_secs(5)),
            dir.path().join("absent.tex"),
        );

        assert_eq!(service.check_toolchain().await, HealthStatus::Error);
        assert_eq!(remaining_files(service.work_dir()), 0);
    }

    #[tokio::test]
    async fn health_check_reports_missing_toolchain() {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("health_check.tex"), HELLO).expect("source");
        let service = CompilationService::new(
            SourceStager::new(dir.path().join("uploads")).expect("stager"),
            CompilerInvoker::new(dir.path().join("missing"), Duration::from_secs(5)),
            dir.path().join("health_check.tex"),
        );

        assert_eq!(service.check_toolchain().await, HealthStatus::Error);
        assert_eq!(remaining_files(service.work_dir()), 0);
    }
}
