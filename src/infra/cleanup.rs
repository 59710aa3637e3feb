//! Removal of a job's files once its response is out the door.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::jobs::JobPaths;

const SOURCE: &str = "infra::cleanup";
/// Time a killed toolchain gets to finish its last syscall before the second sweep.
const RESWEEP_DELAY: Duration = Duration::from_millis(250);

/// Tally of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub failed: usize,
}

/// Delete every artifact-set file for the job's base name.
///
/// Missing files are skipped. A file that cannot be removed is logged and
/// the sweep moves on to the next one.
pub fn sweep(paths: &JobPaths, include_source: bool) -> CleanupReport {
    let mut report = CleanupReport::default();

    for path in paths.artifact_set(include_source) {
        match std::fs::remove_file(&path) {
            Ok(()) => report.removed += 1,
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                report.failed += 1;
                warn!(
                    target = SOURCE,
                    op = "cleanup::sweep",
                    path = %path.display(),
                    error = %err,
                    "Failed to remove job file"
                );
            }
        }
    }

    debug!(
        target = SOURCE,
        op = "cleanup::sweep",
        base = paths.base_name(),
        removed = report.removed,
        failed = report.failed,
        include_source,
        "Cleaned up files for base"
    );

    report
}

/// Sweeps a job's files exactly once, no later than when it is dropped.
///
/// Hold the guard for as long as the files are needed (typically inside the
/// response body that streams the artifact). Dropping it inside a tokio
/// runtime hands the sweep to the blocking pool.
///
/// If the guard is dropped while the toolchain is marked as running, the
/// child is being killed concurrently and may still land a write, so the
/// files are swept a second time shortly after.
#[derive(Debug)]
pub struct CleanupGuard {
    paths: JobPaths,
    include_source: bool,
    done: AtomicBool,
    toolchain_running: AtomicBool,
}

impl CleanupGuard {
    pub fn new(paths: JobPaths, include_source: bool) -> Self {
        Self {
            paths,
            include_source,
            done: AtomicBool::new(false),
            toolchain_running: AtomicBool::new(false),
        }
    }

    /// Mark that a toolchain process may be writing into the job's files.
    pub fn toolchain_started(&self) {
        self.toolchain_running.store(true, Ordering::Release);
    }

    /// Mark that the toolchain process has exited and been waited on.
    pub fn toolchain_finished(&self) {
        self.toolchain_running.store(false, Ordering::Release);
    }

    /// Sweep immediately and wait for it. Later calls and the drop are no-ops.
    pub async fn sweep_now(&self) -> Option<CleanupReport> {
        if self.done.swap(true, Ordering::AcqRel) {
            return None;
        }
        let paths = self.paths.clone();
        let include_source = self.include_source;
        match tokio::task::spawn_blocking(move || sweep(&paths, include_source)).await {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(
                    target = SOURCE,
                    op = "cleanup::sweep_now",
                    base = self.paths.base_name(),
                    error = %err,
                    "Cleanup task did not complete"
                );
                None
            }
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let paths = self.paths.clone();
        let include_source = self.include_source;
        let resweep = self.toolchain_running.load(Ordering::Acquire);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            sweep(&paths, include_source);
            return;
        };
        if !resweep {
            handle.spawn_blocking(move || sweep(&paths, include_source));
            return;
        }

        debug!(
            target = SOURCE,
            op = "cleanup::drop",
            base = paths.base_name(),
            "Guard dropped while the toolchain was running, sweeping twice"
        );
        handle.spawn(async move {
            let first = paths.clone();
            let _ = tokio::task::spawn_blocking(move || sweep(&first, include_source)).await;
            tokio::time::sleep(RESWEEP_DELAY).await;
            let _ = tokio::task::spawn_blocking(move || sweep(&paths, include_source)).await;
        });
    }
}
