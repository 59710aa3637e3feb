//! Compilation job identity, on-disk naming, and lifecycle.
//!
//! Every file a job touches lives in one working directory and shares the
//! job's base name. The base name is validated once, here, so the stager,
//! the invoker and the sweeper all agree on which files belong to a job.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use slug::slugify;
use uuid::Uuid;

use super::error::DomainError;

pub const SOURCE_EXTENSION: &str = ".tex";
pub const OUTPUT_EXTENSION: &str = ".pdf";
pub const LOG_EXTENSION: &str = ".log";

/// Extensions the toolchain may leave behind next to the source, besides the source itself.
pub const ARTIFACT_EXTENSIONS: [&str; 15] = [
    OUTPUT_EXTENSION,
    LOG_EXTENSION,
    ".aux",
    ".out",
    ".fls",
    ".toc",
    ".lof",
    ".lot",
    ".synctex.gz",
    ".fdb_latexmk",
    ".bbl",
    ".blg",
    ".xdv",
    ".nav",
    ".snm",
];

const MAX_BASE_NAME_LEN: usize = 160;
const MAX_LABEL_LEN: usize = 64;

/// Unique identifier of one compilation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Build the on-disk base name for a job.
///
/// The job id always leads, so two jobs never share a base name even when
/// clients upload files with the same name. A client-supplied name only
/// contributes a slugified stem; its extension is discarded.
pub fn derive_base_name(id: JobId, suggested_name: Option<&str>) -> String {
    let label = suggested_name
        .map(|name| {
            let file_name = Path::new(name)
                .file_name()
                .and_then(|value| value.to_str())
                .unwrap_or_default();
            let stem = file_name
                .strip_suffix(SOURCE_EXTENSION)
                .unwrap_or(file_name);
            let mut label = slugify(stem);
            label.truncate(MAX_LABEL_LEN);
            label.trim_end_matches('-').to_string()
        })
        .filter(|label| !label.is_empty());

    match label {
        Some(label) => format!("{id}-{label}"),
        None => id.to_string(),
    }
}

/// Location of every file belonging to one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    work_dir: PathBuf,
    base_name: String,
}

impl JobPaths {
    pub fn new(
        work_dir: impl Into<PathBuf>,
        base_name: impl Into<String>,
    ) -> Result<Self, DomainError> {
        let base_name = base_name.into();
        validate_base_name(&base_name)?;
        Ok(Self {
            work_dir: work_dir.into(),
            base_name,
        })
    }

    /// Recover the job layout from a staged source path.
    ///
    /// The file name must be `<base>.tex` where `<base>` is a valid base name;
    /// names with extra dots are rejected rather than guessed at.
    pub fn from_source(source: &Path) -> Result<Self, DomainError> {
        let display = source.display().to_string();
        let file_name = source
            .file_name()
            .and_then(|value| value.to_str())
            .ok_or_else(|| DomainError::invalid_source_path(&display, "missing file name"))?;
        let base_name = file_name
            .strip_suffix(SOURCE_EXTENSION)
            .ok_or_else(|| DomainError::invalid_source_path(&display, "expected a .tex file"))?;
        validate_base_name(base_name)
            .map_err(|_| DomainError::invalid_source_path(&display, "unsupported base name"))?;

        let work_dir = match source.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        Ok(Self {
            work_dir,
            base_name: base_name.to_string(),
        })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn with_extension(&self, extension: &str) -> PathBuf {
        self.work_dir.join(format!("{}{extension}", self.base_name))
    }

    pub fn source(&self) -> PathBuf {
        self.with_extension(SOURCE_EXTENSION)
    }

    pub fn artifact(&self) -> PathBuf {
        self.with_extension(OUTPUT_EXTENSION)
    }

    pub fn log(&self) -> PathBuf {
        self.with_extension(LOG_EXTENSION)
    }

    /// Every path the job may own, optionally including the source file.
    pub fn artifact_set(&self, include_source: bool) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = ARTIFACT_EXTENSIONS
            .iter()
            .map(|extension| self.with_extension(extension))
            .collect();
        if include_source {
            paths.push(self.source());
        }
        paths
    }
}

fn validate_base_name(name: &str) -> Result<(), DomainError> {
    if name.is_empty() {
        return Err(DomainError::invalid_base_name(name, "must not be empty"));
    }
    if name.len() > MAX_BASE_NAME_LEN {
        return Err(DomainError::invalid_base_name(name, "too long"));
    }
    if name.starts_with('-') {
        return Err(DomainError::invalid_base_name(name, "must not start with `-`"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DomainError::invalid_base_name(
            name,
            "only ASCII letters, digits, `-` and `_` are allowed",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Staged,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Staged => "staged",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Staged, JobStatus::Running)
                | (JobStatus::Staged, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request's compilation lifecycle.
#[derive(Debug, Clone)]
pub struct CompilationJob {
    id: JobId,
    paths: JobPaths,
    status: JobStatus,
}

impl CompilationJob {
    pub fn staged(id: JobId, paths: JobPaths) -> Self {
        Self {
            id,
            paths,
            status: JobStatus::Staged,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn paths(&self) -> &JobPaths {
        &self.paths
    }

    pub fn source_path(&self) -> PathBuf {
        self.paths.source()
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn transition(&mut self, next: JobStatus) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Outcome of one toolchain run.
///
/// `artifact_path` names the PDF when `succeeded`, otherwise the log file.
/// Either way the file exists when the result is handed out.
#[derive(Debug, Clone)]
pub struct CompilationResult {
    pub artifact_path: PathBuf,
    pub succeeded: bool,
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub timed_out: bool,
}
