//! Staging of uploaded sources into the shared working directory.

use std::error::Error as StdError;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut, stream};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{info, warn};

use crate::domain::{
    error::DomainError,
    jobs::{JobId, JobPaths, derive_base_name},
};

const SOURCE: &str = "infra::workspace";

/// Errors that can occur while persisting an uploaded source.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    InvalidName(#[from] DomainError),
    #[error("uploaded source exceeds configured body limit")]
    PayloadTooLarge {
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error("uploaded source stream failed")]
    PayloadStream {
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error("uploaded source is empty")]
    EmptyPayload,
}

/// A source file written to disk and ready for compilation.
#[derive(Debug, Clone)]
pub struct StagedSource {
    pub id: JobId,
    pub paths: JobPaths,
    pub size_bytes: u64,
}

impl StagedSource {
    pub fn source_path(&self) -> PathBuf {
        self.paths.source()
    }
}

/// Writes inbound sources under unique names inside one working directory.
#[derive(Debug)]
pub struct SourceStager {
    work_dir: PathBuf,
}

impl SourceStager {
    /// Prepare the working directory, creating it if necessary.
    ///
    /// The directory is made absolute so every path handed to the toolchain
    /// is independent of the process's current directory.
    pub fn new(work_dir: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let work_dir = work_dir.as_ref();
        std::fs::create_dir_all(work_dir)?;
        let work_dir = std::fs::canonicalize(work_dir)?;
        Ok(Self { work_dir })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Stream a source to disk under a fresh job name.
    ///
    /// A partially written file is removed before an error is returned.
    pub async fn stage_stream<S>(
        &self,
        suggested_name: Option<&str>,
        stream: S,
    ) -> Result<StagedSource, StageError>
    where
        S: Stream<Item = Result<Bytes, StageError>>,
    {
        let id = JobId::new();
        let paths = JobPaths::new(&self.work_dir, derive_base_name(id, suggested_name))?;
        let source = paths.source();

        let mut file = fs::File::create_new(&source).await?;
        let mut total_bytes: u64 = 0;

        pin_mut!(stream);
        while let Some(chunk_result) = stream.next().await {
            let chunk = match chunk_result {
                Ok(chunk) => chunk,
                Err(err) => {
                    drop(file);
                    discard(&source).await;
                    return Err(err);
                }
            };

            if chunk.is_empty() {
                continue;
            }

            total_bytes += chunk.len() as u64;
            if let Err(err) = file.write_all(&chunk).await {
                drop(file);
                discard(&source).await;
                return Err(StageError::Io(err));
            }
        }

        if let Err(err) = file.flush().await {
            drop(file);
            discard(&source).await;
            return Err(StageError::Io(err));
        }
        drop(file);

        if total_bytes == 0 {
            discard(&source).await;
            return Err(StageError::EmptyPayload);
        }

        info!(
            target = SOURCE,
            op = "workspace::stage",
            job_id = %id,
            path = %source.display(),
            size_bytes = total_bytes,
            "Saved source file"
        );

        Ok(StagedSource {
            id,
            paths,
            size_bytes: total_bytes,
        })
    }

    /// Stage a fully-buffered source.
    pub async fn stage(
        &self,
        content: Bytes,
        suggested_name: Option<&str>,
    ) -> Result<StagedSource, StageError> {
        let stream = stream::once(async move { Ok::<_, StageError>(content) });
        self.stage_stream(suggested_name, stream).await
    }
}

async fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        warn!(
            target = SOURCE,
            op = "workspace::discard",
            path = %path.display(),
            error = %err,
            "Failed to remove partially staged source"
        );
    }
}
