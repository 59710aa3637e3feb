use thiserror::Error;

use super::jobs::JobStatus;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid job base name `{name}`: {reason}")]
    InvalidBaseName { name: String, reason: &'static str },
    #[error("invalid source path `{path}`: {reason}")]
    InvalidSourcePath { path: String, reason: &'static str },
    #[error("job cannot move from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
}

impl DomainError {
    pub fn invalid_base_name(name: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidBaseName {
            name: name.into(),
            reason,
        }
    }

    pub fn invalid_source_path(path: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidSourcePath {
            path: path.into(),
            reason,
        }
    }
}
