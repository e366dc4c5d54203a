//! Error taxonomy of the build pipeline.
//!
//! Component internals use `anyhow` with context; the variants below are the
//! boundary types the orchestrator persists on a failed record.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid update submission: {0}")]
    Validation(String),

    #[error("working directory {path} unusable")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to download {url}")]
    Fetch {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to extract {archive}")]
    Extract {
        archive: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to commit version metadata onto {ostree_ref}")]
    Commit {
        ostree_ref: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("ref {ostree_ref} not found in {repo}")]
    RevisionNotFound { repo: PathBuf, ostree_ref: String },

    #[error("static delta generation failed: {detail}")]
    DeltaGeneration {
        detail: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to remove {path}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("upload failed at {path}")]
    Upload {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("persistence failure")]
    Persistence(#[source] anyhow::Error),
}

impl PipelineError {
    /// Stable name recorded alongside a failed build.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Workspace { .. } => "WorkspaceError",
            Self::Fetch { .. } => "FetchError",
            Self::Extract { .. } => "ExtractError",
            Self::Commit { .. } => "CommitError",
            Self::RevisionNotFound { .. } => "RevisionNotFoundError",
            Self::DeltaGeneration { .. } => "DeltaGenerationError",
            Self::Cleanup { .. } => "CleanupError",
            Self::Upload { .. } => "UploadError",
            Self::Persistence(_) => "PersistenceError",
        }
    }
}

// ---------------------------------------------------------------------------
// Stage tagging
// ---------------------------------------------------------------------------

/// Pipeline stage a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildStage {
    Claim,
    Workspace,
    FetchUpdate,
    FetchOld,
    Merge,
    Upload,
    Finalize,
}

impl BuildStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Workspace => "workspace",
            Self::FetchUpdate => "fetch_update",
            Self::FetchOld => "fetch_old",
            Self::Merge => "merge",
            Self::Upload => "upload",
            Self::Finalize => "finalize",
        }
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("{stage} stage failed: {error}")]
pub struct StageError {
    pub stage: BuildStage,
    #[source]
    pub error: PipelineError,
}

impl StageError {
    pub fn new(stage: BuildStage, error: PipelineError) -> Self {
        Self { stage, error }
    }

    /// Full cause chain, as stored on the failed record.
    pub fn chain_message(&self) -> String {
        render_chain(&self.error)
    }
}

fn render_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_display_includes_stage() {
        let err = StageError::new(
            BuildStage::Merge,
            PipelineError::RevisionNotFound {
                repo: PathBuf::from("/tmp/update/1/staging/abc/repo"),
                ostree_ref: "rhel/9/x86_64/edge".into(),
            },
        );
        assert_eq!(
            err.to_string(),
            "merge stage failed: ref rhel/9/x86_64/edge not found in /tmp/update/1/staging/abc/repo"
        );
        assert_eq!(err.error.kind(), "RevisionNotFoundError");
    }

    #[test]
    fn chain_message_walks_sources() {
        let err = StageError::new(
            BuildStage::FetchUpdate,
            PipelineError::Fetch {
                url: "https://example.com/c1.tar".into(),
                source: anyhow::anyhow!("connection refused"),
            },
        );
        assert_eq!(
            err.chain_message(),
            "failed to download https://example.com/c1.tar: connection refused"
        );
    }
}
