//! Repository tool adapter.
//!
//! The pipeline reaches OSTree repositories only through [`RepoTool`];
//! [`OstreeCli`] implements it on top of the `ostree` executable.

pub mod commands;
#[cfg(test)]
pub(crate) mod fake;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use commands::OstreeCli;

/// Name of the repository directory inside an extracted image tarball.
pub const REPO_DIR: &str = "repo";

#[derive(Debug, Error)]
pub enum RepoToolError {
    #[error("ref {ostree_ref} not found in {}: {detail}", repo.display())]
    RefNotFound {
        repo: PathBuf,
        ostree_ref: String,
        detail: String,
    },

    #[error("ostree {op} failed ({status}): {stderr}")]
    Failed {
        op: &'static str,
        status: String,
        stderr: String,
    },

    #[error("failed to spawn ostree {op}")]
    Spawn {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Operations the pipeline performs against an OSTree repository.
///
/// All methods block the calling task until the underlying operation exits.
#[async_trait::async_trait]
pub trait RepoTool: Send + Sync {
    /// Resolve `ostree_ref` to the revision it currently points at.
    async fn resolve_revision(&self, repo: &Path, ostree_ref: &str)
        -> Result<String, RepoToolError>;

    /// Commit `metadata` (`key=value`) onto `ostree_ref`, reusing the tree the
    /// ref already points at.
    async fn commit_metadata(
        &self,
        repo: &Path,
        ostree_ref: &str,
        metadata: &str,
    ) -> Result<(), RepoToolError>;

    /// Copy the objects reachable from `revision` in `source_repo` into `repo`.
    async fn pull_local(
        &self,
        repo: &Path,
        source_repo: &Path,
        revision: &str,
    ) -> Result<(), RepoToolError>;

    /// Generate the static delta `from -> to` inside `repo`.
    async fn generate_delta(&self, repo: &Path, from: &str, to: &str)
        -> Result<(), RepoToolError>;
}
