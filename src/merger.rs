//! Repository merger: folds an old commit's repository into the update
//! repository and generates the static delta between them.

use std::path::Path;

use tracing::{info, instrument};

use crate::error::PipelineError;
use crate::ostree::{RepoTool, RepoToolError};

/// A static delta generated inside the update repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticDelta {
    pub from: String,
    pub to: String,
}

/// Pull `source_ref` from `source_repo` into `target_repo` and generate the
/// static delta from it to `target_ref`.
///
/// Both refs are resolved up front: deltas address fixed revisions, and a
/// ref could move between the pull and the delta.
#[instrument(
    skip(tool),
    fields(target = %target_repo.display(), source = %source_repo.display())
)]
pub async fn merge_and_delta(
    tool: &dyn RepoTool,
    target_repo: &Path,
    target_ref: &str,
    source_repo: &Path,
    source_ref: &str,
) -> Result<StaticDelta, PipelineError> {
    let to = resolve(tool, target_repo, target_ref).await?;
    let from = resolve(tool, source_repo, source_ref).await?;

    let delta_error = |e: RepoToolError| PipelineError::DeltaGeneration {
        detail: format!("from {from} to {to}"),
        source: e.into(),
    };

    tool.pull_local(target_repo, source_repo, &from)
        .await
        .map_err(delta_error)?;

    tool.generate_delta(target_repo, &from, &to)
        .await
        .map_err(delta_error)?;

    info!(%from, %to, "static delta generated");
    Ok(StaticDelta { from, to })
}

async fn resolve(tool: &dyn RepoTool, repo: &Path, ostree_ref: &str) -> Result<String, PipelineError> {
    tool.resolve_revision(repo, ostree_ref)
        .await
        .map_err(|e| match e {
            RepoToolError::RefNotFound {
                repo, ostree_ref, ..
            } => PipelineError::RevisionNotFound { repo, ostree_ref },
            other => PipelineError::DeltaGeneration {
                detail: format!("cannot resolve {ostree_ref} in {}", repo.display()),
                source: other.into(),
            },
        })
}
