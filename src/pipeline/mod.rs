//! Build orchestration.
//!
//! A build claims its record, materializes the update commit into
//! `<work_root>/<id>/repo`, folds every old commit into it through a staging
//! area while generating static deltas, uploads the result and persists the
//! terminal state.  The working directory is removed only after a successful
//! build so failed builds can be inspected.

pub mod dispatch;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, instrument, warn};

use crate::error::{BuildStage, PipelineError, StageError};
use crate::fetcher::ArtifactFetcher;
use crate::merger::{merge_and_delta, StaticDelta};
use crate::model::{BuildFailure, UpdateRecord, UpdateState};
use crate::ostree::RepoTool;
use crate::store::UpdateStore;
use crate::upload::{UploadSummary, Uploader};

pub use dispatch::{run_supervisor, Dispatcher};

const STAGING_DIR: &str = "staging";

#[derive(Debug)]
pub enum BuildOutcome {
    Succeeded {
        deltas: Vec<StaticDelta>,
        upload: UploadSummary,
    },
    Failed(StageError),
    /// Another task holds the build lease, or the record is not PENDING.
    Skipped,
}

/// What a finished build task hands back to its supervisor.
#[derive(Debug)]
pub struct BuildReport {
    pub id: u64,
    pub account: String,
    pub outcome: BuildOutcome,
    /// Non-fatal [`PipelineError::Cleanup`] failures.
    pub cleanup_warnings: Vec<PipelineError>,
    pub duration: Duration,
}

pub struct BuildPipeline {
    tool: Arc<dyn RepoTool>,
    fetcher: ArtifactFetcher,
    uploader: Arc<dyn Uploader>,
    store: Arc<dyn UpdateStore>,
    work_root: PathBuf,
}

impl BuildPipeline {
    pub fn new(
        tool: Arc<dyn RepoTool>,
        fetcher: ArtifactFetcher,
        uploader: Arc<dyn Uploader>,
        store: Arc<dyn UpdateStore>,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tool,
            fetcher,
            uploader,
            store,
            work_root: work_root.into(),
        }
    }

    pub fn work_dir(&self, id: u64) -> PathBuf {
        self.work_root.join(id.to_string())
    }

    /// Drive `record` from PENDING to SUCCESS or ERROR.
    #[instrument(skip_all, fields(id = record.id, account = %record.account))]
    pub async fn build_repo(&self, mut record: UpdateRecord) -> BuildReport {
        let started = Instant::now();
        let mut cleanup_warnings = Vec::new();

        let outcome = match self.store.claim_build(record.id).await {
            Ok(false) => {
                info!("build lease refused, skipping");
                BuildOutcome::Skipped
            }
            Err(e) => {
                let err = StageError::new(BuildStage::Claim, PipelineError::Persistence(e));
                error!(error = %err.chain_message(), "failed to claim update");
                BuildOutcome::Failed(err)
            }
            Ok(true) => {
                record.state = UpdateState::Building;
                record.updated_at = chrono::Utc::now();
                info!(old_commits = record.old_commits.len(), "build started");

                let work = self.work_dir(record.id);
                match self.run_stages(&record, &work, &mut cleanup_warnings).await {
                    Ok((deltas, upload)) => {
                        self.finish_success(&mut record, &work, deltas, upload, &mut cleanup_warnings)
                            .await
                    }
                    Err(err) => {
                        self.finish_failure(&mut record, &err).await;
                        BuildOutcome::Failed(err)
                    }
                }
            }
        };

        BuildReport {
            id: record.id,
            account: record.account,
            outcome,
            cleanup_warnings,
            duration: started.elapsed(),
        }
    }

    async fn run_stages(
        &self,
        record: &UpdateRecord,
        work: &Path,
        cleanup_warnings: &mut Vec<PipelineError>,
    ) -> Result<(Vec<StaticDelta>, UploadSummary), StageError> {
        prepare_work_dir(work).await.map_err(|source| {
            stage(
                BuildStage::Workspace,
                PipelineError::Workspace {
                    path: work.to_path_buf(),
                    source,
                },
            )
        })?;

        let update = &record.update_commit;
        let repo = self
            .fetcher
            .materialize(update, work)
            .await
            .map_err(|e| stage(BuildStage::FetchUpdate, e))?;

        let mut deltas = Vec::with_capacity(record.old_commits.len());
        if !record.old_commits.is_empty() {
            let staging = work.join(STAGING_DIR);
            tokio::fs::create_dir_all(&staging)
                .await
                .map_err(|source| {
                    stage(
                        BuildStage::Workspace,
                        PipelineError::Workspace {
                            path: staging.clone(),
                            source,
                        },
                    )
                })?;

            for old in &record.old_commits {
                let old_repo = self
                    .fetcher
                    .materialize(old, &staging.join(&old.build_hash))
                    .await
                    .map_err(|e| stage(BuildStage::FetchOld, e))?;

                let delta = merge_and_delta(
                    self.tool.as_ref(),
                    &repo,
                    &update.ostree_ref,
                    &old_repo,
                    &old.ostree_ref,
                )
                .await
                .map_err(|e| stage(BuildStage::Merge, e))?;
                deltas.push(delta);
            }

            if let Err(warning) = remove_dir(&staging).await {
                warn!(error = %warning, "failed to remove staging directory");
                cleanup_warnings.push(warning);
            }
        }

        let upload = self
            .uploader
            .upload(&repo, record)
            .await
            .map_err(|e| stage(BuildStage::Upload, e))?;

        Ok((deltas, upload))
    }

    async fn finish_success(
        &self,
        record: &mut UpdateRecord,
        work: &Path,
        deltas: Vec<StaticDelta>,
        upload: UploadSummary,
        cleanup_warnings: &mut Vec<PipelineError>,
    ) -> BuildOutcome {
        if let Err(e) = self.persist(record, UpdateState::Success).await {
            let err = StageError::new(BuildStage::Finalize, e);
            error!(error = %err.chain_message(), "failed to persist successful build");
            return BuildOutcome::Failed(err);
        }

        if let Err(warning) = remove_dir(work).await {
            warn!(error = %warning, "failed to remove working directory");
            cleanup_warnings.push(warning);
        }

        info!(
            deltas = deltas.len(),
            files = upload.files,
            bytes = upload.bytes,
            "build succeeded"
        );
        BuildOutcome::Succeeded { deltas, upload }
    }

    async fn finish_failure(&self, record: &mut UpdateRecord, err: &StageError) {
        let message = err.chain_message();
        error!(stage = %err.stage, kind = err.error.kind(), error = %message, "build failed");

        record.failure = Some(BuildFailure {
            stage: err.stage.as_str().to_string(),
            kind: err.error.kind().to_string(),
            message,
        });
        if let Err(e) = self.persist(record, UpdateState::Error).await {
            error!(error = %e, "failed to persist build failure");
        }
    }

    async fn persist(&self, record: &mut UpdateRecord, state: UpdateState) -> Result<(), PipelineError> {
        record.transition(state).map_err(PipelineError::Persistence)?;
        self.store
            .save(record)
            .await
            .map_err(PipelineError::Persistence)
    }
}

fn stage(stage: BuildStage, error: PipelineError) -> StageError {
    StageError::new(stage, error)
}

/// Leave `work` as an empty directory.
///
/// Ids can repeat across restarts of the in-memory store and failed builds
/// keep their tree, so leftovers are discarded rather than built upon.
async fn prepare_work_dir(work: &Path) -> std::io::Result<()> {
    match tokio::fs::read_dir(work).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                warn!(work = %work.display(), "discarding leftover working directory");
                tokio::fs::remove_dir_all(work).await?;
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(work).await
}

async fn remove_dir(path: &Path) -> Result<(), PipelineError> {
    tokio::fs::remove_dir_all(path)
        .await
        .map_err(|source| PipelineError::Cleanup {
            path: path.to_path_buf(),
            source,
        })
}
