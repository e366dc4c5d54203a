//! Local filesystem uploader.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{info, instrument};

use super::{walk_tree, TreeEntry, UploadSummary, Uploader, UploaderKind};
use crate::error::PipelineError;
use crate::model::UpdateRecord;

/// Copies built repositories to `{base_path}/{account}/{id}/`, replacing
/// whatever an earlier upload for the same id left there.
#[derive(Debug, Clone)]
pub struct LocalUploader {
    pub base_path: PathBuf,
}

impl LocalUploader {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn record_path(&self, record: &UpdateRecord) -> PathBuf {
        self.base_path
            .join(&record.account)
            .join(record.id.to_string())
    }
}

#[async_trait::async_trait]
impl Uploader for LocalUploader {
    fn kind(&self) -> UploaderKind {
        UploaderKind::Local
    }

    #[instrument(skip(self, record), fields(id = record.id, account = %record.account))]
    async fn upload(
        &self,
        source: &Path,
        record: &UpdateRecord,
    ) -> Result<UploadSummary, PipelineError> {
        let source = source.to_path_buf();
        let dest = self.record_path(record);

        let task_dest = dest.clone();
        let summary = tokio::task::spawn_blocking(move || copy_tree(&source, &task_dest))
            .await
            .map_err(|e| PipelineError::Upload {
                path: dest.clone(),
                source: anyhow::Error::new(e).context("blocking task panicked"),
            })??;

        info!(
            dest = %dest.display(),
            files = summary.files,
            bytes = summary.bytes,
            "repository copied to local storage"
        );
        Ok(summary)
    }
}

fn copy_tree(source: &Path, dest: &Path) -> Result<UploadSummary, PipelineError> {
    let upload_err = |path: &Path, source: anyhow::Error| PipelineError::Upload {
        path: path.to_path_buf(),
        source,
    };

    if dest.symlink_metadata().is_ok() {
        std::fs::remove_dir_all(dest)
            .with_context(|| format!("replace previous upload {}", dest.display()))
            .map_err(|e| upload_err(dest, e))?;
    }
    std::fs::create_dir_all(dest)
        .with_context(|| format!("create {}", dest.display()))
        .map_err(|e| upload_err(dest, e))?;

    let entries = walk_tree(source)
        .with_context(|| format!("walk {}", source.display()))
        .map_err(|e| upload_err(source, e))?;

    let mut summary = UploadSummary::default();
    for entry in entries {
        match entry {
            TreeEntry::Dir(rel) => {
                let target = dest.join(&rel);
                std::fs::create_dir_all(&target)
                    .context("create directory")
                    .map_err(|e| upload_err(&target, e))?;
            }
            TreeEntry::File(rel) => {
                let target = dest.join(&rel);
                let bytes = std::fs::copy(source.join(&rel), &target)
                    .context("copy file")
                    .map_err(|e| upload_err(&target, e))?;
                summary.files += 1;
                summary.bytes += bytes;
            }
            TreeEntry::Symlink(rel) => {
                let target = dest.join(&rel);
                copy_symlink(&source.join(&rel), &target).map_err(|e| upload_err(&target, e))?;
            }
        }
    }

    Ok(summary)
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> anyhow::Result<()> {
    let points_to = std::fs::read_link(link).context("read symlink")?;
    if target.symlink_metadata().is_ok() {
        std::fs::remove_file(target).context("replace existing entry")?;
    }
    std::os::unix::fs::symlink(points_to, target).context("create symlink")
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> anyhow::Result<()> {
    std::fs::copy(link, target).context("copy symlink target")?;
    Ok(())
}
