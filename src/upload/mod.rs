//! Publishing built repositories.
//!
//! Uploaded trees are addressed as `<account>/<id>/<path>`, the layout the
//! repository proxy rewrites `/<api-prefix>/<id>/<path>` requests onto.

pub mod local;
pub mod s3;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use crate::config::StorageConfig;
use crate::error::PipelineError;
use crate::model::UpdateRecord;

pub use local::LocalUploader;
pub use s3::S3Uploader;

/// What an upload wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub files: u64,
    pub bytes: u64,
}

#[async_trait::async_trait]
pub trait Uploader: Send + Sync {
    fn kind(&self) -> UploaderKind;

    /// Publish every file under `source` for `record`.
    ///
    /// Stops at the first failed write; earlier writes are left in place.
    async fn upload(&self, source: &Path, record: &UpdateRecord)
        -> Result<UploadSummary, PipelineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploaderKind {
    Local,
    ObjectStorage,
}

impl UploaderKind {
    /// A configured bucket wins over local storage.
    pub fn select(storage: &StorageConfig) -> Self {
        if storage.s3.bucket.trim().is_empty() {
            Self::Local
        } else {
            Self::ObjectStorage
        }
    }
}

/// Build the uploader selected by `storage`.
///
/// `s3_client` must be present when a bucket is configured.
pub fn build_uploader(
    storage: &StorageConfig,
    s3_client: Option<aws_sdk_s3::Client>,
) -> anyhow::Result<Arc<dyn Uploader>> {
    match UploaderKind::select(storage) {
        UploaderKind::Local => Ok(Arc::new(LocalUploader::new(&storage.local.path))),
        UploaderKind::ObjectStorage => {
            let client = s3_client.context("bucket configured but no S3 client was built")?;
            Ok(Arc::new(S3Uploader::new(client, storage.s3.bucket.clone())))
        }
    }
}

/// Object key for `relative` inside `record`'s upload.
pub fn storage_key(record: &UpdateRecord, relative: &Path) -> String {
    let rel: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    format!("{}/{}/{}", record.account, record.id, rel.join("/"))
}

// ---------------------------------------------------------------------------
// Tree walking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TreeEntry {
    Dir(PathBuf),
    File(PathBuf),
    Symlink(PathBuf),
}

/// List everything under `root` as paths relative to it, parents before
/// children.  Symlinks are reported, not followed.
pub(crate) fn walk_tree(root: &Path) -> std::io::Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    let mut stack = vec![PathBuf::new()];

    while let Some(rel) = stack.pop() {
        let mut children: Vec<_> = std::fs::read_dir(root.join(&rel))?.collect::<Result<_, _>>()?;
        children.sort_by_key(|e| e.file_name());

        for child in children {
            let child_rel = rel.join(child.file_name());
            let file_type = child.file_type()?;
            if file_type.is_symlink() {
                entries.push(TreeEntry::Symlink(child_rel));
            } else if file_type.is_dir() {
                entries.push(TreeEntry::Dir(child_rel.clone()));
                stack.push(child_rel);
            } else if file_type.is_file() {
                entries.push(TreeEntry::File(child_rel));
            }
        }
    }

    Ok(entries)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::storage_config;
    use crate::model::tests::commit;
    use crate::model::NewUpdate;

    pub(crate) fn record(id: u64, account: &str) -> UpdateRecord {
        UpdateRecord::new(
            id,
            account,
            NewUpdate {
                update_commit: commit("c1"),
                old_commits: vec![],
                inventory_hosts: vec![],
            },
        )
    }

    #[test]
    fn bucket_selects_object_storage() {
        let mut storage = storage_config("/srv/repos");
        assert_eq!(UploaderKind::select(&storage), UploaderKind::Local);

        storage.s3.bucket = "rh-edge-tarballs".into();
        assert_eq!(UploaderKind::select(&storage), UploaderKind::ObjectStorage);
    }

    #[test]
    fn object_storage_without_client_is_an_error() {
        let mut storage = storage_config("/srv/repos");
        storage.s3.bucket = "rh-edge-tarballs".into();
        assert!(build_uploader(&storage, None).is_err());
        storage.s3.bucket.clear();
        let uploader = build_uploader(&storage, None).unwrap();
        assert_eq!(uploader.kind(), UploaderKind::Local);
    }

    #[test]
    fn storage_key_layout() {
        let key = storage_key(&record(42, "6089719"), Path::new("refs/heads/rhel/9/x86_64/edge"));
        assert_eq!(key, "6089719/42/refs/heads/rhel/9/x86_64/edge");
    }

    #[test]
    fn walk_lists_parents_first() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("objects/ab")).unwrap();
        std::fs::write(tmp.path().join("config"), "x").unwrap();
        std::fs::write(tmp.path().join("objects/ab/cd.file"), "y").unwrap();

        let entries = walk_tree(tmp.path()).unwrap();
        assert_eq!(
            entries,
            vec![
                TreeEntry::File(PathBuf::from("config")),
                TreeEntry::Dir(PathBuf::from("objects")),
                TreeEntry::Dir(PathBuf::from("objects/ab")),
                TreeEntry::File(PathBuf::from("objects/ab/cd.file")),
            ]
        );
    }
}
