//! S3 uploader.
//!
//! Streams every file of a built repository into the configured bucket under
//! `<account>/<id>/<path>`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info, instrument};

use super::{storage_key, walk_tree, TreeEntry, UploadSummary, Uploader, UploaderKind};
use crate::error::PipelineError;
use crate::model::UpdateRecord;

pub struct S3Uploader {
    client: Client,
    bucket: String,
}

impl S3Uploader {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait::async_trait]
impl Uploader for S3Uploader {
    fn kind(&self) -> UploaderKind {
        UploaderKind::ObjectStorage
    }

    #[instrument(skip(self, record), fields(bucket = %self.bucket, id = record.id, account = %record.account))]
    async fn upload(
        &self,
        source: &Path,
        record: &UpdateRecord,
    ) -> Result<UploadSummary, PipelineError> {
        let root = source.to_path_buf();
        let files: Vec<PathBuf> = tokio::task::spawn_blocking(move || walk_tree(&root))
            .await
            .context("blocking task panicked")
            .and_then(|walked| walked.context("walk repository tree"))
            .map_err(|source_err| PipelineError::Upload {
                path: source.to_path_buf(),
                source: source_err,
            })?
            .into_iter()
            .filter_map(|entry| match entry {
                // Symlinks are uploaded as the file they point at.
                TreeEntry::File(rel) | TreeEntry::Symlink(rel) => Some(rel),
                TreeEntry::Dir(_) => None,
            })
            .collect();

        let mut summary = UploadSummary::default();
        for rel in files {
            let path = source.join(&rel);
            let key = storage_key(record, &rel);
            let bytes = put_file(&self.client, &self.bucket, &key, &path)
                .await
                .map_err(|e| PipelineError::Upload {
                    path: path.clone(),
                    source: e,
                })?;
            summary.files += 1;
            summary.bytes += bytes;
        }

        info!(files = summary.files, bytes = summary.bytes, "repository uploaded to S3");
        Ok(summary)
    }
}

/// Upload one local file, returning its size.
#[instrument(skip_all, fields(%bucket, %key))]
async fn put_file(client: &Client, bucket: &str, key: &str, path: &Path) -> anyhow::Result<u64> {
    let size = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("stat {}", path.display()))?
        .len();

    let body = ByteStream::from_path(path)
        .await
        .with_context(|| format!("open file for upload: {}", path.display()))?;

    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(body)
        .send()
        .await
        .context("S3 PutObject")?;

    debug!(size, "object uploaded");
    Ok(size)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{StatusCode, Uri};
    use axum::routing::put;
    use axum::Router;

    use super::*;
    use crate::upload::tests::record;

    const BUCKET: &str = "edge-repos";

    /// Object paths accepted by the local S3 endpoint, in arrival order.
    #[derive(Clone, Default)]
    struct Puts(Arc<Mutex<Vec<String>>>);

    async fn put_object(State(puts): State<Puts>, uri: Uri, _body: Bytes) -> StatusCode {
        let path = uri.path().to_string();
        if path.contains("/objects/") {
            return StatusCode::FORBIDDEN;
        }
        puts.0.lock().unwrap().push(path);
        StatusCode::OK
    }

    async fn spawn_bucket() -> (SocketAddr, Puts) {
        let puts = Puts::default();
        let app = Router::new()
            .route("/{*key}", put(put_object))
            .with_state(puts.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, puts)
    }

    fn client(addr: SocketAddr) -> Client {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .credentials_provider(aws_sdk_s3::config::Credentials::new(
                "test", "test", None, None, "static",
            ))
            .endpoint_url(format!("http://{addr}"))
            .force_path_style(true)
            .retry_config(aws_sdk_s3::config::retry::RetryConfig::disabled())
            .build();
        Client::from_conf(config)
    }

    #[tokio::test]
    async fn uploads_every_file_under_account_and_id() {
        let (addr, puts) = spawn_bucket().await;
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("refs/heads")).unwrap();
        std::fs::write(src.path().join("config"), "[core]\n").unwrap();
        std::fs::write(src.path().join("refs/heads/edge"), "abcd\n").unwrap();
        let uploader = S3Uploader::new(client(addr), BUCKET.to_string());

        let summary = uploader.upload(src.path(), &record(7, "acct-1")).await.unwrap();

        assert_eq!(summary, UploadSummary { files: 2, bytes: 7 + 5 });
        let mut keys = puts.0.lock().unwrap().clone();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "/edge-repos/acct-1/7/config".to_string(),
                "/edge-repos/acct-1/7/refs/heads/edge".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn first_rejected_put_aborts_upload() {
        let (addr, puts) = spawn_bucket().await;
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("objects")).unwrap();
        std::fs::write(src.path().join("config"), "[core]\n").unwrap();
        std::fs::write(src.path().join("objects/ab.file"), "x").unwrap();
        std::fs::write(src.path().join("objects/cd.file"), "y").unwrap();
        let uploader = S3Uploader::new(client(addr), BUCKET.to_string());

        let err = uploader
            .upload(src.path(), &record(7, "acct-1"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "UploadError");
        match &err {
            PipelineError::Upload { path, .. } => assert!(path.ends_with("objects/ab.file")),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(
            *puts.0.lock().unwrap(),
            vec!["/edge-repos/acct-1/7/config".to_string()]
        );
    }
}
