//! Artifact fetcher.
//!
//! Materializes an image build on local disk: downloads the repository
//! tarball, unpacks it, drops the archive, and stamps the version metadata
//! onto the commit's ref.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use crate::error::PipelineError;
use crate::model::Commit;
use crate::ostree::{RepoTool, REPO_DIR};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Downloads and prepares commit repositories.
#[derive(Clone)]
pub struct ArtifactFetcher {
    http_client: reqwest::Client,
    tool: Arc<dyn RepoTool>,
}

impl ArtifactFetcher {
    pub fn new(http_client: reqwest::Client, tool: Arc<dyn RepoTool>) -> Self {
        Self { http_client, tool }
    }

    /// Materialize `commit` under `dest` and return the repository path
    /// (`<dest>/repo`).
    ///
    /// `dest` must be fresh; it is created if missing.
    #[instrument(skip(self, commit), fields(build_hash = %commit.build_hash, dest = %dest.display()))]
    pub async fn materialize(&self, commit: &Commit, dest: &Path) -> Result<PathBuf, PipelineError> {
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|source| PipelineError::Workspace {
                path: dest.to_path_buf(),
                source,
            })?;

        let archive = dest.join(format!("{}.tar", commit.build_hash));
        let bytes = download(&self.http_client, &commit.tar_url, &archive)
            .await
            .map_err(|source| PipelineError::Fetch {
                url: commit.tar_url.clone(),
                source,
            })?;
        debug!(bytes, archive = %archive.display(), "tarball downloaded");

        extract(&archive, dest)
            .await
            .map_err(|source| PipelineError::Extract {
                archive: archive.clone(),
                source,
            })?;

        tokio::fs::remove_file(&archive)
            .await
            .map_err(|source| PipelineError::Workspace {
                path: archive.clone(),
                source,
            })?;

        let repo = dest.join(REPO_DIR);
        self.tool
            .commit_metadata(&repo, &commit.ostree_ref, &commit.version_metadata())
            .await
            .map_err(|e| PipelineError::Commit {
                ostree_ref: commit.ostree_ref.clone(),
                source: e.into(),
            })?;

        info!(ostree_ref = %commit.ostree_ref, repo = %repo.display(), "commit materialized");
        Ok(repo)
    }
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

/// Stream `url` into `path`, returning the number of bytes written.
async fn download(client: &reqwest::Client, url: &str, path: &Path) -> anyhow::Result<u64> {
    let resp = client
        .get(url)
        .send()
        .await
        .context("request failed")?
        .error_for_status()
        .context("server returned an error status")?;

    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("create {}", path.display()))?;

    let mut written: u64 = 0;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("reading response body")?;
        file.write_all(&chunk)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    Ok(written)
}

// ---------------------------------------------------------------------------
// Extract
// ---------------------------------------------------------------------------

/// Unpack a plain or gzip-compressed tarball into `dest`.
///
/// Unpacking is synchronous, so it runs on the blocking pool.  Entries that
/// would land outside `dest` are skipped by the `tar` crate.
async fn extract(archive: &Path, dest: &Path) -> anyhow::Result<()> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || extract_sync(&archive, &dest))
        .await
        .context("blocking task panicked")?
}

fn extract_sync(archive: &Path, dest: &Path) -> anyhow::Result<()> {
    let mut file =
        File::open(archive).with_context(|| format!("open {}", archive.display()))?;

    let mut magic = [0u8; 2];
    let is_gzip = match file.read_exact(&mut magic) {
        Ok(()) => magic == GZIP_MAGIC,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => false,
        Err(e) => return Err(e).context("read archive header"),
    };
    file.seek(SeekFrom::Start(0))?;

    let reader = BufReader::new(file);
    let unpacked = if is_gzip {
        tar::Archive::new(flate2::read::GzDecoder::new(reader)).unpack(dest)
    } else {
        tar::Archive::new(reader).unpack(dest)
    };
    unpacked.context("unpack archive")?;

    if !dest.join(REPO_DIR).is_dir() {
        return Err(anyhow!("archive has no top-level {REPO_DIR}/ directory"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
