//! `ostree` command wrappers using [`tokio::process::Command`].
//!
//! Every method shells out to the configured `ostree` binary.  Exit status 0
//! means success; stdout is only read for `rev-parse`.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use tokio::process::Command;
use tracing::{debug, instrument};

use super::{RepoTool, RepoToolError};

/// [`RepoTool`] backed by the `ostree` executable.
#[derive(Debug, Clone)]
pub struct OstreeCli {
    bin: PathBuf,
}

impl OstreeCli {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    /// `ostree --version`, first line.  Used by the health check.
    pub async fn version(&self) -> Result<String, RepoToolError> {
        let output = self.run("--version", |cmd| {
            cmd.arg("--version");
        })
        .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
    }

    /// Spawn `ostree` with the arguments added by `build` and wait for it.
    ///
    /// Returns the captured output only when the process exits successfully.
    async fn run<F>(&self, op: &'static str, build: F) -> Result<Output, RepoToolError>
    where
        F: FnOnce(&mut Command),
    {
        let output = self.spawn(op, build).await?;
        if !output.status.success() {
            return Err(failed(op, &output));
        }
        Ok(output)
    }

    async fn spawn<F>(&self, op: &'static str, build: F) -> Result<Output, RepoToolError>
    where
        F: FnOnce(&mut Command),
    {
        let mut cmd = Command::new(&self.bin);
        build(&mut cmd);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        debug!(op, "spawning ostree");

        cmd.output()
            .await
            .map_err(|source| RepoToolError::Spawn { op, source })
    }
}

fn failed(op: &'static str, output: &Output) -> RepoToolError {
    RepoToolError::Failed {
        op,
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

fn repo_arg(repo: &Path) -> String {
    format!("--repo={}", repo.display())
}

#[async_trait::async_trait]
impl RepoTool for OstreeCli {
    #[instrument(skip(self), fields(repo = %repo.display()))]
    async fn resolve_revision(
        &self,
        repo: &Path,
        ostree_ref: &str,
    ) -> Result<String, RepoToolError> {
        let output = self
            .spawn("rev-parse", |cmd| {
                cmd.arg("rev-parse").arg(repo_arg(repo)).arg(ostree_ref);
            })
            .await?;

        // rev-parse only fails for unknown refs or unreadable repos; both
        // mean the revision cannot be resolved.
        let revision = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() || revision.is_empty() {
            return Err(RepoToolError::RefNotFound {
                repo: repo.to_path_buf(),
                ostree_ref: ostree_ref.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!(%revision, "ref resolved");
        Ok(revision)
    }

    #[instrument(skip(self), fields(repo = %repo.display()))]
    async fn commit_metadata(
        &self,
        repo: &Path,
        ostree_ref: &str,
        metadata: &str,
    ) -> Result<(), RepoToolError> {
        self.run("commit", |cmd| {
            cmd.arg("commit")
                .arg(repo_arg(repo))
                .arg(format!("--branch={ostree_ref}"))
                .arg(format!("--tree=ref={ostree_ref}"))
                .arg(format!("--subject={metadata}"))
                .arg(format!("--add-metadata-string={metadata}"));
        })
        .await?;

        debug!("metadata committed");
        Ok(())
    }

    #[instrument(skip(self), fields(repo = %repo.display(), source = %source_repo.display()))]
    async fn pull_local(
        &self,
        repo: &Path,
        source_repo: &Path,
        revision: &str,
    ) -> Result<(), RepoToolError> {
        self.run("pull-local", |cmd| {
            cmd.arg("pull-local")
                .arg(repo_arg(repo))
                .arg(source_repo)
                .arg(revision);
        })
        .await?;

        debug!("pull-local succeeded");
        Ok(())
    }

    #[instrument(skip(self), fields(repo = %repo.display()))]
    async fn generate_delta(&self, repo: &Path, from: &str, to: &str) -> Result<(), RepoToolError> {
        self.run("static-delta generate", |cmd| {
            cmd.arg("static-delta")
                .arg("generate")
                .arg(repo_arg(repo))
                .arg(format!("--from={from}"))
                .arg(format!("--to={to}"));
        })
        .await?;

        debug!("static delta generated");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let cli = OstreeCli::new("/nonexistent/bin/ostree");
        let err = cli
            .resolve_revision(Path::new("/tmp/none"), "rhel/9/x86_64/edge")
            .await
            .unwrap_err();
        assert!(matches!(err, RepoToolError::Spawn { op: "rev-parse", .. }));
    }

    async fn ostree_available() -> bool {
        OstreeCli::new("ostree").version().await.is_ok()
    }

    async fn ostree(args: &[&str]) {
        let status = Command::new("ostree")
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .unwrap();
        assert!(status.success(), "ostree {args:?} failed");
    }

    /// Exercises the real executable when it is installed.
    #[tokio::test]
    async fn real_ostree_commit_pull_and_delta() {
        if !ostree_available().await {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let tree = tmp.path().join("tree");
        std::fs::create_dir_all(tree.join("etc")).unwrap();
        std::fs::write(tree.join("etc/os-release"), "NAME=edge\n").unwrap();

        let old_repo = tmp.path().join("old");
        let new_repo = tmp.path().join("new");
        let ostree_ref = "rhel/9/x86_64/edge";
        for repo in [&old_repo, &new_repo] {
            let repo_flag = repo_arg(repo);
            ostree(&["init", &repo_flag, "--mode=archive"]).await;
        }

        let cli = OstreeCli::new("ostree");
        let tree_flag = format!("--tree=dir={}", tree.display());
        ostree(&["commit", &repo_arg(&old_repo), "--branch", ostree_ref, "-s", "old", &tree_flag]).await;
        std::fs::write(tree.join("etc/os-release"), "NAME=edge\nVERSION=2\n").unwrap();
        ostree(&["commit", &repo_arg(&new_repo), "--branch", ostree_ref, "-s", "new", &tree_flag]).await;

        let before = cli.resolve_revision(&new_repo, ostree_ref).await.unwrap();
        assert_eq!(before, cli.resolve_revision(&new_repo, ostree_ref).await.unwrap());

        cli.commit_metadata(&new_repo, ostree_ref, "version=2024-03-01.2")
            .await
            .unwrap();
        let to = cli.resolve_revision(&new_repo, ostree_ref).await.unwrap();
        assert_ne!(before, to);

        let from = cli.resolve_revision(&old_repo, ostree_ref).await.unwrap();
        cli.pull_local(&new_repo, &old_repo, &from).await.unwrap();
        cli.generate_delta(&new_repo, &from, &to).await.unwrap();

        let missing = cli.resolve_revision(&new_repo, "no/such/ref").await.unwrap_err();
        assert!(matches!(missing, RepoToolError::RefNotFound { .. }));
    }
}
