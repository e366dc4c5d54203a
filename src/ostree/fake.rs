//! File-backed stand-in for the `ostree` executable used by unit tests.
//!
//! Refs are plain files at `<repo>/refs/heads/<ref>` holding a revision, the
//! same place an archive-mode OSTree repository keeps them.  A directory is a
//! repository when it contains a `config` file.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{RepoTool, RepoToolError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ToolCall {
    Resolve { repo: PathBuf, ostree_ref: String },
    Commit { repo: PathBuf, ostree_ref: String, metadata: String },
    PullLocal { repo: PathBuf, source: PathBuf, revision: String },
    Delta { repo: PathBuf, from: String, to: String },
}

#[derive(Debug, Default)]
pub(crate) struct FakeRepoTool {
    calls: Mutex<Vec<ToolCall>>,
    fail_delta: bool,
    /// Repositories whose path contains this fragment resolve no refs.
    unresolvable: Option<String>,
}

impl FakeRepoTool {
    pub(crate) fn with_failing_delta() -> Self {
        Self {
            fail_delta: true,
            ..Default::default()
        }
    }

    pub(crate) fn with_unresolvable_repo(path_fragment: &str) -> Self {
        Self {
            unresolvable: Some(path_fragment.to_string()),
            ..Default::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<ToolCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn deltas(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ToolCall::Delta { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn pulls(&self) -> Vec<ToolCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, ToolCall::PullLocal { .. }))
            .collect()
    }

    fn record(&self, call: ToolCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn ensure_repo(op: &'static str, repo: &Path) -> Result<(), RepoToolError> {
        if repo.join("config").is_file() {
            Ok(())
        } else {
            Err(RepoToolError::Failed {
                op,
                status: "exit status: 1".into(),
                stderr: format!("{} is not an ostree repository", repo.display()),
            })
        }
    }
}

pub(crate) fn ref_path(repo: &Path, ostree_ref: &str) -> PathBuf {
    repo.join("refs").join("heads").join(ostree_ref)
}

fn read_ref(repo: &Path, ostree_ref: &str) -> Option<String> {
    std::fs::read_to_string(ref_path(repo, ostree_ref))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn derive_revision(parent: &str, metadata: &str) -> String {
    let mut hasher = DefaultHasher::new();
    parent.hash(&mut hasher);
    metadata.hash(&mut hasher);
    let h = hasher.finish();
    format!("{h:016x}{h:016x}{h:016x}{h:016x}")
}

#[async_trait::async_trait]
impl RepoTool for FakeRepoTool {
    async fn resolve_revision(
        &self,
        repo: &Path,
        ostree_ref: &str,
    ) -> Result<String, RepoToolError> {
        self.record(ToolCall::Resolve {
            repo: repo.to_path_buf(),
            ostree_ref: ostree_ref.to_string(),
        });
        let hidden = self
            .unresolvable
            .as_deref()
            .is_some_and(|fragment| repo.to_string_lossy().contains(fragment));
        let revision = if hidden { None } else { read_ref(repo, ostree_ref) };
        revision.ok_or_else(|| RepoToolError::RefNotFound {
            repo: repo.to_path_buf(),
            ostree_ref: ostree_ref.to_string(),
            detail: format!("Refspec '{ostree_ref}' not found"),
        })
    }

    async fn commit_metadata(
        &self,
        repo: &Path,
        ostree_ref: &str,
        metadata: &str,
    ) -> Result<(), RepoToolError> {
        self.record(ToolCall::Commit {
            repo: repo.to_path_buf(),
            ostree_ref: ostree_ref.to_string(),
            metadata: metadata.to_string(),
        });
        Self::ensure_repo("commit", repo)?;
        let parent = read_ref(repo, ostree_ref).ok_or_else(|| RepoToolError::Failed {
            op: "commit",
            status: "exit status: 1".into(),
            stderr: format!("Refspec '{ostree_ref}' not found"),
        })?;
        std::fs::write(
            ref_path(repo, ostree_ref),
            format!("{}\n", derive_revision(&parent, metadata)),
        )
        .map_err(|source| RepoToolError::Spawn { op: "commit", source })
    }

    async fn pull_local(
        &self,
        repo: &Path,
        source_repo: &Path,
        revision: &str,
    ) -> Result<(), RepoToolError> {
        self.record(ToolCall::PullLocal {
            repo: repo.to_path_buf(),
            source: source_repo.to_path_buf(),
            revision: revision.to_string(),
        });
        Self::ensure_repo("pull-local", repo)?;
        Self::ensure_repo("pull-local", source_repo)?;
        let objects = repo.join("objects");
        std::fs::create_dir_all(&objects)
            .and_then(|_| std::fs::write(objects.join(format!("{revision}.commit")), revision))
            .map_err(|source| RepoToolError::Spawn { op: "pull-local", source })
    }

    async fn generate_delta(&self, repo: &Path, from: &str, to: &str) -> Result<(), RepoToolError> {
        self.record(ToolCall::Delta {
            repo: repo.to_path_buf(),
            from: from.to_string(),
            to: to.to_string(),
        });
        if self.fail_delta {
            return Err(RepoToolError::Failed {
                op: "static-delta generate",
                status: "exit status: 1".into(),
                stderr: "error: out of space".into(),
            });
        }
        let deltas = repo.join("deltas");
        std::fs::create_dir_all(&deltas)
            .and_then(|_| std::fs::write(deltas.join(format!("{from}-{to}")), b"delta"))
            .map_err(|source| RepoToolError::Spawn {
                op: "static-delta generate",
                source,
            })
    }
}
