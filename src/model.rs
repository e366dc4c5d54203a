//! Update records and the commits they reference.
//!
//! An [`UpdateRecord`] pairs one target [`Commit`] with the commits currently
//! deployed across a set of inventory hosts.  Building the record produces a
//! single OSTree repository holding the target commit plus a static delta
//! from every old commit.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

/// An OS image build as produced by the image builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Branch-like ref inside the built repository (e.g. `rhel/9/x86_64/edge`).
    pub ostree_ref: String,
    /// Content hash of the image build.  Also names the staging directory.
    pub build_hash: String,
    /// Where the repository tarball can be downloaded from.
    pub tar_url: String,
    #[serde(default)]
    pub build_date: String,
    #[serde(default)]
    pub build_number: u32,
}

impl Commit {
    /// Metadata string stamped onto the commit's ref after extraction.
    pub fn version_metadata(&self) -> String {
        format!("version={}.{}", self.build_date, self.build_number)
    }

    fn validate(&self, field: &str) -> Result<(), PipelineError> {
        if self.ostree_ref.trim().is_empty() {
            return Err(PipelineError::Validation(format!(
                "{field}: ostree_ref must not be empty"
            )));
        }

        let hash = self.build_hash.as_str();
        if hash.is_empty() || hash == "." || hash == ".." || hash.contains(['/', '\\']) {
            return Err(PipelineError::Validation(format!(
                "{field}: build_hash {hash:?} is not usable as a directory name"
            )));
        }

        match url::Url::parse(&self.tar_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
            Ok(url) => Err(PipelineError::Validation(format!(
                "{field}: unsupported tar_url scheme {:?}",
                url.scheme()
            ))),
            Err(e) => Err(PipelineError::Validation(format!(
                "{field}: invalid tar_url {:?}: {e}",
                self.tar_url
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateState {
    Pending,
    Building,
    Success,
    Error,
}

impl UpdateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Building => "BUILDING",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "BUILDING" => Some(Self::Building),
            "SUCCESS" => Some(Self::Success),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    /// States only move forward: PENDING -> BUILDING -> {SUCCESS, ERROR}.
    pub fn can_transition_to(&self, next: UpdateState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Building)
                | (Self::Building, Self::Success)
                | (Self::Building, Self::Error)
        )
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Why a build ended in [`UpdateState::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFailure {
    pub stage: String,
    pub kind: String,
    pub message: String,
}

/// Submission payload.  The account is attached by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUpdate {
    pub update_commit: Commit,
    #[serde(default)]
    pub old_commits: Vec<Commit>,
    #[serde(default)]
    pub inventory_hosts: Vec<String>,
}

impl NewUpdate {
    /// Reject submissions the pipeline could not build.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.update_commit.validate("update_commit")?;

        let mut seen = HashSet::new();
        for (i, commit) in self.old_commits.iter().enumerate() {
            commit.validate(&format!("old_commits[{i}]"))?;
            if !seen.insert(commit.build_hash.as_str()) {
                return Err(PipelineError::Validation(format!(
                    "old_commits[{i}]: duplicate build_hash {:?}",
                    commit.build_hash
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub id: u64,
    pub account: String,
    pub update_commit: Commit,
    pub old_commits: Vec<Commit>,
    pub inventory_hosts: Vec<String>,
    pub state: UpdateState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<BuildFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UpdateRecord {
    /// A fresh PENDING record.
    pub fn new(id: u64, account: &str, update: NewUpdate) -> Self {
        let now = Utc::now();
        Self {
            id,
            account: account.to_string(),
            update_commit: update.update_commit,
            old_commits: update.old_commits,
            inventory_hosts: update.inventory_hosts,
            state: UpdateState::Pending,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, refusing regressions and repeated terminal writes.
    pub fn transition(&mut self, next: UpdateState) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.state.is_terminal(),
            "update {} already finished as {}",
            self.id,
            self.state
        );
        anyhow::ensure!(
            self.state.can_transition_to(next),
            "update {} cannot move from {} to {}",
            self.id,
            self.state,
            next
        );
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}
