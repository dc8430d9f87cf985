//! Error taxonomy for the sync engine.
//!
//! Every variant here corresponds to one row of the error-handling table:
//! each carries its own recommended-solutions list so the CLI can print
//! uniform "Recommended solutions:" guidance regardless of which layer
//! raised the error.

use thiserror::Error;

/// An error with an attached list of recommended next steps, the way the
/// CLI wants to print it. Kept separate from `SyncError` so call sites
/// that already have an `anyhow::Error` can still attach recommendations.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct Recommended {
    pub message: String,
    pub recommendations: Vec<String>,
}

impl Recommended {
    pub fn new(message: impl Into<String>) -> Self {
        Recommended {
            message: message.into(),
            recommendations: Vec::new(),
        }
    }

    pub fn with_recommendations(
        message: impl Into<String>,
        recommendations: Vec<String>,
    ) -> Self {
        Recommended {
            message: message.into(),
            recommendations,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid arguments: {message}")]
    InvalidArguments { message: String },

    #[error("precondition failed: {message}")]
    PreconditionFailed { message: String },

    #[error("could not acquire lock for workspace '{workspace}': held by {holder}")]
    LockContention { workspace: String, holder: String },

    #[error("TFVC has changesets beyond the last fetch (server max {server_max}, cached {cached_max})")]
    RemoteAdvanced { server_max: u64, cached_max: u64 },

    #[error("nothing to check in")]
    NothingToCheckin,

    #[error("merge produced conflicts in {} path(s)", .conflicted_paths.len())]
    MergeConflict { conflicted_paths: Vec<String> },

    #[error("TFVC rejected check-in of commit {commit}: {message}")]
    CheckinFailure { commit: String, message: String },

    #[error("failed to write binding for commit {commit} after changeset {changeset} was accepted by the server")]
    BindingWriteFailed { commit: String, changeset: u64 },

    #[error("a git merge branch has unbound commits and ignore_merge is not set")]
    UnmergedBranchHasUnboundCommits,

    #[error("sync was cancelled")]
    Cancelled,

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl SyncError {
    /// CLI exit code: 0 = ok, 1 = invalid arguments or a failed
    /// precondition, 2 = any other exception, 3 = lock not acquired.
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::InvalidArguments { .. } => 1,
            SyncError::PreconditionFailed { .. } => 1,
            SyncError::LockContention { .. } => 3,
            _ => 2,
        }
    }

    pub fn recommendations(&self) -> Vec<String> {
        match self {
            SyncError::InvalidArguments { .. } => vec![],
            SyncError::PreconditionFailed { .. } => vec![
                "Run `tfs-sync init` to enable the metadata namespace and configure a remote."
                    .to_string(),
            ],
            SyncError::LockContention { workspace, .. } => vec![format!(
                "Wait for the other agent to finish, or run `tfs-sync sync --force-unlock --workspace-name {workspace}` if the lock is stale."
            )],
            SyncError::RemoteAdvanced { .. } => vec![
                "Re-run with --auto-rebase, or rebase the unbound commits onto the new TFVC tip and retry.".to_string(),
            ],
            SyncError::NothingToCheckin => vec![],
            SyncError::MergeConflict { conflicted_paths } => {
                let mut recs = vec![
                    "Resolve the conflicts in the working tree, then `git add` and commit the resolution.".to_string(),
                    "Re-run the sync; the idempotency gate will skip commits already checked in.".to_string(),
                ];
                if !conflicted_paths.is_empty() {
                    recs.push(format!("Conflicted paths: {}", conflicted_paths.join(", ")));
                }
                recs
            }
            SyncError::CheckinFailure { .. } => vec![
                "Inspect the TFVC server error above, fix the offending commit, and re-run.".to_string(),
            ],
            SyncError::BindingWriteFailed { commit, changeset } => vec![
                format!(
                    "Changeset {changeset} was created on the server for commit {commit} but the local binding was not written."
                ),
                "Run `tfs-sync repair-notes` to detect the gap, then bind it manually before re-running sync.".to_string(),
            ],
            SyncError::UnmergedBranchHasUnboundCommits => vec![
                "Check in the unbound commits on the merged branch first, or pass --ignore-merge to proceed without a merge hint.".to_string(),
            ],
            SyncError::Cancelled => vec![],
            SyncError::Fatal(_) => vec![],
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
