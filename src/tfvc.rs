//! The TFVC client is an external collaborator: this crate consumes it
//! as an opaque RPC surface exposing `Fetch`, `Checkin`, and
//! `MaxChangesetId`. Only the trait and a few supporting types live
//! here; any concrete client (a real TFVC SDK binding) is out of scope.

use anyhow::Result;

use crate::types::{ChangesetId, CommitHash};

/// Options threaded through to a single check-in call: author
/// attribution overrides and the merge-branch handling flag.
#[derive(Debug, Clone, Default)]
pub struct CheckinOptions {
    pub author: Option<String>,
    pub authors_file: Option<std::path::PathBuf>,
    pub ignore_merge: bool,
    pub no_build: bool,
}

/// A binding recovered for a commit's running parent, passed to
/// `Checkin` so the server can record proper TFVC parentage.
#[derive(Debug, Clone)]
pub struct ParentBinding {
    pub changeset_id: ChangesetId,
}

/// The git-parent-independent contract this crate requires of a TFVC
/// client: `Fetch` must bind any newly-materialized commits via
/// `NotesStore::put` and advance the remote's watermark as a side
/// effect; `Checkin` must be idempotent at the granularity of a single
/// call attempt and report the assigned changeset id on success.
pub trait TfvcClient {
    /// Fetches from the server into `remote_id`, binding new commits
    /// along the way. Returns the server's current max changeset id.
    fn fetch(&mut self, remote_id: &str) -> Result<u64>;

    fn max_changeset_id(&self, remote_id: &str) -> Result<u64>;

    /// Checks a commit in to TFVC. `merged_branch_path`, when set, is
    /// passed as `tfs_repository_path_of_merged_branch`.
    fn checkin(
        &mut self,
        commit_hash: &CommitHash,
        running_parent: Option<&CommitHash>,
        parent_binding: Option<&ParentBinding>,
        options: &CheckinOptions,
        merged_branch_path: Option<&str>,
    ) -> Result<ChangesetId>;
}

/// An in-memory double used by tests and by the rest of this crate's
/// own integration tests. Mimics the minimum external behavior the
/// trait documents: each `checkin` call increments a counter and
/// returns the next changeset id; `fetch` is a no-op unless told to
/// simulate server-side changesets materializing.
#[derive(Default)]
pub struct MockTfvcClient {
    pub next_changeset: u64,
    pub checkins: Vec<CommitHash>,
    pub fail_next_checkin: bool,
}

impl MockTfvcClient {
    pub fn new(starting_changeset: u64) -> Self {
        MockTfvcClient {
            next_changeset: starting_changeset + 1,
            checkins: Vec::new(),
            fail_next_checkin: false,
        }
    }
}

impl TfvcClient for MockTfvcClient {
    fn fetch(&mut self, _remote_id: &str) -> Result<u64> {
        Ok(self.next_changeset.saturating_sub(1))
    }

    fn max_changeset_id(&self, _remote_id: &str) -> Result<u64> {
        Ok(self.next_changeset.saturating_sub(1))
    }

    fn checkin(
        &mut self,
        commit_hash: &CommitHash,
        _running_parent: Option<&CommitHash>,
        _parent_binding: Option<&ParentBinding>,
        _options: &CheckinOptions,
        _merged_branch_path: Option<&str>,
    ) -> Result<ChangesetId> {
        if self.fail_next_checkin {
            anyhow::bail!("simulated TFVC check-in failure for {commit_hash}");
        }
        let id = ChangesetId::new(self.next_changeset)?;
        self.next_changeset += 1;
        self.checkins.push(commit_hash.clone());
        Ok(id)
    }
}

/// Placeholder that satisfies the trait for builds that wire in no real
/// TFVC binding. Every call fails with a message pointing at what needs
/// to be substituted; the CLI uses this only so `tfs-sync` compiles and
/// runs standalone, and reports the gap clearly rather than silently
/// doing nothing.
pub struct NullTfvcClient;

impl TfvcClient for NullTfvcClient {
    fn fetch(&mut self, remote_id: &str) -> Result<u64> {
        anyhow::bail!(
            "no TFVC client is wired in for remote '{remote_id}' -- link a real TFVC SDK binding against the TfvcClient trait"
        )
    }

    fn max_changeset_id(&self, remote_id: &str) -> Result<u64> {
        anyhow::bail!(
            "no TFVC client is wired in for remote '{remote_id}' -- link a real TFVC SDK binding against the TfvcClient trait"
        )
    }

    fn checkin(
        &mut self,
        commit_hash: &CommitHash,
        _running_parent: Option<&CommitHash>,
        _parent_binding: Option<&ParentBinding>,
        _options: &CheckinOptions,
        _merged_branch_path: Option<&str>,
    ) -> Result<ChangesetId> {
        anyhow::bail!(
            "no TFVC client is wired in to check in commit {commit_hash} -- link a real TFVC SDK binding against the TfvcClient trait"
        )
    }
}
