//! Read-only detection of changeset ids the server reports with no
//! resolving local commit. Performs no git or TFVC mutation; a human
//! or outer automation decides how to re-bind anything this reports.

use anyhow::Result;

use crate::index::ChangesetIndex;
use crate::tfvc::TfvcClient;
use crate::types::ChangesetId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedChangeset {
    pub changeset_id: u64,
}

#[derive(Debug, Default)]
pub struct RepairReport {
    pub checked: u64,
    pub unresolved: Vec<UnresolvedChangeset>,
}

pub struct NotesRepair<'repo> {
    index: ChangesetIndex<'repo>,
}

impl<'repo> NotesRepair<'repo> {
    pub fn new(repo: &'repo crate::git::GitRepo) -> Self {
        NotesRepair {
            index: ChangesetIndex::new(repo),
        }
    }

    /// Walks every changeset id from 1 up to the server's current
    /// maximum for `remote_id` and reports any with no resolving
    /// commit reachable from `scope_ref` (or any remote-tracking ref,
    /// if `scope_ref` is `None`).
    pub fn check(
        &self,
        tfvc: &dyn TfvcClient,
        remote_id: &str,
        scope_ref: Option<&str>,
    ) -> Result<RepairReport> {
        let server_max = tfvc.max_changeset_id(remote_id)?;
        let mut report = RepairReport::default();

        for raw_id in 1..=server_max {
            let Ok(changeset_id) = ChangesetId::new(raw_id) else {
                continue;
            };
            report.checked += 1;
            if self
                .index
                .find_commit_by_changeset(changeset_id, scope_ref)?
                .is_none()
            {
                report.unresolved.push(UnresolvedChangeset { changeset_id: raw_id });
            }
        }

        Ok(report)
    }
}
