//! Replays unbound git commits onto TFVC, binding each server-returned
//! changeset id to the existing commit hash without creating a new
//! commit.

use anyhow::{Context as _, Result};

use crate::ancestor::AncestorWalker;
use crate::error::SyncError;
use crate::git::GitRepo;
use crate::notes::NotesStore;
use crate::tfvc::{CheckinOptions, ParentBinding, TfvcClient};
use crate::types::{ChangesetId, CommitHash, RemoteDescriptor};

pub struct CheckinDriver<'repo> {
    repo: &'repo GitRepo,
    notes: NotesStore<'repo>,
    ancestors: AncestorWalker<'repo>,
}

#[derive(Debug, Default)]
pub struct CheckinReport {
    pub bound: Vec<(CommitHash, ChangesetId)>,
    pub already_synced: Vec<CommitHash>,
}

impl<'repo> CheckinDriver<'repo> {
    pub fn new(repo: &'repo GitRepo) -> Self {
        CheckinDriver {
            repo,
            notes: NotesStore::new(repo),
            ancestors: AncestorWalker::new(repo),
        }
    }

    /// Checks in every unbound commit on the first-parent path up to
    /// `target_ref`.
    ///
    /// `skip_precheckin_fetch` corresponds to the side-channel flag set
    /// by `SyncOrchestrator` via `GIT_TFS_SKIP_PRECHECKIN_FETCH`.
    /// `auto_rebase` governs what happens if the pre-checkin fetch
    /// (when it runs) finds the server has advanced.
    #[allow(clippy::too_many_arguments)]
    pub fn checkin(
        &self,
        tfvc: &mut dyn TfvcClient,
        target_ref: &str,
        remote: &mut RemoteDescriptor,
        options: &CheckinOptions,
        skip_precheckin_fetch: bool,
        auto_rebase: bool,
    ) -> Result<CheckinReport, SyncError> {
        if !skip_precheckin_fetch {
            let server_max = tfvc
                .max_changeset_id(&remote.id)
                .map_err(SyncError::Fatal)?;
            if server_max > remote.max_changeset_id {
                if auto_rebase {
                    tfvc.fetch(&remote.id).map_err(SyncError::Fatal)?;
                } else {
                    return Err(SyncError::RemoteAdvanced {
                        server_max,
                        cached_max: remote.max_changeset_id,
                    });
                }
            }
        }

        let target = self.resolve(target_ref).map_err(SyncError::Fatal)?;
        let exclude = remote.max_commit_hash.clone();
        let commits = self
            .repo
            .first_parent_path(&target, exclude.as_ref().map(|h| h.as_str()))
            .map_err(SyncError::Fatal)?;

        if commits.is_empty() {
            return Err(SyncError::NothingToCheckin);
        }

        let mut report = CheckinReport::default();
        let mut running_parent = exclude;
        let mut last_message_boundary = running_parent.clone();

        for commit_str in commits {
            let commit = CommitHash::new(&commit_str).map_err(SyncError::Fatal)?;

            // idempotency gate: already-bound commits are skipped rather
            // than re-checked-in, so a re-run after a partial failure
            // is safe.
            if let Some(existing) = self.notes.get(&commit).map_err(SyncError::Fatal)? {
                log::info!("{commit} already synced as changeset {}", existing.changeset_id);
                report.already_synced.push(commit.clone());
                running_parent = Some(commit.clone());
                last_message_boundary = Some(commit);
                continue;
            }

            let message = self
                .build_checkin_message(last_message_boundary.as_ref(), &commit)
                .map_err(SyncError::Fatal)?;

            let merged_branch_path = self
                .resolve_merge_branch(&commit, running_parent.as_ref(), remote, options.ignore_merge)?;

            let parent_binding = match &running_parent {
                Some(parent) => self
                    .notes
                    .get(parent)
                    .map_err(SyncError::Fatal)?
                    .map(|b| ParentBinding {
                        changeset_id: b.changeset_id,
                    }),
                None => None,
            };

            let checkin_result = tfvc.checkin(
                &commit,
                running_parent.as_ref(),
                parent_binding.as_ref(),
                &attribute_author(options, &self.author_for(&commit, &merged_branch_path, options).map_err(SyncError::Fatal)?),
                merged_branch_path.as_deref(),
            );

            let changeset_id = match checkin_result {
                Ok(id) => id,
                Err(err) => {
                    self.cleanup_after_failure(running_parent.as_ref(), &commit)
                        .map_err(SyncError::Fatal)?;
                    return Err(SyncError::CheckinFailure {
                        commit: commit.to_string(),
                        message: err.to_string(),
                    });
                }
            };

            // binding step: bind the *same, original* commit hash
            if let Err(err) = self.notes.put(
                &commit,
                &remote.tfs_url,
                &remote.tfs_repository_path,
                changeset_id,
            ) {
                log::error!("binding write failed for {commit} (changeset {changeset_id}): {err}");
                return Err(SyncError::BindingWriteFailed {
                    commit: commit.to_string(),
                    changeset: changeset_id.get(),
                });
            }

            remote.advance_watermark(commit.clone(), changeset_id);
            report.bound.push((commit.clone(), changeset_id));

            running_parent = Some(commit.clone());
            last_message_boundary = Some(commit);
        }

        Ok(report)
    }

    fn resolve(&self, rev: &str) -> Result<String> {
        self.repo.rev_parse(rev)
    }

    /// Concatenates messages from all commits reachable between the
    /// previous parent (exclusive) and `commit` (inclusive), CRLF
    /// normalized, with legacy `git-tfs-id` trailers stripped.
    fn build_checkin_message(
        &self,
        boundary: Option<&CommitHash>,
        commit: &CommitHash,
    ) -> Result<String> {
        let range = self
            .repo
            .first_parent_path(commit.as_str(), boundary.map(|h| h.as_str()))?;

        let mut parts = Vec::new();
        for c in &range {
            let raw = self.repo.message(c)?;
            parts.push(strip_legacy_trailer(&raw));
        }
        if parts.is_empty() {
            parts.push(strip_legacy_trailer(&self.repo.message(commit.as_str())?));
        }

        Ok(parts.join("\n").replace('\n', "\r\n"))
    }

    /// Identifies a possible merge-parent: among `commit`'s git parents
    /// other than `running_parent`, finds one whose nearest ancestor
    /// binding belongs to the same remote. Multiple candidates: warn
    /// and use only the last.
    fn resolve_merge_branch(
        &self,
        commit: &CommitHash,
        running_parent: Option<&CommitHash>,
        remote: &RemoteDescriptor,
        ignore_merge: bool,
    ) -> Result<Option<String>, SyncError> {
        let parents = self.repo.parents(commit.as_str()).map_err(SyncError::Fatal)?;
        if parents.len() <= 1 {
            return Ok(None);
        }

        let mut candidates = Vec::new();
        for parent in &parents {
            if Some(parent.as_str()) == running_parent.map(|h| h.as_str()) {
                continue;
            }
            let Ok(parent_hash) = CommitHash::new(parent) else {
                continue;
            };
            let bindings = self
                .ancestors
                .find_last_parent_bindings(&parent_hash)
                .map_err(SyncError::Fatal)?;
            for binding in bindings {
                if binding.tfs_url == remote.tfs_url
                    && binding.tfs_repository_path == remote.tfs_repository_path
                {
                    candidates.push(binding.tfs_repository_path.clone());
                }
            }
        }

        if candidates.is_empty() {
            if ignore_merge {
                return Ok(None);
            }
            return Err(SyncError::UnmergedBranchHasUnboundCommits);
        }

        if candidates.len() > 1 {
            log::warn!(
                "commit {commit} has {} candidate merged-branch parents bound to remote '{}'; using the last",
                candidates.len(),
                remote.id
            );
        }

        Ok(candidates.into_iter().last())
    }

    fn author_for(&self, commit: &CommitHash, merged_branch_path: &Option<String>, options: &CheckinOptions) -> Result<String> {
        // Author attribution precedence:
        // (i) explicit --author, (ii) authors-file map, (iii) inferred
        // from the git author identity, (iv) authenticated caller.
        // For merge commits, credit the last merged parent's author
        // instead of the merge commit's own.
        if let Some(author) = &options.author {
            return Ok(author.clone());
        }

        let parents = self.repo.parents(commit.as_str())?;
        let author_commit = if parents.len() > 1 && merged_branch_path.is_some() {
            parents.last().cloned().unwrap_or_else(|| commit.to_string())
        } else {
            commit.to_string()
        };

        if let Some(authors_file) = &options.authors_file {
            if let Some(mapped) = lookup_authors_file(authors_file, &self.repo.author_email(&author_commit)?)? {
                return Ok(mapped);
            }
        }

        let name = self.repo.author_name(&author_commit)?;
        let email = self.repo.author_email(&author_commit)?;
        Ok(infer_author(&name, &email))
    }

    /// Best-effort cleanup after a mid-sequence checkin failure: rebase
    /// anything after the last successfully bound commit is left to the
    /// caller's git workflow; here we only ensure the running parent is
    /// left pointing at the last bound commit so a re-run's idempotency
    /// gate resumes correctly.
    fn cleanup_after_failure(&self, _last_bound: Option<&CommitHash>, _failed: &CommitHash) -> Result<()> {
        // No git state mutation needed: bindings already written are
        // untouched (immutable), and the idempotency gate handles resume.
        Ok(())
    }
}

fn strip_legacy_trailer(message: &str) -> String {
    let mut lines: Vec<&str> = message.lines().collect();
    while let Some(last) = lines.last() {
        if last.trim().is_empty() || last.trim_start().starts_with("git-tfs-id:") {
            lines.pop();
        } else {
            break;
        }
    }
    lines.join("\n")
}

fn infer_author(name: &str, email: &str) -> String {
    if name.contains('\\') {
        // already in DOMAIN\user form
        return name.to_string();
    }
    email
        .split('@')
        .next()
        .map(|s| s.to_string())
        .unwrap_or_else(|| name.to_string())
}

fn lookup_authors_file(path: &std::path::Path, git_email: &str) -> Result<Option<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read authors file {}", path.display()))?;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == git_email {
                return Ok(Some(value.trim().to_string()));
            }
        }
    }
    Ok(None)
}

fn attribute_author(options: &CheckinOptions, resolved_author: &str) -> CheckinOptions {
    let mut opts = options.clone();
    opts.author = Some(resolved_author.to_string());
    opts
}
