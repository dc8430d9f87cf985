//! Top-level state machine composing LockCoordinator, CheckinDriver,
//! AncestorWalker, and MergeArbiter into the three directions a caller
//! can request: pull server changesets into git, push git commits to
//! the server, or both in sequence under a single held lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::ancestor::AncestorWalker;
use crate::checkin::{CheckinDriver, CheckinReport};
use crate::config::RemoteConfigStore;
use crate::error::SyncError;
use crate::git::GitRepo;
use crate::lock::{AcquireResult, LockCoordinator, LockInfo};
use crate::merge::{MergeArbiter, MergeContext};
use crate::notes::NOTES_REF;
use crate::tfvc::{CheckinOptions, TfvcClient};
use crate::types::{RemoteDescriptor, SyncDirection};

/// A flag checked at each named transition below. Set it from a signal
/// handler or an outer supervisor; the orchestrator finishes whatever
/// git/TFVC call is in flight and returns `SyncError::Cancelled` rather
/// than starting the next phase.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct FromTfvcReport {
    pub server_max_changeset_id: u64,
    pub merge_performed: bool,
}

#[derive(Debug)]
pub struct BidirectionalReport {
    pub from_tfvc: FromTfvcReport,
    pub to_tfvc: CheckinReport,
}

pub struct SyncOrchestrator<'repo> {
    repo: &'repo GitRepo,
    lock: LockCoordinator,
    cancellation: CancellationToken,
}

impl<'repo> SyncOrchestrator<'repo> {
    pub fn new(repo: &'repo GitRepo, lock_dir: impl Into<std::path::PathBuf>) -> Self {
        SyncOrchestrator {
            repo,
            lock: LockCoordinator::new(lock_dir),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    fn check_cancelled(&self) -> Result<(), SyncError> {
        if self.cancellation.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn acquire(
        &self,
        workspace_name: &str,
        timeout: Duration,
        max_lock_age: Duration,
        direction: SyncDirection,
    ) -> Result<(), SyncError> {
        let info = LockInfo::new(direction);
        let result = self
            .lock
            .try_acquire(workspace_name, timeout, max_lock_age, info)
            .map_err(SyncError::Fatal)?;
        match result {
            AcquireResult::Acquired => Ok(()),
            AcquireResult::TimedOut => {
                let holder = self
                    .lock
                    .get_info(workspace_name)
                    .map_err(SyncError::Fatal)?
                    .map(|r| format!("{} on {} (pid {})", r.acquired_by, r.hostname, r.process_id))
                    .unwrap_or_else(|| "unknown holder".to_string());
                Err(SyncError::LockContention {
                    workspace: workspace_name.to_string(),
                    holder,
                })
            }
        }
    }

    fn release(&self, workspace_name: &str) {
        if let Err(err) = self.lock.release(workspace_name) {
            log::warn!("failed to release lock for '{workspace_name}': {err}");
        }
    }

    /// Pulls newly materialized server changesets into `target_branch`,
    /// merging the remote's tracking ref in. Acquires and releases the
    /// named lock around the whole operation.
    pub fn sync_from_tfvc(
        &self,
        tfvc: &mut dyn TfvcClient,
        workspace_name: &str,
        timeout: Duration,
        max_lock_age: Duration,
        remote: &mut RemoteDescriptor,
        target_branch: &str,
    ) -> Result<FromTfvcReport, SyncError> {
        self.acquire(workspace_name, timeout, max_lock_age, SyncDirection::TfvcToGit)?;
        let result = self.sync_from_tfvc_locked(tfvc, remote, target_branch);
        self.release(workspace_name);
        result
    }

    fn sync_from_tfvc_locked(
        &self,
        tfvc: &mut dyn TfvcClient,
        remote: &mut RemoteDescriptor,
        target_branch: &str,
    ) -> Result<FromTfvcReport, SyncError> {
        self.check_cancelled()?;

        let server_max = tfvc.fetch(&remote.id).map_err(SyncError::Fatal)?;

        self.check_cancelled()?;

        let ancestors = AncestorWalker::new(self.repo);
        if let Some(remote_tip) = self
            .repo
            .try_rev_parse(&remote.remote_ref)
            .map_err(SyncError::Fatal)?
        {
            let tip = crate::types::CommitHash::new(&remote_tip).map_err(SyncError::Fatal)?;
            ancestors
                .move_remote_forward_if_needed(remote, &tip)
                .map_err(SyncError::Fatal)?;
        }

        self.check_cancelled()?;

        let merge_performed = if self
            .repo
            .try_rev_parse(&remote.remote_ref)
            .map_err(SyncError::Fatal)?
            .is_some()
        {
            let before = self.repo.current_head().map_err(SyncError::Fatal)?;
            let merge_out = self
                .repo
                .merge_ff_only(&remote.remote_ref)
                .map_err(SyncError::Fatal)?;
            if !merge_out.success() {
                let merge_message = format!("merge {} into {target_branch}", remote.remote_ref);
                self.repo
                    .merge_no_ff(&remote.remote_ref, &merge_message)
                    .map_err(SyncError::Fatal)?;
            }

            if self.repo.has_conflicts().map_err(SyncError::Fatal)? {
                let arbiter = MergeArbiter::new(self.repo);
                let paths = arbiter.get_conflicted_paths().map_err(SyncError::Fatal)?;
                let context = MergeContext::detect(false, paths.clone());
                log::error!("{}", arbiter.build_report(&context));
                return Err(SyncError::MergeConflict { conflicted_paths: paths });
            }

            let after = self.repo.current_head().map_err(SyncError::Fatal)?;
            before != after
        } else {
            false
        };

        Ok(FromTfvcReport {
            server_max_changeset_id: server_max,
            merge_performed,
        })
    }

    /// Checks in every unbound commit on `target_ref`'s first-parent
    /// path. Acquires and releases the named lock around the operation.
    #[allow(clippy::too_many_arguments)]
    pub fn sync_to_tfvc(
        &self,
        tfvc: &mut dyn TfvcClient,
        workspace_name: &str,
        timeout: Duration,
        max_lock_age: Duration,
        git_remote: &str,
        target_ref: &str,
        remote: &mut RemoteDescriptor,
        options: &CheckinOptions,
        skip_precheckin_fetch: bool,
        auto_rebase: bool,
    ) -> Result<CheckinReport, SyncError> {
        self.acquire(workspace_name, timeout, max_lock_age, SyncDirection::GitToTfvc)?;
        let result = self.sync_to_tfvc_locked(
            tfvc,
            git_remote,
            target_ref,
            remote,
            options,
            skip_precheckin_fetch,
            auto_rebase,
        );
        self.release(workspace_name);
        result
    }

    /// Implements the four-step SyncToTfvc operation: pull (merge, not
    /// rebase), run CheckinDriver, then push the branch and the
    /// metadata namespace. A `nothing_to_checkin` result from
    /// CheckinDriver is treated as success so the push step still runs.
    #[allow(clippy::too_many_arguments)]
    fn sync_to_tfvc_locked(
        &self,
        tfvc: &mut dyn TfvcClient,
        git_remote: &str,
        target_ref: &str,
        remote: &mut RemoteDescriptor,
        options: &CheckinOptions,
        skip_precheckin_fetch: bool,
        auto_rebase: bool,
    ) -> Result<CheckinReport, SyncError> {
        self.check_cancelled()?;

        self.fetch_notes_if_present(git_remote)?;
        self.pull_and_check(git_remote, target_ref)?;

        self.check_cancelled()?;

        let driver = CheckinDriver::new(self.repo);
        let report = match driver.checkin(tfvc, target_ref, remote, options, skip_precheckin_fetch, auto_rebase) {
            Ok(report) => report,
            Err(SyncError::NothingToCheckin) => {
                log::info!("nothing to check in for '{target_ref}'");
                CheckinReport::default()
            }
            Err(err) => return Err(err),
        };

        self.check_cancelled()?;

        self.push_with_fallback(git_remote, target_ref)?;
        self.push_with_fallback(git_remote, NOTES_REF)?;

        Ok(report)
    }

    /// Fetches `refs/notes/tfvc-sync` from `git_remote` into the local
    /// ref of the same name, so bindings another agent pushed are visible
    /// to CheckinDriver's idempotency check before it runs. A remote
    /// that has never pushed the namespace yet is expected, not fatal.
    fn fetch_notes_if_present(&self, git_remote: &str) -> Result<(), SyncError> {
        let out = self.repo.fetch_notes(git_remote, NOTES_REF).map_err(SyncError::Fatal)?;
        if !out.success() {
            log::debug!(
                "no '{NOTES_REF}' to fetch from {git_remote} yet: {}",
                out.stderr.trim()
            );
        }
        Ok(())
    }

    /// Pulls `refspec` from `git_remote` with `--no-rebase`. A pull that
    /// fails because the merge it performs left unmerged paths is
    /// reported the same way `sync_from_tfvc_locked` reports a failed
    /// merge; any other failure (unreachable remote, no such ref) is
    /// fatal.
    fn pull_and_check(&self, git_remote: &str, refspec: &str) -> Result<(), SyncError> {
        let out = self
            .repo
            .pull_no_rebase(git_remote, refspec)
            .map_err(SyncError::Fatal)?;
        if out.success() {
            return Ok(());
        }

        if self.repo.has_conflicts().map_err(SyncError::Fatal)? {
            let arbiter = MergeArbiter::new(self.repo);
            let paths = arbiter.get_conflicted_paths().map_err(SyncError::Fatal)?;
            let context = MergeContext::detect(false, paths.clone());
            log::error!("{}", arbiter.build_report(&context));
            return Err(SyncError::MergeConflict { conflicted_paths: paths });
        }

        Err(SyncError::Fatal(anyhow!(
            "git pull --no-rebase {git_remote} {refspec} failed: {}",
            out.stderr.trim()
        )))
    }

    /// Pushes `refspec` to `git_remote`, retrying once with
    /// `--force-with-lease` if a plain push is rejected.
    fn push_with_fallback(&self, git_remote: &str, refspec: &str) -> Result<(), SyncError> {
        let out = self.repo.push(git_remote, refspec, false).map_err(SyncError::Fatal)?;
        if out.success() {
            return Ok(());
        }

        log::warn!(
            "push of {refspec} to {git_remote} was rejected, retrying once with --force-with-lease: {}",
            out.stderr.trim()
        );
        let retry = self.repo.push(git_remote, refspec, true).map_err(SyncError::Fatal)?;
        if retry.success() {
            Ok(())
        } else {
            Err(SyncError::Fatal(anyhow!(
                "push of {refspec} to {git_remote} failed even with --force-with-lease: {}",
                retry.stderr.trim()
            )))
        }
    }

    /// Runs the full SyncBidirectional sequence under a single held
    /// lock: integrate TFVC into HEAD, pull the git remote, refresh the
    /// in-memory remote state from storage, check in, then push commits
    /// and the metadata namespace — so neither direction can interleave
    /// with a concurrent invocation of either.
    #[allow(clippy::too_many_arguments)]
    pub fn sync_bidirectional(
        &self,
        tfvc: &mut dyn TfvcClient,
        workspace_name: &str,
        timeout: Duration,
        max_lock_age: Duration,
        git_remote: &str,
        remote: &mut RemoteDescriptor,
        target_branch: &str,
        options: &CheckinOptions,
    ) -> Result<BidirectionalReport, SyncError> {
        self.acquire(workspace_name, timeout, max_lock_age, SyncDirection::Bidirectional)?;
        let result = (|| {
            let from_tfvc = self.sync_from_tfvc_locked(tfvc, remote, target_branch)?;
            self.check_cancelled()?;

            self.fetch_notes_if_present(git_remote)?;
            self.pull_and_check(git_remote, target_branch)?;
            self.refresh_remote_from_storage(remote);

            self.check_cancelled()?;

            let driver = CheckinDriver::new(self.repo);
            let to_tfvc = match driver.checkin(tfvc, target_branch, remote, options, true, false) {
                Ok(report) => report,
                Err(SyncError::NothingToCheckin) => {
                    log::info!("nothing to check in for '{target_branch}'");
                    CheckinReport::default()
                }
                Err(err) => return Err(err),
            };

            self.check_cancelled()?;

            self.push_with_fallback(git_remote, target_branch)?;
            self.push_with_fallback(git_remote, NOTES_REF)?;

            Ok(BidirectionalReport { from_tfvc, to_tfvc })
        })();
        self.release(workspace_name);
        result
    }

    /// Reloads `remote` from git config, since the preceding pull may
    /// have advanced state kept in storage. The watermark this run has
    /// already established in memory wins over whatever storage holds,
    /// so a concurrently-written stale config can't regress it.
    fn refresh_remote_from_storage(&self, remote: &mut RemoteDescriptor) {
        let store = RemoteConfigStore::new(self.repo);
        match store.load(&remote.id) {
            Ok(mut stored) => {
                if remote.max_changeset_id > stored.max_changeset_id {
                    stored.max_changeset_id = remote.max_changeset_id;
                    stored.max_commit_hash = remote.max_commit_hash.clone();
                }
                *remote = stored;
            }
            Err(err) => {
                log::warn!("could not refresh remote '{}' from storage after pull: {err}", remote.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::testutil::{add_file_remote, commit_empty, init_repo_with_commit};
    use crate::tfvc::MockTfvcClient;
    use crate::types::ChangesetId;
    use tempfile::tempdir;

    fn remote() -> RemoteDescriptor {
        RemoteDescriptor::new("default", "https://tfs.example/tfs", "$/Proj/Main")
    }

    #[test]
    fn sync_to_tfvc_checks_in_new_commits_under_lock() {
        let (dir, repo, base) = init_repo_with_commit();
        let _remote_dir = add_file_remote(dir.path());
        commit_empty(dir.path(), &repo, "local change");

        let lock_dir = tempdir().unwrap();
        let orchestrator = SyncOrchestrator::new(&repo, lock_dir.path());

        let mut tfvc = MockTfvcClient::new(5);
        let mut remote = remote();
        remote.advance_watermark(base.clone(), ChangesetId::new(5).unwrap());

        let report = orchestrator
            .sync_to_tfvc(
                &mut tfvc,
                "ws",
                Duration::from_secs(5),
                Duration::from_secs(7200),
                "origin",
                "HEAD",
                &mut remote,
                &CheckinOptions::default(),
                true,
                false,
            )
            .unwrap();

        assert_eq!(report.bound.len(), 1);
        assert_eq!(remote.max_changeset_id, 6);

        // lock must have been released
        assert!(orchestrator.lock.get_info("ws").unwrap().is_none());

        // the branch and the notes namespace were both pushed
        let remote_head = repo.run_git(&["ls-remote", "origin", "refs/heads/main"], &[]).unwrap();
        assert!(remote_head.stdout.contains(repo.current_head().unwrap().as_str()));
        let remote_notes = repo.run_git(&["ls-remote", "origin", NOTES_REF], &[]).unwrap();
        assert!(!remote_notes.stdout.trim().is_empty());
    }

    #[test]
    fn sync_to_tfvc_reports_lock_contention() {
        let (dir, repo, base) = init_repo_with_commit();
        commit_empty(dir.path(), &repo, "local change");

        let lock_dir = tempdir().unwrap();
        let orchestrator = SyncOrchestrator::new(&repo, lock_dir.path());
        orchestrator
            .lock
            .try_acquire(
                "ws",
                Duration::from_secs(1),
                Duration::from_secs(7200),
                LockInfo::new(SyncDirection::GitToTfvc),
            )
            .unwrap();

        let mut tfvc = MockTfvcClient::new(5);
        let mut remote = remote();
        remote.advance_watermark(base.clone(), ChangesetId::new(5).unwrap());

        let result = orchestrator.sync_to_tfvc(
            &mut tfvc,
            "ws",
            Duration::from_millis(200),
            Duration::from_secs(7200),
            "origin",
            "HEAD",
            &mut remote,
            &CheckinOptions::default(),
            true,
            false,
        );

        assert_matches!(result, Err(SyncError::LockContention { .. }));
    }

    #[test]
    fn cancellation_before_start_short_circuits() {
        let (dir, repo, base) = init_repo_with_commit();
        commit_empty(dir.path(), &repo, "local change");

        let lock_dir = tempdir().unwrap();
        let orchestrator = SyncOrchestrator::new(&repo, lock_dir.path());
        orchestrator.cancellation_token().cancel();

        let mut tfvc = MockTfvcClient::new(5);
        let mut remote = remote();
        remote.advance_watermark(base.clone(), ChangesetId::new(5).unwrap());

        let result = orchestrator.sync_to_tfvc(
            &mut tfvc,
            "ws",
            Duration::from_secs(5),
            Duration::from_secs(7200),
            "origin",
            "HEAD",
            &mut remote,
            &CheckinOptions::default(),
            true,
            false,
        );

        assert_matches!(result, Err(SyncError::Cancelled));
        // lock is still released even on cancellation
        assert!(orchestrator.lock.get_info("ws").unwrap().is_none());
    }

    #[test]
    fn sync_from_tfvc_merges_remote_tracking_ref() {
        let (dir, repo, base) = init_repo_with_commit();
        let _ = &base;

        // simulate a remote-tracking branch the TFVC client would have
        // fast-forwarded after a fetch
        repo.run_git(&["branch", "tfs/default"], &[]).unwrap();
        let extra = commit_empty(dir.path(), &repo, "server change");
        repo.run_git(&["update-ref", "refs/heads/tfs/default", extra.as_str()], &[])
            .unwrap();
        repo.run_git(&["reset", "--hard", "HEAD~1"], &[]).unwrap();

        let mut remote = RemoteDescriptor::new("default", "https://tfs.example/tfs", "$/Proj/Main");
        remote.remote_ref = "refs/heads/tfs/default".to_string();

        let lock_dir = tempdir().unwrap();
        let orchestrator = SyncOrchestrator::new(&repo, lock_dir.path());
        let mut tfvc = MockTfvcClient::new(5);

        let report = orchestrator
            .sync_from_tfvc(
                &mut tfvc,
                "ws",
                Duration::from_secs(5),
                Duration::from_secs(7200),
                &mut remote,
                "main",
            )
            .unwrap();

        assert!(report.merge_performed);
        assert_eq!(repo.current_head().unwrap(), extra.to_string());
    }

    #[test]
    fn sync_bidirectional_pulls_checks_in_and_pushes() {
        let (dir, repo, base) = init_repo_with_commit();
        let _remote_dir = add_file_remote(dir.path());
        commit_empty(dir.path(), &repo, "local change");

        let lock_dir = tempdir().unwrap();
        let orchestrator = SyncOrchestrator::new(&repo, lock_dir.path());

        let mut tfvc = MockTfvcClient::new(5);
        let mut remote = remote();
        remote.advance_watermark(base.clone(), ChangesetId::new(5).unwrap());

        let report = orchestrator
            .sync_bidirectional(
                &mut tfvc,
                "ws",
                Duration::from_secs(5),
                Duration::from_secs(7200),
                "origin",
                &mut remote,
                "main",
                &CheckinOptions::default(),
            )
            .unwrap();

        assert_eq!(report.to_tfvc.bound.len(), 1);
        assert_eq!(remote.max_changeset_id, 6);
        assert!(orchestrator.lock.get_info("ws").unwrap().is_none());

        let remote_head = repo.run_git(&["ls-remote", "origin", "refs/heads/main"], &[]).unwrap();
        assert!(remote_head.stdout.contains(repo.current_head().unwrap().as_str()));
        let remote_notes = repo.run_git(&["ls-remote", "origin", NOTES_REF], &[]).unwrap();
        assert!(!remote_notes.stdout.trim().is_empty());
    }

    #[test]
    fn sync_to_tfvc_fetches_existing_notes_from_remote() {
        let (dir, repo, base) = init_repo_with_commit();
        let remote_dir = add_file_remote(dir.path());

        // another agent already bound `base` and pushed the note
        let other = tempdir().unwrap();
        let status = std::process::Command::new("git")
            .args(["clone", "-q"])
            .arg(remote_dir.path())
            .arg(other.path())
            .status()
            .unwrap();
        assert!(status.success());
        let other_repo = GitRepo::open(other.path());
        other_repo.notes_add(NOTES_REF, base.as_str(), "changeset=5\n").unwrap();
        other_repo.run_git(&["push", "-q", "origin", NOTES_REF], &[]).unwrap();

        commit_empty(dir.path(), &repo, "local change");

        let lock_dir = tempdir().unwrap();
        let orchestrator = SyncOrchestrator::new(&repo, lock_dir.path());

        let mut tfvc = MockTfvcClient::new(5);
        let mut remote_descriptor = remote();
        remote_descriptor.advance_watermark(base.clone(), ChangesetId::new(5).unwrap());

        orchestrator
            .sync_to_tfvc(
                &mut tfvc,
                "ws",
                Duration::from_secs(5),
                Duration::from_secs(7200),
                "origin",
                "HEAD",
                &mut remote_descriptor,
                &CheckinOptions::default(),
                true,
                false,
            )
            .unwrap();

        // the note another agent pushed is now present locally
        let shown = repo.notes_show(NOTES_REF, base.as_str()).unwrap();
        assert!(shown.unwrap().contains("changeset=5"));
    }

    #[test]
    fn sync_to_tfvc_reports_conflict_from_pull() {
        let commit_author_env: &[(&str, &str)] = &[
            ("GIT_AUTHOR_NAME", "Test"),
            ("GIT_AUTHOR_EMAIL", "test@example.com"),
            ("GIT_COMMITTER_NAME", "Test"),
            ("GIT_COMMITTER_EMAIL", "test@example.com"),
        ];

        let (dir, repo, base) = init_repo_with_commit();
        let remote_dir = add_file_remote(dir.path());
        let _ = &base;

        // a second clone pushes a conflicting change to the remote
        let other = tempdir().unwrap();
        let status = std::process::Command::new("git")
            .args(["clone", "-q"])
            .arg(remote_dir.path())
            .arg(other.path())
            .status()
            .unwrap();
        assert!(status.success());
        let other_repo = GitRepo::open(other.path());
        std::fs::write(other.path().join("f.txt"), "remote\n").unwrap();
        other_repo.run_git(&["add", "f.txt"], &[]).unwrap();
        other_repo
            .run_git(&["commit", "-q", "-m", "remote change"], commit_author_env)
            .unwrap();
        other_repo.run_git(&["push", "-q", "origin", "main"], &[]).unwrap();

        // the local clone diverges with its own change to the same file
        std::fs::write(dir.path().join("f.txt"), "local\n").unwrap();
        repo.run_git(&["add", "f.txt"], &[]).unwrap();
        repo.run_git(&["commit", "-q", "-m", "local change"], commit_author_env)
            .unwrap();

        let lock_dir = tempdir().unwrap();
        let orchestrator = SyncOrchestrator::new(&repo, lock_dir.path());

        let mut tfvc = MockTfvcClient::new(5);
        let mut remote_descriptor = remote();
        remote_descriptor.advance_watermark(base, ChangesetId::new(5).unwrap());

        let result = orchestrator.sync_to_tfvc(
            &mut tfvc,
            "ws",
            Duration::from_secs(5),
            Duration::from_secs(7200),
            "origin",
            "HEAD",
            &mut remote_descriptor,
            &CheckinOptions::default(),
            true,
            false,
        );

        assert_matches!(result, Err(SyncError::MergeConflict { .. }));
        // lock is still released when the pull conflicts
        assert!(orchestrator.lock.get_info("ws").unwrap().is_none());
    }
}
