//! Shared fixtures for module-local tests. Real `git` is assumed
//! present, exactly as the production code assumes it.

#![cfg(test)]

use std::process::Command;

use tempfile::TempDir;

use crate::git::GitRepo;
use crate::types::CommitHash;

fn git(dir: &std::path::Path, args: &[&str]) {
    let status = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .env("GIT_AUTHOR_NAME", "Test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "Test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .status()
        .expect("failed to run git");
    assert!(status.success(), "git {args:?} failed");
}

/// Creates a fresh repository with a single empty commit, returning the
/// owning tempdir (kept alive for the caller), an adapter, and the
/// commit's hash.
pub fn init_repo_with_commit() -> (TempDir, GitRepo, CommitHash) {
    let dir = tempfile::tempdir().unwrap();
    git(dir.path(), &["init", "-q", "-b", "main"]);
    git(
        dir.path(),
        &["commit", "--allow-empty", "-q", "-m", "initial commit"],
    );
    let repo = GitRepo::open(dir.path());
    let hash = CommitHash::new(repo.rev_parse("HEAD").unwrap()).unwrap();
    (dir, repo, hash)
}

/// Adds an empty commit on top of HEAD, returning its hash.
pub fn commit_empty(dir: &std::path::Path, repo: &GitRepo, message: &str) -> CommitHash {
    git(dir, &["commit", "--allow-empty", "-q", "-m", message]);
    CommitHash::new(repo.rev_parse("HEAD").unwrap()).unwrap()
}

/// Creates a merge commit of `other` into HEAD (may produce conflicts,
/// which are left unresolved if `allow_conflicts` is set).
pub fn merge_no_ff(dir: &std::path::Path, other: &str, message: &str) -> bool {
    let status = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["merge", "--no-ff", "-m", message, other])
        .env("GIT_AUTHOR_NAME", "Test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "Test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .status()
        .expect("failed to run git merge");
    status.success()
}

/// Creates a bare repository, registers it as `origin` for `dir`, and
/// pushes `main` (with its HEAD symref) so tests can exercise real
/// `git pull`/`git push` against it instead of a remote-less repo.
pub fn add_file_remote(dir: &std::path::Path) -> TempDir {
    let remote_dir = tempfile::tempdir().unwrap();
    let status = Command::new("git")
        .args(["init", "-q", "--bare", "-b", "main"])
        .arg(remote_dir.path())
        .status()
        .expect("failed to init bare remote");
    assert!(status.success());

    let remote_url = remote_dir.path().to_string_lossy().into_owned();
    git(dir, &["remote", "add", "origin", &remote_url]);
    git(dir, &["push", "-q", "origin", "main"]);
    remote_dir
}

pub fn checkout_new_branch(dir: &std::path::Path, name: &str, start: &str) {
    git(dir, &["checkout", "-q", "-b", name, start]);
}

pub fn checkout(dir: &std::path::Path, rev: &str) {
    git(dir, &["checkout", "-q", rev]);
}
