//! Free-standing git subprocess helper.
//!
//! Rather than a base class shared by components that shell out to git,
//! this is a single free operation that every caller needing to invoke
//! git goes through. The git object database, ref store, and notes
//! mechanism are themselves out of scope (external collaborators) —
//! this module is the thin adapter that lets the rest of the crate
//! treat them as typed operations instead of ad-hoc `Command::new("git")`
//! calls scattered everywhere.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};

/// The result of running a git subprocess: exit code plus captured output.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// A handle on a single git working tree, used by every component that
/// needs to read or mutate it. Deliberately not `Clone` — callers pass
/// `&GitRepo` around rather than keeping independent handles, per the
/// "Ambient global state via DI container" design note (one repository
/// handle per run).
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        GitRepo { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runs `git` with `args` and `env` applied on top of the inherited
    /// environment, returning exit code, stdout, and stderr. Every other
    /// method on this type is built on it.
    pub fn run_git(&self, args: &[&str], env: &[(&str, &str)]) -> Result<GitOutput> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.root);
        cmd.args(args);
        for (k, v) in env {
            cmd.env(k, v);
        }

        let output = cmd
            .output()
            .with_context(|| format!("failed to spawn git {args:?}"))?;

        Ok(GitOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn run_ok(&self, args: &[&str]) -> Result<GitOutput> {
        let out = self.run_git(args, &[])?;
        if !out.success() {
            bail!("git {} failed: {}", args.join(" "), out.stderr.trim());
        }
        Ok(out)
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self.run_ok(&["rev-parse", "--verify", rev])?;
        Ok(out.stdout.trim().to_string())
    }

    pub fn try_rev_parse(&self, rev: &str) -> Result<Option<String>> {
        let out = self.run_git(&["rev-parse", "--verify", rev], &[])?;
        if out.success() {
            Ok(Some(out.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Commit parents in order, first-parent first.
    pub fn parents(&self, commit: &str) -> Result<Vec<String>> {
        let out = self.run_ok(&["rev-list", "--parents", "-n", "1", commit])?;
        let mut ids: Vec<&str> = out.stdout.trim().split_whitespace().collect();
        if ids.is_empty() {
            bail!("commit {commit} not found");
        }
        ids.remove(0); // drop the commit itself
        Ok(ids.into_iter().map(|s| s.to_string()).collect())
    }

    pub fn message(&self, commit: &str) -> Result<String> {
        let out = self.run_ok(&["log", "-1", "--format=%B", commit])?;
        Ok(out.stdout)
    }

    pub fn author_name(&self, commit: &str) -> Result<String> {
        let out = self.run_ok(&["log", "-1", "--format=%an", commit])?;
        Ok(out.stdout.trim().to_string())
    }

    pub fn author_email(&self, commit: &str) -> Result<String> {
        let out = self.run_ok(&["log", "-1", "--format=%ae", commit])?;
        Ok(out.stdout.trim().to_string())
    }

    pub fn committer_date(&self, commit: &str) -> Result<String> {
        let out = self.run_ok(&["log", "-1", "--format=%cI", commit])?;
        Ok(out.stdout.trim().to_string())
    }

    /// Enumerate commits reachable from `refs`, commit-date descending —
    /// the scan order ChangesetIndex's full-scan fallback walks in.
    pub fn rev_list_date_order(&self, refs: &[&str]) -> Result<Vec<String>> {
        let mut args = vec!["rev-list", "--date-order"];
        args.extend(refs.iter().copied());
        let out = self.run_ok(&args)?;
        Ok(out
            .stdout
            .lines()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }

    /// First-parent path strictly between `exclude` (exclusive) and
    /// `from` (inclusive), oldest first — the order CheckinDriver checks
    /// commits in.
    pub fn first_parent_path(&self, from: &str, exclude: Option<&str>) -> Result<Vec<String>> {
        let mut args = vec!["rev-list", "--first-parent", "--reverse", from];
        let range;
        if let Some(exclude) = exclude {
            range = format!("^{exclude}");
            args.push(&range);
        }
        let out = self.run_ok(&args)?;
        Ok(out
            .stdout
            .lines()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }

    /// All refs whose canonical name satisfies `predicate`.
    pub fn refs_matching(&self, predicate: impl Fn(&str) -> bool) -> Result<Vec<String>> {
        let out = self.run_ok(&["for-each-ref", "--format=%(refname)"])?;
        Ok(out
            .stdout
            .lines()
            .map(|s| s.trim().to_string())
            .filter(|s| predicate(s))
            .collect())
    }

    // --- notes ---

    pub fn notes_show(&self, notes_ref: &str, commit: &str) -> Result<Option<String>> {
        let out = self.run_git(&["notes", "--ref", notes_ref, "show", commit], &[])?;
        if out.success() {
            Ok(Some(out.stdout))
        } else {
            Ok(None)
        }
    }

    pub fn notes_add(&self, notes_ref: &str, commit: &str, body: &str) -> Result<()> {
        let out = self.run_git(
            &["notes", "--ref", notes_ref, "add", "-f", "-m", body, commit],
            &[],
        )?;
        if !out.success() {
            bail!("git notes add failed: {}", out.stderr.trim());
        }
        Ok(())
    }

    // --- config ---

    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        let out = self.run_git(&["config", "--get", key], &[])?;
        if out.success() {
            Ok(Some(out.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    pub fn config_get_all(&self, key: &str) -> Result<Vec<String>> {
        let out = self.run_git(&["config", "--get-all", key], &[])?;
        if out.success() {
            Ok(out.stdout.lines().map(|s| s.trim().to_string()).collect())
        } else {
            Ok(vec![])
        }
    }

    pub fn config_set(&self, key: &str, value: &str) -> Result<()> {
        self.run_ok(&["config", key, value])?;
        Ok(())
    }

    pub fn config_add(&self, key: &str, value: &str) -> Result<()> {
        self.run_ok(&["config", "--add", key, value])?;
        Ok(())
    }

    pub fn config_keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let out = self.run_git(&["config", "--get-regexp", pattern], &[])?;
        if !out.success() {
            return Ok(vec![]);
        }
        Ok(out
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next().map(|s| s.to_string()))
            .collect())
    }

    // --- merge / pull / push / fetch ---

    pub fn merge_ff_only(&self, target: &str) -> Result<GitOutput> {
        self.run_git(&["merge", "--ff-only", target], &[])
    }

    pub fn merge_no_ff(&self, target: &str, message: &str) -> Result<GitOutput> {
        self.run_git(&["merge", "--no-ff", "-m", message, target], &[])
    }

    pub fn pull_no_rebase(&self, remote: &str, refspec: &str) -> Result<GitOutput> {
        self.run_git(&["pull", "--no-rebase", remote, refspec], &[])
    }

    pub fn push(&self, remote: &str, refspec: &str, force_with_lease: bool) -> Result<GitOutput> {
        let mut args = vec!["push"];
        if force_with_lease {
            args.push("--force-with-lease");
        }
        args.push(remote);
        args.push(refspec);
        self.run_git(&args, &[])
    }

    pub fn fetch_notes(&self, remote: &str, notes_ref: &str) -> Result<GitOutput> {
        let refspec = format!("{notes_ref}:{notes_ref}");
        self.run_git(&["fetch", remote, &refspec], &[])
    }

    pub fn conflicted_paths(&self) -> Result<Vec<String>> {
        let out = self.run_ok(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(out
            .stdout
            .lines()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }

    pub fn has_conflicts(&self) -> Result<bool> {
        Ok(!self.conflicted_paths()?.is_empty())
    }

    pub fn current_head(&self) -> Result<String> {
        self.rev_parse("HEAD")
    }

    pub fn reset_hard(&self, target: &str) -> Result<()> {
        self.run_ok(&["reset", "--hard", target])?;
        Ok(())
    }
}

pub fn require_clean_hex(hash: &str) -> Result<()> {
    if hash.len() == 40 && hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(anyhow!("'{hash}' is not a 40-hex-digit commit hash"))
    }
}
