//! Invoked by `SyncOrchestrator` when a merge operation fails. Never
//! attempts to resolve conflicts itself — only reports.

use anyhow::Result;

use crate::git::GitRepo;

/// Environment the arbiter builds its report for: CI vs interactive,
/// single-repo vs multi-agent. Resolution guidance differs along both
/// axes.
#[derive(Debug, Clone)]
pub struct MergeContext {
    pub is_ci: bool,
    pub build_id: Option<String>,
    pub is_multi_agent: bool,
    pub conflicted_paths: Vec<String>,
}

impl MergeContext {
    /// `is_ci` is true iff any of `BUILD_BUILDID`, `CI`, `TF_BUILD` is
    /// set. `TF_BUILD` is the Azure Pipelines/TFS build-agent signal
    /// matching `BUILD_BUILDID`.
    pub fn detect(is_multi_agent: bool, conflicted_paths: Vec<String>) -> Self {
        let build_id = std::env::var("BUILD_BUILDID").ok();
        let is_ci = build_id.is_some()
            || std::env::var("CI").is_ok()
            || std::env::var("TF_BUILD").is_ok();
        MergeContext {
            is_ci,
            build_id,
            is_multi_agent,
            conflicted_paths,
        }
    }
}

pub struct MergeArbiter<'repo> {
    repo: &'repo GitRepo,
}

impl<'repo> MergeArbiter<'repo> {
    pub fn new(repo: &'repo GitRepo) -> Self {
        MergeArbiter { repo }
    }

    pub fn has_conflicts(&self) -> Result<bool> {
        self.repo.has_conflicts()
    }

    pub fn get_conflicted_paths(&self) -> Result<Vec<String>> {
        self.repo.conflicted_paths()
    }

    /// Produces human-readable guidance. The working tree is left in
    /// the conflicted state; a human or outer automation resolves,
    /// commits, and re-invokes — the subsequent sync resumes safely
    /// thanks to CheckinDriver's idempotency gate.
    pub fn build_report(&self, context: &MergeContext) -> String {
        let mut lines = Vec::new();
        lines.push("Merge produced conflicts and was halted.".to_string());
        lines.push(String::new());
        lines.push("Conflicted paths:".to_string());
        for path in &context.conflicted_paths {
            lines.push(format!("  {path}"));
        }
        lines.push(String::new());

        if context.is_ci {
            let build = context
                .build_id
                .as_deref()
                .unwrap_or("(unknown build)");
            lines.push(format!(
                "This run was detected as a CI build ({build}). Automated conflict resolution is not supported; fail this build and resolve the conflict from a local clone."
            ));
        } else {
            lines.push(
                "Resolve the conflicts in your working tree (`git status` lists the unmerged paths), then `git add` the resolved files and commit the merge.".to_string(),
            );
        }

        if context.is_multi_agent {
            lines.push(
                "Another agent may be mid-sync against the same workspace; confirm the lock is held by you before resolving.".to_string(),
            );
        }

        lines.push(String::new());
        lines.push("Re-run `tfs-sync sync` once the merge is committed; already-synced commits will be skipped.".to_string());

        lines.join("\n")
    }
}
