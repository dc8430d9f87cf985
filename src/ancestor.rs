//! Finds the nearest ancestor(s) of a commit that carry a
//! `ChangesetBinding`, and uses that to advance a remote's watermark.

use std::collections::HashSet;

use anyhow::Result;

use crate::git::GitRepo;
use crate::notes::NotesStore;
use crate::types::{ChangesetBinding, CommitHash, RemoteDescriptor};

pub struct AncestorWalker<'repo> {
    repo: &'repo GitRepo,
    notes: NotesStore<'repo>,
}

impl<'repo> AncestorWalker<'repo> {
    pub fn new(repo: &'repo GitRepo) -> Self {
        AncestorWalker {
            repo,
            notes: NotesStore::new(repo),
        }
    }

    /// LIFO-stack DAG walk. Parents of an unbound commit are pushed in
    /// reverse order so the first-parent is processed next — this
    /// preserves first-parent priority in the result when multiple
    /// ancestors carry bindings along different merge paths.
    pub fn find_last_parent_bindings(&self, head: &CommitHash) -> Result<Vec<ChangesetBinding>> {
        let mut stack = vec![head.clone()];
        let mut visited = HashSet::new();
        let mut bindings = Vec::new();

        while let Some(commit) = stack.pop() {
            if !visited.insert(commit.clone()) {
                continue;
            }

            if let Some(binding) = self.notes.get(&commit)? {
                bindings.push(binding);
                continue; // terminate this branch, do not traverse further
            }

            let parents = self.repo.parents(commit.as_str())?;
            for parent in parents.into_iter().rev() {
                if let Ok(hash) = CommitHash::new(parent) {
                    stack.push(hash);
                }
            }
        }

        Ok(bindings)
    }

    /// Advances `remote`'s high-watermark past any ancestor bindings
    /// belonging to it that exceed its current watermark, oldest first.
    pub fn move_remote_forward_if_needed(
        &self,
        remote: &mut RemoteDescriptor,
        head: &CommitHash,
    ) -> Result<()> {
        let mut candidates: Vec<ChangesetBinding> = self
            .find_last_parent_bindings(head)?
            .into_iter()
            .filter(|b| b.tfs_url == remote.tfs_url && b.tfs_repository_path == remote.tfs_repository_path)
            .filter(|b| b.changeset_id.get() > remote.max_changeset_id)
            .collect();

        candidates.sort_by_key(|b| b.changeset_id.get());

        for binding in candidates {
            remote.advance_watermark(binding.commit_hash, binding.changeset_id);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{checkout_new_branch, commit_empty, init_repo_with_commit, merge_no_ff};
    use crate::types::ChangesetId;

    #[test]
    fn unbound_commit_resolves_to_bound_ancestor() {
        // AncestorWalker skips unbound commits: an unbound
        // `.gitignore`-style commit sitting on top of a bound ancestor
        // resolves to that ancestor.
        let (dir, repo, base) = init_repo_with_commit();
        let notes = NotesStore::new(&repo);
        notes
            .put(&base, "https://tfs.example/tfs", "$/Proj", ChangesetId::new(5).unwrap())
            .unwrap();

        let unbound = commit_empty(dir.path(), &repo, "add .gitignore");

        let walker = AncestorWalker::new(&repo);
        let bindings = walker.find_last_parent_bindings(&unbound).unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].commit_hash, base);
        assert_eq!(bindings[0].changeset_id.get(), 5);
    }

    #[test]
    fn bound_head_returns_itself() {
        let (_dir, repo, base) = init_repo_with_commit();
        let notes = NotesStore::new(&repo);
        notes
            .put(&base, "https://tfs.example/tfs", "$/Proj", ChangesetId::new(1).unwrap())
            .unwrap();

        let walker = AncestorWalker::new(&repo);
        let bindings = walker.find_last_parent_bindings(&base).unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].commit_hash, base);
    }

    #[test]
    fn merge_with_two_bound_branches_returns_both() {
        let (dir, repo, base) = init_repo_with_commit();
        let notes = NotesStore::new(&repo);

        checkout_new_branch(dir.path(), "feature", "main");
        let feature_tip = commit_empty(dir.path(), &repo, "feature work");
        notes
            .put(&feature_tip, "https://tfs.example/tfs", "$/Proj", ChangesetId::new(10).unwrap())
            .unwrap();

        checkout_new_branch(dir.path(), "main2", "main");
        let main_tip = commit_empty(dir.path(), &repo, "main work");
        notes
            .put(&main_tip, "https://tfs.example/tfs", "$/Proj", ChangesetId::new(9).unwrap())
            .unwrap();

        assert!(merge_no_ff(dir.path(), "feature", "merge feature"));
        let merge_commit = CommitHash::new(repo.rev_parse("HEAD").unwrap()).unwrap();
        let _ = &base;

        let walker = AncestorWalker::new(&repo);
        let bindings = walker.find_last_parent_bindings(&merge_commit).unwrap();
        assert_eq!(bindings.len(), 2);
        // first-parent (main_tip, C9) must come first
        assert_eq!(bindings[0].commit_hash, main_tip);
        assert_eq!(bindings[1].commit_hash, feature_tip);
    }

    #[test]
    fn move_remote_forward_advances_watermark_in_order() {
        let (dir, repo, base) = init_repo_with_commit();
        let notes = NotesStore::new(&repo);
        let mut remote = RemoteDescriptor::new("default", "https://tfs.example/tfs", "$/Proj");

        let c1 = commit_empty(dir.path(), &repo, "one");
        notes
            .put(&c1, "https://tfs.example/tfs", "$/Proj", ChangesetId::new(6).unwrap())
            .unwrap();
        let c2 = commit_empty(dir.path(), &repo, "two");
        notes
            .put(&c2, "https://tfs.example/tfs", "$/Proj", ChangesetId::new(7).unwrap())
            .unwrap();
        let _ = &base;

        let walker = AncestorWalker::new(&repo);
        walker.move_remote_forward_if_needed(&mut remote, &c2).unwrap();

        assert_eq!(remote.max_changeset_id, 7);
        assert_eq!(remote.max_commit_hash, Some(c2));
    }
}
