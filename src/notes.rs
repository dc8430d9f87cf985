//! Persists and retrieves `ChangesetBinding`s keyed by commit hash, out
//! of band from commit identity, via git notes.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::git::GitRepo;
use crate::types::{ChangesetBinding, ChangesetId, CommitHash};

pub const NOTES_REF: &str = "refs/notes/tfvc-sync";

pub struct NotesStore<'repo> {
    repo: &'repo GitRepo,
    notes_ref: String,
}

impl<'repo> NotesStore<'repo> {
    pub fn new(repo: &'repo GitRepo) -> Self {
        NotesStore {
            repo,
            notes_ref: NOTES_REF.to_string(),
        }
    }

    pub fn with_ref(repo: &'repo GitRepo, notes_ref: impl Into<String>) -> Self {
        NotesStore {
            repo,
            notes_ref: notes_ref.into(),
        }
    }

    /// Write or replace the binding for `commit_hash`. Overwrites any
    /// existing binding on that commit.
    pub fn put(
        &self,
        commit_hash: &CommitHash,
        tfs_url: &str,
        tfs_path: &str,
        changeset_id: ChangesetId,
    ) -> Result<()> {
        let body = format!(
            "changeset={}\ntfs_url={}\ntfs_path={}\nsynced_at={}\n",
            changeset_id.get(),
            tfs_url,
            tfs_path,
            Utc::now().to_rfc3339(),
        );
        self.repo
            .notes_add(&self.notes_ref, commit_hash.as_str(), &body)
    }

    /// Reads the binding for `commit_hash` if present and well-formed.
    /// A present-but-corrupt note is treated the same as "not found",
    /// with a warning so the corruption isn't silent.
    pub fn get(&self, commit_hash: &CommitHash) -> Result<Option<ChangesetBinding>> {
        let Some(body) = self.repo.notes_show(&self.notes_ref, commit_hash.as_str())? else {
            return Ok(None);
        };
        match parse_binding(&body, commit_hash) {
            Some(binding) => Ok(Some(binding)),
            None => {
                log::warn!(
                    "binding note on {commit_hash} is present but malformed; treating as absent"
                );
                Ok(None)
            }
        }
    }

    /// Wires the metadata namespace into `remote`'s fetch/push refspec
    /// list if it isn't already present. Idempotent.
    pub fn configure_remote_to_sync(&self, remote: &str) -> Result<()> {
        let refspec = format!("{ref_}:{ref_}", ref_ = self.notes_ref);

        let fetch_key = format!("remote.{remote}.fetch");
        let existing_fetch = self.repo.config_get_all(&fetch_key)?;
        if !existing_fetch.iter().any(|v| v == &refspec) {
            self.repo.config_add(&fetch_key, &refspec)?;
        }

        let push_key = format!("remote.{remote}.push");
        let existing_push = self.repo.config_get_all(&push_key)?;
        if !existing_push.iter().any(|v| v == &refspec) {
            self.repo.config_add(&push_key, &refspec)?;
        }

        Ok(())
    }

    pub fn notes_ref(&self) -> &str {
        &self.notes_ref
    }
}

fn parse_binding(body: &str, commit_hash: &CommitHash) -> Option<ChangesetBinding> {
    let mut changeset: Option<u64> = None;
    let mut tfs_url: Option<String> = None;
    let mut tfs_path: Option<String> = None;
    let mut synced_at: Option<DateTime<Utc>> = None;

    for line in body.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "changeset" => changeset = value.parse().ok(),
            "tfs_url" if !value.is_empty() => tfs_url = Some(value.to_string()),
            "tfs_path" if !value.is_empty() => tfs_path = Some(value.to_string()),
            "synced_at" => {
                synced_at = DateTime::parse_from_rfc3339(value)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc));
            }
            _ => {} // unknown keys ignored, per spec
        }
    }

    let changeset_id = ChangesetId::new(changeset?).ok()?;

    Some(ChangesetBinding {
        changeset_id,
        tfs_url: tfs_url.unwrap_or_default(),
        tfs_repository_path: tfs_path.unwrap_or_default(),
        commit_hash: commit_hash.clone(),
        bound_at: synced_at.unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::init_repo_with_commit;

    #[test]
    fn put_then_get_round_trips() {
        let (dir, repo, commit) = init_repo_with_commit();
        let _ = &dir;
        let store = NotesStore::new(&repo);

        store
            .put(&commit, "https://tfs.example/tfs", "$/Proj/Main", ChangesetId::new(42).unwrap())
            .unwrap();

        let binding = store.get(&commit).unwrap().unwrap();
        assert_eq!(binding.changeset_id.get(), 42);
        assert_eq!(binding.tfs_url, "https://tfs.example/tfs");
        assert_eq!(binding.tfs_repository_path, "$/Proj/Main");
        assert_eq!(binding.commit_hash, commit);
    }

    #[test]
    fn get_missing_binding_returns_none() {
        let (_dir, repo, commit) = init_repo_with_commit();
        let store = NotesStore::new(&repo);
        assert!(store.get(&commit).unwrap().is_none());
    }

    #[test]
    fn put_overwrites_existing_binding() {
        let (_dir, repo, commit) = init_repo_with_commit();
        let store = NotesStore::new(&repo);

        store
            .put(&commit, "url1", "$/a", ChangesetId::new(1).unwrap())
            .unwrap();
        store
            .put(&commit, "url2", "$/b", ChangesetId::new(2).unwrap())
            .unwrap();

        let binding = store.get(&commit).unwrap().unwrap();
        assert_eq!(binding.changeset_id.get(), 2);
        assert_eq!(binding.tfs_url, "url2");
    }

    #[test]
    fn configure_remote_to_sync_is_idempotent() {
        let (_dir, repo, _commit) = init_repo_with_commit();
        repo.run_git(&["remote", "add", "origin", "https://example/repo.git"], &[])
            .unwrap();

        let store = NotesStore::new(&repo);
        store.configure_remote_to_sync("origin").unwrap();
        store.configure_remote_to_sync("origin").unwrap();

        let fetch_specs = repo.config_get_all("remote.origin.fetch").unwrap();
        let matching = fetch_specs
            .iter()
            .filter(|s| s.contains("tfvc-sync"))
            .count();
        assert_eq!(matching, 1);
    }
}
