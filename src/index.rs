//! Maintains an in-process `changeset_id -> commit_hash` map derived
//! from bindings, with lazy population and full-scan fallback.

use std::cell::RefCell;
use std::collections::HashMap;

use anyhow::Result;
use regex::Regex;
use std::sync::OnceLock;

use crate::git::GitRepo;
use crate::notes::NotesStore;
use crate::types::{ChangesetId, CommitHash};

fn legacy_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^git-tfs-id:\s*(?P<url>\S+?)\s*(?P<path>\$/\S*);C(?P<changeset>\d+)\s*$")
            .expect("legacy git-tfs-id regex is valid")
    })
}

/// Matches the *last* occurrence in the message. Legacy repositories
/// occasionally stack multiple `git-tfs-id:` trailers from repeated
/// rebases, and only the last one reflects the final check-in; this is
/// done explicitly via `.last()` on `captures_iter` rather than relying
/// on any particular regex-engine scan order.
fn parse_legacy_changeset(message: &str) -> Option<u64> {
    legacy_id_regex()
        .captures_iter(message)
        .last()
        .and_then(|caps| caps.name("changeset"))
        .and_then(|m| m.as_str().parse().ok())
}

struct CacheState {
    pairs: HashMap<ChangesetId, CommitHash>,
    /// Set once an unscoped search has exhausted the reachable history
    /// without a hit, so later misses short-circuit instead of
    /// re-walking the whole history every time.
    complete: bool,
}

pub struct ChangesetIndex<'repo> {
    repo: &'repo GitRepo,
    notes: NotesStore<'repo>,
    cache: RefCell<CacheState>,
}

impl<'repo> ChangesetIndex<'repo> {
    pub fn new(repo: &'repo GitRepo) -> Self {
        ChangesetIndex {
            repo,
            notes: NotesStore::new(repo),
            cache: RefCell::new(CacheState {
                pairs: HashMap::new(),
                complete: false,
            }),
        }
    }

    /// Cache-fill hook invoked by CheckinDriver immediately after it
    /// binds a commit — avoids a redundant scan for the common case of
    /// "the commit we just created".
    pub fn record_pair(&self, changeset_id: ChangesetId, commit_hash: CommitHash) {
        self.cache.borrow_mut().pairs.insert(changeset_id, commit_hash);
    }

    pub fn get_pairs(&self) -> HashMap<ChangesetId, CommitHash> {
        self.cache.borrow().pairs.clone()
    }

    pub fn find_commit_by_changeset(
        &self,
        changeset_id: ChangesetId,
        scope_ref: Option<&str>,
    ) -> Result<Option<CommitHash>> {
        if let Some(hit) = self.cache.borrow().pairs.get(&changeset_id) {
            return Ok(Some(hit.clone()));
        }

        if scope_ref.is_none() && self.cache.borrow().complete {
            return Ok(None);
        }

        let refs = self.reachable_refs(scope_ref)?;
        if refs.is_empty() {
            return Ok(None);
        }
        let ref_strs: Vec<&str> = refs.iter().map(|s| s.as_str()).collect();
        let commits = self.repo.rev_list_date_order(&ref_strs)?;

        let mut found = None;
        for commit in commits {
            let hash = match CommitHash::new(&commit) {
                Ok(h) => h,
                Err(_) => continue,
            };

            let candidate = self.binding_changeset(&hash)?;
            let Some(candidate_id) = candidate else {
                continue;
            };

            if self.cache.borrow().pairs.contains_key(&candidate_id) {
                log::warn!(
                    "changeset {candidate_id} is bound to more than one commit; keeping the first enumerated"
                );
            } else {
                self.cache.borrow_mut().pairs.insert(candidate_id, hash.clone());
            }

            if candidate_id == changeset_id && found.is_none() {
                found = Some(hash);
                if scope_ref.is_some() {
                    break;
                }
                // keep scanning (unscoped) so the cache fills further,
                // matching "populate the cache as you go"
            }
        }

        if found.is_none() && scope_ref.is_none() {
            self.cache.borrow_mut().complete = true;
        }

        Ok(found)
    }

    /// (a) NotesStore.Get, else (b) legacy message regex.
    fn binding_changeset(&self, commit: &CommitHash) -> Result<Option<ChangesetId>> {
        if let Some(binding) = self.notes.get(commit)? {
            return Ok(Some(binding.changeset_id));
        }
        let message = self.repo.message(commit.as_str())?;
        Ok(parse_legacy_changeset(&message).and_then(|n| ChangesetId::new(n).ok()))
    }

    fn reachable_refs(&self, scope_ref: Option<&str>) -> Result<Vec<String>> {
        match scope_ref {
            Some(scope) => {
                let scope = scope.to_string();
                self.repo.refs_matching(move |name| name.ends_with(&scope))
            }
            None => self
                .repo
                .refs_matching(|name| name.starts_with("refs/remotes/")),
        }
    }
}
