//! Core data model: ChangesetBinding, RemoteDescriptor, LockRecord.
//!
//! `CommitHash` and `ChangesetId` are newtypes so the "opaque 40-hex
//! identifier" / "positive integer" invariants are enforced once, at
//! construction, rather than re-checked at every call site.

use std::fmt;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitHash(String);

impl CommitHash {
    pub fn new(hash: impl Into<String>) -> Result<Self> {
        let hash = hash.into();
        if hash.len() == 40 && hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(CommitHash(hash.to_lowercase()))
        } else {
            Err(anyhow!("'{hash}' is not a 40-hex-digit commit hash"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CommitHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangesetId(u64);

impl ChangesetId {
    pub fn new(id: u64) -> Result<Self> {
        if id == 0 {
            Err(anyhow!("changeset id must be a positive integer"))
        } else {
            Ok(ChangesetId(id))
        }
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChangesetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable association between a local commit hash and a server
/// changeset id, stored out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetBinding {
    pub changeset_id: ChangesetId,
    pub tfs_url: String,
    pub tfs_repository_path: String,
    pub commit_hash: CommitHash,
    pub bound_at: DateTime<Utc>,
}

/// Configured association of a server URL, server path, and local
/// tracking ref.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDescriptor {
    pub id: String,
    pub tfs_url: String,
    pub tfs_repository_path: String,
    pub legacy_urls: Vec<String>,
    pub remote_ref: String,
    pub max_changeset_id: u64,
    pub max_commit_hash: Option<CommitHash>,
}

impl RemoteDescriptor {
    pub fn new(id: impl Into<String>, tfs_url: impl Into<String>, tfs_path: impl Into<String>) -> Self {
        let id = id.into();
        RemoteDescriptor {
            remote_ref: format!("refs/remotes/tfs/{id}"),
            id,
            tfs_url: tfs_url.into(),
            tfs_repository_path: tfs_path.into(),
            legacy_urls: Vec::new(),
            max_changeset_id: 0,
            max_commit_hash: None,
        }
    }

    /// A synthetic, unresolved placeholder — RemoteResolver's last-resort
    /// fallback when no configured remote matches.
    pub fn derived_placeholder(tfs_url: &str, tfs_path: &str) -> Self {
        RemoteDescriptor {
            id: "<unresolved>".to_string(),
            tfs_url: tfs_url.to_string(),
            tfs_repository_path: tfs_path.to_string(),
            legacy_urls: Vec::new(),
            remote_ref: String::new(),
            max_changeset_id: 0,
            max_commit_hash: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.id != "<unresolved>"
    }

    pub fn advance_watermark(&mut self, commit_hash: CommitHash, changeset_id: ChangesetId) {
        self.max_changeset_id = changeset_id.get();
        self.max_commit_hash = Some(commit_hash);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncDirection {
    TfvcToGit,
    GitToTfvc,
    Bidirectional,
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncDirection::TfvcToGit => "tfvc-to-git",
            SyncDirection::GitToTfvc => "git-to-tfvc",
            SyncDirection::Bidirectional => "bidirectional",
        };
        write!(f, "{s}")
    }
}

/// The contents of a workspace lock file. At most one exists per
/// workspace name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub workspace_name: String,
    pub process_id: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    pub acquired_by: String,
    pub pipeline_id: String,
    pub build_number: String,
    pub direction: SyncDirection,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_hash_rejects_non_hex() {
        assert!(CommitHash::new("not-a-hash").is_err());
        assert!(CommitHash::new("a".repeat(40)).is_ok());
    }

    #[test]
    fn changeset_id_rejects_zero() {
        assert!(ChangesetId::new(0).is_err());
        assert!(ChangesetId::new(1).is_ok());
    }

    #[test]
    fn remote_descriptor_round_trips_through_json() {
        let mut descriptor = RemoteDescriptor::new("default", "https://tfs.example/tfs", "$/Proj/Main");
        descriptor.advance_watermark(CommitHash::new("b".repeat(40)).unwrap(), ChangesetId::new(9).unwrap());

        let json = serde_json::to_string(&descriptor).unwrap();
        let restored: RemoteDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, descriptor);
    }
}
