//! Two configuration sources feed this crate: process-wide policy
//! defaults (lock timeout, max lock age) read through a layered TOML
//! stack, and per-remote descriptors stored directly in git config
//! under `tfs-remote.<id>.*` — the latter travels with the repository
//! the way a normal git remote does.

use std::time::Duration;

use anyhow::{Context as _, Result, anyhow};
use config::{Config, File, FileFormat};

use crate::git::GitRepo;
use crate::types::RemoteDescriptor;

pub trait PolicySettings {
    fn lock_timeout(&self) -> Duration;
    fn max_lock_age(&self) -> Duration;
    fn auto_rebase(&self) -> bool;
    fn ignore_merge(&self) -> bool;
}

impl PolicySettings for Config {
    fn lock_timeout(&self) -> Duration {
        self.get_string("tfs-sync.lock-timeout")
            .ok()
            .and_then(|s| humantime::parse_duration(&s).ok())
            .unwrap_or(Duration::from_secs(600))
    }

    fn max_lock_age(&self) -> Duration {
        self.get_string("tfs-sync.max-lock-age")
            .ok()
            .and_then(|s| humantime::parse_duration(&s).ok())
            .unwrap_or(Duration::from_secs(7200))
    }

    fn auto_rebase(&self) -> bool {
        self.get_bool("tfs-sync.auto-rebase").unwrap_or(false)
    }

    fn ignore_merge(&self) -> bool {
        self.get_bool("tfs-sync.ignore-merge").unwrap_or(false)
    }
}

/// Builds the layered policy config: built-in defaults, then an
/// optional `$XDG_CONFIG_HOME/tfs-sync/config.toml` (or
/// `~/.config/tfs-sync/config.toml` when unset), then an optional
/// `<repo_root>/.tfs-sync.toml`. Later layers override earlier ones.
pub fn read_config(repo_root: Option<&std::path::Path>) -> Result<Config> {
    let mut builder = Config::builder().add_source(File::from_str(
        include_str!("../config/defaults.toml"),
        FileFormat::Toml,
    ));

    if let Some(user_config) = user_config_path() {
        builder = builder.add_source(File::from(user_config).required(false));
    }

    if let Some(root) = repo_root {
        builder = builder.add_source(File::from(root.join(".tfs-sync.toml")).required(false));
    }

    builder.build().context("failed to assemble policy config")
}

fn user_config_path() -> Option<std::path::PathBuf> {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(std::path::PathBuf::from)
        .ok()
        .or_else(|| std::env::var("HOME").ok().map(|h| std::path::PathBuf::from(h).join(".config")))?;
    Some(base.join("tfs-sync").join("config.toml"))
}

/// Reads and writes `RemoteDescriptor`s to and from git config, under
/// `tfs-remote.<id>.*` keys.
pub struct RemoteConfigStore<'repo> {
    repo: &'repo GitRepo,
}

impl<'repo> RemoteConfigStore<'repo> {
    pub fn new(repo: &'repo GitRepo) -> Self {
        RemoteConfigStore { repo }
    }

    pub fn list_remote_ids(&self) -> Result<Vec<String>> {
        let keys = self.repo.config_keys_matching(r"^tfs-remote\..*\.url$")?;
        let mut ids: Vec<String> = keys
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix("tfs-remote.")
                    .and_then(|rest| rest.strip_suffix(".url"))
                    .map(|id| id.to_string())
            })
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    pub fn load(&self, id: &str) -> Result<RemoteDescriptor> {
        let prefix = format!("tfs-remote.{id}");
        let url = self
            .repo
            .config_get(&format!("{prefix}.url"))?
            .ok_or_else(|| anyhow!("no tfs-remote.{id}.url configured"))?;
        let path = self
            .repo
            .config_get(&format!("{prefix}.path"))?
            .ok_or_else(|| anyhow!("no tfs-remote.{id}.path configured"))?;

        let mut descriptor = RemoteDescriptor::new(id, url, path);
        descriptor.legacy_urls = self.repo.config_get_all(&format!("{prefix}.legacy-url"))?;
        descriptor.remote_ref = self
            .repo
            .config_get(&format!("{prefix}.ref"))?
            .unwrap_or(descriptor.remote_ref);
        descriptor.max_changeset_id = self
            .repo
            .config_get(&format!("{prefix}.max-changeset-id"))?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        descriptor.max_commit_hash = self
            .repo
            .config_get(&format!("{prefix}.max-commit-hash"))?
            .and_then(|v| crate::types::CommitHash::new(v).ok());

        Ok(descriptor)
    }

    pub fn load_all(&self) -> Result<Vec<RemoteDescriptor>> {
        self.list_remote_ids()?
            .iter()
            .map(|id| self.load(id))
            .collect()
    }

    pub fn save(&self, descriptor: &RemoteDescriptor) -> Result<()> {
        let prefix = format!("tfs-remote.{}", descriptor.id);
        self.repo.config_set(&format!("{prefix}.url"), &descriptor.tfs_url)?;
        self.repo
            .config_set(&format!("{prefix}.path"), &descriptor.tfs_repository_path)?;
        self.repo.config_set(&format!("{prefix}.ref"), &descriptor.remote_ref)?;
        self.repo.config_set(
            &format!("{prefix}.max-changeset-id"),
            &descriptor.max_changeset_id.to_string(),
        )?;
        if let Some(hash) = &descriptor.max_commit_hash {
            self.repo
                .config_set(&format!("{prefix}.max-commit-hash"), hash.as_str())?;
        }
        for legacy in &descriptor.legacy_urls {
            self.repo.config_add(&format!("{prefix}.legacy-url"), legacy)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::init_repo_with_commit;

    #[test]
    fn policy_settings_fall_back_to_defaults() {
        let config = Config::builder().build().unwrap();
        assert_eq!(config.lock_timeout(), Duration::from_secs(600));
        assert_eq!(config.max_lock_age(), Duration::from_secs(7200));
        assert!(!config.auto_rebase());
    }

    #[test]
    fn read_config_loads_bundled_defaults() {
        let config = read_config(None).unwrap();
        assert_eq!(config.max_lock_age(), Duration::from_secs(7200));
    }

    #[test]
    fn remote_config_store_round_trips() {
        let (_dir, repo, _commit) = init_repo_with_commit();
        let store = RemoteConfigStore::new(&repo);

        let mut descriptor = RemoteDescriptor::new("default", "https://tfs.example/tfs", "$/Proj/Main");
        descriptor.legacy_urls.push("https://old.example/tfs".to_string());
        descriptor.max_changeset_id = 42;

        store.save(&descriptor).unwrap();
        let loaded = store.load("default").unwrap();

        assert_eq!(loaded.tfs_url, descriptor.tfs_url);
        assert_eq!(loaded.tfs_repository_path, descriptor.tfs_repository_path);
        assert_eq!(loaded.legacy_urls, descriptor.legacy_urls);
        assert_eq!(loaded.max_changeset_id, 42);
    }

    #[test]
    fn list_remote_ids_finds_all_configured_remotes() {
        let (_dir, repo, _commit) = init_repo_with_commit();
        let store = RemoteConfigStore::new(&repo);
        store
            .save(&RemoteDescriptor::new("a", "https://a.example/tfs", "$/A"))
            .unwrap();
        store
            .save(&RemoteDescriptor::new("b", "https://b.example/tfs", "$/B"))
            .unwrap();

        let ids = store.list_remote_ids().unwrap();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
