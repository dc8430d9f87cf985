//! Cross-process mutual exclusion over a named workspace, with
//! staleness detection.

use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::types::{LockRecord, SyncDirection};

pub const DEFAULT_MAX_LOCK_AGE_SECS: u64 = 7200;
pub const MAX_TIMEOUT_SECS: u64 = 7200;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireResult {
    Acquired,
    TimedOut,
}

/// Caller-supplied context used to populate a new `LockRecord`.
pub struct LockInfo {
    pub acquired_by: Option<String>,
    pub pipeline_id: String,
    pub build_number: String,
    pub direction: SyncDirection,
}

impl LockInfo {
    pub fn new(direction: SyncDirection) -> Self {
        LockInfo {
            acquired_by: None,
            pipeline_id: String::new(),
            build_number: String::new(),
            direction,
        }
    }
}

/// Owns `LockRecord` files under a directory (typically the workspace
/// root). Exclusively responsible for lock file lifecycle — no other
/// component touches these files.
pub struct LockCoordinator {
    dir: PathBuf,
}

impl LockCoordinator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        LockCoordinator { dir: dir.into() }
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.lock"))
    }

    /// Validates `timeout <= max_lock_age`: waiting longer than the
    /// staleness threshold would permit is never useful, since the lock
    /// would be evicted as stale before the wait could succeed on its
    /// own terms.
    pub fn validate_bounds(timeout: Duration, max_lock_age: Duration) -> Result<()> {
        if timeout.as_secs() > MAX_TIMEOUT_SECS {
            anyhow::bail!("lock-timeout must not exceed {MAX_TIMEOUT_SECS}s");
        }
        if timeout > max_lock_age {
            anyhow::bail!(
                "lock-timeout ({}s) must not exceed max-lock-age ({}s)",
                timeout.as_secs(),
                max_lock_age.as_secs()
            );
        }
        Ok(())
    }

    pub fn try_acquire(
        &self,
        name: &str,
        timeout: Duration,
        max_lock_age: Duration,
        info: LockInfo,
    ) -> Result<AcquireResult> {
        Self::validate_bounds(timeout, max_lock_age)?;
        fs::create_dir_all(&self.dir).context("lock_storage_unavailable")?;

        let path = self.lock_path(name);
        let record = LockRecord {
            workspace_name: name.to_string(),
            process_id: std::process::id(),
            hostname: hostname(),
            acquired_at: Utc::now(),
            acquired_by: info.acquired_by.unwrap_or_else(current_user),
            pipeline_id: info.pipeline_id,
            build_number: info.build_number,
            direction: info.direction,
        };

        let deadline = Instant::now() + timeout;
        loop {
            match self.create_exclusive(&path, &record) {
                Ok(()) => return Ok(AcquireResult::Acquired),
                Err(_) => {
                    if self.evict_if_stale(name, max_lock_age)? {
                        continue; // retry immediately after eviction
                    }
                    if Instant::now() >= deadline {
                        return Ok(AcquireResult::TimedOut);
                    }
                    thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
                }
            }
        }
    }

    fn create_exclusive(&self, path: &Path, record: &LockRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(serialize(record).as_bytes())?;
        Ok(())
    }

    pub fn release(&self, name: &str) -> Result<()> {
        let path = self.lock_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn force_unlock(&self, name: &str) -> Result<()> {
        self.release(name)
    }

    pub fn get_info(&self, name: &str) -> Result<Option<LockRecord>> {
        let path = self.lock_path(name);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(deserialize(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_stale(&self, name: &str, max_age: Duration) -> Result<bool> {
        match self.get_info(name)? {
            Some(record) => {
                let age = Utc::now().signed_duration_since(record.acquired_at);
                Ok(age.to_std().unwrap_or(Duration::ZERO) > max_age)
            }
            // an unreadable/absent record still blocks acquisition (the file
            // exists but can't be parsed) — only evict_if_stale decides that
            None => Ok(false),
        }
    }

    /// Evicts the record at `name` if it is stale (by mtime if the
    /// payload can't be parsed, else by `acquired_at`). Returns whether
    /// an eviction happened.
    fn evict_if_stale(&self, name: &str, max_age: Duration) -> Result<bool> {
        let path = self.lock_path(name);
        let acquired_at = match fs::read_to_string(&path) {
            Ok(contents) => match deserialize(&contents) {
                Some(record) => record.acquired_at,
                None => {
                    // unreadable record: fall back to filesystem mtime
                    let meta = fs::metadata(&path)?;
                    let modified = meta.modified()?;
                    DateTime::<Utc>::from(modified)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let age = Utc::now().signed_duration_since(acquired_at);
        if age.to_std().unwrap_or(Duration::ZERO) > max_age {
            let _ = fs::remove_file(&path);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn serialize(record: &LockRecord) -> String {
    let direction = match record.direction {
        SyncDirection::TfvcToGit => "tfvc-to-git",
        SyncDirection::GitToTfvc => "git-to-tfvc",
        SyncDirection::Bidirectional => "bidirectional",
    };
    format!(
        "workspace_name={}\nprocess_id={}\nhostname={}\nacquired_at={}\nacquired_by={}\npipeline_id={}\nbuild_number={}\ndirection={}\n",
        record.workspace_name,
        record.process_id,
        record.hostname,
        record.acquired_at.to_rfc3339(),
        record.acquired_by,
        record.pipeline_id,
        record.build_number,
        direction,
    )
}

fn deserialize(contents: &str) -> Option<LockRecord> {
    let mut fields = std::collections::HashMap::new();
    for line in contents.lines() {
        if let Some((k, v)) = line.split_once('=') {
            fields.insert(k.trim(), v.trim().to_string());
        }
    }

    let direction = match fields.get("direction").map(|s| s.as_str()) {
        Some("tfvc-to-git") => SyncDirection::TfvcToGit,
        Some("git-to-tfvc") => SyncDirection::GitToTfvc,
        _ => SyncDirection::Bidirectional,
    };

    Some(LockRecord {
        workspace_name: fields.get("workspace_name")?.clone(),
        process_id: fields.get("process_id")?.parse().ok()?,
        hostname: fields.get("hostname")?.clone(),
        acquired_at: DateTime::parse_from_rfc3339(fields.get("acquired_at")?)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))?,
        acquired_by: fields.get("acquired_by")?.clone(),
        pipeline_id: fields.get("pipeline_id").cloned().unwrap_or_default(),
        build_number: fields.get("build_number").cloned().unwrap_or_default(),
        direction,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn info() -> LockInfo {
        LockInfo::new(SyncDirection::Bidirectional)
    }

    #[test]
    fn acquire_then_release_allows_reacquire() {
        let dir = tempdir().unwrap();
        let coord = LockCoordinator::new(dir.path());

        let r1 = coord
            .try_acquire("ws", Duration::from_secs(1), Duration::from_secs(7200), info())
            .unwrap();
        assert_eq!(r1, AcquireResult::Acquired);

        coord.release("ws").unwrap();

        let r2 = coord
            .try_acquire("ws", Duration::from_secs(1), Duration::from_secs(7200), info())
            .unwrap();
        assert_eq!(r2, AcquireResult::Acquired);
    }

    #[test]
    fn contended_acquire_times_out() {
        let dir = tempdir().unwrap();
        let coord = LockCoordinator::new(dir.path());

        coord
            .try_acquire("ws", Duration::from_secs(1), Duration::from_secs(7200), info())
            .unwrap();

        let start = Instant::now();
        let result = coord
            .try_acquire("ws", Duration::from_millis(500), Duration::from_secs(7200), info())
            .unwrap();
        assert_eq!(result, AcquireResult::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[test]
    fn stale_lock_is_evicted() {
        let dir = tempdir().unwrap();
        let coord = LockCoordinator::new(dir.path());
        let path = coord.lock_path("ws");

        let stale_record = LockRecord {
            workspace_name: "ws".to_string(),
            process_id: 1,
            hostname: "host".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(3),
            acquired_by: "someone".to_string(),
            pipeline_id: String::new(),
            build_number: String::new(),
            direction: SyncDirection::Bidirectional,
        };
        fs::write(&path, serialize(&stale_record)).unwrap();

        assert!(coord.is_stale("ws", Duration::from_secs(7200)).unwrap());

        let result = coord
            .try_acquire("ws", Duration::from_secs(5), Duration::from_secs(7200), info())
            .unwrap();
        assert_eq!(result, AcquireResult::Acquired);
    }

    #[test]
    fn timeout_exceeding_max_age_is_rejected() {
        let dir = tempdir().unwrap();
        let coord = LockCoordinator::new(dir.path());
        let result = coord.try_acquire(
            "ws",
            Duration::from_secs(9000),
            Duration::from_secs(7200),
            info(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn get_info_round_trips() {
        let dir = tempdir().unwrap();
        let coord = LockCoordinator::new(dir.path());
        coord
            .try_acquire("ws", Duration::from_secs(1), Duration::from_secs(7200), info())
            .unwrap();

        let record = coord.get_info("ws").unwrap().unwrap();
        assert_eq!(record.workspace_name, "ws");
        assert_eq!(record.direction, SyncDirection::Bidirectional);
    }

    #[test]
    fn get_info_is_none_when_absent() {
        let dir = tempdir().unwrap();
        let coord = LockCoordinator::new(dir.path());
        assert!(coord.get_info("nope").unwrap().is_none());
    }
}
