use crate::TileError;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    holder: String,
    acquired_at: u64,
}

impl LockRecord {
    fn is_stale(&self, now: u64, grace: u64) -> bool {
        now.saturating_sub(self.acquired_at) > grace
    }
}

pub fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn default_holder() -> String {
    format!(
        "{}-{}",
        std::env::var("HOSTNAME").unwrap_or_else(|_| "host".to_string()),
        std::process::id()
    )
}

/// Seconds since the file was last modified.
fn file_age(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(SystemTime::now().duration_since(modified).unwrap_or_default().as_secs())
}

/// Advisory lock file serializing retry construction for one scenario.
/// Released when dropped. A lock older than the grace period is taken over.
#[derive(Debug)]
pub struct ScenarioLock {
    path: PathBuf,
}

impl ScenarioLock {
    pub fn acquire(path: &Path, holder: &str, grace_secs: u64) -> Result<Self, TileError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let record = LockRecord {
                        holder: holder.to_string(),
                        acquired_at: now_seconds(),
                    };
                    file.write_all(&serde_json::to_vec(&record)?)?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let existing: Option<LockRecord> = fs::read(path)
                        .ok()
                        .and_then(|bytes| serde_json::from_slice(&bytes).ok());
                    let held = match &existing {
                        Some(record) => !record.is_stale(now_seconds(), grace_secs),
                        // Unreadable: the holder may not have written its record yet.
                        None => file_age(path).is_none_or(|age| age <= grace_secs),
                    };
                    if held {
                        return Err(TileError::RetryLocked {
                            path: path.to_path_buf(),
                            holder: existing.map(|r| r.holder).unwrap_or_else(|| "unknown".to_string()),
                        });
                    }
                    warn!(
                        path = %path.display(),
                        holder = existing.as_ref().map(|r| r.holder.as_str()).unwrap_or("unknown"),
                        "taking over stale retry lock"
                    );
                    fs::remove_file(path)?;
                }
                Err(e) => return Err(TileError::Io(e)),
            }
        }
        Err(TileError::RetryLocked {
            path: path.to_path_buf(),
            holder: "unknown".to_string(),
        })
    }
}

impl Drop for ScenarioLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("retry/.lock");
        let first = ScenarioLock::acquire(&path, "worker-a", 600).unwrap();
        match ScenarioLock::acquire(&path, "worker-b", 600) {
            Err(TileError::RetryLocked { holder, .. }) => assert_eq!(holder, "worker-a"),
            other => panic!("expected lock refusal, got {:?}", other),
        }
        drop(first);
        assert!(!path.exists());
        assert!(ScenarioLock::acquire(&path, "worker-b", 600).is_ok());
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        let old = LockRecord {
            holder: "crashed".to_string(),
            acquired_at: now_seconds() - 10_000,
        };
        fs::write(&path, serde_json::to_vec(&old).unwrap()).unwrap();
        let lock = ScenarioLock::acquire(&path, "fresh", 600).unwrap();
        let record: LockRecord = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(record.holder, "fresh");
        drop(lock);
    }

    #[test]
    fn half_written_lock_is_held_until_it_ages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        fs::write(&path, b"").unwrap();
        match ScenarioLock::acquire(&path, "late", 600) {
            Err(TileError::RetryLocked { holder, .. }) => assert_eq!(holder, "unknown"),
            other => panic!("expected lock refusal, got {:?}", other),
        }
        assert!(path.exists());

        let old = SystemTime::now() - std::time::Duration::from_secs(10_000);
        fs::File::options().write(true).open(&path).unwrap().set_modified(old).unwrap();
        let lock = ScenarioLock::acquire(&path, "late", 600).unwrap();
        let record: LockRecord = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(record.holder, "late");
        drop(lock);
    }
}
