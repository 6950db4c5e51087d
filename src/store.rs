//! Object-store seam: the bucket is a flat key space of files.

use crate::backoff::{with_backoff, RetryPolicy};
use crate::{StoreErrorKind, TileError};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
}

pub trait ObjectStore: Send + Sync {
    /// Human-readable location, for reports.
    fn describe(&self) -> String;

    /// Every object whose key starts with `prefix`, sorted by key.
    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, TileError>;

    fn get(&self, key: &str) -> Result<Vec<u8>, TileError>;

    fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), TileError>;

    fn delete(&self, key: &str) -> Result<(), TileError>;
}

/// Downloads one key to `dest`, retrying transient failures.
pub fn download(store: &dyn ObjectStore, policy: &RetryPolicy, key: &str, dest: &Path) -> Result<(), TileError> {
    let bytes = with_backoff(policy, "get", || store.get(key))?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(dest, bytes)?;
    Ok(())
}

pub fn upload(store: &dyn ObjectStore, policy: &RetryPolicy, src: &Path, key: &str) -> Result<(), TileError> {
    let bytes = fs::read(src)?;
    with_backoff(policy, "put", || store.put(key, bytes.clone()))
}

pub fn join_key(prefix: &str, rest: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let rest = rest.trim_start_matches('/');
    if prefix.is_empty() {
        rest.to_string()
    } else if rest.is_empty() {
        prefix.to_string()
    } else {
        format!("{}/{}", prefix, rest)
    }
}

/// Recursive file listing in sorted order.
pub fn walk(path: &Path) -> Result<Vec<PathBuf>, TileError> {
    let mut files = Vec::new();
    let mut entries: Vec<_> = fs::read_dir(path)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let p = entry.path();
        if entry.file_type()?.is_dir() {
            files.extend(walk(&p)?);
        } else {
            files.push(p);
        }
    }
    Ok(files)
}

/// Relative path rendered as a `/`-separated key.
pub fn relative_key(base: &Path, file: &Path) -> Result<String, TileError> {
    let rel = file
        .strip_prefix(base)
        .map_err(|_| TileError::Other(format!("{} is not under {}", file.display(), base.display())))?;
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/"))
}

fn io_to_store(key: &str, e: std::io::Error) -> TileError {
    let kind = match e.kind() {
        std::io::ErrorKind::NotFound => StoreErrorKind::NotFound,
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            StoreErrorKind::Transient
        }
        _ => StoreErrorKind::Permanent,
    };
    TileError::store(kind, key, e.to_string())
}

/// Bucket mounted as a directory (gcsfuse, NFS), also used by tests.
#[derive(Debug, Clone)]
pub struct DirObjectStore {
    root: PathBuf,
}

impl DirObjectStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        key.split('/').filter(|s| !s.is_empty()).fold(self.root.clone(), |p, s| p.join(s))
    }
}

impl ObjectStore for DirObjectStore {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, TileError> {
        // Walk from the deepest directory the prefix names, then filter.
        let dir_part = match prefix.rfind('/') {
            Some(i) => &prefix[..i],
            None => "",
        };
        let start = self.path_for(dir_part);
        if !start.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for file in walk(&start).map_err(|e| match e {
            TileError::Io(io) => io_to_store(prefix, io),
            other => other,
        })? {
            let key = relative_key(&self.root, &file)?;
            if key.starts_with(prefix) {
                let size = fs::metadata(&file).map_err(|e| io_to_store(&key, e))?.len();
                out.push(ObjectMeta { key, size });
            }
        }
        out.sort();
        Ok(out)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, TileError> {
        fs::read(self.path_for(key)).map_err(|e| io_to_store(key, e))
    }

    fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), TileError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_to_store(key, e))?;
        }
        fs::write(path, bytes).map_err(|e| io_to_store(key, e))
    }

    fn delete(&self, key: &str) -> Result<(), TileError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_to_store(key, e)),
        }
    }
}

/// `s3://` and `gs://` locations need the `s3` feature; anything else is a directory.
pub fn open_store(location: &str) -> Result<Box<dyn ObjectStore>, TileError> {
    if location.starts_with("s3://") || location.starts_with("gs://") {
        open_remote(location)
    } else {
        Ok(Box::new(DirObjectStore::new(Path::new(location))))
    }
}

#[cfg(feature = "s3")]
fn open_remote(location: &str) -> Result<Box<dyn ObjectStore>, TileError> {
    let config = crate::s3_store::S3StoreConfig::from_location(location)?;
    Ok(Box::new(crate::s3_store::S3Store::new(config)?))
}

#[cfg(not(feature = "s3"))]
fn open_remote(location: &str) -> Result<Box<dyn ObjectStore>, TileError> {
    Err(TileError::Config(format!(
        "{} needs bucket support; rebuild with --features s3 or use a mounted path",
        location
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_store_lists_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirObjectStore::new(dir.path());
        store.put("H10_V15/ssp1_split/all_merged/GPP.grid", vec![1, 2, 3]).unwrap();
        store.put("H10_V15/ssp1_split/batch_0/output/GPP.grid", vec![1]).unwrap();
        store.put("H10_V15/ssp1/run-mask.grid", vec![1]).unwrap();

        let listed = store.list("H10_V15/ssp1_split/").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].key, "H10_V15/ssp1_split/all_merged/GPP.grid");
        assert_eq!(listed[0].size, 3);

        let partial = store.list("H10_V15/ssp1").unwrap();
        assert_eq!(partial.len(), 3);
        assert!(store.list("H99_V99/").unwrap().is_empty());
    }

    #[test]
    fn dir_store_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirObjectStore::new(dir.path());
        assert!(store.get("nope/key").unwrap_err().is_not_found());
        store.delete("nope/key").unwrap();
    }

    #[test]
    fn join_key_normalizes_slashes() {
        assert_eq!(join_key("recent2/", "/H10_V15"), "recent2/H10_V15");
        assert_eq!(join_key("", "H10_V15"), "H10_V15");
        assert_eq!(join_key("a", ""), "a");
    }
}
