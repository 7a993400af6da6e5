use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{ensure_cacheable, CacheStorage};
use crate::error::StoreError;
use crate::request::Response;

/// Application name used for the default cache directory
const APP_NAME: &str = "shellcache";

/// Subdirectory of the root holding the stores. Nothing outside it is
/// ever listed or deleted.
const STORES_DIR: &str = "stores";

/// Metadata file suffix; the body lives next to it
const META_SUFFIX: &str = "json";
const BODY_SUFFIX: &str = "body";

/// Age units in minutes, largest first
const AGE_UNITS: &[(i64, &str)] = &[(24 * 60, "d"), (60, "h")];

/// Metadata for one stored response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEntry {
    pub key: String,
    pub response: Response,
    pub cached_at: DateTime<Utc>,
    /// SHA-256 of the body file written with this metadata
    #[serde(default)]
    pub body_sha256: String,
}

impl CachedEntry {
    pub fn new(key: &str, response: &Response) -> Self {
        Self {
            key: key.to_string(),
            response: response.clone(),
            cached_at: Utc::now(),
            body_sha256: digest(&response.body),
        }
    }

    pub fn age(&self) -> Duration {
        Utc::now() - self.cached_at
    }

    /// Relative age for listings, rounded to the nearest hour or day once
    /// it passes those sizes.
    pub fn age_display(&self) -> String {
        let minutes = self.age().num_minutes();
        // Negative when the clock moved backwards
        if minutes < 1 {
            return "just now".to_string();
        }
        let (count, unit) = AGE_UNITS
            .iter()
            .find(|(size, _)| minutes >= *size)
            .map(|&(size, unit)| ((minutes + size / 2) / size, unit))
            .unwrap_or((minutes, "m"));
        format!("{}{} ago", count, unit)
    }
}

/// Cache storage backed by the filesystem.
///
/// Each store is a directory under `<root>/stores`. Each entry is a pair of
/// files named by the SHA-256 of its key: `<hash>.json` holds the key, status,
/// headers, timestamp and body digest, `<hash>.body` the raw bytes.
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    pub fn new(root: PathBuf) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root.join(STORES_DIR))?;
        Ok(Self { root })
    }

    /// Storage under the platform cache directory.
    pub fn open_default() -> Result<Self, StoreError> {
        Self::new(Self::default_root()?)
    }

    pub fn default_root() -> Result<PathBuf, StoreError> {
        let cache_dir = dirs::cache_dir()
            .or_else(|| dirs::home_dir().map(|p| p.join(".cache")))
            .ok_or_else(|| {
                StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine cache directory",
                ))
            })?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stores_dir(&self) -> PathBuf {
        self.root.join(STORES_DIR)
    }

    fn store_dir(&self, name: &str) -> Result<PathBuf, StoreError> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(self.stores_dir().join(name))
        } else {
            Err(StoreError::InvalidName(name.to_string()))
        }
    }

    fn entry_paths(&self, name: &str, key: &str) -> Result<(PathBuf, PathBuf), StoreError> {
        let dir = self.store_dir(name)?;
        let hash = digest(key.as_bytes());
        Ok((
            dir.join(format!("{}.{}", hash, META_SUFFIX)),
            dir.join(format!("{}.{}", hash, BODY_SUFFIX)),
        ))
    }

    /// Load the metadata of every entry in a store, sorted by key.
    pub fn load_entries(&self, name: &str) -> Result<Vec<CachedEntry>, StoreError> {
        let dir = self.store_dir(name)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for item in std::fs::read_dir(&dir)? {
            let path = item?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_SUFFIX) {
                continue;
            }
            match read_meta(&path) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    debug!(cache = name, path = %path.display(), error = %e, "Skipping unreadable cache entry");
                }
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn read_meta(path: &Path) -> Result<CachedEntry, StoreError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Write via a uniquely named temporary file in the same directory, so
/// readers never see a partial file and concurrent writers never share one.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl CacheStorage for DiskStorage {
    async fn open(&self, name: &str) -> Result<(), StoreError> {
        std::fs::create_dir_all(self.store_dir(name)?)?;
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.store_dir(name)?.is_dir())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.stores_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for item in std::fs::read_dir(&dir)? {
            let item = item?;
            if !item.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = item.file_name().to_str() {
                if self.store_dir(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let dir = self.store_dir(name)?;
        if !dir.is_dir() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&dir)?;
        Ok(true)
    }

    async fn match_entry(&self, name: &str, key: &str) -> Result<Option<Response>, StoreError> {
        let (meta_path, body_path) = self.entry_paths(name, key)?;
        if !meta_path.exists() {
            return Ok(None);
        }

        let entry = read_meta(&meta_path)?;
        if entry.key != key {
            // Hash collision, treat as a miss
            return Ok(None);
        }

        let body = match std::fs::read(&body_path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(cache = name, key = key, "Cache entry has no body, treating as miss");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if digest(&body) != entry.body_sha256 {
            // Body and metadata come from different writes
            debug!(cache = name, key = key, "Cache entry body does not match metadata, treating as miss");
            return Ok(None);
        }

        let mut response = entry.response;
        response.body = body;
        Ok(Some(response))
    }

    async fn put(&self, name: &str, key: &str, response: &Response) -> Result<(), StoreError> {
        ensure_cacheable(key, response)?;
        self.open(name).await?;

        let (meta_path, body_path) = self.entry_paths(name, key)?;
        let meta = serde_json::to_vec_pretty(&CachedEntry::new(key, response))?;

        // Body first: an entry only exists once its metadata is in place
        write_atomic(&body_path, &response.body)?;
        write_atomic(&meta_path, &meta)?;
        Ok(())
    }

    async fn entries(&self, name: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .load_entries(name)?
            .into_iter()
            .map(|entry| entry.key)
            .collect())
    }
}
