//! Registration record persisted between runs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use shellcache_core::RegistrationRecord;

const RECORD_FILE: &str = "registration.json";

pub struct RecordFile {
    path: PathBuf,
}

impl RecordFile {
    /// The record kept alongside the cache stores in `cache_dir`.
    pub fn in_dir(cache_dir: &Path) -> Self {
        Self {
            path: cache_dir.join(RECORD_FILE),
        }
    }

    /// Missing file means nothing was ever installed.
    pub fn load(&self) -> Result<RegistrationRecord> {
        if !self.path.exists() {
            return Ok(RegistrationRecord::default());
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Corrupt registration record {}", self.path.display()))
    }

    pub fn save(&self, record: &RegistrationRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(record)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "Saved registration record");
        Ok(())
    }
}
