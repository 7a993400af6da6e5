use std::fmt;

/// Default prefix for cache store names.
pub const DEFAULT_CACHE_PREFIX: &str = "shellcache";

/// Key under which the most recent successful navigation response is kept
/// in the runtime store.
pub const SHELL_KEY: &str = "/";

/// One versioned pairing of a static store and a runtime store.
///
/// Both names derive from the same version token, so bumping the version
/// invalidates both at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheGeneration {
    prefix: String,
    version: String,
}

impl CacheGeneration {
    pub fn new(version: impl Into<String>) -> Self {
        Self::with_prefix(DEFAULT_CACHE_PREFIX, version)
    }

    pub fn with_prefix(prefix: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            version: version.into(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn static_name(&self) -> String {
        format!("{}-static-{}", self.prefix, self.version)
    }

    pub fn runtime_name(&self) -> String {
        format!("{}-runtime-{}", self.prefix, self.version)
    }

    /// True for exactly this generation's static and runtime names.
    pub fn owns(&self, cache_name: &str) -> bool {
        cache_name == self.static_name() || cache_name == self.runtime_name()
    }
}

impl fmt::Display for CacheGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.prefix, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_derive_from_version() {
        let generation = CacheGeneration::new("v7");
        assert_eq!(generation.static_name(), "shellcache-static-v7");
        assert_eq!(generation.runtime_name(), "shellcache-runtime-v7");
    }

    #[test]
    fn test_owns_only_current_names() {
        let generation = CacheGeneration::with_prefix("attendance", "2024.3");
        assert!(generation.owns("attendance-static-2024.3"));
        assert!(generation.owns("attendance-runtime-2024.3"));
        assert!(!generation.owns("attendance-static-2024.2"));
        assert!(!generation.owns("attendance-runtime-2024.3-old"));
        assert!(!generation.owns("other-static-2024.3"));
    }

    #[test]
    fn test_bumping_version_changes_both_names() {
        let old = CacheGeneration::new("1");
        let new = CacheGeneration::new("2");
        assert_ne!(old.static_name(), new.static_name());
        assert_ne!(old.runtime_name(), new.runtime_name());
        assert!(!new.owns(&old.static_name()));
        assert!(!new.owns(&old.runtime_name()));
    }
}
