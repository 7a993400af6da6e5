//! The fixed list of assets fetched in bulk at install time.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::FetchError;
use crate::request::Request;

/// Assets required for full offline operation of the current release.
const RELEASE_MANIFEST: &[&str] = &[
    "/",
    "/index.html",
    "/manifest.webmanifest",
    // Styles
    "/css/app.css",
    "/css/print.css",
    // Scripts
    "/js/app.js",
    "/js/db.js",
    "/js/roster.js",
    "/js/attendance.js",
    "/js/export.js",
    "/js/qr.js",
    // Bundled third-party libraries
    "/lib/idb-keyval.js",
    "/lib/html5-qrcode.min.js",
    "/lib/qrcode.min.js",
    "/lib/xlsx.full.min.js",
    // Fonts
    "/fonts/inter-regular.woff2",
    "/fonts/inter-bold.woff2",
    // Icons
    "/icons/icon-192.png",
    "/icons/icon-512.png",
    "/icons/favicon.ico",
    // Templates
    "/templates/roster-row.html",
    "/templates/export-sheet.html",
];

/// Ordered, de-duplicated list of origin-relative asset paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct PrecacheManifest {
    entries: Vec<String>,
}

impl PrecacheManifest {
    /// Build a manifest, keeping first occurrences in order.
    pub fn new<I, S>(entries: I) -> Result<Self, FetchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut kept: Vec<String> = Vec::new();
        for entry in entries {
            let entry = entry.into();
            if !entry.starts_with('/') || entry.starts_with("//") {
                return Err(FetchError::InvalidRequest(format!(
                    "manifest entry must be origin-relative: {}",
                    entry
                )));
            }
            if !kept.contains(&entry) {
                kept.push(entry);
            }
        }
        Ok(Self { entries: kept })
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Absolute URLs for every entry, in manifest order.
    pub fn resolve(&self, origin: &Url) -> Result<Vec<Url>, FetchError> {
        self.entries
            .iter()
            .map(|path| Request::resolve(origin, path))
            .collect()
    }
}

impl Default for PrecacheManifest {
    fn default() -> Self {
        Self {
            entries: RELEASE_MANIFEST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl TryFrom<Vec<String>> for PrecacheManifest {
    type Error = FetchError;

    fn try_from(entries: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(entries)
    }
}

impl From<PrecacheManifest> for Vec<String> {
    fn from(manifest: PrecacheManifest) -> Self {
        manifest.entries
    }
}
