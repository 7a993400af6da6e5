//! Request classification.
//!
//! Strategy selection is a pure function of the request's method, mode and
//! URL. No headers or body are inspected.

use std::fmt;

use url::Url;

use crate::request::{Method, Origin, Request, RequestMode};

/// Directories whose contents are served stale-while-revalidate.
const STATIC_DIRS: &[&str] = &[
    "/css/",
    "/js/",
    "/fonts/",
    "/icons/",
    "/images/",
    "/lib/",
    "/templates/",
];

/// File extensions treated as static assets wherever they live.
const STATIC_EXTENSIONS: &[&str] = &[
    "css",
    "js",
    "mjs",
    "json",
    "png",
    "jpg",
    "jpeg",
    "gif",
    "svg",
    "ico",
    "webp",
    "woff",
    "woff2",
    "ttf",
    "otf",
    "eot",
    "html",
    "webmanifest",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Not intercepted: other methods and cross-origin requests
    Bypass,
    Navigation,
    StaticAsset,
    Passthrough,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Bypass => write!(f, "bypass"),
            Route::Navigation => write!(f, "navigation"),
            Route::StaticAsset => write!(f, "static"),
            Route::Passthrough => write!(f, "passthrough"),
        }
    }
}

pub fn classify(request: &Request, origin: &Origin) -> Route {
    if request.method != Method::Get || !origin.matches(&request.url) {
        return Route::Bypass;
    }
    if request.mode == RequestMode::Navigate {
        return Route::Navigation;
    }
    if is_static_path(request.url.path()) {
        return Route::StaticAsset;
    }
    Route::Passthrough
}

pub fn is_static_path(path: &str) -> bool {
    if STATIC_DIRS.iter().any(|dir| path.starts_with(dir)) {
        return true;
    }
    let file = path.rsplit('/').next().unwrap_or_default();
    match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => STATIC_EXTENSIONS
            .iter()
            .any(|known| known.eq_ignore_ascii_case(ext)),
        _ => false,
    }
}

/// Static store key: the path alone. Static assets are content-stable per
/// path, so the query string is ignored.
pub fn static_key(url: &Url) -> String {
    url.path().to_string()
}

/// Runtime store key: the full URL without its fragment.
pub fn request_key(request: &Request) -> String {
    let mut url = request.url.clone();
    url.set_fragment(None);
    url.to_string()
}
