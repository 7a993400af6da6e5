//! Shellcache core - offline-capable asset caching for a single-origin web app.
//!
//! This crate contains the caching engine shared by the `shellcache` binary:
//! - Cache generations and the precache manifest
//! - Request classification and the per-route fetch strategies
//! - Cache storage backends (in-memory and on-disk)
//! - The install/activate lifecycle and the registration that drives it

pub mod classify;
pub mod control;
pub mod error;
pub mod generation;
pub mod lifecycle;
pub mod manifest;
pub mod network;
pub mod registration;
pub mod request;
pub mod router;
pub mod store;

#[cfg(test)]
mod testing;

pub use classify::{classify, Route};
pub use control::ControlMessage;
pub use error::{FetchError, HostError, LifecycleError, StoreError};
pub use generation::{CacheGeneration, DEFAULT_CACHE_PREFIX, SHELL_KEY};
pub use lifecycle::{
    ActivateReport, ClientId, InstallReport, LocalHost, Worker, WorkerEnv, WorkerHost, WorkerState,
};
pub use manifest::PrecacheManifest;
pub use network::{Fetcher, HttpFetcher, OfflineFetcher};
pub use registration::{InstallOutcome, Registration, RegistrationRecord};
pub use request::{CacheMode, Method, Origin, Request, RequestMode, Response, ResponseKind};
pub use router::{FetchEvent, Preload, Router};
pub use store::{CacheStorage, CachedEntry, DiskStorage, MemoryStorage};
