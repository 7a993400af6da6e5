//! Lifecycle manager for one cache generation.
//!
//! A worker moves through `Parsed -> Installing -> Installed -> Activating ->
//! Activated`, and ends `Redundant` when a newer generation replaces it or its
//! install fails.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};
use url::Url;

use crate::classify::static_key;
use crate::control::ControlMessage;
use crate::error::{HostError, LifecycleError};
use crate::generation::CacheGeneration;
use crate::manifest::PrecacheManifest;
use crate::network::Fetcher;
use crate::request::{CacheMode, Origin, Request, Response};
use crate::router::Router;
use crate::store::CacheStorage;

/// Maximum concurrent precache fetches during install.
/// Keeps a release install from flooding a slow origin.
const MAX_CONCURRENT_PRECACHE: usize = 6;

// ============================================================================
// Worker State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Parsed,
    Installing,
    /// Installed and waiting for old instances to go away
    Installed,
    Activating,
    Activated,
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Parsed => write!(f, "parsed"),
            WorkerState::Installing => write!(f, "installing"),
            WorkerState::Installed => write!(f, "installed"),
            WorkerState::Activating => write!(f, "activating"),
            WorkerState::Activated => write!(f, "activated"),
            WorkerState::Redundant => write!(f, "redundant"),
        }
    }
}

// ============================================================================
// Host
// ============================================================================

/// Host runtime features the lifecycle relies on.
#[async_trait]
pub trait WorkerHost: Send + Sync {
    async fn enable_navigation_preload(&self) -> Result<(), HostError>;

    /// Make `generation` the controller of every open client. Returns how
    /// many clients changed controller.
    async fn claim_clients(&self, generation: &CacheGeneration) -> Result<usize, HostError>;
}

pub type ClientId = u64;

/// In-process host: tracks open application instances and which generation
/// controls each of them.
pub struct LocalHost {
    supports_preload: bool,
    preload_enabled: AtomicBool,
    next_id: AtomicU64,
    clients: Mutex<BTreeMap<ClientId, Option<String>>>,
}

impl LocalHost {
    pub fn new() -> Self {
        Self {
            supports_preload: true,
            preload_enabled: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            clients: Mutex::new(BTreeMap::new()),
        }
    }

    /// A host where enabling navigation preload fails.
    pub fn without_preload() -> Self {
        Self {
            supports_preload: false,
            ..Self::new()
        }
    }

    fn clients(&self) -> MutexGuard<'_, BTreeMap<ClientId, Option<String>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an open application instance, controlled by `version` if given.
    pub fn open_client(&self, version: Option<&str>) -> ClientId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.clients().insert(id, version.map(String::from));
        id
    }

    pub fn close_client(&self, id: ClientId) -> bool {
        self.clients().remove(&id).is_some()
    }

    /// Version of the generation controlling a client, if any.
    pub fn controller_of(&self, id: ClientId) -> Option<String> {
        self.clients().get(&id).cloned().flatten()
    }

    pub fn clients_controlled_by(&self, version: &str) -> usize {
        self.clients()
            .values()
            .filter(|controller| controller.as_deref() == Some(version))
            .count()
    }

    pub fn client_count(&self) -> usize {
        self.clients().len()
    }

    pub fn navigation_preload_enabled(&self) -> bool {
        self.preload_enabled.load(Ordering::SeqCst)
    }
}

impl Default for LocalHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerHost for LocalHost {
    async fn enable_navigation_preload(&self) -> Result<(), HostError> {
        if !self.supports_preload {
            return Err(HostError::Unsupported("navigation preload".to_string()));
        }
        self.preload_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn claim_clients(&self, generation: &CacheGeneration) -> Result<usize, HostError> {
        let mut claimed = 0;
        for controller in self.clients().values_mut() {
            if controller.as_deref() != Some(generation.version()) {
                *controller = Some(generation.version().to_string());
                claimed += 1;
            }
        }
        Ok(claimed)
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Services a worker runs against.
#[derive(Clone)]
pub struct WorkerEnv {
    /// Base URL of the application; also defines its origin
    pub origin: Url,
    pub storage: Arc<dyn CacheStorage>,
    pub fetcher: Arc<dyn Fetcher>,
    pub host: Arc<dyn WorkerHost>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub entries: usize,
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateReport {
    /// Stores removed because they belong to other generations
    pub deleted: Vec<String>,
    pub claimed: usize,
    pub navigation_preload: bool,
}

pub struct Worker {
    generation: CacheGeneration,
    manifest: PrecacheManifest,
    env: WorkerEnv,
    router: Router,
    state: Mutex<WorkerState>,
    skip_waiting: AtomicBool,
}

impl Worker {
    pub fn new(generation: CacheGeneration, manifest: PrecacheManifest, env: WorkerEnv) -> Self {
        Self::with_state(generation, manifest, env, WorkerState::Parsed)
    }

    /// A worker for a generation installed by an earlier run.
    pub fn restore(generation: CacheGeneration, env: WorkerEnv, state: WorkerState) -> Self {
        let manifest = PrecacheManifest::default();
        Self::with_state(generation, manifest, env, state)
    }

    fn with_state(
        generation: CacheGeneration,
        manifest: PrecacheManifest,
        env: WorkerEnv,
        state: WorkerState,
    ) -> Self {
        let router = Router::new(
            generation.clone(),
            Origin::of(&env.origin),
            Arc::clone(&env.storage),
            Arc::clone(&env.fetcher),
        );
        Self {
            generation,
            manifest,
            env,
            router,
            state: Mutex::new(state),
            skip_waiting: AtomicBool::new(false),
        }
    }

    pub fn generation(&self) -> &CacheGeneration {
        &self.generation
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, new_state: WorkerState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let from = *state;
        if from != new_state {
            debug!(generation = %self.generation, from = %from, to = %new_state, "Worker state change");
            *state = new_state;
        }
    }

    /// Move to `next` if the current state is one of `allowed`.
    fn transition(
        &self,
        allowed: &[WorkerState],
        expected: &'static str,
        next: WorkerState,
    ) -> Result<WorkerState, LifecycleError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = *state;
        if !allowed.contains(&previous) {
            return Err(LifecycleError::InvalidState {
                expected,
                actual: previous,
            });
        }
        *state = next;
        Ok(previous)
    }

    pub(crate) fn mark_redundant(&self) {
        self.set_state(WorkerState::Redundant);
    }

    // ===== Install =====

    /// Precache the manifest into this generation's static store.
    ///
    /// All-or-nothing: every manifest URL must fetch successfully before
    /// anything is written. On failure the worker becomes redundant and the
    /// previously active generation stays authoritative.
    pub async fn install(&self) -> Result<InstallReport, LifecycleError> {
        self.transition(&[WorkerState::Parsed], "parsed", WorkerState::Installing)?;
        info!(generation = %self.generation, entries = self.manifest.len(), "Installing");

        match self.precache().await {
            Ok(report) => {
                self.set_state(WorkerState::Installed);
                info!(generation = %self.generation, entries = report.entries, bytes = report.bytes, "Installed");
                Ok(report)
            }
            Err(e) => {
                warn!(generation = %self.generation, error = %e, "Install failed");
                self.set_state(WorkerState::Redundant);
                Err(e)
            }
        }
    }

    async fn precache(&self) -> Result<InstallReport, LifecycleError> {
        let urls = self
            .manifest
            .resolve(&self.env.origin)
            .map_err(|e| LifecycleError::Install {
                url: self.env.origin.to_string(),
                reason: e.to_string(),
            })?;

        let fetcher = &self.env.fetcher;
        let fetched: Vec<(String, Response)> = stream::iter(urls)
            .map(|url| async move {
                let request = Request::get(url).with_cache_mode(CacheMode::Reload);
                let response = fetcher
                    .fetch(&request)
                    .await
                    .map_err(|e| LifecycleError::Install {
                        url: request.url.to_string(),
                        reason: e.to_string(),
                    })?;
                if !response.ok() {
                    return Err(LifecycleError::bad_status(
                        request.url.as_str(),
                        response.status,
                        &response.body,
                    ));
                }
                Ok((static_key(&request.url), response))
            })
            .buffered(MAX_CONCURRENT_PRECACHE)
            .try_collect()
            .await?;

        let cache = self.generation.static_name();
        let existed = self.env.storage.has(&cache).await?;
        self.env.storage.open(&cache).await?;

        let mut bytes = 0;
        for (key, response) in &fetched {
            if let Err(e) = self.env.storage.put(&cache, key, response).await {
                if !existed {
                    if let Err(cleanup) = self.env.storage.delete(&cache).await {
                        warn!(cache = %cache, error = %cleanup, "Failed to remove partial cache");
                    }
                }
                return Err(e.into());
            }
            bytes += response.body.len();
        }

        Ok(InstallReport {
            entries: fetched.len(),
            bytes,
        })
    }

    // ===== Activate =====

    /// Delete every other generation's stores, enable navigation preload if
    /// possible, and take control of all open clients.
    ///
    /// Running it again on an activated worker deletes and claims nothing new.
    pub async fn activate(&self) -> Result<ActivateReport, LifecycleError> {
        let previous = self.transition(
            &[WorkerState::Installed, WorkerState::Activated],
            "installed",
            WorkerState::Activating,
        )?;

        match self.run_activation().await {
            Ok(report) => {
                self.set_state(WorkerState::Activated);
                info!(
                    generation = %self.generation,
                    deleted = report.deleted.len(),
                    claimed = report.claimed,
                    "Activated"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(generation = %self.generation, error = %e, "Activation failed");
                self.set_state(previous);
                Err(e)
            }
        }
    }

    async fn run_activation(&self) -> Result<ActivateReport, LifecycleError> {
        let mut deleted = Vec::new();
        for name in self.env.storage.keys().await? {
            if self.generation.owns(&name) {
                continue;
            }
            if self.env.storage.delete(&name).await? {
                info!(cache = %name, "Deleted stale cache");
                deleted.push(name);
            }
        }

        let navigation_preload = match self.env.host.enable_navigation_preload().await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Navigation preload not enabled");
                false
            }
        };

        let claimed = self.env.host.claim_clients(&self.generation).await?;

        Ok(ActivateReport {
            deleted,
            claimed,
            navigation_preload,
        })
    }

    // ===== Control =====

    /// Ask to activate as soon as installed, without waiting for old
    /// instances to close.
    pub fn skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Deliver a control message. Unrecognized messages are ignored.
    pub fn on_message(&self, bytes: &[u8]) -> Option<ControlMessage> {
        let message = ControlMessage::parse(bytes)?;
        match message {
            ControlMessage::SkipWaiting => {
                info!(generation = %self.generation, "Skip waiting requested");
                self.skip_waiting();
            }
        }
        Some(message)
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("generation", &self.generation)
            .field("state", &self.state())
            .field("skip_waiting", &self.skip_waiting_requested())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;
    use crate::testing::MockFetcher;

    const ORIGIN: &str = "https://app.test/";

    struct Fixture {
        storage: Arc<MemoryStorage>,
        fetcher: Arc<MockFetcher>,
        host: Arc<LocalHost>,
        env: WorkerEnv,
    }

    fn fixture_with_host(host: LocalHost) -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(MockFetcher::new());
        let host = Arc::new(host);
        let env = WorkerEnv {
            origin: Url::parse(ORIGIN).expect("url"),
            storage: storage.clone(),
            fetcher: fetcher.clone(),
            host: host.clone(),
        };
        Fixture {
            storage,
            fetcher,
            host,
            env,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_host(LocalHost::new())
    }

    fn manifest() -> PrecacheManifest {
        PrecacheManifest::new(["/", "/css/app.css", "/js/app.js?v=3", "/icons/icon-192.png"])
            .expect("manifest")
    }

    fn serve_manifest(fetcher: &MockFetcher) {
        fetcher.respond("https://app.test/", 200, "<html></html>");
        fetcher.respond("https://app.test/css/app.css", 200, "body{}");
        fetcher.respond("https://app.test/js/app.js?v=3", 200, "main()");
        fetcher.respond("https://app.test/icons/icon-192.png", 200, "png");
    }

    // -------------------------------------------------------------------------
    // Install
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_install_precaches_every_entry_by_path() {
        let f = fixture();
        serve_manifest(&f.fetcher);
        let worker = Worker::new(CacheGeneration::new("v2"), manifest(), f.env.clone());

        let report = worker.install().await.expect("install");
        assert_eq!(report.entries, 4);
        assert_eq!(worker.state(), WorkerState::Installed);

        let static_name = worker.generation().static_name();
        for key in ["/", "/css/app.css", "/js/app.js", "/icons/icon-192.png"] {
            let hit = f.storage.match_entry(&static_name, key).await.expect("match");
            assert!(hit.is_some(), "missing {}", key);
        }
    }

    #[tokio::test]
    async fn test_install_bypasses_http_caches() {
        let f = fixture();
        serve_manifest(&f.fetcher);
        let worker = Worker::new(CacheGeneration::new("v2"), manifest(), f.env.clone());
        worker.install().await.expect("install");

        let calls = f.fetcher.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls.iter().all(|r| r.cache_mode == CacheMode::Reload));
    }

    #[tokio::test]
    async fn test_install_fails_atomically_on_network_error() {
        let f = fixture();
        serve_manifest(&f.fetcher);
        f.fetcher.fail("https://app.test/js/app.js?v=3");

        let previous = CacheGeneration::new("v1");
        let old_asset = Response::new(200, "old css");
        f.storage
            .put(&previous.static_name(), "/css/app.css", &old_asset)
            .await
            .expect("put");

        let worker = Worker::new(CacheGeneration::new("v2"), manifest(), f.env.clone());
        let err = worker.install().await.expect_err("install should fail");
        match err {
            LifecycleError::Install { url, .. } => assert_eq!(url, "https://app.test/js/app.js?v=3"),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(worker.state(), WorkerState::Redundant);

        // No new store, previous generation untouched
        assert_eq!(f.storage.keys().await.expect("keys"), vec![previous.static_name()]);
        let hit = f
            .storage
            .match_entry(&previous.static_name(), "/css/app.css")
            .await
            .expect("match");
        assert_eq!(hit, Some(old_asset));
    }

    #[tokio::test]
    async fn test_install_fails_on_error_status() {
        let f = fixture();
        serve_manifest(&f.fetcher);
        f.fetcher.respond("https://app.test/icons/icon-192.png", 404, "gone");

        let worker = Worker::new(CacheGeneration::new("v2"), manifest(), f.env.clone());
        let err = worker.install().await.expect_err("install should fail");
        assert!(err.to_string().contains("status 404"));
        assert!(f.storage.keys().await.expect("keys").is_empty());
    }

    #[tokio::test]
    async fn test_install_twice_is_rejected() {
        let f = fixture();
        serve_manifest(&f.fetcher);
        let worker = Worker::new(CacheGeneration::new("v2"), manifest(), f.env.clone());
        worker.install().await.expect("install");
        assert!(matches!(
            worker.install().await,
            Err(LifecycleError::InvalidState { .. })
        ));
    }

    // -------------------------------------------------------------------------
    // Activate
    // -------------------------------------------------------------------------

    async fn seed_old_generations(storage: &MemoryStorage) {
        let ok = Response::new(200, "x");
        for name in [
            "shellcache-static-v0",
            "shellcache-runtime-v0",
            "shellcache-static-v1",
            "shellcache-runtime-v1",
            "unrelated-cache",
        ] {
            storage.put(name, "/", &ok).await.expect("put");
        }
    }

    #[tokio::test]
    async fn test_activate_deletes_every_other_generation() {
        let f = fixture();
        serve_manifest(&f.fetcher);
        seed_old_generations(&f.storage).await;
        let generation = CacheGeneration::new("v2");
        f.storage
            .put(&generation.runtime_name(), "/", &Response::new(200, "shell"))
            .await
            .expect("put");

        let worker = Worker::new(generation.clone(), manifest(), f.env.clone());
        worker.install().await.expect("install");
        let report = worker.activate().await.expect("activate");

        assert_eq!(report.deleted.len(), 5);
        assert_eq!(worker.state(), WorkerState::Activated);
        assert_eq!(
            f.storage.keys().await.expect("keys"),
            vec![generation.runtime_name(), generation.static_name()]
        );
    }

    #[tokio::test]
    async fn test_activate_claims_open_clients_and_enables_preload() {
        let f = fixture();
        serve_manifest(&f.fetcher);
        let old_tab = f.host.open_client(Some("v1"));
        let new_tab = f.host.open_client(None);

        let worker = Worker::new(CacheGeneration::new("v2"), manifest(), f.env.clone());
        worker.install().await.expect("install");
        let report = worker.activate().await.expect("activate");

        assert_eq!(report.claimed, 2);
        assert!(report.navigation_preload);
        assert!(f.host.navigation_preload_enabled());
        assert_eq!(f.host.controller_of(old_tab).as_deref(), Some("v2"));
        assert_eq!(f.host.controller_of(new_tab).as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_activate_is_idempotent() {
        let f = fixture();
        serve_manifest(&f.fetcher);
        seed_old_generations(&f.storage).await;
        f.host.open_client(Some("v1"));

        let worker = Worker::new(CacheGeneration::new("v2"), manifest(), f.env.clone());
        worker.install().await.expect("install");
        worker.activate().await.expect("activate");
        let keys_before = f.storage.keys().await.expect("keys");

        let again = worker.activate().await.expect("activate again");
        assert!(again.deleted.is_empty());
        assert_eq!(again.claimed, 0);
        assert_eq!(f.storage.keys().await.expect("keys"), keys_before);
        assert_eq!(worker.state(), WorkerState::Activated);
    }

    #[tokio::test]
    async fn test_activate_ignores_missing_preload_support() {
        let f = fixture_with_host(LocalHost::without_preload());
        serve_manifest(&f.fetcher);
        let worker = Worker::new(CacheGeneration::new("v2"), manifest(), f.env.clone());
        worker.install().await.expect("install");

        let report = worker.activate().await.expect("activate");
        assert!(!report.navigation_preload);
        assert_eq!(worker.state(), WorkerState::Activated);
    }

    #[tokio::test]
    async fn test_activate_before_install_is_rejected() {
        let f = fixture();
        let worker = Worker::new(CacheGeneration::new("v2"), manifest(), f.env.clone());
        assert!(matches!(
            worker.activate().await,
            Err(LifecycleError::InvalidState { actual: WorkerState::Parsed, .. })
        ));
    }

    // -------------------------------------------------------------------------
    // Control
    // -------------------------------------------------------------------------

    #[test]
    fn test_on_message_skip_waiting() {
        let f = fixture();
        let worker = Worker::new(CacheGeneration::new("v2"), manifest(), f.env.clone());
        assert!(!worker.skip_waiting_requested());

        assert_eq!(worker.on_message(b"{\"type\":\"PING\"}"), None);
        assert!(!worker.skip_waiting_requested());

        assert_eq!(
            worker.on_message(br#"{"type":"SKIP_WAITING"}"#),
            Some(ControlMessage::SkipWaiting)
        );
        assert!(worker.skip_waiting_requested());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(WorkerState::Installed.to_string(), "installed");
        assert_eq!(WorkerState::Redundant.to_string(), "redundant");
    }
}
