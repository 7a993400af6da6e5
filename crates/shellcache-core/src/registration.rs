//! Registration: which generation is active, which one waits, and which
//! application instances each controls.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::control::ControlMessage;
use crate::error::LifecycleError;
use crate::generation::CacheGeneration;
use crate::lifecycle::{ActivateReport, ClientId, LocalHost, Worker, WorkerEnv, WorkerState};
use crate::manifest::PrecacheManifest;
use crate::network::Fetcher;
use crate::request::Response;
use crate::router::FetchEvent;
use crate::store::CacheStorage;

/// Persisted registration state, stored between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    #[serde(default)]
    pub active_version: Option<String>,
    #[serde(default)]
    pub waiting_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// No instance held the previous generation, so the new one took over.
    Activated(ActivateReport),
    /// Installed, waiting for old instances to close or a skip-waiting message.
    Waiting,
}

#[derive(Default)]
struct Slots {
    active: Option<Arc<Worker>>,
    waiting: Option<Arc<Worker>>,
}

pub struct Registration {
    host: Arc<LocalHost>,
    /// Shared by every worker; its host is always `host`
    env: WorkerEnv,
    slots: Mutex<Slots>,
}

impl Registration {
    pub fn new(origin: Url, storage: Arc<dyn CacheStorage>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self::with_host(Arc::new(LocalHost::new()), origin, storage, fetcher)
    }

    pub fn with_host(
        host: Arc<LocalHost>,
        origin: Url,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let env = WorkerEnv {
            origin,
            storage,
            fetcher,
            host: host.clone(),
        };
        Self {
            host,
            env,
            slots: Mutex::new(Slots::default()),
        }
    }

    /// Reinstate the generations named in a record written by an earlier run.
    pub fn restore(mut self, record: &RegistrationRecord, prefix: &str) -> Self {
        let env = &self.env;
        let worker = |version: &String, state| {
            let generation = CacheGeneration::with_prefix(prefix, version.as_str());
            Arc::new(Worker::restore(generation, env.clone(), state))
        };
        let slots = self.slots.get_mut();
        slots.active = record
            .active_version
            .as_ref()
            .map(|v| worker(v, WorkerState::Activated));
        slots.waiting = record
            .waiting_version
            .as_ref()
            .map(|v| worker(v, WorkerState::Installed));
        debug!(active = ?record.active_version, waiting = ?record.waiting_version, "Restored registration");
        self
    }

    pub fn host(&self) -> &Arc<LocalHost> {
        &self.host
    }

    pub async fn record(&self) -> RegistrationRecord {
        let slots = self.slots.lock().await;
        RegistrationRecord {
            active_version: slots
                .active
                .as_ref()
                .map(|w| w.generation().version().to_string()),
            waiting_version: slots
                .waiting
                .as_ref()
                .map(|w| w.generation().version().to_string()),
        }
    }

    pub async fn active_version(&self) -> Option<String> {
        self.record().await.active_version
    }

    pub async fn waiting_version(&self) -> Option<String> {
        self.record().await.waiting_version
    }

    /// Install a new generation and activate it if nothing holds the
    /// current one.
    ///
    /// A failed install leaves the active and waiting generations as they were.
    pub async fn install(
        &self,
        generation: CacheGeneration,
        manifest: PrecacheManifest,
    ) -> Result<InstallOutcome, LifecycleError> {
        let worker = Arc::new(Worker::new(generation, manifest, self.env.clone()));
        worker.install().await?;

        {
            let mut slots = self.slots.lock().await;
            if let Some(previous) = slots.waiting.replace(Arc::clone(&worker)) {
                info!(replaced = %previous.generation(), by = %worker.generation(), "Replaced waiting generation");
                previous.mark_redundant();
            }
        }

        match self.try_activate().await? {
            Some(report) => Ok(InstallOutcome::Activated(report)),
            None => {
                info!(generation = %worker.generation(), "Waiting for open instances to close");
                Ok(InstallOutcome::Waiting)
            }
        }
    }

    /// Promote the waiting generation if there is no active one, no client is
    /// controlled by the active one, or skip-waiting was requested.
    pub async fn try_activate(&self) -> Result<Option<ActivateReport>, LifecycleError> {
        let mut slots = self.slots.lock().await;
        let Some(waiting) = slots.waiting.clone() else {
            return Ok(None);
        };

        if let Some(active) = &slots.active {
            let holding = self.host.clients_controlled_by(active.generation().version());
            if holding > 0 && !waiting.skip_waiting_requested() {
                debug!(generation = %waiting.generation(), clients = holding, "Activation deferred");
                return Ok(None);
            }
        }

        let report = waiting.activate().await?;
        slots.waiting = None;
        if let Some(previous) = slots.active.replace(Arc::clone(&waiting)) {
            if previous.generation() != waiting.generation() {
                previous.mark_redundant();
            }
        }
        Ok(Some(report))
    }

    /// Open an application instance. It is controlled by the active
    /// generation, if any.
    pub async fn attach_client(&self) -> ClientId {
        let active = self.active_version().await;
        let id = self.host.open_client(active.as_deref());
        debug!(client = id, controller = ?active, "Client attached");
        id
    }

    /// Close an application instance. Closing the last one holding the old
    /// generation lets the waiting generation activate.
    pub async fn detach_client(&self, id: ClientId) -> Result<Option<ActivateReport>, LifecycleError> {
        if self.host.close_client(id) {
            debug!(client = id, "Client detached");
        }
        self.try_activate().await
    }

    /// Deliver a control message to the newest worker.
    pub async fn post_message(&self, bytes: &[u8]) -> Result<Option<ActivateReport>, LifecycleError> {
        let target = {
            let slots = self.slots.lock().await;
            slots.waiting.clone().or_else(|| slots.active.clone())
        };
        let Some(worker) = target else {
            debug!("No worker to receive control message");
            return Ok(None);
        };

        match worker.on_message(bytes) {
            Some(ControlMessage::SkipWaiting) => self.try_activate().await,
            None => Ok(None),
        }
    }

    /// Route a request from a client. Returns `None` when the client is not
    /// controlled by the active generation or the request is not handled.
    pub async fn fetch(&self, client: ClientId, event: FetchEvent) -> Option<Response> {
        let router = {
            let slots = self.slots.lock().await;
            let active = slots.active.as_ref()?;
            let controller = self.host.controller_of(client)?;
            if controller != active.generation().version() {
                return None;
            }
            active.router().clone()
        };
        router.handle(event).await
    }
}
