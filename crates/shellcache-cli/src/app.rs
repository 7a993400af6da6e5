//! Application state shared by the subcommands.
//!
//! Every run restores the registration from the record in the cache
//! directory. One-shot commands model the application as still open on the
//! active generation: a freshly installed generation therefore waits until
//! `activate` closes that instance or a skip-waiting message arrives.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};
use url::Url;

use shellcache_core::{
    ActivateReport, CacheGeneration, CacheStorage, ClientId, DiskStorage, FetchEvent, Fetcher,
    HttpFetcher, InstallOutcome, OfflineFetcher, Registration, Request, Response,
};

use crate::config::Config;
use crate::record::RecordFile;

pub struct App {
    config: Config,
    origin: Url,
    storage: Arc<DiskStorage>,
    fetcher: Arc<dyn Fetcher>,
    registration: Arc<Registration>,
    records: RecordFile,
}

impl App {
    pub fn new(config: Config, offline: bool) -> Result<Self> {
        let fetcher: Arc<dyn Fetcher> = if offline {
            Arc::new(OfflineFetcher)
        } else {
            Arc::new(HttpFetcher::with_timeout(config.request_timeout())?)
        };
        Self::with_fetcher(config, fetcher)
    }

    pub fn with_fetcher(config: Config, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        let origin = config.origin_url()?;
        let cache_dir = config.cache_dir()?;
        let storage = Arc::new(
            DiskStorage::new(cache_dir.clone())
                .with_context(|| format!("Cannot open cache directory {}", cache_dir.display()))?,
        );

        let records = RecordFile::in_dir(&cache_dir);
        let record = records.load()?;
        let registration = Registration::new(origin.clone(), storage.clone(), Arc::clone(&fetcher))
            .restore(&record, &config.cache_prefix);
        debug!(cache_dir = %cache_dir.display(), origin = %origin, "App ready");

        Ok(Self {
            config,
            origin,
            storage,
            fetcher,
            registration: Arc::new(registration),
            records,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn fetcher(&self) -> Arc<dyn Fetcher> {
        Arc::clone(&self.fetcher)
    }

    pub fn registration(&self) -> Arc<Registration> {
        Arc::clone(&self.registration)
    }

    /// Install the configured generation into the registration.
    pub async fn install_configured(&self) -> Result<InstallOutcome> {
        let outcome = self
            .registration
            .install(self.config.generation(), self.config.manifest()?)
            .await?;
        Ok(outcome)
    }

    pub async fn persist(&self) -> Result<()> {
        let record = self.registration.record().await;
        self.records.save(&record)
    }

    /// The application instance left open by the previous release.
    async fn open_instance(&self) -> ClientId {
        self.registration.attach_client().await
    }

    // ===== Commands =====

    pub async fn install(&self) -> Result<()> {
        let generation = self.config.generation();
        let record = self.registration.record().await;
        let version = Some(generation.version().to_string());
        if record.active_version == version {
            println!("{} is already active", generation);
            return Ok(());
        }
        if record.waiting_version == version {
            println!("{} is already installed and waiting", generation);
            return Ok(());
        }

        self.open_instance().await;
        let outcome = self.install_configured().await?;
        match outcome {
            InstallOutcome::Activated(report) => {
                println!("Installed and activated {}", generation);
                print_activation(&report);
            }
            InstallOutcome::Waiting => {
                println!(
                    "Installed {}; waiting for open instances to close. \
                     Run `shellcache activate` or send {{\"type\":\"SKIP_WAITING\"}}.",
                    generation
                );
            }
        }
        self.persist().await
    }

    pub async fn activate(&self) -> Result<()> {
        let Some(waiting) = self.registration.waiting_version().await else {
            println!("Nothing is waiting to activate");
            return Ok(());
        };

        let instance = self.open_instance().await;
        match self.registration.detach_client(instance).await? {
            Some(report) => {
                println!("Activated {}", waiting);
                print_activation(&report);
            }
            None => println!("{} is still waiting", waiting),
        }
        self.persist().await
    }

    pub async fn message(&self, json: &str) -> Result<()> {
        self.open_instance().await;
        match self.registration.post_message(json.as_bytes()).await? {
            Some(report) => {
                let active = self.registration.active_version().await.unwrap_or_default();
                println!("Activated {}", active);
                print_activation(&report);
            }
            None => println!("Message delivered; nothing changed"),
        }
        self.persist().await
    }

    pub async fn fetch(&self, path: &str, navigate: bool) -> Result<()> {
        let url = Request::resolve(&self.origin, path)?;
        let request = if navigate {
            Request::navigate(url)
        } else {
            Request::get(url)
        };

        let instance = self.open_instance().await;
        let response = match self
            .registration
            .fetch(instance, FetchEvent::new(request.clone()))
            .await
        {
            Some(response) => response,
            None => {
                info!(url = %request.url, "Not handled by the cache, going to network");
                self.fetcher.fetch(&request).await?
            }
        };
        print_response(&response)
    }

    pub async fn status(&self, show_entries: bool) -> Result<()> {
        let record = self.registration.record().await;
        let configured = self.config.generation();

        println!("Origin:     {}", self.origin);
        println!("Configured: {}", configured);
        println!(
            "Active:     {}",
            record.active_version.as_deref().unwrap_or("(none)")
        );
        println!(
            "Waiting:    {}",
            record.waiting_version.as_deref().unwrap_or("(none)")
        );
        println!("Cache dir:  {}", self.storage.root().display());
        println!();

        let names = self.storage.keys().await?;
        if names.is_empty() {
            println!("No cache stores");
            return Ok(());
        }

        for name in names {
            let entries = self.storage.load_entries(&name)?;
            let owned_by = |version: &Option<String>| {
                version.as_deref().is_some_and(|v| {
                    CacheGeneration::with_prefix(configured.prefix(), v).owns(&name)
                })
            };
            let label = if owned_by(&record.active_version) {
                "active"
            } else if owned_by(&record.waiting_version) {
                "waiting"
            } else {
                "stale"
            };
            println!("{}  {} entries  ({})", name, entries.len(), label);
            if show_entries {
                for entry in &entries {
                    println!(
                        "    {:<40} {:>3}  {}",
                        entry.key,
                        entry.response.status,
                        entry.age_display()
                    );
                }
            }
        }
        Ok(())
    }
}

fn print_activation(report: &ActivateReport) {
    for name in &report.deleted {
        println!("  deleted {}", name);
    }
    println!("  claimed {} instance(s)", report.claimed);
}

fn print_response(response: &Response) -> Result<()> {
    if response.is_network_error() {
        anyhow::bail!("Network error and nothing cached for this request");
    }
    eprintln!("{} {}", response.status, response.status_text);
    for (name, value) in &response.headers {
        eprintln!("{}: {}", name, value);
    }
    let mut stdout = io::stdout().lock();
    stdout.write_all(&response.body)?;
    stdout.flush()?;
    Ok(())
}
