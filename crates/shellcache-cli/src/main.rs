//! Shellcache - keep a web application usable without a network connection.
//!
//! Installs versioned cache generations of the application's assets, switches
//! between them, and serves the application through a caching proxy.

mod app;
mod config;
mod logging;
mod record;
mod serve;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use app::App;
use config::Config;

/// Log level for one-shot commands when RUST_LOG is unset
const DEFAULT_LOG_LEVEL: &str = "warn";

/// Log level for `serve` when RUST_LOG is unset
const SERVE_LOG_LEVEL: &str = "info";

#[derive(Parser, Debug)]
#[command(name = "shellcache", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/shellcache/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to daily rolling files in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a config file for an application origin
    Init {
        /// Base URL of the application, e.g. https://attendance.example
        origin: String,
        /// Release version token
        #[arg(long)]
        release: Option<String>,
    },
    /// Install the configured generation
    Install,
    /// Activate the waiting generation as if every open instance closed
    Activate,
    /// Deliver a control message, e.g. '{"type":"SKIP_WAITING"}'
    Message { json: String },
    /// Route one request through the active generation
    Fetch {
        /// Origin-relative path, e.g. /css/app.css
        path: String,
        /// Treat as a full page navigation
        #[arg(long)]
        navigate: bool,
        /// Behave as if the network were unreachable
        #[arg(long)]
        offline: bool,
    },
    /// Show generations and cache stores
    Status {
        /// List every entry with its age
        #[arg(long)]
        entries: bool,
    },
    /// Run the caching proxy
    Serve {
        /// Bind address (overrides the config file)
        #[arg(long)]
        listen: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let level = match cli.command {
        Command::Serve { .. } => SERVE_LOG_LEVEL,
        _ => DEFAULT_LOG_LEVEL,
    };
    let _log_guard = logging::init_tracing(level, cli.log_dir.as_deref());

    let config = Config::load(cli.config.as_deref())?;
    info!(version = %config.version, "shellcache starting");

    match cli.command {
        Command::Init { origin, release } => {
            let config = Config {
                origin: Some(origin),
                version: release.unwrap_or(config.version),
                ..config
            };
            config.origin_url()?;
            let path = config.save(cli.config.as_deref())?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        Command::Install => App::new(config, false)?.install().await,
        Command::Activate => App::new(config, false)?.activate().await,
        Command::Message { json } => App::new(config, false)?.message(&json).await,
        Command::Fetch {
            path,
            navigate,
            offline,
        } => App::new(config, offline)?.fetch(&path, navigate).await,
        Command::Status { entries } => App::new(config, false)?.status(entries).await,
        Command::Serve { listen } => {
            let listen = listen.unwrap_or_else(|| config.listen.clone());
            serve::serve(App::new(config, false)?, &listen).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_fetch_flags() {
        let cli = Cli::try_parse_from(["shellcache", "fetch", "/", "--navigate", "--offline"])
            .expect("parse");
        match cli.command {
            Command::Fetch {
                path,
                navigate,
                offline,
            } => {
                assert_eq!(path, "/");
                assert!(navigate);
                assert!(offline);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from(["shellcache", "status", "--log-dir", "/tmp/logs"])
            .expect("parse");
        assert_eq!(cli.log_dir, Some(PathBuf::from("/tmp/logs")));
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
