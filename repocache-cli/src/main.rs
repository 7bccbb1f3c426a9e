//! `repocache` - caching proxy for Debian and RPM repositories.

mod error;
mod logging;
mod server;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use repocache::app::ProxyApp;
use repocache::config::ProxyConfig;
use tracing::info;

use crate::error::CliError;

/// Configuration file looked up when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "repocache.ini";

#[derive(Parser, Debug)]
#[command(name = "repocache", version = repocache::VERSION, about)]
struct Cli {
    /// INI configuration file (default: <config dir>/repocache/repocache.ini)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the cache directory
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Override the listen address
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Also write daily-rolling log files into this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let _log_guard = logging::init(cli.verbose, cli.log_dir.as_deref())?;
    let config = load_config(&cli)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;

    let mut app = ProxyApp::start(config, runtime.handle())?;
    let served = runtime.block_on(server::serve(&app));
    runtime.block_on(app.shutdown());
    drop(app);

    info!("Shutdown complete");
    served
}

/// Resolve the configuration: explicit file, then the per-user file, then
/// defaults. Command line overrides apply last.
fn load_config(cli: &Cli) -> Result<ProxyConfig, CliError> {
    let mut config = match cli.config.clone().or_else(default_config_path) {
        Some(path) if cli.config.is_some() || path.is_file() => {
            info!(path = %path.display(), "Loading configuration");
            ProxyConfig::load(&path)?
        }
        _ => {
            let cache_dir = dirs::cache_dir()
                .map(|dir| dir.join("repocache"))
                .unwrap_or_else(|| ProxyConfig::default().cache_dir);
            ProxyConfig::new(cache_dir)
        }
    };

    if let Some(cache_dir) = &cli.cache_dir {
        config.cache_dir = cache_dir.clone();
    }
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    Ok(config)
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("repocache").join(DEFAULT_CONFIG_FILE))
}
