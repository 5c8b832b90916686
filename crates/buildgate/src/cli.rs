//! Exposes the command line application.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use buildgate_service::config::Config;
use buildgate_service::metrics;
use clap::{Parser, Subcommand};

use crate::logging;
use crate::server;
use crate::service::RequestService;

/// Buildgate commands.
#[derive(Subcommand)]
enum Command {
    /// Run the gateway.
    Run,

    /// Validate the configuration file and exit.
    CheckConfig,
}

/// Command line interface parser.
#[derive(Parser)]
#[command(version, bin_name = "buildgate")]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    match cli.command {
        Command::Run => run(config),
        Command::CheckConfig => check_config(&config),
    }
}

fn run(config: Config) -> Result<()> {
    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The runtimes are created further below, nothing else touches the environment yet.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(hostname_tag) = config.metrics.hostname_tag.clone() {
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(hostname_tag, hostname);
            }
        }
        configure_metrics(&config.metrics.prefix, statsd, tags);
    }

    server::run(config).context("failed to start the server")
}

fn check_config(config: &Config) -> Result<()> {
    // Building the service validates the parts of the config that only make sense together,
    // such as the forwarded header keys.
    RequestService::create(config).context("invalid service configuration")?;
    println!(
        "Configuration is valid: {} backend(s), authentication {}, authorization {}",
        config.backends.len(),
        enabled(config.authenticator.is_some()),
        enabled(config.authorizer.is_some()),
    );
    Ok(())
}

fn configure_metrics(prefix: &str, statsd: &str, tags: BTreeMap<String, String>) {
    // Metrics are best effort, the gateway works without them.
    if let Err(error) = metrics::configure_statsd(prefix, statsd, tags) {
        tracing::error!(error = format!("{error:#}"), "failed to configure statsd");
    }
}

fn enabled(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}
