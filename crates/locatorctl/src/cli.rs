//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use locator_service::config::Config;
use locator_service::error::LookupError;
use locator_service::resolver::{LocationCache, LocationService, location_cache};
use locator_service::response::{Location, parse_location};
use locator_service::{logging, metrics};
use serde_json::{Value, json};
use url::Url;

/// Looks up services through the service locator.
#[derive(Debug, Parser)]
#[command(author, version, about)]
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

#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve services and print one JSON line per service.
    Lookup {
        /// The names of the services to look up.
        #[arg(required = true)]
        names: Vec<String>,

        /// The location of services unknown to the locator.
        #[arg(long, value_parser = parse_location)]
        fallback: Option<Location>,
    },

    /// Print the URL under which the locator answers lookups for a service.
    Url {
        /// The name of the service.
        name: String,

        /// The URL to print when not running on the platform.
        #[arg(long)]
        fallback: Url,
    },
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    logging::init_logging(&config);
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    let service = LocationService::from_config(&config).context("failed to create client")?;
    tracing::debug!(platform = ?service.platform(), "Loaded platform");

    match cli.command {
        Command::Lookup { names, fallback } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start the runtime")?;

            let cache = location_cache();
            let lines = runtime.block_on(lookup(&service, &cache, &names, fallback));

            let failed = lines.iter().filter(|line| line.get("error").is_some()).count();
            for line in lines {
                println!("{line}");
            }

            if failed > 0 {
                anyhow::bail!("{failed} of {} lookups failed", names.len());
            }
        }
        Command::Url { name, fallback } => {
            let url = service
                .lookup_url(&name, fallback)
                .context("failed to build lookup url")?;
            println!("{url}");
        }
    }

    Ok(())
}

/// Looks up all `names` concurrently through one cache, returning one JSON object per name in
/// order.
async fn lookup(
    service: &LocationService,
    cache: &LocationCache,
    names: &[String],
    fallback: Option<Location>,
) -> Vec<Value> {
    let lookups = names.iter().map(|name| {
        let fallback = fallback.clone();
        async move {
            let result = match fallback {
                Some(fallback) => service.resolve(name, fallback, cache).await.map(Some),
                None => service.lookup(name, cache).await,
            };
            render(name, result)
        }
    });

    join_all(lookups).await
}

fn render(name: &str, result: Result<Option<Location>, LookupError>) -> Value {
    match result {
        Ok(location) => json!({
            "service": name,
            "location": location.map(|location| location.to_string()),
        }),
        Err(error) => json!({
            "service": name,
            "error": error.to_string(),
            "kind": error.metrics_tag(),
        }),
    }
}
