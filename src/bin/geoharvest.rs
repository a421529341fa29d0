use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use geoportal_harvester::app::{App, FetchOptions};
use geoportal_harvester::config::{ConfigLoader, ResolvedConfig};
use geoportal_harvester::domain::LayerId;
use geoportal_harvester::error::HarvestError;
use geoportal_harvester::geonode::{FetchedLayer, GeonodeClient, LayerFetcher};
use geoportal_harvester::http::{ResilientClient, Service};
use geoportal_harvester::output::JsonOutput;
use geoportal_harvester::wikidata::{Candidate, QueryClient, WikidataHttpClient};

#[derive(Parser)]
#[command(name = "geoharvest")]
#[command(about = "Download GeoNode layers and reconcile them against Wikidata")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch configured layers and write GeoJSON/CSV outputs")]
    Fetch(FetchArgs),
    #[command(about = "Resolve external identifiers for the table layer")]
    Reconcile,
}

#[derive(Args)]
struct FetchArgs {
    #[arg(long, help = "Restrict the run to the given layer ids")]
    only: Vec<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(harvest) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(harvest));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::MissingConfig
        | HarvestError::ConfigRead(_)
        | HarvestError::ConfigParse(_)
        | HarvestError::InvalidLayerId(_)
        | HarvestError::NoTableLayer
        | HarvestError::MissingInput(_)
        | HarvestError::MissingColumn(_) => 2,
        HarvestError::PortalHttp(_)
        | HarvestError::PortalStatus { .. }
        | HarvestError::ErrorPage { .. }
        | HarvestError::UnexpectedContentType { .. }
        | HarvestError::MalformedJson { .. }
        | HarvestError::PageCapExceeded { .. }
        | HarvestError::LayerExhausted(_)
        | HarvestError::QueryHttp(_)
        | HarvestError::QueryStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref()).into_diagnostic()?;

    match cli.command {
        Commands::Fetch(args) => run_fetch(args, config),
        Commands::Reconcile => run_reconcile(config),
    }
}

fn run_fetch(args: FetchArgs, config: ResolvedConfig) -> miette::Result<()> {
    let only = if args.only.is_empty() {
        None
    } else {
        Some(
            args.only
                .iter()
                .map(|value| value.parse::<LayerId>())
                .collect::<Result<Vec<_>, HarvestError>>()
                .into_diagnostic()?,
        )
    };

    let http = ResilientClient::new(
        Service::Portal,
        &config.portal.user_agent,
        config.portal_retry.clone(),
    )
    .into_diagnostic()?;
    let fetcher = GeonodeClient::new(config.portal.clone(), http);
    let app = App::new(config, fetcher, NopQuery);

    let result = app.fetch(FetchOptions { only }).into_diagnostic()?;
    JsonOutput::print_fetch(&result).into_diagnostic()?;
    Ok(())
}

fn run_reconcile(config: ResolvedConfig) -> miette::Result<()> {
    let http = ResilientClient::new(
        Service::Query,
        &config.reconcile.user_agent,
        config.reconcile.retry.clone(),
    )
    .into_diagnostic()?;
    let query = WikidataHttpClient::new(
        http,
        config.reconcile.endpoint.clone(),
        config.reconcile.language.clone(),
    );
    let app = App::new(config, NopFetcher, query);

    let result = app.reconcile().into_diagnostic()?;
    JsonOutput::print_reconcile(&result).into_diagnostic()?;
    Ok(())
}

struct NopFetcher;

impl LayerFetcher for NopFetcher {
    fn fetch_layer(&self, _layer: &LayerId) -> Result<FetchedLayer, HarvestError> {
        Err(HarvestError::PortalHttp(
            "portal client not configured".to_string(),
        ))
    }
}

struct NopQuery;

impl QueryClient for NopQuery {
    fn lookup_codes(&self, _codes: &[String]) -> Result<Vec<(String, Candidate)>, HarvestError> {
        Err(HarvestError::QueryHttp(
            "query client not configured".to_string(),
        ))
    }
}
