//! FeedForge
//!
//! Aggregates third-party threat feeds into a scored indicator store and
//! firewall block-lists.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feedforge::api::{create_router, AppState};
use feedforge::collectors::HttpFetcher;
use feedforge::config::{AppConfig, CloudProvider};
use feedforge::dedup::DnsDeduplicator;
use feedforge::enrichment::{CountryLookup, GeoIpLookup, TrustDnsResolver};
use feedforge::export::{export_indicators, CloudLists, EdlWriter, ExportFormat};
use feedforge::models::IndicatorType;
use feedforge::pipeline::Pipeline;
use feedforge::scheduler::FeedScheduler;
use feedforge::storage::{create_store, IndicatorStore};
use feedforge::whitelist::{safelist::Safelist, WhitelistEngine};

/// FeedForge
#[derive(Parser, Debug)]
#[command(name = "feedforge")]
#[command(about = "Aggregate threat feeds into scored indicators and firewall block-lists")]
struct Cli {
    /// Database URL (sqlite:... or postgres://...)
    #[arg(long, global = true, env = "DATABASE_URL", default_value = "sqlite:feedforge.db")]
    database_url: String,

    /// JSON settings file
    #[arg(long, global = true, env = "FEEDFORGE_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// MaxMind country database
    #[arg(long, global = true, env = "GEOIP_COUNTRY_DB")]
    geoip_country_db: Option<PathBuf>,

    /// Global safelist file
    #[arg(long, global = true, env = "SAFELIST_PATH", default_value = "safelist.txt")]
    safelist_path: PathBuf,

    /// Directory for generated block-lists
    #[arg(long, global = true, env = "OUTPUT_DIR", default_value = "output")]
    output_dir: PathBuf,

    /// Log as JSON lines
    #[arg(long, global = true, default_value = "false")]
    log_json: bool,

    /// Run database migrations before the command
    #[arg(long, global = true, default_value = "false")]
    migrate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API and run scheduled jobs
    Serve {
        #[arg(long, env = "HOST", default_value = "0.0.0.0")]
        host: String,
        #[arg(long, env = "PORT", default_value = "8080")]
        port: u16,
    },
    /// Process every enabled source once
    Run,
    /// Process one source
    Fetch { source: String },
    /// Download and parse a source without saving
    TestFeed { source: String },
    /// Resolve a batch of domains into the DNS cache
    DnsResolve,
    /// Remove domains that resolve to stored IP indicators
    DnsSweep,
    /// Retention, whitelist sweep, rescoring and block-list regeneration
    Cleanup,
    /// Write stored indicators to stdout or a file
    Export {
        #[arg(long, default_value = "text")]
        format: String,
        /// Comma-separated indicator types
        #[arg(long)]
        types: Option<String>,
        /// Comma-separated source names
        #[arg(long)]
        sources: Option<String>,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Refresh cloud provider allow-lists (github, ms365, azure)
    CloudLists {
        /// Providers to refresh; defaults to the configured ones, or all
        providers: Vec<String>,
    },
    /// Apply database migrations and exit
    Migrate,
}

struct Services {
    store: Arc<dyn IndicatorStore>,
    pipeline: Arc<Pipeline>,
    dedup: Arc<DnsDeduplicator>,
    cloud: Arc<CloudLists>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.log_json);

    tracing::info!(command = ?cli.command, "Starting FeedForge");

    let store = create_store(&cli.database_url)
        .await
        .context("Failed to connect to database")?;

    if cli.migrate || matches!(cli.command, Command::Migrate) {
        tracing::info!("Running database migrations...");
        store.migrate().await.context("Migrations failed")?;
        tracing::info!("Migrations complete");
    }

    match &cli.command {
        Command::Migrate => Ok(()),
        Command::Serve { host, port } => {
            let metrics = PrometheusBuilder::new()
                .install_recorder()
                .context("Failed to install metrics recorder")?;
            let services = build_services(&cli, store).await?;
            serve(services, Some(metrics), host, *port).await
        }
        Command::Run => {
            let services = build_services(&cli, store).await?;
            let report = services.pipeline.run_all().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.failed() > 0 {
                tracing::warn!(failed = report.failed(), "Some sources failed");
            }
            Ok(())
        }
        Command::Fetch { source } => {
            let services = build_services(&cli, store).await?;
            let result = services.pipeline.process_single(source).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::TestFeed { source } => {
            let services = build_services(&cli, store).await?;
            let config = services
                .pipeline
                .config()
                .source(source)
                .cloned()
                .with_context(|| format!("Unknown source '{source}'"))?;
            let report = services.pipeline.test_feed(&config).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::DnsResolve => {
            let services = build_services(&cli, store).await?;
            let report = services.dedup.resolve_batch().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::DnsSweep => {
            let services = build_services(&cli, store).await?;
            let report = services.dedup.sweep().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Cleanup => {
            let services = build_services(&cli, store).await?;
            let report = services.pipeline.maintenance().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::CloudLists { providers } => {
            let services = build_services(&cli, store).await?;
            let mut selected = providers
                .iter()
                .map(|p| p.parse::<CloudProvider>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(anyhow::Error::msg)?;
            if selected.is_empty() {
                selected = services.cloud.settings().providers.clone();
            }
            if selected.is_empty() {
                selected = CloudProvider::ALL.to_vec();
            }
            let reports = services.cloud.refresh_all(&selected).await;
            println!("{}", serde_json::to_string_pretty(&reports)?);
            let failed = reports.iter().filter(|r| r.error.is_some()).count();
            if failed > 0 {
                anyhow::bail!("{failed} cloud provider(s) failed");
            }
            Ok(())
        }
        Command::Export {
            format,
            types,
            sources,
            output,
        } => {
            let format: ExportFormat = format.parse().map_err(anyhow::Error::msg)?;
            let types = split_list(types.as_deref())
                .iter()
                .map(|t| t.parse::<IndicatorType>())
                .collect::<Result<Vec<_>, _>>()?;
            let sources = split_list(sources.as_deref());
            let body = export_indicators(store.as_ref(), &types, &sources, format).await?;
            match output {
                Some(path) => tokio::fs::write(path, body)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => print!("{body}"),
            }
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "feedforge=info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

async fn build_services(cli: &Cli, store: Arc<dyn IndicatorStore>) -> Result<Services> {
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    tracing::info!(sources = config.sources.len(), "Loaded settings");

    let fetcher = HttpFetcher::new(Duration::from_secs(config.fetch_timeout_secs), config.proxy.as_ref())
        .context("Failed to build HTTP client")?;

    let safelist = Arc::new(
        Safelist::load(&cli.safelist_path)
            .await
            .context("Failed to load safelist")?,
    );
    let whitelist = Arc::new(WhitelistEngine::new(safelist, store.clone()));

    let geoip = GeoIpLookup::open(cli.geoip_country_db.as_deref());
    if geoip.is_enabled() {
        tracing::info!("GeoIP enrichment enabled");
    }
    let geoip: Arc<dyn CountryLookup> = Arc::new(geoip);

    let fetcher = Arc::new(fetcher);
    let cloud = Arc::new(CloudLists::new(
        fetcher.clone(),
        config.cloud.clone(),
        EdlWriter::new(&cli.output_dir),
    ));

    let dns = config.dns.clone();
    let resolver = Arc::new(TrustDnsResolver::new(dns.queries_per_second));
    let dedup = Arc::new(DnsDeduplicator::new(store.clone(), resolver, dns));

    let pipeline = Pipeline::new(
        store.clone(),
        fetcher,
        whitelist,
        Arc::new(RwLock::new(config)),
        EdlWriter::new(&cli.output_dir),
    )
    .with_country_lookup(geoip)
    .with_config_path(cli.config.clone());

    Ok(Services {
        store,
        pipeline: Arc::new(pipeline),
        dedup,
        cloud,
    })
}

async fn serve(
    services: Services,
    metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
    host: &str,
    port: u16,
) -> Result<()> {
    let counts = services.store.counts_by_type().await?;
    tracing::info!(indicators = counts.total(), "Store ready");

    let scheduler = FeedScheduler::start(
        services.pipeline.clone(),
        services.dedup.clone(),
        services.cloud.clone(),
    )
    .await?;

    // Create application state
    let state = Arc::new(AppState {
        pipeline: services.pipeline,
        dedup: services.dedup,
        cloud: services.cloud,
        metrics,
    });

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    tracing::info!("Listening on http://{}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await?;
    tracing::info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
