//! DomainForge
//!
//! Extracts DNS signature domains from firewall release notes and enriches
//! them with AutoFocus sample history, assessing each domain's most
//! significant threat tag while keeping within the AutoFocus point budget.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use regex::Regex;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod collectors;
mod config;
mod enrichment;
mod error;
mod models;
mod storage;

use api::{create_router, AppState};
use collectors::release_notes::{self, ReleaseNotesCollector, DEFAULT_ADD_PATTERN, DEFAULT_REMOVE_PATTERN};
use collectors::DomainCollector;
use config::{BudgetSettings, CacheSettings, ConfidenceLevels, LookupSettings, Settings};
use enrichment::autofocus::{
    parse_url, AutoFocusClient, AutoFocusConfig, DEFAULT_RESULTS_URL, DEFAULT_SEARCH_URL, DEFAULT_TAG_URL,
};
use enrichment::budget::{BudgetGovernor, RateLimitContext, TokioSleeper};
use enrichment::domain::DomainEnricher;
use models::domain_utils::{is_plausible_domain, normalize_domain};
use storage::{DocumentStore, MemoryStore, PgDocumentStore};

/// DomainForge
#[derive(Parser, Debug)]
#[command(name = "domainforge")]
#[command(about = "Enrich release-notes DNS signature domains with AutoFocus threat intel")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Database URL; the in-memory store is used when unset
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Run database migrations
    #[arg(long, default_value = "false", global = true)]
    migrate: bool,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", default_value = "false", global = true)]
    log_json: bool,

    #[command(flatten)]
    autofocus: AutoFocusArgs,

    #[command(flatten)]
    tuning: TuningArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the enrichment API
    Serve {
        /// Server host
        #[arg(long, env = "HOST", default_value = "0.0.0.0")]
        host: String,

        /// Server port
        #[arg(long, env = "PORT", default_value = "8080")]
        port: u16,
    },

    /// Extract domains from a release-notes page into the next Parsed_<n>.txt
    Parse {
        /// Downloaded release-notes HTML file
        html: PathBuf,

        /// Header pattern of the added-domains section
        #[arg(long, env = "ADD_REGEX", default_value = DEFAULT_ADD_PATTERN)]
        add_regex: String,

        /// Header pattern of the removed-domains section
        #[arg(long, env = "REM_REGEX", default_value = DEFAULT_REMOVE_PATTERN)]
        rem_regex: String,

        /// Output directory
        #[arg(long, env = "PARSED_DIR", default_value = ".")]
        parsed_dir: PathBuf,

        /// Number of domains to write; anything but a number writes them all
        #[arg(long, env = "NUM_DOMAINS_OUTPUT")]
        num_domains_output: Option<String>,

        /// Enrich the extracted domains after writing them
        #[arg(long, default_value = "false")]
        enrich: bool,
    },

    /// Enrich domains and print one JSON result per line
    Enrich {
        domains: Vec<String>,

        /// Read additional domains from a file, one per line
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Refresh and print the AutoFocus point budget
    Budget,
}

#[derive(ClapArgs, Debug)]
struct AutoFocusArgs {
    /// AutoFocus API key
    #[arg(long, env = "AUTOFOCUS_API_KEY", global = true)]
    autofocus_api_key: Option<String>,

    #[arg(long, env = "AUTOFOCUS_SEARCH_URL", default_value = DEFAULT_SEARCH_URL, global = true)]
    autofocus_search_url: String,

    #[arg(long, env = "AUTOFOCUS_RESULTS_URL", default_value = DEFAULT_RESULTS_URL, global = true)]
    autofocus_results_url: String,

    #[arg(long, env = "AUTOFOCUS_TAG_URL", default_value = DEFAULT_TAG_URL, global = true)]
    autofocus_tag_url: String,

    /// Client-side request pacing
    #[arg(long, env = "AF_REQUESTS_PER_MINUTE", default_value = "60", global = true)]
    af_requests_per_minute: u32,
}

#[derive(ClapArgs, Debug)]
struct TuningArgs {
    /// Daily points at or below which all queries are suspended
    #[arg(long, env = "AF_POINT_NOEXEC", default_value = "500", global = true)]
    af_point_noexec: i64,

    /// Daily points below which slow mode is switched on
    #[arg(long, env = "AF_POINTS_LOW", default_value = "5000", global = true)]
    af_points_low: i64,

    /// Seconds between budget probes while suspended
    #[arg(long, env = "AF_NOEXEC_CKTIME", default_value = "900", global = true)]
    af_noexec_cktime: u64,

    /// Maximum result polls per domain search
    #[arg(long, env = "AF_LOOKUP_TIMEOUT", default_value = "5", global = true)]
    af_lookup_timeout: u32,

    /// Completion percentage at which search results are accepted
    #[arg(
        long,
        env = "AF_LOOKUP_MAX_PERCENTAGE",
        default_value = "100",
        value_parser = clap::value_parser!(u8).range(0..=100),
        global = true
    )]
    af_lookup_max_percentage: u8,

    /// Seconds between result polls
    #[arg(long, env = "AF_POLL_INTERVAL", default_value = "61", global = true)]
    af_poll_interval: u64,

    /// Domains enriched concurrently outside slow mode
    #[arg(long, env = "AF_MAX_CONCURRENCY", default_value = "4", global = true)]
    af_max_concurrency: usize,

    /// Days before cached tag details are refreshed
    #[arg(long, env = "DOMAIN_TAG_INFO_MAX_AGE", default_value = "120", global = true)]
    domain_tag_info_max_age: i64,

    /// Days before cached domain docs are refreshed
    #[arg(long, env = "DNS_DOMAIN_INFO_MAX_AGE", default_value = "30", global = true)]
    dns_domain_info_max_age: i64,

    /// Malware family confidence by sample age in days, e.g. {7: 80, 30: 50}
    #[arg(long, env = "CONFIDENCE_LEVELS", default_value = "{7: 80, 30: 50, 90: 20}", global = true)]
    confidence_levels: ConfidenceLevels,
}

impl TuningArgs {
    fn settings(&self) -> Settings {
        Settings {
            budget: BudgetSettings {
                no_exec_points: self.af_point_noexec,
                low_points: self.af_points_low,
                no_exec_check_interval: Duration::from_secs(self.af_noexec_cktime),
                ..BudgetSettings::default()
            },
            lookup: LookupSettings {
                timeout_polls: self.af_lookup_timeout,
                max_percentage: self.af_lookup_max_percentage,
                poll_interval: Duration::from_secs(self.af_poll_interval),
                max_concurrency: self.af_max_concurrency,
                ..LookupSettings::default()
            },
            cache: CacheSettings {
                tag_max_age: chrono::Duration::days(self.domain_tag_info_max_age),
                domain_max_age: chrono::Duration::days(self.dns_domain_info_max_age),
            },
            confidence_levels: self.confidence_levels.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Parse arguments
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "domainforge=info,tower_http=info".into());
    let (json_layer, text_layer) = if args.log_json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();

    tracing::info!("Starting DomainForge");

    match &args.command {
        Command::Serve { host, port } => serve(&args, host, *port).await,
        Command::Parse {
            html,
            add_regex,
            rem_regex,
            parsed_dir,
            num_domains_output,
            enrich,
        } => {
            let add_pattern = Regex::new(add_regex).context("Invalid ADD_REGEX")?;
            let remove_pattern = Regex::new(rem_regex).context("Invalid REM_REGEX")?;
            let collector = ReleaseNotesCollector::new(html, add_pattern, remove_pattern);

            // A format change needs a human; let it end the run
            let parsed = collector.collect().await?;
            tracing::info!(collector = collector.name(), count = parsed.len(), "Collected domains");

            let limit = num_domains_output.as_deref().and_then(|n| n.trim().parse().ok());
            let path = release_notes::write_domains(parsed_dir, &parsed, limit)
                .await
                .context("Failed to write parsed domains")?;
            tracing::info!("Finished running. Find your new file at {}", path.display());

            if *enrich {
                let domains: Vec<String> = parsed.into_iter().map(|p| p.domain).collect();
                enrich_and_print(&args, domains).await?;
            }
            Ok(())
        }
        Command::Enrich { domains, file } => {
            let mut all = domains.clone();
            if let Some(path) = file {
                let contents = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                all.extend(contents.lines().map(str::to_string));
            }
            enrich_and_print(&args, all).await
        }
        Command::Budget => {
            let enricher = build_enricher(&args).await?;
            let bucket = enricher.governor().update_stats().await?;
            println!("{}", serde_json::to_string_pretty(&bucket)?);
            Ok(())
        }
    }
}

async fn build_store(args: &Args) -> Result<Arc<dyn DocumentStore>> {
    match &args.database_url {
        Some(url) => {
            let store = PgDocumentStore::new(url).await?;

            // Run migrations if requested
            if args.migrate {
                tracing::info!("Running database migrations...");
                store.migrate().await?;
                tracing::info!("Migrations complete");
            }

            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, caching documents in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn build_enricher(args: &Args) -> Result<Arc<DomainEnricher>> {
    let store = build_store(args).await?;

    let af = &args.autofocus;
    let api_key = af
        .autofocus_api_key
        .clone()
        .context("AUTOFOCUS_API_KEY is required")?;

    let client = Arc::new(AutoFocusClient::new(AutoFocusConfig {
        search_url: parse_url(&af.autofocus_search_url)?,
        results_url: parse_url(&af.autofocus_results_url)?,
        tag_url: parse_url(&af.autofocus_tag_url)?,
        requests_per_minute: af.af_requests_per_minute,
        ..AutoFocusConfig::new(api_key)?
    })?);

    let settings = args.tuning.settings();
    tracing::info!(confidence_levels = %settings.confidence_levels, "AutoFocus enrichment enabled");

    let sleeper = Arc::new(TokioSleeper);
    let governor = Arc::new(BudgetGovernor::new(
        settings.budget.clone(),
        Arc::new(RateLimitContext::new()),
        client.clone(),
        sleeper.clone(),
        store.clone(),
    ));

    Ok(Arc::new(DomainEnricher::new(client, store, governor, sleeper, settings)))
}

async fn enrich_and_print(args: &Args, domains: Vec<String>) -> Result<()> {
    let enricher = build_enricher(args).await?;

    let mut names = vec![];
    for raw in domains {
        let name = normalize_domain(&raw);
        if is_plausible_domain(&name) {
            names.push(name);
        } else if !raw.trim().is_empty() {
            tracing::warn!(domain = %raw, "Skipping value that is not a domain");
        }
    }

    for (domain, enrichment) in enricher.enrich_batch(&names).await {
        let line = match enrichment {
            Some(enrichment) => serde_json::to_string(&enrichment)?,
            None => serde_json::json!({ "domain": domain, "error": "enrichment unavailable" }).to_string(),
        };
        println!("{}", line);
    }

    Ok(())
}

async fn serve(args: &Args, host: &str, port: u16) -> Result<()> {
    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    let enricher = build_enricher(args).await?;

    // Record the starting budget; a failed probe is not fatal
    if let Err(e) = enricher.governor().update_stats().await {
        tracing::warn!(error = %e, "Failed to update af-details");
    }

    let context = enricher.governor().context().clone();

    // Create application state
    let state = Arc::new(AppState {
        enricher,
        metrics: Some(metrics),
    });

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Create router
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    tracing::info!("Listening on http://{}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down, cancelling budget suspensions");
            context.cancel();
        })
        .await?;

    Ok(())
}
