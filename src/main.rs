//! CLI entry point for the cardex catalog.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cardex_core::{
    AssetStore, Catalog, CharacterStore, ChubProvider, ClientConfig, Database, FlareSolverr,
    FsObjectStore, HttpAssetStore, IngestReport, IngestionService, JanitorProvider, Provider,
    ProviderKind, RateLimitedClient, RetryPolicy,
};
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // Logs go to stderr; stdout carries JSON results only
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");
    cli::validate(&args)?;

    let db = Database::new(&args.database)
        .await
        .with_context(|| format!("Failed to open catalog at {}", args.database.display()))?;
    let store = CharacterStore::new(db.clone());

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, finishing current work");
            ctrl_c_token.cancel();
        }
    });

    let outcome = run(&args, store, &cancel).await;

    db.close().await;
    outcome
}

async fn run(args: &Args, store: CharacterStore, cancel: &CancellationToken) -> Result<()> {
    match &args.command {
        Command::Ingest { provider, key } => {
            let services = Services::build(args, &store, cancel)?;
            let report = match provider {
                ProviderKind::Chub => services.chub.ingest_by_id(key).await?,
                ProviderKind::Janitor => services.janitor.ingest_by_id(key).await?,
            };
            print_report(&report)
        }
        Command::IngestPage { provider, page } => {
            let services = Services::build(args, &store, cancel)?;
            let report = match provider {
                ProviderKind::Chub => services.chub.ingest_page(*page).await?,
                ProviderKind::Janitor => services.janitor.ingest_page(*page).await?,
            };
            print_report(&report)
        }
        Command::IngestSearch {
            provider,
            query,
            pages,
        } => {
            let services = Services::build(args, &store, cancel)?;
            let report = match provider {
                ProviderKind::Chub => services.chub.ingest_search(query, *pages).await?,
                ProviderKind::Janitor => services.janitor.ingest_search(query, *pages).await?,
            };
            print_report(&report)
        }
        Command::Refresh => {
            let services = Services::build(args, &store, cancel)?;
            let reports = services.refresh().await;
            print_json(&reports)
        }
        Command::Watch { interval_secs } => {
            let services = Services::build(args, &store, cancel)?;
            watch(&services, Duration::from_secs(*interval_secs), cancel).await;
            Ok(())
        }
        Command::List { query, skip, take } => {
            let page = Catalog::new(store)
                .list_page(*skip, *take, query.as_deref())
                .await?;
            print_json(&page)
        }
        Command::Search {
            query,
            search_type,
            page,
        } => {
            let page = Catalog::new(store)
                .search(query.as_deref(), search_type.as_deref(), *page)
                .await?;
            print_json(&page)
        }
        Command::Get { id } => match Catalog::new(store).get_by_id(id).await? {
            Some(entry) => print_json(&entry),
            None => anyhow::bail!("No record with id '{id}'"),
        },
        Command::Tags { limit } => print_json(&Catalog::new(store).tags(*limit).await?),
        Command::Delete { id } => {
            if Catalog::new(store).soft_delete(id).await? {
                info!(%id, "Record deleted");
                Ok(())
            } else {
                anyhow::bail!("No live record with id '{id}'")
            }
        }
    }
}

/// Ingestion services for both providers, sharing one store and token.
struct Services {
    chub: IngestionService<ChubProvider>,
    janitor: IngestionService<JanitorProvider>,
}

impl Services {
    fn build(args: &Args, store: &CharacterStore, cancel: &CancellationToken) -> Result<Self> {
        let config = ClientConfig {
            max_concurrent: usize::from(args.max_concurrent),
            max_rps: args.max_rps,
            timeout: Duration::from_secs(args.timeout_secs),
            retry_policy: RetryPolicy::with_max_retries(u32::from(args.max_retries)),
        };

        let skip_assets = args.skip_assets || args.assets_dir.is_none();
        // Never written to while skip_assets is set
        let assets_root = args.assets_dir.clone().unwrap_or_else(|| "assets".into());
        let assets: Arc<dyn AssetStore> =
            Arc::new(HttpAssetStore::new(Arc::new(FsObjectStore::new(assets_root)))?);
        if skip_assets {
            debug!("Asset capture disabled");
        }

        let chub_client = RateLimitedClient::new("chub", &config, cancel.clone())
            .context("Failed to build Chub client")?;
        let janitor_client = RateLimitedClient::new("janitor", &config, cancel.clone())
            .context("Failed to build solver client")?;

        let chub = ChubProvider::with_base_urls(
            chub_client,
            Arc::clone(&assets),
            &args.chub_url,
            cardex_core::provider::CHUB_AVATAR_BASE,
        );
        let solver = Arc::new(FlareSolverr::new(janitor_client, &args.solver_url));
        let janitor = JanitorProvider::with_base_urls(
            solver,
            assets,
            &args.janitor_url,
            cardex_core::provider::JANITOR_IMAGE_BASE,
        );

        Ok(Self {
            chub: service(chub, store, skip_assets, cancel),
            janitor: service(janitor, store, skip_assets, cancel),
        })
    }

    /// Page 1 of both providers. A failing provider is logged and skipped.
    async fn refresh(&self) -> Vec<IngestReport> {
        let (chub, janitor) = tokio::join!(self.chub.refresh_latest(), self.janitor.refresh_latest());
        let mut reports = Vec::with_capacity(2);
        for (kind, outcome) in [(ProviderKind::Chub, chub), (ProviderKind::Janitor, janitor)] {
            match outcome {
                Ok(report) => reports.push(report),
                Err(e) => warn!(provider = %kind, error = %e, "Refresh failed"),
            }
        }
        reports
    }
}

fn service<P: Provider>(
    provider: P,
    store: &CharacterStore,
    skip_assets: bool,
    cancel: &CancellationToken,
) -> IngestionService<P> {
    IngestionService::new(provider, store.clone())
        .with_skip_assets(skip_assets)
        .with_cancellation(cancel.clone())
}

async fn watch(services: &Services, every: Duration, cancel: &CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(interval_secs = every.as_secs(), "Watching providers");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let reports = services.refresh().await;
                let stored: usize = reports.iter().map(|r| r.records.len()).sum();
                let failed: usize = reports.iter().map(|r| r.failures.len()).sum();
                info!(stored, failed, "Refresh cycle finished");
            }
        }
    }
    info!("Watch stopped");
}

fn print_report(report: &IngestReport) -> Result<()> {
    if !report.is_clean() {
        warn!(
            provider = %report.provider,
            failed = report.failures.len(),
            retryable = report.retryable_failures(),
            "Some records could not be ingested"
        );
    }
    print_json(report)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{rendered}");
    Ok(())
}
