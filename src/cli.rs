//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use anyhow::{Result, bail};
use cardex_core::catalog::DEFAULT_TAG_LIMIT;
use cardex_core::{DEFAULT_PAGE_SIZE, ProviderKind};
use cardex_core::provider::{CHUB_API_BASE, JANITOR_API_ROOT};
use clap::{Parser, Subcommand};
use url::Url;

/// Aggregate character cards from Chub and Janitor into one catalog.
#[derive(Parser, Debug)]
#[command(name = "cardex")]
#[command(author, version, about)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// SQLite catalog file
    #[arg(long, global = true, env = "CARDEX_DATABASE", default_value = "cardex.db")]
    pub database: PathBuf,

    /// FlareSolverr endpoint used for Janitor requests
    #[arg(long, global = true, env = "CARDEX_SOLVER_URL", default_value = "http://localhost:8191")]
    pub solver_url: String,

    /// Directory card images are written to (assets are skipped when unset)
    #[arg(long, global = true, env = "CARDEX_ASSETS_DIR")]
    pub assets_dir: Option<PathBuf>,

    /// Do not capture card images even when --assets-dir is set
    #[arg(long, global = true)]
    pub skip_assets: bool,

    /// Chub API base URL
    #[arg(long, global = true, default_value = CHUB_API_BASE)]
    pub chub_url: String,

    /// Janitor API root URL
    #[arg(long, global = true, default_value = JANITOR_API_ROOT)]
    pub janitor_url: String,

    /// Maximum in-flight requests per provider (1-100)
    #[arg(long, global = true, default_value_t = 5, value_parser = clap::value_parser!(u16).range(1..=100))]
    pub max_concurrent: u16,

    /// Maximum requests per second per provider (1-100)
    #[arg(long, global = true, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub max_rps: u32,

    /// Per-request timeout in seconds (1-600)
    #[arg(long, global = true, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..=600))]
    pub timeout_secs: u64,

    /// Maximum retry attempts for transient failures (0-10)
    #[arg(long, global = true, default_value_t = 5, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: u8,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ingest one record (Chub: creator/slug, Janitor: character UUID)
    Ingest { provider: ProviderKind, key: String },

    /// Ingest every record on one page of the newest listing
    IngestPage {
        provider: ProviderKind,
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        page: u32,
    },

    /// Ingest the results of a provider search, page by page
    IngestSearch {
        provider: ProviderKind,
        query: String,
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=100))]
        pages: u32,
    },

    /// Ingest page 1 of both providers once
    Refresh,

    /// Refresh both providers on an interval until interrupted
    Watch {
        #[arg(long, default_value_t = 3600, value_parser = clap::value_parser!(u64).range(60..))]
        interval_secs: u64,
    },

    /// List one federated page, e.g. `list 'tag:[romance] elf'`
    List {
        query: Option<String>,
        #[arg(long, default_value_t = 0)]
        skip: u64,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE, value_parser = clap::value_parser!(u64).range(1..=500))]
        take: u64,
    },

    /// Search both providers (basic, tag, title, author)
    Search {
        query: Option<String>,
        #[arg(long = "type")]
        search_type: Option<String>,
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        page: u32,
    },

    /// Look up one record by id
    Get { id: String },

    /// Most used tags per provider
    Tags {
        #[arg(long, default_value_t = DEFAULT_TAG_LIMIT, value_parser = clap::value_parser!(u64).range(1..=1000))]
        limit: u64,
    },

    /// Soft-delete one record by id
    Delete { id: String },
}

/// Rejects argument combinations clap cannot express.
pub fn validate(args: &Args) -> Result<()> {
    for (flag, value) in [
        ("--solver-url", &args.solver_url),
        ("--chub-url", &args.chub_url),
        ("--janitor-url", &args.janitor_url),
    ] {
        ensure_http_url(flag, value)?;
    }

    match &args.command {
        Command::Ingest { key, .. } if key.trim().is_empty() => {
            bail!("Record key must not be empty.\n  Use: cardex ingest chub creator/slug")
        }
        Command::IngestSearch { query, .. } if query.trim().is_empty() => {
            bail!("Search query must not be empty.\n  Use: cardex ingest-search janitor elf")
        }
        Command::Get { id } | Command::Delete { id } if id.trim().is_empty() => {
            bail!("Record id must not be empty")
        }
        _ => Ok(()),
    }
}

fn ensure_http_url(flag: &str, value: &str) -> Result<()> {
    match Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
        Ok(url) => bail!("{flag} must be an http(s) URL, got scheme '{}'", url.scheme()),
        Err(e) => bail!("{flag} is not a valid URL ({value}): {e}"),
    }
}
