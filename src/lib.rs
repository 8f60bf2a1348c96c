//! Cardex Core Library
//!
//! Aggregates character cards from two providers into one searchable
//! catalog.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`db`] - Database connection and schema management
//! - [`http`] - Rate-limited, retrying provider HTTP client
//! - [`provider`] - Chub and Janitor adapters plus the solver proxy client
//! - [`tags`] - Tag normalization
//! - [`query`] - Search query mini-language
//! - [`model`] - Catalog record types
//! - [`assets`] - Card image capture
//! - [`store`] - Per-provider tables, upsert and lookups
//! - [`ingest`] - Ingestion pipeline generic over a provider
//! - [`federation`] - Cross-provider paginated listing
//! - [`catalog`] - Read facade: lookup, listing, search, tags

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod assets;
pub mod catalog;
pub mod db;
pub mod federation;
pub mod http;
pub mod ingest;
pub mod model;
pub mod provider;
pub mod query;
pub mod store;
pub mod tags;
pub mod tokens;

// Re-export commonly used types
pub use assets::{AssetStore, FsObjectStore, HttpAssetStore, ObjectStore};
pub use catalog::{Catalog, CatalogEntry, CatalogError, CatalogPage, TagListing};
pub use db::Database;
pub use federation::{DEFAULT_PAGE_SIZE, FederatedPage};
pub use http::{ClientConfig, HttpError, RateLimitedClient, RetryPolicy};
pub use ingest::{IngestError, IngestReport, IngestionService};
pub use model::{Character, ChubCharacter, JanitorCharacter, ProviderKind, TagSummary};
pub use provider::{ChubProvider, FlareSolverr, JanitorProvider, Provider, ProviderError};
pub use query::{SearchQuery, SearchType};
pub use store::{CharacterStore, StoreError};
