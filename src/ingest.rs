//! Ingestion pipeline, generic over [`Provider`].
//!
//! Every call runs the same stages:
//!
//! ```text
//! RefreshTaxonomy -> FetchFromProvider -> NormalizeEach -> UpsertEach
//! ```
//!
//! The taxonomy refresh always runs first, so upserted records only reference
//! known tags. Per-record failures are collected in the [`IngestReport`] and
//! never abort the batch; records the provider no longer has are listed as
//! not found.

use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::model::{Character, ProviderKind};
use crate::provider::{PageRequest, Provider, ProviderError};
use crate::store::{CharacterStore, StoreError};
use crate::tags::normalize_tags;

/// Failures that abort a whole ingestion call.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A provider call needed by the whole call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Writing to the catalog failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The call was cancelled before it produced anything.
    #[error("ingestion cancelled")]
    Cancelled,
}

/// Pipeline stage a record failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStage {
    Fetch,
    Normalize,
    Upsert,
}

/// One record that could not be ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestFailure {
    /// Provider key of the record.
    pub key: String,
    pub stage: IngestStage,
    pub error: String,
    /// The failure was throttling, a 5xx, a network error or a locked
    /// database, so a later run may succeed.
    pub retryable: bool,
}

/// Outcome of an ingestion call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub provider: ProviderKind,
    /// Stored records, in listing order.
    pub records: Vec<Character>,
    pub failures: Vec<IngestFailure>,
    /// Keys the provider answered "not found" for.
    pub not_found: Vec<String>,
    /// Taxonomy names that were new.
    pub tags_added: u64,
    /// Listing pages fetched.
    pub pages: u32,
    /// Match count the provider last reported.
    pub provider_total: u64,
    /// Set when cancellation stopped the call early.
    pub cancelled: bool,
}

impl IngestReport {
    fn new(provider: ProviderKind) -> Self {
        Self {
            provider,
            records: Vec::new(),
            failures: Vec::new(),
            not_found: Vec::new(),
            tags_added: 0,
            pages: 0,
            provider_total: 0,
            cancelled: false,
        }
    }

    /// Returns true when no record failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of failures a later run may get past.
    #[must_use]
    pub fn retryable_failures(&self) -> usize {
        self.failures.iter().filter(|f| f.retryable).count()
    }

    fn absorb(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Stored(character) => self.records.push(*character),
            RecordOutcome::NotFound(key) => self.not_found.push(key),
            RecordOutcome::Failed(failure) => self.failures.push(failure),
        }
    }
}

enum RecordOutcome {
    Stored(Box<Character>),
    NotFound(String),
    Failed(IngestFailure),
}

/// Pulls records from one provider into the catalog.
#[derive(Debug)]
pub struct IngestionService<P: Provider> {
    provider: P,
    store: CharacterStore,
    skip_assets: bool,
    cancel: CancellationToken,
}

impl<P: Provider> IngestionService<P> {
    #[must_use]
    pub fn new(provider: P, store: CharacterStore) -> Self {
        Self {
            provider,
            store,
            skip_assets: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Normalizes records without capturing their assets.
    #[must_use]
    pub fn with_skip_assets(mut self, skip_assets: bool) -> Self {
        self.skip_assets = skip_assets;
        self
    }

    /// Stops multi-page calls between pages once `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Pulls the provider's taxonomy and stores it canonicalized.
    ///
    /// # Errors
    ///
    /// Returns an error if the pull or the insert fails.
    #[instrument(skip(self), fields(provider = %self.provider.kind()))]
    pub async fn refresh_taxonomy(&self) -> Result<u64, IngestError> {
        let raw = self.provider.fetch_tags().await?;
        let canonical = normalize_tags(&raw);
        let added = self
            .store
            .insert_tags(self.provider.kind(), &canonical)
            .await?;
        debug!(pulled = raw.len(), added, "taxonomy refreshed");
        Ok(added)
    }

    /// Ingests a single record by provider key.
    ///
    /// A record the provider does not have is reported in `not_found`.
    ///
    /// # Errors
    ///
    /// Unlike batch calls, a failure of the one record is returned as an
    /// error.
    #[instrument(skip(self), fields(provider = %self.provider.kind()))]
    pub async fn ingest_by_id(&self, key: &str) -> Result<IngestReport, IngestError> {
        self.ensure_running()?;
        let mut report = IngestReport::new(self.provider.kind());
        report.tags_added = self.refresh_taxonomy().await?;

        let Some(record) = self.provider.fetch_record(key).await? else {
            info!(key, "record not found at provider");
            report.not_found.push(key.to_string());
            return Ok(report);
        };
        let character = self.provider.normalize(record, self.skip_assets).await?;
        report.records.push(self.store.upsert(&character).await?);

        info!(key, "record ingested");
        Ok(report)
    }

    /// Ingests every record listed on one page of the newest listing.
    ///
    /// # Errors
    ///
    /// Returns an error if the taxonomy refresh or the page fetch fails.
    #[instrument(skip(self), fields(provider = %self.provider.kind()))]
    pub async fn ingest_page(&self, page: u32) -> Result<IngestReport, IngestError> {
        self.ensure_running()?;
        let mut report = IngestReport::new(self.provider.kind());
        report.tags_added = self.refresh_taxonomy().await?;
        self.ingest_listing(&PageRequest::latest(page), &mut report)
            .await?;
        self.log_report(&report);
        Ok(report)
    }

    /// Ingests pages `1..=pages` of a provider search, stopping early at the
    /// first empty page or on cancellation.
    ///
    /// # Errors
    ///
    /// Returns an error if the taxonomy refresh or a page fetch fails.
    #[instrument(skip(self), fields(provider = %self.provider.kind()))]
    pub async fn ingest_search(&self, term: &str, pages: u32) -> Result<IngestReport, IngestError> {
        let mut report = IngestReport::new(self.provider.kind());
        if self.cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }
        report.tags_added = self.refresh_taxonomy().await?;

        for page in 1..=pages.max(1) {
            if self.cancel.is_cancelled() {
                info!(page, "search ingestion cancelled");
                report.cancelled = true;
                break;
            }
            match self
                .ingest_listing(&PageRequest::search(page, term), &mut report)
                .await
            {
                Ok(0) => break,
                Ok(_) => {}
                Err(IngestError::Provider(e)) if e.is_cancelled() => {
                    info!(page, "search ingestion cancelled mid-page");
                    report.cancelled = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        self.log_report(&report);
        Ok(report)
    }

    /// Scheduled refresh: page 1 of the newest listing.
    ///
    /// # Errors
    ///
    /// See [`IngestionService::ingest_page`].
    pub async fn refresh_latest(&self) -> Result<IngestReport, IngestError> {
        self.ingest_page(1).await
    }

    fn ensure_running(&self) -> Result<(), IngestError> {
        if self.cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        Ok(())
    }

    /// Fetches one listing page and runs every entry through the pipeline.
    /// Returns the number of entries on the page.
    async fn ingest_listing(
        &self,
        request: &PageRequest,
        report: &mut IngestReport,
    ) -> Result<usize, IngestError> {
        let listing = self.provider.fetch_page(request).await?;
        report.pages += 1;
        report.provider_total = listing.total;

        let keys: Vec<String> = listing
            .items
            .iter()
            .map(|item| self.provider.record_key(item))
            .collect();
        debug!(page = request.page, entries = keys.len(), "listing fetched");

        let outcomes = join_all(keys.iter().map(|key| self.ingest_record(key))).await;
        for outcome in outcomes {
            report.absorb(outcome);
        }
        Ok(keys.len())
    }

    async fn ingest_record(&self, key: &str) -> RecordOutcome {
        let failed = |stage: IngestStage, error: String, retryable: bool| {
            warn!(key, ?stage, retryable, error = %error, "record ingestion failed");
            RecordOutcome::Failed(IngestFailure {
                key: key.to_string(),
                stage,
                error,
                retryable,
            })
        };

        let record = match self.provider.fetch_record(key).await {
            Ok(Some(record)) => record,
            Ok(None) => return RecordOutcome::NotFound(key.to_string()),
            Err(e) => return failed(IngestStage::Fetch, e.to_string(), e.is_transient()),
        };
        let character = match self.provider.normalize(record, self.skip_assets).await {
            Ok(character) => character,
            Err(e) => return failed(IngestStage::Normalize, e.to_string(), e.is_transient()),
        };
        match self.store.upsert(&character).await {
            Ok(stored) => RecordOutcome::Stored(Box::new(stored)),
            Err(e) => failed(IngestStage::Upsert, e.to_string(), e.is_busy_or_locked()),
        }
    }

    fn log_report(&self, report: &IngestReport) {
        info!(
            provider = %report.provider,
            stored = report.records.len(),
            failed = report.failures.len(),
            retryable = report.retryable_failures(),
            not_found = report.not_found.len(),
            pages = report.pages,
            cancelled = report.cancelled,
            "ingestion finished"
        );
    }
}
