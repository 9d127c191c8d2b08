//! Closed-won reconciliation pipeline: configuration, per-entity stages and the run driver.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cwr_adapters::{CrmStore, HubSpotEndpoints, HubSpotStore};
use cwr_core::{
    chunk_count, classify, format_canonical, partition_chunks, resolve_closed_won, BusinessType,
    ClosedWonRecord, Deal, DealPropertyUpdate, EntityId, PaginationCursor, DEFAULT_THRESHOLD_DAYS,
    MAX_CHUNK_SIZE, MAX_PAGE_SIZE,
};
use cwr_storage::{CrmHttpClient, FetchError, HttpClientConfig, TokenBucketConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cwr-sync";

pub const ENV_CONFIG_PATH: &str = "CWR_CONFIG";
const ENV_CLOSED_WON_STAGES: &str = "CWR_CLOSED_WON_STAGES";
const ENV_THRESHOLD_DAYS: &str = "CWR_THRESHOLD_DAYS";
const ENV_PAGE_SIZE: &str = "CWR_PAGE_SIZE";
const ENV_CHUNK_SIZE: &str = "CWR_CHUNK_SIZE";
const ENV_ENTITY_DELAY_MS: &str = "CWR_ENTITY_DELAY_MS";
const ENV_ACCESS_TOKEN: &str = "HUBSPOT_ACCESS_TOKEN";
const ENV_API_BASE: &str = "HUBSPOT_API_BASE";
const ENV_HTTP_TIMEOUT_SECS: &str = "CWR_HTTP_TIMEOUT_SECS";
const ENV_USER_AGENT: &str = "CWR_USER_AGENT";
const ENV_RATE_LIMIT_CAPACITY: &str = "CWR_RATE_LIMIT_CAPACITY";
const ENV_RATE_LIMIT_REFILL_MS: &str = "CWR_RATE_LIMIT_REFILL_MS";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub closed_won_stages: BTreeSet<String>,
    pub threshold_days: u32,
    pub page_size: usize,
    pub chunk_size: usize,
    pub entity_delay_ms: u64,
    pub entity_date_property: String,
    pub deal_type_property: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            closed_won_stages: BTreeSet::new(),
            threshold_days: DEFAULT_THRESHOLD_DAYS as u32,
            page_size: MAX_PAGE_SIZE,
            chunk_size: MAX_CHUNK_SIZE,
            entity_delay_ms: 1_000,
            entity_date_property: "first_closed_won_deal_date".to_string(),
            deal_type_property: "deal_type".to_string(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HubSpotConfig {
    pub api_base: String,
    pub access_token: Option<String>,
    pub entity_object: String,
    pub association_property: String,
    pub timeout_secs: u64,
    pub user_agent: String,
    pub rate_limit_capacity: u32,
    pub rate_limit_refill_ms: u64,
}

impl Default for HubSpotConfig {
    fn default() -> Self {
        let endpoints = HubSpotEndpoints::default();
        Self {
            api_base: endpoints.api_base,
            access_token: None,
            entity_object: endpoints.entity_object,
            association_property: endpoints.association_property,
            timeout_secs: 20,
            user_agent: "cwr-bot/0.1".to_string(),
            rate_limit_capacity: 10,
            rate_limit_refill_ms: 100,
        }
    }
}

impl fmt::Debug for HubSpotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubSpotConfig")
            .field("api_base", &self.api_base)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("entity_object", &self.entity_object)
            .field("association_property", &self.association_property)
            .field("timeout_secs", &self.timeout_secs)
            .field("user_agent", &self.user_agent)
            .field("rate_limit_capacity", &self.rate_limit_capacity)
            .field("rate_limit_refill_ms", &self.rate_limit_refill_ms)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub pipeline: PipelineConfig,
    pub hubspot: HubSpotConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("closed_won_stages must name at least one deal stage")]
    EmptyClosedWonStages,
    #[error("closed_won_stages contains a blank stage name")]
    BlankStageName,
    #[error("threshold_days must be a positive integer")]
    InvalidThreshold,
    #[error("page_size must be between 1 and {max}, got {value}")]
    InvalidPageSize { value: usize, max: usize },
    #[error("chunk_size must be between 1 and {max}, got {value}")]
    InvalidChunkSize { value: usize, max: usize },
    #[error("{0} must not be empty")]
    EmptyProperty(&'static str),
    #[error("hubspot access token is not configured (set {ENV_ACCESS_TOKEN})")]
    MissingAccessToken,
}

impl ReconcileConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Defaults, then the YAML file (explicit path or `CWR_CONFIG`), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var(ENV_CONFIG_PATH).ok().map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_CLOSED_WON_STAGES) {
            self.pipeline.closed_won_stages = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(raw) = lookup(ENV_THRESHOLD_DAYS) {
            self.pipeline.threshold_days = parse_env(ENV_THRESHOLD_DAYS, raw)?;
        }
        if let Some(raw) = lookup(ENV_PAGE_SIZE) {
            self.pipeline.page_size = parse_env(ENV_PAGE_SIZE, raw)?;
        }
        if let Some(raw) = lookup(ENV_CHUNK_SIZE) {
            self.pipeline.chunk_size = parse_env(ENV_CHUNK_SIZE, raw)?;
        }
        if let Some(raw) = lookup(ENV_ENTITY_DELAY_MS) {
            self.pipeline.entity_delay_ms = parse_env(ENV_ENTITY_DELAY_MS, raw)?;
        }
        if let Some(token) = lookup(ENV_ACCESS_TOKEN).filter(|t| !t.trim().is_empty()) {
            self.hubspot.access_token = Some(token.trim().to_string());
        }
        if let Some(base) = lookup(ENV_API_BASE) {
            self.hubspot.api_base = base;
        }
        if let Some(raw) = lookup(ENV_HTTP_TIMEOUT_SECS) {
            self.hubspot.timeout_secs = parse_env(ENV_HTTP_TIMEOUT_SECS, raw)?;
        }
        if let Some(user_agent) = lookup(ENV_USER_AGENT) {
            self.hubspot.user_agent = user_agent;
        }
        if let Some(raw) = lookup(ENV_RATE_LIMIT_CAPACITY) {
            self.hubspot.rate_limit_capacity = parse_env(ENV_RATE_LIMIT_CAPACITY, raw)?;
        }
        if let Some(raw) = lookup(ENV_RATE_LIMIT_REFILL_MS) {
            self.hubspot.rate_limit_refill_ms = parse_env(ENV_RATE_LIMIT_REFILL_MS, raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let pipeline = &self.pipeline;
        if pipeline.closed_won_stages.is_empty() {
            return Err(ConfigError::EmptyClosedWonStages);
        }
        if pipeline.closed_won_stages.iter().any(|s| s.trim().is_empty()) {
            return Err(ConfigError::BlankStageName);
        }
        if pipeline.threshold_days == 0 {
            return Err(ConfigError::InvalidThreshold);
        }
        if !(1..=MAX_PAGE_SIZE).contains(&pipeline.page_size) {
            return Err(ConfigError::InvalidPageSize {
                value: pipeline.page_size,
                max: MAX_PAGE_SIZE,
            });
        }
        if !(1..=MAX_CHUNK_SIZE).contains(&pipeline.chunk_size) {
            return Err(ConfigError::InvalidChunkSize {
                value: pipeline.chunk_size,
                max: MAX_CHUNK_SIZE,
            });
        }
        if pipeline.entity_date_property.trim().is_empty() {
            return Err(ConfigError::EmptyProperty("entity_date_property"));
        }
        if pipeline.deal_type_property.trim().is_empty() {
            return Err(ConfigError::EmptyProperty("deal_type_property"));
        }
        Ok(())
    }

    pub fn access_token(&self) -> Result<&str, ConfigError> {
        self.hubspot
            .access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingAccessToken)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        let token_bucket = (self.hubspot.rate_limit_capacity > 0 && self.hubspot.rate_limit_refill_ms > 0)
            .then(|| TokenBucketConfig {
                capacity: self.hubspot.rate_limit_capacity,
                refill_every: Duration::from_millis(self.hubspot.rate_limit_refill_ms),
            });
        HttpClientConfig {
            timeout: Duration::from_secs(self.hubspot.timeout_secs),
            user_agent: Some(self.hubspot.user_agent.clone()),
            bearer_token: self.hubspot.access_token.clone(),
            token_bucket,
        }
    }

    pub fn hubspot_endpoints(&self) -> HubSpotEndpoints {
        HubSpotEndpoints {
            api_base: self.hubspot.api_base.clone(),
            entity_object: self.hubspot.entity_object.clone(),
            association_property: self.hubspot.association_property.clone(),
        }
    }
}

fn parse_env<T: FromStr>(key: &'static str, raw: String) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value: raw })
}

/// Every deal associated with one entity, across all pages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedDeals {
    pub deals: Vec<Deal>,
    pub pages: usize,
}

/// Pagination stopped early; `deals` holds everything accumulated before the failure.
#[derive(Debug, Error)]
#[error("deal fetch interrupted after {pages} page(s): {error}")]
pub struct PartialFetch {
    pub deals: Vec<Deal>,
    pub pages: usize,
    #[source]
    pub error: FetchError,
}

/// Follow the search cursor until the store stops returning one.
pub async fn fetch_associated_deals<S>(
    store: &S,
    entity_id: &EntityId,
    page_size: usize,
) -> Result<FetchedDeals, PartialFetch>
where
    S: CrmStore + ?Sized,
{
    let mut deals = Vec::new();
    let mut pages = 0;
    let mut after: Option<PaginationCursor> = None;

    loop {
        match store.search_deals(entity_id, after.as_ref(), page_size).await {
            Ok(page) => {
                pages += 1;
                deals.extend(page.deals);
                match page.next_cursor {
                    Some(cursor) => after = Some(cursor),
                    None => return Ok(FetchedDeals { deals, pages }),
                }
            }
            Err(error) => return Err(PartialFetch { deals, pages, error }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityWrite {
    Skipped,
    Applied,
    Failed,
}

/// Write the first-win date onto the entity; failures are logged, never returned.
pub async fn write_first_won_date<S>(
    store: &S,
    entity_id: &EntityId,
    property: &str,
    earliest: Option<&ClosedWonRecord>,
) -> EntityWrite
where
    S: CrmStore + ?Sized,
{
    let Some(earliest) = earliest else {
        info!(%entity_id, "no closed won deals found; entity property not updated");
        return EntityWrite::Skipped;
    };

    let value = format_canonical(earliest.closed_at);
    match store.patch_entity_property(entity_id, property, &value).await {
        Ok(()) => {
            info!(%entity_id, property, %value, "entity updated with first closed won date");
            EntityWrite::Applied
        }
        Err(err) => {
            warn!(%entity_id, property, error = %err, "error updating entity");
            EntityWrite::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    pub chunks_attempted: usize,
    pub chunks_failed: usize,
    pub deals_updated: usize,
}

/// One batch mutation per chunk; a failed chunk does not stop the ones after it.
pub async fn apply_business_type<S>(
    store: &S,
    entity_id: &EntityId,
    records: &[ClosedWonRecord],
    property: &str,
    business_type: BusinessType,
    chunk_size: usize,
) -> BulkOutcome
where
    S: CrmStore + ?Sized,
{
    let mut outcome = BulkOutcome::default();
    let total_chunks = chunk_count(records.len(), chunk_size);

    for (index, chunk) in partition_chunks(records, chunk_size).enumerate() {
        let updates: Vec<DealPropertyUpdate> = chunk
            .iter()
            .map(|record| DealPropertyUpdate {
                deal_id: record.deal_id.clone(),
                property: property.to_string(),
                value: business_type.label().to_string(),
            })
            .collect();

        debug!(
            %entity_id,
            chunk = index + 1,
            total_chunks,
            inputs = updates.len(),
            "bulk update payload"
        );
        outcome.chunks_attempted += 1;

        match store.batch_update_deals(&updates).await {
            Ok(()) => {
                outcome.deals_updated += updates.len();
                info!(%entity_id, deals = updates.len(), %business_type, "updated deal type");
            }
            Err(err) => {
                outcome.chunks_failed += 1;
                warn!(%entity_id, chunk = index + 1, error = %err, "error updating deals");
            }
        }
    }

    outcome
}

/// Per-entity state progression; every stage runs even when the previous one failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStage {
    Fetching,
    Resolving,
    UpdatingEntity,
    Classifying,
    BulkUpdating,
    Done,
}

impl EntityStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetching => "fetching",
            Self::Resolving => "resolving",
            Self::UpdatingEntity => "updating_entity",
            Self::Classifying => "classifying",
            Self::BulkUpdating => "bulk_updating",
            Self::Done => "done",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityReport {
    pub entity_id: EntityId,
    pub deals_fetched: usize,
    pub pages_fetched: usize,
    pub fetch_failed: bool,
    pub closed_won: usize,
    pub skipped_dates: usize,
    pub first_closed_won_at: Option<DateTime<Utc>>,
    pub entity_write: EntityWrite,
    pub business_type: Option<BusinessType>,
    pub chunks_attempted: usize,
    pub chunks_failed: usize,
    pub deals_updated: usize,
}

impl EntityReport {
    fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            deals_fetched: 0,
            pages_fetched: 0,
            fetch_failed: false,
            closed_won: 0,
            skipped_dates: 0,
            first_closed_won_at: None,
            entity_write: EntityWrite::Skipped,
            business_type: None,
            chunks_attempted: 0,
            chunks_failed: 0,
            deals_updated: 0,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.fetch_failed || self.entity_write == EntityWrite::Failed || self.chunks_failed > 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities: usize,
    pub reports: Vec<EntityReport>,
}

impl ReconcileRunSummary {
    pub fn entities_with_failures(&self) -> usize {
        self.reports.iter().filter(|r| r.has_failures()).count()
    }

    pub fn deals_updated(&self) -> usize {
        self.reports.iter().map(|r| r.deals_updated).sum()
    }

    pub fn entities_updated(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.entity_write == EntityWrite::Applied)
            .count()
    }
}

pub struct Reconciler<S> {
    store: S,
    config: PipelineConfig,
}

impl<S: CrmStore> Reconciler<S> {
    pub fn new(store: S, config: PipelineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process entities strictly one after another; no entity's failure ends the run.
    pub async fn run(&self, entity_ids: &[EntityId]) -> ReconcileRunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let delay = Duration::from_millis(self.config.entity_delay_ms);
        let span = info_span!("reconcile_run", %run_id, store = self.store.store_id());

        let reports = async {
            let mut reports = Vec::with_capacity(entity_ids.len());
            for entity_id in entity_ids {
                info!(%entity_id, "processing entity");
                let report = self
                    .reconcile_entity(entity_id, Utc::now())
                    .instrument(info_span!("entity", %entity_id))
                    .await;
                reports.push(report);

                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            reports
        }
        .instrument(span.clone())
        .await;

        let summary = ReconcileRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            entities: entity_ids.len(),
            reports,
        };
        span.in_scope(|| {
            info!(
                entities = summary.entities,
                entities_updated = summary.entities_updated(),
                deals_updated = summary.deals_updated(),
                entities_with_failures = summary.entities_with_failures(),
                "all entities processed"
            );
        });
        summary
    }

    /// Run every stage for one entity, classifying against `now`.
    pub async fn reconcile_entity(&self, entity_id: &EntityId, now: DateTime<Utc>) -> EntityReport {
        let mut report = EntityReport::new(entity_id.clone());

        enter(EntityStage::Fetching);
        let deals = match fetch_associated_deals(&self.store, entity_id, self.config.page_size).await {
            Ok(fetched) => {
                report.pages_fetched = fetched.pages;
                fetched.deals
            }
            Err(partial) => {
                warn!(
                    %entity_id,
                    pages = partial.pages,
                    kept = partial.deals.len(),
                    error = %partial.error,
                    "error fetching deals; continuing with partial results"
                );
                report.fetch_failed = true;
                report.pages_fetched = partial.pages;
                partial.deals
            }
        };
        report.deals_fetched = deals.len();

        enter(EntityStage::Resolving);
        let resolution = resolve_closed_won(&deals, &self.config.closed_won_stages);
        for skipped in &resolution.skipped {
            warn!(%entity_id, deal_id = %skipped.deal_id, error = %skipped.error, "skipping deal due to date parsing error");
        }
        report.closed_won = resolution.records.len();
        report.skipped_dates = resolution.skipped.len();
        report.first_closed_won_at = resolution.earliest().map(|r| r.closed_at);
        info!(
            %entity_id,
            closed_won = report.closed_won,
            first_closed_won_at = ?report.first_closed_won_at.map(format_canonical),
            "resolved closed won deals"
        );

        enter(EntityStage::UpdatingEntity);
        report.entity_write = write_first_won_date(
            &self.store,
            entity_id,
            &self.config.entity_date_property,
            resolution.earliest(),
        )
        .await;

        enter(EntityStage::Classifying);
        let Some(first_won_at) = report.first_closed_won_at else {
            info!(%entity_id, "no closed won deals found; no deals updated");
            enter(EntityStage::Done);
            return report;
        };
        let business_type = classify(first_won_at, now, i64::from(self.config.threshold_days));
        report.business_type = Some(business_type);

        enter(EntityStage::BulkUpdating);
        let bulk = apply_business_type(
            &self.store,
            entity_id,
            &resolution.records,
            &self.config.deal_type_property,
            business_type,
            self.config.chunk_size,
        )
        .await;
        report.chunks_attempted = bulk.chunks_attempted;
        report.chunks_failed = bulk.chunks_failed;
        report.deals_updated = bulk.deals_updated;

        enter(EntityStage::Done);
        report
    }
}

fn enter(stage: EntityStage) {
    debug!(stage = stage.as_str(), "entering stage");
}

pub fn build_hubspot_store(config: &ReconcileConfig) -> Result<HubSpotStore> {
    config.access_token()?;
    let http = CrmHttpClient::new(config.http_client_config()).context("building crm http client")?;
    Ok(HubSpotStore::new(http, config.hubspot_endpoints()))
}

pub async fn run_reconcile(config: &ReconcileConfig, entity_ids: &[EntityId]) -> Result<ReconcileRunSummary> {
    config.validate()?;
    let store = build_hubspot_store(config)?;
    let reconciler = Reconciler::new(store, config.pipeline.clone());
    Ok(reconciler.run(entity_ids).await)
}

/// Pretty JSON copy of the run summary for operators.
pub async fn write_run_report(path: &Path, summary: &ReconcileRunSummary) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating report directory {}", parent.display()))?;
    }
    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(path, json)
        .await
        .with_context(|| format!("writing run report {}", path.display()))
}
